//! [`AutomationDriver`] implementation backed by the uitest kit.
//!
//! [`HdcDriver`] reaches the kit either through an HDC port forward to a
//! device ([`KitTarget::Device`]) or at an address that is already reachable
//! ([`KitTarget::Direct`]). Every UI operation is a JSON call on the kit's
//! control channel against a `Driver` object created on connect.
//!
//! A call that fails with a connection error is retried after the kit sockets
//! are re-established and the `Driver` object is created again.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use hdckit_core::client::HdcClient;
//! use hdckit_core::driver::{AutomationDriver, DriverConfig};
//! use hdckit_core::hdc_driver::HdcDriver;
//! use hdckit_core::pool::ConnectionConfig;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Arc::new(HdcClient::connect(ConnectionConfig::default()).await?);
//! let device = Arc::new(client.device("FMR0223C13000649"));
//!
//! let mut driver = HdcDriver::for_device(device, DriverConfig::default());
//! driver.connect().await?;
//! driver.tap(540, 1200).await?;
//! driver.go_home().await?;
//! driver.close().await;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, debug_span, info, instrument, warn, Instrument};

use crate::agent_lifecycle::AgentLifecycle;
use crate::device::{Device, ShellRunner};
use crate::driver::{
    AutomationDriver, DisplaySize, DriverConfig, DriverError, Rotation, ScreenCaptureOptions,
};
use crate::gesture::{self, FingerStats, Gesture, Point, PointerMatrix};
use crate::keycode::KeyCode;
use crate::kit::{Channel, FrameHandler, KitConfig, KitError, KitTransport};
use crate::rpc::{capture, RpcRequest, RpcResponse};

/// Speed used for gestures the driver builds itself, in pixels per second.
pub const DEFAULT_GESTURE_SPEED: u32 = 2000;

/// Most keys `Driver.triggerCombineKeys` accepts.
const MAX_COMBO_KEYS: usize = 3;

// ---------------------------------------------------------------------------
// KitTarget
// ---------------------------------------------------------------------------

/// How the driver reaches the kit.
#[derive(Clone)]
pub enum KitTarget {
    /// Forward the kit port of a device through the HDC daemon.
    Device(Arc<Device>),
    /// Kit already reachable at this address.
    Direct { host: String, port: u16 },
}

impl std::fmt::Debug for KitTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KitTarget::Device(device) => f.debug_tuple("Device").field(&device.serial()).finish(),
            KitTarget::Direct { host, port } => f
                .debug_struct("Direct")
                .field("host", host)
                .field("port", port)
                .finish(),
        }
    }
}

// ---------------------------------------------------------------------------
// HdcDriver
// ---------------------------------------------------------------------------

/// An [`AutomationDriver`] that talks to the uitest kit.
pub struct HdcDriver {
    target: KitTarget,
    config: DriverConfig,
    kit: Option<Arc<KitTransport>>,
    driver_handle: Mutex<Option<String>>,
    captures: Mutex<HashMap<Channel, u32>>,
    recoveries: AtomicU64,
}

impl HdcDriver {
    /// Driver for a device reachable through the HDC daemon.
    ///
    /// No connection is established until [`connect`](AutomationDriver::connect) is called.
    pub fn for_device(device: Arc<Device>, config: DriverConfig) -> Self {
        Self::new(KitTarget::Device(device), config)
    }

    /// Driver for a kit listening at `host:port`.
    pub fn direct(host: impl Into<String>, port: u16, config: DriverConfig) -> Self {
        Self::new(
            KitTarget::Direct {
                host: host.into(),
                port,
            },
            config,
        )
    }

    pub fn new(target: KitTarget, config: DriverConfig) -> Self {
        Self {
            target,
            config,
            kit: None,
            driver_handle: Mutex::new(None),
            captures: Mutex::new(HashMap::new()),
            recoveries: AtomicU64::new(0),
        }
    }

    pub fn target(&self) -> &KitTarget {
        &self.target
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Close the kit sockets and remove the port forward.
    pub async fn close(&mut self) {
        if let Some(kit) = self.kit.take() {
            kit.close().await;
        }
        *self.driver_handle.lock().await = None;
        self.captures.lock().await.clear();
        if let KitTarget::Device(device) = &self.target {
            device.remove_all_forwards().await;
        }
    }

    fn kit(&self) -> Result<&Arc<KitTransport>, DriverError> {
        self.kit.as_ref().ok_or(DriverError::NotConnected)
    }

    fn kit_config(&self, host: String, port: u16) -> KitConfig {
        KitConfig {
            host,
            port,
            connect_timeout: self.config.connect_timeout,
            request_timeout: self.config.request_timeout,
            pending_ttl: self.config.pending_ttl,
            ..Default::default()
        }
    }

    /// Resolve the kit address, forwarding the device port when needed.
    async fn resolve_kit(&self) -> Result<KitConfig, DriverError> {
        match &self.target {
            KitTarget::Direct { host, port } => Ok(self.kit_config(host.clone(), *port)),
            KitTarget::Device(device) => {
                let local = device.forward(self.config.kit_device_port).await?;
                debug!(serial = device.serial(), local, "kit port forwarded");
                Ok(self.kit_config("127.0.0.1".to_string(), local))
            }
        }
    }

    /// Start the agent if configured, open the kit and create the `Driver` object.
    async fn open_kit(&mut self, kit_config: KitConfig) -> Result<(), DriverError> {
        if let (Some(lifecycle), KitTarget::Device(device)) = (&self.config.lifecycle, &self.target) {
            let shell: Arc<dyn ShellRunner> = device.clone();
            AgentLifecycle::new(shell, lifecycle.clone())
                .ensure_running(&kit_config)
                .await?;
        }

        let kit = KitTransport::connect(kit_config).await?;
        self.kit = Some(Arc::new(kit));
        *self.driver_handle.lock().await = None;
        self.driver_handle().await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Calls
    // -----------------------------------------------------------------------

    /// Send one request and decode the response.
    async fn invoke(&self, channel: Channel, request: RpcRequest) -> Result<Value, DriverError> {
        let api = request.params.api.clone();
        let span = debug_span!("kit_call", api = %api);
        async {
            let kit = self.kit()?;
            let bytes = kit.request(channel, &request.to_bytes()).await?;
            decode_reply(&api, &bytes)
        }
        .instrument(span)
        .await
    }

    /// The `Driver` object handle, creating it on first use.
    async fn driver_handle(&self) -> Result<String, DriverError> {
        let mut handle = self.driver_handle.lock().await;
        if let Some(existing) = handle.as_ref() {
            return Ok(existing.clone());
        }
        let value = self
            .invoke(Channel::Control, RpcRequest::driver_create())
            .await?;
        let created = expect_handle("Driver.create", value)?;
        debug!(handle = %created, "driver object created");
        *handle = Some(created.clone());
        Ok(created)
    }

    /// Call a `Driver.*` API once.
    async fn call_driver_once(&self, api: &str, args: &[Value]) -> Result<Value, DriverError> {
        let handle = self.driver_handle().await?;
        self.invoke(Channel::Control, RpcRequest::call(api, Some(&handle), args.to_vec()))
            .await
    }

    /// Call a `Driver.*` API with reconnect-and-retry.
    async fn call_driver(&self, api: &str, args: Vec<Value>) -> Result<Value, DriverError> {
        self.with_recovery(api, || self.call_driver_once(api, &args))
            .await
    }

    /// Run `op`; on a connection error reconnect and run it again, up to
    /// `retry.max_retries` times.
    async fn with_recovery<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, DriverError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DriverError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(e) if e.is_connection_error() && attempt < self.config.retry.max_retries => {
                    attempt += 1;
                    warn!(what, attempt, error = %e, "kit call failed, reconnecting");
                    self.attempt_recovery().await?;
                }
                result => return result,
            }
        }
    }

    /// Re-establish the kit sockets and recreate the `Driver` object.
    ///
    /// For a device target the port forward is restored first, since the
    /// daemon may have dropped it along with the sockets.
    async fn attempt_recovery(&self) -> Result<(), DriverError> {
        let kit = self.kit()?;
        tokio::time::sleep(self.config.retry.backoff).await;

        if let KitTarget::Device(device) = &self.target {
            device
                .restore_forward(kit.config().port, self.config.kit_device_port)
                .await?;
        }
        kit.reconnect().await?;
        *self.driver_handle.lock().await = None;
        self.captures.lock().await.clear();
        self.driver_handle().await?;

        self.recoveries.fetch_add(1, Ordering::Relaxed);
        info!("kit recovery successful");
        Ok(())
    }

    async fn inject_matrix_once(
        &self,
        matrix: &PointerMatrix,
        stats: FingerStats,
        speed: u32,
    ) -> Result<(), DriverError> {
        let driver = self.driver_handle().await?;
        let created = self
            .invoke(
                Channel::Control,
                RpcRequest::pointer_matrix_create(&driver, stats.fingers, stats.max_steps),
            )
            .await?;
        let handle = expect_handle("PointerMatrix.create", created)?;

        for sample in matrix.samples() {
            self.invoke(
                Channel::Control,
                RpcRequest::pointer_matrix_set_point(
                    &handle,
                    sample.finger,
                    sample.step,
                    sample.packed_x(),
                    i64::from(sample.point.y),
                ),
            )
            .await?;
        }

        self.invoke(
            Channel::Control,
            RpcRequest::inject_multi_pointer_action(&driver, &handle, speed),
        )
        .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Captures
    // -----------------------------------------------------------------------

    async fn start_capture(
        &self,
        channel: Channel,
        api: &str,
        args: Vec<Value>,
        handler: Arc<dyn FrameHandler>,
    ) -> Result<(), DriverError> {
        let kit = self.kit()?;
        let mut captures = self.captures.lock().await;
        if captures.contains_key(&channel) {
            return Err(DriverError::InvalidArgument(format!(
                "{channel} capture already running"
            )));
        }

        let request = RpcRequest::captures(api, args);
        let payload = request.to_bytes();
        let session_id = kit.next_session_id(&payload);
        let deadline = Instant::now() + self.config.request_timeout;

        let (relay, ack) = CaptureRelay::new(handler);
        kit.register_callback(channel, session_id, Some(relay))
            .await?;

        let started = start_and_await_ack(kit, channel, session_id, &payload, ack, deadline)
            .await
            .and_then(|reply| decode_reply(api, &reply));
        if let Err(e) = started {
            let _ = kit.register_callback(channel, session_id, None).await;
            return Err(e);
        }

        debug!(%channel, session_id, "capture started");
        captures.insert(channel, session_id);
        Ok(())
    }

    async fn stop_capture(&self, channel: Channel, api: &str) -> Result<(), DriverError> {
        let kit = self.kit()?;
        let Some(session_id) = self.captures.lock().await.remove(&channel) else {
            return Ok(());
        };
        let result = self
            .invoke(channel, RpcRequest::captures(api, vec![]))
            .await;
        let _ = kit.register_callback(channel, session_id, None).await;
        debug!(%channel, session_id, "capture stopped");
        result.map(|_| ())
    }
}

/// Decode a kit reply, turning an `exception` into [`DriverError::Api`].
fn decode_reply(api: &str, bytes: &[u8]) -> Result<Value, DriverError> {
    let response = RpcResponse::from_slice(bytes).map_err(|e| DriverError::InvalidResponse {
        api: api.to_string(),
        reason: e.to_string(),
    })?;
    response.into_result().map_err(|exception| DriverError::Api {
        api: api.to_string(),
        code: exception.code,
        message: exception.message,
    })
}

/// Send the start frame and wait for the reply claimed by the relay.
async fn start_and_await_ack(
    kit: &KitTransport,
    channel: Channel,
    session_id: u32,
    payload: &[u8],
    ack: oneshot::Receiver<Option<Vec<u8>>>,
    deadline: Instant,
) -> Result<Vec<u8>, DriverError> {
    kit.send(channel, session_id, payload).await?;
    match tokio::time::timeout_at(deadline, ack).await {
        Ok(Ok(Some(reply))) => Ok(reply),
        Ok(_) => Err(DriverError::Kit(KitError::ChannelClosed)),
        Err(_) => Err(DriverError::Kit(KitError::Timeout { session_id })),
    }
}

/// Sits between the kit and a capture handler. The first frame of the
/// session is the reply to the start call and goes to `ack`; later frames go
/// to the handler.
struct CaptureRelay {
    ack: StdMutex<Option<oneshot::Sender<Option<Vec<u8>>>>>,
    handler: Arc<dyn FrameHandler>,
}

impl CaptureRelay {
    fn new(
        handler: Arc<dyn FrameHandler>,
    ) -> (Arc<dyn FrameHandler>, oneshot::Receiver<Option<Vec<u8>>>) {
        let (tx, rx) = oneshot::channel();
        let relay: Arc<dyn FrameHandler> = Arc::new(Self {
            ack: StdMutex::new(Some(tx)),
            handler,
        });
        (relay, rx)
    }

    fn take_ack(&self) -> Option<oneshot::Sender<Option<Vec<u8>>>> {
        self.ack
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

impl FrameHandler for CaptureRelay {
    fn on_data(&self, payload: Vec<u8>) {
        match self.take_ack() {
            Some(ack) => {
                let _ = ack.send(Some(payload));
            }
            None => self.handler.on_data(payload),
        }
    }

    fn on_error(&self, error: &KitError) {
        // Before the ack the capture has not started; the start call reports it.
        match self.take_ack() {
            Some(ack) => {
                let _ = ack.send(None);
            }
            None => self.handler.on_error(error),
        }
    }
}

/// Extract an object handle such as `Driver#0` from a result value.
fn expect_handle(api: &str, value: Value) -> Result<String, DriverError> {
    match value {
        Value::String(handle) if !handle.is_empty() => Ok(handle),
        other => Err(DriverError::InvalidResponse {
            api: api.to_string(),
            reason: format!("expected object handle, got {other}"),
        }),
    }
}

fn expect_i64(api: &str, value: &Value, field: &str) -> Result<i64, DriverError> {
    let v = if field.is_empty() { Some(value) } else { value.get(field) };
    v.and_then(Value::as_i64)
        .ok_or_else(|| DriverError::InvalidResponse {
            api: api.to_string(),
            reason: format!("missing integer {field:?} in {value}"),
        })
}

fn expect_i32(api: &str, value: &Value, field: &str) -> Result<i32, DriverError> {
    let wide = expect_i64(api, value, field)?;
    i32::try_from(wide).map_err(|_| DriverError::InvalidResponse {
        api: api.to_string(),
        reason: format!("{field:?} out of range: {wide}"),
    })
}

#[async_trait]
impl AutomationDriver for HdcDriver {
    #[instrument(skip(self), level = "debug")]
    async fn connect(&mut self) -> Result<(), DriverError> {
        if self.kit.is_some() {
            debug!("already connected, closing previous kit connection");
            self.close().await;
        }

        let kit_config = self.resolve_kit().await?;
        if let Err(e) = self.open_kit(kit_config).await {
            // Drops the half-open kit and the forward made by resolve_kit.
            self.close().await;
            return Err(e);
        }
        info!(kit_target = ?self.target, "driver connected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.kit.is_some()
    }

    async fn tap(&self, x: i32, y: i32) -> Result<(), DriverError> {
        self.call_driver("Driver.click", vec![json!(x), json!(y)])
            .await
            .map(|_| ())
    }

    async fn double_tap(&self, x: i32, y: i32) -> Result<(), DriverError> {
        self.call_driver("Driver.doubleClick", vec![json!(x), json!(y)])
            .await
            .map(|_| ())
    }

    async fn long_press(&self, x: i32, y: i32, duration: Duration) -> Result<(), DriverError> {
        let hold = u32::try_from(duration.as_millis()).map_err(|_| {
            DriverError::InvalidArgument(format!("press duration {duration:?} too long"))
        })?;
        let gesture = Gesture::start((x, y), 0).pause(hold);
        self.inject_gesture(&[gesture], DEFAULT_GESTURE_SPEED).await
    }

    async fn swipe(&self, from: Point, to: Point, speed: u32) -> Result<(), DriverError> {
        self.call_driver(
            "Driver.swipe",
            vec![json!(from.x), json!(from.y), json!(to.x), json!(to.y), json!(speed)],
        )
        .await
        .map(|_| ())
    }

    async fn drag(&self, from: Point, to: Point, speed: u32) -> Result<(), DriverError> {
        self.call_driver(
            "Driver.drag",
            vec![json!(from.x), json!(from.y), json!(to.x), json!(to.y), json!(speed)],
        )
        .await
        .map(|_| ())
    }

    async fn inject_gesture(&self, gestures: &[Gesture], speed: u32) -> Result<(), DriverError> {
        let matrix = gesture::compile(gestures)?;
        let stats = matrix.finger_index_stats();
        debug!(fingers = stats.fingers, max_steps = stats.max_steps, "injecting gesture");
        self.with_recovery("Driver.injectMultiPointerAction", || {
            self.inject_matrix_once(&matrix, stats, speed)
        })
        .await
    }

    async fn press_key(&self, key: KeyCode) -> Result<(), DriverError> {
        self.call_driver("Driver.triggerKey", vec![json!(key.0)])
            .await
            .map(|_| ())
    }

    async fn press_combo(&self, keys: &[KeyCode]) -> Result<(), DriverError> {
        if keys.is_empty() || keys.len() > MAX_COMBO_KEYS {
            return Err(DriverError::InvalidArgument(format!(
                "key combination needs 1 to {MAX_COMBO_KEYS} keys, got {}",
                keys.len()
            )));
        }
        let args = keys.iter().map(|k| json!(k.0)).collect();
        self.call_driver("Driver.triggerCombineKeys", args)
            .await
            .map(|_| ())
    }

    async fn input_text(&self, x: i32, y: i32, text: &str) -> Result<(), DriverError> {
        self.call_driver("Driver.inputText", vec![json!({ "x": x, "y": y }), json!(text)])
            .await
            .map(|_| ())
    }

    async fn display_size(&self) -> Result<DisplaySize, DriverError> {
        const API: &str = "Driver.getDisplaySize";
        let value = self.call_driver(API, vec![]).await?;
        Ok(DisplaySize {
            width: expect_i32(API, &value, "x")?,
            height: expect_i32(API, &value, "y")?,
        })
    }

    async fn display_rotation(&self) -> Result<Rotation, DriverError> {
        const API: &str = "Driver.getDisplayRotation";
        let value = self.call_driver(API, vec![]).await?;
        let index = expect_i64(API, &value, "")?;
        Rotation::from_index(index).ok_or_else(|| DriverError::InvalidResponse {
            api: API.to_string(),
            reason: format!("unknown rotation {index}"),
        })
    }

    async fn set_display_rotation(&self, rotation: Rotation) -> Result<(), DriverError> {
        self.call_driver("Driver.setDisplayRotation", vec![json!(rotation.as_index())])
            .await
            .map(|_| ())
    }

    async fn start_screen_capture(
        &self,
        handler: Arc<dyn FrameHandler>,
        options: ScreenCaptureOptions,
    ) -> Result<(), DriverError> {
        self.start_capture(
            Channel::ScreenCapture,
            capture::START_SCREEN,
            vec![json!(options)],
            handler,
        )
        .await
    }

    async fn stop_screen_capture(&self) -> Result<(), DriverError> {
        self.stop_capture(Channel::ScreenCapture, capture::STOP_SCREEN)
            .await
    }

    async fn start_ui_action_capture(&self, handler: Arc<dyn FrameHandler>) -> Result<(), DriverError> {
        self.start_capture(
            Channel::UiActionCapture,
            capture::START_UI_ACTION,
            vec![],
            handler,
        )
        .await
    }

    async fn stop_ui_action_capture(&self) -> Result<(), DriverError> {
        self.stop_capture(Channel::UiActionCapture, capture::STOP_UI_ACTION)
            .await
    }

    fn recovery_count(&self) -> u64 {
        self.recoveries.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
