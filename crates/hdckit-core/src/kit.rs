//! Session-multiplexed transport to the on-device uitest kit.
//!
//! The kit listens on one device port (forwarded to a local port by the
//! caller). [`KitTransport`] keeps one persistent socket per [`Channel`] and
//! one receive task per socket. Every frame carries a session id; frames are
//! routed either to a registered [`FrameHandler`] or into a pending queue where
//! synchronous [`request`](KitTransport::request) callers pick them up.
//!
//! A channel is dialed on first use. A frame-integrity violation or an I/O
//! error tears the channel down: each registered handler receives the error
//! exactly once and every waiting caller wakes with [`KitError::ChannelClosed`].
//! The next use of the channel dials a fresh socket.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use socket2::{SockRef, TcpKeepalive};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, trace, warn, Instrument};

use crate::protocol::{self, ProtocolError, KIT_PREFIX_LEN, KIT_TAIL};
use crate::transport::{self, Endpoint, TransportError};

/// Port the uitest kit listens on inside the device.
pub const KIT_DEVICE_PORT: u16 = 8012;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Settings for the kit sockets.
#[derive(Debug, Clone)]
pub struct KitConfig {
    /// Host of the forwarded kit port, normally loopback.
    pub host: String,
    /// Local port forwarded to [`KIT_DEVICE_PORT`].
    pub port: u16,
    pub connect_timeout: Duration,
    /// How long a synchronous request waits for its response.
    pub request_timeout: Duration,
    /// Age after which an unclaimed pending frame is dropped.
    pub pending_ttl: Duration,
    /// TCP keep-alive idle time. `None` leaves the OS default.
    pub keepalive: Option<Duration>,
}

impl Default for KitConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            pending_ttl: Duration::from_secs(30),
            keepalive: Some(Duration::from_secs(30)),
        }
    }
}

impl KitConfig {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// One of the kit's independent sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Control,
    ScreenCapture,
    UiActionCapture,
}

impl Channel {
    pub const ALL: [Channel; 3] = [
        Channel::Control,
        Channel::ScreenCapture,
        Channel::UiActionCapture,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Channel::Control => "control",
            Channel::ScreenCapture => "screen-capture",
            Channel::UiActionCapture => "ui-action-capture",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised by the kit transport.
#[derive(Error, Debug)]
pub enum KitError {
    #[error("kit connection failed: {0}")]
    ConnectionFailed(String),

    #[error("kit I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("kit frame integrity violation: {0}")]
    FrameIntegrity(#[from] ProtocolError),

    #[error("kit channel closed")]
    ChannelClosed,

    #[error("no response for session {session_id:#x} within timeout")]
    Timeout { session_id: u32 },
}

impl From<TransportError> for KitError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Io(e) => KitError::Io(e),
            other => KitError::ConnectionFailed(other.to_string()),
        }
    }
}

impl KitError {
    /// Copy of this error suitable for fanning out to several receivers.
    fn duplicate(&self) -> KitError {
        match self {
            KitError::ConnectionFailed(msg) => KitError::ConnectionFailed(msg.clone()),
            KitError::Io(e) => KitError::Io(io::Error::new(e.kind(), e.to_string())),
            KitError::FrameIntegrity(e) => KitError::FrameIntegrity(e.clone()),
            KitError::ChannelClosed => KitError::ChannelClosed,
            KitError::Timeout { session_id } => KitError::Timeout {
                session_id: *session_id,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// FrameHandler
// ---------------------------------------------------------------------------

/// Receiver for asynchronous frames of one session.
///
/// Calls for one registration are made in order from a single task.
/// `on_error` is called at most once and no call follows it.
pub trait FrameHandler: Send + Sync + 'static {
    fn on_data(&self, payload: Vec<u8>);
    fn on_error(&self, error: &KitError);
}

enum Delivery {
    Data(Vec<u8>),
    Failed(Arc<KitError>),
}

// ---------------------------------------------------------------------------
// Frame I/O
// ---------------------------------------------------------------------------

/// Read one kit frame and return `(session_id, payload)`.
pub async fn read_kit_frame<R>(reader: &mut R) -> Result<(u32, Vec<u8>), KitError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; KIT_PREFIX_LEN];
    reader.read_exact(&mut prefix).await?;
    let (session_id, len) = protocol::decode_kit_prefix(&prefix)?;

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;

    let mut tail = [0u8; KIT_TAIL.len()];
    reader.read_exact(&mut tail).await?;
    protocol::verify_kit_tail(&tail)?;

    Ok((session_id, payload))
}

// ---------------------------------------------------------------------------
// Per-channel state
// ---------------------------------------------------------------------------

struct PendingFrame {
    session_id: u32,
    payload: Vec<u8>,
    arrived: Instant,
}

#[derive(Default)]
struct ChannelState {
    pending: VecDeque<PendingFrame>,
    handlers: HashMap<u32, mpsc::UnboundedSender<Delivery>>,
    waiters: HashMap<u32, Arc<Notify>>,
    closed: bool,
}

struct ChannelInner {
    channel: Channel,
    state: Mutex<ChannelState>,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    cancel: CancellationToken,
    pending_ttl: Duration,
}

impl ChannelInner {
    fn state(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Route one received frame.
    fn dispatch(&self, session_id: u32, payload: Vec<u8>) {
        let mut state = self.state();

        if let Some(tx) = state.handlers.get(&session_id) {
            trace!(channel = %self.channel, session_id, len = payload.len(), "frame to handler");
            if tx.send(Delivery::Data(payload)).is_err() {
                state.handlers.remove(&session_id);
            }
            return;
        }

        let now = Instant::now();
        let ttl = self.pending_ttl;
        let before = state.pending.len();
        state
            .pending
            .retain(|f| now.duration_since(f.arrived) < ttl);
        let evicted = before - state.pending.len();
        if evicted > 0 {
            debug!(channel = %self.channel, evicted, "evicted stale pending frames");
        }

        trace!(channel = %self.channel, session_id, len = payload.len(), "frame queued");
        state.pending.push_back(PendingFrame {
            session_id,
            payload,
            arrived: now,
        });
        if let Some(waiter) = state.waiters.get(&session_id) {
            waiter.notify_one();
        }
    }

    /// Attach or detach the handler for `session_id`.
    ///
    /// Queued frames for the session are handed over before the handler can
    /// see any frame that arrives later.
    fn register(&self, session_id: u32, handler: Option<Arc<dyn FrameHandler>>) {
        let mut state = self.state();
        let Some(handler) = handler else {
            state.handlers.remove(&session_id);
            return;
        };

        let (tx, rx) = mpsc::unbounded_channel();
        spawn_handler(handler, rx);

        let mut kept = VecDeque::with_capacity(state.pending.len());
        for frame in state.pending.drain(..) {
            if frame.session_id == session_id {
                let _ = tx.send(Delivery::Data(frame.payload));
            } else {
                kept.push_back(frame);
            }
        }
        state.pending = kept;

        if state.closed {
            let _ = tx.send(Delivery::Failed(Arc::new(KitError::ChannelClosed)));
            return;
        }
        state.handlers.insert(session_id, tx);
    }

    /// Drop queued frames for `session_id`.
    fn drain_session(&self, session_id: u32) {
        let mut state = self.state();
        let before = state.pending.len();
        state.pending.retain(|f| f.session_id != session_id);
        let dropped = before - state.pending.len();
        if dropped > 0 {
            debug!(channel = %self.channel, session_id, dropped, "dropped stale frames");
        }
    }

    async fn write(&self, frame: &[u8]) -> Result<(), KitError> {
        if self.is_closed() {
            return Err(KitError::ChannelClosed);
        }
        let mut writer = self.writer.lock().await;
        // A writer that stalled ahead of us may have torn the channel down.
        if self.is_closed() {
            return Err(KitError::ChannelClosed);
        }
        let result = async {
            writer.write_all(frame).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = result {
            drop(writer);
            let err = KitError::Io(e);
            self.teardown(err.duplicate());
            return Err(err);
        }
        Ok(())
    }

    /// Write `frame`, giving up at `deadline`.
    ///
    /// A write that misses its deadline may have left a partial frame on the
    /// wire, so the channel is torn down.
    async fn write_until(
        &self,
        session_id: u32,
        frame: &[u8],
        deadline: Instant,
    ) -> Result<(), KitError> {
        match tokio::time::timeout_at(deadline, self.write(frame)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(channel = %self.channel, session_id, "kit write stalled");
                self.teardown(KitError::Timeout { session_id });
                Err(KitError::Timeout { session_id })
            }
        }
    }

    /// Wait until a frame for `session_id` is queued, then take it.
    async fn wait_for(&self, session_id: u32, deadline: Instant) -> Result<Vec<u8>, KitError> {
        let notify = Arc::new(Notify::new());
        self.state().waiters.insert(session_id, notify.clone());
        let result = self.wait_on(session_id, &notify, deadline).await;
        self.state().waiters.remove(&session_id);
        result
    }

    async fn wait_on(
        &self,
        session_id: u32,
        notify: &Notify,
        deadline: Instant,
    ) -> Result<Vec<u8>, KitError> {
        loop {
            {
                let mut state = self.state();
                if let Some(pos) = state.pending.iter().position(|f| f.session_id == session_id) {
                    if let Some(frame) = state.pending.remove(pos) {
                        return Ok(frame.payload);
                    }
                }
                if state.closed {
                    return Err(KitError::ChannelClosed);
                }
            }
            if tokio::time::timeout_at(deadline, notify.notified()).await.is_err() {
                return Err(KitError::Timeout { session_id });
            }
        }
    }

    /// Close the channel and tell every handler and waiter.
    ///
    /// Only the first call has any effect.
    fn teardown(&self, error: KitError) {
        let (handlers, waiters) = {
            let mut state = self.state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.pending.clear();
            let handlers: Vec<_> = state.handlers.drain().map(|(_, tx)| tx).collect();
            let waiters: Vec<_> = state.waiters.values().cloned().collect();
            (handlers, waiters)
        };
        self.cancel.cancel();

        debug!(
            channel = %self.channel,
            handlers = handlers.len(),
            waiters = waiters.len(),
            error = %error,
            "kit channel torn down"
        );

        let error = Arc::new(error);
        for tx in handlers {
            let _ = tx.send(Delivery::Failed(error.clone()));
        }
        for waiter in waiters {
            waiter.notify_one();
        }
    }
}

fn spawn_handler(handler: Arc<dyn FrameHandler>, mut rx: mpsc::UnboundedReceiver<Delivery>) {
    tokio::spawn(async move {
        while let Some(delivery) = rx.recv().await {
            match delivery {
                Delivery::Data(payload) => handler.on_data(payload),
                Delivery::Failed(error) => {
                    handler.on_error(&error);
                    break;
                }
            }
        }
    });
}

async fn receive_loop(inner: Arc<ChannelInner>, mut reader: OwnedReadHalf) {
    loop {
        let frame = tokio::select! {
            _ = inner.cancel.cancelled() => {
                inner.teardown(KitError::ChannelClosed);
                return;
            }
            frame = read_kit_frame(&mut reader) => frame,
        };

        match frame {
            Ok((session_id, payload)) => inner.dispatch(session_id, payload),
            Err(e) => {
                warn!(channel = %inner.channel, error = %e, "kit receive loop stopped");
                inner.teardown(e);
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// KitTransport
// ---------------------------------------------------------------------------

/// Multiplexed connection to the uitest kit of one device.
pub struct KitTransport {
    config: KitConfig,
    channels: tokio::sync::Mutex<HashMap<Channel, Arc<ChannelInner>>>,
    salt: AtomicU64,
}

impl KitTransport {
    /// Create a transport. No socket is opened until a channel is used.
    pub fn new(config: KitConfig) -> Self {
        Self {
            config,
            channels: tokio::sync::Mutex::new(HashMap::new()),
            salt: AtomicU64::new(0),
        }
    }

    /// Create a transport and open the control channel.
    pub async fn connect(config: KitConfig) -> Result<Self, KitError> {
        let transport = Self::new(config);
        transport.channel(Channel::Control).await?;
        Ok(transport)
    }

    pub fn config(&self) -> &KitConfig {
        &self.config
    }

    /// Generate a session id for a request body.
    pub fn next_session_id(&self, payload: &[u8]) -> u32 {
        let coarse_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let salt = self.salt.fetch_add(1, Ordering::Relaxed);
        protocol::session_id(payload, coarse_secs, salt)
    }

    /// Whether `channel` currently has a live socket.
    pub async fn is_connected(&self, channel: Channel) -> bool {
        self.channels
            .lock()
            .await
            .get(&channel)
            .is_some_and(|inner| !inner.is_closed())
    }

    /// Attach `handler` to `session_id` on `channel`, or detach with `None`.
    pub async fn register_callback(
        &self,
        channel: Channel,
        session_id: u32,
        handler: Option<Arc<dyn FrameHandler>>,
    ) -> Result<(), KitError> {
        let inner = self.channel(channel).await?;
        inner.register(session_id, handler);
        Ok(())
    }

    /// Send one frame without waiting for a response.
    ///
    /// The write is bounded by the request timeout.
    pub async fn send(
        &self,
        channel: Channel,
        session_id: u32,
        payload: &[u8],
    ) -> Result<(), KitError> {
        let deadline = Instant::now() + self.config.request_timeout;
        let inner = self.channel(channel).await?;
        let frame = protocol::encode_kit_frame(session_id, payload);
        trace!(%channel, session_id, len = payload.len(), "kit send");
        inner.write_until(session_id, &frame, deadline).await
    }

    /// Send `payload` under a fresh session id and wait for the response.
    ///
    /// The send and the wait share one deadline of `request_timeout`.
    pub async fn request(&self, channel: Channel, payload: &[u8]) -> Result<Vec<u8>, KitError> {
        let session_id = self.next_session_id(payload);
        let span = debug_span!("kit_request", %channel, session_id, len = payload.len());
        async {
            let deadline = Instant::now() + self.config.request_timeout;
            let inner = self.channel(channel).await?;
            inner.drain_session(session_id);

            let frame = protocol::encode_kit_frame(session_id, payload);
            inner.write_until(session_id, &frame, deadline).await?;

            let response = inner.wait_for(session_id, deadline).await?;
            trace!(len = response.len(), "kit response");
            Ok(response)
        }
        .instrument(span)
        .await
    }

    /// Close every channel. Registered handlers receive [`KitError::ChannelClosed`].
    pub async fn close(&self) {
        let closing: Vec<_> = {
            let mut channels = self.channels.lock().await;
            channels.drain().map(|(_, inner)| inner).collect()
        };
        for inner in closing {
            inner.teardown(KitError::ChannelClosed);
            // A stalled writer keeps the lock until its deadline; the socket
            // closes when it lets go of the channel.
            if let Ok(mut writer) = inner.writer.try_lock() {
                let _ = writer.shutdown().await;
            }
        }
    }

    /// Close all channels and reopen the control channel.
    pub async fn reconnect(&self) -> Result<(), KitError> {
        debug!("reconnecting kit transport");
        self.close().await;
        self.channel(Channel::Control).await?;
        Ok(())
    }

    /// Return the live channel, dialing it if absent or torn down.
    async fn channel(&self, channel: Channel) -> Result<Arc<ChannelInner>, KitError> {
        let mut channels = self.channels.lock().await;
        if let Some(inner) = channels.get(&channel) {
            if !inner.is_closed() {
                return Ok(inner.clone());
            }
            debug!(%channel, "kit channel was torn down, redialing");
        }

        let inner = self.open_channel(channel).await?;
        channels.insert(channel, inner.clone());
        Ok(inner)
    }

    async fn open_channel(&self, channel: Channel) -> Result<Arc<ChannelInner>, KitError> {
        let endpoint = self.config.endpoint();
        let stream = transport::dial(&endpoint, self.config.connect_timeout).await?;
        if let Some(idle) = self.config.keepalive {
            let keepalive = TcpKeepalive::new().with_time(idle);
            SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;
        }
        debug!(%channel, %endpoint, "kit channel connected");

        let (reader, writer) = stream.into_split();
        let inner = Arc::new(ChannelInner {
            channel,
            state: Mutex::new(ChannelState::default()),
            writer: tokio::sync::Mutex::new(writer),
            cancel: CancellationToken::new(),
            pending_ttl: self.config.pending_ttl,
        });
        tokio::spawn(receive_loop(inner.clone(), reader));
        Ok(inner)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
