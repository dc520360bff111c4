//! Automation driver trait for device UI automation.
//!
//! [`AutomationDriver`] is the surface consumers program against: taps,
//! swipes, multi-finger gestures, key presses, text input, display queries and
//! capture streams. [`HdcDriver`](crate::hdc_driver::HdcDriver) implements it
//! over the uitest kit.
//!
//! Hardware-key shortcuts such as [`go_home`](AutomationDriver::go_home) are
//! provided methods built on [`press_key`](AutomationDriver::press_key).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agent_lifecycle::{AgentLifecycleConfig, AgentLifecycleError};
use crate::client::HdcError;
use crate::gesture::{Gesture, GestureError, Point};
use crate::keycode::KeyCode;
use crate::kit::{FrameHandler, KitError, KIT_DEVICE_PORT};

/// Errors that can occur during automation driver operations.
#[derive(Error, Debug)]
pub enum DriverError {
    /// No kit connection has been established.
    #[error("not connected to the uitest kit")]
    NotConnected,

    #[error(transparent)]
    Hdc(#[from] HdcError),

    #[error(transparent)]
    Kit(#[from] KitError),

    #[error("invalid gesture: {0}")]
    Gesture(#[from] GestureError),

    /// The kit answered with an `exception`.
    #[error("{api} failed (code {code:?}): {message}")]
    Api {
        api: String,
        code: Option<i64>,
        message: String,
    },

    /// The kit answered with something that is not the expected JSON.
    #[error("invalid response to {api}: {reason}")]
    InvalidResponse { api: String, reason: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("agent lifecycle: {0}")]
    Lifecycle(#[from] AgentLifecycleError),
}

impl DriverError {
    /// Whether re-establishing the kit sockets may fix this error.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            DriverError::NotConnected
                | DriverError::Kit(
                    KitError::ConnectionFailed(_)
                        | KitError::Io(_)
                        | KitError::FrameIntegrity(_)
                        | KitError::ChannelClosed
                )
        )
    }
}

/// Reconnect policy for kit calls.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after a connection error; each one reconnects first.
    pub max_retries: u32,
    /// Pause before each reconnect.
    pub backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 1,
            backoff: Duration::from_millis(200),
        }
    }
}

/// Settings for [`HdcDriver`](crate::hdc_driver::HdcDriver).
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Kit port on the device side of the forward.
    pub kit_device_port: u16,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub pending_ttl: Duration,
    pub retry: RetryConfig,
    /// Start (and install) the on-device agent before connecting.
    pub lifecycle: Option<AgentLifecycleConfig>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            kit_device_port: KIT_DEVICE_PORT,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            pending_ttl: Duration::from_secs(30),
            retry: RetryConfig::default(),
            lifecycle: None,
        }
    }
}

/// Screen size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplaySize {
    pub width: i32,
    pub height: i32,
}

/// Display orientation in quarter turns clockwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rotation {
    Rotation0,
    Rotation90,
    Rotation180,
    Rotation270,
}

impl Rotation {
    pub fn as_index(self) -> i64 {
        match self {
            Rotation::Rotation0 => 0,
            Rotation::Rotation90 => 1,
            Rotation::Rotation180 => 2,
            Rotation::Rotation270 => 3,
        }
    }

    pub fn from_index(index: i64) -> Option<Self> {
        match index {
            0 => Some(Rotation::Rotation0),
            1 => Some(Rotation::Rotation90),
            2 => Some(Rotation::Rotation180),
            3 => Some(Rotation::Rotation270),
            _ => None,
        }
    }

    pub fn degrees(self) -> u32 {
        self.as_index() as u32 * 90
    }
}

/// Options for a screen capture stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScreenCaptureOptions {
    /// JPEG quality, 0-100.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<u8>,
    /// Scale factor in percent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale: Option<u8>,
}

/// Backend-agnostic automation interface.
#[async_trait]
pub trait AutomationDriver: Send + Sync {
    /// Establish the connection to the automation backend.
    async fn connect(&mut self) -> Result<(), DriverError>;

    fn is_connected(&self) -> bool;

    async fn tap(&self, x: i32, y: i32) -> Result<(), DriverError>;

    async fn double_tap(&self, x: i32, y: i32) -> Result<(), DriverError>;

    /// Press at a point and hold for `duration`.
    async fn long_press(&self, x: i32, y: i32, duration: Duration) -> Result<(), DriverError>;

    /// Swipe between two points; `speed` is in pixels per second.
    async fn swipe(&self, from: Point, to: Point, speed: u32) -> Result<(), DriverError>;

    /// Press, hold, then move to `to`.
    async fn drag(&self, from: Point, to: Point, speed: u32) -> Result<(), DriverError>;

    /// Inject one gesture per finger.
    async fn inject_gesture(&self, gestures: &[Gesture], speed: u32) -> Result<(), DriverError>;

    async fn press_key(&self, key: KeyCode) -> Result<(), DriverError>;

    /// Press keys together, in order, then release.
    async fn press_combo(&self, keys: &[KeyCode]) -> Result<(), DriverError>;

    /// Tap at a point to focus a field and type `text`.
    async fn input_text(&self, x: i32, y: i32, text: &str) -> Result<(), DriverError>;

    async fn display_size(&self) -> Result<DisplaySize, DriverError>;

    async fn display_rotation(&self) -> Result<Rotation, DriverError>;

    async fn set_display_rotation(&self, rotation: Rotation) -> Result<(), DriverError>;

    async fn start_screen_capture(
        &self,
        handler: Arc<dyn FrameHandler>,
        options: ScreenCaptureOptions,
    ) -> Result<(), DriverError>;

    async fn stop_screen_capture(&self) -> Result<(), DriverError>;

    async fn start_ui_action_capture(&self, handler: Arc<dyn FrameHandler>) -> Result<(), DriverError>;

    async fn stop_ui_action_capture(&self) -> Result<(), DriverError>;

    /// Number of successful reconnects since creation.
    fn recovery_count(&self) -> u64 {
        0
    }

    async fn volume_up(&self) -> Result<(), DriverError> {
        self.press_key(KeyCode::VOLUME_UP).await
    }

    async fn volume_down(&self) -> Result<(), DriverError> {
        self.press_key(KeyCode::VOLUME_DOWN).await
    }

    async fn volume_mute(&self) -> Result<(), DriverError> {
        self.press_key(KeyCode::VOLUME_MUTE).await
    }

    async fn power(&self) -> Result<(), DriverError> {
        self.press_key(KeyCode::POWER).await
    }

    async fn go_home(&self) -> Result<(), DriverError> {
        self.press_key(KeyCode::HOME).await
    }

    async fn go_back(&self) -> Result<(), DriverError> {
        self.press_key(KeyCode::BACK).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn driver_error_display() {
        let err = DriverError::Api {
            api: "Driver.click".into(),
            code: Some(17000002),
            message: "API does not allow calling concurrently".into(),
        };
        assert_eq!(
            err.to_string(),
            "Driver.click failed (code Some(17000002)): API does not allow calling concurrently"
        );
        assert_eq!(DriverError::NotConnected.to_string(), "not connected to the uitest kit");
    }

    #[test]
    fn connection_errors_are_classified() {
        assert!(DriverError::NotConnected.is_connection_error());
        assert!(DriverError::Kit(KitError::ChannelClosed).is_connection_error());
        assert!(!DriverError::Kit(KitError::Timeout { session_id: 1 }).is_connection_error());
        assert!(!DriverError::Gesture(GestureError::Empty).is_connection_error());
    }

    #[test]
    fn rotation_index_round_trip() {
        for index in 0..4 {
            let rotation = Rotation::from_index(index).unwrap();
            assert_eq!(rotation.as_index(), index);
        }
        assert_eq!(Rotation::from_index(4), None);
        assert_eq!(Rotation::Rotation270.degrees(), 270);
    }

    #[test]
    fn default_config_retries_once() {
        let config = DriverConfig::default();
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.kit_device_port, 8012);
        assert!(config.lifecycle.is_none());
    }

    /// Driver that only records key presses.
    #[derive(Default)]
    struct KeyRecorder {
        keys: Mutex<Vec<KeyCode>>,
    }

    #[async_trait]
    impl AutomationDriver for KeyRecorder {
        async fn connect(&mut self) -> Result<(), DriverError> {
            Ok(())
        }
        fn is_connected(&self) -> bool {
            true
        }
        async fn tap(&self, _: i32, _: i32) -> Result<(), DriverError> {
            Ok(())
        }
        async fn double_tap(&self, _: i32, _: i32) -> Result<(), DriverError> {
            Ok(())
        }
        async fn long_press(&self, _: i32, _: i32, _: Duration) -> Result<(), DriverError> {
            Ok(())
        }
        async fn swipe(&self, _: Point, _: Point, _: u32) -> Result<(), DriverError> {
            Ok(())
        }
        async fn drag(&self, _: Point, _: Point, _: u32) -> Result<(), DriverError> {
            Ok(())
        }
        async fn inject_gesture(&self, _: &[Gesture], _: u32) -> Result<(), DriverError> {
            Ok(())
        }
        async fn press_key(&self, key: KeyCode) -> Result<(), DriverError> {
            self.keys.lock().unwrap().push(key);
            Ok(())
        }
        async fn press_combo(&self, _: &[KeyCode]) -> Result<(), DriverError> {
            Ok(())
        }
        async fn input_text(&self, _: i32, _: i32, _: &str) -> Result<(), DriverError> {
            Ok(())
        }
        async fn display_size(&self) -> Result<DisplaySize, DriverError> {
            Ok(DisplaySize { width: 1080, height: 2340 })
        }
        async fn display_rotation(&self) -> Result<Rotation, DriverError> {
            Ok(Rotation::Rotation0)
        }
        async fn set_display_rotation(&self, _: Rotation) -> Result<(), DriverError> {
            Ok(())
        }
        async fn start_screen_capture(
            &self,
            _: Arc<dyn FrameHandler>,
            _: ScreenCaptureOptions,
        ) -> Result<(), DriverError> {
            Ok(())
        }
        async fn stop_screen_capture(&self) -> Result<(), DriverError> {
            Ok(())
        }
        async fn start_ui_action_capture(&self, _: Arc<dyn FrameHandler>) -> Result<(), DriverError> {
            Ok(())
        }
        async fn stop_ui_action_capture(&self) -> Result<(), DriverError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn hardware_shortcuts_press_expected_keys() {
        let driver = KeyRecorder::default();
        driver.go_home().await.unwrap();
        driver.go_back().await.unwrap();
        driver.volume_up().await.unwrap();
        driver.volume_down().await.unwrap();
        driver.volume_mute().await.unwrap();
        driver.power().await.unwrap();

        assert_eq!(
            *driver.keys.lock().unwrap(),
            vec![
                KeyCode::HOME,
                KeyCode::BACK,
                KeyCode::VOLUME_UP,
                KeyCode::VOLUME_DOWN,
                KeyCode::VOLUME_MUTE,
                KeyCode::POWER,
            ]
        );
        assert_eq!(driver.recovery_count(), 0);
    }
}
