//! # hdckit-core
//!
//! Core library for automating HarmonyOS devices through the HDC daemon and
//! the on-device uitest kit.
//!
//! ## Modules
//!
//! - [`protocol`] - Byte-level framing for HDC commands and kit messages
//! - [`transport`] - One handshaken connection to the HDC daemon
//! - [`pool`] - Bounded pool of pre-dialed daemon connections
//! - [`client`] - Text commands against the daemon (targets, forwards, files)
//! - [`device`] - Per-device shell, file and port-forward operations
//! - [`kit`] - Session-multiplexed sockets to the uitest kit
//! - [`rpc`] - JSON messages exchanged with the kit
//! - [`gesture`] - Compiles finger gestures into a pointer matrix
//! - [`keycode`] - Device key codes
//! - [`driver`] - The [`AutomationDriver`](driver::AutomationDriver) trait
//! - [`hdc_driver`] - [`AutomationDriver`](driver::AutomationDriver) over the kit
//! - [`agent_lifecycle`] - Installs and starts the uitest daemon
//! - [`config`] - Persistent settings in `~/.hdckit/config.json`
//!
//! ## External Dependencies
//!
//! An HDC server must be running on the host (`hdc start`), and the device
//! must be connected and authorized.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use hdckit_core::client::HdcClient;
//! use hdckit_core::pool::ConnectionConfig;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Arc::new(HdcClient::connect(ConnectionConfig::default()).await?);
//! for device in client.list_devices().await? {
//!     let model = &device.info().await?.model;
//!     println!("{} {}", device.serial(), model);
//! }
//! client.close();
//! # Ok(())
//! # }
//! ```

pub mod agent_lifecycle;
pub mod client;
pub mod config;
pub mod device;
pub mod driver;
pub mod gesture;
pub mod hdc_driver;
pub mod keycode;
pub mod kit;
pub mod pool;
pub mod protocol;
pub mod rpc;
pub mod transport;
