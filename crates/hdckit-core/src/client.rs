//! Command transport: one-shot request/response over pooled HDC connections.
//!
//! [`HdcClient`] owns a [`ConnectionPool`] for the daemon's control endpoint.
//! Every command takes one connection, handshakes with the target serial as
//! identity token (empty for host-level commands), sends the command, reads
//! the whole response and closes the connection. The daemon treats control
//! connections as single-use, so nothing is returned to the pool.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use hdckit_core::client::HdcClient;
//! use hdckit_core::pool::ConnectionConfig;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Arc::new(HdcClient::connect(ConnectionConfig::default()).await?);
//! for device in client.list_devices().await? {
//!     println!("{}", device.serial());
//! }
//! client.close();
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::{debug, debug_span, info, Instrument};

use crate::device::Device;
use crate::pool::{ConnectionConfig, ConnectionPool};
use crate::protocol::{EMPTY_MARKER, FAIL_MARKER};
use crate::transport::{self, HdcConnection, TransportError};

/// Size of the data chunks used when streaming a file to the daemon.
const PUSH_CHUNK_SIZE: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors returned by the command transport and device operations.
#[derive(Error, Debug)]
pub enum HdcError {
    /// The frame transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The daemon answered with its failure marker.
    #[error("command `{command}` failed: {response}")]
    CommandFailed { command: String, response: String },

    /// A local file operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HdcError {
    /// Returns `true` if the error came from the socket rather than from the
    /// daemon's answer.
    pub fn is_transport(&self) -> bool {
        matches!(self, HdcError::Transport(_))
    }
}

/// Turn a raw response into an error if it carries the failure marker.
fn check_response(command: &str, response: String) -> Result<String, HdcError> {
    if response.contains(FAIL_MARKER) {
        return Err(HdcError::CommandFailed {
            command: command.to_string(),
            response: response.trim().to_string(),
        });
    }
    Ok(response)
}

// ---------------------------------------------------------------------------
// Target listing
// ---------------------------------------------------------------------------

/// Physical link a target is attached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionKind {
    Usb,
    Tcp,
    Uart,
    Bluetooth,
    Unknown,
}

impl ConnectionKind {
    fn parse(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "USB" => ConnectionKind::Usb,
            "TCP" => ConnectionKind::Tcp,
            "UART" => ConnectionKind::Uart,
            "BT" => ConnectionKind::Bluetooth,
            _ => ConnectionKind::Unknown,
        }
    }

    /// Only USB and TCP targets can carry the automation channels.
    pub fn is_supported(self) -> bool {
        !matches!(self, ConnectionKind::Uart | ConnectionKind::Bluetooth)
    }
}

/// Connection state reported by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TargetState {
    Online,
    Offline,
    Unauthorized,
    Unknown,
}

impl TargetState {
    fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "connected" | "online" | "ready" => TargetState::Online,
            "offline" | "disconnected" => TargetState::Offline,
            "unauthorized" => TargetState::Unauthorized,
            _ => TargetState::Unknown,
        }
    }
}

/// One line of `list targets -v`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Target {
    pub serial: String,
    pub kind: ConnectionKind,
    pub state: TargetState,
    pub host: Option<String>,
}

impl Target {
    /// Whether the target can be driven.
    pub fn is_usable(&self) -> bool {
        self.kind.is_supported()
            && !matches!(self.state, TargetState::Offline | TargetState::Unauthorized)
    }
}

/// Parse the tabular output of `list targets -v`.
///
/// Lines are `serial kind state host ...`, separated by tabs or spaces.
/// Plain `list targets` output (serial only) parses with unknown kind/state.
pub fn parse_targets(text: &str) -> Vec<Target> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && *line != EMPTY_MARKER)
        .map(|line| {
            let mut cols = line.split_whitespace();
            let serial = cols.next().unwrap_or_default().to_string();
            let kind = cols.next().map_or(ConnectionKind::Unknown, ConnectionKind::parse);
            let state = cols.next().map_or(TargetState::Unknown, TargetState::parse);
            let host = cols.next().map(str::to_string);
            Target {
                serial,
                kind,
                state,
                host,
            }
        })
        .collect()
}

/// One active port forward as reported by `fport ls`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForwardEntry {
    pub serial: String,
    pub local: String,
    pub remote: String,
}

/// Parse the output of `fport ls`.
pub fn parse_forwards(text: &str) -> Vec<ForwardEntry> {
    text.lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 3 || cols[0] == EMPTY_MARKER {
                return None;
            }
            Some(ForwardEntry {
                serial: cols[0].to_string(),
                local: cols[1].to_string(),
                remote: cols[2].to_string(),
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// HdcClient
// ---------------------------------------------------------------------------

/// Client for the HDC control endpoint.
pub struct HdcClient {
    config: ConnectionConfig,
    pool: ConnectionPool,
}

impl HdcClient {
    /// Create a client and pre-dial its connection pool.
    pub async fn connect(config: ConnectionConfig) -> Result<Self, HdcError> {
        let pool = ConnectionPool::new(&config).await?;
        Ok(Self { config, pool })
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Run a host-level command.
    pub async fn execute(&self, command: &str) -> Result<String, HdcError> {
        self.execute_on("", command).await
    }

    /// Run a command addressed to the device with the given serial.
    ///
    /// The connection is closed after the response, not released to the pool.
    pub async fn execute_on(&self, serial: &str, command: &str) -> Result<String, HdcError> {
        let span = debug_span!("hdc_execute", serial, command);
        async {
            let mut conn = self.open_session(serial).await?;
            let result = async {
                conn.send_command(command).await?;
                conn.read_all().await
            }
            .await;
            conn.close().await;

            let response = String::from_utf8_lossy(&result?).into_owned();
            debug!(response_bytes = response.len(), "command complete");
            check_response(command, response)
        }
        .instrument(span)
        .await
    }

    /// Take a pooled connection and handshake with `identity`.
    ///
    /// A pooled connection the daemon has already dropped fails the
    /// handshake with an I/O error; it is discarded and replaced by a fresh
    /// dial once.
    async fn open_session(&self, identity: &str) -> Result<HdcConnection, HdcError> {
        let stream = self.pool.acquire().await?;
        let conn = match HdcConnection::handshake(stream, identity, false).await {
            Ok(conn) => conn,
            Err(TransportError::Io(e)) => {
                debug!(error = %e, "stale pooled connection, redialing");
                let fresh = transport::dial(self.pool.endpoint(), self.config.connect_timeout).await?;
                HdcConnection::handshake(fresh, identity, false).await?
            }
            Err(e) => return Err(e.into()),
        };
        Ok(conn.with_read_timeout(self.config.read_timeout))
    }

    /// List every target the daemon knows about, including unusable ones.
    pub async fn list_targets(&self) -> Result<Vec<Target>, HdcError> {
        let response = self.execute("list targets -v").await?;
        Ok(parse_targets(&response))
    }

    /// List the devices that can be driven: offline, unauthorized and
    /// UART/Bluetooth targets are skipped.
    pub async fn list_devices(self: &Arc<Self>) -> Result<Vec<Device>, HdcError> {
        let devices: Vec<Device> = self
            .list_targets()
            .await?
            .into_iter()
            .filter(Target::is_usable)
            .map(|t| Device::new(self.clone(), t.serial))
            .collect();
        debug!(count = devices.len(), "devices listed");
        Ok(devices)
    }

    /// Handle for a device by serial, without checking that it exists.
    pub fn device(self: &Arc<Self>, serial: impl Into<String>) -> Device {
        Device::new(self.clone(), serial.into())
    }

    /// Push a local file to the device.
    ///
    /// The file is streamed as data chunks after the transfer command and
    /// terminated with an end-of-stream chunk; the trailing response must
    /// not carry the failure marker.
    pub async fn push_file(&self, serial: &str, local: &Path, remote: &str) -> Result<(), HdcError> {
        let command = format!("file send {} {}", local.display(), remote);
        let span = debug_span!("hdc_push", serial, remote);
        async {
            let mut file = tokio::fs::File::open(local).await?;
            let mut conn = self.open_session(serial).await?;

            let result = async {
                conn.send_command(&command).await?;
                let mut buf = vec![0u8; PUSH_CHUNK_SIZE];
                let mut sent = 0usize;
                loop {
                    let n = file.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    conn.send_bytes(&buf[..n]).await?;
                    sent += n;
                }
                conn.send_eof().await?;
                debug!(bytes = sent, "file streamed");
                Ok::<_, HdcError>(conn.read_all().await?)
            }
            .await;
            conn.close().await;

            let response = String::from_utf8_lossy(&result?).into_owned();
            check_response(&command, response).map(|_| ())
        }
        .instrument(span)
        .await
    }

    /// Pull a file from the device into `local`.
    pub async fn pull_file(&self, serial: &str, remote: &str, local: &Path) -> Result<(), HdcError> {
        let command = format!("file recv {} {}", remote, local.display());
        let span = debug_span!("hdc_pull", serial, remote);
        async {
            let mut conn = self.open_session(serial).await?;
            let result = async {
                conn.send_command(&command).await?;
                conn.read_all().await
            }
            .await;
            conn.close().await;

            let data = result?;
            if data.starts_with(FAIL_MARKER.as_bytes()) {
                return Err(HdcError::CommandFailed {
                    command: command.clone(),
                    response: String::from_utf8_lossy(&data).trim().to_string(),
                });
            }
            tokio::fs::write(local, &data).await?;
            debug!(bytes = data.len(), "file pulled");
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Forward `tcp:<local>` on the host to `tcp:<remote>` on the device.
    pub async fn forward(&self, serial: &str, local: u16, remote: u16) -> Result<(), HdcError> {
        self.execute_on(serial, &format!("fport tcp:{local} tcp:{remote}"))
            .await?;
        info!(serial, local, remote, "port forwarded");
        Ok(())
    }

    /// Remove a forward created by [`forward`](Self::forward).
    pub async fn remove_forward(&self, serial: &str, local: u16, remote: u16) -> Result<(), HdcError> {
        self.execute_on(serial, &format!("fport rm tcp:{local} tcp:{remote}"))
            .await?;
        Ok(())
    }

    /// List all active forwards.
    pub async fn list_forwards(&self) -> Result<Vec<ForwardEntry>, HdcError> {
        let response = self.execute("fport ls").await?;
        Ok(parse_forwards(&response))
    }

    /// Ask the daemon to terminate.
    pub async fn kill_server(&self) -> Result<(), HdcError> {
        self.execute("kill").await?;
        info!("hdc daemon killed");
        Ok(())
    }

    /// Close the idle pooled connections.
    pub fn close(&self) {
        self.pool.close_all();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_verbose_targets() {
        let text = "FMR0223C13000649\tUSB\tConnected\tlocalhost\thdc\n\
                    192.168.1.20:5555\tTCP\tOffline\t192.168.1.20\thdc\n";
        let targets = parse_targets(text);
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].serial, "FMR0223C13000649");
        assert_eq!(targets[0].kind, ConnectionKind::Usb);
        assert_eq!(targets[0].state, TargetState::Online);
        assert_eq!(targets[0].host.as_deref(), Some("localhost"));
        assert_eq!(targets[1].kind, ConnectionKind::Tcp);
        assert_eq!(targets[1].state, TargetState::Offline);
    }

    #[test]
    fn parse_skips_blank_and_empty_marker() {
        assert!(parse_targets("\n   \n[Empty]\n").is_empty());
    }

    #[test]
    fn parse_plain_serial_list() {
        let targets = parse_targets("SERIAL-A\nSERIAL-B\n");
        assert_eq!(targets.len(), 2);
        assert!(targets.iter().all(Target::is_usable));
        assert_eq!(targets[1].state, TargetState::Unknown);
    }

    #[test]
    fn usability_filters_offline_unauthorized_and_uart() {
        let targets = parse_targets(
            "A USB Offline localhost\n\
             B USB Unauthorized localhost\n\
             C UART Connected localhost\n\
             D BT Connected localhost\n\
             E TCP Online 10.0.0.2\n",
        );
        let usable: Vec<&str> = targets
            .iter()
            .filter(|t| t.is_usable())
            .map(|t| t.serial.as_str())
            .collect();
        assert_eq!(usable, vec!["E"]);
    }

    #[test]
    fn parse_forward_list() {
        let text = "FMR0223C13000649    tcp:7001 tcp:8012    [Forward]\n[Empty]\n";
        let forwards = parse_forwards(text);
        assert_eq!(
            forwards,
            vec![ForwardEntry {
                serial: "FMR0223C13000649".into(),
                local: "tcp:7001".into(),
                remote: "tcp:8012".into(),
            }]
        );
    }

    #[test]
    fn failure_marker_becomes_command_failed() {
        let err = check_response("shell foo", "[Fail]ExecuteCommand need connect-key?".into())
            .unwrap_err();
        match err {
            HdcError::CommandFailed { command, response } => {
                assert_eq!(command, "shell foo");
                assert!(response.contains("connect-key"));
            }
            other => panic!("expected CommandFailed, got: {other:?}"),
        }
    }

    #[test]
    fn clean_response_passes_through() {
        assert_eq!(check_response("shell echo", "hi\n".into()).unwrap(), "hi\n");
    }

    #[test]
    fn transport_classifier() {
        assert!(HdcError::Transport(TransportError::Timeout).is_transport());
        assert!(!HdcError::CommandFailed {
            command: "x".into(),
            response: "[Fail]".into()
        }
        .is_transport());
    }
}
