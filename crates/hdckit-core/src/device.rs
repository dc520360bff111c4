//! Per-device operations on top of the command transport.
//!
//! A [`Device`] is a serial number plus a shared [`HdcClient`]. It runs shell
//! commands, transfers files, manages port forwards and caches the device
//! attributes the first time they are asked for.
//!
//! Two small traits describe what the rest of the crate needs from the outside
//! world: [`ShellRunner`] (run a shell command, push a file) and
//! [`PortAllocator`] (find a free local TCP port). [`Device`] and
//! [`EphemeralPorts`] are the production implementations.

use std::net::{Ipv4Addr, TcpListener};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::client::{HdcClient, HdcError};

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

/// Runs commands on a device and pushes files to it.
#[async_trait]
pub trait ShellRunner: Send + Sync {
    /// Run `command` with `args` in the device shell and return its output.
    async fn run_shell(&self, command: &str, args: &[&str]) -> Result<String, HdcError>;

    /// Copy a local file to `remote` on the device.
    async fn push_file(&self, local: &Path, remote: &str) -> Result<(), HdcError>;
}

/// Source of free local TCP ports.
pub trait PortAllocator: Send + Sync {
    fn allocate_free_port(&self) -> std::io::Result<u16>;
}

/// Asks the OS for an ephemeral port by binding port 0 and releasing it.
#[derive(Debug, Default, Clone, Copy)]
pub struct EphemeralPorts;

impl PortAllocator for EphemeralPorts {
    fn allocate_free_port(&self) -> std::io::Result<u16> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
        Ok(listener.local_addr()?.port())
    }
}

// ---------------------------------------------------------------------------
// DeviceInfo
// ---------------------------------------------------------------------------

/// Static attributes read from system parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub model: String,
    pub brand: String,
    pub os_version: String,
    pub api_version: String,
    pub cpu_abis: Vec<String>,
}

const PARAM_MODEL: &str = "const.product.model";
const PARAM_BRAND: &str = "const.product.brand";
const PARAM_OS_VERSION: &str = "const.product.software.version";
const PARAM_API_VERSION: &str = "const.ohos.apiversion";
const PARAM_CPU_ABILIST: &str = "const.product.cpu.abilist";

/// Quote a shell argument when it contains anything but plain characters.
fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

/// A device reachable through the HDC daemon.
pub struct Device {
    serial: String,
    client: Arc<HdcClient>,
    ports: Arc<dyn PortAllocator>,
    info: OnceCell<DeviceInfo>,
    forwards: Mutex<Vec<(u16, u16)>>,
}

impl Device {
    pub fn new(client: Arc<HdcClient>, serial: String) -> Self {
        Self {
            serial,
            client,
            ports: Arc::new(EphemeralPorts),
            info: OnceCell::new(),
            forwards: Mutex::new(Vec::new()),
        }
    }

    /// Replace the port allocator used by [`forward`](Self::forward).
    pub fn with_port_allocator(mut self, ports: Arc<dyn PortAllocator>) -> Self {
        self.ports = ports;
        self
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn client(&self) -> &Arc<HdcClient> {
        &self.client
    }

    /// Run a raw shell command line.
    pub async fn shell(&self, command_line: &str) -> Result<String, HdcError> {
        self.client
            .execute_on(&self.serial, &format!("shell {command_line}"))
            .await
    }

    /// Read one system parameter.
    pub async fn param(&self, name: &str) -> Result<String, HdcError> {
        Ok(self.run_shell("param", &["get", name]).await?.trim().to_string())
    }

    /// Device attributes, queried once and cached.
    pub async fn info(&self) -> Result<&DeviceInfo, HdcError> {
        self.info
            .get_or_try_init(|| async {
                let info = DeviceInfo {
                    model: self.param(PARAM_MODEL).await?,
                    brand: self.param(PARAM_BRAND).await?,
                    os_version: self.param(PARAM_OS_VERSION).await?,
                    api_version: self.param(PARAM_API_VERSION).await?,
                    cpu_abis: self
                        .param(PARAM_CPU_ABILIST)
                        .await?
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect(),
                };
                debug!(serial = %self.serial, model = %info.model, "device info loaded");
                Ok::<_, HdcError>(info)
            })
            .await
    }

    /// Whether a process with the given name is running.
    pub async fn is_process_running(&self, name: &str) -> Result<bool, HdcError> {
        let output = self.run_shell("pidof", &[name]).await?;
        Ok(output
            .split_whitespace()
            .any(|pid| pid.chars().all(|c| c.is_ascii_digit())))
    }

    /// Pull a device file into `local`.
    pub async fn pull(&self, remote: &str, local: &Path) -> Result<(), HdcError> {
        self.client.pull_file(&self.serial, remote, local).await
    }

    /// Forward a free local port to `remote_port` on the device.
    ///
    /// Returns the local port.
    pub async fn forward(&self, remote_port: u16) -> Result<u16, HdcError> {
        let local = self.ports.allocate_free_port()?;
        self.client.forward(&self.serial, local, remote_port).await?;
        self.forwards().push((local, remote_port));
        Ok(local)
    }

    /// Forward `local` to `remote` again, replacing a stale rule if the
    /// daemon still has one.
    pub async fn restore_forward(&self, local: u16, remote: u16) -> Result<(), HdcError> {
        if let Err(e) = self.client.remove_forward(&self.serial, local, remote).await {
            debug!(local, remote, error = %e, "no stale forward to remove");
        }
        self.client.forward(&self.serial, local, remote).await?;
        let mut forwards = self.forwards();
        if !forwards.contains(&(local, remote)) {
            forwards.push((local, remote));
        }
        Ok(())
    }

    /// Remove one forward.
    pub async fn remove_forward(&self, local: u16, remote: u16) -> Result<(), HdcError> {
        self.client.remove_forward(&self.serial, local, remote).await?;
        self.forwards().retain(|f| *f != (local, remote));
        Ok(())
    }

    /// Remove every forward created through this handle. Failures are logged
    /// and do not stop the remaining removals.
    pub async fn remove_all_forwards(&self) {
        let forwards: Vec<(u16, u16)> = self.forwards().drain(..).collect();
        for (local, remote) in forwards {
            if let Err(e) = self.client.remove_forward(&self.serial, local, remote).await {
                warn!(local, remote, error = %e, "failed to remove forward");
            }
        }
    }

    /// `(local, remote)` pairs forwarded through this handle.
    pub fn forwarded_ports(&self) -> Vec<(u16, u16)> {
        self.forwards().clone()
    }

    fn forwards(&self) -> MutexGuard<'_, Vec<(u16, u16)>> {
        self.forwards.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ShellRunner for Device {
    async fn run_shell(&self, command: &str, args: &[&str]) -> Result<String, HdcError> {
        let mut line = command.to_string();
        for arg in args {
            line.push(' ');
            line.push_str(&shell_quote(arg));
        }
        self.shell(&line).await
    }

    async fn push_file(&self, local: &Path, remote: &str) -> Result<(), HdcError> {
        self.client.push_file(&self.serial, local, remote).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
