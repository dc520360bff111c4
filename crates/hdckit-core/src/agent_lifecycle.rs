//! Lifecycle management for the uitest agent on a device.
//!
//! The kit only answers once the `uitest` daemon is running on the device and
//! its agent library is present. [`AgentLifecycle`] takes care of that:
//!
//! 1. **Install** the agent library with a file push when a local blob is
//!    configured and the device does not have it yet
//! 2. **Start** the daemon with `uitest start-daemon singleness`
//! 3. **Wait for ready** by opening the forwarded kit port and creating a
//!    driver object
//! 4. **Retry** on failure (stop + start) up to a configurable limit
//!
//! All device access goes through a [`ShellRunner`], so the manager can be
//! driven by any implementation (a [`Device`](crate::device::Device) in
//! production).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::client::HdcError;
use crate::device::ShellRunner;
use crate::kit::{Channel, KitConfig, KitTransport};
use crate::rpc::{RpcRequest, RpcResponse};

/// Default on-device location of the agent library.
pub const DEFAULT_AGENT_REMOTE_PATH: &str = "/data/local/tmp/agent.so";

const UITEST_PROCESS: &str = "uitest";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for the agent lifecycle manager.
#[derive(Debug, Clone)]
pub struct AgentLifecycleConfig {
    /// Local agent library to push when the device lacks it.
    pub agent_blob: Option<PathBuf>,
    /// Where the agent library lives on the device.
    pub remote_path: String,
    /// Maximum time to wait for the agent to become ready.
    pub startup_timeout: Duration,
    /// Delay between readiness probes.
    pub poll_interval: Duration,
    /// Maximum number of restarts before giving up.
    pub max_retries: u32,
}

impl Default for AgentLifecycleConfig {
    fn default() -> Self {
        Self {
            agent_blob: None,
            remote_path: DEFAULT_AGENT_REMOTE_PATH.to_string(),
            startup_timeout: Duration::from_secs(15),
            poll_interval: Duration::from_millis(500),
            max_retries: 2,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors specific to agent lifecycle operations.
#[derive(Error, Debug)]
pub enum AgentLifecycleError {
    /// The configured local agent library does not exist.
    #[error("agent blob not found at path: {0}")]
    BlobNotFound(PathBuf),

    #[error("failed to start uitest daemon: {0}")]
    StartFailed(String),

    /// The kit did not answer within the startup timeout.
    #[error("agent failed to become ready within timeout")]
    StartupTimeout,

    #[error(transparent)]
    Shell(#[from] HdcError),
}

// ---------------------------------------------------------------------------
// AgentLifecycle
// ---------------------------------------------------------------------------

/// Installs, starts and health-checks the uitest agent.
pub struct AgentLifecycle {
    shell: Arc<dyn ShellRunner>,
    config: AgentLifecycleConfig,
}

impl AgentLifecycle {
    pub fn new(shell: Arc<dyn ShellRunner>, config: AgentLifecycleConfig) -> Self {
        Self { shell, config }
    }

    pub fn config(&self) -> &AgentLifecycleConfig {
        &self.config
    }

    /// Whether the uitest daemon process is alive.
    pub async fn is_running(&self) -> Result<bool, AgentLifecycleError> {
        let output = self.shell.run_shell("pidof", &[UITEST_PROCESS]).await?;
        let running = parse_pids(&output).next().is_some();
        Ok(running)
    }

    /// Push the agent library unless the device already has it.
    ///
    /// Does nothing when no blob is configured.
    pub async fn install_agent(&self) -> Result<(), AgentLifecycleError> {
        let Some(blob) = &self.config.agent_blob else {
            return Ok(());
        };
        if !blob.exists() {
            return Err(AgentLifecycleError::BlobNotFound(blob.clone()));
        }

        let listing = self.shell.run_shell("ls", &[self.config.remote_path.as_str()]).await?;
        if !listing.contains("No such file") && !listing.trim().is_empty() {
            debug!(remote = %self.config.remote_path, "agent already installed");
            return Ok(());
        }

        info!(local = %blob.display(), remote = %self.config.remote_path, "installing agent");
        self.shell.push_file(blob, &self.config.remote_path).await?;
        Ok(())
    }

    /// Start the uitest daemon.
    pub async fn start_agent(&self) -> Result<(), AgentLifecycleError> {
        let output = self
            .shell
            .run_shell(UITEST_PROCESS, &["start-daemon", "singleness"])
            .await?;
        let lower = output.to_lowercase();
        if lower.contains("fail") || lower.contains("error") {
            return Err(AgentLifecycleError::StartFailed(output.trim().to_string()));
        }
        Ok(())
    }

    /// Kill every uitest daemon process. Succeeds when none is running.
    pub async fn stop_agent(&self) -> Result<(), AgentLifecycleError> {
        let output = self.shell.run_shell("pidof", &[UITEST_PROCESS]).await?;
        for pid in parse_pids(&output) {
            self.shell.run_shell("kill", &["-9", pid]).await?;
        }
        Ok(())
    }

    /// Poll the kit until it answers a `Driver.create` call.
    pub async fn wait_for_ready(&self, kit: &KitConfig) -> Result<(), AgentLifecycleError> {
        let deadline = tokio::time::Instant::now() + self.config.startup_timeout;

        loop {
            if probe_kit(kit).await {
                return Ok(());
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(AgentLifecycleError::StartupTimeout);
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Install and start the agent if needed, then wait until the kit answers.
    ///
    /// A daemon that does not become ready is stopped and started again up to
    /// [`AgentLifecycleConfig::max_retries`] times.
    #[instrument(skip_all, level = "debug")]
    pub async fn ensure_running(&self, kit: &KitConfig) -> Result<(), AgentLifecycleError> {
        self.install_agent().await?;
        if !self.is_running().await? {
            info!("starting uitest daemon");
            self.start_agent().await?;
        }

        for attempt in 0..=self.config.max_retries {
            match self.wait_for_ready(kit).await {
                Ok(()) => return Ok(()),
                Err(AgentLifecycleError::StartupTimeout) if attempt < self.config.max_retries => {
                    warn!(attempt, "uitest agent not ready, restarting");
                    let _ = self.stop_agent().await;
                    self.start_agent().await?;
                }
                Err(e) => return Err(e),
            }
        }

        Err(AgentLifecycleError::StartupTimeout)
    }
}

fn parse_pids(output: &str) -> impl Iterator<Item = &str> {
    output
        .split_whitespace()
        .filter(|pid| !pid.is_empty() && pid.chars().all(|c| c.is_ascii_digit()))
}

/// One readiness probe: connect and create a driver object.
async fn probe_kit(config: &KitConfig) -> bool {
    let kit = match KitTransport::connect(config.clone()).await {
        Ok(kit) => kit,
        Err(e) => {
            debug!(error = %e, "kit not reachable yet");
            return false;
        }
    };
    let request = RpcRequest::driver_create();
    let ready = match kit.request(Channel::Control, &request.to_bytes()).await {
        Ok(bytes) => RpcResponse::from_slice(&bytes)
            .map(|r| r.into_result().is_ok())
            .unwrap_or(false),
        Err(e) => {
            debug!(error = %e, "kit did not answer probe");
            false
        }
    };
    kit.close().await;
    ready
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
