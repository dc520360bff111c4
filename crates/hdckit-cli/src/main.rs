//! Command-line front end for HarmonyOS device automation over HDC.
//!
//! Talks to the local HDC server for device and file operations, and to the
//! on-device uitest kit for UI actions.
//!
//! # Usage
//!
//! ```bash
//! # List attached devices
//! hdckit devices
//!
//! # Run a shell command on the first online device
//! hdckit shell ls /data/local/tmp
//!
//! # Pick a device explicitly
//! hdckit -t FMR0223C13000649 info
//!
//! # Tap, swipe and type
//! hdckit tap 540 1200
//! hdckit swipe 540 1800 540 400 --speed 3000
//! hdckit text 540 300 "hello world"
//!
//! # Press keys (more than one key is sent as a combination)
//! hdckit key home
//! hdckit key ctrl_left v
//!
//! # Save five screen frames
//! hdckit capture --frames 5 --out ./frames
//!
//! # Manage port forwards
//! hdckit fport add 8012
//! hdckit fport ls
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use clap::{Parser, Subcommand};
use hdckit_core::client::{HdcClient, HdcError};
use hdckit_core::config::{BridgeConfig, ConfigError};
use hdckit_core::device::{Device, ShellRunner};
use hdckit_core::driver::{AutomationDriver, DriverError, Rotation, ScreenCaptureOptions};
use hdckit_core::gesture::Point;
use hdckit_core::hdc_driver::HdcDriver;
use hdckit_core::keycode::KeyCode;
use hdckit_core::kit::{FrameHandler, KitError};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Command-line front end for HarmonyOS device automation over HDC.
#[derive(Parser)]
#[command(name = "hdckit")]
#[command(about = "Drive HarmonyOS devices through the HDC server and the uitest kit")]
#[command(version)]
struct Cli {
    /// Device serial (defaults to the first online device)
    #[arg(short = 't', long = "target", env = "HDCKIT_SERIAL")]
    serial: Option<String>,

    /// HDC server host
    #[arg(long, env = "HDCKIT_HOST")]
    host: Option<String>,

    /// HDC server port
    #[arg(short, long, env = "HDCKIT_PORT")]
    port: Option<u16>,

    /// Config file (defaults to ~/.hdckit/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output format: text or json
    #[arg(short, long, default_value = "text")]
    format: OutputFormat,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// List devices known to the HDC server
    Devices,

    /// Run a shell command on the device
    Shell {
        /// Command and arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },

    /// Copy a local file to the device
    Push {
        local: PathBuf,
        remote: String,
    },

    /// Copy a device file to the host
    Pull {
        remote: String,
        local: PathBuf,
    },

    /// Manage TCP port forwards
    Fport {
        #[command(subcommand)]
        action: FportCommand,
    },

    /// Stop the HDC server
    Kill,

    /// Show device attributes
    Info,

    /// Tap at screen coordinates
    Tap {
        x: i32,
        y: i32,
        /// Tap twice
        #[arg(long)]
        double: bool,
        /// Hold for this many milliseconds instead of tapping
        #[arg(long, conflicts_with = "double")]
        hold: Option<u64>,
    },

    /// Swipe between two points
    Swipe {
        x1: i32,
        y1: i32,
        x2: i32,
        y2: i32,
        /// Speed in pixels per second
        #[arg(short, long, default_value = "6000")]
        speed: u32,
        /// Press and hold before moving
        #[arg(long)]
        drag: bool,
    },

    /// Press one key, or several as a combination
    Key {
        /// Key names (home, back, enter, a, 5, ...) or numeric codes
        #[arg(required = true, num_args = 1..=3)]
        keys: Vec<String>,
    },

    /// Type text into the field at the given coordinates
    Text {
        x: i32,
        y: i32,
        text: String,
    },

    /// Show the display size and rotation
    Display,

    /// Show or set the display rotation
    Rotation {
        /// Rotation in degrees: 0, 90, 180 or 270
        degrees: Option<u32>,
    },

    /// Capture screen frames
    Capture {
        /// Number of frames to capture
        #[arg(short = 'n', long, default_value = "1")]
        frames: usize,
        /// Directory to write frames to (prints base64 when omitted)
        #[arg(short, long)]
        out: Option<PathBuf>,
        /// JPEG quality, 0-100
        #[arg(long)]
        quality: Option<u8>,
        /// Give up after this many milliseconds
        #[arg(long, default_value = "10000")]
        timeout: u64,
    },
}

#[derive(Subcommand)]
enum FportCommand {
    /// Forward a local port to a device port
    Add {
        /// Device port
        remote: u16,
        /// Local port (a free one is picked when omitted)
        #[arg(short, long)]
        local: Option<u16>,
    },
    /// Remove a forward
    Rm { local: u16, remote: u16 },
    /// List active forwards
    Ls,
}

fn init_logging(log_file: Option<&Path>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "hdckit.log".into());
            let file_appender = tracing_appender::rolling::never(dir, name);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(file_appender)
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_file.as_deref());

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum CliError {
    Connection(String),
    ActionFailed(String),
    Protocol(String),
}

impl CliError {
    fn exit_code(&self) -> ExitCode {
        match self {
            CliError::Connection(_) => ExitCode::from(2),
            CliError::ActionFailed(_) => ExitCode::from(1),
            CliError::Protocol(_) => ExitCode::from(3),
        }
    }
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::Connection(msg) => write!(f, "Connection error: {}", msg),
            CliError::ActionFailed(msg) => write!(f, "Action failed: {}", msg),
            CliError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
        }
    }
}

impl From<HdcError> for CliError {
    fn from(e: HdcError) -> Self {
        if e.is_transport() {
            CliError::Connection(e.to_string())
        } else {
            CliError::ActionFailed(e.to_string())
        }
    }
}

impl From<DriverError> for CliError {
    fn from(e: DriverError) -> Self {
        match e {
            DriverError::Hdc(inner) => inner.into(),
            DriverError::InvalidResponse { .. } | DriverError::Kit(KitError::FrameIntegrity(_)) => {
                CliError::Protocol(e.to_string())
            }
            e if e.is_connection_error() => CliError::Connection(e.to_string()),
            e => CliError::ActionFailed(e.to_string()),
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        CliError::ActionFailed(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

fn load_config(cli: &Cli) -> Result<BridgeConfig, CliError> {
    let mut config = match &cli.config {
        Some(path) => BridgeConfig::load_from(path)?,
        None => BridgeConfig::load()?,
    };
    if let Some(host) = &cli.host {
        config.hdc_host = host.clone();
    }
    if let Some(port) = cli.port {
        config.hdc_port = port;
    }
    Ok(config)
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config = load_config(&cli)?;
    let client = Arc::new(
        HdcClient::connect(config.connection_config())
            .await
            .map_err(|e| {
                CliError::Connection(format!(
                    "Failed to reach HDC server at {}:{}: {}",
                    config.hdc_host, config.hdc_port, e
                ))
            })?,
    );

    let result = dispatch(&cli, &config, &client).await;
    client.close();
    result
}

async fn dispatch(cli: &Cli, config: &BridgeConfig, client: &Arc<HdcClient>) -> Result<(), CliError> {
    // Commands that do not address a device
    match &cli.command {
        Command::Devices => return list_devices(client, cli).await,
        Command::Kill => {
            client.kill_server().await?;
            report(cli, "kill", "", json!({ "success": true }));
            return Ok(());
        }
        Command::Fport {
            action: FportCommand::Ls,
        } => return list_forwards(client, cli).await,
        _ => {}
    }

    let device = Arc::new(select_device(client, cli.serial.as_deref()).await?);
    debug!(serial = device.serial(), "device selected");

    match &cli.command {
        Command::Shell { command } => {
            let line = command.join(" ");
            let output = device.shell(&line).await?;
            if cli.format == OutputFormat::Json {
                print_json(&json!({ "serial": device.serial(), "output": output }))
            } else {
                print!("{}", output);
                Ok(())
            }
        }
        Command::Push { local, remote } => {
            let start = Instant::now();
            device.push_file(local, remote).await?;
            report(cli, "push", remote, json!({ "success": true, "elapsed_ms": start.elapsed().as_millis() as u64 }));
            Ok(())
        }
        Command::Pull { remote, local } => {
            let start = Instant::now();
            device.pull(remote, local).await?;
            report(cli, "pull", remote, json!({ "success": true, "elapsed_ms": start.elapsed().as_millis() as u64 }));
            Ok(())
        }
        Command::Fport { action } => forward(client, &device, action, cli).await,
        Command::Info => {
            let info = device.info().await?;
            if cli.format == OutputFormat::Json {
                print_json(&json!({ "serial": device.serial(), "info": info }))
            } else {
                println!("serial:      {}", device.serial());
                println!("model:       {}", info.model);
                println!("brand:       {}", info.brand);
                println!("os version:  {}", info.os_version);
                println!("api version: {}", info.api_version);
                println!("cpu abis:    {}", info.cpu_abis.join(", "));
                Ok(())
            }
        }
        _ => {
            let mut driver = HdcDriver::for_device(device, config.driver_config());
            driver.connect().await?;
            let result = drive(&driver, cli).await;
            driver.close().await;
            result
        }
    }
}

async fn select_device(client: &Arc<HdcClient>, serial: Option<&str>) -> Result<Device, CliError> {
    if let Some(serial) = serial {
        return Ok(client.device(serial));
    }
    client
        .list_devices()
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| CliError::Connection("No online device found".to_string()))
}

// ---------------------------------------------------------------------------
// HDC commands
// ---------------------------------------------------------------------------

async fn list_devices(client: &HdcClient, cli: &Cli) -> Result<(), CliError> {
    let targets = client.list_targets().await?;
    if cli.format == OutputFormat::Json {
        return print_json(&json!({ "devices": targets }));
    }
    if targets.is_empty() {
        eprintln!("No devices found");
    }
    for target in &targets {
        let state = if target.is_usable() { "" } else { " (unavailable)" };
        println!("{}\t{:?}\t{:?}{}", target.serial, target.kind, target.state, state);
    }
    Ok(())
}

async fn list_forwards(client: &HdcClient, cli: &Cli) -> Result<(), CliError> {
    let forwards = client.list_forwards().await?;
    if cli.format == OutputFormat::Json {
        return print_json(&json!({ "forwards": forwards }));
    }
    for entry in &forwards {
        println!("{}\t{} -> {}", entry.serial, entry.local, entry.remote);
    }
    Ok(())
}

async fn forward(
    client: &HdcClient,
    device: &Device,
    action: &FportCommand,
    cli: &Cli,
) -> Result<(), CliError> {
    match *action {
        FportCommand::Add { remote, local } => {
            let local = match local {
                Some(local) => {
                    client.forward(device.serial(), local, remote).await?;
                    local
                }
                None => device.forward(remote).await?,
            };
            if cli.format == OutputFormat::Json {
                print_json(&json!({ "local": local, "remote": remote }))
            } else {
                println!("{}", local);
                Ok(())
            }
        }
        FportCommand::Rm { local, remote } => {
            client.remove_forward(device.serial(), local, remote).await?;
            report(cli, "fport rm", &format!("{local}:{remote}"), json!({ "success": true }));
            Ok(())
        }
        FportCommand::Ls => list_forwards(client, cli).await,
    }
}

// ---------------------------------------------------------------------------
// UI commands
// ---------------------------------------------------------------------------

async fn drive(driver: &HdcDriver, cli: &Cli) -> Result<(), CliError> {
    let start = Instant::now();
    match &cli.command {
        Command::Tap { x, y, double, hold } => {
            match (double, hold) {
                (true, _) => driver.double_tap(*x, *y).await?,
                (false, Some(ms)) => driver.long_press(*x, *y, Duration::from_millis(*ms)).await?,
                (false, None) => driver.tap(*x, *y).await?,
            }
            let elapsed = start.elapsed().as_millis() as u64;
            report(cli, "tap", &format!("{x},{y}"), json!({ "success": true, "elapsed_ms": elapsed }));
        }
        Command::Swipe { x1, y1, x2, y2, speed, drag } => {
            let (from, to) = (Point::new(*x1, *y1), Point::new(*x2, *y2));
            if *drag {
                driver.drag(from, to, *speed).await?;
            } else {
                driver.swipe(from, to, *speed).await?;
            }
            let elapsed = start.elapsed().as_millis() as u64;
            report(
                cli,
                "swipe",
                &format!("{x1},{y1}->{x2},{y2}"),
                json!({ "success": true, "elapsed_ms": elapsed }),
            );
        }
        Command::Key { keys } => {
            let codes = keys
                .iter()
                .map(|name| {
                    KeyCode::from_name(name)
                        .ok_or_else(|| CliError::ActionFailed(format!("Unknown key: {}", name)))
                })
                .collect::<Result<Vec<_>, _>>()?;
            if let [single] = codes.as_slice() {
                driver.press_key(*single).await?;
            } else {
                driver.press_combo(&codes).await?;
            }
            let elapsed = start.elapsed().as_millis() as u64;
            report(cli, "key", &keys.join("+"), json!({ "success": true, "elapsed_ms": elapsed }));
        }
        Command::Text { x, y, text } => {
            driver.input_text(*x, *y, text).await?;
            let elapsed = start.elapsed().as_millis() as u64;
            report(cli, "text", text, json!({ "success": true, "elapsed_ms": elapsed }));
        }
        Command::Display => {
            let size = driver.display_size().await?;
            let rotation = driver.display_rotation().await?;
            if cli.format == OutputFormat::Json {
                print_json(&json!({
                    "width": size.width,
                    "height": size.height,
                    "rotation": rotation.degrees(),
                }))?;
            } else {
                println!("{}x{} rotation {}", size.width, size.height, rotation.degrees());
            }
        }
        Command::Rotation { degrees: None } => {
            let rotation = driver.display_rotation().await?;
            if cli.format == OutputFormat::Json {
                print_json(&json!({ "rotation": rotation.degrees() }))?;
            } else {
                println!("{}", rotation.degrees());
            }
        }
        Command::Rotation { degrees: Some(degrees) } => {
            let rotation = parse_rotation(*degrees)?;
            driver.set_display_rotation(rotation).await?;
            report(cli, "rotation", &degrees.to_string(), json!({ "success": true }));
        }
        Command::Capture {
            frames,
            out,
            quality,
            timeout,
        } => {
            let options = ScreenCaptureOptions {
                quality: *quality,
                ..Default::default()
            };
            let captured =
                capture_frames(driver, options, *frames, Duration::from_millis(*timeout)).await?;
            write_frames(&captured, out.as_deref(), cli)?;
        }
        _ => unreachable!("device commands are handled before connecting the driver"),
    }
    Ok(())
}

fn parse_rotation(degrees: u32) -> Result<Rotation, CliError> {
    if degrees % 90 != 0 {
        return Err(CliError::ActionFailed(format!(
            "Rotation must be a multiple of 90, got {}",
            degrees
        )));
    }
    Rotation::from_index(i64::from(degrees / 90))
        .ok_or_else(|| CliError::ActionFailed(format!("Rotation out of range: {}", degrees)))
}

/// Forwards capture frames into a channel.
struct FrameSink {
    tx: mpsc::UnboundedSender<Result<Vec<u8>, String>>,
}

impl FrameHandler for FrameSink {
    fn on_data(&self, payload: Vec<u8>) {
        let _ = self.tx.send(Ok(payload));
    }

    fn on_error(&self, error: &KitError) {
        let _ = self.tx.send(Err(error.to_string()));
    }
}

async fn capture_frames(
    driver: &HdcDriver,
    options: ScreenCaptureOptions,
    count: usize,
    timeout: Duration,
) -> Result<Vec<Vec<u8>>, CliError> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    driver
        .start_screen_capture(Arc::new(FrameSink { tx }), options)
        .await?;

    let collected = tokio::time::timeout(timeout, async {
        let mut frames = Vec::with_capacity(count);
        while frames.len() < count {
            match rx.recv().await {
                Some(Ok(frame)) => frames.push(frame),
                Some(Err(e)) => return Err(CliError::Connection(e)),
                None => break,
            }
        }
        Ok(frames)
    })
    .await;

    driver.stop_screen_capture().await?;
    match collected {
        Ok(frames) => frames,
        Err(_) => Err(CliError::ActionFailed(format!(
            "Timed out waiting for {} frame(s)",
            count
        ))),
    }
}

fn write_frames(frames: &[Vec<u8>], out: Option<&Path>, cli: &Cli) -> Result<(), CliError> {
    let Some(dir) = out else {
        let encoded: Vec<String> = frames
            .iter()
            .map(|f| base64::engine::general_purpose::STANDARD.encode(f))
            .collect();
        if cli.format == OutputFormat::Json {
            return print_json(&json!({ "frames": encoded }));
        }
        for frame in encoded {
            println!("{}", frame);
        }
        return Ok(());
    };

    std::fs::create_dir_all(dir)
        .map_err(|e| CliError::ActionFailed(format!("Cannot create {}: {}", dir.display(), e)))?;
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let mut written = Vec::with_capacity(frames.len());
    for (i, frame) in frames.iter().enumerate() {
        let path = dir.join(format!("screen-{}-{:03}.jpg", stamp, i + 1));
        std::fs::write(&path, frame)
            .map_err(|e| CliError::ActionFailed(format!("Cannot write {}: {}", path.display(), e)))?;
        written.push(path);
    }

    if cli.format == OutputFormat::Json {
        let files: Vec<_> = written
            .iter()
            .zip(frames)
            .map(|(path, frame)| json!({ "path": path, "bytes": frame.len() }))
            .collect();
        print_json(&json!({ "frames": files }))
    } else {
        for path in &written {
            println!("{}", path.display());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn print_json(value: &serde_json::Value) -> Result<(), CliError> {
    let text = serde_json::to_string_pretty(value).map_err(|e| CliError::Protocol(e.to_string()))?;
    println!("{}", text);
    Ok(())
}

/// Print the result of an action: JSON on stdout, or a `|time|action|target|duration|`
/// line on stderr.
fn report(cli: &Cli, action: &str, target: &str, result: serde_json::Value) {
    if cli.format == OutputFormat::Json {
        let _ = print_json(&result);
        return;
    }
    if cli.quiet {
        return;
    }
    let now = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3fZ");
    let duration = result
        .get("elapsed_ms")
        .and_then(|v| v.as_u64())
        .map(|ms| format!("{}ms", ms))
        .unwrap_or_default();
    eprintln!("|{}|{}|{}|{}|", now, action, target, duration);
}
