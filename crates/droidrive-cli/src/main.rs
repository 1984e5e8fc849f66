//! Command-line client for Android UI automation.
//!
//! # Usage
//!
//! ```bash
//! # Make sure the automation server is running
//! droidrive -s emulator-5554 start
//!
//! # Device info and the current hierarchy
//! droidrive info
//! droidrive dump > window.xml
//!
//! # Tap at coordinates (values below 1 are fractions of the screen)
//! droidrive tap 0.5 0.9
//!
//! # Click by xpath or shorthand, dismissing popups on the way
//! droidrive click "%Settings%" --watch --timeout 10
//!
//! # Keep clicking away permission dialogs until Ctrl-C
//! droidrive watch --click "Allow" --click "@android:id/button1"
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use droidrive_core::device::Device;
use droidrive_core::error::DeviceError;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Command-line client for Android UI automation.
#[derive(Parser)]
#[command(name = "droidrive")]
#[command(about = "Drive an Android device through the uiautomator JSON-RPC server")]
#[command(version)]
struct Cli {
    /// Device serial; defaults to the only connected device
    #[arg(short, long, env = "ANDROID_SERIAL")]
    serial: Option<String>,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the automation server if it is not answering
    Start,

    /// Stop the automation server
    Stop,

    /// Check whether the automation server answers
    Ping,

    /// Print device info as JSON
    Info,

    /// Print the UI hierarchy XML
    Dump {
        /// Skip layout-only nodes
        #[arg(long)]
        compressed: bool,
    },

    /// Tap at screen coordinates
    Tap {
        /// X coordinate, or a fraction of the width when below 1
        x: f64,
        /// Y coordinate, or a fraction of the height when below 1
        y: f64,
    },

    /// Click the first element matching an xpath or shorthand
    Click {
        xpath: String,
        /// Run the registered watchers while waiting
        #[arg(long)]
        watch: bool,
        /// Seconds to wait for the element
        #[arg(short, long)]
        timeout: Option<f64>,
    },

    /// Save a JPEG screenshot
    Screenshot {
        /// Output file
        out: PathBuf,
    },

    /// Click matching elements whenever they appear, until Ctrl-C
    Watch {
        /// Element to click when it appears; repeatable
        #[arg(long = "click", required = true)]
        click: Vec<String>,
        /// Seconds between scans
        #[arg(short, long)]
        interval: Option<f64>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_file.as_deref());

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    }
}

fn init_tracing(log_file: Option<&Path>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let file = log_file.and_then(|path| Some((path.parent()?, path.file_name()?)));
    match file {
        Some((dir, name)) => {
            let dir = if dir.as_os_str().is_empty() {
                Path::new(".")
            } else {
                dir
            };
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

#[derive(Debug)]
enum CliError {
    Connection(String),
    ActionFailed(String),
}

impl CliError {
    fn exit_code(&self) -> ExitCode {
        match self {
            CliError::Connection(_) => ExitCode::from(2),
            CliError::ActionFailed(_) => ExitCode::from(1),
        }
    }
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::Connection(msg) => write!(f, "Connection error: {}", msg),
            CliError::ActionFailed(msg) => write!(f, "Action failed: {}", msg),
        }
    }
}

impl From<DeviceError> for CliError {
    fn from(e: DeviceError) -> Self {
        if e.is_connection() {
            CliError::Connection(e.to_string())
        } else {
            CliError::ActionFailed(e.to_string())
        }
    }
}

fn seconds(value: Option<f64>) -> Option<Duration> {
    value.map(droidrive_core::config::secs)
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let device = Device::connect(cli.serial.as_deref()).await?;

    match cli.command {
        Command::Start => {
            device.start_server().await?;
            let status = device.server_status().await;
            println!(
                "{}",
                serde_json::to_string_pretty(&status)
                    .map_err(|e| CliError::ActionFailed(e.to_string()))?
            );
        }
        Command::Stop => {
            device.stop_server().await;
        }
        Command::Ping => {
            if device.server_alive().await {
                println!("pong");
            } else {
                return Err(CliError::Connection("server not answering".into()));
            }
        }
        Command::Info => {
            let info = device.info().await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&info)
                    .map_err(|e| CliError::ActionFailed(e.to_string()))?
            );
        }
        Command::Dump { compressed } => {
            println!("{}", device.dump_hierarchy(compressed).await?);
        }
        Command::Tap { x, y } => {
            device.click(x, y).await?;
        }
        Command::Click {
            xpath,
            watch,
            timeout,
        } => {
            device
                .xpath_engine()
                .click(&xpath, watch, seconds(timeout))
                .await?;
        }
        Command::Screenshot { out } => {
            let jpeg = device.screenshot().await?;
            tokio::fs::write(&out, jpeg)
                .await
                .map_err(|e| CliError::ActionFailed(format!("{}: {}", out.display(), e)))?;
            println!("{}", out.display());
        }
        Command::Watch { click, interval } => {
            let watcher = device.watcher();
            for xpath in click {
                watcher.when(xpath).click()?;
            }
            watcher.start(seconds(interval));
            info!(rules = ?watcher.names(), "watching");
            tokio::signal::ctrl_c()
                .await
                .map_err(|e| CliError::ActionFailed(e.to_string()))?;
            watcher.stop().await;
            for record in watcher.triggered() {
                println!("{}\t{}", record.at.to_rfc3339(), record.name);
            }
        }
    }
    Ok(())
}
