//! The adb capabilities the core calls into.
//!
//! [`AdbDevice`] is the seam between the automation core and the device
//! transport. The core only needs shell execution, file push/pull, port
//! forwarding and a streaming shell for the instrumentation process; the
//! wire protocol behind them is someone else's problem. [`AdbCli`] provides
//! these by driving the `adb` executable.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised by device transport operations.
#[derive(Error, Debug)]
pub enum AdbError {
    #[error("failed to run adb: {0}")]
    Io(#[from] std::io::Error),

    #[error("adb {command} failed: {output}")]
    CommandFailed { command: String, output: String },

    #[error("unexpected adb output: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Combined output and exit status of a finished shell command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOutput {
    pub output: String,
    pub exit_code: i32,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Installed-package facts parsed from `dumpsys package`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PackageInfo {
    pub version_name: Option<String>,
    pub signature: Option<String>,
}

/// The package and activity currently holding window focus.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct AppCurrent {
    pub package: String,
    pub activity: String,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// A long-running shell command whose combined stdout/stderr is buffered.
#[async_trait]
pub trait ShellProcess: Send + Sync {
    /// Everything the process has written so far.
    fn output(&self) -> String;

    fn is_running(&self) -> bool;

    /// Terminates the process. Calling it on a finished process is a no-op.
    async fn kill(&self);
}

/// Device transport operations consumed by the core.
#[async_trait]
pub trait AdbDevice: Send + Sync {
    fn serial(&self) -> &str;

    async fn shell(&self, args: &[&str]) -> Result<ShellOutput, AdbError>;

    async fn push(&self, src: &Path, dst: &str, mode: u32) -> Result<(), AdbError>;

    async fn pull(&self, src: &str, dst: &Path) -> Result<(), AdbError>;

    /// Forwards a local TCP port to `remote` on the device and returns the local port.
    async fn forward_port(&self, remote: u16) -> Result<u16, AdbError>;

    /// Starts a shell command without waiting for it to finish.
    async fn spawn_shell(&self, args: &[&str]) -> Result<Box<dyn ShellProcess>, AdbError>;

    async fn getprop(&self, key: &str) -> Result<String, AdbError> {
        Ok(self.shell(&["getprop", key]).await?.output.trim().to_string())
    }

    /// Returns `None` when the package is not installed.
    async fn package_info(&self, package: &str) -> Result<Option<PackageInfo>, AdbError> {
        let out = self.shell(&["dumpsys", "package", package]).await?;
        Ok(parse_package_info(&out.output))
    }

    /// Display size in pixels from `wm size`, preferring an override size.
    async fn window_size(&self) -> Result<(i32, i32), AdbError> {
        let out = self.shell(&["wm", "size"]).await?;
        parse_wm_size(&out.output)
            .ok_or_else(|| AdbError::Parse(format!("unexpected wm size output: {}", out.output.trim())))
    }

    async fn app_current(&self) -> Result<AppCurrent, AdbError> {
        let out = self.shell(&["dumpsys", "window", "windows"]).await?;
        parse_app_current(&out.output)
            .ok_or_else(|| AdbError::Parse("no focused window in dumpsys output".into()))
    }

    /// Pushes an apk to the device and installs it with `pm install -r -t`.
    async fn install(&self, apk: &Path) -> Result<(), AdbError> {
        let name = apk
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "droidrive.apk".to_string());
        let remote = format!("/data/local/tmp/{name}");
        self.push(apk, &remote, 0o644).await?;
        let out = self.shell(&["pm", "install", "-r", "-t", &remote]).await?;
        if !out.output.contains("Success") {
            return Err(AdbError::CommandFailed {
                command: format!("pm install {remote}"),
                output: out.output,
            });
        }
        Ok(())
    }

    async fn uninstall(&self, package: &str) -> Result<(), AdbError> {
        self.shell(&["pm", "uninstall", package]).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Parsers
// ---------------------------------------------------------------------------

fn version_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"versionName=([\d.]+)").unwrap())
}

fn signature_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"PackageSignatures\{(.*?)\}").unwrap())
}

fn focus_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"mCurrentFocus=Window\{.*\s+(?P<package>[^\s/]+)/(?P<activity>[^\s\}]+)\}")
            .unwrap()
    })
}

fn focused_app_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"mFocusedApp=.*ActivityRecord\{.*\s+(?P<package>[^\s/]+)/(?P<activity>[^\s\}]+)")
            .unwrap()
    })
}

pub fn parse_package_info(output: &str) -> Option<PackageInfo> {
    let version_name = version_re()
        .captures(output)
        .map(|c| c[1].to_string());
    let signature = signature_re()
        .captures(output)
        .map(|c| c[1].to_string());
    if version_name.is_none() && signature.is_none() {
        return None;
    }
    Some(PackageInfo { version_name, signature })
}

pub fn parse_app_current(output: &str) -> Option<AppCurrent> {
    let caps = focus_re()
        .captures(output)
        .or_else(|| focused_app_re().captures(output))?;
    Some(AppCurrent {
        package: caps["package"].to_string(),
        activity: caps["activity"].to_string(),
    })
}

fn wm_size_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^(Physical|Override) size: (\d+)x(\d+)").unwrap())
}

pub fn parse_wm_size(output: &str) -> Option<(i32, i32)> {
    let mut size = None;
    for caps in wm_size_re().captures_iter(output) {
        let dims = (caps[2].parse().ok()?, caps[3].parse().ok()?);
        if &caps[1] == "Override" {
            return Some(dims);
        }
        size = Some(dims);
    }
    size
}

/// Finds the local port already forwarded to `remote` in `adb forward --list` output.
pub fn parse_forward_list(output: &str, serial: &str, remote: u16) -> Option<u16> {
    let want = format!("tcp:{remote}");
    output.lines().find_map(|line| {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.as_slice() {
            [s, local, r] if *s == serial && *r == want => {
                local.strip_prefix("tcp:")?.parse().ok()
            }
            _ => None,
        }
    })
}

/// Serials of attached devices in `device` state from `adb devices` output.
pub fn parse_devices(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| !line.to_lowercase().contains("list of devices"))
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            let serial = tokens.next()?;
            (tokens.next()? == "device").then(|| serial.to_string())
        })
        .collect()
}

// ---------------------------------------------------------------------------
// AdbCli
// ---------------------------------------------------------------------------

/// [`AdbDevice`] backed by the `adb` executable.
pub struct AdbCli {
    program: PathBuf,
    serial: String,
    forwards: StdMutex<HashMap<u16, u16>>,
}

impl AdbCli {
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            program: PathBuf::from("adb"),
            serial: serial.into(),
            forwards: StdMutex::new(HashMap::new()),
        }
    }

    /// Uses a specific adb binary instead of the one on `PATH`.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Connects to the only attached device, failing if there are none or several.
    pub async fn single() -> Result<Self, AdbError> {
        let out = Command::new("adb").arg("devices").output().await?;
        let serials = parse_devices(&String::from_utf8_lossy(&out.stdout));
        match serials.as_slice() {
            [one] => Ok(Self::new(one.clone())),
            [] => Err(AdbError::CommandFailed {
                command: "devices".into(),
                output: "no device attached".into(),
            }),
            many => Err(AdbError::CommandFailed {
                command: "devices".into(),
                output: format!("more than one device attached: {}", many.join(", ")),
            }),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<ShellOutput, AdbError> {
        debug!(serial = %self.serial, ?args, "adb");
        let out = Command::new(&self.program)
            .arg("-s")
            .arg(&self.serial)
            .args(args)
            .output()
            .await?;
        let mut output = String::from_utf8_lossy(&out.stdout).into_owned();
        output.push_str(&String::from_utf8_lossy(&out.stderr));
        Ok(ShellOutput {
            output,
            exit_code: out.status.code().unwrap_or(-1),
        })
    }

    async fn run_checked(&self, args: &[&str]) -> Result<ShellOutput, AdbError> {
        let out = self.run(args).await?;
        if !out.success() {
            return Err(AdbError::CommandFailed {
                command: args.join(" "),
                output: out.output,
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl AdbDevice for AdbCli {
    fn serial(&self) -> &str {
        &self.serial
    }

    async fn shell(&self, args: &[&str]) -> Result<ShellOutput, AdbError> {
        let mut full = vec!["shell"];
        full.extend_from_slice(args);
        self.run(&full).await
    }

    async fn push(&self, src: &Path, dst: &str, mode: u32) -> Result<(), AdbError> {
        let src = src.to_string_lossy();
        self.run_checked(&["push", &src, dst]).await?;
        let mode = format!("{mode:o}");
        self.shell(&["chmod", &mode, dst]).await?;
        Ok(())
    }

    async fn pull(&self, src: &str, dst: &Path) -> Result<(), AdbError> {
        let dst = dst.to_string_lossy();
        self.run_checked(&["pull", src, &dst]).await?;
        Ok(())
    }

    async fn forward_port(&self, remote: u16) -> Result<u16, AdbError> {
        let cached = self
            .forwards
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&remote)
            .copied();
        if let Some(port) = cached {
            return Ok(port);
        }

        let list = Command::new(&self.program).args(["forward", "--list"]).output().await?;
        let port = match parse_forward_list(&String::from_utf8_lossy(&list.stdout), &self.serial, remote) {
            Some(port) => port,
            None => {
                let remote_spec = format!("tcp:{remote}");
                let out = self.run_checked(&["forward", "tcp:0", &remote_spec]).await?;
                out.output
                    .trim()
                    .parse()
                    .map_err(|_| AdbError::Parse(format!("forward port: {}", out.output.trim())))?
            }
        };

        debug!(local = port, remote, "forwarded port");
        self.forwards
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(remote, port);
        Ok(port)
    }

    async fn spawn_shell(&self, args: &[&str]) -> Result<Box<dyn ShellProcess>, AdbError> {
        debug!(serial = %self.serial, ?args, "adb shell (streaming)");
        let mut child = Command::new(&self.program)
            .arg("-s")
            .arg(&self.serial)
            .arg("shell")
            .args(args)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let buffer = Arc::new(StdMutex::new(Vec::new()));
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(drain(stdout, Arc::clone(&buffer)));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain(stderr, Arc::clone(&buffer)));
        }

        let finished = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();
        let waiter = {
            let finished = Arc::clone(&finished);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let killed = tokio::select! {
                    _ = child.wait() => false,
                    _ = cancel.cancelled() => true,
                };
                if killed {
                    let _ = child.kill().await;
                }
                finished.store(true, Ordering::SeqCst);
            })
        };

        Ok(Box::new(AdbProcess {
            buffer,
            finished,
            cancel,
            waiter: Mutex::new(Some(waiter)),
        }))
    }
}

/// Bytes of process output kept in memory; older output is dropped.
const OUTPUT_TAIL: usize = 64 * 1024;

async fn drain<R: AsyncRead + Unpin>(mut reader: R, buffer: Arc<StdMutex<Vec<u8>>>) {
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => append_tail(
                &mut buffer.lock().unwrap_or_else(|e| e.into_inner()),
                &chunk[..n],
                OUTPUT_TAIL,
            ),
        }
    }
}

fn append_tail(buf: &mut Vec<u8>, data: &[u8], cap: usize) {
    buf.extend_from_slice(data);
    if buf.len() > cap {
        let excess = buf.len() - cap;
        buf.drain(..excess);
    }
}

/// A streaming `adb shell` child process.
struct AdbProcess {
    buffer: Arc<StdMutex<Vec<u8>>>,
    finished: Arc<AtomicBool>,
    cancel: CancellationToken,
    waiter: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl ShellProcess for AdbProcess {
    fn output(&self) -> String {
        let buf = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        String::from_utf8_lossy(&buf).into_owned()
    }

    fn is_running(&self) -> bool {
        !self.finished.load(Ordering::SeqCst)
    }

    async fn kill(&self) {
        self.cancel.cancel();
        if let Some(waiter) = self.waiter.lock().await.take() {
            let _ = waiter.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
