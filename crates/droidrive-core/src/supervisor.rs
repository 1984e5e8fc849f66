//! Lifecycle supervision for the on-device automation server.
//!
//! [`ServerSupervisor`] owns the instrumentation process that hosts the
//! JSON-RPC server and makes calls through the transport survive a dead or
//! stale server.
//!
//! # Overview
//!
//! Starting the server:
//!
//! 1. **Check** the installed apks and install them if outdated
//! 2. **Launch** the instrumentation through a streaming `am instrument`
//! 3. **Watch** its output for signature, registration and failure markers
//! 4. **Poll** `/ping` until the server answers or the launch timeout passes
//!
//! An apk signature mismatch during launch uninstalls both apks, reinstalls
//! them and launches once more.
//!
//! [`ServerSupervisor::jsonrpc_call`] retries a call exactly once after a
//! restart when the transport reports a dead server. Start and stop are
//! serialized by one async mutex; callers that hit a dead server while a
//! restart is in flight wait for it instead of starting another.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::adb::{AdbDevice, AdbError, ShellProcess};
use crate::config::{deadline_after, secs, Settings};
use crate::installer::{InstallError, Installer, APP_PACKAGE, TEST_PACKAGE};
use crate::jsonrpc::{JsonRpcTransport, RpcError};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for the server supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Maximum time to wait for a launched server to answer ping.
    pub launch_timeout: Duration,
    /// Delay between readiness checks.
    pub ready_poll_interval: Duration,
    /// Maximum time `stop` waits for the server to stop answering ping.
    pub stop_timeout: Duration,
    /// Shell command that runs the instrumentation.
    pub instrument_command: Vec<String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl SupervisorConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        let runner = format!("{TEST_PACKAGE}/androidx.test.runner.AndroidJUnitRunner");
        Self {
            launch_timeout: secs(settings.launch_timeout),
            ready_poll_interval: secs(settings.ready_poll_interval),
            stop_timeout: secs(settings.stop_timeout),
            instrument_command: [
                "am",
                "instrument",
                "-w",
                "-r",
                "-e",
                "debug",
                "false",
                "-e",
                "class",
                "com.github.uiautomator.stub.Stub",
                runner.as_str(),
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from server lifecycle operations.
#[derive(Error, Debug)]
pub enum ServerError {
    /// The server did not come up.
    #[error("failed to launch automation server: {reason}")]
    Launch { reason: String, output: String },

    /// The installed apks are signed with different keys.
    #[error("automation apk signature mismatch")]
    ApkSignature { output: String },

    /// Another UiAutomation client holds the accessibility service.
    #[error("accessibility service already registered by another process")]
    AccessibilityAlreadyRegistered { output: String },

    #[error("apk installation failed: {0}")]
    Install(#[from] InstallError),

    #[error(transparent)]
    Adb(#[from] AdbError),

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

// ---------------------------------------------------------------------------
// Launch output
// ---------------------------------------------------------------------------

/// What the instrumentation output says about a launch so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchSignal {
    /// Nothing conclusive yet.
    Pending,
    /// The instrumentation reported the success status code.
    Started,
    SignatureMismatch,
    AlreadyRegistered,
    /// The instrumentation reported an error; carries the offending line.
    Failed(String),
}

/// Scans instrumentation output for a terminal signal.
pub fn classify_launch_output(output: &str) -> LaunchSignal {
    if output.contains("does not have a signature matching") {
        return LaunchSignal::SignatureMismatch;
    }
    if output.contains("already registered") {
        return LaunchSignal::AlreadyRegistered;
    }
    let failure = output.lines().find(|line| {
        line.contains("INSTRUMENTATION_STATUS_CODE: -1")
            || line.contains("INSTRUMENTATION_STATUS_CODE: -2")
            || line.contains("INSTRUMENTATION_FAILED")
            || line.contains("INSTRUMENTATION_RESULT: shortMsg=")
    });
    if let Some(line) = failure {
        return LaunchSignal::Failed(line.trim().to_string());
    }
    if output.contains("INSTRUMENTATION_STATUS_CODE: 1") {
        return LaunchSignal::Started;
    }
    LaunchSignal::Pending
}

// ---------------------------------------------------------------------------
// ServerProcess
// ---------------------------------------------------------------------------

/// The supervised instrumentation process.
#[derive(Default)]
pub struct ServerProcess {
    shell: Option<Box<dyn ShellProcess>>,
    last_ping: Option<bool>,
    started_at: Option<DateTime<Utc>>,
}

impl ServerProcess {
    pub fn is_running(&self) -> bool {
        self.shell.as_ref().is_some_and(|s| s.is_running())
    }

    /// Buffered stdout/stderr of the instrumentation.
    pub fn output(&self) -> String {
        self.shell.as_ref().map(|s| s.output()).unwrap_or_default()
    }
}

/// A snapshot of the supervised process state.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ServerStatus {
    pub running: bool,
    pub last_ping: Option<bool>,
    pub started_at: Option<DateTime<Utc>>,
    pub generation: u64,
}

// ---------------------------------------------------------------------------
// ServerSupervisor
// ---------------------------------------------------------------------------

/// Starts, stops and health-checks the automation server, and wraps
/// transport calls with one-shot recovery.
pub struct ServerSupervisor {
    adb: Arc<dyn AdbDevice>,
    transport: Arc<dyn JsonRpcTransport>,
    installer: Arc<dyn Installer>,
    config: SupervisorConfig,
    process: Mutex<ServerProcess>,
    generation: AtomicU64,
}

impl ServerSupervisor {
    pub fn new(
        adb: Arc<dyn AdbDevice>,
        transport: Arc<dyn JsonRpcTransport>,
        installer: Arc<dyn Installer>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            adb,
            transport,
            installer,
            config,
            process: Mutex::new(ServerProcess::default()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn transport(&self) -> &Arc<dyn JsonRpcTransport> {
        &self.transport
    }

    /// Number of successful launches so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Returns `true` if the server answers ping.
    pub async fn is_alive(&self) -> bool {
        self.transport.ping().await
    }

    pub async fn status(&self) -> ServerStatus {
        let process = self.process.lock().await;
        ServerStatus {
            running: process.is_running(),
            last_ping: process.last_ping,
            started_at: process.started_at,
            generation: self.generation(),
        }
    }

    /// Ensures the server is running, launching it if needed.
    ///
    /// # Errors
    ///
    /// - [`ServerError::Launch`] if the server does not answer within the launch timeout
    /// - [`ServerError::AccessibilityAlreadyRegistered`] if another client owns UiAutomation
    /// - [`ServerError::ApkSignature`] if a reinstall did not fix a signature mismatch
    #[instrument(skip(self), level = "debug")]
    pub async fn start(&self) -> Result<(), ServerError> {
        let mut process = self.process.lock().await;
        self.start_locked(&mut process).await
    }

    /// Stops the supervised server. Safe to call when it is not running.
    #[instrument(skip(self), level = "debug")]
    pub async fn stop(&self) {
        let mut process = self.process.lock().await;
        self.stop_locked(&mut process).await;
    }

    /// Calls `method` through the transport with one-shot recovery.
    ///
    /// A dead-server failure restarts the server and retries the call once;
    /// a stale object handle retries once without a restart. Any other
    /// failure, and any failure of the retry, is returned as is.
    #[instrument(skip(self, params), level = "debug")]
    pub async fn jsonrpc_call(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, ServerError> {
        let seen = self.generation();
        match self.transport.call(method, params.clone(), timeout).await {
            Err(e) if e.needs_restart() => {
                warn!(method, error = %e, "server not responding, restarting");
                self.restart(seen).await?;
                Ok(self.transport.call(method, params, timeout).await?)
            }
            Err(e) if e.is_stale_handle() => {
                debug!(method, error = %e, "stale object, retrying once");
                Ok(self.transport.call(method, params, timeout).await?)
            }
            other => Ok(other?),
        }
    }

    /// Restarts the server unless another caller already did since `seen`.
    async fn restart(&self, seen: u64) -> Result<(), ServerError> {
        let mut process = self.process.lock().await;
        if self.generation() != seen {
            debug!("server already restarted by another caller");
            return Ok(());
        }
        self.stop_locked(&mut process).await;
        self.start_locked(&mut process).await?;
        info!("server recovery successful");
        Ok(())
    }

    async fn start_locked(&self, process: &mut ServerProcess) -> Result<(), ServerError> {
        if process.shell.as_ref().is_some_and(|s| !s.is_running()) {
            process.shell = None;
        }
        if self.transport.ping().await {
            process.last_ping = Some(true);
            return Ok(());
        }

        match self.launch_locked(process).await {
            Err(ServerError::ApkSignature { .. }) => {
                warn!("apk signature mismatch, reinstalling");
                self.installer.uninstall().await?;
                self.installer.install().await?;
                self.launch_locked(process).await
            }
            other => other,
        }
    }

    async fn launch_locked(&self, process: &mut ServerProcess) -> Result<(), ServerError> {
        if self.installer.is_outdated().await? {
            self.installer.install().await?;
        }
        if let Some(old) = process.shell.take() {
            old.kill().await;
        }

        let args: Vec<&str> = self.config.instrument_command.iter().map(String::as_str).collect();
        info!("launching automation server");
        process.shell = Some(self.adb.spawn_shell(&args).await?);
        process.started_at = Some(Utc::now());

        self.wait_for_ready(process).await?;
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Polls the instrumentation output and `/ping` until ready or timed out.
    async fn wait_for_ready(&self, process: &mut ServerProcess) -> Result<(), ServerError> {
        let deadline = deadline_after(self.config.launch_timeout);
        loop {
            let output = process.output();
            match classify_launch_output(&output) {
                LaunchSignal::SignatureMismatch => return Err(ServerError::ApkSignature { output }),
                LaunchSignal::AlreadyRegistered => {
                    return Err(ServerError::AccessibilityAlreadyRegistered { output })
                }
                LaunchSignal::Failed(reason) => return Err(ServerError::Launch { reason, output }),
                LaunchSignal::Started | LaunchSignal::Pending => {}
            }

            let alive = self.transport.ping().await;
            process.last_ping = Some(alive);
            if alive {
                info!("automation server ready");
                return Ok(());
            }
            if !process.is_running() {
                return Err(ServerError::Launch {
                    reason: "server quit unexpectedly".into(),
                    output,
                });
            }
            if Instant::now() >= deadline {
                return Err(ServerError::Launch {
                    reason: "server not ready".into(),
                    output,
                });
            }
            tokio::time::sleep(self.config.ready_poll_interval).await;
        }
    }

    async fn stop_locked(&self, process: &mut ServerProcess) {
        if let Some(shell) = process.shell.take() {
            shell.kill().await;
        }
        if let Err(e) = self.adb.shell(&["am", "force-stop", APP_PACKAGE]).await {
            debug!(error = %e, "force-stop failed");
        }

        let deadline = deadline_after(self.config.stop_timeout);
        while Instant::now() < deadline {
            if !self.transport.ping().await {
                process.last_ping = Some(false);
                return;
            }
            tokio::time::sleep(self.config.ready_poll_interval).await;
        }
        warn!("server still answering ping after stop");
    }
}
