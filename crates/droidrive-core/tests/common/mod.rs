//! Shared test helpers for droidrive-core integration tests.
//!
//! Provides a scripted JSON-RPC transport, a recording adb device and a
//! counting installer, wired together so that launching the server through
//! the mock adb makes the mock transport answer ping.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use droidrive_core::adb::{AdbDevice, AdbError, ShellOutput, ShellProcess};
use droidrive_core::config::Settings;
use droidrive_core::device::Device;
use droidrive_core::installer::{InstallError, Installer};
use droidrive_core::jsonrpc::{JsonRpcTransport, RpcError};
use droidrive_core::plugin::PluginRegistry;

// ---------------------------------------------------------------------------
// Fixture hierarchy
// ---------------------------------------------------------------------------

/// Two text views `n1` and `n2` plus a status bar background.
pub const HIERARCHY: &str = r#"<?xml version='1.0' encoding='UTF-8' standalone='yes' ?>
<hierarchy rotation="0">
  <node index="0" text="" resource-id="" class="FrameLayout" package="com.example" content-desc="" clickable="false" bounds="[0,0][1080,1920]">
    <node index="0" text="n1" resource-id="com.example:id/n1" class="TextView" package="com.example" content-desc="" clickable="true" bounds="[0,0][1080,100]" />
    <node index="1" text="n2" resource-id="com.example:id/n2" class="TextView" package="com.example" content-desc="" clickable="true" bounds="[0,100][1080,200]" />
  </node>
  <node index="1" text="" resource-id="android:id/statusBarBackground" class="View" package="com.example" content-desc="" clickable="false" bounds="[0,0][1080,63]" />
</hierarchy>"#;

/// A hierarchy with a permission dialog over the fixture screen.
pub const HIERARCHY_WITH_DIALOG: &str = r#"<?xml version='1.0' encoding='UTF-8' standalone='yes' ?>
<hierarchy rotation="0">
  <node index="0" text="" resource-id="" class="android.widget.FrameLayout" package="com.android.permissioncontroller" content-desc="" bounds="[0,0][1080,1920]">
    <node index="0" text="Allow access?" resource-id="com.android.permissioncontroller:id/message" class="android.widget.TextView" package="com.android.permissioncontroller" content-desc="" bounds="[100,800][980,900]" />
    <node index="1" text="Allow" resource-id="com.android.permissioncontroller:id/allow" class="android.widget.Button" package="com.android.permissioncontroller" content-desc="" clickable="true" bounds="[100,1000][500,1100]" />
    <node index="2" text="Deny" resource-id="com.android.permissioncontroller:id/deny" class="android.widget.Button" package="com.android.permissioncontroller" content-desc="" clickable="true" bounds="[580,1000][980,1100]" />
  </node>
</hierarchy>"#;

// ---------------------------------------------------------------------------
// MockTransport
// ---------------------------------------------------------------------------

/// Scripted [`JsonRpcTransport`].
///
/// Each call pops the next scripted result for its method; with none left it
/// returns the method's default, `dumpWindowHierarchy` returns the current
/// hierarchy, and anything else returns `true`. While the shared `alive`
/// flag is off every request fails like a refused connection.
pub struct MockTransport {
    alive: Arc<AtomicBool>,
    scripted: Mutex<HashMap<String, VecDeque<Result<Value, RpcError>>>>,
    defaults: Mutex<HashMap<String, Value>>,
    hierarchy: Mutex<String>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl MockTransport {
    pub fn new(alive: Arc<AtomicBool>) -> Self {
        Self {
            alive,
            scripted: Mutex::new(HashMap::new()),
            defaults: Mutex::new(HashMap::from([(
                "deviceInfo".to_string(),
                json!({"displayWidth": 1080, "displayHeight": 1920, "displayRotation": 0}),
            )])),
            hierarchy: Mutex::new(HIERARCHY.to_string()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queues one result for the next call of `method`.
    pub fn script(&self, method: &str, result: Result<Value, RpcError>) {
        self.scripted
            .lock()
            .unwrap()
            .entry(method.to_string())
            .or_default()
            .push_back(result);
    }

    /// Sets what `method` returns once its script is used up.
    pub fn set_default(&self, method: &str, value: Value) {
        self.defaults.lock().unwrap().insert(method.to_string(), value);
    }

    pub fn set_hierarchy(&self, xml: &str) {
        *self.hierarchy.lock().unwrap() = xml.to_string();
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }

    /// Params of every call of `method`, in order.
    pub fn calls_to(&self, method: &str) -> Vec<Value> {
        self.calls()
            .into_iter()
            .filter(|(m, _)| m == method)
            .map(|(_, params)| params)
            .collect()
    }
}

#[async_trait]
impl JsonRpcTransport for MockTransport {
    async fn call(&self, method: &str, params: Value, _timeout: Duration) -> Result<Value, RpcError> {
        self.calls
            .lock()
            .unwrap()
            .push((method.to_string(), params));
        if let Some(result) = self
            .scripted
            .lock()
            .unwrap()
            .get_mut(method)
            .and_then(VecDeque::pop_front)
        {
            return result;
        }
        if !self.alive.load(Ordering::SeqCst) {
            return Err(RpcError::Http("connection refused".into()));
        }
        if let Some(value) = self.defaults.lock().unwrap().get(method) {
            return Ok(value.clone());
        }
        if method == "dumpWindowHierarchy" {
            return Ok(Value::String(self.hierarchy.lock().unwrap().clone()));
        }
        Ok(Value::Bool(true))
    }

    async fn get(&self, path: &str, _timeout: Duration) -> Result<String, RpcError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(RpcError::Http("connection refused".into()));
        }
        match path {
            "/ping" => Ok("pong".into()),
            _ => Ok(String::new()),
        }
    }
}

// ---------------------------------------------------------------------------
// MockAdb
// ---------------------------------------------------------------------------

/// Instrumentation process stand-in that reports fixed output.
pub struct MockShell {
    output: String,
    running: AtomicBool,
}

#[async_trait]
impl ShellProcess for MockShell {
    fn output(&self) -> String {
        self.output.clone()
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn kill(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Recording [`AdbDevice`].
///
/// `spawn_shell` plays the next scripted launch output; a launch with no
/// failure in its output brings the server up. `am force-stop` takes it
/// down.
pub struct MockAdb {
    alive: Arc<AtomicBool>,
    commands: Mutex<Vec<String>>,
    launches: Mutex<VecDeque<String>>,
    spawns: AtomicUsize,
    shell_outputs: Mutex<HashMap<String, String>>,
}

impl MockAdb {
    pub fn new(alive: Arc<AtomicBool>) -> Self {
        Self {
            alive,
            commands: Mutex::new(Vec::new()),
            launches: Mutex::new(VecDeque::new()),
            spawns: AtomicUsize::new(0),
            shell_outputs: Mutex::new(HashMap::new()),
        }
    }

    /// Output of the next spawned instrumentation.
    pub fn script_launch(&self, output: &str) {
        self.launches.lock().unwrap().push_back(output.to_string());
    }

    /// Output of the shell command `command` (arguments joined by spaces).
    pub fn set_shell_output(&self, command: &str, output: &str) {
        self.shell_outputs
            .lock()
            .unwrap()
            .insert(command.to_string(), output.to_string());
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AdbDevice for MockAdb {
    fn serial(&self) -> &str {
        "mock-serial"
    }

    async fn shell(&self, args: &[&str]) -> Result<ShellOutput, AdbError> {
        let command = args.join(" ");
        self.commands.lock().unwrap().push(command.clone());
        if command.starts_with("am force-stop") {
            self.alive.store(false, Ordering::SeqCst);
        }
        let output = self
            .shell_outputs
            .lock()
            .unwrap()
            .get(&command)
            .cloned()
            .unwrap_or_default();
        Ok(ShellOutput {
            output,
            exit_code: 0,
        })
    }

    async fn push(&self, _src: &Path, _dst: &str, _mode: u32) -> Result<(), AdbError> {
        Ok(())
    }

    async fn pull(&self, _src: &str, _dst: &Path) -> Result<(), AdbError> {
        Ok(())
    }

    async fn forward_port(&self, remote: u16) -> Result<u16, AdbError> {
        Ok(remote)
    }

    async fn spawn_shell(&self, args: &[&str]) -> Result<Box<dyn ShellProcess>, AdbError> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        self.commands.lock().unwrap().push(args.join(" "));
        let output = self.launches.lock().unwrap().pop_front().unwrap_or_default();
        let failed = output.contains("INSTRUMENTATION_FAILED")
            || output.contains("does not have a signature matching");
        if !failed {
            self.alive.store(true, Ordering::SeqCst);
        }
        Ok(Box::new(MockShell {
            output,
            running: AtomicBool::new(!failed),
        }))
    }
}

// ---------------------------------------------------------------------------
// MockInstaller
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MockInstaller {
    pub outdated: AtomicBool,
    pub installs: AtomicUsize,
    pub uninstalls: AtomicUsize,
}

#[async_trait]
impl Installer for MockInstaller {
    async fn is_outdated(&self) -> Result<bool, InstallError> {
        Ok(self.outdated.load(Ordering::SeqCst))
    }

    async fn install(&self) -> Result<(), InstallError> {
        self.installs.fetch_add(1, Ordering::SeqCst);
        self.outdated.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn uninstall(&self) -> Result<(), InstallError> {
        self.uninstalls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Device fixture
// ---------------------------------------------------------------------------

/// A device wired to the mocks, with the server already answering.
pub struct Fixture {
    pub device: Device,
    pub transport: Arc<MockTransport>,
    pub adb: Arc<MockAdb>,
    pub installer: Arc<MockInstaller>,
    pub alive: Arc<AtomicBool>,
}

/// Settings with short timeouts so failing paths finish quickly.
pub fn fast_settings() -> Settings {
    Settings {
        wait_timeout: 1.0,
        launch_timeout: 1.0,
        ready_poll_interval: 0.01,
        stop_timeout: 0.2,
        xpath_poll_interval: 0.02,
        xpath_click_interval: 0.02,
        watcher_interval: 0.05,
        watcher_fast_interval: 0.01,
        watcher_stop_timeout: 1.0,
        info_retry_delay: 0.01,
        dump_retry_delay: 0.01,
        broadcast_retry_delay: 0.01,
        ..Settings::default()
    }
}

pub fn fixture() -> Fixture {
    fixture_with(fast_settings(), None)
}

pub fn fixture_with(settings: Settings, plugins: Option<PluginRegistry>) -> Fixture {
    let alive = Arc::new(AtomicBool::new(true));
    let transport = Arc::new(MockTransport::new(alive.clone()));
    let adb = Arc::new(MockAdb::new(alive.clone()));
    let installer = Arc::new(MockInstaller::default());

    let mut builder = Device::builder(adb.clone())
        .transport(transport.clone())
        .installer(installer.clone())
        .settings(settings);
    if let Some(registry) = plugins {
        builder = builder.plugins(registry);
    }
    Fixture {
        device: builder.build(),
        transport,
        adb,
        installer,
        alive,
    }
}
