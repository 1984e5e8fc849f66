//! The device session: coordinate input, keys, screen state and the entry
//! points to selectors, xpath queries and watchers.
//!
//! A [`Device`] is a cheap handle; clones share one supervisor, one
//! transport, one settings table and one watcher. Every RPC goes through
//! [`ServerSupervisor::jsonrpc_call`], so a dead automation server is
//! restarted transparently once per call.
//!
//! # Example
//!
//! ```no_run
//! use droidrive_core::device::Device;
//! use droidrive_core::selector::Selector;
//!
//! # async fn example() -> Result<(), droidrive_core::error::DeviceError> {
//! let d = Device::connect(Some("emulator-5554")).await?;
//! d.select(Selector::new().text("Settings")).click(None).await?;
//! d.xpath("%Wi-Fi%").click(None).await?;
//! # Ok(())
//! # }
//! ```

use std::any::Any;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use base64::Engine;
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use crate::adb::{AdbCli, AdbDevice, AppCurrent, ShellOutput};
use crate::config::{secs, Settings};
use crate::error::{DeviceError, Result};
use crate::geometry::{swipe_points, Direction, Point, Rect};
use crate::installer::{ApkInstaller, Installer};
use crate::jsonrpc::{HttpTransport, JsonRpcTransport, RpcError};
use crate::plugin::PluginRegistry;
use crate::prompt::{FailPrompt, PromptDecision};
use crate::selector::Selector;
use crate::supervisor::{ServerStatus, ServerSupervisor, SupervisorConfig};
use crate::ui_object::UiObject;
use crate::watcher::{Watcher, WatcherState};
use crate::xpath::{XPath, XPathSelector};

/// Swipe steps used when no duration is given; one step is about 5ms.
pub const SCROLL_STEPS: u32 = 55;

/// Converts a gesture duration in seconds into server-side steps.
pub fn duration_steps(duration: f64) -> u32 {
    ((duration * 200.0) as u32).max(2)
}

const TOUCH_DOWN: i32 = 0;
const TOUCH_UP: i32 = 1;
const TOUCH_MOVE: i32 = 2;

// ---------------------------------------------------------------------------
// Orientation
// ---------------------------------------------------------------------------

/// Display orientation as reported by `displayRotation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    Natural,
    Left,
    UpsideDown,
    Right,
}

impl Orientation {
    pub fn from_rotation(rotation: i64) -> Option<Self> {
        match rotation {
            0 => Some(Orientation::Natural),
            1 => Some(Orientation::Left),
            2 => Some(Orientation::UpsideDown),
            3 => Some(Orientation::Right),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Orientation::Natural => "natural",
            Orientation::Left => "left",
            Orientation::UpsideDown => "upsidedown",
            Orientation::Right => "right",
        }
    }
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Orientation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "n" | "natural" => Ok(Orientation::Natural),
            "l" | "left" => Ok(Orientation::Left),
            "u" | "upsidedown" => Ok(Orientation::UpsideDown),
            "r" | "right" => Ok(Orientation::Right),
            other => Err(format!("unknown orientation: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Assembles a [`Device`] from its collaborators.
///
/// Only the adb device is required; the transport defaults to HTTP through
/// an adb port forward and the installer to bundled apks in
/// `~/.droidrive/assets`.
pub struct DeviceBuilder {
    adb: Arc<dyn AdbDevice>,
    transport: Option<Arc<dyn JsonRpcTransport>>,
    installer: Option<Arc<dyn Installer>>,
    settings: Settings,
    plugins: PluginRegistry,
}

impl DeviceBuilder {
    pub fn transport(mut self, transport: Arc<dyn JsonRpcTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn installer(mut self, installer: Arc<dyn Installer>) -> Self {
        self.installer = Some(installer);
        self
    }

    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn plugins(mut self, plugins: PluginRegistry) -> Self {
        self.plugins = plugins;
        self
    }

    pub fn build(self) -> Device {
        let adb = self.adb;
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(HttpTransport::forwarded(adb.clone())));
        let installer = self
            .installer
            .unwrap_or_else(|| Arc::new(ApkInstaller::new(adb.clone())));
        let supervisor = ServerSupervisor::new(
            adb.clone(),
            transport,
            installer,
            SupervisorConfig::from_settings(&self.settings),
        );
        Device {
            inner: Arc::new(DeviceInner {
                adb,
                supervisor,
                settings: RwLock::new(self.settings),
                plugins: self.plugins,
                fail_prompt: RwLock::new(None),
                watcher: Arc::new(WatcherState::default()),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

struct DeviceInner {
    adb: Arc<dyn AdbDevice>,
    supervisor: ServerSupervisor,
    settings: RwLock<Settings>,
    plugins: PluginRegistry,
    fail_prompt: RwLock<Option<Arc<dyn FailPrompt>>>,
    watcher: Arc<WatcherState>,
}

/// A connected Android device.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

/// Non-owning handle to a [`Device`], held by background tasks.
#[derive(Clone)]
pub(crate) struct WeakDevice(Weak<DeviceInner>);

impl WeakDevice {
    pub(crate) fn upgrade(&self) -> Option<Device> {
        self.0.upgrade().map(|inner| Device { inner })
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("serial", &self.inner.adb.serial())
            .finish()
    }
}

impl Device {
    pub fn builder(adb: Arc<dyn AdbDevice>) -> DeviceBuilder {
        DeviceBuilder {
            adb,
            transport: None,
            installer: None,
            settings: Settings::default(),
            plugins: PluginRegistry::new(),
        }
    }

    /// Connects to the device with `serial`, or the only attached device.
    ///
    /// Settings are loaded from `~/.droidrive/config.json`. The automation
    /// server is started lazily by the first call that needs it.
    pub async fn connect(serial: Option<&str>) -> Result<Device> {
        let adb = match serial {
            Some(serial) => AdbCli::new(serial),
            None => AdbCli::single().await?,
        };
        Ok(Device::builder(Arc::new(adb)).settings(Settings::load()).build())
    }

    pub(crate) fn downgrade(&self) -> WeakDevice {
        WeakDevice(Arc::downgrade(&self.inner))
    }

    pub fn serial(&self) -> &str {
        self.inner.adb.serial()
    }

    pub fn adb(&self) -> &Arc<dyn AdbDevice> {
        &self.inner.adb
    }

    pub fn supervisor(&self) -> &ServerSupervisor {
        &self.inner.supervisor
    }

    // -- settings -----------------------------------------------------------

    /// A snapshot of the current settings.
    pub fn settings(&self) -> Settings {
        self.with_settings(Settings::clone)
    }

    pub(crate) fn with_settings<R>(&self, f: impl FnOnce(&Settings) -> R) -> R {
        let guard = self.inner.settings.read().unwrap_or_else(|e| e.into_inner());
        f(&guard)
    }

    /// Sets one setting by name. See [`Settings::set`].
    pub fn set_setting(&self, key: &str, value: Value) -> Result<()> {
        let mut guard = self.inner.settings.write().unwrap_or_else(|e| e.into_inner());
        guard.set(key, value)?;
        Ok(())
    }

    /// Sets the default wait timeout when `seconds` is given and returns
    /// the value in effect.
    pub fn implicitly_wait(&self, seconds: Option<f64>) -> f64 {
        let mut guard = self.inner.settings.write().unwrap_or_else(|e| e.into_inner());
        if let Some(seconds) = seconds {
            guard.wait_timeout = seconds;
        }
        guard.wait_timeout
    }

    pub fn wait_timeout(&self) -> Duration {
        self.with_settings(Settings::wait_timeout)
    }

    // -- extensions ---------------------------------------------------------

    /// Returns the plugin registered as `name`, building it on first use.
    pub fn plugin<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>> {
        self.inner.plugins.resolve(name, self)
    }

    /// Installs or removes the prompt consulted when a click target is not found.
    pub fn set_fail_prompt(&self, prompt: Option<Arc<dyn FailPrompt>>) {
        *self.inner.fail_prompt.write().unwrap_or_else(|e| e.into_inner()) = prompt;
    }

    /// Hands a not-found error to the fail prompt, if one is installed.
    ///
    /// Returns the decision for `Retry` and `Skip`; `Abort`, a missing
    /// prompt or any other error kind come back as an error.
    pub(crate) async fn consult_fail_prompt(&self, err: DeviceError) -> Result<PromptDecision> {
        let prompt = self
            .inner
            .fail_prompt
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match prompt {
            Some(prompt) if err.is_not_found() => match prompt.ask(&err.to_string()).await {
                PromptDecision::Abort => Err(DeviceError::Aborted(err.to_string())),
                decision => {
                    debug!(?decision, "fail prompt answered");
                    Ok(decision)
                }
            },
            _ => Err(err),
        }
    }

    // -- entry points -------------------------------------------------------

    /// A lazily resolved UI object for `selector`.
    pub fn select(&self, selector: Selector) -> UiObject {
        UiObject::new(self.clone(), selector)
    }

    /// The xpath engine bound to this device.
    pub fn xpath_engine(&self) -> XPath {
        XPath::new(self.clone())
    }

    /// Shorthand for `xpath_engine().select(xpath)`.
    pub fn xpath(&self, xpath: &str) -> XPathSelector {
        self.xpath_engine().select(xpath)
    }

    pub fn watcher(&self) -> Watcher {
        Watcher::new(self.clone(), self.inner.watcher.clone())
    }

    // -- server -------------------------------------------------------------

    pub async fn start_server(&self) -> Result<()> {
        Ok(self.inner.supervisor.start().await?)
    }

    pub async fn stop_server(&self) {
        self.inner.supervisor.stop().await
    }

    pub async fn server_alive(&self) -> bool {
        self.inner.supervisor.is_alive().await
    }

    pub async fn server_status(&self) -> ServerStatus {
        self.inner.supervisor.status().await
    }

    /// Calls `method` with the default HTTP timeout.
    pub async fn jsonrpc(&self, method: &str, params: Value) -> Result<Value> {
        let timeout = self.with_settings(|s| secs(s.http_timeout));
        self.jsonrpc_with_timeout(method, params, timeout).await
    }

    pub async fn jsonrpc_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        Ok(self
            .inner
            .supervisor
            .jsonrpc_call(method, params, timeout)
            .await?)
    }

    // -- state --------------------------------------------------------------

    /// Raw `deviceInfo` as returned by the server.
    pub async fn info(&self) -> Result<Value> {
        self.jsonrpc("deviceInfo", json!([])).await
    }

    /// Display size in pixels for the current rotation.
    pub async fn window_size(&self) -> Result<(i32, i32)> {
        let info = self.info().await?;
        let dim = |key: &str| info.get(key).and_then(Value::as_i64).map(|v| v as i32);
        match (dim("displayWidth"), dim("displayHeight")) {
            (Some(w), Some(h)) if w > 0 && h > 0 => Ok((w, h)),
            _ => {
                debug!("deviceInfo has no display size, asking wm");
                Ok(self.inner.adb.window_size().await?)
            }
        }
    }

    /// The hierarchy XML of the current screen.
    ///
    /// A null pointer from the server, which happens while windows animate,
    /// is retried `dump_retry_tries` times.
    #[instrument(skip(self), level = "debug")]
    pub async fn dump_hierarchy(&self, compressed: bool) -> Result<String> {
        let (tries, delay) =
            self.with_settings(|s| (s.dump_retry_tries.max(1), secs(s.dump_retry_delay)));
        let mut attempt = 1;
        loop {
            match self
                .jsonrpc("dumpWindowHierarchy", json!([compressed, null]))
                .await
            {
                Ok(Value::String(xml)) => return Ok(xml),
                Ok(other) => return Err(unexpected("dumpWindowHierarchy", &other)),
                Err(DeviceError::Rpc(RpcError::NullPointer(msg))) if attempt < tries => {
                    debug!(attempt, %msg, "dump hit a null pointer, retrying");
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Screenshot as JPEG bytes.
    pub async fn screenshot(&self) -> Result<Vec<u8>> {
        let value = self.jsonrpc("takeScreenshot", json!([1, 80])).await?;
        let encoded = value
            .as_str()
            .ok_or_else(|| unexpected("takeScreenshot", &value))?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| DeviceError::UnexpectedResponse {
                method: "takeScreenshot".into(),
                value: e.to_string(),
            })
    }

    pub async fn app_current(&self) -> Result<AppCurrent> {
        Ok(self.inner.adb.app_current().await?)
    }

    pub async fn shell(&self, args: &[&str]) -> Result<ShellOutput> {
        Ok(self.inner.adb.shell(args).await?)
    }

    pub async fn orientation(&self) -> Result<Orientation> {
        let info = self.info().await?;
        info.get("displayRotation")
            .and_then(Value::as_i64)
            .and_then(Orientation::from_rotation)
            .ok_or_else(|| unexpected("deviceInfo", &info))
    }

    pub async fn set_orientation(&self, orientation: Orientation) -> Result<()> {
        self.jsonrpc("setOrientation", json!([orientation.as_str()])).await?;
        Ok(())
    }

    pub async fn freeze_rotation(&self, freeze: bool) -> Result<()> {
        self.jsonrpc("freezeRotation", json!([freeze])).await?;
        Ok(())
    }

    // -- keys and screen ----------------------------------------------------

    /// Presses a named key such as `home`, `back` or `enter`.
    pub async fn press(&self, key: &str) -> Result<()> {
        self.jsonrpc("pressKey", json!([key])).await?;
        Ok(())
    }

    pub async fn press_keycode(&self, code: i32, meta: Option<i32>) -> Result<()> {
        let params = match meta {
            Some(meta) => json!([code, meta]),
            None => json!([code]),
        };
        self.jsonrpc("pressKeyCode", params).await?;
        Ok(())
    }

    pub async fn screen_on(&self) -> Result<()> {
        self.jsonrpc("wakeUp", json!([])).await?;
        Ok(())
    }

    pub async fn screen_off(&self) -> Result<()> {
        self.jsonrpc("sleep", json!([])).await?;
        Ok(())
    }

    pub async fn open_notification(&self) -> Result<()> {
        self.jsonrpc("openNotification", json!([])).await?;
        Ok(())
    }

    pub async fn open_quick_settings(&self) -> Result<()> {
        self.jsonrpc("openQuickSettings", json!([])).await?;
        Ok(())
    }

    // -- coordinates --------------------------------------------------------

    /// Resolves fractional coordinates (`< 1.0`) against the window size.
    pub async fn rel_to_abs(&self, x: f64, y: f64) -> Result<Point> {
        if x >= 1.0 && y >= 1.0 {
            return Ok(Point::new(x as i32, y as i32));
        }
        let (w, h) = self.window_size().await?;
        let x = if x < 1.0 { x * w as f64 } else { x };
        let y = if y < 1.0 { y * h as f64 } else { y };
        Ok(Point::new(x as i32, y as i32))
    }

    /// Taps at `(x, y)` and then sleeps `post_delay`.
    pub async fn click(&self, x: f64, y: f64) -> Result<()> {
        let p = self.rel_to_abs(x, y).await?;
        self.click_point(p).await
    }

    pub(crate) async fn click_point(&self, p: Point) -> Result<()> {
        debug!(x = p.x, y = p.y, "click");
        self.jsonrpc("click", json!([p.x, p.y])).await?;
        let delay = self.with_settings(|s| secs(s.post_delay));
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    pub async fn double_click(&self, x: f64, y: f64, interval: f64) -> Result<()> {
        let p = self.rel_to_abs(x, y).await?;
        self.touch_down(p).await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.touch_up(p).await?;
        tokio::time::sleep(secs(interval)).await;
        self.click_point(p).await
    }

    /// Presses at `(x, y)` for `duration` seconds.
    pub async fn long_click(&self, x: f64, y: f64, duration: f64) -> Result<()> {
        let p = self.rel_to_abs(x, y).await?;
        self.long_click_point(p, duration).await
    }

    pub(crate) async fn long_click_point(&self, p: Point, duration: f64) -> Result<()> {
        self.touch_down(p).await?;
        tokio::time::sleep(secs(duration)).await;
        self.touch_up(p).await
    }

    pub async fn touch_down(&self, p: Point) -> Result<()> {
        self.inject_touch(TOUCH_DOWN, p).await
    }

    pub async fn touch_move(&self, p: Point) -> Result<()> {
        self.inject_touch(TOUCH_MOVE, p).await
    }

    pub async fn touch_up(&self, p: Point) -> Result<()> {
        self.inject_touch(TOUCH_UP, p).await
    }

    async fn inject_touch(&self, action: i32, p: Point) -> Result<()> {
        self.jsonrpc("injectInputEvent", json!([action, p.x, p.y, 0])).await?;
        Ok(())
    }

    /// Swipes from `(fx, fy)` to `(tx, ty)` in `steps` server-side steps.
    pub async fn swipe(&self, fx: f64, fy: f64, tx: f64, ty: f64, steps: u32) -> Result<()> {
        let from = self.rel_to_abs(fx, fy).await?;
        let to = self.rel_to_abs(tx, ty).await?;
        self.swipe_between(from, to, steps).await
    }

    pub(crate) async fn swipe_between(&self, from: Point, to: Point, steps: u32) -> Result<()> {
        debug!(?from, ?to, steps, "swipe");
        self.jsonrpc("swipe", json!([from.x, from.y, to.x, to.y, steps.max(2)]))
            .await?;
        Ok(())
    }

    /// Swipes through a polyline of points over `duration` seconds.
    pub async fn swipe_points(&self, points: &[(f64, f64)], duration: f64) -> Result<()> {
        let mut flat = Vec::with_capacity(points.len() * 2);
        for &(x, y) in points {
            let p = self.rel_to_abs(x, y).await?;
            flat.push(p.x);
            flat.push(p.y);
        }
        self.jsonrpc("swipePoints", json!([flat, duration_steps(duration)]))
            .await?;
        Ok(())
    }

    pub async fn drag(&self, sx: f64, sy: f64, ex: f64, ey: f64, duration: f64) -> Result<()> {
        let from = self.rel_to_abs(sx, sy).await?;
        let to = self.rel_to_abs(ex, ey).await?;
        self.jsonrpc(
            "drag",
            json!([from.x, from.y, to.x, to.y, duration_steps(duration)]),
        )
        .await?;
        Ok(())
    }

    /// Swipes `scale` of the screen, or of `bounds`, in `direction`.
    pub async fn swipe_ext(&self, direction: Direction, scale: f64, bounds: Option<Rect>) -> Result<()> {
        let bounds = match bounds {
            Some(b) => b,
            None => {
                let (w, h) = self.window_size().await?;
                Rect::new(0, 0, w, h)
            }
        };
        let (from, to) = swipe_points(&bounds, direction, scale);
        self.swipe_between(from, to, SCROLL_STEPS).await
    }
}

pub(crate) fn unexpected(method: &str, value: &Value) -> DeviceError {
    warn!(method, %value, "unexpected response");
    DeviceError::UnexpectedResponse {
        method: method.to_string(),
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_from_duration() {
        assert_eq!(duration_steps(0.5), 100);
        assert_eq!(duration_steps(0.0), 2);
    }

    #[test]
    fn orientation_names() {
        assert_eq!(Orientation::from_rotation(1), Some(Orientation::Left));
        assert_eq!(Orientation::from_rotation(9), None);
        assert_eq!("u".parse::<Orientation>(), Ok(Orientation::UpsideDown));
        assert_eq!(Orientation::Right.to_string(), "right");
        assert!("sideways".parse::<Orientation>().is_err());
    }
}
