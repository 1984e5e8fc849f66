//! Popup watchers.
//!
//! A watcher holds an ordered list of rules. Each rule is a chain of xpath
//! conditions plus a callback; a rule fires when every condition matches
//! the same hierarchy snapshot. A scan fires at most one rule, the first
//! registered one that matches.
//!
//! Scans run either on demand ([`Watcher::run`], also used by
//! [`XPath::click`](crate::xpath::XPath::click) with `watch`) or from a
//! background task started with [`Watcher::start`].
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use droidrive_core::device::Device;
//!
//! # async fn example() -> Result<(), droidrive_core::error::DeviceError> {
//! let d = Device::connect(None).await?;
//! let w = d.watcher();
//! w.named("allow").when("%Allow%").click()?;
//! w.when("//*[@text='Update available']").when("Later").click()?;
//! w.start(Some(Duration::from_secs(2)));
//!
//! // ... drive the app ...
//!
//! w.stop().await;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, info, warn, Instrument};

use crate::config::secs;
use crate::device::{Device, WeakDevice};
use crate::error::Result;
use crate::xpath::{PageSource, XPathError, XPathSelector};

/// What a firing rule's callback gets to work with.
pub struct WatcherContext {
    pub device: Device,
    /// The last condition of the rule, bound to `source`.
    pub selector: XPathSelector,
    /// The snapshot the rule matched against.
    pub source: PageSource,
}

/// Callback run when a rule fires.
#[async_trait]
pub trait WatchCallback: Send + Sync {
    async fn call(&self, ctx: WatcherContext) -> Result<()>;
}

#[async_trait]
impl<F, Fut> WatchCallback for F
where
    F: Fn(WatcherContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn call(&self, ctx: WatcherContext) -> Result<()> {
        self(ctx).await
    }
}

#[derive(Clone)]
struct Rule {
    name: String,
    xpaths: Vec<String>,
    callback: Arc<dyn WatchCallback>,
}

/// One rule firing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggerRecord {
    pub name: String,
    pub xpaths: Vec<String>,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Background task handle
// ---------------------------------------------------------------------------

/// Handle for controlling a running background watcher.
pub struct WatcherHandle {
    cancel_token: CancellationToken,
    join_handle: JoinHandle<()>,
}

impl WatcherHandle {
    /// Stops the watcher, waiting at most `timeout`.
    ///
    /// Returns `false` if the task had not finished in time; it is aborted
    /// in that case.
    pub async fn stop_within(self, timeout: Duration) -> bool {
        self.cancel_token.cancel();
        let abort = self.join_handle.abort_handle();
        match tokio::time::timeout(timeout, self.join_handle).await {
            Ok(_) => true,
            Err(_) => {
                abort.abort();
                false
            }
        }
    }

    /// Returns whether the watcher is still running.
    pub fn is_running(&self) -> bool {
        !self.join_handle.is_finished()
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Per-device watcher state, shared by every [`Watcher`] handle.
#[derive(Default)]
pub(crate) struct WatcherState {
    rules: Mutex<Vec<Rule>>,
    /// Held for the duration of a scan, callbacks included.
    scan_lock: tokio::sync::Mutex<()>,
    triggering: AtomicBool,
    handle: Mutex<Option<WatcherHandle>>,
    history: Mutex<Vec<TriggerRecord>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// Watcher
// ---------------------------------------------------------------------------

/// Handle to the device's watcher rules and background task.
#[derive(Clone)]
pub struct Watcher {
    device: Device,
    state: Arc<WatcherState>,
}

impl fmt::Debug for Watcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = lock(&self.state.rules).iter().map(|r| r.name.clone()).collect();
        f.debug_struct("Watcher")
            .field("rules", &names)
            .field("running", &self.running())
            .finish()
    }
}

impl Watcher {
    pub(crate) fn new(device: Device, state: Arc<WatcherState>) -> Self {
        Self { device, state }
    }

    /// Starts a rule with an explicit name.
    pub fn named(&self, name: impl Into<String>) -> WatchRule {
        WatchRule {
            watcher: self.clone(),
            name: Some(name.into()),
            xpaths: Vec::new(),
        }
    }

    /// Starts an unnamed rule with its first condition.
    pub fn when(&self, xpath: impl Into<String>) -> WatchRule {
        WatchRule {
            watcher: self.clone(),
            name: None,
            xpaths: vec![xpath.into()],
        }
    }

    /// Names of the registered rules, in order.
    pub fn names(&self) -> Vec<String> {
        lock(&self.state.rules).iter().map(|r| r.name.clone()).collect()
    }

    /// Removes the rules called `name`, or every rule.
    pub fn remove(&self, name: Option<&str>) {
        let mut rules = lock(&self.state.rules);
        match name {
            Some(name) => rules.retain(|r| r.name != name),
            None => rules.clear(),
        }
    }

    /// Removes every rule and forgets the trigger history.
    pub fn reset(&self) {
        self.remove(None);
        lock(&self.state.history).clear();
        self.state.triggering.store(false, Ordering::SeqCst);
    }

    /// `true` while a callback is executing.
    pub fn triggering(&self) -> bool {
        self.state.triggering.load(Ordering::SeqCst)
    }

    /// `true` while the background task is alive.
    pub fn running(&self) -> bool {
        lock(&self.state.handle)
            .as_ref()
            .is_some_and(WatcherHandle::is_running)
    }

    /// Every rule firing so far, oldest first.
    pub fn triggered(&self) -> Vec<TriggerRecord> {
        lock(&self.state.history).clone()
    }

    /// Scans once against `source`, or a fresh hierarchy.
    ///
    /// Returns `true` if a rule fired. A scan that starts while another is
    /// in progress, including one started from inside a callback, returns
    /// `false` without doing anything. Callback errors are logged, not
    /// returned.
    pub async fn run(&self, source: Option<PageSource>) -> Result<bool> {
        let Ok(_guard) = self.state.scan_lock.try_lock() else {
            debug!("watcher scan already in progress");
            return Ok(false);
        };
        let rules = lock(&self.state.rules).clone();
        if rules.is_empty() {
            return Ok(false);
        }

        let engine = self.device.xpath_engine();
        let source = match source {
            Some(source) => source,
            None => engine.get_page_source().await?,
        };
        let xpaths: Vec<String> = rules
            .iter()
            .flat_map(|rule| &rule.xpaths)
            .filter_map(|xpath| engine.strict(xpath).ok())
            .collect();
        source.prefetch(&xpaths)?;

        for rule in rules {
            let mut last = None;
            for xpath in &rule.xpaths {
                let selector = engine.select_in(xpath, source.clone());
                if !selector.exists().await? {
                    last = None;
                    break;
                }
                last = Some(selector);
            }
            let Some(selector) = last else {
                continue;
            };

            info!(watcher = %rule.name, "watcher triggered");
            self.state.triggering.store(true, Ordering::SeqCst);
            let result = rule
                .callback
                .call(WatcherContext {
                    device: self.device.clone(),
                    selector,
                    source: source.clone(),
                })
                .await;
            self.state.triggering.store(false, Ordering::SeqCst);
            if let Err(e) = result {
                warn!(watcher = %rule.name, error = %e, "watcher callback failed");
            }
            lock(&self.state.history).push(TriggerRecord {
                name: rule.name,
                xpaths: rule.xpaths,
                at: Utc::now(),
            });
            return Ok(true);
        }
        Ok(false)
    }

    /// Starts scanning in the background every `interval`, or
    /// `watcher_interval` when `None`.
    ///
    /// After a rule fires the next scan comes after `watcher_fast_interval`
    /// instead, to catch dialogs that open one after another.
    pub fn start(&self, interval: Option<Duration>) {
        let mut handle = lock(&self.state.handle);
        if handle.as_ref().is_some_and(WatcherHandle::is_running) {
            warn!("watcher already started");
            return;
        }
        let (default_interval, fast) = self
            .device
            .with_settings(|s| (secs(s.watcher_interval), secs(s.watcher_fast_interval)));
        let interval = interval.unwrap_or(default_interval);

        let cancel_token = CancellationToken::new();
        let token_clone = cancel_token.clone();
        let device = self.device.downgrade();
        let state = Arc::clone(&self.state);
        let join_handle = tokio::spawn(async move {
            run_loop(device, state, interval, fast, token_clone).await;
        });
        debug!(?interval, "watcher started");
        *handle = Some(WatcherHandle {
            cancel_token,
            join_handle,
        });
    }

    /// Stops the background task, waiting at most `watcher_stop_timeout`.
    ///
    /// The watcher can be started again afterwards.
    pub async fn stop(&self) {
        let Some(handle) = lock(&self.state.handle).take() else {
            return;
        };
        let timeout = self.device.with_settings(|s| secs(s.watcher_stop_timeout));
        if !handle.stop_within(timeout).await {
            warn!(?timeout, "watcher did not stop in time, aborted");
        }
    }

    fn register(&self, rule: Rule) -> Result<()> {
        if rule.xpaths.is_empty() {
            return Err(XPathError::Invalid(format!("watcher {} has no condition", rule.name)).into());
        }
        let engine = self.device.xpath_engine();
        for xpath in &rule.xpaths {
            engine.strict(xpath)?;
        }
        debug!(watcher = %rule.name, "watcher rule added");
        lock(&self.state.rules).push(rule);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Rule builder
// ---------------------------------------------------------------------------

/// A rule under construction; finish it with [`call`](Self::call),
/// [`click`](Self::click) or [`press`](Self::press).
#[derive(Debug, Clone)]
pub struct WatchRule {
    watcher: Watcher,
    name: Option<String>,
    xpaths: Vec<String>,
}

impl WatchRule {
    /// Adds a condition. All conditions must match the same snapshot.
    pub fn when(mut self, xpath: impl Into<String>) -> Self {
        self.xpaths.push(xpath.into());
        self
    }

    /// Registers the rule with `callback`.
    ///
    /// # Errors
    ///
    /// Fails if the rule has no condition or a condition is not a valid
    /// xpath.
    pub fn call(self, callback: impl WatchCallback + 'static) -> Result<()> {
        let name = self.name.unwrap_or_else(|| rule_name(&self.xpaths));
        self.watcher.register(Rule {
            name,
            xpaths: self.xpaths,
            callback: Arc::new(callback),
        })
    }

    /// Registers the rule to click the element matched by the last condition.
    pub fn click(self) -> Result<()> {
        self.call(|ctx: WatcherContext| async move {
            ctx.selector.get_last_match().await?.click().await
        })
    }

    /// Registers the rule to press `key`.
    pub fn press(self, key: impl Into<String>) -> Result<()> {
        let key = key.into();
        self.call(move |ctx: WatcherContext| {
            let key = key.clone();
            async move { ctx.device.press(&key).await }
        })
    }
}

/// Background scan loop.
///
/// The device is held weakly: once every [`Device`] handle is dropped the
/// loop ends on its next tick, even if [`Watcher::stop`] was never called.
async fn run_loop(
    device: WeakDevice,
    state: Arc<WatcherState>,
    interval: Duration,
    fast: Duration,
    cancel_token: CancellationToken,
) {
    let mut wait = interval;
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                break;
            }
            _ = tokio::time::sleep(wait) => {
                let Some(device) = device.upgrade() else {
                    debug!("device dropped");
                    break;
                };
                let watcher = Watcher::new(device, Arc::clone(&state));
                let fired = {
                    let span = debug_span!("watcher_poll");
                    watcher.run(None).instrument(span).await
                };
                wait = match fired {
                    Ok(true) => fast.min(interval),
                    Ok(false) => interval,
                    Err(e) => {
                        debug!(error = %e, "watcher scan failed");
                        interval
                    }
                };
            }
        }
    }
    debug!("watcher stopped");
}

fn rule_name(xpaths: &[String]) -> String {
    xpaths.join(" && ")
}
