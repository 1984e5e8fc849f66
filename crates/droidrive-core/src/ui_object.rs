//! Lazily resolved UI objects.
//!
//! A [`UiObject`] is a device handle plus a query. It never caches what the
//! query matched: every accessor and every verb resolves it again on the
//! server, so consecutive calls may see different screens.
//!
//! Verbs that act on the element first wait for it to exist (the wait
//! budget defaults to the device's `wait_timeout`), then compute a point
//! from its bounds and dispatch the input through the device.

use std::fmt;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::{secs, MAX_WAIT};
use crate::device::{duration_steps, unexpected, Device, SCROLL_STEPS};
use crate::error::{DeviceError, Result};
use crate::geometry::{Direction, Point, Rect};
use crate::jsonrpc::RpcError;
use crate::prompt::PromptDecision;
use crate::selector::{Property, Selector};

/// Extra HTTP budget on top of a server-side wait.
const WAIT_HTTP_SLACK: Duration = Duration::from_secs(10);

/// What a [`UiObject`] refers to on the server.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Selector(Selector),
    /// A server-side object name returned by the `childBy*` calls.
    Named(String),
}

impl Target {
    fn to_json(&self) -> Value {
        match self {
            Target::Selector(s) => s.to_json(),
            Target::Named(name) => json!(name),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Selector(s) => s.fmt(f),
            Target::Named(name) => write!(f, "UiObject {name}"),
        }
    }
}

/// Where [`UiObject::drag_to`] drops the object.
#[derive(Debug, Clone)]
pub enum DragTarget {
    /// Screen coordinates; values below 1.0 are fractions of the window.
    Point(f64, f64),
    /// The center of the first object matching the selector.
    Selector(Selector),
}

/// A UI element query bound to a device.
#[derive(Debug, Clone)]
pub struct UiObject {
    device: Device,
    target: Target,
}

impl fmt::Display for UiObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.target.fmt(f)
    }
}

impl UiObject {
    pub fn new(device: Device, selector: Selector) -> Self {
        Self {
            device,
            target: Target::Selector(selector),
        }
    }

    fn named(device: Device, name: String) -> Self {
        Self {
            device,
            target: Target::Named(name),
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// The selector, unless this object came from a `childBy*` call.
    pub fn selector(&self) -> Option<&Selector> {
        match &self.target {
            Target::Selector(s) => Some(s),
            Target::Named(_) => None,
        }
    }

    fn require_selector(&self, operation: &str) -> Result<&Selector> {
        self.selector().ok_or_else(|| {
            DeviceError::Unsupported(format!("{operation} on {}", self.target))
        })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        self.device.jsonrpc(method, params).await
    }

    async fn call_bool(&self, method: &str, params: Value) -> Result<bool> {
        let value = self.call(method, params).await?;
        value.as_bool().ok_or_else(|| unexpected(method, &value))
    }

    fn not_found(&self) -> DeviceError {
        DeviceError::UiObjectNotFound {
            selector: self.target.to_string(),
        }
    }

    // -- state --------------------------------------------------------------

    /// `true` if the object is on screen right now.
    pub async fn exists(&self) -> Result<bool> {
        self.call_bool("exist", json!([self.target.to_json()])).await
    }

    /// The server's `objInfo` for the object.
    ///
    /// Retried `info_retry_tries` times while the object is not found.
    pub async fn info(&self) -> Result<Value> {
        let (tries, delay) = self
            .device
            .with_settings(|s| (s.info_retry_tries.max(1), secs(s.info_retry_delay)));
        let mut attempt = 1;
        loop {
            match self.call("objInfo", json!([self.target.to_json()])).await {
                Err(DeviceError::Rpc(RpcError::UiObjectNotFound { .. })) if attempt < tries => {
                    debug!(attempt, target = %self.target, "objInfo not found, retrying");
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    /// Visible bounds, or the full bounds when the server reports none.
    pub async fn bounds(&self) -> Result<Rect> {
        let info = self.info().await?;
        info.get("visibleBounds")
            .and_then(Rect::from_json)
            .or_else(|| info.get("bounds").and_then(Rect::from_json))
            .ok_or_else(|| unexpected("objInfo", &info))
    }

    /// Point at `offset` fractions of the bounds; `(0.5, 0.5)` is the center.
    pub async fn center(&self, offset: Option<(f64, f64)>) -> Result<Point> {
        let (xoff, yoff) = offset.unwrap_or((0.5, 0.5));
        let b = self.bounds().await?;
        Ok(Point::new(
            (b.left as f64 + b.width() as f64 * xoff) as i32,
            (b.top as f64 + b.height() as f64 * yoff) as i32,
        ))
    }

    pub async fn count(&self) -> Result<usize> {
        let selector = self.require_selector("count")?;
        let value = self.call("count", json!([selector.to_json()])).await?;
        value
            .as_u64()
            .map(|n| n as usize)
            .ok_or_else(|| unexpected("count", &value))
    }

    // -- waiting ------------------------------------------------------------

    /// Waits until the object exists (`exists == true`) or is gone.
    ///
    /// The wait runs on the server. If the HTTP request itself times out,
    /// the result falls back to a single existence check.
    pub async fn wait(&self, exists: bool, timeout: Option<Duration>) -> Result<bool> {
        let timeout = timeout
            .unwrap_or_else(|| self.device.wait_timeout())
            .min(MAX_WAIT);
        let method = if exists { "waitForExists" } else { "waitUntilGone" };
        let params = json!([self.target.to_json(), timeout.as_millis() as u64]);
        let http_timeout = timeout.saturating_add(WAIT_HTTP_SLACK).min(MAX_WAIT);
        match self
            .device
            .jsonrpc_with_timeout(method, params, http_timeout)
            .await
        {
            Ok(value) => value.as_bool().ok_or_else(|| unexpected(method, &value)),
            Err(DeviceError::Rpc(RpcError::Timeout(after))) => {
                warn!(method, ?after, "wait read timeout, checking existence once");
                let found = self.exists().await?;
                Ok(found == exists)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn wait_gone(&self, timeout: Option<Duration>) -> Result<bool> {
        self.wait(false, timeout).await
    }

    /// Like [`wait`](Self::wait) but fails with
    /// [`DeviceError::UiObjectNotFound`] when the wait does.
    pub async fn must_wait(&self, exists: bool, timeout: Option<Duration>) -> Result<()> {
        if self.wait(exists, timeout).await? {
            Ok(())
        } else {
            Err(self.not_found())
        }
    }

    /// Waits for the object, consulting the fail prompt when it is missing.
    ///
    /// Returns `false` if the prompt chose to skip.
    async fn wait_for_action(&self, timeout: Option<Duration>) -> Result<bool> {
        loop {
            match self.must_wait(true, timeout).await {
                Ok(()) => return Ok(true),
                Err(e) => match self.device.consult_fail_prompt(e).await? {
                    PromptDecision::Retry => continue,
                    _ => return Ok(false),
                },
            }
        }
    }

    // -- clicks -------------------------------------------------------------

    /// Waits for the object and taps its center.
    pub async fn click(&self, timeout: Option<Duration>) -> Result<()> {
        self.click_offset(timeout, (0.5, 0.5)).await
    }

    /// Waits for the object and taps at `offset` fractions of its bounds.
    pub async fn click_offset(&self, timeout: Option<Duration>, offset: (f64, f64)) -> Result<()> {
        if !self.wait_for_action(timeout).await? {
            return Ok(());
        }
        let p = self.center(Some(offset)).await?;
        self.device.click_point(p).await
    }

    /// Taps the object if it is there within `timeout`; returns whether it was.
    pub async fn click_exists(&self, timeout: Option<Duration>) -> Result<bool> {
        match self.must_wait(true, Some(timeout.unwrap_or(Duration::ZERO))).await {
            Ok(()) => {}
            Err(DeviceError::UiObjectNotFound { .. }) => return Ok(false),
            Err(e) => return Err(e),
        }
        let p = self.center(None).await?;
        self.device.click_point(p).await?;
        Ok(true)
    }

    /// Taps until the object disappears; returns whether it did.
    pub async fn click_gone(&self, max_retry: u32, interval: Duration) -> Result<bool> {
        self.click_exists(None).await?;
        for _ in 0..max_retry {
            tokio::time::sleep(interval).await;
            if !self.exists().await? {
                return Ok(true);
            }
            self.click_exists(None).await?;
        }
        Ok(false)
    }

    /// Presses the center for `duration` seconds.
    pub async fn long_click(&self, duration: f64, timeout: Option<Duration>) -> Result<()> {
        if !self.wait_for_action(timeout).await? {
            return Ok(());
        }
        let p = self.center(None).await?;
        self.device.long_click_point(p, duration).await
    }

    // -- gestures -----------------------------------------------------------

    /// Drags the object to a point or onto another object.
    pub async fn drag_to(
        &self,
        target: DragTarget,
        duration: f64,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        self.must_wait(true, timeout).await?;
        let steps = duration_steps(duration);
        let params = match target {
            DragTarget::Point(x, y) => {
                let p = self.device.rel_to_abs(x, y).await?;
                json!([self.target.to_json(), p.x, p.y, steps])
            }
            DragTarget::Selector(other) => json!([self.target.to_json(), other.to_json(), steps]),
        };
        self.call_bool("dragTo", params).await
    }

    /// Swipes from the center to the edge in `direction`.
    pub async fn swipe(&self, direction: Direction, steps: u32) -> Result<()> {
        self.must_wait(true, None).await?;
        let b = self.bounds().await?;
        let c = Point::new((b.left + b.right) / 2, (b.top + b.bottom) / 2);
        let to = match direction {
            Direction::Up => Point::new(c.x, b.top),
            Direction::Down => Point::new(c.x, b.bottom - 1),
            Direction::Left => Point::new(b.left, c.y),
            Direction::Right => Point::new(b.right - 1, c.y),
        };
        self.device.swipe_between(c, to, steps).await
    }

    /// Two-finger gesture from `(start1, start2)` to `(end1, end2)`.
    pub async fn gesture(
        &self,
        start1: (f64, f64),
        start2: (f64, f64),
        end1: (f64, f64),
        end2: (f64, f64),
        steps: u32,
    ) -> Result<bool> {
        let mut points = Vec::with_capacity(4);
        for (x, y) in [start1, start2, end1, end2] {
            let p = self.device.rel_to_abs(x, y).await?;
            points.push(json!({"x": p.x, "y": p.y}));
        }
        let mut params = vec![self.target.to_json()];
        params.extend(points);
        params.push(json!(steps));
        self.call_bool("gesture", Value::Array(params)).await
    }

    pub async fn pinch_in(&self, percent: u32, steps: u32) -> Result<bool> {
        self.call_bool("pinchIn", json!([self.target.to_json(), percent, steps]))
            .await
    }

    pub async fn pinch_out(&self, percent: u32, steps: u32) -> Result<bool> {
        self.call_bool("pinchOut", json!([self.target.to_json(), percent, steps]))
            .await
    }

    // -- text ---------------------------------------------------------------

    /// Replaces the object's text; an empty `text` clears the field.
    pub async fn set_text(&self, text: &str, timeout: Option<Duration>) -> Result<()> {
        self.must_wait(true, timeout).await?;
        if text.is_empty() {
            self.call("clearTextField", json!([self.target.to_json()]))
                .await?;
        } else {
            self.call("setText", json!([self.target.to_json(), text]))
                .await?;
        }
        Ok(())
    }

    pub async fn send_keys(&self, text: &str) -> Result<()> {
        self.set_text(text, None).await
    }

    pub async fn clear_text(&self, timeout: Option<Duration>) -> Result<()> {
        self.set_text("", timeout).await
    }

    pub async fn get_text(&self, timeout: Option<Duration>) -> Result<String> {
        self.must_wait(true, timeout).await?;
        let value = self.call("getText", json!([self.target.to_json()])).await?;
        match value {
            Value::String(s) => Ok(s),
            Value::Null => Ok(String::new()),
            other => Err(unexpected("getText", &other)),
        }
    }

    // -- relations ----------------------------------------------------------

    pub fn child(&self, sub: Selector) -> Result<UiObject> {
        let selector = self.require_selector("child")?.clone().child(sub);
        Ok(UiObject::new(self.device.clone(), selector))
    }

    pub fn sibling(&self, sub: Selector) -> Result<UiObject> {
        let selector = self.require_selector("sibling")?.clone().sibling(sub);
        Ok(UiObject::new(self.device.clone(), selector))
    }

    /// The child matching `sub` whose text is `text`, found by the server.
    pub async fn child_by_text(
        &self,
        text: &str,
        sub: Selector,
        allow_scroll_search: Option<bool>,
    ) -> Result<UiObject> {
        self.child_by("childByText", text, sub, allow_scroll_search)
            .await
    }

    pub async fn child_by_description(
        &self,
        description: &str,
        sub: Selector,
        allow_scroll_search: Option<bool>,
    ) -> Result<UiObject> {
        self.child_by("childByDescription", description, sub, allow_scroll_search)
            .await
    }

    pub async fn child_by_instance(&self, instance: i64, sub: Selector) -> Result<UiObject> {
        let params = json!([self.target.to_json(), sub.to_json(), instance]);
        self.named_result("childByInstance", params).await
    }

    async fn child_by(
        &self,
        method: &str,
        needle: &str,
        sub: Selector,
        allow_scroll_search: Option<bool>,
    ) -> Result<UiObject> {
        let mut params = vec![self.target.to_json(), sub.to_json(), json!(needle)];
        if let Some(allow) = allow_scroll_search {
            params.push(json!(allow));
        }
        self.named_result(method, Value::Array(params)).await
    }

    async fn named_result(&self, method: &str, params: Value) -> Result<UiObject> {
        let value = self.call(method, params).await?;
        match value {
            Value::String(name) => Ok(UiObject::named(self.device.clone(), name)),
            other => Err(unexpected(method, &other)),
        }
    }

    /// The `index`th match; negative indices count from the end.
    ///
    /// A negative index costs a `count` call, and the screen may change
    /// between that call and any later resolution of the result.
    pub async fn nth(&self, index: i64) -> Result<UiObject> {
        let selector = self.require_selector("indexing")?;
        let mut index = index;
        if index < 0 {
            let all = selector.clone().without(Property::Instance);
            let value = self.call("count", json!([all.to_json()])).await?;
            let count = value.as_i64().ok_or_else(|| unexpected("count", &value))?;
            index += count;
            if index < 0 {
                return Err(self.not_found());
            }
        }
        Ok(UiObject::new(
            self.device.clone(),
            selector.update_instance(index),
        ))
    }

    /// One object per current match, in instance order.
    pub async fn all(&self) -> Result<Vec<UiObject>> {
        let selector = self.require_selector("iteration")?;
        let count = self.count().await?;
        Ok((0..count as i64)
            .map(|i| UiObject::new(self.device.clone(), selector.update_instance(i)))
            .collect())
    }

    /// The nearest object matching `selector` to the right of this one.
    pub async fn right(&self, selector: Selector) -> Result<Option<UiObject>> {
        self.beside(selector, Rect::distance_right).await
    }

    pub async fn left(&self, selector: Selector) -> Result<Option<UiObject>> {
        self.beside(selector, Rect::distance_left).await
    }

    pub async fn up(&self, selector: Selector) -> Result<Option<UiObject>> {
        self.beside(selector, Rect::distance_up).await
    }

    pub async fn down(&self, selector: Selector) -> Result<Option<UiObject>> {
        self.beside(selector, Rect::distance_down).await
    }

    async fn beside(
        &self,
        selector: Selector,
        distance: fn(&Rect, &Rect) -> Option<i32>,
    ) -> Result<Option<UiObject>> {
        let info = self.info().await?;
        let origin = info
            .get("bounds")
            .and_then(Rect::from_json)
            .ok_or_else(|| unexpected("objInfo", &info))?;

        let mut best: Option<(i32, UiObject)> = None;
        for candidate in self.device.select(selector).all().await? {
            let info = candidate.info().await?;
            let Some(rect) = info.get("bounds").and_then(Rect::from_json) else {
                continue;
            };
            let Some(d) = distance(&origin, &rect).filter(|d| *d >= 0) else {
                continue;
            };
            if best.as_ref().map_or(true, |(min, _)| d < *min) {
                best = Some((d, candidate));
            }
        }
        Ok(best.map(|(_, obj)| obj))
    }

    // -- scrolling ----------------------------------------------------------

    /// Scroll actions on this (scrollable) object. Vertical by default.
    pub fn scroll(&self) -> Scroll<'_> {
        Scroll {
            obj: self,
            vertical: true,
            steps: SCROLL_STEPS,
            max_swipes: 500,
        }
    }

    /// Fling actions on this (scrollable) object. Vertical by default.
    pub fn fling(&self) -> Fling<'_> {
        Fling {
            obj: self,
            vertical: true,
            max_swipes: 500,
        }
    }
}

/// Builder for scroll actions, see [`UiObject::scroll`].
#[derive(Debug, Clone, Copy)]
pub struct Scroll<'a> {
    obj: &'a UiObject,
    vertical: bool,
    steps: u32,
    max_swipes: u32,
}

impl Scroll<'_> {
    pub fn horizontal(mut self) -> Self {
        self.vertical = false;
        self
    }

    pub fn vertical(mut self) -> Self {
        self.vertical = true;
        self
    }

    /// More steps scroll slower and fling less far.
    pub fn steps(mut self, steps: u32) -> Self {
        self.steps = steps;
        self
    }

    pub fn max_swipes(mut self, max_swipes: u32) -> Self {
        self.max_swipes = max_swipes;
        self
    }

    /// Returns whether the object can still scroll further.
    pub async fn forward(self) -> Result<bool> {
        let target = self.obj.target.to_json();
        self.obj
            .call_bool("scrollForward", json!([target, self.vertical, self.steps]))
            .await
    }

    pub async fn backward(self) -> Result<bool> {
        let target = self.obj.target.to_json();
        self.obj
            .call_bool("scrollBackward", json!([target, self.vertical, self.steps]))
            .await
    }

    pub async fn to_beginning(self) -> Result<bool> {
        let target = self.obj.target.to_json();
        self.obj
            .call_bool(
                "scrollToBeginning",
                json!([target, self.vertical, self.max_swipes, self.steps]),
            )
            .await
    }

    pub async fn to_end(self) -> Result<bool> {
        let target = self.obj.target.to_json();
        self.obj
            .call_bool(
                "scrollToEnd",
                json!([target, self.vertical, self.max_swipes, self.steps]),
            )
            .await
    }

    /// Scrolls until an object matching `selector` is visible.
    pub async fn to(self, selector: &Selector) -> Result<bool> {
        let target = self.obj.target.to_json();
        self.obj
            .call_bool("scrollTo", json!([target, selector.to_json(), self.vertical]))
            .await
    }
}

/// Builder for fling actions, see [`UiObject::fling`].
#[derive(Debug, Clone, Copy)]
pub struct Fling<'a> {
    obj: &'a UiObject,
    vertical: bool,
    max_swipes: u32,
}

impl Fling<'_> {
    pub fn horizontal(mut self) -> Self {
        self.vertical = false;
        self
    }

    pub fn vertical(mut self) -> Self {
        self.vertical = true;
        self
    }

    pub fn max_swipes(mut self, max_swipes: u32) -> Self {
        self.max_swipes = max_swipes;
        self
    }

    pub async fn forward(self) -> Result<bool> {
        let target = self.obj.target.to_json();
        self.obj
            .call_bool("flingForward", json!([target, self.vertical]))
            .await
    }

    pub async fn backward(self) -> Result<bool> {
        let target = self.obj.target.to_json();
        self.obj
            .call_bool("flingBackward", json!([target, self.vertical]))
            .await
    }

    pub async fn to_beginning(self) -> Result<bool> {
        let target = self.obj.target.to_json();
        self.obj
            .call_bool("flingToBeginning", json!([target, self.vertical, self.max_swipes]))
            .await
    }

    pub async fn to_end(self) -> Result<bool> {
        let target = self.obj.target.to_json();
        self.obj
            .call_bool("flingToEnd", json!([target, self.vertical, self.max_swipes]))
            .await
    }
}
