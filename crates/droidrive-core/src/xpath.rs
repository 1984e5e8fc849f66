//! Snapshot-based element queries.
//!
//! The hierarchy is dumped once per query and evaluated locally with XPath
//! 1.0. Before evaluation every `<node>` element is renamed after its
//! `class` attribute, so `//android.widget.Button` matches by type.
//!
//! Queries accept a compact shorthand in addition to plain XPath:
//!
//! | Input      | Meaning                                          |
//! |------------|--------------------------------------------------|
//! | `//...`    | XPath, used as is                                |
//! | `@id`      | `resource-id` equals `id`                        |
//! | `^regex`   | text, content-desc or resource-id match `^regex` |
//! | `%text%`   | text or content-desc contains `text`             |
//! | `%text`    | text or content-desc ends with `text`            |
//! | `text%`    | text or content-desc starts with `text`          |
//! | `$alias`   | looked up in the `xpath_aliases` setting         |
//! | `text`     | text, content-desc or resource-id equals `text`  |

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Map, Value};
use sxd_document::dom::{ChildOfElement, ChildOfRoot, Document, Element, ParentOfChild};
use sxd_document::{parser, Package};
use sxd_xpath::{Context, Factory, Value as XValue};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::{deadline_after, secs};
use crate::device::Device;
use crate::error::{DeviceError, Result};
use crate::geometry::{swipe_points, Direction, Point, Rect};
use crate::prompt::PromptDecision;

/// Namespace of the EXSLT regular expression functions.
pub const REGEX_NS: &str = "http://exslt.org/regular-expressions";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum XPathError {
    #[error("invalid xpath: {0}")]
    Invalid(String),

    #[error("xpath alias not defined: {0}")]
    UnresolvedAlias(String),

    #[error("failed to evaluate {xpath}: {reason}")]
    Evaluation { xpath: String, reason: String },

    #[error("hierarchy is not valid XML: {0}")]
    Parse(String),

    /// `child` was used on an `and`/`or` combination.
    #[error("child path needs a plain xpath selector, got {0}")]
    CompoundChild(String),
}

// ---------------------------------------------------------------------------
// Shorthand translation
// ---------------------------------------------------------------------------

fn unsafe_chars_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[$@#&]").unwrap())
}

fn dots_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\.+").unwrap())
}

fn index_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[\d+\]").unwrap())
}

/// Turns a class name into a usable element name.
///
/// `$ @ # &` become dots, runs of dots collapse, and leading or trailing
/// dots are dropped: `a$b` becomes `a.b`.
pub fn safe_xmlstr(s: &str) -> String {
    let s = unsafe_chars_re().replace_all(s, ".");
    let s = dots_re().replace_all(&s, ".");
    s.trim_matches('.').to_string()
}

/// Quotes `s` as an XPath string literal.
pub fn string_quote(s: &str) -> String {
    if !s.contains('\'') {
        format!("'{s}'")
    } else if !s.contains('"') {
        format!("\"{s}\"")
    } else {
        let parts: Vec<String> = s.split('\'').map(|p| format!("'{p}'")).collect();
        format!("concat({})", parts.join(", \"'\", "))
    }
}

fn compile(xpath: &str) -> std::result::Result<sxd_xpath::XPath, XPathError> {
    match Factory::new().build(xpath) {
        Ok(Some(compiled)) => Ok(compiled),
        Ok(None) => Err(XPathError::Invalid(format!("{xpath}: empty expression"))),
        Err(e) => Err(XPathError::Invalid(format!("{xpath}: {e:?}"))),
    }
}

/// Translates shorthand into XPath and checks its syntax.
///
/// A `$name` reference is replaced by its entry in `aliases` first. An
/// undefined alias is an error when `alias_strict`, otherwise the input is
/// matched as literal text.
pub fn strict_xpath(
    xpath: &str,
    aliases: &BTreeMap<String, String>,
    alias_strict: bool,
) -> std::result::Result<String, XPathError> {
    let orig = xpath;
    let xpath = match xpath.strip_prefix('$') {
        Some(name) => match aliases.get(name) {
            Some(resolved) => resolved.as_str(),
            None if alias_strict => return Err(XPathError::UnresolvedAlias(name.to_string())),
            None => xpath,
        },
        None => xpath,
    };

    let translated = if xpath.trim_start_matches('(').starts_with('/') {
        xpath.to_string()
    } else if let Some(id) = xpath.strip_prefix('@') {
        format!("//*[@resource-id={}]", string_quote(id))
    } else if xpath.starts_with('^') {
        let q = string_quote(xpath);
        format!("//*[re:match(@text, {q}) or re:match(@content-desc, {q}) or re:match(@resource-id, {q})]")
    } else if xpath.len() >= 2 && xpath.starts_with('%') && xpath.ends_with('%') {
        let q = string_quote(&xpath[1..xpath.len() - 1]);
        format!("//*[contains(@text, {q}) or contains(@content-desc, {q})]")
    } else if let Some(text) = xpath.strip_prefix('%') {
        let q = string_quote(text);
        let n = text.chars().count();
        format!(
            "//*[{q} = substring(@text, string-length(@text) - {n} + 1) or {q} = substring(@content-desc, string-length(@content-desc) - {n} + 1)]"
        )
    } else if let Some(text) = xpath.strip_suffix('%') {
        let q = string_quote(text);
        format!("//*[starts-with(@text, {q}) or starts-with(@content-desc, {q})]")
    } else {
        let q = string_quote(xpath);
        format!("//*[@text={q} or @content-desc={q} or @resource-id={q}]")
    };

    let translated = translated.trim_end_matches('/').to_string();
    compile(&translated).map_err(|_| XPathError::Invalid(orig.to_string()))?;
    debug!(from = orig, to = %translated, "xpath");
    Ok(translated)
}

fn join_path(base: &str, sub: &str) -> String {
    if sub.starts_with('/') {
        format!("{base}{sub}")
    } else {
        format!("{base}/{sub}")
    }
}

// ---------------------------------------------------------------------------
// re:match
// ---------------------------------------------------------------------------

/// `re:match(string, pattern[, flags])` as a boolean.
///
/// Only the `i` flag is honoured. A bad pattern matches nothing.
struct RegexMatch;

impl sxd_xpath::function::Function for RegexMatch {
    fn evaluate<'c, 'd>(
        &self,
        _context: &sxd_xpath::context::Evaluation<'c, 'd>,
        args: Vec<XValue<'d>>,
    ) -> std::result::Result<XValue<'d>, sxd_xpath::function::Error> {
        let mut args = args.into_iter();
        let (Some(text), Some(pattern)) = (args.next(), args.next()) else {
            return Ok(XValue::Boolean(false));
        };
        let flags = args.next().map(|f| f.string()).unwrap_or_default();
        let pattern = if flags.contains('i') {
            format!("(?i){}", pattern.string())
        } else {
            pattern.string()
        };
        let matched = Regex::new(&pattern)
            .map(|re| re.is_match(&text.string()))
            .unwrap_or(false);
        Ok(XValue::Boolean(matched))
    }
}

// ---------------------------------------------------------------------------
// PageSource
// ---------------------------------------------------------------------------

type QueryResult = std::result::Result<Vec<ElementData>, XPathError>;

/// One dumped hierarchy. Cheap to clone.
///
/// Query results are kept per translated xpath and shared between clones,
/// so each snapshot is parsed once per batch of new queries.
#[derive(Clone)]
pub struct PageSource {
    xml: Arc<str>,
    results: Arc<Mutex<HashMap<String, QueryResult>>>,
    parses: Arc<AtomicUsize>,
}

impl PartialEq for PageSource {
    fn eq(&self, other: &Self) -> bool {
        self.xml == other.xml
    }
}

impl Eq for PageSource {}

impl fmt::Debug for PageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageSource")
            .field("len", &self.xml.len())
            .field("cached", &lock(&self.results).len())
            .field("parses", &self.parses.load(Ordering::Relaxed))
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// What a query returns for one matched element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ElementData {
    tag: String,
    attrib: BTreeMap<String, String>,
    path: String,
    child_count: usize,
}

impl PageSource {
    pub fn new(xml: impl Into<String>) -> Self {
        Self {
            xml: Arc::from(xml.into()),
            results: Arc::default(),
            parses: Arc::default(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.xml
    }

    /// Evaluates a translated xpath; matches come back in document order.
    pub(crate) fn find(&self, xpath: &str) -> QueryResult {
        self.prefetch(&[xpath])?;
        lock(&self.results)
            .get(xpath)
            .cloned()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    /// Evaluates every xpath not seen before on this snapshot, with a
    /// single parse of the document.
    ///
    /// Only a parse failure is returned here; a failing expression keeps
    /// its error for [`find`](Self::find).
    pub(crate) fn prefetch<S: AsRef<str>>(
        &self,
        xpaths: &[S],
    ) -> std::result::Result<(), XPathError> {
        let missing: Vec<&str> = {
            let cached = lock(&self.results);
            let mut seen = HashSet::new();
            xpaths
                .iter()
                .map(AsRef::as_ref)
                .filter(|x| !cached.contains_key(*x) && seen.insert(*x))
                .collect()
        };
        if missing.is_empty() {
            return Ok(());
        }
        debug!(queries = missing.len(), "parsing page source");
        let package = self.parse()?;
        let document = package.as_document();
        let found: Vec<(String, QueryResult)> = missing
            .into_iter()
            .map(|xpath| {
                let result = query(&document, xpath)
                    .map(|elements| elements.into_iter().map(element_data).collect());
                (xpath.to_string(), result)
            })
            .collect();
        lock(&self.results).extend(found);
        Ok(())
    }

    #[cfg(test)]
    fn parse_count(&self) -> usize {
        self.parses.load(Ordering::Relaxed)
    }

    fn parse(&self) -> std::result::Result<Package, XPathError> {
        self.parses.fetch_add(1, Ordering::Relaxed);
        let package = parser::parse(&self.xml).map_err(|e| XPathError::Parse(format!("{e:?}")))?;
        normalize(&package.as_document());
        Ok(package)
    }

    /// Paths of the ancestors of the element at `path`, nearest first,
    /// that also match `xpath`.
    fn ancestors_matching(
        &self,
        path: &str,
        xpath: Option<&str>,
    ) -> std::result::Result<Vec<ElementData>, XPathError> {
        let package = self.parse()?;
        let document = package.as_document();
        let Some(start) = query(&document, path)?.into_iter().next() else {
            return Ok(Vec::new());
        };
        let allowed: Option<HashSet<String>> = match xpath {
            Some(xpath) => Some(query(&document, xpath)?.into_iter().map(element_path).collect()),
            None => None,
        };

        let mut found = Vec::new();
        let mut current = start;
        while let Some(ParentOfChild::Element(parent)) = current.parent() {
            let p = element_path(parent);
            if allowed.as_ref().map_or(true, |set| set.contains(&p)) {
                found.push(element_data(parent));
            }
            current = parent;
        }
        Ok(found)
    }
}

impl From<String> for PageSource {
    fn from(xml: String) -> Self {
        PageSource::new(xml)
    }
}

fn element_children<'d>(e: Element<'d>) -> Vec<Element<'d>> {
    e.children()
        .into_iter()
        .filter_map(|c| match c {
            ChildOfElement::Element(child) => Some(child),
            _ => None,
        })
        .collect()
}

fn root_elements<'d>(document: &Document<'d>) -> Vec<Element<'d>> {
    document
        .root()
        .children()
        .into_iter()
        .filter_map(|c| match c {
            ChildOfRoot::Element(e) => Some(e),
            _ => None,
        })
        .collect()
}

/// Renames every `<node>` after its class and drops the class attribute.
fn normalize(document: &Document<'_>) {
    let mut stack = root_elements(document);
    while let Some(e) = stack.pop() {
        if e.name().local_part() == "node" {
            let tag = e
                .attribute_value("class")
                .map(safe_xmlstr)
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| "node".to_string());
            e.remove_attribute("class");
            e.set_name(tag.as_str());
        }
        stack.extend(element_children(e));
    }
}

fn query<'d>(
    document: &Document<'d>,
    xpath: &str,
) -> std::result::Result<Vec<Element<'d>>, XPathError> {
    let compiled = compile(xpath)?;
    let mut context = Context::new();
    context.set_namespace("re", REGEX_NS);
    context.set_function((REGEX_NS, "match"), RegexMatch);

    let value = compiled
        .evaluate(&context, document.root())
        .map_err(|e| XPathError::Evaluation {
            xpath: xpath.to_string(),
            reason: format!("{e:?}"),
        })?;
    match value {
        XValue::Nodeset(nodes) => Ok(nodes
            .document_order()
            .into_iter()
            .filter_map(|n| match n {
                sxd_xpath::nodeset::Node::Element(e) => Some(e),
                _ => None,
            })
            .collect()),
        other => Err(XPathError::Evaluation {
            xpath: xpath.to_string(),
            reason: format!("expected a node-set, got {other:?}"),
        }),
    }
}

/// Absolute path in the form `/hierarchy/FrameLayout/TextView[1]`.
///
/// A position is added only when the parent has several children with
/// the same tag.
fn element_path(e: Element<'_>) -> String {
    let mut parts = Vec::new();
    let mut current = e;
    loop {
        let name = current.name().local_part().to_string();
        match current.parent() {
            Some(ParentOfChild::Element(parent)) => {
                let same: Vec<Element<'_>> = element_children(parent)
                    .into_iter()
                    .filter(|c| c.name().local_part() == name)
                    .collect();
                if same.len() > 1 {
                    let pos = same.iter().position(|c| *c == current).map_or(1, |i| i + 1);
                    parts.push(format!("{name}[{pos}]"));
                } else {
                    parts.push(name);
                }
                current = parent;
            }
            _ => {
                parts.push(name);
                break;
            }
        }
    }
    parts.reverse();
    format!("/{}", parts.join("/"))
}

fn element_data(e: Element<'_>) -> ElementData {
    ElementData {
        tag: e.name().local_part().to_string(),
        attrib: e
            .attributes()
            .into_iter()
            .map(|a| (a.name().local_part().to_string(), a.value().to_string()))
            .collect(),
        path: element_path(e),
        child_count: element_children(e).len(),
    }
}

fn kebab_to_camel(s: &str) -> String {
    let mut parts = s.split('-');
    let mut out = parts.next().unwrap_or_default().to_string();
    for part in parts {
        let mut chars = part.chars();
        if let Some(first) = chars.next() {
            out.extend(first.to_uppercase());
            out.push_str(&chars.as_str().to_lowercase());
        }
    }
    out
}

const BOOL_ATTRS: [&str; 11] = [
    "checkable",
    "checked",
    "clickable",
    "enabled",
    "focusable",
    "focused",
    "scrollable",
    "long-clickable",
    "password",
    "selected",
    "visible-to-user",
];

impl ElementData {
    fn info(&self) -> Value {
        let mut map = Map::new();
        for (k, v) in &self.attrib {
            match k.as_str() {
                "bounds" | "class" | "package" | "content-desc" => {}
                "index" => {
                    map.insert(k.clone(), v.parse::<i64>().map_or_else(|_| json!(v), |i| json!(i)));
                }
                key if BOOL_ATTRS.contains(&key) => {
                    map.insert(kebab_to_camel(key), json!(v == "true"));
                }
                key => {
                    map.insert(kebab_to_camel(key), json!(v));
                }
            }
        }
        let b = self.bounds();
        map.insert("childCount".into(), json!(self.child_count));
        map.insert("className".into(), json!(self.tag));
        map.insert(
            "bounds".into(),
            json!({"left": b.left, "top": b.top, "right": b.right, "bottom": b.bottom}),
        );
        map.insert("packageName".into(), json!(self.attrib.get("package")));
        map.insert("contentDescription".into(), json!(self.attrib.get("content-desc")));
        map.insert("resourceName".into(), json!(self.attrib.get("resource-id")));
        Value::Object(map)
    }

    fn bounds(&self) -> Rect {
        self.attrib
            .get("bounds")
            .map(|b| Rect::parse_bounds(b))
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// XPath engine
// ---------------------------------------------------------------------------

/// Snapshot query engine bound to a device.
#[derive(Debug, Clone)]
pub struct XPath {
    device: Device,
}

impl XPath {
    pub fn new(device: Device) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Translates shorthand with the device's alias table.
    pub fn strict(&self, xpath: &str) -> std::result::Result<String, XPathError> {
        self.device
            .with_settings(|s| strict_xpath(xpath, &s.xpath_aliases, s.xpath_alias_strict))
    }

    /// Dumps a fresh hierarchy.
    pub async fn get_page_source(&self) -> Result<PageSource> {
        Ok(PageSource::new(self.device.dump_hierarchy(false).await?))
    }

    /// A selector evaluated against a fresh hierarchy on every call.
    pub fn select(&self, xpath: &str) -> XPathSelector {
        XPathSelector::new(self.clone(), XPathQuery::from(xpath), None)
    }

    /// A selector evaluated against `source` only.
    pub fn select_in(&self, xpath: &str, source: PageSource) -> XPathSelector {
        XPathSelector::new(self.clone(), XPathQuery::from(xpath), Some(source))
    }

    /// `true` if `xpath` matches `source`, or a fresh hierarchy.
    pub async fn matches(&self, xpath: &str, source: Option<PageSource>) -> Result<bool> {
        let selector = match source {
            Some(source) => self.select_in(xpath, source),
            None => self.select(xpath),
        };
        selector.exists().await
    }

    async fn operation_delay<F, Fut>(&self, op: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let (before, after) = self
            .device
            .with_settings(|s| (secs(s.operation_delay.0), secs(s.operation_delay.1)));
        if !before.is_zero() {
            tokio::time::sleep(before).await;
        }
        op().await?;
        if !after.is_zero() {
            tokio::time::sleep(after).await;
        }
        Ok(())
    }

    pub async fn send_click(&self, p: Point) -> Result<()> {
        self.operation_delay(|| self.device.click_point(p)).await
    }

    pub async fn send_long_click(&self, p: Point) -> Result<()> {
        self.operation_delay(|| self.device.long_click_point(p, 0.5)).await
    }

    pub async fn send_swipe(&self, from: Point, to: Point) -> Result<()> {
        self.operation_delay(|| self.device.swipe_between(from, to, crate::device::SCROLL_STEPS))
            .await
    }

    pub async fn send_text(&self, text: &str) -> Result<()> {
        self.device.send_keys(text, false).await
    }

    /// Clicks the first match of `xpath`, polling until `timeout`.
    ///
    /// With `watch`, the watcher rules run against every dumped hierarchy
    /// first. A rule firing restarts the deadline, so dismissing a popup
    /// does not eat into the caller's budget.
    ///
    /// # Errors
    ///
    /// [`DeviceError::Timeout`] if nothing matched in time.
    pub async fn click(&self, xpath: &str, watch: bool, timeout: Option<Duration>) -> Result<()> {
        let timeout = timeout.unwrap_or_else(|| self.device.wait_timeout());
        let interval = self.device.with_settings(|s| secs(s.xpath_click_interval));
        let watcher = self.device.watcher();
        let mut deadline = deadline_after(timeout);
        loop {
            let source = self.get_page_source().await?;
            if watch && watcher.run(Some(source.clone())).await? {
                tokio::time::sleep(interval).await;
                deadline = deadline_after(timeout);
                continue;
            }
            let selector = self.select_in(xpath, source);
            if let Some(el) = selector.matched().await? {
                return el.click().await;
            }
            if Instant::now() >= deadline {
                return Err(DeviceError::Timeout {
                    xpath: xpath.to_string(),
                    timeout,
                });
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Swipes the whole screen in `direction` until `xpath` shows up.
    ///
    /// Once found, a short extra swipe keeps the element off the edge.
    pub async fn scroll_to(
        &self,
        xpath: &str,
        direction: Direction,
        max_swipes: u32,
    ) -> Result<Option<XMLElement>> {
        let target = self.select(xpath);
        for _ in 0..max_swipes.max(1) {
            if target.exists().await? {
                self.device.swipe_ext(direction, 0.1, None).await?;
                return target.get_last_match().await.map(Some);
            }
            self.device.swipe_ext(direction, 0.5, None).await?;
        }
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// XPathSelector
// ---------------------------------------------------------------------------

/// A query tree: a path with optional child steps, or a combination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XPathQuery {
    Path { base: String, children: Vec<String> },
    And(Box<XPathQuery>, Box<XPathQuery>),
    Or(Box<XPathQuery>, Box<XPathQuery>),
}

impl From<&str> for XPathQuery {
    fn from(xpath: &str) -> Self {
        XPathQuery::Path {
            base: xpath.to_string(),
            children: Vec::new(),
        }
    }
}

impl From<String> for XPathQuery {
    fn from(xpath: String) -> Self {
        XPathQuery::Path {
            base: xpath,
            children: Vec::new(),
        }
    }
}

impl From<XPathSelector> for XPathQuery {
    fn from(selector: XPathSelector) -> Self {
        selector.query
    }
}

impl fmt::Display for XPathQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            XPathQuery::Path { base, children } => {
                f.write_str(base)?;
                for child in children {
                    write!(f, " / {child}")?;
                }
                Ok(())
            }
            XPathQuery::And(a, b) => write!(f, "({a} AND {b})"),
            XPathQuery::Or(a, b) => write!(f, "({a} OR {b})"),
        }
    }
}

impl XPathQuery {
    fn evaluate(
        &self,
        engine: &XPath,
        source: &PageSource,
    ) -> std::result::Result<Vec<ElementData>, XPathError> {
        match self {
            XPathQuery::Path { base, children } => source.find(&translate(engine, base, children)?),
            XPathQuery::And(a, b) => {
                source.prefetch(&self.paths(engine)?)?;
                let right: HashSet<String> =
                    b.evaluate(engine, source)?.into_iter().map(|e| e.path).collect();
                Ok(a.evaluate(engine, source)?
                    .into_iter()
                    .filter(|e| right.contains(&e.path))
                    .collect())
            }
            XPathQuery::Or(a, b) => {
                source.prefetch(&self.paths(engine)?)?;
                let mut all = a.evaluate(engine, source)?;
                let mut seen: HashSet<String> = all.iter().map(|e| e.path.clone()).collect();
                for e in b.evaluate(engine, source)? {
                    if seen.insert(e.path.clone()) {
                        all.push(e);
                    }
                }
                Ok(all)
            }
        }
    }

    /// Translated xpath of every path in the query.
    fn paths(&self, engine: &XPath) -> std::result::Result<Vec<String>, XPathError> {
        match self {
            XPathQuery::Path { base, children } => Ok(vec![translate(engine, base, children)?]),
            XPathQuery::And(a, b) | XPathQuery::Or(a, b) => {
                let mut all = a.paths(engine)?;
                all.extend(b.paths(engine)?);
                Ok(all)
            }
        }
    }
}

fn translate(
    engine: &XPath,
    base: &str,
    children: &[String],
) -> std::result::Result<String, XPathError> {
    let mut xpath = engine.strict(base)?;
    for child in children {
        xpath = engine.strict(&join_path(&xpath, child))?;
    }
    Ok(xpath)
}

/// Action run by [`XPathSelector::click`] when the element is not found.
#[async_trait]
pub trait Fallback: Send + Sync {
    async fn run(&self, device: Device) -> Result<()>;
}

#[async_trait]
impl<F, Fut> Fallback for F
where
    F: Fn(Device) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn run(&self, device: Device) -> Result<()> {
        self(device).await
    }
}

/// An xpath query bound to an engine.
///
/// Each call evaluates against a fresh hierarchy unless the selector was
/// created with a fixed source.
pub struct XPathSelector {
    engine: XPath,
    query: XPathQuery,
    source: Option<PageSource>,
    last_source: Mutex<Option<PageSource>>,
    fallback: Option<Arc<dyn Fallback>>,
}

impl Clone for XPathSelector {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            query: self.query.clone(),
            source: self.source.clone(),
            last_source: Mutex::new(self.last_source()),
            fallback: self.fallback.clone(),
        }
    }
}

impl fmt::Debug for XPathSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XPathSelector")
            .field("query", &self.query)
            .field("fixed_source", &self.source.is_some())
            .finish()
    }
}

impl fmt::Display for XPathSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "XPathSelector({})", self.query)
    }
}

impl XPathSelector {
    fn new(engine: XPath, query: XPathQuery, source: Option<PageSource>) -> Self {
        Self {
            engine,
            query,
            source,
            last_source: Mutex::new(None),
            fallback: None,
        }
    }

    pub fn query(&self) -> &XPathQuery {
        &self.query
    }

    fn last_source(&self) -> Option<PageSource> {
        self.last_source.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn combine(self, other: XPathQuery, and: bool) -> Self {
        let left = Box::new(self.query);
        let right = Box::new(other);
        Self {
            query: if and {
                XPathQuery::And(left, right)
            } else {
                XPathQuery::Or(left, right)
            },
            last_source: Mutex::new(None),
            ..self
        }
    }

    /// Elements matched by both selectors.
    pub fn and(self, other: impl Into<XPathQuery>) -> Self {
        self.combine(other.into(), true)
    }

    /// Elements matched by either selector.
    pub fn or(self, other: impl Into<XPathQuery>) -> Self {
        self.combine(other.into(), false)
    }

    /// Narrows the selector to `sub` below each match.
    pub fn child(mut self, sub: &str) -> std::result::Result<Self, XPathError> {
        match &mut self.query {
            XPathQuery::Path { children, .. } => {
                children.push(sub.to_string());
                Ok(self)
            }
            other => Err(XPathError::CompoundChild(other.to_string())),
        }
    }

    /// Runs `fallback` instead of failing when [`click`](Self::click)
    /// finds nothing.
    pub fn fallback(mut self, fallback: impl Fallback + 'static) -> Self {
        self.fallback = Some(Arc::new(fallback));
        self
    }

    fn global_timeout(&self) -> Duration {
        self.engine.device.wait_timeout()
    }

    fn not_found(&self) -> DeviceError {
        DeviceError::XPathElementNotFound {
            xpath: self.query.to_string(),
        }
    }

    fn wrap(&self, data: ElementData, source: &PageSource) -> XMLElement {
        XMLElement {
            data,
            source: source.clone(),
            engine: self.engine.clone(),
        }
    }

    /// All matches against `source`.
    pub fn all_in(&self, source: &PageSource) -> Result<Vec<XMLElement>> {
        *self.last_source.lock().unwrap_or_else(|e| e.into_inner()) = Some(source.clone());
        Ok(self
            .query
            .evaluate(&self.engine, source)?
            .into_iter()
            .map(|d| self.wrap(d, source))
            .collect())
    }

    /// All matches against the fixed source or a fresh hierarchy.
    pub async fn all(&self) -> Result<Vec<XMLElement>> {
        let source = match &self.source {
            Some(source) => source.clone(),
            None => self.engine.get_page_source().await?,
        };
        self.all_in(&source)
    }

    pub async fn exists(&self) -> Result<bool> {
        Ok(!self.all().await?.is_empty())
    }

    /// The first match right now, without waiting.
    pub async fn matched(&self) -> Result<Option<XMLElement>> {
        Ok(self.all().await?.into_iter().next())
    }

    /// Polls fresh hierarchies until something matches.
    ///
    /// Returns the first match, or `None` once `timeout` has passed.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<Option<XMLElement>> {
        let timeout = timeout.unwrap_or_else(|| self.global_timeout());
        let interval = self.engine.device.with_settings(|s| secs(s.xpath_poll_interval));
        let deadline = deadline_after(timeout);
        loop {
            if let Some(el) = self.matched().await? {
                return Ok(Some(el));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(interval.min(deadline.saturating_duration_since(Instant::now()))).await;
        }
    }

    /// Returns `true` once nothing matches, `false` if still present at `timeout`.
    pub async fn wait_gone(&self, timeout: Option<Duration>) -> Result<bool> {
        let timeout = timeout.unwrap_or_else(|| self.global_timeout());
        let interval = self.engine.device.with_settings(|s| secs(s.xpath_poll_interval));
        let deadline = deadline_after(timeout);
        while Instant::now() < deadline {
            if !self.exists().await? {
                return Ok(true);
            }
            tokio::time::sleep(interval).await;
        }
        Ok(false)
    }

    /// The first match, waiting up to `timeout`.
    ///
    /// # Errors
    ///
    /// [`DeviceError::XPathElementNotFound`] if nothing matched in time.
    pub async fn get(&self, timeout: Option<Duration>) -> Result<XMLElement> {
        self.wait(timeout).await?.ok_or_else(|| self.not_found())
    }

    /// The first match in the hierarchy the last query used.
    pub async fn get_last_match(&self) -> Result<XMLElement> {
        let found = match self.last_source() {
            Some(source) => self.all_in(&source)?,
            None => self.all().await?,
        };
        found.into_iter().next().ok_or_else(|| self.not_found())
    }

    pub async fn get_text(&self, timeout: Option<Duration>) -> Result<Option<String>> {
        Ok(self.get(timeout).await?.text().map(str::to_string))
    }

    /// Focuses the element by clicking it, then types `text`.
    pub async fn set_text(&self, text: &str) -> Result<()> {
        self.get(None).await?.click().await?;
        self.engine.send_text(text).await
    }

    /// Waits for the element and clicks it.
    ///
    /// When nothing matches, the fallback runs if one is set; otherwise the
    /// fail prompt, if installed, decides.
    pub async fn click(&self, timeout: Option<Duration>) -> Result<()> {
        loop {
            match self.get(timeout).await {
                Ok(el) => return el.click().await,
                Err(DeviceError::XPathElementNotFound { .. }) if self.fallback.is_some() => {
                    info!(selector = %self, "element not found, running fallback");
                    if let Some(fallback) = &self.fallback {
                        fallback.run(self.engine.device.clone()).await?;
                    }
                    return Ok(());
                }
                Err(e) => match self.engine.device.consult_fail_prompt(e).await? {
                    PromptDecision::Retry => continue,
                    _ => return Ok(()),
                },
            }
        }
    }

    /// Clicks the first current match without waiting.
    pub async fn click_nowait(&self) -> Result<()> {
        self.matched()
            .await?
            .ok_or_else(|| self.not_found())?
            .click()
            .await
    }

    /// Clicks the element if it shows up within `timeout`; returns whether it did.
    pub async fn click_exists(&self, timeout: Option<Duration>) -> Result<bool> {
        match self.get(timeout).await {
            Ok(el) => {
                el.click().await?;
                Ok(true)
            }
            Err(DeviceError::XPathElementNotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn long_click(&self) -> Result<()> {
        self.get(None).await?.long_click().await
    }

    /// Scrolls inside the matched element until `xpath` shows up.
    pub async fn scroll_to(
        &self,
        xpath: &str,
        direction: Direction,
        max_swipes: u32,
    ) -> Result<Option<XMLElement>> {
        self.get(None)
            .await?
            .scroll_to(xpath, direction, max_swipes)
            .await
    }
}

// ---------------------------------------------------------------------------
// XMLElement
// ---------------------------------------------------------------------------

/// One matched element from a hierarchy snapshot.
///
/// Two elements are equal when they have the same absolute path.
#[derive(Clone)]
pub struct XMLElement {
    data: ElementData,
    source: PageSource,
    engine: XPath,
}

impl PartialEq for XMLElement {
    fn eq(&self, other: &Self) -> bool {
        self.data.path == other.data.path
    }
}

impl Eq for XMLElement {}

impl std::hash::Hash for XMLElement {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.data.path.hash(state);
    }
}

impl fmt::Debug for XMLElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = self.center();
        write!(f, "<XMLElement {:?} center:({}, {})>", self.data.tag, c.x, c.y)
    }
}

impl XMLElement {
    /// Element name, which is the node's class.
    pub fn tag(&self) -> &str {
        &self.data.tag
    }

    pub fn attrib(&self) -> &BTreeMap<String, String> {
        &self.data.attrib
    }

    pub fn text(&self) -> Option<&str> {
        self.data.attrib.get("text").map(String::as_str)
    }

    /// Absolute path such as `/hierarchy/FrameLayout/TextView[1]`.
    pub fn get_xpath(&self, strip_index: bool) -> String {
        if strip_index {
            index_re().replace_all(&self.data.path, "").into_owned()
        } else {
            self.data.path.clone()
        }
    }

    /// Bounds from the `bounds` attribute; empty when it is missing.
    pub fn bounds(&self) -> Rect {
        self.data.bounds()
    }

    /// `(left, top, width, height)`.
    pub fn rect(&self) -> (i32, i32, i32, i32) {
        let b = self.bounds();
        (b.left, b.top, b.width(), b.height())
    }

    pub fn center(&self) -> Point {
        self.offset(0.5, 0.5)
    }

    /// Point at `px`, `py` fractions of the size from the top-left corner.
    pub fn offset(&self, px: f64, py: f64) -> Point {
        self.bounds().offset(px, py)
    }

    /// Bounds as fractions of `window`, or of the device window size.
    pub async fn percent_bounds(&self, window: Option<(i32, i32)>) -> Result<(f64, f64, f64, f64)> {
        let (ww, wh) = match window {
            Some(size) => size,
            None => self.engine.device.window_size().await?,
        };
        let (ww, wh) = (ww.max(1) as f64, wh.max(1) as f64);
        let b = self.bounds();
        Ok((
            b.left as f64 / ww,
            b.top as f64 / wh,
            b.right as f64 / ww,
            b.bottom as f64 / wh,
        ))
    }

    /// Attributes in the shape of a server `objInfo`.
    pub fn info(&self) -> Value {
        self.data.info()
    }

    pub async fn click(&self) -> Result<()> {
        self.engine.send_click(self.center()).await
    }

    pub async fn long_click(&self) -> Result<()> {
        self.engine.send_long_click(self.center()).await
    }

    /// Swipes `scale` of the element's size in `direction`.
    pub async fn swipe(&self, direction: Direction, scale: f64) -> Result<()> {
        let (from, to) = swipe_points(&self.bounds(), direction, scale);
        self.engine.send_swipe(from, to).await
    }

    /// Swipes inside the element and reports whether new children appeared.
    pub async fn scroll(&self, direction: Direction) -> Result<bool> {
        let everything = self.engine.select("//*");
        let before: HashSet<String> = everything
            .all()
            .await?
            .into_iter()
            .map(|e| e.data.path)
            .collect();
        self.swipe(direction, 0.6).await?;
        let prefix = format!("{}/", self.data.path);
        Ok(everything
            .all()
            .await?
            .into_iter()
            .any(|e| !before.contains(&e.data.path) && e.data.path.starts_with(&prefix)))
    }

    /// Scrolls until `xpath` matches, giving up when nothing new appears.
    pub async fn scroll_to(
        &self,
        xpath: &str,
        direction: Direction,
        max_swipes: u32,
    ) -> Result<Option<XMLElement>> {
        let target = self.engine.select(xpath);
        for _ in 0..max_swipes.max(1) {
            if target.exists().await? {
                return target.get_last_match().await.map(Some);
            }
            if !self.scroll(direction).await? {
                break;
            }
        }
        Ok(None)
    }

    /// The parent element, or with `xpath` the nearest ancestor matching it.
    pub fn parent(&self, xpath: Option<&str>) -> Result<Option<XMLElement>> {
        let filter = xpath.map(|x| self.engine.strict(x)).transpose()?;
        let ancestors = self
            .source
            .ancestors_matching(&self.data.path, filter.as_deref())?;
        Ok(ancestors.into_iter().next().map(|data| XMLElement {
            data,
            source: self.source.clone(),
            engine: self.engine.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HIERARCHY: &str = r#"<?xml version='1.0' encoding='UTF-8' standalone='yes' ?>
<hierarchy rotation="0">
  <node index="0" text="" resource-id="" class="android.widget.FrameLayout" package="com.example" content-desc="" checkable="false" clickable="false" bounds="[0,0][1080,1920]">
    <node index="0" text="Hello" resource-id="com.example:id/title" class="android.widget.TextView" package="com.example" content-desc="" checkable="false" clickable="true" bounds="[0,0][1080,100]" />
    <node index="1" text="World" resource-id="com.example:id/body" class="android.widget.TextView" package="com.example" content-desc="greeting" checkable="false" clickable="false" bounds="[0,100][1080,200]" />
    <node index="2" text="" resource-id="" class="android.widget.LinearLayout" package="com.example" content-desc="" bounds="[0,200][1080,400]">
      <node index="0" text="OK" resource-id="android:id/button1" class="android.widget.Button" package="com.example" content-desc="" clickable="true" bounds="[0,200][540,400]" />
    </node>
  </node>
</hierarchy>"#;

    fn strict(xpath: &str) -> std::result::Result<String, XPathError> {
        strict_xpath(xpath, &BTreeMap::new(), false)
    }

    #[test]
    fn translates_shorthand() {
        let cases = [
            ("//TextView/", "//TextView"),
            ("(//TextView)[1]", "(//TextView)[1]"),
            ("@n1", "//*[@resource-id='n1']"),
            (
                "%abc%",
                "//*[contains(@text, 'abc') or contains(@content-desc, 'abc')]",
            ),
            (
                "abc%",
                "//*[starts-with(@text, 'abc') or starts-with(@content-desc, 'abc')]",
            ),
            (
                "n1",
                "//*[@text='n1' or @content-desc='n1' or @resource-id='n1']",
            ),
        ];
        for (input, expected) in cases {
            assert_eq!(strict(input).unwrap(), expected, "{input}");
        }
    }

    #[test]
    fn translates_regex_and_suffix() {
        let re = strict("^hello").unwrap();
        assert!(re.starts_with("//*[re:match(@text, '^hello')"));
        let suffix = strict("%llo").unwrap();
        assert!(suffix.contains("substring(@content-desc, string-length(@content-desc) - 3 + 1)"));
    }

    #[test]
    fn invalid_xpath_is_rejected() {
        assert!(matches!(strict("//*[@text="), Err(XPathError::Invalid(_))));
    }

    #[test]
    fn aliases_resolve() {
        let aliases = BTreeMap::from([("ok".to_string(), "@android:id/button1".to_string())]);
        assert_eq!(
            strict_xpath("$ok", &aliases, true).unwrap(),
            "//*[@resource-id='android:id/button1']"
        );
        assert_eq!(
            strict_xpath("$missing", &aliases, true),
            Err(XPathError::UnresolvedAlias("missing".into()))
        );
        assert_eq!(
            strict_xpath("$missing", &aliases, false).unwrap(),
            "//*[@text='$missing' or @content-desc='$missing' or @resource-id='$missing']"
        );
    }

    #[test]
    fn quotes_strings() {
        assert_eq!(string_quote("abc"), "'abc'");
        assert_eq!(string_quote("it's"), "\"it's\"");
        assert_eq!(string_quote("a'b\"c"), "concat('a', \"'\", 'b\"c')");
    }

    #[test]
    fn safe_tag_names() {
        assert_eq!(safe_xmlstr("android.widget.TextView"), "android.widget.TextView");
        assert_eq!(safe_xmlstr("a$b"), "a.b");
        assert_eq!(safe_xmlstr("$$a@#b&"), "a.b");
    }

    #[test]
    fn camel_case_keys() {
        assert_eq!(kebab_to_camel("resource-id"), "resourceId");
        assert_eq!(kebab_to_camel("long-clickable"), "longClickable");
        assert_eq!(kebab_to_camel("text"), "text");
    }

    #[test]
    fn nodes_are_renamed_after_class() {
        let source = PageSource::new(HIERARCHY);
        let found = source.find("//android.widget.TextView").unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|e| !e.attrib.contains_key("class")));
        assert_eq!(found[0].tag, "android.widget.TextView");
    }

    #[test]
    fn paths_index_only_repeated_tags() {
        let source = PageSource::new(HIERARCHY);
        let found = source.find("//android.widget.TextView").unwrap();
        assert_eq!(
            found[0].path,
            "/hierarchy/android.widget.FrameLayout/android.widget.TextView[1]"
        );
        let button = source.find("//android.widget.Button").unwrap();
        assert_eq!(
            button[0].path,
            "/hierarchy/android.widget.FrameLayout/android.widget.LinearLayout/android.widget.Button"
        );
    }

    #[test]
    fn regex_extension_matches() {
        let source = PageSource::new(HIERARCHY);
        let found = source.find(&strict("^Wor").unwrap()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].attrib["text"], "World");
        assert!(source.find(&strict("^nothing$").unwrap()).unwrap().is_empty());
    }

    #[test]
    fn shorthand_matches_content_desc() {
        let source = PageSource::new(HIERARCHY);
        assert_eq!(source.find(&strict("greeting").unwrap()).unwrap().len(), 1);
        assert_eq!(source.find(&strict("%eting").unwrap()).unwrap().len(), 1);
        assert_eq!(source.find(&strict("%orl%").unwrap()).unwrap().len(), 1);
        assert_eq!(source.find(&strict("@android:id/button1").unwrap()).unwrap().len(), 1);
    }

    #[test]
    fn info_shape() {
        let source = PageSource::new(HIERARCHY);
        let title = &source.find(&strict("Hello").unwrap()).unwrap()[0];
        let info = title.info();
        assert_eq!(info["clickable"], json!(true));
        assert_eq!(info["checkable"], json!(false));
        assert_eq!(info["index"], json!(0));
        assert_eq!(info["resourceId"], json!("com.example:id/title"));
        assert_eq!(info["resourceName"], json!("com.example:id/title"));
        assert_eq!(info["className"], json!("android.widget.TextView"));
        assert_eq!(info["childCount"], json!(0));
        assert_eq!(info["bounds"], json!({"left": 0, "top": 0, "right": 1080, "bottom": 100}));
        assert_eq!(info["packageName"], json!("com.example"));
        assert!(info.get("class").is_none());
    }

    #[test]
    fn batch_of_queries_parses_once() {
        let source = PageSource::new(HIERARCHY);
        let hello = strict("Hello").unwrap();
        let world = strict("World").unwrap();
        source.prefetch(&[hello.as_str(), world.as_str(), "//*[@text="]).unwrap();
        assert_eq!(source.parse_count(), 1);

        let clone = source.clone();
        assert_eq!(clone.find(&hello).unwrap().len(), 1);
        assert_eq!(clone.find(&world).unwrap().len(), 1);
        assert!(clone.find("//*[@text=").is_err());
        assert_eq!(source.parse_count(), 1);

        assert_eq!(source.find("//android.widget.Button").unwrap().len(), 1);
        assert_eq!(source.parse_count(), 2);
    }

    #[test]
    fn ancestors_nearest_first() {
        let source = PageSource::new(HIERARCHY);
        let button = &source.find("//android.widget.Button").unwrap()[0];
        let all = source.ancestors_matching(&button.path, None).unwrap();
        assert_eq!(all[0].tag, "android.widget.LinearLayout");
        assert_eq!(all[1].tag, "android.widget.FrameLayout");
        let framed = source
            .ancestors_matching(&button.path, Some("//android.widget.FrameLayout"))
            .unwrap();
        assert_eq!(framed.len(), 1);
        assert_eq!(framed[0].tag, "android.widget.FrameLayout");
    }

    #[test]
    fn malformed_xml_is_a_parse_error() {
        let source = PageSource::new("<hierarchy><node></hierarchy>");
        assert!(matches!(source.find("//*"), Err(XPathError::Parse(_))));
    }

    #[test]
    fn query_display() {
        let q = XPathQuery::And(Box::new("@a".into()), Box::new("b".into()));
        assert_eq!(q.to_string(), "(@a AND b)");
    }
}
