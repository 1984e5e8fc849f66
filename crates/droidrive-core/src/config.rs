//! Persistent runtime settings for droidrive.
//!
//! Settings live in `~/.droidrive/config.json`. Every retry count, poll
//! interval and timeout used by the supervisor, the selectors and the watcher
//! is read from here, so a slow device can be tuned without code changes.
//!
//! # Example
//!
//! ```no_run
//! use droidrive_core::config::Settings;
//!
//! let mut settings = Settings::load();
//! settings.set("wait_timeout", serde_json::json!(30.0)).unwrap();
//! settings.save().unwrap();
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;

const CONFIG_FILENAME: &str = "config.json";

/// Returns the droidrive state directory (`~/.droidrive`), creating it if needed.
pub fn droidrive_dir() -> PathBuf {
    let dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".droidrive");
    std::fs::create_dir_all(&dir).ok();
    dir
}

/// Longest wait droidrive will schedule. Larger timeouts are treated as this.
pub const MAX_WAIT: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

/// Converts a seconds value from the settings file into a [`Duration`].
///
/// Negative values clamp to zero; anything above [`MAX_WAIT`] (including
/// infinity) becomes [`MAX_WAIT`].
pub fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).map_or(MAX_WAIT, |d| d.min(MAX_WAIT))
}

/// The instant `timeout` from now, capped at [`MAX_WAIT`].
pub fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout.min(MAX_WAIT)).unwrap_or(now)
}

/// Errors raised by [`Settings::set`].
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("unknown setting: {0}")]
    InvalidKey(String),

    #[error("invalid value for setting {key}: expected {expected}, got {actual}")]
    InvalidType {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("settings serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Runtime settings. All durations are seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Default wait budget for selector and xpath lookups.
    pub wait_timeout: f64,
    /// Sleep applied after every coordinate click.
    pub post_delay: f64,
    /// Delays (before, after) around xpath-dispatched clicks and swipes.
    pub operation_delay: (f64, f64),
    /// Default HTTP timeout for a single JSON-RPC call.
    pub http_timeout: f64,
    /// How long the supervisor waits for a launched server to answer ping.
    pub launch_timeout: f64,
    pub ready_poll_interval: f64,
    /// How long `stop` waits for the server to stop answering ping.
    pub stop_timeout: f64,
    pub xpath_poll_interval: f64,
    pub xpath_click_interval: f64,
    pub watcher_interval: f64,
    /// Cadence used for one cycle after a watcher rule fired.
    pub watcher_fast_interval: f64,
    pub watcher_stop_timeout: f64,
    pub info_retry_tries: u32,
    pub info_retry_delay: f64,
    pub dump_retry_tries: u32,
    pub dump_retry_delay: f64,
    /// How long to wait for the AdbKeyboard IME to become active.
    pub ime_timeout: f64,
    pub broadcast_retry_tries: u32,
    pub broadcast_retry_delay: f64,
    /// Fail on `$alias` references missing from `xpath_aliases`.
    pub xpath_alias_strict: bool,
    pub xpath_aliases: BTreeMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            wait_timeout: 20.0,
            post_delay: 0.0,
            operation_delay: (0.0, 0.0),
            http_timeout: 60.0,
            launch_timeout: 30.0,
            ready_poll_interval: 0.5,
            stop_timeout: 10.0,
            xpath_poll_interval: 0.2,
            xpath_click_interval: 0.5,
            watcher_interval: 2.0,
            watcher_fast_interval: 0.5,
            watcher_stop_timeout: 10.0,
            info_retry_tries: 3,
            info_retry_delay: 0.5,
            dump_retry_tries: 5,
            dump_retry_delay: 0.5,
            ime_timeout: 5.0,
            broadcast_retry_tries: 3,
            broadcast_retry_delay: 1.0,
            xpath_alias_strict: false,
            xpath_aliases: BTreeMap::new(),
        }
    }
}

impl Settings {
    /// Load settings from `~/.droidrive/config.json`.
    ///
    /// Returns [`Default`] if the file does not exist or cannot be parsed.
    pub fn load() -> Self {
        Self::load_from(&droidrive_dir().join(CONFIG_FILENAME))
    }

    /// Load settings from an explicit path, falling back to defaults.
    pub fn load_from(path: &Path) -> Self {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    }

    /// Save settings to `~/.droidrive/config.json`.
    pub fn save(&self) -> std::io::Result<()> {
        self.save_to(&droidrive_dir().join(CONFIG_FILENAME))
    }

    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }

    /// Returns the current value of a setting by name.
    pub fn get(&self, key: &str) -> Option<Value> {
        serde_json::to_value(self).ok()?.get(key).cloned()
    }

    /// Sets one setting by name.
    ///
    /// The key must be a known setting and the value must have the same JSON
    /// shape as the current one. On error nothing is modified.
    pub fn set(&mut self, key: &str, value: Value) -> Result<(), SettingsError> {
        let mut current = serde_json::to_value(&*self)?;
        let slot = current
            .get_mut(key)
            .ok_or_else(|| SettingsError::InvalidKey(key.to_string()))?;

        let invalid = |slot: &Value, value: &Value| SettingsError::InvalidType {
            key: key.to_string(),
            expected: json_kind(slot).to_string(),
            actual: json_kind(value).to_string(),
        };
        if json_kind(slot) != json_kind(&value) {
            return Err(invalid(slot, &value));
        }
        let expected = invalid(slot, &value);
        *slot = value;

        *self = serde_json::from_value(current).map_err(|_| expected)?;
        Ok(())
    }

    pub fn wait_timeout(&self) -> Duration {
        secs(self.wait_timeout)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.wait_timeout, 20.0);
        assert_eq!(s.post_delay, 0.0);
        assert_eq!(s.launch_timeout, 30.0);
        assert_eq!(s.info_retry_tries, 3);
        assert_eq!(s.dump_retry_tries, 5);
        assert!(!s.xpath_alias_strict);
    }

    #[test]
    fn set_known_key_updates_value() {
        let mut s = Settings::default();
        s.set("wait_timeout", json!(5.5)).unwrap();
        assert_eq!(s.wait_timeout, 5.5);
        assert_eq!(s.get("wait_timeout"), Some(json!(5.5)));
    }

    #[test]
    fn set_unknown_key_fails_without_mutation() {
        let mut s = Settings::default();
        let err = s.set("no_such_setting", json!(1)).unwrap_err();
        assert!(matches!(err, SettingsError::InvalidKey(ref k) if k == "no_such_setting"));
        assert_eq!(s, Settings::default());
    }

    #[test]
    fn set_wrong_type_fails_without_mutation() {
        let mut s = Settings::default();
        let err = s.set("post_delay", json!("slow")).unwrap_err();
        assert!(matches!(err, SettingsError::InvalidType { .. }));
        assert_eq!(s, Settings::default());
    }

    #[test]
    fn set_float_on_integer_setting_is_rejected() {
        let mut s = Settings::default();
        assert!(s.set("info_retry_tries", json!(1.5)).is_err());
        assert_eq!(s.info_retry_tries, 3);
        s.set("info_retry_tries", json!(7)).unwrap();
        assert_eq!(s.info_retry_tries, 7);
    }

    #[test]
    fn set_alias_table() {
        let mut s = Settings::default();
        s.set("xpath_aliases", json!({"ok": "@android:id/button1"})).unwrap();
        assert_eq!(s.xpath_aliases.get("ok").map(String::as_str), Some("@android:id/button1"));
    }

    #[test]
    fn deserialize_partial_json_fills_defaults() {
        let s: Settings = serde_json::from_str(r#"{"wait_timeout": 3.0}"#).unwrap();
        assert_eq!(s.wait_timeout, 3.0);
        assert_eq!(s.http_timeout, 60.0);
    }

    #[test]
    fn save_and_load_roundtrip() {
        let path = std::env::temp_dir().join(format!("droidrive-{}.json", uuid::Uuid::new_v4()));
        let mut s = Settings::default();
        s.post_delay = 0.25;
        s.save_to(&path).unwrap();
        let loaded = Settings::load_from(&path);
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded.post_delay, 0.25);
    }

    #[test]
    fn load_from_missing_file_returns_default() {
        let loaded = Settings::load_from(Path::new("/nonexistent/droidrive/config.json"));
        assert_eq!(loaded, Settings::default());
    }

    #[test]
    fn secs_clamps_negative() {
        assert_eq!(secs(-1.0), Duration::ZERO);
        assert_eq!(secs(0.5), Duration::from_millis(500));
    }

    #[test]
    fn secs_caps_huge_values() {
        assert_eq!(secs(1e30), MAX_WAIT);
        assert_eq!(secs(f64::INFINITY), MAX_WAIT);
        assert_eq!(secs(f64::NAN), Duration::ZERO);
    }

    #[tokio::test]
    async fn deadline_after_never_overflows() {
        let start = Instant::now();
        let far = deadline_after(Duration::MAX);
        assert!(far >= start + MAX_WAIT);
        assert!(deadline_after(Duration::from_millis(10)) < far);
    }
}
