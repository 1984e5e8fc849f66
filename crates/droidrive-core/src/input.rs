//! Text entry.
//!
//! Plain ASCII goes through `input text`. Anything else is sent to the
//! AdbKeyboard input method as a base64 broadcast; when the IME cannot be
//! activated or does not acknowledge, the text is set directly on the
//! focused object instead.

use std::str::FromStr;
use std::sync::OnceLock;

use base64::Engine;
use regex::Regex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{deadline_after, secs};
use crate::device::Device;
use crate::error::{DeviceError, Result};
use crate::selector::Selector;

const IME_ID: &str = "com.github.uiautomator/.AdbKeyboard";

/// Result code of an acknowledged broadcast (`Activity.RESULT_OK`).
const BROADCAST_RESULT_OK: i64 = -1;

const IME_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(300);

fn plain_text_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[-+*/_a-zA-Z0-9 ]+$").unwrap())
}

fn broadcast_result_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"result=(-?\d+)").unwrap())
}

fn broadcast_data_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"data="([^"]+)""#).unwrap())
}

/// Editor actions understood by `send_action`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditorAction {
    Go,
    Search,
    Send,
    Next,
    Done,
    Previous,
}

impl EditorAction {
    /// `EditorInfo.IME_ACTION_*` code.
    pub fn code(&self) -> i32 {
        match self {
            EditorAction::Go => 2,
            EditorAction::Search => 3,
            EditorAction::Send => 4,
            EditorAction::Next => 5,
            EditorAction::Done => 6,
            EditorAction::Previous => 7,
        }
    }
}

impl FromStr for EditorAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "go" => Ok(EditorAction::Go),
            "search" => Ok(EditorAction::Search),
            "send" => Ok(EditorAction::Send),
            "next" => Ok(EditorAction::Next),
            "done" => Ok(EditorAction::Done),
            "previous" => Ok(EditorAction::Previous),
            other => Err(format!("unknown editor action: {other}")),
        }
    }
}

/// Parsed `am broadcast` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastResult {
    pub code: Option<i64>,
    pub data: Option<String>,
}

impl BroadcastResult {
    pub fn parse(output: &str) -> Self {
        Self {
            code: broadcast_result_re()
                .captures(output)
                .and_then(|c| c[1].parse().ok()),
            data: broadcast_data_re().captures(output).map(|c| c[1].to_string()),
        }
    }

    pub fn ok(&self) -> bool {
        self.code == Some(BROADCAST_RESULT_OK)
    }
}

/// `true` if `text` can go through `input text` unchanged.
pub fn is_plain_text(text: &str) -> bool {
    plain_text_re().is_match(text)
}

impl Device {
    /// Types `text` into the focused field, clearing it first when `clear`.
    pub async fn send_keys(&self, text: &str, clear: bool) -> Result<()> {
        if clear {
            self.clear_text().await?;
        }
        if is_plain_text(text) {
            let escaped = text.replace(' ', "%s");
            self.shell(&["input", "text", &escaped]).await?;
            return Ok(());
        }
        let encoded = base64::engine::general_purpose::STANDARD.encode(text.as_bytes());
        match self
            .ime_broadcast("ADB_KEYBOARD_INPUT_TEXT", &[("text", encoded.as_str())])
            .await
        {
            Ok(()) => Ok(()),
            Err(DeviceError::InputIme(reason)) => {
                warn!(%reason, "IME input failed, setting text on the focused object");
                self.select(Selector::new().focused(true))
                    .set_text(text, None)
                    .await
            }
            Err(e) => Err(e),
        }
    }

    /// Clears the focused text field.
    pub async fn clear_text(&self) -> Result<()> {
        match self.ime_broadcast("ADB_KEYBOARD_CLEAR_TEXT", &[]).await {
            Ok(()) => Ok(()),
            Err(DeviceError::InputIme(reason)) => {
                warn!(%reason, "IME clear failed, clearing the focused object");
                self.select(Selector::new().focused(true))
                    .clear_text(None)
                    .await
            }
            Err(e) => Err(e),
        }
    }

    /// Sends an editor action, or a smart enter when `action` is `None`.
    pub async fn send_action(&self, action: Option<EditorAction>) -> Result<()> {
        match action {
            Some(action) => {
                let code = action.code().to_string();
                self.ime_broadcast("ADB_KEYBOARD_EDITOR_CODE", &[("code", code.as_str())])
                    .await
            }
            None => self.ime_broadcast("ADB_KEYBOARD_SMART_ENTER", &[]).await,
        }
    }

    /// The current default input method.
    pub async fn current_ime(&self) -> Result<String> {
        let out = self
            .shell(&["settings", "get", "secure", "default_input_method"])
            .await?;
        Ok(out.output.trim().to_string())
    }

    /// Enables or disables the AdbKeyboard IME.
    ///
    /// Enabling waits up to `ime_timeout` for the IME to become the default.
    pub async fn set_input_ime(&self, enable: bool) -> Result<()> {
        if !enable {
            self.shell(&["ime", "disable", IME_ID]).await?;
            return Ok(());
        }
        if self.current_ime().await? == IME_ID {
            return Ok(());
        }
        let list = self.shell(&["ime", "list", "-s", "-a"]).await?;
        if !list.output.lines().any(|line| line.trim() == IME_ID) {
            return Err(DeviceError::InputIme(format!("{IME_ID} is not installed")));
        }
        self.shell(&["ime", "enable", IME_ID]).await?;
        self.shell(&["ime", "set", IME_ID]).await?;
        self.shell(&["settings", "put", "secure", "default_input_method", IME_ID])
            .await?;

        let deadline = deadline_after(self.with_settings(|s| secs(s.ime_timeout)));
        loop {
            if self.current_ime().await? == IME_ID {
                debug!("AdbKeyboard active");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DeviceError::InputIme(format!("{IME_ID} did not become active")));
            }
            tokio::time::sleep(IME_POLL_INTERVAL).await;
        }
    }

    /// Sends `action` to the IME and requires an OK result, retrying
    /// `broadcast_retry_tries` times.
    async fn ime_broadcast(&self, action: &str, extras: &[(&str, &str)]) -> Result<()> {
        self.set_input_ime(true).await?;

        let mut args = vec!["am", "broadcast", "-a", action];
        for &(key, value) in extras {
            args.extend(["--es", key, value]);
        }
        let (tries, delay) =
            self.with_settings(|s| (s.broadcast_retry_tries.max(1), secs(s.broadcast_retry_delay)));
        let mut last = BroadcastResult { code: None, data: None };
        for attempt in 1..=tries {
            let out = self.shell(&args).await?;
            last = BroadcastResult::parse(&out.output);
            if last.ok() {
                return Ok(());
            }
            debug!(attempt, action, code = ?last.code, "broadcast not acknowledged");
            if attempt < tries {
                tokio::time::sleep(delay).await;
            }
        }
        Err(DeviceError::InputIme(format!(
            "broadcast {action} failed: {}",
            last.data.unwrap_or_default()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_detection() {
        assert!(is_plain_text("hello world 42"));
        assert!(is_plain_text("a-b_c/d*e+f"));
        assert!(!is_plain_text("héllo"));
        assert!(!is_plain_text("a@b.com"));
        assert!(!is_plain_text(""));
    }

    #[test]
    fn parses_broadcast_output() {
        let r = BroadcastResult::parse("Broadcasting: Intent { act=ADB_KEYBOARD_INPUT_TEXT }\nBroadcast completed: result=-1 data=\"success\"");
        assert!(r.ok());
        assert_eq!(r.data.as_deref(), Some("success"));

        let r = BroadcastResult::parse("Broadcast completed: result=0");
        assert_eq!(r.code, Some(0));
        assert!(!r.ok());
        assert!(!BroadcastResult::parse("").ok());
    }

    #[test]
    fn editor_action_codes() {
        assert_eq!("search".parse::<EditorAction>().map(|a| a.code()), Ok(3));
        assert_eq!(EditorAction::Previous.code(), 7);
        assert!("jump".parse::<EditorAction>().is_err());
    }
}
