//! Interactive handling of not-found failures.
//!
//! When a [`FailPrompt`] is installed on a device, a selector that fails to
//! match at a click boundary asks the prompt what to do instead of failing
//! immediately. Off by default.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

/// What to do about a failed lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptDecision {
    /// Look the element up again.
    Retry,
    /// Treat the operation as done and carry on.
    Skip,
    /// Fail with [`DeviceError::Aborted`](crate::error::DeviceError::Aborted).
    Abort,
}

impl PromptDecision {
    /// Parses an answer such as `r`, `skip` or `A`.
    pub fn parse(answer: &str) -> Option<Self> {
        match answer.trim().to_ascii_lowercase().as_str() {
            "r" | "retry" => Some(PromptDecision::Retry),
            "s" | "skip" => Some(PromptDecision::Skip),
            "a" | "abort" | "q" => Some(PromptDecision::Abort),
            _ => None,
        }
    }
}

#[async_trait]
pub trait FailPrompt: Send + Sync {
    /// Called with a description of the element that was not found.
    async fn ask(&self, what: &str) -> PromptDecision;
}

/// [`FailPrompt`] that asks on stderr and reads the answer from stdin.
///
/// No answer within the timeout, or an unreadable one, aborts.
#[derive(Debug, Clone)]
pub struct ConsolePrompt {
    timeout: Duration,
}

impl Default for ConsolePrompt {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

impl ConsolePrompt {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl FailPrompt for ConsolePrompt {
    async fn ask(&self, what: &str) -> PromptDecision {
        eprintln!("not found: {what}");
        eprint!("[r]etry, [s]kip or [a]bort? ");
        let mut line = String::new();
        let mut stdin = BufReader::new(tokio::io::stdin());
        match tokio::time::timeout(self.timeout, stdin.read_line(&mut line)).await {
            Ok(Ok(n)) if n > 0 => PromptDecision::parse(&line).unwrap_or(PromptDecision::Abort),
            Ok(_) => PromptDecision::Abort,
            Err(_) => {
                warn!(timeout = ?self.timeout, "no answer from prompt, aborting");
                PromptDecision::Abort
            }
        }
    }
}
