//! JSON-RPC transport to the on-device automation server.
//!
//! [`HttpTransport`] POSTs JSON-RPC 2.0 envelopes to `/jsonrpc/0` on the
//! server, reached through an adb-forwarded local port that is set up once
//! and reused. Error envelopes are classified into typed [`RpcError`]
//! variants so callers can match on the kind of failure.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use droidrive_core::adb::AdbCli;
//! use droidrive_core::jsonrpc::{HttpTransport, JsonRpcTransport};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = HttpTransport::forwarded(Arc::new(AdbCli::new("emulator-5554")));
//! let info = transport
//!     .call("deviceInfo", serde_json::json!([]), Duration::from_secs(10))
//!     .await?;
//! println!("{info}");
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, instrument};

use crate::adb::AdbDevice;
use crate::config::MAX_WAIT;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Port the automation server listens on, on the device.
pub const SERVER_PORT: u16 = 9008;

const JSONRPC_PATH: &str = "/jsonrpc/0";

/// Timeout for a liveness ping.
pub const PING_TIMEOUT: Duration = Duration::from_secs(2);

const STACKTRACE_KEEP: usize = 1000;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from a single JSON-RPC exchange.
#[derive(Error, Debug, Clone)]
pub enum RpcError {
    /// The HTTP request could not be completed.
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// The server answered with a non-2xx status.
    #[error("HTTP status {status}: {body}")]
    HttpStatus { status: u16, body: String },

    /// HTTP 502 from a proxy in front of the server.
    #[error("gateway error: {0}")]
    Gateway(String),

    /// HTTP 410: the app under test quit or crashed.
    #[error("session broken: {0}")]
    SessionBroken(String),

    /// No response arrived within the request timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("UiAutomation not connected: {0}")]
    UiAutomationNotConnected(String),

    #[error("UI object not found: {message}")]
    UiObjectNotFound { code: i64, message: String },

    #[error("stale object reference: {0}")]
    StaleObject(String),

    #[error("null object: {0}")]
    NullObject(String),

    #[error("null pointer on device: {0}")]
    NullPointer(String),

    #[error("stack overflow on device: {message}")]
    StackOverflow { message: String, stacktrace: String },

    /// The response was not a valid JSON-RPC envelope.
    #[error("invalid JSON-RPC response: {0}")]
    Invalid(String),

    #[error("JSON-RPC error {code} ({}): {message}", code_name(*code))]
    Unknown {
        code: i64,
        message: String,
        data: Option<Value>,
    },
}

impl RpcError {
    /// Failures that mean the server process is gone or unusable and a
    /// restart may fix them.
    pub fn needs_restart(&self) -> bool {
        matches!(
            self,
            RpcError::Http(_)
                | RpcError::HttpStatus { .. }
                | RpcError::Gateway(_)
                | RpcError::SessionBroken(_)
                | RpcError::UiAutomationNotConnected(_)
        )
    }

    /// Failures caused by a remote object handle going stale; a fresh
    /// resolution of the same call may succeed.
    pub fn is_stale_handle(&self) -> bool {
        matches!(self, RpcError::StaleObject(_) | RpcError::NullObject(_))
    }
}

/// Human-readable name for a JSON-RPC error code.
pub fn code_name(code: i64) -> &'static str {
    match code {
        -32700 => "Parse error",
        -32600 => "Invalid Request",
        -32601 => "Method not found",
        -32602 => "Invalid params",
        -32603 => "Internal error",
        -32001 => "Jsonrpc error",
        -32002 => "Client error",
        -32099..=-32000 => "Server error",
        _ => "Unknown error",
    }
}

// ---------------------------------------------------------------------------
// Envelope handling
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: String,
    method: &'a str,
    params: &'a Value,
}

/// Builds a JSON-RPC 2.0 request body with a fresh id.
pub fn build_request(method: &str, params: &Value) -> Value {
    let request = RpcRequest {
        jsonrpc: "2.0",
        id: uuid::Uuid::new_v4().simple().to_string(),
        method,
        params,
    };
    serde_json::to_value(request).unwrap_or(Value::Null)
}

/// Maps a JSON-RPC error object to a typed error.
pub fn classify_error(code: i64, message: &str, data: Option<Value>, raw: &str) -> RpcError {
    let data_text = match &data {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    };
    let has = |needle: &str| message.contains(needle) || data_text.contains(needle);

    if raw.contains("UiAutomation not connected") {
        return RpcError::UiAutomationNotConnected("UiAutomation not connected".into());
    }
    for dead in ["android.os.DeadObjectException", "android.os.DeadSystemRuntimeException"] {
        if message.contains(dead) {
            return RpcError::UiAutomationNotConnected(dead.into());
        }
    }
    if has("UiObjectNotFoundException") {
        return RpcError::UiObjectNotFound {
            code,
            message: message.to_string(),
        };
    }
    if has("StaleObjectException") {
        return RpcError::StaleObject(message.to_string());
    }
    if has("NullObjectException") {
        return RpcError::NullObject(message.to_string());
    }
    if has("java.lang.NullPointerException") {
        return RpcError::NullPointer(message.to_string());
    }
    if has("java.lang.StackOverflowError") {
        return RpcError::StackOverflow {
            message: message.to_string(),
            stacktrace: truncate_middle(&data_text, STACKTRACE_KEEP),
        };
    }
    RpcError::Unknown {
        code,
        message: message.to_string(),
        data,
    }
}

fn truncate_middle(s: &str, keep: usize) -> String {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= keep * 2 {
        return s.to_string();
    }
    let head: String = chars[..keep].iter().collect();
    let tail: String = chars[chars.len() - keep..].iter().collect();
    format!("{head}...{tail}")
}

/// Interprets an HTTP status and body as a JSON-RPC response.
pub fn parse_response(status: u16, body: &str) -> Result<Value, RpcError> {
    match status {
        410 => return Err(RpcError::SessionBroken(body.to_string())),
        502 => return Err(RpcError::Gateway(body.to_string())),
        200..=299 => {}
        _ => {
            return Err(RpcError::HttpStatus {
                status,
                body: body.to_string(),
            })
        }
    }

    let data: Value =
        serde_json::from_str(body).map_err(|e| RpcError::Invalid(format!("not JSON: {e}")))?;
    let obj = data
        .as_object()
        .ok_or_else(|| RpcError::Invalid("not an object".into()))?;

    if let Some(error) = obj.get("error") {
        debug!(%error, "jsonrpc error");
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
        let message = error.get("message").and_then(Value::as_str).unwrap_or("");
        let data = error.get("data").cloned();
        return Err(classify_error(code, message, data, body));
    }

    obj.get("result")
        .cloned()
        .ok_or_else(|| RpcError::Invalid("no result field".into()))
}

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

/// Executes JSON-RPC calls and raw GETs against the automation server.
#[async_trait]
pub trait JsonRpcTransport: Send + Sync {
    async fn call(&self, method: &str, params: Value, timeout: Duration) -> Result<Value, RpcError>;

    /// Raw HTTP GET, returning the body on a 2xx status.
    async fn get(&self, path: &str, timeout: Duration) -> Result<String, RpcError>;

    /// Returns `true` if the server answers `/ping` with `pong`.
    async fn ping(&self) -> bool {
        matches!(self.get("/ping", PING_TIMEOUT).await, Ok(body) if body.trim() == "pong")
    }
}

// ---------------------------------------------------------------------------
// HttpTransport
// ---------------------------------------------------------------------------

enum Endpoint {
    Forwarded {
        adb: Arc<dyn AdbDevice>,
        remote_port: u16,
        base_url: OnceCell<String>,
    },
    Fixed(String),
}

/// [`JsonRpcTransport`] over HTTP with a shared keep-alive client.
pub struct HttpTransport {
    endpoint: Endpoint,
    client: reqwest::Client,
}

impl HttpTransport {
    /// Reaches the server through an adb port forward to [`SERVER_PORT`].
    pub fn forwarded(adb: Arc<dyn AdbDevice>) -> Self {
        Self {
            endpoint: Endpoint::Forwarded {
                adb,
                remote_port: SERVER_PORT,
                base_url: OnceCell::new(),
            },
            client: reqwest::Client::new(),
        }
    }

    /// Talks to a fixed base URL such as `http://127.0.0.1:9008`.
    pub fn direct(base_url: impl Into<String>) -> Self {
        Self {
            endpoint: Endpoint::Fixed(base_url.into().trim_end_matches('/').to_string()),
            client: reqwest::Client::new(),
        }
    }

    async fn base_url(&self) -> Result<&str, RpcError> {
        match &self.endpoint {
            Endpoint::Fixed(url) => Ok(url),
            Endpoint::Forwarded {
                adb,
                remote_port,
                base_url,
            } => {
                let url = base_url
                    .get_or_try_init(|| async {
                        let local = adb
                            .forward_port(*remote_port)
                            .await
                            .map_err(|e| RpcError::Http(format!("port forward failed: {e}")))?;
                        debug!(local, remote = remote_port, "forward ready");
                        Ok::<_, RpcError>(format!("http://127.0.0.1:{local}"))
                    })
                    .await?;
                Ok(url)
            }
        }
    }
}

fn map_reqwest(err: reqwest::Error, timeout: Duration) -> RpcError {
    if err.is_timeout() {
        RpcError::Timeout(timeout)
    } else {
        RpcError::Http(err.to_string())
    }
}

#[async_trait]
impl JsonRpcTransport for HttpTransport {
    #[instrument(skip(self, params), level = "debug")]
    async fn call(&self, method: &str, params: Value, timeout: Duration) -> Result<Value, RpcError> {
        let url = format!("{}{JSONRPC_PATH}", self.base_url().await?);
        let payload = build_request(method, &params);
        let response = self
            .client
            .post(&url)
            .timeout(timeout.min(MAX_WAIT))
            .json(&payload)
            .send()
            .await
            .map_err(|e| map_reqwest(e, timeout))?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| map_reqwest(e, timeout))?;
        parse_response(status, &body)
    }

    async fn get(&self, path: &str, timeout: Duration) -> Result<String, RpcError> {
        let url = format!("{}{path}", self.base_url().await?);
        let response = self
            .client
            .get(&url)
            .timeout(timeout.min(MAX_WAIT))
            .send()
            .await
            .map_err(|e| map_reqwest(e, timeout))?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| map_reqwest(e, timeout))?;
        if !(200..300).contains(&status) {
            return Err(RpcError::HttpStatus { status, body });
        }
        Ok(body)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
