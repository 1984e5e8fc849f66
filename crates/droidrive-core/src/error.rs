//! The public error type of the device API.
//!
//! Each layer has its own error enum; [`DeviceError`] wraps them so callers
//! of [`Device`](crate::device::Device), [`UiObject`](crate::ui_object::UiObject)
//! and [`XPathSelector`](crate::xpath::XPathSelector) can match on the kind
//! of failure without looking at message text.

use std::time::Duration;

use thiserror::Error;

use crate::adb::AdbError;
use crate::config::SettingsError;
use crate::jsonrpc::RpcError;
use crate::selector::InvalidPropertyError;
use crate::supervisor::ServerError;
use crate::xpath::XPathError;

/// Errors returned by device operations.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Server(ServerError),

    #[error(transparent)]
    XPath(#[from] XPathError),

    #[error(transparent)]
    InvalidProperty(#[from] InvalidPropertyError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Adb(#[from] AdbError),

    /// The selector did not match within the wait budget.
    #[error("UI object not found: {selector}")]
    UiObjectNotFound { selector: String },

    /// The xpath did not match within the wait budget.
    #[error("xpath element not found: {xpath}")]
    XPathElementNotFound { xpath: String },

    /// A click-and-wait loop ran out of time.
    #[error("timed out after {timeout:?} waiting for {xpath}")]
    Timeout { xpath: String, timeout: Duration },

    #[error("plugin not registered: {0}")]
    PluginNotRegistered(String),

    #[error("plugin {name} is not a {expected}")]
    PluginTypeMismatch { name: String, expected: &'static str },

    /// Text input through the AdbKeyboard IME failed.
    #[error("input method error: {0}")]
    InputIme(String),

    /// The operation was aborted from the fail prompt.
    #[error("aborted: {0}")]
    Aborted(String),

    /// The operation does not apply to this kind of object.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// The server returned something the caller cannot use.
    #[error("unexpected response for {method}: {value}")]
    UnexpectedResponse { method: String, value: String },
}

impl DeviceError {
    /// `true` for the expected "nothing matched" outcomes.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            DeviceError::UiObjectNotFound { .. }
                | DeviceError::XPathElementNotFound { .. }
                | DeviceError::Rpc(RpcError::UiObjectNotFound { .. })
        )
    }

    /// `true` when the device or its automation server could not be reached.
    pub fn is_connection(&self) -> bool {
        match self {
            DeviceError::Rpc(e) => e.needs_restart(),
            DeviceError::Server(_) | DeviceError::Adb(_) => true,
            _ => false,
        }
    }
}

/// Transport failures that survived recovery surface as [`DeviceError::Rpc`].
impl From<ServerError> for DeviceError {
    fn from(err: ServerError) -> Self {
        match err {
            ServerError::Rpc(e) => DeviceError::Rpc(e),
            other => DeviceError::Server(other),
        }
    }
}

pub type Result<T, E = DeviceError> = std::result::Result<T, E>;
