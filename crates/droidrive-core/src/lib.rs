//! # droidrive-core
//!
//! Core library for driving Android devices through a uiautomator JSON-RPC
//! server running on the device.
//!
//! The library starts and supervises the automation server over adb, sends
//! JSON-RPC calls through a forwarded port, and exposes two ways of finding
//! UI elements: server-side [`selector`]s resolved by uiautomator, and
//! [`xpath`] queries evaluated locally against a hierarchy dump.
//!
//! ## Modules
//!
//! - [`device`] - The device session: coordinates, keys, screen state and entry points
//! - [`supervisor`] - Automation server lifecycle with one-shot recovery
//! - [`jsonrpc`] - JSON-RPC over HTTP and the error classification of responses
//! - [`selector`] - Immutable uiautomator selectors
//! - [`ui_object`] - Waits and actions on selector-resolved objects
//! - [`xpath`] - Shorthand translation, snapshot queries and element actions
//! - [`watcher`] - Popup rules scanned on demand or in the background
//! - [`adb`] / [`installer`] - Device shell access and automation apk installation
//! - [`config`] - Persistent settings
//!
//! ## External Dependencies
//!
//! The `adb` executable must be on `PATH`, and the device needs the
//! `com.github.uiautomator` apks (installed on first start when their
//! files are found in `~/.droidrive/assets`).
//!
//! ## Example
//!
//! ```no_run
//! use droidrive_core::device::Device;
//!
//! # async fn example() -> Result<(), droidrive_core::error::DeviceError> {
//! let d = Device::connect(None).await?;
//! d.watcher().when("%Allow%").click()?;
//! d.xpath_engine().click("//*[@text='Settings']", true, None).await?;
//! println!("{}", d.xpath("@android:id/title").get_text(None).await?.unwrap_or_default());
//! # Ok(())
//! # }
//! ```

pub mod adb;
pub mod config;
pub mod device;
pub mod error;
pub mod geometry;
pub mod input;
pub mod installer;
pub mod jsonrpc;
pub mod plugin;
pub mod prompt;
pub mod selector;
pub mod supervisor;
pub mod ui_object;
pub mod watcher;
pub mod xpath;
