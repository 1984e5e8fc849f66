//! Installation of the on-device automation apks.
//!
//! The automation server ships as two apks: the app (`com.github.uiautomator`)
//! and its instrumentation test package (`com.github.uiautomator.test`). Both
//! must be present, signed with the same key, and the app must carry the
//! version this crate was built against.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

use crate::adb::{AdbDevice, AdbError};
use crate::config::droidrive_dir;

pub const APP_PACKAGE: &str = "com.github.uiautomator";
pub const TEST_PACKAGE: &str = "com.github.uiautomator.test";

/// Version of the automation apk this crate expects.
pub const SERVER_APK_VERSION: &str = "2.3.3";

const APP_APK: &str = "app-uiautomator.apk";
const TEST_APK: &str = "app-uiautomator-test.apk";

#[derive(Error, Debug)]
pub enum InstallError {
    #[error("apk not found at path: {0}")]
    MissingAsset(PathBuf),

    #[error(transparent)]
    Adb(#[from] AdbError),
}

/// Installs and checks the automation apks on a device.
#[async_trait]
pub trait Installer: Send + Sync {
    /// `true` if either apk is missing, the app version differs from the
    /// expected one, or the two apks are signed differently.
    async fn is_outdated(&self) -> Result<bool, InstallError>;

    async fn install(&self) -> Result<(), InstallError>;

    async fn uninstall(&self) -> Result<(), InstallError>;
}

/// [`Installer`] that installs bundled apk files from a local directory.
pub struct ApkInstaller {
    adb: Arc<dyn AdbDevice>,
    assets_dir: PathBuf,
    version: String,
}

impl ApkInstaller {
    /// Uses apks from `~/.droidrive/assets`.
    pub fn new(adb: Arc<dyn AdbDevice>) -> Self {
        Self::with_assets(adb, droidrive_dir().join("assets"))
    }

    pub fn with_assets(adb: Arc<dyn AdbDevice>, assets_dir: impl Into<PathBuf>) -> Self {
        Self {
            adb,
            assets_dir: assets_dir.into(),
            version: SERVER_APK_VERSION.to_string(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    fn asset(&self, name: &str) -> Result<PathBuf, InstallError> {
        let path = self.assets_dir.join(name);
        if !Path::new(&path).exists() {
            return Err(InstallError::MissingAsset(path));
        }
        Ok(path)
    }
}

#[async_trait]
impl Installer for ApkInstaller {
    async fn is_outdated(&self) -> Result<bool, InstallError> {
        let app = self.adb.package_info(APP_PACKAGE).await?;
        let test = self.adb.package_info(TEST_PACKAGE).await?;
        let (Some(app), Some(test)) = (app, test) else {
            debug!("automation apks missing");
            return Ok(true);
        };
        if app.version_name.as_deref() != Some(self.version.as_str()) {
            debug!(installed = ?app.version_name, expected = %self.version, "apk version differs");
            return Ok(true);
        }
        if app.signature != test.signature {
            debug!("apk signatures differ");
            return Ok(true);
        }
        Ok(false)
    }

    async fn install(&self) -> Result<(), InstallError> {
        let app = self.asset(APP_APK)?;
        let test = self.asset(TEST_APK)?;
        info!(version = %self.version, "installing automation apks");
        self.adb.install(&app).await?;
        self.adb.install(&test).await?;
        Ok(())
    }

    async fn uninstall(&self) -> Result<(), InstallError> {
        info!("uninstalling automation apks");
        self.adb.uninstall(APP_PACKAGE).await?;
        self.adb.uninstall(TEST_PACKAGE).await?;
        Ok(())
    }
}
