//! Named extensions attached to a device.
//!
//! A [`PluginRegistry`] maps a name to a factory that builds the extension
//! from the device it is attached to. The registry is handed to the device
//! when it is built; the first lookup of a name runs its factory and the
//! result is cached for the lifetime of the device.

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::device::Device;
use crate::error::DeviceError;

type Factory = Arc<dyn Fn(&Device) -> Arc<dyn Any + Send + Sync> + Send + Sync>;

/// Plugin factories by name, plus the instances built from them.
#[derive(Default)]
pub struct PluginRegistry {
    factories: HashMap<String, Factory>,
    instances: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory under `name`, replacing any previous one.
    pub fn register<T, F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn(&Device) -> T + Send + Sync + 'static,
    {
        let factory: Factory = Arc::new(move |device| Arc::new(factory(device)));
        self.factories.insert(name.into(), factory);
        self
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Returns the plugin registered as `name`, building it on first use.
    ///
    /// # Errors
    ///
    /// - [`DeviceError::PluginNotRegistered`] if no factory has that name
    /// - [`DeviceError::PluginTypeMismatch`] if the plugin is not a `T`
    pub fn resolve<T: Any + Send + Sync>(
        &self,
        name: &str,
        device: &Device,
    ) -> Result<Arc<T>, DeviceError> {
        let cached = self.lock_instances().get(name).cloned();
        let instance = match cached {
            Some(instance) => instance,
            None => {
                let factory = self
                    .factories
                    .get(name)
                    .ok_or_else(|| DeviceError::PluginNotRegistered(name.to_string()))?;
                // The factory may resolve other plugins, so it runs unlocked.
                let built = factory(device);
                self.lock_instances()
                    .entry(name.to_string())
                    .or_insert(built)
                    .clone()
            }
        };
        instance
            .downcast::<T>()
            .map_err(|_| DeviceError::PluginTypeMismatch {
                name: name.to_string(),
                expected: type_name::<T>(),
            })
    }

    fn lock_instances(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<dyn Any + Send + Sync>>> {
        self.instances.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.names())
            .finish()
    }
}
