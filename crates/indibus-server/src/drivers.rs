//! Driver registry: maps load requests onto backends.

use std::collections::BTreeMap;
use std::sync::Arc;

use indibus_protocol::{DriverKind, DriverSpec, MAX_FRAME_SIZE};

use crate::backend::{
    DeviceBackend, Driver, DriverFactory, LocalBackend, NetworkBackend, ProcessBackend,
};
use crate::error::{ServerError, ServerResult};

/// Known built-in drivers plus the settings used to build external backends.
#[derive(Clone)]
pub struct DriverRegistry {
    builtins: BTreeMap<String, DriverFactory>,
    max_frame_size: usize,
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("builtins", &self.builtins.keys().collect::<Vec<_>>())
            .field("max_frame_size", &self.max_frame_size)
            .finish()
    }
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self {
            builtins: BTreeMap::new(),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Builder: register a built-in driver under `id`.
    pub fn with_driver<F>(mut self, id: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Driver> + Send + Sync + 'static,
    {
        self.register(id, factory);
        self
    }

    pub fn register<F>(&mut self, id: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Driver> + Send + Sync + 'static,
    {
        self.builtins.insert(id.into(), Arc::new(factory));
    }

    /// Frame limit applied to process and network backends.
    pub fn with_max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max;
        self
    }

    /// Ids of the built-in drivers, sorted.
    pub fn builtin_ids(&self) -> impl Iterator<Item = &str> {
        self.builtins.keys().map(String::as_str)
    }

    /// Builds a backend for `spec` without starting it.
    ///
    /// # Errors
    ///
    /// `UnknownDriver` for an unregistered built-in id, `Config` for a
    /// malformed process path or network address.
    pub fn backend(&self, spec: &DriverSpec) -> ServerResult<Arc<dyn DeviceBackend>> {
        let target = spec.target.trim();
        if target.is_empty() {
            return Err(ServerError::config(format!("empty {} driver target", spec.kind)));
        }
        let backend: Arc<dyn DeviceBackend> = match spec.kind {
            DriverKind::Builtin => {
                let id = target.strip_prefix("class+-+").unwrap_or(target);
                let factory = self
                    .builtins
                    .get(id)
                    .ok_or_else(|| ServerError::unknown_driver(target))?;
                Arc::new(LocalBackend::new(id, factory.clone()))
            }
            DriverKind::Process => {
                let mut parts = target.split_whitespace().map(str::to_string);
                let path = parts
                    .next()
                    .ok_or_else(|| ServerError::config("empty process driver path"))?;
                Arc::new(
                    ProcessBackend::new(path)
                        .with_args(parts.collect())
                        .with_max_frame_size(self.max_frame_size),
                )
            }
            DriverKind::Network => {
                Arc::new(NetworkBackend::parse(target)?.with_max_frame_size(self.max_frame_size))
            }
        };
        Ok(backend)
    }
}
