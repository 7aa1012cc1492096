//! Container runtime implementations.
//!
//! Each backend is a [`ContainerRuntime`] over one engine's API socket. The
//! [`RuntimeRegistry`] maps runtime names to factories; the lab asks it for
//! a fresh instance by name.

pub mod docker;
pub mod podman;

pub(crate) mod http;

pub use self::docker::DockerRuntime;
pub use self::podman::PodmanRuntime;

use crate::constants::{DEFAULT_RUNTIME, RUNTIME_ENV_VAR};
use crate::error::{Error, Result};
use crate::runtime::ContainerRuntime;
use std::collections::HashMap;

/// Factory yielding a fresh, uninitialised runtime instance.
pub type RuntimeFactory = fn() -> Box<dyn ContainerRuntime>;

/// Process-wide mapping from runtime name to factory.
///
/// Read-only after construction; additional backends register before the
/// lab is built.
pub struct RuntimeRegistry {
    runtimes: HashMap<&'static str, RuntimeFactory>,
}

impl RuntimeRegistry {
    /// Creates a registry with the built-in backends installed.
    pub fn with_defaults() -> Self {
        let mut registry = Self {
            runtimes: HashMap::new(),
        };
        registry.register("docker", || Box::new(DockerRuntime::new()));
        registry.register("podman", || Box::new(PodmanRuntime::new()));
        registry
    }

    /// Installs a backend factory under `name`.
    pub fn register(&mut self, name: &'static str, factory: RuntimeFactory) {
        self.runtimes.insert(name, factory);
    }

    /// Yields a fresh runtime instance for `name`.
    pub fn create(&self, name: &str) -> Result<Box<dyn ContainerRuntime>> {
        self.runtimes
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| Error::UnknownRuntime(name.to_string()))
    }

    /// Registered runtime names.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.runtimes.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl Default for RuntimeRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Resolves the runtime name to use.
///
/// Order of preference: explicit name, the `CLAB_RUNTIME` environment
/// variable, then the built-in default.
pub fn resolve_runtime_name(explicit: &str) -> String {
    if !explicit.is_empty() {
        return explicit.to_string();
    }
    match std::env::var(RUNTIME_ENV_VAR) {
        Ok(env_name) if !env_name.is_empty() => env_name,
        _ => DEFAULT_RUNTIME.to_string(),
    }
}
