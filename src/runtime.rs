//! Container runtime contract.
//!
//! One trait, multiple backends: every engine the lab can run on implements
//! [`ContainerRuntime`], and the lab holds exactly one active instance. The
//! backends must honour identical observable semantics (idempotent network
//! creation, best-effort deletion, label-driven inspection) and differ only
//! in backend-native sentinels.
//!
//! Implementations live in [`crate::runtimes`]; the registry there maps
//! runtime names to factories.

use crate::error::Result;
use crate::types::{GenericContainer, GenericFilter, GenericMgmtIps, MgmtNet, NodeConfig};
use async_trait::async_trait;
use std::time::Duration;

use crate::constants::{DEFAULT_LAB_TIMEOUT, STOP_GRACE_PERIOD};

// =============================================================================
// Runtime Configuration
// =============================================================================

/// Backend-independent runtime options.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Wall-clock budget for engine operations.
    pub timeout: Duration,
    /// Grace period between stop and remove when deleting containers.
    pub stop_grace: Duration,
    /// Leave the management network behind on destroy.
    pub keep_mgmt_net: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_LAB_TIMEOUT,
            stop_grace: STOP_GRACE_PERIOD,
            keep_mgmt_net: false,
        }
    }
}

// =============================================================================
// Exec Output
// =============================================================================

/// Captured output of a command executed inside a container.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i64,
}

impl ExecOutput {
    /// Stdout as lossy UTF-8.
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    /// Stderr as lossy UTF-8.
    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }
}

// =============================================================================
// The Contract
// =============================================================================

/// A container engine behind one contract.
///
/// Handles are shared across scheduler workers as `Arc<dyn
/// ContainerRuntime>`; implementations must be internally thread-safe (the
/// reference backends are stateless HTTP clients over the engine socket).
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Backend name as registered, e.g. `"docker"`.
    fn name(&self) -> &str;

    /// Validates connectivity to the engine and records the management
    /// network configuration.
    ///
    /// Fails with [`crate::Error::RuntimeUnavailable`] when the engine
    /// socket is unreachable.
    async fn init(&mut self, config: RuntimeConfig, mgmt: MgmtNet) -> Result<()>;

    /// The management network this runtime was initialised with.
    fn mgmt(&self) -> &MgmtNet;

    /// Marks the management network as externally owned; `delete_net`
    /// becomes a no-op.
    fn with_keep_mgmt_net(&mut self);

    /// Creates the management network if absent.
    ///
    /// Idempotent: an existing network with matching parameters is adopted
    /// silently; mismatched parameters fail with
    /// [`crate::Error::Conflict`]. After creation, hardware TX-checksum
    /// offload is disabled on the underlying bridge so routers do not see
    /// corrupted checksums on veth traffic.
    async fn create_net(&self) -> Result<()>;

    /// Deletes the management network, but only if `keep_mgmt_net` is not
    /// set and the network carries the `containerlab` label.
    async fn delete_net(&self) -> Result<()>;

    /// Best-effort image pull; an image already present locally is success.
    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Translates the node config into a backend-native container spec,
    /// creates and starts the container, and returns its engine ID.
    async fn create_container(&self, cfg: &NodeConfig) -> Result<String>;

    /// Stops (with the configured grace period) and removes a container.
    /// A missing container is not an error.
    async fn delete_container(&self, name: &str) -> Result<()>;

    /// Lists containers matching the given generic filters.
    ///
    /// Filters are lowered to the backend's native filter language;
    /// unsupported operators produce a warning and are dropped.
    async fn list_containers(&self, filters: &[GenericFilter])
        -> Result<Vec<GenericContainer>>;

    /// Returns the uniform record for one container.
    async fn inspect(&self, name: &str) -> Result<GenericContainer>;

    /// Extracts the container's management addresses from its attachment on
    /// the network named in its `clab-net-mgmt` label. A missing label
    /// yields an empty result, not an error.
    async fn extract_mgmt_ip(&self, id: &str) -> Result<GenericMgmtIps>;

    /// Runs a command inside the container and captures its output.
    async fn exec(&self, name: &str, cmd: &[String]) -> Result<ExecOutput>;
}
