//! Node kinds.
//!
//! Every topology vertex is a [`Node`]: one capability trait, one
//! implementation per kind, and a [`NodeRegistry`] mapping kind names to
//! factories. Kinds share the same control-plane dance (init, pre-deploy,
//! deploy, post-deploy, save, delete) and differ in the defaults they merge
//! and the files they stage.

pub mod bridge;
pub mod host;
pub mod ixia_c;
pub mod linux;
pub mod vr_sros;

pub use self::bridge::BridgeNode;
pub use self::host::HostNode;
pub use self::ixia_c::IxiaCNode;
pub use self::linux::LinuxNode;
pub use self::vr_sros::VrSrosNode;

use crate::constants::LAB_DIR_MODE;
use crate::error::{Error, Result};
use crate::runtime::ContainerRuntime;
use crate::types::{MgmtNet, NodeConfig};
use crate::utils;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Kind Names
// =============================================================================

pub const KIND_LINUX: &str = "linux";
pub const KIND_BRIDGE: &str = "bridge";
pub const KIND_HOST: &str = "host";
pub const KIND_VR_SROS: &str = "vr-sros";
pub const KIND_IXIA_C: &str = "ixia-c";

/// Default connection mode for VM-in-container kinds.
pub const VR_DEF_CONN_MODE: &str = "tc";

/// Peers map handed to post-deploy hooks.
pub type Peers = HashMap<String, Arc<dyn Node>>;

// =============================================================================
// The Capability
// =============================================================================

/// One topology vertex driving its own per-kind lifecycle.
///
/// `init`, `with_mgmt_net`, and `with_runtime` run single-threaded while the
/// lab is being populated; afterwards the node is shared immutably across
/// scheduler workers.
#[async_trait]
pub trait Node: Send + Sync {
    /// Merges kind defaults into the config and finalises it.
    fn init(&mut self, cfg: NodeConfig) -> Result<()>;

    /// The node's resolved configuration.
    fn config(&self) -> &NodeConfig;

    /// Injects the lab's management network (before `init`).
    fn with_mgmt_net(&mut self, mgmt: MgmtNet);

    /// Injects the lab's runtime handle (before `init`).
    fn with_runtime(&mut self, runtime: Arc<dyn ContainerRuntime>);

    /// The runtime handle this node deploys through.
    fn get_runtime(&self) -> Option<Arc<dyn ContainerRuntime>>;

    /// Images this node needs pulled before deploy.
    fn get_images(&self) -> Vec<String> {
        let image = &self.config().image;
        if image.is_empty() {
            Vec::new()
        } else {
            vec![image.clone()]
        }
    }

    /// Stages the node's lab directory and files. Runs before `deploy`.
    fn pre_deploy(&self, lab_name: &str, ca_dir: &Path, ca_root: &Path) -> Result<()> {
        let _ = (lab_name, ca_dir, ca_root);
        utils::create_directory(&self.config().lab_dir, LAB_DIR_MODE)
    }

    /// Materialises the node's container.
    async fn deploy(&self, ctx: &CancellationToken) -> Result<()> {
        let _ = ctx;
        runtime_of(self)?
            .create_container(self.config())
            .await
            .map(|_| ())
    }

    /// Kind-specific fixups after all deploys; may depend on peers being up.
    async fn post_deploy(&self, ctx: &CancellationToken, peers: &Peers) -> Result<()> {
        let _ = (ctx, peers);
        Ok(())
    }

    /// Persists the node's running configuration. No-op for dumb kinds.
    async fn save_config(&self, ctx: &CancellationToken) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Removes the node's container.
    async fn delete(&self, ctx: &CancellationToken) -> Result<()> {
        let _ = ctx;
        runtime_of(self)?
            .delete_container(&self.config().long_name)
            .await
    }
}

/// Fetches the injected runtime handle or reports the wiring bug.
fn runtime_of<N: Node + ?Sized>(node: &N) -> Result<Arc<dyn ContainerRuntime>> {
    node.get_runtime().ok_or_else(|| {
        Error::Config(format!(
            "node {:?} has no runtime attached",
            node.config().short_name
        ))
    })
}

// =============================================================================
// Registry
// =============================================================================

/// Factory yielding a fresh, uninitialised node of one kind.
pub type NodeFactory = fn() -> Box<dyn Node>;

/// Process-wide mapping from kind name to factory.
///
/// Read-only after construction; additional kinds register before the lab
/// is built.
pub struct NodeRegistry {
    kinds: HashMap<&'static str, NodeFactory>,
}

impl NodeRegistry {
    /// Creates a registry with the built-in kinds installed.
    pub fn with_defaults() -> Self {
        let mut registry = Self {
            kinds: HashMap::new(),
        };
        registry.register(KIND_LINUX, || Box::new(LinuxNode::default()));
        registry.register(KIND_BRIDGE, || Box::new(BridgeNode::default()));
        registry.register(KIND_HOST, || Box::new(HostNode::default()));
        registry.register(KIND_VR_SROS, || Box::new(VrSrosNode::default()));
        registry.register(KIND_IXIA_C, || Box::new(IxiaCNode::default()));
        registry
    }

    /// Installs a kind factory under `name`.
    pub fn register(&mut self, name: &'static str, factory: NodeFactory) {
        self.kinds.insert(name, factory);
    }

    /// Yields a fresh node for `kind`.
    pub fn create(&self, kind: &str) -> Result<Box<dyn Node>> {
        self.kinds
            .get(kind)
            .map(|factory| factory())
            .ok_or_else(|| Error::UnknownKind(kind.to_string()))
    }

    /// Registered kind names.
    pub fn kinds(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.kinds.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// =============================================================================
// Config Rendering
// =============================================================================

/// Substitutes node fields into a startup-config template.
///
/// Supported placeholders: `{name}` (short name), `{type}` (node type),
/// `{mgmt_ipv4}`, `{mgmt_ipv6}`.
pub fn render_config(template: &str, cfg: &NodeConfig) -> String {
    template
        .replace("{name}", &cfg.short_name)
        .replace("{type}", &cfg.node_type)
        .replace("{mgmt_ipv4}", &cfg.mgmt_ipv4_address)
        .replace("{mgmt_ipv6}", &cfg.mgmt_ipv6_address)
}
