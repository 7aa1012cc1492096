//! Topology file model.
//!
//! The lab core consumes a parsed [`Topology`]; this module is the thin
//! loader for the declarative YAML format:
//!
//! ```yaml
//! name: srl02
//! mgmt:
//!   ipv4-subnet: 172.100.100.0/24
//! topology:
//!   defaults:
//!     kind: linux
//!   kinds:
//!     linux:
//!       image: alpine:3
//!   nodes:
//!     r1:
//!       kind: vr-sros
//!       mgmt-ipv4: 172.100.100.11
//!     l1: {}
//!   links:
//!     - endpoints: ["r1:eth1", "l1:eth1"]
//! ```
//!
//! Node settings cascade field-wise: `topology.defaults` is overridden by
//! the node's kind entry under `topology.kinds`, which is overridden by the
//! node itself.

use crate::constants::{MAX_NODES, MAX_NODE_NAME_LEN, MAX_TOPO_SIZE};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

// =============================================================================
// Definitions
// =============================================================================

/// Per-node settings as written in the topology file. All fields are
/// optional; unset fields fall through the defaults cascade.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct NodeDefinition {
    pub kind: Option<String>,
    pub image: Option<String>,
    pub entrypoint: Option<String>,
    pub cmd: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub binds: Vec<String>,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub expose: Vec<String>,
    pub network_mode: Option<String>,
    pub mgmt_ipv4: Option<String>,
    pub mgmt_ipv6: Option<String>,
    pub mac_address: Option<String>,
    pub user: Option<String>,
    pub memory: Option<String>,
    pub cpu: Option<f64>,
    pub cpu_set: Option<String>,
    #[serde(default)]
    pub sysctls: HashMap<String, String>,
    #[serde(default)]
    pub extra_hosts: Vec<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub startup_delay: Option<u64>,
    #[serde(rename = "type")]
    pub node_type: Option<String>,
    pub config: Option<String>,
    pub startup_config: Option<String>,
    pub license: Option<String>,
}

impl NodeDefinition {
    /// Overlays `self` on `base`: scalar fields keep `self` when set, maps
    /// merge with `self` winning, lists concatenate after `base`.
    pub fn merged_over(&self, base: &NodeDefinition) -> NodeDefinition {
        let mut out = base.clone();
        macro_rules! take {
            ($($field:ident),*) => {
                $(if self.$field.is_some() { out.$field = self.$field.clone(); })*
            };
        }
        take!(
            kind, image, entrypoint, cmd, network_mode, mgmt_ipv4, mgmt_ipv6, mac_address,
            user, memory, cpu, cpu_set, startup_delay, node_type, config, startup_config,
            license
        );
        for (k, v) in &self.env {
            out.env.insert(k.clone(), v.clone());
        }
        for (k, v) in &self.sysctls {
            out.sysctls.insert(k.clone(), v.clone());
        }
        for (k, v) in &self.labels {
            out.labels.insert(k.clone(), v.clone());
        }
        out.binds.extend(self.binds.iter().cloned());
        out.ports.extend(self.ports.iter().cloned());
        out.expose.extend(self.expose.iter().cloned());
        out.extra_hosts.extend(self.extra_hosts.iter().cloned());
        out
    }
}

/// One link entry: exactly two `"node:iface"` endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct LinkDefinition {
    pub endpoints: Vec<String>,
    pub mtu: Option<u32>,
}

/// Management network settings as written in the topology file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct MgmtDefinition {
    pub network: Option<String>,
    pub driver: Option<String>,
    pub bridge: Option<String>,
    pub ipv4_subnet: Option<String>,
    pub ipv6_subnet: Option<String>,
    pub ipv4_gw: Option<String>,
    pub ipv6_gw: Option<String>,
    pub mtu: Option<u32>,
}

/// The `topology:` block.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct TopologySection {
    #[serde(default)]
    pub defaults: NodeDefinition,
    #[serde(default)]
    pub kinds: HashMap<String, NodeDefinition>,
    #[serde(default)]
    pub nodes: HashMap<String, NodeDefinition>,
    #[serde(default)]
    pub links: Vec<LinkDefinition>,
}

/// A parsed and validated topology file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Topology {
    pub name: String,
    #[serde(default)]
    pub mgmt: MgmtDefinition,
    pub topology: TopologySection,
}

// =============================================================================
// Parsing and Validation
// =============================================================================

fn validate_name(name: &str, what: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Config(format!("{what} name cannot be empty")));
    }
    if name.len() > MAX_NODE_NAME_LEN {
        return Err(Error::Config(format!(
            "{what} name {name:?} exceeds {MAX_NODE_NAME_LEN} characters"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::Config(format!(
            "{what} name {name:?} must be alphanumeric with '-' or '_'"
        )));
    }
    Ok(())
}

impl Topology {
    /// Parses a topology from YAML bytes, capping the input size.
    pub fn from_yaml(yaml: &[u8]) -> Result<Self> {
        if yaml.len() > MAX_TOPO_SIZE {
            return Err(Error::Config(format!(
                "topology file size {} exceeds limit of {}",
                yaml.len(),
                MAX_TOPO_SIZE
            )));
        }
        let topo: Topology = serde_yaml::from_slice(yaml)?;
        topo.validate()?;
        Ok(topo)
    }

    /// Reads and parses a topology file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .map_err(|e| Error::Config(format!("cannot read topology {}: {e}", path.display())))?;
        Self::from_yaml(&bytes)
    }

    /// Returns the effective definition for `node`, with the defaults
    /// cascade applied.
    pub fn resolved_node(&self, node: &str) -> Option<NodeDefinition> {
        let def = self.topology.nodes.get(node)?;
        let mut base = self.topology.defaults.clone();
        let kind = def.kind.clone().or_else(|| base.kind.clone());
        if let Some(kind_def) = kind.as_deref().and_then(|k| self.topology.kinds.get(k)) {
            base = kind_def.merged_over(&base);
        }
        let mut resolved = def.merged_over(&base);
        resolved.kind = kind;
        Some(resolved)
    }

    fn validate(&self) -> Result<()> {
        validate_name(&self.name, "lab")?;

        if self.topology.nodes.is_empty() {
            return Err(Error::Config("topology has no nodes".to_string()));
        }
        if self.topology.nodes.len() > MAX_NODES {
            return Err(Error::Config(format!(
                "topology has {} nodes, limit is {MAX_NODES}",
                self.topology.nodes.len()
            )));
        }
        for name in self.topology.nodes.keys() {
            validate_name(name, "node")?;
        }

        for (i, link) in self.topology.links.iter().enumerate() {
            if link.endpoints.len() != 2 {
                return Err(Error::Config(format!(
                    "link {i} must have exactly two endpoints, has {}",
                    link.endpoints.len()
                )));
            }
            for ep in &link.endpoints {
                let endpoint = crate::types::Endpoint::parse(ep)?;
                if !self.topology.nodes.contains_key(&endpoint.node) {
                    return Err(Error::Config(format!(
                        "link {i} references unknown node {:?}",
                        endpoint.node
                    )));
                }
            }
        }
        Ok(())
    }
}
