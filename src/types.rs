//! Core data model for labs: node configuration, links, the management
//! network descriptor, and the uniform container records shared by all
//! runtime backends.

use crate::constants::{
    DEFAULT_MGMT_DRIVER, DEFAULT_MGMT_IPV4_SUBNET, DEFAULT_MGMT_IPV6_SUBNET, DEFAULT_MGMT_NET,
    LABEL_CONTAINERLAB, LABEL_NODE_KIND, LABEL_NODE_LAB_DIR, LABEL_NODE_NAME, LABEL_TOPO_FILE,
};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

// =============================================================================
// Deployment Status
// =============================================================================

/// Per-node progress barrier.
///
/// Transitions are write-once forward: `pending -> created` or
/// `pending -> failed`, never backwards. Link creation gates on both
/// endpoints reaching `created`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Pending,
    Created,
    Failed,
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Created => write!(f, "created"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Outcome of a link-gate check for one link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkGate {
    /// Both endpoints are `created`; the link may be dispatched.
    Ready,
    /// At least one endpoint is still `pending`; retry later.
    Wait,
    /// An endpoint failed (or was never registered); drop the link.
    Blocked(String),
}

/// The lab's status map: every node's [`DeploymentStatus`] behind one
/// read-write lock.
///
/// Keeping all statuses under a single lock lets the link gate observe both
/// endpoints of a link in one critical section.
#[derive(Debug, Default)]
pub struct StatusBoard {
    inner: RwLock<HashMap<String, DeploymentStatus>>,
}

// Status writes are single assignments, so a panicked writer cannot leave
// the map inconsistent; poisoning is recovered rather than propagated.
fn read_statuses(
    lock: &RwLock<HashMap<String, DeploymentStatus>>,
) -> std::sync::RwLockReadGuard<'_, HashMap<String, DeploymentStatus>> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write_statuses(
    lock: &RwLock<HashMap<String, DeploymentStatus>>,
) -> std::sync::RwLockWriteGuard<'_, HashMap<String, DeploymentStatus>> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

/// Final tally reported after a deploy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub created: usize,
    pub failed: usize,
    pub pending: usize,
}

impl StatusBoard {
    /// Registers a node as `pending`.
    pub fn register(&self, name: &str) {
        write_statuses(&self.inner).insert(name.to_string(), DeploymentStatus::Pending);
    }

    /// Applies a forward transition for `name`.
    ///
    /// Returns false (and leaves the entry untouched) if the node is already
    /// in a terminal state or was never registered.
    pub fn mark(&self, name: &str, status: DeploymentStatus) -> bool {
        let mut map = write_statuses(&self.inner);
        match map.get_mut(name) {
            Some(current @ DeploymentStatus::Pending) if status != DeploymentStatus::Pending => {
                *current = status;
                true
            }
            _ => false,
        }
    }

    /// Returns the current status of `name`.
    pub fn get(&self, name: &str) -> Option<DeploymentStatus> {
        read_statuses(&self.inner).get(name).copied()
    }

    /// Evaluates link eligibility for the endpoints `a` and `b` in a single
    /// critical section.
    pub fn gate(&self, a: &str, b: &str) -> LinkGate {
        let map = read_statuses(&self.inner);
        for name in [a, b] {
            match map.get(name) {
                Some(DeploymentStatus::Failed) | None => {
                    return LinkGate::Blocked(name.to_string())
                }
                Some(DeploymentStatus::Pending) => return LinkGate::Wait,
                Some(DeploymentStatus::Created) => {}
            }
        }
        LinkGate::Ready
    }

    /// Counts nodes per status.
    pub fn counts(&self) -> StatusCounts {
        let map = read_statuses(&self.inner);
        let mut counts = StatusCounts::default();
        for status in map.values() {
            match status {
                DeploymentStatus::Created => counts.created += 1,
                DeploymentStatus::Failed => counts.failed += 1,
                DeploymentStatus::Pending => counts.pending += 1,
            }
        }
        counts
    }
}

// =============================================================================
// Network Mode
// =============================================================================

/// Container network attachment mode.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NetworkMode {
    /// Attach to the lab's management network (the default).
    #[default]
    Bridge,
    /// Share the host network namespace.
    Host,
    /// Join the network namespace of another container.
    Container(String),
    /// No networking.
    None,
}

impl NetworkMode {
    /// Parses a topology-level network mode string.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "" | "bridge" => Ok(Self::Bridge),
            "host" => Ok(Self::Host),
            "none" => Ok(Self::None),
            other => match other.strip_prefix("container:") {
                Some(name) if !name.is_empty() => Ok(Self::Container(name.to_string())),
                _ => Err(Error::Config(format!("unsupported network mode {other:?}"))),
            },
        }
    }
}

// =============================================================================
// Bind Mounts
// =============================================================================

/// A parsed bind-mount spec.
///
/// Produced from the `<host-path>:<container-path>[:<opt>[,<opt>...]]`
/// syntax; the options pass through to the backend verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    pub source: String,
    pub destination: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub options: Vec<String>,
}

impl MountSpec {
    /// Parses one bind spec. Fewer than two colon-separated components is an
    /// [`Error::InvalidBind`].
    pub fn parse_bind(spec: &str) -> Result<Self> {
        let mut parts = spec.splitn(3, ':');
        let source = parts.next().unwrap_or_default();
        let destination = match parts.next() {
            Some(dst) if !dst.is_empty() && !source.is_empty() => dst,
            _ => return Err(Error::InvalidBind(spec.to_string())),
        };
        let options = match parts.next() {
            Some(opts) => opts.split(',').map(str::to_string).collect(),
            None => Vec::new(),
        };
        Ok(Self {
            source: source.to_string(),
            destination: destination.to_string(),
            kind: "bind".to_string(),
            options,
        })
    }
}

// =============================================================================
// Port Bindings
// =============================================================================

/// One published port: `[hostIP:]hostPort:containerPort[/proto]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub host_ip: String,
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: String,
}

/// One exposed port: `port[/proto]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    pub port: u16,
    pub protocol: String,
}

fn split_proto(s: &str) -> Result<(&str, String)> {
    match s.split_once('/') {
        Some((port, proto)) => {
            if !matches!(proto, "tcp" | "udp" | "sctp") {
                return Err(Error::Config(format!("unsupported protocol {proto:?}")));
            }
            Ok((port, proto.to_string()))
        }
        None => Ok((s, "tcp".to_string())),
    }
}

fn parse_port(s: &str) -> Result<u16> {
    s.parse::<u16>()
        .map_err(|_| Error::Config(format!("invalid port {s:?}")))
}

impl PortBinding {
    /// Parses a publish spec.
    pub fn parse(spec: &str) -> Result<Self> {
        let (head, protocol) = split_proto(spec)?;
        let parts: Vec<&str> = head.split(':').collect();
        let (host_ip, host_port, container_port) = match parts.as_slice() {
            [hp, cp] => ("", *hp, *cp),
            [ip, hp, cp] => (*ip, *hp, *cp),
            _ => {
                return Err(Error::Config(format!("invalid port binding {spec:?}")));
            }
        };
        Ok(Self {
            host_ip: host_ip.to_string(),
            host_port: parse_port(host_port)?,
            container_port: parse_port(container_port)?,
            protocol,
        })
    }

    /// Engine-map key for the container side, e.g. `"80/tcp"`.
    pub fn container_key(&self) -> String {
        format!("{}/{}", self.container_port, self.protocol)
    }
}

impl PortSpec {
    /// Parses an expose spec.
    pub fn parse(spec: &str) -> Result<Self> {
        let (port, protocol) = split_proto(spec)?;
        Ok(Self {
            port: parse_port(port)?,
            protocol,
        })
    }

    /// Engine-map key, e.g. `"8080/udp"`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.port, self.protocol)
    }
}

// =============================================================================
// Node Configuration
// =============================================================================

/// Per-node configuration, fully resolved from the topology before any
/// lifecycle method runs.
///
/// The node's live deployment status is tracked in the lab's
/// [`StatusBoard`], not here.
#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    /// Node kind; selects the factory in the kind registry.
    pub kind: String,
    /// Human name inside the lab.
    pub short_name: String,
    /// `clab-<labName>-<shortName>`; unique across the host.
    pub long_name: String,
    /// Container image reference.
    pub image: String,
    /// Raw entrypoint string; shell-split when lowered to a backend spec.
    pub entrypoint: String,
    /// Raw command string; shell-split when lowered to a backend spec.
    pub cmd: String,
    /// Environment, merged over kind defaults.
    pub env: HashMap<String, String>,
    /// Raw bind specs, `src:dst[:opts]`.
    pub binds: Vec<String>,
    /// Published ports.
    pub port_bindings: Vec<PortBinding>,
    /// Exposed ports.
    pub port_set: Vec<PortSpec>,
    /// Network attachment mode.
    pub network_mode: NetworkMode,
    /// Static management IPv4 address; empty means dynamic.
    pub mgmt_ipv4_address: String,
    /// Static management IPv6 address; empty means dynamic.
    pub mgmt_ipv6_address: String,
    pub mgmt_ipv4_prefix_length: u8,
    pub mgmt_ipv6_prefix_length: u8,
    /// Container MAC address; empty means runtime-assigned.
    pub mac_address: String,
    pub user: String,
    /// Memory limit with human-size suffix, e.g. `"1gb"`.
    pub memory: String,
    /// CPU limit in cores; quota is `cpu * 100000` per 100000us period.
    pub cpu: f64,
    pub cpu_set: String,
    pub sysctls: HashMap<String, String>,
    pub extra_hosts: Vec<String>,
    /// Container labels; always contains the mandatory clab labels.
    pub labels: HashMap<String, String>,
    /// Seconds to sleep before this node's pre-deploy.
    pub startup_delay: u64,
    /// Vendor variant selector, e.g. the vr-sros `"sr-1"`.
    pub node_type: String,
    /// Config template reference.
    pub config: Option<PathBuf>,
    /// User-provided startup config file.
    pub startup_config: Option<PathBuf>,
    /// Resulting startup config path inside the lab directory.
    pub res_startup_config: Option<PathBuf>,
    /// Licence file to place for vendor kinds.
    pub license: Option<PathBuf>,
    /// Per-node directory under the lab directory; created on pre-deploy.
    pub lab_dir: PathBuf,
}

impl NodeConfig {
    /// Returns true if the node carries a user-assigned management address
    /// and therefore belongs to the static deploy wave.
    pub fn has_static_mgmt_ip(&self) -> bool {
        !self.mgmt_ipv4_address.is_empty() || !self.mgmt_ipv6_address.is_empty()
    }

    /// Stamps the mandatory labels onto the node.
    ///
    /// The runtime backend adds `clab-net-mgmt` when it lowers the config to
    /// a container spec, since the management network is a runtime property.
    pub fn apply_mandatory_labels(&mut self, lab_name: &str, topo_file: &str) {
        self.labels
            .insert(LABEL_CONTAINERLAB.to_string(), lab_name.to_string());
        self.labels
            .insert(LABEL_NODE_NAME.to_string(), self.short_name.clone());
        self.labels
            .insert(LABEL_NODE_KIND.to_string(), self.kind.clone());
        self.labels.insert(
            LABEL_NODE_LAB_DIR.to_string(),
            self.lab_dir.to_string_lossy().to_string(),
        );
        self.labels
            .insert(LABEL_TOPO_FILE.to_string(), topo_file.to_string());
    }

    /// Parses and validates all bind specs.
    pub fn mounts(&self) -> Result<Vec<MountSpec>> {
        self.binds.iter().map(|b| MountSpec::parse_bind(b)).collect()
    }
}

// =============================================================================
// Links
// =============================================================================

/// One end of a link: a node and the interface name inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub node: String,
    pub iface: String,
}

impl Endpoint {
    /// Parses the `"node:iface"` endpoint syntax.
    pub fn parse(s: &str) -> Result<Self> {
        match s.split_once(':') {
            Some((node, iface)) if !node.is_empty() && !iface.is_empty() => Ok(Self {
                node: node.to_string(),
                iface: iface.to_string(),
            }),
            _ => Err(Error::Config(format!("invalid link endpoint {s:?}"))),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.node, self.iface)
    }
}

/// A point-to-point virtual wire between two endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub a: Endpoint,
    pub b: Endpoint,
    /// MTU applied to both sides; None inherits the wirer default.
    pub mtu: Option<u32>,
}

impl std::fmt::Display for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}<->{}", self.a, self.b)
    }
}

// =============================================================================
// Management Network
// =============================================================================

/// The lab's management network descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MgmtNet {
    pub network: String,
    pub driver: String,
    /// Custom underlying bridge name; passed to the backend as a driver
    /// option so an existing bridge is adopted.
    pub bridge: Option<String>,
    pub ipv4_subnet: Option<Ipv4Net>,
    pub ipv6_subnet: Option<Ipv6Net>,
    pub ipv4_gw: Option<std::net::Ipv4Addr>,
    pub ipv6_gw: Option<std::net::Ipv6Addr>,
    pub mtu: Option<u32>,
}

impl MgmtNet {
    /// Fills unset fields with the lab defaults.
    ///
    /// The IPv4 default subnet is injected only when *neither* address
    /// family was requested: a topology that declares only an IPv6 subnet
    /// stays IPv6-only.
    pub fn resolve_defaults(&mut self) {
        if self.network.is_empty() {
            self.network = DEFAULT_MGMT_NET.to_string();
        }
        if self.driver.is_empty() {
            self.driver = DEFAULT_MGMT_DRIVER.to_string();
        }
        if self.ipv4_subnet.is_none() && self.ipv6_subnet.is_none() {
            self.ipv4_subnet = Some(
                DEFAULT_MGMT_IPV4_SUBNET
                    .parse()
                    .expect("default v4 subnet parses"),
            );
            self.ipv6_subnet = Some(
                DEFAULT_MGMT_IPV6_SUBNET
                    .parse()
                    .expect("default v6 subnet parses"),
            );
        }
    }
}

// =============================================================================
// Generic Container Records
// =============================================================================

/// Management addresses extracted from a container's attachment on the
/// network named in its `clab-net-mgmt` label.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericMgmtIps {
    pub ipv4_addr: String,
    pub ipv4_plen: u8,
    pub ipv6_addr: String,
    pub ipv6_plen: u8,
}

/// Uniform container record returned by every runtime backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenericContainer {
    pub names: Vec<String>,
    pub id: String,
    /// First 12 characters of the ID.
    pub short_id: String,
    pub image: String,
    pub state: String,
    pub status: String,
    pub labels: HashMap<String, String>,
    pub pid: i64,
    pub network_settings: GenericMgmtIps,
    pub created: Option<DateTime<Utc>>,
}

impl GenericContainer {
    /// Derives the short ID from a full engine ID.
    pub fn short_id_of(id: &str) -> String {
        id.chars().take(12).collect()
    }
}

// =============================================================================
// Generic Filters
// =============================================================================

/// A backend-agnostic list filter.
///
/// The only supported operator is equality; the pseudo-operator `exists`
/// matches any non-empty value for the field. Backends lower the generic
/// form to their native filter language, warning on and dropping anything
/// else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericFilter {
    /// Native filter family, e.g. `"label"` or `"name"`.
    pub filter_type: String,
    /// Field within the family, e.g. the label key.
    pub field: String,
    pub operator: String,
    pub value: String,
}

impl GenericFilter {
    /// Filter for containers carrying the label `key`, any value.
    pub fn label_exists(key: &str) -> Self {
        Self {
            filter_type: "label".to_string(),
            field: key.to_string(),
            operator: "exists".to_string(),
            value: String::new(),
        }
    }

    /// Filter for containers with label `key` equal to `value`.
    pub fn label_eq(key: &str, value: &str) -> Self {
        Self {
            filter_type: "label".to_string(),
            field: key.to_string(),
            operator: "=".to_string(),
            value: value.to_string(),
        }
    }

    /// Lowers the pseudo-operator `exists` to the canonical equality form
    /// `{field, "=", ""}`. Equality filters pass through unchanged; anything
    /// else is returned as-is for the backend to warn about and drop.
    pub fn normalized(&self) -> Self {
        if self.operator == "exists" {
            let mut f = self.clone();
            f.operator = "=".to_string();
            f.value = String::new();
            return f;
        }
        self.clone()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_parse_with_options() {
        let m = MountSpec::parse_bind("/tmp/x:/x:ro,Z").unwrap();
        assert_eq!(m.source, "/tmp/x");
        assert_eq!(m.destination, "/x");
        assert_eq!(m.kind, "bind");
        assert_eq!(m.options, vec!["ro", "Z"]);
    }

    #[test]
    fn test_bind_parse_without_options() {
        let m = MountSpec::parse_bind("/tmp/x:/x").unwrap();
        assert_eq!(m.source, "/tmp/x");
        assert_eq!(m.destination, "/x");
        assert!(m.options.is_empty());
    }

    #[test]
    fn test_bind_parse_rejects_single_component() {
        assert!(matches!(
            MountSpec::parse_bind("/tmp/x"),
            Err(Error::InvalidBind(_))
        ));
    }

    #[test]
    fn test_status_board_forward_only() {
        let board = StatusBoard::default();
        board.register("a");
        assert!(board.mark("a", DeploymentStatus::Created));
        assert!(!board.mark("a", DeploymentStatus::Failed));
        assert!(!board.mark("a", DeploymentStatus::Pending));
        assert_eq!(board.get("a"), Some(DeploymentStatus::Created));
    }

    #[test]
    fn test_link_gate() {
        let board = StatusBoard::default();
        board.register("a");
        board.register("b");
        assert_eq!(board.gate("a", "b"), LinkGate::Wait);
        board.mark("a", DeploymentStatus::Created);
        assert_eq!(board.gate("a", "b"), LinkGate::Wait);
        board.mark("b", DeploymentStatus::Failed);
        assert_eq!(board.gate("a", "b"), LinkGate::Blocked("b".to_string()));
    }

    #[test]
    fn test_mgmt_net_ipv6_only_keeps_v4_unset() {
        let mut mgmt = MgmtNet {
            ipv6_subnet: Some("2001:db8::/64".parse().unwrap()),
            ..Default::default()
        };
        mgmt.resolve_defaults();
        assert!(mgmt.ipv4_subnet.is_none());
        assert_eq!(mgmt.network, "clab");
    }

    #[test]
    fn test_port_binding_parse() {
        let pb = PortBinding::parse("127.0.0.1:8080:80/udp").unwrap();
        assert_eq!(pb.host_ip, "127.0.0.1");
        assert_eq!(pb.host_port, 8080);
        assert_eq!(pb.container_port, 80);
        assert_eq!(pb.protocol, "udp");

        let pb = PortBinding::parse("2222:22").unwrap();
        assert_eq!(pb.host_ip, "");
        assert_eq!(pb.container_key(), "22/tcp");
    }
}
