//! Constants for the lab engine.
//!
//! All label keys, defaults, and intervals are defined here to keep the
//! wire-visible strings in one place.

use std::time::Duration;

// =============================================================================
// Container Labels
// =============================================================================

/// Label carrying the lab name. Also used to recognize labs on the host.
pub const LABEL_CONTAINERLAB: &str = "containerlab";

/// Label carrying the node short name.
pub const LABEL_NODE_NAME: &str = "clab-node-name";

/// Label carrying the node kind.
pub const LABEL_NODE_KIND: &str = "clab-node-kind";

/// Label carrying the node lab directory path.
pub const LABEL_NODE_LAB_DIR: &str = "clab-node-lab-dir";

/// Label carrying the path of the topology file the lab was built from.
pub const LABEL_TOPO_FILE: &str = "clab-topo-file";

/// Label carrying the management network name; consulted on inspect to
/// extract the node's management addresses.
pub const LABEL_NET_MGMT: &str = "clab-net-mgmt";

// =============================================================================
// Management Network Defaults
// =============================================================================

/// Default management network name.
pub const DEFAULT_MGMT_NET: &str = "clab";

/// Default management network driver.
pub const DEFAULT_MGMT_DRIVER: &str = "bridge";

/// Default IPv4 management subnet.
pub const DEFAULT_MGMT_IPV4_SUBNET: &str = "172.20.20.0/24";

/// Default IPv6 management subnet.
pub const DEFAULT_MGMT_IPV6_SUBNET: &str = "2001:172:20:20::/64";

// =============================================================================
// Runtime Defaults
// =============================================================================

/// Runtime selected when neither the CLI flag nor `CLAB_RUNTIME` name one.
pub const DEFAULT_RUNTIME: &str = "docker";

/// Environment variable overriding the runtime selection.
pub const RUNTIME_ENV_VAR: &str = "CLAB_RUNTIME";

/// Docker engine socket path.
pub const DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Podman engine socket path.
pub const PODMAN_SOCKET: &str = "/run/podman/podman.sock";

/// Grace period for stopping a container before removal.
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(10);

// =============================================================================
// Scheduler Intervals
// =============================================================================

/// Default wall-clock budget for a whole deploy or destroy.
pub const DEFAULT_LAB_TIMEOUT: Duration = Duration::from_secs(120);

/// Interval between link-gate passes over still-pending links.
pub const LINK_GATE_POLL: Duration = Duration::from_millis(100);

/// Backoff between readiness probes in vendor post-deploy hooks.
pub const READINESS_POLL: Duration = Duration::from_secs(5);

// =============================================================================
// Filesystem
// =============================================================================

/// Prefix of the per-lab directory created in the invocation CWD.
pub const LAB_DIR_PREFIX: &str = "clab-";

/// Mode for lab directories; vendor images running as non-root must be able
/// to write startup state into their bind-mounted subdirectories.
pub const LAB_DIR_MODE: u32 = 0o777;

// =============================================================================
// Topology Caps
// =============================================================================

/// Maximum size of a topology file in bytes (1 MiB).
pub const MAX_TOPO_SIZE: usize = 1024 * 1024;

/// Maximum number of nodes in one lab.
pub const MAX_NODES: usize = 1024;

/// Maximum length of a node short name.
pub const MAX_NODE_NAME_LEN: usize = 63;
