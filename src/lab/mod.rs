//! The lab aggregate.
//!
//! A [`Lab`] owns the resolved configuration, the node and link maps, the
//! chosen runtime, and the on-disk directory layout, and coordinates the
//! lifecycle engine in [`scheduler`]. Construction goes through
//! [`LabBuilder`]: options are applied, the topology is populated into
//! nodes and links (status `pending`), and the runtime is initialised.

mod scheduler;

use crate::constants::{DEFAULT_LAB_TIMEOUT, LAB_DIR_MODE, LAB_DIR_PREFIX};
use crate::error::{Error, Result};
use crate::links::{IpWirer, LinkWirer, WireEnd};
use crate::nodes::{NodeRegistry, Peers, KIND_BRIDGE, KIND_HOST, KIND_VR_SROS};
use crate::runtime::{ContainerRuntime, RuntimeConfig};
use crate::runtimes::{resolve_runtime_name, RuntimeRegistry};
use crate::topo::Topology;
use crate::types::{
    Endpoint, GenericContainer, GenericFilter, Link, MgmtNet, NetworkMode, NodeConfig,
    PortBinding, PortSpec, StatusBoard, StatusCounts,
};
use crate::utils;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Kinds that tolerate concurrent boot poorly; their nodes go to the serial
/// lane unless the caller overrides the set.
const SERIAL_KINDS: &[&str] = &[KIND_VR_SROS];

// =============================================================================
// Directory Layout
// =============================================================================

/// On-disk layout of one lab: `clab-<name>/` in the invocation CWD.
#[derive(Debug, Clone, Default)]
pub struct Directory {
    pub lab: PathBuf,
    pub lab_ca: PathBuf,
    pub lab_ca_root: PathBuf,
}

impl Directory {
    fn for_lab(base: Option<&Path>, name: &str) -> Result<Self> {
        let base = match base {
            Some(base) => base.to_path_buf(),
            None => std::env::current_dir()?,
        };
        let lab = base.join(format!("{LAB_DIR_PREFIX}{name}"));
        Ok(Self {
            lab_ca: lab.join("ca"),
            lab_ca_root: lab.join("ca").join("root"),
            lab,
        })
    }
}

/// Final tally of a deploy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeploySummary {
    pub created: usize,
    pub failed: usize,
    /// Nodes never attempted (cancellation or deadline).
    pub skipped: usize,
}

impl From<StatusCounts> for DeploySummary {
    fn from(counts: StatusCounts) -> Self {
        Self {
            created: counts.created,
            failed: counts.failed,
            skipped: counts.pending,
        }
    }
}

impl std::fmt::Display for DeploySummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} created, {} failed, {} skipped",
            self.created, self.failed, self.skipped
        )
    }
}

// =============================================================================
// Builder
// =============================================================================

enum RuntimeChoice {
    /// Look the name up in the registry (empty: flag/env/default order).
    Name(String),
    /// Use a pre-built backend; used by tests and embedders.
    Handle(Box<dyn ContainerRuntime>),
}

/// Builder applying lab options before the topology is populated.
pub struct LabBuilder {
    topo: Option<(Topology, PathBuf)>,
    runtime: RuntimeChoice,
    runtime_config: RuntimeConfig,
    timeout: Duration,
    workers: usize,
    serial_nodes: Option<HashSet<String>>,
    wirer: Arc<dyn LinkWirer>,
    node_registry: NodeRegistry,
    runtime_registry: RuntimeRegistry,
    dir_base: Option<PathBuf>,
}

impl Default for LabBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LabBuilder {
    pub fn new() -> Self {
        Self {
            topo: None,
            runtime: RuntimeChoice::Name(String::new()),
            runtime_config: RuntimeConfig::default(),
            timeout: DEFAULT_LAB_TIMEOUT,
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2),
            serial_nodes: None,
            wirer: Arc::new(IpWirer),
            node_registry: NodeRegistry::with_defaults(),
            runtime_registry: RuntimeRegistry::with_defaults(),
            dir_base: None,
        }
    }

    /// Places the lab directory under `base` instead of the invocation CWD.
    pub fn with_dir_base(mut self, base: PathBuf) -> Self {
        self.dir_base = Some(base);
        self
    }

    /// Loads the topology from a file.
    pub fn with_topology_file(mut self, path: &Path) -> Result<Self> {
        let topo = Topology::from_file(path)?;
        self.topo = Some((topo, path.to_path_buf()));
        Ok(self)
    }

    /// Uses an already-parsed topology.
    pub fn with_topology(mut self, topo: Topology, path: PathBuf) -> Self {
        self.topo = Some((topo, path));
        self
    }

    /// Selects the runtime by name; empty falls back to `CLAB_RUNTIME`,
    /// then docker.
    pub fn with_runtime(mut self, name: &str) -> Self {
        self.runtime = RuntimeChoice::Name(name.to_string());
        self
    }

    /// Uses a pre-built runtime backend instead of the registry.
    pub fn with_runtime_handle(mut self, runtime: Box<dyn ContainerRuntime>) -> Self {
        self.runtime = RuntimeChoice::Handle(runtime);
        self
    }

    pub fn with_runtime_config(mut self, config: RuntimeConfig) -> Self {
        self.runtime_config = config;
        self
    }

    /// Wall-clock budget for deploy and destroy. Zero is rejected.
    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self> {
        if timeout.is_zero() {
            return Err(Error::Config(
                "zero or negative timeouts are not allowed".to_string(),
            ));
        }
        self.timeout = timeout;
        self.runtime_config.timeout = timeout;
        Ok(self)
    }

    /// Leaves the management network behind on destroy.
    pub fn with_keep_mgmt_net(mut self) -> Self {
        self.runtime_config.keep_mgmt_net = true;
        self
    }

    /// Worker count for node and link scheduling.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Long names of nodes that must deploy serially, overriding the
    /// kind-based default policy.
    pub fn with_serial_nodes(mut self, serial: HashSet<String>) -> Self {
        self.serial_nodes = Some(serial);
        self
    }

    /// Replaces the link wirer; tests record instead of plumbing.
    pub fn with_wirer(mut self, wirer: Arc<dyn LinkWirer>) -> Self {
        self.wirer = wirer;
        self
    }

    /// Extends the kind registry before population.
    pub fn with_node_registry(mut self, registry: NodeRegistry) -> Self {
        self.node_registry = registry;
        self
    }

    /// Extends the runtime registry before lookup.
    pub fn with_runtime_registry(mut self, registry: RuntimeRegistry) -> Self {
        self.runtime_registry = registry;
        self
    }

    /// Resolves the configuration, initialises the runtime, and populates
    /// nodes and links.
    pub async fn build(self) -> Result<Lab> {
        let (topo, topo_path) = self
            .topo
            .ok_or_else(|| Error::Config("provide a path to the topology file".to_string()))?;

        let mut mgmt = MgmtNet {
            network: topo.mgmt.network.clone().unwrap_or_default(),
            driver: topo.mgmt.driver.clone().unwrap_or_default(),
            bridge: topo.mgmt.bridge.clone(),
            ipv4_subnet: parse_opt(&topo.mgmt.ipv4_subnet, "mgmt ipv4-subnet")?,
            ipv6_subnet: parse_opt(&topo.mgmt.ipv6_subnet, "mgmt ipv6-subnet")?,
            ipv4_gw: parse_opt(&topo.mgmt.ipv4_gw, "mgmt ipv4-gw")?,
            ipv6_gw: parse_opt(&topo.mgmt.ipv6_gw, "mgmt ipv6-gw")?,
            mtu: topo.mgmt.mtu,
        };
        mgmt.resolve_defaults();
        if mgmt.mtu.is_none() {
            mgmt.mtu = utils::default_net_mtu();
        }

        let (runtime_name, mut runtime) = match self.runtime {
            RuntimeChoice::Name(name) => {
                let resolved = resolve_runtime_name(&name);
                let runtime = self.runtime_registry.create(&resolved)?;
                (resolved, runtime)
            }
            RuntimeChoice::Handle(handle) => (handle.name().to_string(), handle),
        };
        runtime.init(self.runtime_config.clone(), mgmt.clone()).await?;
        let runtime: Arc<dyn ContainerRuntime> = Arc::from(runtime);

        let dir = Directory::for_lab(self.dir_base.as_deref(), &topo.name)?;
        let status = StatusBoard::default();
        let topo_file = topo_path.to_string_lossy().to_string();

        let mut nodes: Peers = HashMap::new();
        let mut node_names: Vec<&String> = topo.topology.nodes.keys().collect();
        node_names.sort();
        for short_name in node_names {
            let def = topo
                .resolved_node(short_name)
                .ok_or_else(|| Error::Config(format!("unknown node {short_name:?}")))?;
            let kind = def
                .kind
                .clone()
                .ok_or_else(|| Error::Config(format!("node {short_name:?} has no kind")))?;

            let cfg = build_node_config(&topo.name, short_name, &kind, &def, &mgmt, &dir, &topo_file)?;

            let mut node = self.node_registry.create(&kind)?;
            node.with_runtime(Arc::clone(&runtime));
            node.with_mgmt_net(mgmt.clone());
            node.init(cfg)?;

            status.register(short_name);
            nodes.insert(short_name.clone(), Arc::from(node));
        }

        let mut links = HashMap::new();
        for (i, def) in topo.topology.links.iter().enumerate() {
            links.insert(
                i,
                Link {
                    a: Endpoint::parse(&def.endpoints[0])?,
                    b: Endpoint::parse(&def.endpoints[1])?,
                    mtu: def.mtu,
                },
            );
        }

        let serial_nodes = self.serial_nodes.unwrap_or_else(|| {
            nodes
                .values()
                .filter(|n| SERIAL_KINDS.contains(&n.config().kind.as_str()))
                .map(|n| n.config().long_name.clone())
                .collect()
        });

        Ok(Lab {
            name: topo.name,
            topo_path,
            nodes,
            links,
            runtime,
            runtime_name,
            status,
            dir,
            timeout: self.timeout,
            workers: self.workers,
            serial_nodes,
            wirer: self.wirer,
        })
    }
}

fn parse_opt<T: std::str::FromStr>(value: &Option<String>, what: &str) -> Result<Option<T>> {
    match value {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("invalid {what}: {raw:?}"))),
    }
}

/// Builds the resolved [`NodeConfig`] for one topology node.
fn build_node_config(
    lab_name: &str,
    short_name: &str,
    kind: &str,
    def: &crate::topo::NodeDefinition,
    mgmt: &MgmtNet,
    dir: &Directory,
    topo_file: &str,
) -> Result<NodeConfig> {
    let mut cfg = NodeConfig {
        kind: kind.to_string(),
        short_name: short_name.to_string(),
        long_name: format!("{LAB_DIR_PREFIX}{lab_name}-{short_name}"),
        image: def.image.clone().unwrap_or_default(),
        entrypoint: def.entrypoint.clone().unwrap_or_default(),
        cmd: def.cmd.clone().unwrap_or_default(),
        env: def.env.clone(),
        binds: def.binds.clone(),
        port_bindings: def
            .ports
            .iter()
            .map(|p| PortBinding::parse(p))
            .collect::<Result<_>>()?,
        port_set: def
            .expose
            .iter()
            .map(|p| PortSpec::parse(p))
            .collect::<Result<_>>()?,
        network_mode: NetworkMode::parse(def.network_mode.as_deref().unwrap_or_default())?,
        mgmt_ipv4_address: def.mgmt_ipv4.clone().unwrap_or_default(),
        mgmt_ipv6_address: def.mgmt_ipv6.clone().unwrap_or_default(),
        mgmt_ipv4_prefix_length: mgmt.ipv4_subnet.map(|s| s.prefix_len()).unwrap_or_default(),
        mgmt_ipv6_prefix_length: mgmt.ipv6_subnet.map(|s| s.prefix_len()).unwrap_or_default(),
        mac_address: def.mac_address.clone().unwrap_or_default(),
        user: def.user.clone().unwrap_or_default(),
        memory: def.memory.clone().unwrap_or_default(),
        cpu: def.cpu.unwrap_or_default(),
        cpu_set: def.cpu_set.clone().unwrap_or_default(),
        sysctls: def.sysctls.clone(),
        extra_hosts: def.extra_hosts.clone(),
        labels: def.labels.clone(),
        startup_delay: def.startup_delay.unwrap_or_default(),
        node_type: def.node_type.clone().unwrap_or_default(),
        config: def.config.clone().map(PathBuf::from),
        startup_config: def.startup_config.clone().map(PathBuf::from),
        res_startup_config: None,
        license: def.license.clone().map(PathBuf::from),
        lab_dir: dir.lab.join(short_name),
    };

    if let Some(static_v4) = (!cfg.mgmt_ipv4_address.is_empty()).then_some(&cfg.mgmt_ipv4_address)
    {
        let addr: std::net::Ipv4Addr = static_v4
            .parse()
            .map_err(|_| Error::Config(format!("invalid mgmt-ipv4 {static_v4:?}")))?;
        match mgmt.ipv4_subnet {
            Some(subnet) if subnet.contains(&addr) => {}
            _ => {
                return Err(Error::Conflict(format!(
                    "node {short_name:?} mgmt-ipv4 {addr} is outside the mgmt subnet"
                )))
            }
        }
    }

    cfg.apply_mandatory_labels(lab_name, topo_file);
    Ok(cfg)
}

// =============================================================================
// Lab
// =============================================================================

/// One declarative topology's materialisation on one host.
pub struct Lab {
    name: String,
    topo_path: PathBuf,
    nodes: Peers,
    links: HashMap<usize, Link>,
    runtime: Arc<dyn ContainerRuntime>,
    runtime_name: String,
    status: StatusBoard,
    dir: Directory,
    timeout: Duration,
    workers: usize,
    serial_nodes: HashSet<String>,
    wirer: Arc<dyn LinkWirer>,
}

impl Lab {
    pub fn builder() -> LabBuilder {
        LabBuilder::new()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> &Peers {
        &self.nodes
    }

    pub fn links(&self) -> &HashMap<usize, Link> {
        &self.links
    }

    pub fn status(&self) -> &StatusBoard {
        &self.status
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn runtime_name(&self) -> &str {
        &self.runtime_name
    }

    pub fn dir(&self) -> &Directory {
        &self.dir
    }

    /// Spawns the deadline watchdog for one top-level operation.
    fn deadline(&self) -> (CancellationToken, tokio::task::JoinHandle<()>) {
        let token = CancellationToken::new();
        let watchdog_token = token.clone();
        let timeout = self.timeout;
        let watchdog = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            warn!("lab deadline of {timeout:?} expired, cancelling");
            watchdog_token.cancel();
        });
        (token, watchdog)
    }

    /// Deploys the whole lab: directories, management network, images,
    /// node waves, links, post-deploy fixups.
    ///
    /// Per-node failures are isolated; failures that make the lab
    /// unbuildable abort immediately.
    pub async fn deploy(&self) -> Result<DeploySummary> {
        info!(lab = %self.name, runtime = %self.runtime_name, "deploying lab");
        let (ctx, watchdog) = self.deadline();

        self.stage_directories()?;
        self.runtime.create_net().await?;
        self.pull_images(&ctx).await;

        self.create_nodes(&ctx, self.workers, self.serial_nodes.clone())
            .await;
        self.create_links(&ctx, self.workers).await;
        self.post_deploy_nodes(&ctx, self.workers).await;

        let expired = ctx.is_cancelled();
        watchdog.abort();
        if expired {
            return Err(Error::Timeout(self.timeout));
        }

        let summary = DeploySummary::from(self.status.counts());
        info!(lab = %self.name, "deploy finished: {summary}");
        Ok(summary)
    }

    /// Destroys the lab: all node containers, host-side link leftovers,
    /// and (unless kept) the management network.
    pub async fn destroy(&self) -> Result<()> {
        info!(lab = %self.name, "destroying lab");
        let (ctx, watchdog) = self.deadline();

        self.delete_nodes(&ctx, self.workers, self.serial_nodes.clone())
            .await;
        self.unwire_host_links().await;
        self.runtime.delete_net().await?;

        let expired = ctx.is_cancelled();
        watchdog.abort();
        if expired {
            return Err(Error::Timeout(self.timeout));
        }
        info!(lab = %self.name, "destroy finished");
        Ok(())
    }

    /// Persists every node's running configuration. Errors are collected
    /// per node and never abort the pass.
    pub async fn save(&self) -> Vec<(String, Error)> {
        let ctx = CancellationToken::new();
        let mut failures = Vec::new();
        for (name, node) in &self.nodes {
            if let Err(e) = node.save_config(&ctx).await {
                warn!(node = %name, "save-config failed: {e}");
                failures.push((name.clone(), e));
            }
        }
        failures
    }

    /// Lists this lab's containers through the runtime.
    pub async fn list_containers(&self) -> Result<Vec<GenericContainer>> {
        let filters = [GenericFilter::label_eq(
            crate::constants::LABEL_CONTAINERLAB,
            &self.name,
        )];
        self.runtime.list_containers(&filters).await
    }

    fn stage_directories(&self) -> Result<()> {
        utils::create_directory(&self.dir.lab, LAB_DIR_MODE)?;
        utils::create_directory(&self.dir.lab_ca_root, LAB_DIR_MODE)?;
        if self.topo_path.is_file() {
            if let Some(file_name) = self.topo_path.file_name() {
                utils::copy_file(&self.topo_path, &self.dir.lab.join(file_name))?;
            }
        }
        Ok(())
    }

    /// Best-effort pre-pull of every image the lab references.
    async fn pull_images(&self, ctx: &CancellationToken) {
        let images: HashSet<String> = self
            .nodes
            .values()
            .flat_map(|n| n.get_images())
            .collect();
        for image in images {
            if ctx.is_cancelled() {
                return;
            }
            if let Err(e) = self.runtime.pull_image(&image).await {
                warn!(image = %image, "image pull failed: {e}");
            }
        }
    }

    /// Resolves where one endpoint's wire side terminates.
    pub(crate) async fn resolve_wire_end(&self, endpoint: &Endpoint) -> Result<WireEnd> {
        let node = self.nodes.get(&endpoint.node).ok_or_else(|| {
            Error::Config(format!("link references unknown node {:?}", endpoint.node))
        })?;
        let cfg = node.config();
        match cfg.kind.as_str() {
            KIND_BRIDGE => Ok(WireEnd::Bridge {
                name: cfg.short_name.clone(),
            }),
            KIND_HOST => Ok(WireEnd::Host),
            _ => {
                let container = self.runtime.inspect(&cfg.long_name).await?;
                if container.pid <= 0 {
                    return Err(Error::LinkWireFailed {
                        link: endpoint.to_string(),
                        reason: format!("container {} has no PID", cfg.long_name),
                    });
                }
                Ok(WireEnd::Netns { pid: container.pid })
            }
        }
    }

    /// Removes host-side interfaces of links terminating on bridge or host
    /// nodes; namespace-bound ends die with their container.
    async fn unwire_host_links(&self) {
        for link in self.links.values() {
            let host_side = [&link.a, &link.b].into_iter().any(|ep| {
                self.nodes
                    .get(&ep.node)
                    .map(|n| matches!(n.config().kind.as_str(), KIND_BRIDGE | KIND_HOST))
                    .unwrap_or(false)
            });
            if !host_side {
                continue;
            }
            let (Ok(a), Ok(b)) = (
                self.resolve_wire_end_for_delete(&link.a),
                self.resolve_wire_end_for_delete(&link.b),
            ) else {
                continue;
            };
            if let Err(e) = self.wirer.unwire(link, &a, &b).await {
                debug!(link = %link, "unwire: {e}");
            }
        }
    }

    /// Deletion-time wire-end resolution: containers may already be gone,
    /// so namespace ends are resolved without consulting the runtime.
    fn resolve_wire_end_for_delete(&self, endpoint: &Endpoint) -> Result<WireEnd> {
        let node = self.nodes.get(&endpoint.node).ok_or_else(|| {
            Error::Config(format!("link references unknown node {:?}", endpoint.node))
        })?;
        match node.config().kind.as_str() {
            KIND_BRIDGE => Ok(WireEnd::Bridge {
                name: node.config().short_name.clone(),
            }),
            KIND_HOST => Ok(WireEnd::Host),
            _ => Ok(WireEnd::Netns { pid: 0 }),
        }
    }
}
