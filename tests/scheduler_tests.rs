//! Lifecycle engine tests against an instrumented in-memory runtime.
//!
//! Covers wave ordering, serial-lane exclusion, the worker bound, the link
//! gate, failure isolation, and cancellation.

use async_trait::async_trait;
use clab::links::{LinkWirer, WireEnd};
use clab::nodes::{Node, NodeRegistry};
use clab::runtime::{ContainerRuntime, ExecOutput, RuntimeConfig};
use clab::topo::{LinkDefinition, NodeDefinition, Topology, TopologySection};
use clab::types::{
    DeploymentStatus, GenericContainer, GenericFilter, GenericMgmtIps, Link, MgmtNet, NodeConfig,
};
use clab::{Error, Lab, Result};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Instrumented Runtime
// =============================================================================

/// Shared observation channels for one test's runtime.
#[derive(Clone, Default)]
struct MockState {
    /// Ordered event log: `deploy-start:<n>`, `deploy-end:<n>`, `delete:<n>`…
    events: Arc<Mutex<Vec<String>>>,
    /// Completed deploy intervals per node short name.
    intervals: Arc<Mutex<HashMap<String, (Instant, Instant)>>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl MockState {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    fn deploy_start_index(&self, node: &str) -> Option<usize> {
        self.events()
            .iter()
            .position(|e| e == &format!("deploy-start:{node}"))
    }
}

struct MockRuntime {
    state: MockState,
    mgmt: MgmtNet,
    /// Short names whose deploy fails.
    fail: HashSet<String>,
    /// Per-node deploy duration override.
    delays: HashMap<String, Duration>,
    default_delay: Duration,
}

impl MockRuntime {
    fn new(state: MockState) -> Self {
        Self {
            state,
            mgmt: MgmtNet::default(),
            fail: HashSet::new(),
            delays: HashMap::new(),
            default_delay: Duration::from_millis(10),
        }
    }

    fn failing(mut self, node: &str) -> Self {
        self.fail.insert(node.to_string());
        self
    }

    fn delayed(mut self, node: &str, delay: Duration) -> Self {
        self.delays.insert(node.to_string(), delay);
        self
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    fn name(&self) -> &str {
        "mock"
    }

    async fn init(&mut self, _config: RuntimeConfig, mgmt: MgmtNet) -> Result<()> {
        self.mgmt = mgmt;
        Ok(())
    }

    fn mgmt(&self) -> &MgmtNet {
        &self.mgmt
    }

    fn with_keep_mgmt_net(&mut self) {}

    async fn create_net(&self) -> Result<()> {
        self.state.push("create-net".to_string());
        Ok(())
    }

    async fn delete_net(&self) -> Result<()> {
        self.state.push("delete-net".to_string());
        Ok(())
    }

    async fn pull_image(&self, _image: &str) -> Result<()> {
        Ok(())
    }

    async fn create_container(&self, cfg: &NodeConfig) -> Result<String> {
        let short = cfg.short_name.clone();
        let n = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_in_flight.fetch_max(n, Ordering::SeqCst);
        let start = Instant::now();
        self.state.push(format!("deploy-start:{short}"));

        let delay = self.delays.get(&short).copied().unwrap_or(self.default_delay);
        tokio::time::sleep(delay).await;

        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.state
            .intervals
            .lock()
            .unwrap()
            .insert(short.clone(), (start, Instant::now()));
        self.state.push(format!("deploy-end:{short}"));

        if self.fail.contains(&short) {
            return Err(Error::DeployFailed {
                node: short,
                phase: "deploy".to_string(),
                reason: "mock failure".to_string(),
            });
        }
        Ok(format!("id-{short}"))
    }

    async fn delete_container(&self, name: &str) -> Result<()> {
        self.state.push(format!("delete:{name}"));
        Ok(())
    }

    async fn list_containers(&self, _filters: &[GenericFilter]) -> Result<Vec<GenericContainer>> {
        Ok(Vec::new())
    }

    async fn inspect(&self, name: &str) -> Result<GenericContainer> {
        Ok(GenericContainer {
            id: name.to_string(),
            short_id: GenericContainer::short_id_of(name),
            pid: 4242,
            ..Default::default()
        })
    }

    async fn extract_mgmt_ip(&self, _id: &str) -> Result<GenericMgmtIps> {
        Ok(GenericMgmtIps::default())
    }

    async fn exec(&self, _name: &str, _cmd: &[String]) -> Result<ExecOutput> {
        Ok(ExecOutput {
            exit_code: 0,
            ..Default::default()
        })
    }
}

// =============================================================================
// Recording Wirer
// =============================================================================

#[derive(Clone, Default)]
struct RecordingWirer {
    wired: Arc<Mutex<Vec<String>>>,
}

impl RecordingWirer {
    fn wired(&self) -> Vec<String> {
        self.wired.lock().unwrap().clone()
    }
}

#[async_trait]
impl LinkWirer for RecordingWirer {
    async fn wire(&self, link: &Link, _a: &WireEnd, _b: &WireEnd) -> Result<()> {
        self.wired.lock().unwrap().push(link.to_string());
        Ok(())
    }

    async fn unwire(&self, _link: &Link, _a: &WireEnd, _b: &WireEnd) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Topology Helpers
// =============================================================================

/// Builds a linux-kind topology; `static_ip` puts a node in the static wave.
fn make_topo(nodes: &[(&str, Option<&str>)], links: &[(&str, &str)]) -> Topology {
    let mut section = TopologySection::default();
    for (name, static_ip) in nodes {
        section.nodes.insert(
            name.to_string(),
            NodeDefinition {
                kind: Some("linux".to_string()),
                image: Some("alpine:3".to_string()),
                mgmt_ipv4: static_ip.map(String::from),
                ..Default::default()
            },
        );
    }
    for (a, b) in links {
        section.links.push(LinkDefinition {
            endpoints: vec![a.to_string(), b.to_string()],
            mtu: None,
        });
    }
    Topology {
        name: "t1".to_string(),
        mgmt: Default::default(),
        topology: section,
    }
}

struct TestLab {
    lab: Lab,
    state: MockState,
    wirer: RecordingWirer,
    _dir: TempDir,
}

async fn build_lab(
    topo: Topology,
    runtime: MockRuntime,
    workers: usize,
    serial: Option<HashSet<String>>,
    timeout: Duration,
) -> TestLab {
    let dir = TempDir::new().unwrap();
    let state = runtime.state.clone();
    let wirer = RecordingWirer::default();

    let mut builder = Lab::builder()
        .with_topology(topo, PathBuf::from("test.clab.yml"))
        .with_runtime_handle(Box::new(runtime))
        .with_wirer(Arc::new(wirer.clone()))
        .with_workers(workers)
        .with_dir_base(dir.path().to_path_buf())
        .with_timeout(timeout)
        .unwrap();
    if let Some(serial) = serial {
        builder = builder.with_serial_nodes(serial);
    }

    TestLab {
        lab: builder.build().await.unwrap(),
        state,
        wirer,
        _dir: dir,
    }
}

fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_two_linux_nodes_deploy_and_wire() {
    let topo = make_topo(&[("a", None), ("b", None)], &[("a:eth1", "b:eth1")]);
    let t = build_lab(topo, MockRuntime::new(MockState::default()), 2, None, secs(30)).await;

    let summary = t.lab.deploy().await.unwrap();
    assert_eq!(summary.created, 2);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.skipped, 0);
    assert_eq!(t.lab.status().get("a"), Some(DeploymentStatus::Created));
    assert_eq!(t.lab.status().get("b"), Some(DeploymentStatus::Created));
    assert_eq!(t.wirer.wired(), vec!["a:eth1<->b:eth1"]);

    // The mgmt network exists before any node deploys.
    let events = t.state.events();
    let net = events.iter().position(|e| e == "create-net").unwrap();
    let first_deploy = events
        .iter()
        .position(|e| e.starts_with("deploy-start"))
        .unwrap();
    assert!(net < first_deploy);
}

#[tokio::test]
async fn test_static_wave_deploys_before_dynamic_wave() {
    let topo = make_topo(
        &[
            ("a", Some("172.20.20.10")),
            ("b", None),
            ("c", None),
            ("d", Some("172.20.20.11")),
        ],
        &[],
    );
    let t = build_lab(topo, MockRuntime::new(MockState::default()), 4, None, secs(30)).await;
    t.lab.deploy().await.unwrap();

    // Every static-wave deploy starts (and here, finishes) before any
    // dynamic-wave deploy starts.
    for static_node in ["a", "d"] {
        for dynamic_node in ["b", "c"] {
            assert!(
                t.state.deploy_start_index(static_node).unwrap()
                    < t.state.deploy_start_index(dynamic_node).unwrap(),
                "{static_node} must start before {dynamic_node}"
            );
        }
    }
}

#[tokio::test]
async fn test_static_node_gets_its_address() {
    let topo = make_topo(&[("a", Some("172.20.20.10"))], &[]);
    let t = build_lab(topo, MockRuntime::new(MockState::default()), 2, None, secs(30)).await;
    assert_eq!(
        t.lab.nodes()["a"].config().mgmt_ipv4_address,
        "172.20.20.10"
    );
    assert!(t.lab.nodes()["a"].config().has_static_mgmt_ip());
}

#[tokio::test]
async fn test_static_address_outside_subnet_is_rejected() {
    let topo = make_topo(&[("a", Some("10.9.9.9"))], &[]);
    let dir = TempDir::new().unwrap();
    let result = Lab::builder()
        .with_topology(topo, PathBuf::from("test.clab.yml"))
        .with_runtime_handle(Box::new(MockRuntime::new(MockState::default())))
        .with_dir_base(dir.path().to_path_buf())
        .build()
        .await;
    assert!(matches!(result, Err(Error::Conflict(_))));
}

#[tokio::test]
async fn test_serial_nodes_deploy_one_at_a_time() {
    let names = ["s1", "s2", "s3", "s4", "s5"];
    let nodes: Vec<(&str, Option<&str>)> = names.iter().map(|n| (*n, None)).collect();
    let topo = make_topo(&nodes, &[]);

    let delay = Duration::from_millis(20);
    let mut runtime = MockRuntime::new(MockState::default());
    for name in names {
        runtime = runtime.delayed(name, delay);
    }
    let serial: HashSet<String> = names.iter().map(|n| format!("clab-t1-{n}")).collect();
    let t = build_lab(topo, runtime, 4, Some(serial), secs(30)).await;

    let started = Instant::now();
    t.lab.deploy().await.unwrap();
    // Wall time is at least the sum of the serialized deploys.
    assert!(started.elapsed() >= delay * names.len() as u32);

    // No two deploy intervals overlap.
    let intervals = t.state.intervals.lock().unwrap().clone();
    assert_eq!(intervals.len(), names.len());
    for (name_x, (start_x, end_x)) in &intervals {
        for (name_y, (start_y, end_y)) in &intervals {
            if name_x == name_y {
                continue;
            }
            assert!(
                end_x <= start_y || end_y <= start_x,
                "deploys of {name_x} and {name_y} overlap"
            );
        }
    }
    assert_eq!(t.state.max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_worker_bound_holds() {
    let names = ["n1", "n2", "n3", "n4", "n5", "n6", "n7", "n8"];
    let nodes: Vec<(&str, Option<&str>)> = names.iter().map(|n| (*n, None)).collect();
    let topo = make_topo(&nodes, &[]);

    let mut runtime = MockRuntime::new(MockState::default());
    for name in names {
        runtime = runtime.delayed(name, Duration::from_millis(20));
    }
    let t = build_lab(topo, runtime, 2, None, secs(30)).await;
    t.lab.deploy().await.unwrap();

    assert!(t.state.max_in_flight.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_failed_node_is_isolated_and_gates_its_links() {
    let topo = make_topo(
        &[("a", None), ("b", None), ("c", None)],
        &[("a:eth1", "b:eth1"), ("a:eth2", "c:eth1")],
    );
    let runtime = MockRuntime::new(MockState::default()).failing("b");
    let t = build_lab(topo, runtime, 2, None, secs(30)).await;

    let summary = t.lab.deploy().await.unwrap();
    assert_eq!(summary.created, 2);
    assert_eq!(summary.failed, 1);

    assert_eq!(t.lab.status().get("a"), Some(DeploymentStatus::Created));
    assert_eq!(t.lab.status().get("b"), Some(DeploymentStatus::Failed));
    assert_eq!(t.lab.status().get("c"), Some(DeploymentStatus::Created));

    // The a-b link is dropped, the a-c sibling link is wired.
    assert_eq!(t.wirer.wired(), vec!["a:eth2<->c:eth1"]);
}

#[tokio::test]
async fn test_cancellation_skips_remaining_work() {
    let topo = make_topo(&[("a", None), ("b", None)], &[("a:eth1", "b:eth1")]);
    let runtime = MockRuntime::new(MockState::default())
        .delayed("a", Duration::from_millis(10))
        .delayed("b", Duration::from_secs(600));
    let t = build_lab(topo, runtime, 2, None, Duration::from_millis(300)).await;

    let err = t.lab.deploy().await.unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));

    // a finished, b never got marked and its link never went in.
    assert_eq!(t.lab.status().get("a"), Some(DeploymentStatus::Created));
    assert_eq!(t.lab.status().get("b"), Some(DeploymentStatus::Pending));
    assert!(t.wirer.wired().is_empty());

    // Cleanup still removes what was created.
    t.lab.destroy().await.unwrap();
    let events = t.state.events();
    assert!(events.contains(&"delete:clab-t1-a".to_string()));
    assert!(events.contains(&"delete-net".to_string()));
}

#[tokio::test]
async fn test_startup_delay_is_honoured() {
    let topo = {
        let mut topo = make_topo(&[("a", None)], &[]);
        topo.topology
            .nodes
            .get_mut("a")
            .unwrap()
            .startup_delay = Some(1);
        topo
    };
    let t = build_lab(topo, MockRuntime::new(MockState::default()), 2, None, secs(30)).await;

    let started = Instant::now();
    t.lab.deploy().await.unwrap();
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(t.lab.status().get("a"), Some(DeploymentStatus::Created));
}

// =============================================================================
// Post-Deploy Pass
// =============================================================================

static POST_DEPLOY_CALLS: AtomicUsize = AtomicUsize::new(0);

#[derive(Default)]
struct ProbeNode {
    cfg: NodeConfig,
    mgmt: MgmtNet,
    runtime: Option<Arc<dyn ContainerRuntime>>,
}

#[async_trait]
impl Node for ProbeNode {
    fn init(&mut self, cfg: NodeConfig) -> Result<()> {
        self.cfg = cfg;
        Ok(())
    }

    fn config(&self) -> &NodeConfig {
        &self.cfg
    }

    fn with_mgmt_net(&mut self, mgmt: MgmtNet) {
        self.mgmt = mgmt;
    }

    fn with_runtime(&mut self, runtime: Arc<dyn ContainerRuntime>) {
        self.runtime = Some(runtime);
    }

    fn get_runtime(&self) -> Option<Arc<dyn ContainerRuntime>> {
        self.runtime.clone()
    }

    async fn post_deploy(
        &self,
        _ctx: &CancellationToken,
        peers: &clab::nodes::Peers,
    ) -> Result<()> {
        // Peers are visible to the hook, per the second-pass contract.
        assert!(peers.contains_key(&self.cfg.short_name));
        POST_DEPLOY_CALLS.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_post_deploy_runs_only_for_created_nodes() {
    let mut topo = make_topo(&[], &[]);
    for name in ["p1", "p2"] {
        topo.topology.nodes.insert(
            name.to_string(),
            NodeDefinition {
                kind: Some("probe".to_string()),
                image: Some("alpine:3".to_string()),
                ..Default::default()
            },
        );
    }

    let mut registry = NodeRegistry::with_defaults();
    registry.register("probe", || Box::new(ProbeNode::default()));

    let state = MockState::default();
    let runtime = MockRuntime::new(state).failing("p2");
    let dir = TempDir::new().unwrap();
    let lab = Lab::builder()
        .with_topology(topo, PathBuf::from("test.clab.yml"))
        .with_runtime_handle(Box::new(runtime))
        .with_node_registry(registry)
        .with_wirer(Arc::new(RecordingWirer::default()))
        .with_dir_base(dir.path().to_path_buf())
        .build()
        .await
        .unwrap();

    POST_DEPLOY_CALLS.store(0, Ordering::SeqCst);
    let summary = lab.deploy().await.unwrap();
    assert_eq!(summary.created, 1);
    assert_eq!(summary.failed, 1);
    // Only the created node's hook ran.
    assert_eq!(POST_DEPLOY_CALLS.load(Ordering::SeqCst), 1);
}
