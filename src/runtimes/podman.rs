//! Podman runtime backend.
//!
//! Speaks the libpod API over `/run/podman/podman.sock`. Container specs
//! are lowered into a spec-generator-shaped body; mounts use OCI mount
//! records rather than the docker bind-string syntax.

use crate::constants::{LABEL_CONTAINERLAB, LABEL_NET_MGMT, PODMAN_SOCKET};
use crate::error::{Error, Result};
use crate::runtime::{ContainerRuntime, ExecOutput, RuntimeConfig};
use crate::types::{
    GenericContainer, GenericFilter, GenericMgmtIps, MgmtNet, MountSpec, NetworkMode, NodeConfig,
};
use crate::utils;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

use super::docker::demux_stream;
use super::http::{query_encode, EngineClient};

/// libpod API prefix.
const API: &str = "/v4.0.0/libpod";

const CPU_PERIOD_US: u64 = 100_000;

// =============================================================================
// Wire Types (libpod spec generator)
// =============================================================================

#[derive(Debug, Default, Serialize)]
pub struct SpecGenerator {
    pub name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub entrypoint: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub sysctl: HashMap<String, String>,
    pub image: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<MountSpec>,
    pub privileged: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub user: String,
    pub terminal: bool,
    pub remove: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_limits: Option<ResourceLimits>,
    pub netns: Namespace,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub static_ip: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub static_ipv6: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub static_mac: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub portmappings: Vec<PortMappingWire>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub expose: HashMap<u16, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cni_networks: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hostadd: Vec<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct Namespace {
    pub nsmode: String,
}

#[derive(Debug, Default, Serialize)]
pub struct ResourceLimits {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryLimit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuLimit>,
}

#[derive(Debug, Default, Serialize)]
pub struct MemoryLimit {
    pub limit: i64,
}

#[derive(Debug, Default, Serialize)]
pub struct CpuLimit {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period: Option<u64>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub cpus: String,
}

#[derive(Debug, Default, Serialize)]
pub struct PortMappingWire {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub host_ip: String,
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: String,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct NetworkCreateRequest {
    name: String,
    driver: String,
    #[serde(default)]
    ipv6_enabled: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    subnets: Vec<SubnetWire>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    labels: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    options: HashMap<String, String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SubnetWire {
    subnet: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    gateway: String,
}

#[derive(Debug, Default, Deserialize)]
struct NetworkResource {
    #[serde(default)]
    name: String,
    #[serde(default)]
    network_interface: String,
    #[serde(default)]
    subnets: Vec<SubnetWire>,
    #[serde(default)]
    labels: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct ListContainer {
    #[serde(rename = "Id")]
    id: String,
    #[serde(default, rename = "Names")]
    names: Vec<String>,
    #[serde(default, rename = "Image")]
    image: String,
    #[serde(default, rename = "State")]
    state: String,
    #[serde(default, rename = "Status")]
    status: String,
    #[serde(default, rename = "Labels")]
    labels: HashMap<String, String>,
    #[serde(default, rename = "Pid")]
    pid: i64,
    #[serde(default, rename = "Created")]
    created: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerInspect {
    id: String,
    #[serde(default)]
    name: String,
    state: InspectState,
    config: InspectConfig,
    #[serde(default)]
    network_settings: InspectNetworkSettings,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    #[serde(default)]
    status: String,
    #[serde(default)]
    pid: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    image: String,
    #[serde(default)]
    labels: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectNetworkSettings {
    #[serde(default)]
    networks: HashMap<String, EndpointSettings>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EndpointSettings {
    #[serde(default, rename = "IPAddress")]
    ip_address: String,
    #[serde(default, rename = "IPPrefixLen")]
    ip_prefix_len: u8,
    #[serde(default, rename = "GlobalIPv6Address")]
    global_ipv6_address: String,
    #[serde(default, rename = "GlobalIPv6PrefixLen")]
    global_ipv6_prefix_len: u8,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ExecCreateRequest {
    attach_stdout: bool,
    attach_stderr: bool,
    cmd: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ExecCreateResponse {
    id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ExecStartRequest {
    detach: bool,
    tty: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ExecInspectResponse {
    #[serde(default)]
    exit_code: i64,
}

// =============================================================================
// Spec Lowering
// =============================================================================

/// Translates a [`NodeConfig`] into a libpod container spec.
pub fn build_container_spec(cfg: &NodeConfig, mgmt: &MgmtNet) -> Result<SpecGenerator> {
    let mut labels = cfg.labels.clone();
    labels.insert(LABEL_NET_MGMT.to_string(), mgmt.network.clone());

    let mut spec = SpecGenerator {
        name: cfg.long_name.clone(),
        entrypoint: utils::shell_split(&cfg.entrypoint)?,
        command: utils::shell_split(&cfg.cmd)?,
        env: cfg.env.clone(),
        labels,
        hostname: cfg.short_name.clone(),
        sysctl: cfg.sysctls.clone(),
        image: cfg.image.clone(),
        mounts: cfg.mounts()?,
        privileged: true,
        user: cfg.user.clone(),
        terminal: false,
        remove: false,
        hostadd: cfg.extra_hosts.clone(),
        ..Default::default()
    };

    let mut limits = ResourceLimits::default();
    if !cfg.memory.is_empty() {
        limits.memory = Some(MemoryLimit {
            limit: utils::parse_memory(&cfg.memory)? as i64,
        });
    }
    if cfg.cpu > 0.0 || !cfg.cpu_set.is_empty() {
        limits.cpu = Some(CpuLimit {
            quota: (cfg.cpu > 0.0).then(|| (cfg.cpu * CPU_PERIOD_US as f64) as i64),
            period: (cfg.cpu > 0.0).then_some(CPU_PERIOD_US),
            cpus: cfg.cpu_set.clone(),
        });
    }
    if limits.memory.is_some() || limits.cpu.is_some() {
        spec.resource_limits = Some(limits);
    }

    match &cfg.network_mode {
        NetworkMode::Bridge => {
            spec.netns = Namespace {
                nsmode: "bridge".to_string(),
            };
            spec.cni_networks = vec![mgmt.network.clone()];
            spec.static_ip = cfg.mgmt_ipv4_address.clone();
            spec.static_ipv6 = cfg.mgmt_ipv6_address.clone();
            spec.static_mac = cfg.mac_address.clone();
            spec.portmappings = cfg
                .port_bindings
                .iter()
                .map(|pb| PortMappingWire {
                    host_ip: pb.host_ip.clone(),
                    host_port: pb.host_port,
                    container_port: pb.container_port,
                    protocol: pb.protocol.clone(),
                })
                .collect();
            spec.expose = cfg
                .port_set
                .iter()
                .map(|p| (p.port, p.protocol.clone()))
                .collect();
        }
        NetworkMode::Host => {
            spec.netns = Namespace {
                nsmode: "host".to_string(),
            };
        }
        other => {
            return Err(Error::Config(format!(
                "network mode {other:?} is not supported with podman"
            )));
        }
    }

    Ok(spec)
}

/// Lowers generic filters to the libpod `filters` map.
///
/// `exists` lowers to the canonical `{field, "=", ""}` form; operators
/// other than equality are logged and dropped.
pub fn build_filter_args(filters: &[GenericFilter]) -> HashMap<String, Vec<String>> {
    let mut args: HashMap<String, Vec<String>> = HashMap::new();
    for filter in filters {
        let normalized = filter.normalized();
        if normalized.operator != "=" {
            warn!(
                filter_type = %filter.filter_type,
                field = %filter.field,
                operator = %filter.operator,
                "dropping filter with unsupported match type"
            );
            continue;
        }
        args.entry(normalized.filter_type.clone())
            .or_default()
            .push(format!("{}={}", normalized.field, normalized.value));
    }
    args
}

// =============================================================================
// The Backend
// =============================================================================

/// Podman engine backend.
pub struct PodmanRuntime {
    client: EngineClient,
    mgmt: MgmtNet,
    config: RuntimeConfig,
}

impl PodmanRuntime {
    pub fn new() -> Self {
        Self::with_socket(PODMAN_SOCKET)
    }

    /// Uses a non-default engine socket.
    pub fn with_socket(socket: impl AsRef<Path>) -> Self {
        Self {
            client: EngineClient::new(socket),
            mgmt: MgmtNet::default(),
            config: RuntimeConfig::default(),
        }
    }

    async fn inspect_raw(&self, name: &str) -> Result<ContainerInspect> {
        self.client
            .get_json(&format!("{API}/containers/{name}/json"))
            .await
    }

    fn extract_ips(&self, raw: &ContainerInspect) -> GenericMgmtIps {
        let Some(net_name) = raw.config.labels.get(LABEL_NET_MGMT) else {
            warn!(container = %raw.id, "no mgmt net label, cannot extract mgmt IPs");
            return GenericMgmtIps::default();
        };
        let Some(ep) = raw.network_settings.networks.get(net_name) else {
            warn!(container = %raw.id, network = %net_name, "container not attached to mgmt net");
            return GenericMgmtIps::default();
        };
        GenericMgmtIps {
            ipv4_addr: ep.ip_address.clone(),
            ipv4_plen: ep.ip_prefix_len,
            ipv6_addr: ep.global_ipv6_address.clone(),
            ipv6_plen: ep.global_ipv6_prefix_len,
        }
    }
}

impl Default for PodmanRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for PodmanRuntime {
    fn name(&self) -> &str {
        "podman"
    }

    async fn init(&mut self, config: RuntimeConfig, mgmt: MgmtNet) -> Result<()> {
        let socket = self.client.socket_path().to_path_buf();
        self.client = EngineClient::new(socket).with_timeout(config.timeout);
        self.config = config;
        self.mgmt = mgmt;

        self.client
            .get_bytes(&format!("{API}/_ping"))
            .await
            .map_err(|e| Error::RuntimeUnavailable {
                runtime: "podman".to_string(),
                reason: format!("{}: {e}", self.client.socket_path().display()),
            })?;
        debug!(socket = %self.client.socket_path().display(), "podman engine reachable");
        Ok(())
    }

    fn mgmt(&self) -> &MgmtNet {
        &self.mgmt
    }

    fn with_keep_mgmt_net(&mut self) {
        self.config.keep_mgmt_net = true;
    }

    async fn create_net(&self) -> Result<()> {
        let name = &self.mgmt.network;
        match self
            .client
            .get_json::<NetworkResource>(&format!("{API}/networks/{name}/json"))
            .await
        {
            Ok(existing) => {
                let existing_subnets: Vec<&str> =
                    existing.subnets.iter().map(|s| s.subnet.as_str()).collect();
                for subnet in [
                    self.mgmt.ipv4_subnet.map(|s| s.to_string()),
                    self.mgmt.ipv6_subnet.map(|s| s.to_string()),
                ]
                .into_iter()
                .flatten()
                {
                    if !existing_subnets.contains(&subnet.as_str()) {
                        return Err(Error::Conflict(format!(
                            "network {name:?} exists with subnets {existing_subnets:?}, \
                             topology wants {subnet}"
                        )));
                    }
                }
                debug!(network = %name, "mgmt network already present");
                self.disable_tx_offload(&existing);
                return Ok(());
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let mut subnets = Vec::new();
        if let Some(v4) = self.mgmt.ipv4_subnet {
            subnets.push(SubnetWire {
                subnet: v4.to_string(),
                gateway: self.mgmt.ipv4_gw.map(|g| g.to_string()).unwrap_or_default(),
            });
        }
        if let Some(v6) = self.mgmt.ipv6_subnet {
            subnets.push(SubnetWire {
                subnet: v6.to_string(),
                gateway: self.mgmt.ipv6_gw.map(|g| g.to_string()).unwrap_or_default(),
            });
        }
        let mut options = HashMap::new();
        if let Some(mtu) = self.mgmt.mtu {
            options.insert("mtu".to_string(), mtu.to_string());
        }

        let request = NetworkCreateRequest {
            name: name.clone(),
            driver: self.mgmt.driver.clone(),
            ipv6_enabled: self.mgmt.ipv6_subnet.is_some(),
            subnets,
            labels: HashMap::from([(LABEL_CONTAINERLAB.to_string(), String::new())]),
            options,
        };
        let created: NetworkResource = self
            .client
            .post_json(&format!("{API}/networks/create"), Some(&request))
            .await?;
        info!(network = %name, "created mgmt network");
        self.disable_tx_offload(&created);
        Ok(())
    }

    async fn delete_net(&self) -> Result<()> {
        if self.config.keep_mgmt_net {
            debug!(network = %self.mgmt.network, "keeping mgmt network");
            return Ok(());
        }
        let name = &self.mgmt.network;
        match self
            .client
            .get_json::<NetworkResource>(&format!("{API}/networks/{name}/json"))
            .await
        {
            Ok(existing) => {
                if !existing.labels.contains_key(LABEL_CONTAINERLAB) {
                    warn!(network = %name, "mgmt network not created by containerlab, keeping it");
                    return Ok(());
                }
            }
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        }
        match self.client.delete(&format!("{API}/networks/{name}")).await {
            Ok(()) => {
                info!(network = %name, "removed mgmt network");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        if self
            .client
            .get_bytes(&format!("{API}/images/{}/exists", query_encode(image)))
            .await
            .is_ok()
        {
            debug!(image, "image present locally");
            return Ok(());
        }

        info!(image, "pulling image");
        let body = self
            .client
            .post_bytes::<()>(
                &format!("{API}/images/pull?reference={}", query_encode(image)),
                None,
            )
            .await
            .map_err(|e| Error::ImagePull {
                image: image.to_string(),
                reason: e.to_string(),
            })?;

        for line in body.split(|b| *b == b'\n') {
            #[derive(Deserialize)]
            struct Progress {
                error: Option<String>,
            }
            if let Ok(Progress { error: Some(msg) }) = serde_json::from_slice::<Progress>(line) {
                return Err(Error::ImagePull {
                    image: image.to_string(),
                    reason: msg,
                });
            }
        }
        Ok(())
    }

    async fn create_container(&self, cfg: &NodeConfig) -> Result<String> {
        let spec = build_container_spec(cfg, &self.mgmt)?;
        let created: CreateResponse = self
            .client
            .post_json(&format!("{API}/containers/create"), Some(&spec))
            .await?;
        self.client
            .post_empty::<()>(&format!("{API}/containers/{}/start", created.id), None)
            .await?;
        debug!(node = %cfg.long_name, id = %created.id, "container started");
        Ok(created.id)
    }

    async fn delete_container(&self, name: &str) -> Result<()> {
        let grace = self.config.stop_grace.as_secs();
        match self
            .client
            .post_empty::<()>(
                &format!("{API}/containers/{name}/stop?timeout={grace}"),
                None,
            )
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Ok(()),
            // 304: already stopped.
            Err(Error::Api { status: 304, .. }) => {}
            Err(e) => warn!(container = %name, "stop failed: {e}"),
        }
        match self
            .client
            .delete(&format!("{API}/containers/{name}?force=true"))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn list_containers(
        &self,
        filters: &[GenericFilter],
    ) -> Result<Vec<GenericContainer>> {
        let args = build_filter_args(filters);
        let path = if args.is_empty() {
            format!("{API}/containers/json?all=true")
        } else {
            format!(
                "{API}/containers/json?all=true&filters={}",
                query_encode(&serde_json::to_string(&args)?)
            )
        };
        let listed: Vec<ListContainer> = self.client.get_json(&path).await?;

        let mut containers = Vec::with_capacity(listed.len());
        for c in listed {
            let network_settings = match self.inspect_raw(&c.id).await {
                Ok(raw) => self.extract_ips(&raw),
                Err(e) => {
                    warn!(container = %c.id, "could not extract mgmt IPs: {e}");
                    GenericMgmtIps::default()
                }
            };
            containers.push(GenericContainer {
                names: c.names,
                short_id: GenericContainer::short_id_of(&c.id),
                id: c.id,
                image: c.image,
                state: c.state,
                status: c.status,
                labels: c.labels,
                pid: c.pid,
                network_settings,
                created: DateTime::parse_from_rfc3339(&c.created)
                    .ok()
                    .map(|t| t.with_timezone(&Utc)),
            });
        }
        Ok(containers)
    }

    async fn inspect(&self, name: &str) -> Result<GenericContainer> {
        let raw = self.inspect_raw(name).await?;
        let network_settings = self.extract_ips(&raw);
        Ok(GenericContainer {
            names: vec![raw.name.trim_start_matches('/').to_string()],
            short_id: GenericContainer::short_id_of(&raw.id),
            id: raw.id,
            image: raw.config.image,
            state: raw.state.status.clone(),
            status: raw.state.status,
            labels: raw.config.labels,
            pid: raw.state.pid,
            network_settings,
            created: None,
        })
    }

    async fn extract_mgmt_ip(&self, id: &str) -> Result<GenericMgmtIps> {
        let raw = self.inspect_raw(id).await?;
        Ok(self.extract_ips(&raw))
    }

    async fn exec(&self, name: &str, cmd: &[String]) -> Result<ExecOutput> {
        let create = ExecCreateRequest {
            attach_stdout: true,
            attach_stderr: true,
            cmd: cmd.to_vec(),
        };
        let exec: ExecCreateResponse = self
            .client
            .post_json(&format!("{API}/containers/{name}/exec"), Some(&create))
            .await?;

        let start = ExecStartRequest {
            detach: false,
            tty: false,
        };
        let raw = self
            .client
            .post_bytes(&format!("{API}/exec/{}/start", exec.id), Some(&start))
            .await?;
        let (stdout, stderr) = demux_stream(&raw);

        let inspect: ExecInspectResponse = self
            .client
            .get_json(&format!("{API}/exec/{}/json", exec.id))
            .await?;
        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code: inspect.exit_code,
        })
    }
}

impl PodmanRuntime {
    /// Disables TX-checksum offload on the network's bridge interface.
    /// Best-effort: a failure is logged, not fatal.
    fn disable_tx_offload(&self, net: &NetworkResource) {
        let bridge = match &self.mgmt.bridge {
            Some(custom) => custom.clone(),
            None if !net.network_interface.is_empty() => net.network_interface.clone(),
            None => {
                warn!(network = %net.name, "no bridge interface reported, skipping TX offload");
                return;
            }
        };
        match utils::ethtool_tx_off(&bridge) {
            Ok(()) => debug!(bridge = %bridge, "disabled TX checksum offload"),
            Err(e) => {
                warn!(bridge = %bridge, "failed to disable TX checksum offload: {e}")
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
