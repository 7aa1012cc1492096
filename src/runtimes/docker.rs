//! Docker runtime backend.
//!
//! Speaks the Docker Engine API over `/var/run/docker.sock`. Wire types
//! follow the Engine API field casing; only the subset the lab drives is
//! modelled.

use crate::constants::{DOCKER_SOCKET, LABEL_CONTAINERLAB, LABEL_NET_MGMT};
use crate::error::{Error, Result};
use crate::runtime::{ContainerRuntime, ExecOutput, RuntimeConfig};
use crate::types::{
    GenericContainer, GenericFilter, GenericMgmtIps, MgmtNet, NetworkMode, NodeConfig,
};
use crate::utils;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

use super::http::{query_encode, EngineClient};

/// CPU quota denominator: quota = `cpu * CPU_PERIOD_US` per period.
const CPU_PERIOD_US: i64 = 100_000;

// =============================================================================
// Wire Types (Docker Engine API)
// =============================================================================

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerCreateRequest {
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exposed_ports: Option<HashMap<String, EmptyObject>>,
    pub host_config: HostConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub networking_config: Option<NetworkingConfig>,
}

/// Docker encodes port-set membership as empty JSON objects.
#[derive(Debug, Default, Serialize)]
pub struct EmptyObject {}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostConfig {
    pub binds: Vec<String>,
    pub network_mode: String,
    pub privileged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_bindings: Option<HashMap<String, Vec<PortBindingWire>>>,
    #[serde(skip_serializing_if = "is_zero")]
    pub memory: i64,
    #[serde(skip_serializing_if = "is_zero")]
    pub cpu_quota: i64,
    #[serde(skip_serializing_if = "is_zero")]
    pub cpu_period: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub cpuset_cpus: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub sysctls: HashMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extra_hosts: Vec<String>,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PortBindingWire {
    pub host_ip: String,
    pub host_port: String,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkingConfig {
    pub endpoints_config: HashMap<String, EndpointConfigWire>,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct EndpointConfigWire {
    #[serde(rename = "IPAMConfig", skip_serializing_if = "Option::is_none")]
    pub ipam_config: Option<IpamAddresses>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub mac_address: String,
}

#[derive(Debug, Default, Serialize)]
pub struct IpamAddresses {
    #[serde(rename = "IPv4Address", skip_serializing_if = "String::is_empty")]
    pub ipv4_address: String,
    #[serde(rename = "IPv6Address", skip_serializing_if = "String::is_empty")]
    pub ipv6_address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateResponse {
    id: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NetworkCreateRequest {
    name: String,
    driver: String,
    #[serde(rename = "EnableIPv6")]
    enable_ipv6: bool,
    #[serde(rename = "IPAM")]
    ipam: Ipam,
    options: HashMap<String, String>,
    labels: HashMap<String, String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Ipam {
    #[serde(default)]
    config: Vec<IpamPool>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IpamPool {
    subnet: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    gateway: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NetworkResource {
    id: String,
    #[serde(default, rename = "IPAM")]
    ipam: Ipam,
    #[serde(default)]
    labels: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerSummary {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerInspect {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    created: String,
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

/// Translates a [`NodeConfig`] into a Docker container-create request.
pub fn build_create_request(
    cfg: &NodeConfig,
    mgmt: &MgmtNet,
) -> Result<ContainerCreateRequest> {
    let entrypoint = match utils::shell_split(&cfg.entrypoint)? {
        v if v.is_empty() => None,
        v => Some(v),
    };
    let cmd = match utils::shell_split(&cfg.cmd)? {
        v if v.is_empty() => None,
        v => Some(v),
    };

    let mut env: Vec<String> = cfg.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
    env.sort_unstable();

    // The mgmt network name rides along as a label so inspection can find
    // the right attachment later.
    let mut labels = cfg.labels.clone();
    labels.insert(LABEL_NET_MGMT.to_string(), mgmt.network.clone());

    // Validate the binds, then re-emit them in the engine's own syntax.
    let binds = cfg
        .mounts()?
        .iter()
        .map(|m| {
            if m.options.is_empty() {
                format!("{}:{}", m.source, m.destination)
            } else {
                format!("{}:{}:{}", m.source, m.destination, m.options.join(","))
            }
        })
        .collect();

    let memory = if cfg.memory.is_empty() {
        0
    } else {
        utils::parse_memory(&cfg.memory)? as i64
    };
    let (cpu_quota, cpu_period) = if cfg.cpu > 0.0 {
        ((cfg.cpu * CPU_PERIOD_US as f64) as i64, CPU_PERIOD_US)
    } else {
        (0, 0)
    };

    let mut request = ContainerCreateRequest {
        image: cfg.image.clone(),
        entrypoint,
        cmd,
        env,
        labels,
        hostname: Some(cfg.short_name.clone()),
        user: cfg.user.clone(),
        exposed_ports: None,
        host_config: HostConfig {
            binds,
            privileged: true,
            memory,
            cpu_quota,
            cpu_period,
            cpuset_cpus: cfg.cpu_set.clone(),
            sysctls: cfg.sysctls.clone(),
            extra_hosts: cfg.extra_hosts.clone(),
            ..Default::default()
        },
        networking_config: None,
    };

    match &cfg.network_mode {
        NetworkMode::Bridge => {
            request.host_config.network_mode = mgmt.network.clone();

            if !cfg.port_set.is_empty() {
                request.exposed_ports = Some(
                    cfg.port_set
                        .iter()
                        .map(|p| (p.key(), EmptyObject {}))
                        .collect(),
                );
            }
            if !cfg.port_bindings.is_empty() {
                let mut bindings: HashMap<String, Vec<PortBindingWire>> = HashMap::new();
                for pb in &cfg.port_bindings {
                    bindings
                        .entry(pb.container_key())
                        .or_default()
                        .push(PortBindingWire {
                            host_ip: pb.host_ip.clone(),
                            host_port: pb.host_port.to_string(),
                        });
                }
                request.host_config.port_bindings = Some(bindings);
            }

            let ipam = if cfg.mgmt_ipv4_address.is_empty() && cfg.mgmt_ipv6_address.is_empty() {
                None
            } else {
                Some(IpamAddresses {
                    ipv4_address: cfg.mgmt_ipv4_address.clone(),
                    ipv6_address: cfg.mgmt_ipv6_address.clone(),
                })
            };
            let mut endpoints = HashMap::new();
            endpoints.insert(
                mgmt.network.clone(),
                EndpointConfigWire {
                    ipam_config: ipam,
                    mac_address: cfg.mac_address.clone(),
                },
            );
            request.networking_config = Some(NetworkingConfig {
                endpoints_config: endpoints,
            });
        }
        NetworkMode::Host => {
            request.host_config.network_mode = "host".to_string();
        }
        NetworkMode::None => {
            request.host_config.network_mode = "none".to_string();
        }
        NetworkMode::Container(peer) => {
            // Hostname clashes with a borrowed network namespace.
            request.hostname = None;
            request.host_config.network_mode = format!("container:{peer}");
        }
    }

    Ok(request)
}

/// Lowers generic filters to the engine's `filters` query parameter.
///
/// Equality becomes `key=value`; `exists` uses the engine's bare-key
/// sentinel. Anything else is logged and dropped.
pub fn build_filter_args(filters: &[GenericFilter]) -> HashMap<String, Vec<String>> {
    let mut args: HashMap<String, Vec<String>> = HashMap::new();
    for filter in filters {
        let lowered = match filter.operator.as_str() {
            "exists" => filter.field.clone(),
            "=" => format!("{}={}", filter.field, filter.value),
            other => {
                warn!(
                    filter_type = %filter.filter_type,
                    field = %filter.field,
                    operator = %other,
                    "dropping filter with unsupported match type"
                );
                continue;
            }
        };
        args.entry(filter.filter_type.clone()).or_default().push(lowered);
    }
    args
}

/// Splits the engine's stdout/stderr stream multiplexing.
///
/// Frames carry an 8-byte header: stream type, three reserved bytes, and a
/// big-endian payload length.
pub fn demux_stream(raw: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut rest = raw;
    while rest.len() >= 8 {
        let size = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
        let end = (8 + size).min(rest.len());
        let payload = &rest[8..end];
        match rest[0] {
            2 => stderr.extend_from_slice(payload),
            _ => stdout.extend_from_slice(payload),
        }
        rest = &rest[end..];
    }
    (stdout, stderr)
}

// =============================================================================
// The Backend
// =============================================================================

/// Docker engine backend.
pub struct DockerRuntime {
    client: EngineClient,
    mgmt: MgmtNet,
    config: RuntimeConfig,
}

impl DockerRuntime {
    pub fn new() -> Self {
        Self::with_socket(DOCKER_SOCKET)
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
            .get_json(&format!("/containers/{name}/json"))
            .await
    }

    fn to_generic(&self, raw: ContainerInspect) -> GenericContainer {
        let network_settings = extract_ips(&raw);
        GenericContainer {
            names: vec![raw.name.trim_start_matches('/').to_string()],
            short_id: GenericContainer::short_id_of(&raw.id),
            id: raw.id,
            image: raw.config.image,
            state: raw.state.status.clone(),
            status: raw.state.status,
            labels: raw.config.labels,
            pid: raw.state.pid,
            network_settings,
            created: DateTime::parse_from_rfc3339(&raw.created)
                .ok()
                .map(|t| t.with_timezone(&Utc)),
        }
    }
}

/// Reads the management addresses off the attachment named in the
/// container's `clab-net-mgmt` label.
fn extract_ips(raw: &ContainerInspect) -> GenericMgmtIps {
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

impl Default for DockerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &str {
        "docker"
    }

    async fn init(&mut self, config: RuntimeConfig, mgmt: MgmtNet) -> Result<()> {
        let socket = self.client.socket_path().to_path_buf();
        self.client = EngineClient::new(socket).with_timeout(config.timeout);
        self.config = config;
        self.mgmt = mgmt;

        self.client.get_bytes("/_ping").await.map_err(|e| {
            Error::RuntimeUnavailable {
                runtime: "docker".to_string(),
                reason: format!("{}: {e}", self.client.socket_path().display()),
            }
        })?;
        debug!(socket = %self.client.socket_path().display(), "docker engine reachable");
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
            .get_json::<NetworkResource>(&format!("/networks/{name}"))
            .await
        {
            Ok(existing) => {
                // Present: adopt when the parameters agree, refuse otherwise.
                let existing_subnets: Vec<&str> = existing
                    .ipam
                    .config
                    .iter()
                    .map(|p| p.subnet.as_str())
                    .collect();
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
                self.disable_tx_offload(&existing.id);
                return Ok(());
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let mut options = HashMap::new();
        if let Some(mtu) = self.mgmt.mtu {
            options.insert(
                "com.docker.network.driver.mtu".to_string(),
                mtu.to_string(),
            );
        }
        if let Some(bridge) = &self.mgmt.bridge {
            options.insert(
                "com.docker.network.bridge.name".to_string(),
                bridge.clone(),
            );
        }

        let mut pools = Vec::new();
        if let Some(v4) = self.mgmt.ipv4_subnet {
            pools.push(IpamPool {
                subnet: v4.to_string(),
                gateway: self.mgmt.ipv4_gw.map(|g| g.to_string()).unwrap_or_default(),
            });
        }
        if let Some(v6) = self.mgmt.ipv6_subnet {
            pools.push(IpamPool {
                subnet: v6.to_string(),
                gateway: self.mgmt.ipv6_gw.map(|g| g.to_string()).unwrap_or_default(),
            });
        }

        let request = NetworkCreateRequest {
            name: name.clone(),
            driver: self.mgmt.driver.clone(),
            enable_ipv6: self.mgmt.ipv6_subnet.is_some(),
            ipam: Ipam { config: pools },
            options,
            labels: HashMap::from([(LABEL_CONTAINERLAB.to_string(), String::new())]),
        };
        let created: CreateResponse = self
            .client
            .post_json("/networks/create", Some(&request))
            .await?;
        info!(network = %name, "created mgmt network");
        self.disable_tx_offload(&created.id);
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
            .get_json::<NetworkResource>(&format!("/networks/{name}"))
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
        match self.client.delete(&format!("/networks/{name}")).await {
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
            .get_bytes(&format!("/images/{}/json", query_encode(image)))
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
                &format!("/images/create?fromImage={}", query_encode(image)),
                None,
            )
            .await
            .map_err(|e| Error::ImagePull {
                image: image.to_string(),
                reason: e.to_string(),
            })?;

        // The pull endpoint streams JSON progress lines; failures surface as
        // an `error` field mid-stream with a 200 status.
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
        let request = build_create_request(cfg, &self.mgmt)?;
        let created: CreateResponse = self
            .client
            .post_json(
                &format!("/containers/create?name={}", query_encode(&cfg.long_name)),
                Some(&request),
            )
            .await?;
        self.client
            .post_empty::<()>(&format!("/containers/{}/start", created.id), None)
            .await?;
        debug!(node = %cfg.long_name, id = %created.id, "container started");
        Ok(created.id)
    }

    async fn delete_container(&self, name: &str) -> Result<()> {
        let grace = self.config.stop_grace.as_secs();
        match self
            .client
            .post_empty::<()>(&format!("/containers/{name}/stop?t={grace}"), None)
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
            .delete(&format!("/containers/{name}?force=true"))
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
            "/containers/json?all=true".to_string()
        } else {
            format!(
                "/containers/json?all=true&filters={}",
                query_encode(&serde_json::to_string(&args)?)
            )
        };
        let summaries: Vec<ContainerSummary> = self.client.get_json(&path).await?;

        // The list endpoint carries no PID and no per-network prefix data;
        // inspect each match for the uniform record.
        let mut containers = Vec::with_capacity(summaries.len());
        for summary in summaries {
            match self.inspect_raw(&summary.id).await {
                Ok(raw) => containers.push(self.to_generic(raw)),
                Err(e) => warn!(container = %summary.id, "inspect failed during list: {e}"),
            }
        }
        Ok(containers)
    }

    async fn inspect(&self, name: &str) -> Result<GenericContainer> {
        let raw = self.inspect_raw(name).await?;
        Ok(self.to_generic(raw))
    }

    async fn extract_mgmt_ip(&self, id: &str) -> Result<GenericMgmtIps> {
        let raw = self.inspect_raw(id).await?;
        Ok(extract_ips(&raw))
    }

    async fn exec(&self, name: &str, cmd: &[String]) -> Result<ExecOutput> {
        let create = ExecCreateRequest {
            attach_stdout: true,
            attach_stderr: true,
            cmd: cmd.to_vec(),
        };
        let exec: ExecCreateResponse = self
            .client
            .post_json(&format!("/containers/{name}/exec"), Some(&create))
            .await?;

        let start = ExecStartRequest {
            detach: false,
            tty: false,
        };
        let raw = self
            .client
            .post_bytes(&format!("/exec/{}/start", exec.id), Some(&start))
            .await?;
        let (stdout, stderr) = demux_stream(&raw);

        let inspect: ExecInspectResponse = self
            .client
            .get_json(&format!("/exec/{}/json", exec.id))
            .await?;
        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code: inspect.exit_code,
        })
    }
}

impl DockerRuntime {
    /// Disables TX-checksum offload on the network's underlying bridge.
    /// Best-effort: a failure is logged, not fatal.
    fn disable_tx_offload(&self, network_id: &str) {
        let bridge = match &self.mgmt.bridge {
            Some(custom) => custom.clone(),
            None => format!("br-{}", GenericContainer::short_id_of(network_id)),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PortBinding;

    fn mgmt() -> MgmtNet {
        let mut m = MgmtNet::default();
        m.resolve_defaults();
        m
    }

    fn node(name: &str) -> NodeConfig {
        NodeConfig {
            kind: "linux".to_string(),
            short_name: name.to_string(),
            long_name: format!("clab-test-{name}"),
            image: "alpine:3".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_request_basics() {
        let mut cfg = node("r1");
        cfg.cmd = "sleep infinity".to_string();
        cfg.env.insert("A".to_string(), "1".to_string());
        cfg.labels
            .insert("containerlab".to_string(), "test".to_string());

        let req = build_create_request(&cfg, &mgmt()).unwrap();
        assert_eq!(req.image, "alpine:3");
        assert_eq!(req.cmd.as_deref(), Some(&["sleep".to_string(), "infinity".to_string()][..]));
        assert!(req.entrypoint.is_none());
        assert_eq!(req.env, vec!["A=1"]);
        assert_eq!(req.labels["clab-net-mgmt"], "clab");
        assert_eq!(req.host_config.network_mode, "clab");
        assert!(req.host_config.privileged);
    }

    #[test]
    fn test_create_request_static_addresses() {
        let mut cfg = node("r1");
        cfg.mgmt_ipv4_address = "172.20.20.10".to_string();
        cfg.mac_address = "00:1c:73:aa:bb:cc".to_string();

        let req = build_create_request(&cfg, &mgmt()).unwrap();
        let ep = &req.networking_config.unwrap().endpoints_config["clab"];
        assert_eq!(ep.ipam_config.as_ref().unwrap().ipv4_address, "172.20.20.10");
        assert_eq!(ep.mac_address, "00:1c:73:aa:bb:cc");
    }

    #[test]
    fn test_create_request_resources_and_ports() {
        let mut cfg = node("r1");
        cfg.memory = "1gb".to_string();
        cfg.cpu = 1.5;
        cfg.cpu_set = "0-1".to_string();
        cfg.port_bindings = vec![PortBinding::parse("8080:80").unwrap()];

        let req = build_create_request(&cfg, &mgmt()).unwrap();
        assert_eq!(req.host_config.memory, 1_000_000_000);
        assert_eq!(req.host_config.cpu_quota, 150_000);
        assert_eq!(req.host_config.cpu_period, 100_000);
        assert_eq!(req.host_config.cpuset_cpus, "0-1");
        let bindings = req.host_config.port_bindings.unwrap();
        assert_eq!(bindings["80/tcp"][0].host_port, "8080");
    }

    #[test]
    fn test_create_request_invalid_bind_rejected() {
        let mut cfg = node("r1");
        cfg.binds = vec!["/only-src".to_string()];
        assert!(matches!(
            build_create_request(&cfg, &mgmt()),
            Err(Error::InvalidBind(_))
        ));
    }

    #[test]
    fn test_create_request_host_mode() {
        let mut cfg = node("r1");
        cfg.network_mode = NetworkMode::Host;
        let req = build_create_request(&cfg, &mgmt()).unwrap();
        assert_eq!(req.host_config.network_mode, "host");
        assert!(req.networking_config.is_none());
    }

    #[test]
    fn test_filter_lowering() {
        let filters = vec![
            GenericFilter::label_eq("containerlab", "demo"),
            GenericFilter::label_exists("clab-node-name"),
            GenericFilter {
                filter_type: "label".to_string(),
                field: "x".to_string(),
                operator: "!=".to_string(),
                value: "y".to_string(),
            },
        ];
        let args = build_filter_args(&filters);
        assert_eq!(
            args["label"],
            vec!["containerlab=demo".to_string(), "clab-node-name".to_string()]
        );
    }

    #[test]
    fn test_demux_stream() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&[1, 0, 0, 0, 0, 0, 0, 5]);
        raw.extend_from_slice(b"hello");
        raw.extend_from_slice(&[2, 0, 0, 0, 0, 0, 0, 4]);
        raw.extend_from_slice(b"oops");
        let (stdout, stderr) = demux_stream(&raw);
        assert_eq!(stdout, b"hello");
        assert_eq!(stderr, b"oops");
    }
}
