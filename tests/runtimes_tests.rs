//! Tests for the runtime registry, spec lowering, and the docker backend
//! against a fake engine served over a unix socket.

use clab::runtime::{ContainerRuntime, RuntimeConfig};
use clab::runtimes::{docker, podman, resolve_runtime_name, DockerRuntime, RuntimeRegistry};
use clab::types::{GenericFilter, MgmtNet, NodeConfig};
use clab::Error;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use std::collections::HashMap;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::net::UnixListener;

// =============================================================================
// Registry Tests
// =============================================================================

#[test]
fn test_registry_builtin_backends() {
    let registry = RuntimeRegistry::with_defaults();
    assert_eq!(registry.names(), vec!["docker", "podman"]);
    assert!(registry.create("docker").is_ok());
    assert!(registry.create("podman").is_ok());
}

#[test]
fn test_registry_unknown_runtime() {
    let registry = RuntimeRegistry::with_defaults();
    assert!(matches!(
        registry.create("containerd"),
        Err(Error::UnknownRuntime(_))
    ));
}

#[test]
fn test_runtime_name_resolution_order() {
    // Explicit name wins over everything.
    std::env::set_var("CLAB_RUNTIME", "podman");
    assert_eq!(resolve_runtime_name("docker"), "docker");
    // Env var wins over the default.
    assert_eq!(resolve_runtime_name(""), "podman");
    // Default applies when nothing else is set.
    std::env::remove_var("CLAB_RUNTIME");
    assert_eq!(resolve_runtime_name(""), "docker");
}

// =============================================================================
// Wire-Format Tests
// =============================================================================

fn mgmt() -> MgmtNet {
    let mut m = MgmtNet::default();
    m.resolve_defaults();
    m
}

#[test]
fn test_docker_request_serializes_with_engine_casing() {
    let cfg = NodeConfig {
        kind: "linux".to_string(),
        short_name: "r1".to_string(),
        long_name: "clab-demo-r1".to_string(),
        image: "alpine:3".to_string(),
        cmd: "sleep infinity".to_string(),
        mgmt_ipv4_address: "172.20.20.10".to_string(),
        ..Default::default()
    };
    let request = docker::build_create_request(&cfg, &mgmt()).unwrap();
    let value = serde_json::to_value(&request).unwrap();

    assert_eq!(value["Image"], "alpine:3");
    assert_eq!(value["Cmd"][0], "sleep");
    assert_eq!(value["Hostname"], "r1");
    assert_eq!(value["HostConfig"]["NetworkMode"], "clab");
    assert_eq!(value["HostConfig"]["Privileged"], true);
    assert_eq!(
        value["NetworkingConfig"]["EndpointsConfig"]["clab"]["IPAMConfig"]["IPv4Address"],
        "172.20.20.10"
    );
    assert_eq!(value["Labels"]["clab-net-mgmt"], "clab");
}

#[test]
fn test_podman_spec_serializes_with_libpod_casing() {
    let cfg = NodeConfig {
        kind: "linux".to_string(),
        short_name: "r1".to_string(),
        long_name: "clab-demo-r1".to_string(),
        image: "alpine:3".to_string(),
        binds: vec!["/tmp/a:/a:ro".to_string()],
        mgmt_ipv6_address: "2001:172:20:20::10".to_string(),
        ..Default::default()
    };
    let spec = podman::build_container_spec(&cfg, &mgmt()).unwrap();
    let value = serde_json::to_value(&spec).unwrap();

    assert_eq!(value["name"], "clab-demo-r1");
    assert_eq!(value["image"], "alpine:3");
    assert_eq!(value["netns"]["nsmode"], "bridge");
    assert_eq!(value["static_ipv6"], "2001:172:20:20::10");
    assert_eq!(value["mounts"][0]["source"], "/tmp/a");
    assert_eq!(value["mounts"][0]["type"], "bind");
    assert_eq!(value["cni_networks"][0], "clab");
}

#[test]
fn test_filter_lowering_per_backend() {
    let filters = vec![
        GenericFilter::label_eq("containerlab", "demo"),
        GenericFilter::label_exists("clab-node-name"),
    ];

    // Docker uses the bare-key sentinel for existence.
    let docker_args = docker::build_filter_args(&filters);
    assert_eq!(
        docker_args["label"],
        vec!["containerlab=demo".to_string(), "clab-node-name".to_string()]
    );

    // Podman lowers existence to empty-value equality.
    let podman_args = podman::build_filter_args(&filters);
    assert_eq!(
        podman_args["label"],
        vec!["containerlab=demo".to_string(), "clab-node-name=".to_string()]
    );
}

// =============================================================================
// Fake Engine
// =============================================================================

#[derive(Default)]
struct FakeEngine {
    /// Networks by name; the value is the subnet list.
    networks: HashMap<String, Vec<String>>,
    network_creates: usize,
}

type Shared = Arc<Mutex<FakeEngine>>;

async fn handle(
    state: Shared,
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let body = req
        .into_body()
        .collect()
        .await
        .map(|b| b.to_bytes())
        .unwrap_or_default();

    let respond = |status: StatusCode, body: serde_json::Value| {
        Ok(Response::builder()
            .status(status)
            .body(Full::new(Bytes::from(body.to_string())))
            .expect("static response builds"))
    };
    let not_found = |what: &str| {
        respond(
            StatusCode::NOT_FOUND,
            json!({ "message": format!("no such {what}") }),
        )
    };

    match (method, path.as_str()) {
        (Method::GET, "/_ping") => respond(StatusCode::OK, json!("OK")),
        (Method::GET, p) if p.starts_with("/networks/") => {
            let name = p.trim_start_matches("/networks/");
            let state = state.lock().unwrap();
            match state.networks.get(name) {
                Some(subnets) => respond(
                    StatusCode::OK,
                    json!({
                        "Id": "0123456789abcdef",
                        "Name": name,
                        "Driver": "bridge",
                        "IPAM": { "Config": subnets.iter()
                            .map(|s| json!({ "Subnet": s }))
                            .collect::<Vec<_>>() },
                        "Labels": { "containerlab": "" },
                    }),
                ),
                None => not_found("network"),
            }
        }
        (Method::POST, "/networks/create") => {
            let request: serde_json::Value = serde_json::from_slice(&body).unwrap_or_default();
            let name = request["Name"].as_str().unwrap_or_default().to_string();
            let subnets = request["IPAM"]["Config"]
                .as_array()
                .map(|pools| {
                    pools
                        .iter()
                        .filter_map(|p| p["Subnet"].as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default();
            let mut state = state.lock().unwrap();
            state.networks.insert(name, subnets);
            state.network_creates += 1;
            respond(StatusCode::CREATED, json!({ "Id": "0123456789abcdef" }))
        }
        (Method::DELETE, p) if p.starts_with("/networks/") => {
            let name = p.trim_start_matches("/networks/").to_string();
            let mut state = state.lock().unwrap();
            match state.networks.remove(&name) {
                Some(_) => respond(StatusCode::NO_CONTENT, json!({})),
                None => not_found("network"),
            }
        }
        (Method::POST, p) if p.contains("/containers/") && p.ends_with("/stop") => {
            not_found("container")
        }
        (Method::DELETE, p) if p.starts_with("/containers/") => not_found("container"),
        _ => not_found("route"),
    }
}

/// Serves the fake engine on a unix socket inside `dir`.
fn spawn_fake_engine(dir: &TempDir, state: Shared) -> PathBuf {
    let socket = dir.path().join("engine.sock");
    let listener = UnixListener::bind(&socket).expect("bind test socket");
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                let service = service_fn(move |req| handle(Arc::clone(&state), req));
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    socket
}

async fn docker_on_fake_engine(dir: &TempDir, state: Shared, mgmt: MgmtNet) -> DockerRuntime {
    let socket = spawn_fake_engine(dir, state);
    let mut runtime = DockerRuntime::with_socket(&socket);
    runtime
        .init(RuntimeConfig::default(), mgmt)
        .await
        .expect("fake engine reachable");
    runtime
}

// =============================================================================
// Backend Behavior Tests
// =============================================================================

#[tokio::test]
async fn test_init_fails_when_socket_is_dead() {
    let mut runtime = DockerRuntime::with_socket("/nonexistent/engine.sock");
    let err = runtime
        .init(RuntimeConfig::default(), mgmt())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RuntimeUnavailable { .. }));
}

#[tokio::test]
async fn test_create_net_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let state: Shared = Arc::default();
    let runtime = docker_on_fake_engine(&dir, Arc::clone(&state), mgmt()).await;

    runtime.create_net().await.unwrap();
    runtime.create_net().await.unwrap();

    let state = state.lock().unwrap();
    assert_eq!(state.networks.len(), 1);
    assert_eq!(state.network_creates, 1);
    assert!(state.networks["clab"].contains(&"172.20.20.0/24".to_string()));
}

#[tokio::test]
async fn test_create_net_conflicting_subnet_fails() {
    let dir = TempDir::new().unwrap();
    let state: Shared = Arc::default();
    state
        .lock()
        .unwrap()
        .networks
        .insert("clab".to_string(), vec!["10.99.0.0/16".to_string()]);
    let runtime = docker_on_fake_engine(&dir, Arc::clone(&state), mgmt()).await;

    let err = runtime.create_net().await.unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
}

#[tokio::test]
async fn test_delete_net_respects_keep_flag() {
    let dir = TempDir::new().unwrap();
    let state: Shared = Arc::default();
    let mut runtime = docker_on_fake_engine(&dir, Arc::clone(&state), mgmt()).await;

    runtime.create_net().await.unwrap();
    runtime.with_keep_mgmt_net();
    runtime.delete_net().await.unwrap();
    assert_eq!(state.lock().unwrap().networks.len(), 1);
}

#[tokio::test]
async fn test_delete_net_removes_labelled_network() {
    let dir = TempDir::new().unwrap();
    let state: Shared = Arc::default();
    let runtime = docker_on_fake_engine(&dir, Arc::clone(&state), mgmt()).await;

    runtime.create_net().await.unwrap();
    runtime.delete_net().await.unwrap();
    assert!(state.lock().unwrap().networks.is_empty());
}

#[tokio::test]
async fn test_delete_missing_container_is_not_an_error() {
    let dir = TempDir::new().unwrap();
    let state: Shared = Arc::default();
    let runtime = docker_on_fake_engine(&dir, Arc::clone(&state), mgmt()).await;

    runtime.delete_container("clab-demo-ghost").await.unwrap();
}
