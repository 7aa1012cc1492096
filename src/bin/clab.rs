//! clab - container-based network labs CLI.
//!
//! ## Usage
//!
//! ```sh
//! clab deploy  --topo <file> [--runtime <name>] [--workers <n>] [--timeout <secs>]
//! clab destroy --topo <file> [--keep-mgmt-net]
//! clab inspect --topo <file>
//! clab save    --topo <file>
//! ```
//!
//! ## Runtime Selection
//!
//! `--runtime` wins, then the `CLAB_RUNTIME` environment variable, then
//! docker.

use clab::{Error, Lab};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

/// Exit code for a lab that assembled with some failed nodes.
const EXIT_PARTIAL: u8 = 2;

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Debug)]
struct LabArgs {
    topo: PathBuf,
    runtime: String,
    workers: Option<usize>,
    timeout: Option<u64>,
    keep_mgmt_net: bool,
}

#[derive(Debug)]
enum Command {
    Deploy(LabArgs),
    Destroy(LabArgs),
    Inspect(LabArgs),
    Save(LabArgs),
    Version,
    Help,
}

fn parse_args() -> Result<Command, String> {
    let mut args = std::env::args().skip(1);
    let command = args.next().ok_or("no command given")?;

    match command.as_str() {
        "version" | "--version" | "-V" => return Ok(Command::Version),
        "help" | "--help" | "-h" => return Ok(Command::Help),
        "deploy" | "destroy" | "inspect" | "save" => {}
        other => return Err(format!("unknown command: {other}")),
    }

    let mut topo = None;
    let mut runtime = String::new();
    let mut workers = None;
    let mut timeout = None;
    let mut keep_mgmt_net = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--topo" | "-t" => {
                topo = Some(PathBuf::from(
                    args.next().ok_or("--topo requires a path")?,
                ));
            }
            "--runtime" | "-r" => {
                runtime = args.next().ok_or("--runtime requires a name")?;
            }
            "--workers" => {
                let n = args.next().ok_or("--workers requires a number")?;
                workers = Some(n.parse().map_err(|_| format!("bad worker count: {n}"))?);
            }
            "--timeout" => {
                let secs = args.next().ok_or("--timeout requires seconds")?;
                timeout = Some(
                    secs.parse()
                        .map_err(|_| format!("bad timeout seconds: {secs}"))?,
                );
            }
            "--keep-mgmt-net" => keep_mgmt_net = true,
            other => return Err(format!("unknown flag: {other}")),
        }
    }

    let lab_args = LabArgs {
        topo: topo.ok_or("--topo is required")?,
        runtime,
        workers,
        timeout,
        keep_mgmt_net,
    };
    Ok(match command.as_str() {
        "deploy" => Command::Deploy(lab_args),
        "destroy" => Command::Destroy(lab_args),
        "inspect" => Command::Inspect(lab_args),
        _ => Command::Save(lab_args),
    })
}

// =============================================================================
// Commands
// =============================================================================

async fn build_lab(args: &LabArgs) -> clab::Result<Lab> {
    let mut builder = Lab::builder()
        .with_topology_file(&args.topo)?
        .with_runtime(&args.runtime);
    if let Some(workers) = args.workers {
        builder = builder.with_workers(workers);
    }
    if let Some(secs) = args.timeout {
        builder = builder.with_timeout(Duration::from_secs(secs))?;
    }
    if args.keep_mgmt_net {
        builder = builder.with_keep_mgmt_net();
    }
    builder.build().await
}

async fn cmd_deploy(args: LabArgs) -> clab::Result<u8> {
    let lab = build_lab(&args).await?;
    let summary = lab.deploy().await?;
    println!("lab {:?}: {summary}", lab.name());
    for container in lab.list_containers().await? {
        println!(
            "  {:<40} {:<12} {:<10} {}",
            container.names.first().map(String::as_str).unwrap_or("-"),
            container.short_id,
            container.state,
            container.network_settings.ipv4_addr
        );
    }
    Ok(if summary.failed > 0 { EXIT_PARTIAL } else { 0 })
}

async fn cmd_destroy(args: LabArgs) -> clab::Result<u8> {
    let lab = build_lab(&args).await?;
    lab.destroy().await?;
    println!("lab {:?} removed", lab.name());
    Ok(0)
}

async fn cmd_inspect(args: LabArgs) -> clab::Result<u8> {
    let lab = build_lab(&args).await?;
    let containers = lab.list_containers().await?;
    if containers.is_empty() {
        println!("no containers found for lab {:?}", lab.name());
        return Ok(0);
    }
    println!(
        "{:<40} {:<12} {:<24} {:<10} {:<18} {}",
        "NAME", "ID", "IMAGE", "STATE", "IPV4", "IPV6"
    );
    for c in containers {
        println!(
            "{:<40} {:<12} {:<24} {:<10} {:<18} {}",
            c.names.first().map(String::as_str).unwrap_or("-"),
            c.short_id,
            c.image,
            c.state,
            format_addr(&c.network_settings.ipv4_addr, c.network_settings.ipv4_plen),
            format_addr(&c.network_settings.ipv6_addr, c.network_settings.ipv6_plen),
        );
    }
    Ok(0)
}

fn format_addr(addr: &str, plen: u8) -> String {
    if addr.is_empty() {
        "-".to_string()
    } else {
        format!("{addr}/{plen}")
    }
}

async fn cmd_save(args: LabArgs) -> clab::Result<u8> {
    let lab = build_lab(&args).await?;
    let failures = lab.save().await;
    if failures.is_empty() {
        println!("saved configuration of all nodes in lab {:?}", lab.name());
        return Ok(0);
    }
    for (node, err) in &failures {
        eprintln!("save failed for node {node:?}: {err}");
    }
    Ok(EXIT_PARTIAL)
}

fn cmd_version() {
    println!("clab {}", env!("CARGO_PKG_VERSION"));
}

fn cmd_help() {
    println!(
        r#"clab - container-based network labs

USAGE:
    clab <command> [flags]

COMMANDS:
    deploy      deploy a lab from a topology file
    destroy     destroy a deployed lab
    inspect     list the lab's containers
    save        save nodes' running configuration
    version     print version
    help        print this help

FLAGS:
    --topo, -t <file>      topology file (required)
    --runtime, -r <name>   container runtime (docker, podman)
    --workers <n>          node/link worker count
    --timeout <secs>       deploy/destroy deadline
    --keep-mgmt-net        keep the management network on destroy

EXAMPLES:
    clab deploy -t srl02.clab.yml
    clab destroy -t srl02.clab.yml --keep-mgmt-net
    CLAB_RUNTIME=podman clab deploy -t lab.yml
"#
    );
}

// =============================================================================
// Main
// =============================================================================

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    let command = match parse_args() {
        Ok(command) => command,
        Err(e) => {
            eprintln!("error: {e}");
            cmd_help();
            return ExitCode::FAILURE;
        }
    };

    init_tracing();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: cannot start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result: clab::Result<u8> = runtime.block_on(async {
        match command {
            Command::Deploy(args) => cmd_deploy(args).await,
            Command::Destroy(args) => cmd_destroy(args).await,
            Command::Inspect(args) => cmd_inspect(args).await,
            Command::Save(args) => cmd_save(args).await,
            Command::Version => {
                cmd_version();
                Ok(0)
            }
            Command::Help => {
                cmd_help();
                Ok(0)
            }
        }
    });

    match result {
        Ok(0) => ExitCode::SUCCESS,
        Ok(code) => ExitCode::from(code),
        Err(e @ Error::Timeout(_)) => {
            eprintln!("error: {e} (deployed resources are left on the host; run destroy)");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
