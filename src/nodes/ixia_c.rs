//! Keysight ixia-c traffic generator kind.
//!
//! The engine container signals readiness by dropping a `.ready` file in
//! its working directory; post-deploy polls for it before the lab is
//! declared usable. Configuration lives on a bind-mounted flash directory.

use super::{Node, Peers};
use crate::constants::{LAB_DIR_MODE, READINESS_POLL};
use crate::error::{Error, Result};
use crate::runtime::ContainerRuntime;
use crate::types::{MgmtNet, NodeConfig};
use crate::utils;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// MAC vendor prefix for ixia-c interfaces.
const MAC_OUI: &str = "00:1c:73";

/// Vendor CLI invocation that persists the running config.
const SAVE_CMD: &[&str] = &["Cli", "-p", "15", "-c", "wr"];

/// Probe for the readiness sentinel.
const READY_CMD: &[&str] = &["ls", "./.ready"];

#[derive(Default)]
pub struct IxiaCNode {
    cfg: NodeConfig,
    mgmt: MgmtNet,
    runtime: Option<Arc<dyn ContainerRuntime>>,
}

#[async_trait]
impl Node for IxiaCNode {
    fn init(&mut self, mut cfg: NodeConfig) -> Result<()> {
        let mut defaults = std::collections::HashMap::new();
        defaults.insert("OPT_LISTEN_PORT".to_string(), "5555".to_string());
        defaults.insert(
            "ARG_IFACE_LIST".to_string(),
            "virtual@af_packet,eth1".to_string(),
        );
        defaults.insert("OPT_NO_HUGEPAGES".to_string(), "Yes".to_string());
        cfg.env = utils::merge_string_maps(&defaults, &cfg.env);

        cfg.cmd = "/sbin/init ./entrypoint.sh".to_string();
        if cfg.mac_address.is_empty() {
            cfg.mac_address = utils::gen_mac(MAC_OUI, &cfg.long_name);
        }

        let flash = cfg.lab_dir.join("flash");
        cfg.binds.push(format!("{}:/mnt/flash/", flash.display()));
        cfg.res_startup_config = Some(flash.join("startup-config"));

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

    fn pre_deploy(&self, _lab_name: &str, _ca_dir: &Path, _ca_root: &Path) -> Result<()> {
        utils::create_directory(&self.cfg.lab_dir, LAB_DIR_MODE)?;
        utils::create_directory(&self.cfg.lab_dir.join("flash"), LAB_DIR_MODE)
    }

    /// Waits for the engine's `.ready` sentinel with fixed backoff, bounded
    /// by the lab deadline through `ctx`.
    async fn post_deploy(&self, ctx: &CancellationToken, _peers: &Peers) -> Result<()> {
        info!(node = %self.cfg.short_name, "running postdeploy actions for ixia-c node");
        let runtime = self.get_runtime().ok_or_else(|| {
            Error::Config(format!(
                "node {:?} has no runtime attached",
                self.cfg.short_name
            ))
        })?;
        let ready_cmd: Vec<String> = READY_CMD.iter().map(|s| s.to_string()).collect();

        loop {
            if ctx.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let probe = runtime.exec(&self.cfg.long_name, &ready_cmd).await?;
            if probe.exit_code == 0 {
                debug!(node = %self.cfg.short_name, "ixia-c engine ready");
                return Ok(());
            }
            tokio::select! {
                _ = ctx.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(READINESS_POLL) => {}
            }
        }
    }

    async fn save_config(&self, _ctx: &CancellationToken) -> Result<()> {
        let runtime = self.get_runtime().ok_or_else(|| {
            Error::Config(format!(
                "node {:?} has no runtime attached",
                self.cfg.short_name
            ))
        })?;
        let cmd: Vec<String> = SAVE_CMD.iter().map(|s| s.to_string()).collect();
        let output = runtime.exec(&self.cfg.long_name, &cmd).await?;
        if !output.stderr.is_empty() {
            return Err(Error::Config(format!(
                "{} errors: {}",
                self.cfg.short_name,
                output.stderr_str()
            )));
        }
        info!(
            node = %self.cfg.short_name,
            config = %self.cfg.lab_dir.join("flash/startup-config").display(),
            "saved ixia-c configuration"
        );
        Ok(())
    }
}
