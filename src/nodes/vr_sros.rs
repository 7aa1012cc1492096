//! Nokia SR OS (vrnetlab) kind.
//!
//! A VM-in-container router launched by the vrnetlab harness. The kind
//! merges the launcher environment, stages a `tftpboot` directory the VM
//! boots from, and builds the launcher command line. Boot is resource
//! hungry; deployment policy runs these nodes on the serial lane.

use super::{render_config, Node, VR_DEF_CONN_MODE};
use crate::constants::LAB_DIR_MODE;
use crate::error::{Error, Result};
use crate::runtime::ContainerRuntime;
use crate::types::{MgmtNet, NodeConfig};
use crate::utils;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// vrnetlab variant used when the topology does not pick one.
const DEFAULT_VARIANT: &str = "sr-1";

/// Startup config written to `tftpboot/config.txt` when the user did not
/// provide a template.
const DEFAULT_CONFIG_TEMPLATE: &str = "\
/configure system name \"{name}\"
/configure system netconf no shutdown
/configure system security profile \"administrative\" netconf base-op-authorization lock
";

#[derive(Default)]
pub struct VrSrosNode {
    cfg: NodeConfig,
    mgmt: MgmtNet,
    runtime: Option<Arc<dyn ContainerRuntime>>,
}

impl VrSrosNode {
    fn tftpboot_dir(&self) -> std::path::PathBuf {
        self.cfg.lab_dir.join("tftpboot")
    }
}

impl Node for VrSrosNode {
    fn init(&mut self, mut cfg: NodeConfig) -> Result<()> {
        if cfg.node_type.is_empty() {
            cfg.node_type = DEFAULT_VARIANT.to_string();
        }

        // The env drives the vrnetlab launcher arguments inside the image.
        let mut defaults = std::collections::HashMap::new();
        defaults.insert("CONNECTION_MODE".to_string(), VR_DEF_CONN_MODE.to_string());
        defaults.insert(
            "DOCKER_NET_V4_ADDR".to_string(),
            self.mgmt
                .ipv4_subnet
                .map(|s| s.to_string())
                .unwrap_or_default(),
        );
        defaults.insert(
            "DOCKER_NET_V6_ADDR".to_string(),
            self.mgmt
                .ipv6_subnet
                .map(|s| s.to_string())
                .unwrap_or_default(),
        );
        cfg.env = utils::merge_string_maps(&defaults, &cfg.env);

        cfg.binds.push(format!(
            "{}:/tftpboot",
            cfg.lab_dir.join("tftpboot").display()
        ));
        if cfg.env.get("CONNECTION_MODE").map(String::as_str) == Some("macvtap") {
            // macvtap endpoints need the host device tree.
            cfg.binds.push("/dev:/dev".to_string());
        }

        cfg.cmd = format!(
            "--trace --connection-mode {} --hostname {} --variant \"{}\"",
            cfg.env["CONNECTION_MODE"], cfg.short_name, cfg.node_type
        );

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
        utils::create_directory(&self.tftpboot_dir(), LAB_DIR_MODE)?;

        let Some(license) = &self.cfg.license else {
            return Ok(());
        };
        let license_dst = self.tftpboot_dir().join("license.txt");
        utils::copy_file(license, &license_dst).map_err(|e| {
            Error::Config(format!(
                "license copy {} -> {} failed: {e}",
                license.display(),
                license_dst.display()
            ))
        })?;
        debug!(node = %self.cfg.short_name, "staged license file");

        let template = match &self.cfg.config {
            Some(path) => std::fs::read_to_string(path)?,
            None => DEFAULT_CONFIG_TEMPLATE.to_string(),
        };
        let config_dst = self.tftpboot_dir().join("config.txt");
        std::fs::write(&config_dst, render_config(&template, &self.cfg))?;
        debug!(node = %self.cfg.short_name, config = %config_dst.display(), "rendered startup config");
        Ok(())
    }
}
