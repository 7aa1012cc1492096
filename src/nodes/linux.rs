//! Plain linux container kind.
//!
//! Deploys the config as-is: no default environment, no staged files, no
//! readiness fixups. The workhorse kind for hosts, traffic sinks, and
//! anything alpine-shaped.

use super::Node;
use crate::error::Result;
use crate::runtime::ContainerRuntime;
use crate::types::{MgmtNet, NodeConfig};
use std::sync::Arc;

#[derive(Default)]
pub struct LinuxNode {
    cfg: NodeConfig,
    mgmt: MgmtNet,
    runtime: Option<Arc<dyn ContainerRuntime>>,
}

impl Node for LinuxNode {
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
}
