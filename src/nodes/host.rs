//! Host kind.
//!
//! Represents the host itself as a topology vertex. Like `bridge` it never
//! produces a container; links terminated on it keep their host side in the
//! host network namespace, and its management address is the host's own.

use super::{Node, Peers};
use crate::error::Result;
use crate::runtime::ContainerRuntime;
use crate::types::{MgmtNet, NodeConfig};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Default)]
pub struct HostNode {
    cfg: NodeConfig,
    mgmt: MgmtNet,
    runtime: Option<Arc<dyn ContainerRuntime>>,
}

#[async_trait]
impl Node for HostNode {
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

    fn get_images(&self) -> Vec<String> {
        Vec::new()
    }

    fn pre_deploy(&self, _lab_name: &str, _ca_dir: &Path, _ca_root: &Path) -> Result<()> {
        Ok(())
    }

    async fn deploy(&self, _ctx: &CancellationToken) -> Result<()> {
        debug!(node = %self.cfg.short_name, "host node, nothing to deploy");
        Ok(())
    }

    async fn post_deploy(&self, _ctx: &CancellationToken, _peers: &Peers) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, _ctx: &CancellationToken) -> Result<()> {
        Ok(())
    }
}
