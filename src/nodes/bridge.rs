//! Linux bridge kind.
//!
//! A bridge node never produces a container: it stands in for an existing
//! bridge in the host namespace. Links terminated on it attach their host
//! side to the named bridge; deploy and delete are no-ops so the scheduler
//! still walks the node through the `created` barrier.

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
pub struct BridgeNode {
    cfg: NodeConfig,
    mgmt: MgmtNet,
    runtime: Option<Arc<dyn ContainerRuntime>>,
}

#[async_trait]
impl Node for BridgeNode {
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
        debug!(bridge = %self.cfg.short_name, "bridge node, nothing to deploy");
        Ok(())
    }

    async fn post_deploy(&self, _ctx: &CancellationToken, _peers: &Peers) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, _ctx: &CancellationToken) -> Result<()> {
        Ok(())
    }
}
