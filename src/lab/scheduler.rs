//! The lifecycle engine: concurrent node scheduling, link gating, and
//! teardown.
//!
//! Nodes are partitioned into a static-IP wave and a dynamic-IP wave; some
//! backends hand out dynamic addresses in creation order, so the static
//! assignments must land first. Within a wave a bounded worker pool runs
//! alongside one serial lane for nodes that cannot tolerate concurrent
//! boot. Links are created only once both endpoint nodes have reached
//! `created`.

use super::Lab;
use crate::constants::LINK_GATE_POLL;
use crate::nodes::Node;
use crate::types::{DeploymentStatus, Link, LinkGate};
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

impl Lab {
    /// Schedules all node deployments: the static wave completes before the
    /// dynamic wave begins.
    pub(crate) async fn create_nodes(
        &self,
        ctx: &CancellationToken,
        workers: usize,
        mut serial: HashSet<String>,
    ) {
        let mut static_wave = Vec::new();
        let mut dynamic_wave = Vec::new();
        let mut names: Vec<&String> = self.nodes().keys().collect();
        names.sort();
        for name in names {
            let node = Arc::clone(&self.nodes()[name]);
            if node.config().has_static_mgmt_ip() {
                static_wave.push(node);
            } else {
                dynamic_wave.push(node);
            }
        }

        if !static_wave.is_empty() {
            debug!("scheduling nodes with static management IPs");
            self.schedule_wave(ctx, workers, &mut serial, static_wave)
                .await;
        }
        if !dynamic_wave.is_empty() {
            debug!("scheduling nodes with dynamic management IPs");
            self.schedule_wave(ctx, workers, &mut serial, dynamic_wave)
                .await;
        }
    }

    /// Runs one wave: a pool of at most `workers` concurrent deploys plus a
    /// serial lane for the wave's members of `serial`. Serial membership is
    /// consumed on enqueue so a later wave does not open a second lane for
    /// the same node.
    async fn schedule_wave(
        &self,
        ctx: &CancellationToken,
        workers: usize,
        serial: &mut HashSet<String>,
        wave: Vec<Arc<dyn Node>>,
    ) {
        let mut lane = Vec::new();
        let mut pool = Vec::new();
        for node in wave {
            if serial.remove(&node.config().long_name) {
                lane.push(node);
            } else {
                pool.push(node);
            }
        }

        let limit = workers.min(pool.len()).max(1);
        let pool_done = futures::stream::iter(pool)
            .for_each_concurrent(limit, |node| self.deploy_node(ctx, node));
        let lane_done = async {
            for node in lane {
                if ctx.is_cancelled() {
                    return;
                }
                self.deploy_node(ctx, node).await;
            }
        };
        tokio::join!(pool_done, lane_done);
    }

    /// One node's deploy: startup delay, pre-deploy, deploy, then the
    /// `created` mark. A failure in any phase logs one line, marks the node
    /// `failed`, and leaves the siblings running.
    async fn deploy_node(&self, ctx: &CancellationToken, node: Arc<dyn Node>) {
        if ctx.is_cancelled() {
            return;
        }
        let (short_name, delay) = {
            let cfg = node.config();
            (cfg.short_name.clone(), cfg.startup_delay)
        };

        if delay > 0 {
            info!(node = %short_name, "delaying node start by {delay} seconds");
            tokio::select! {
                _ = ctx.cancelled() => return,
                _ = tokio::time::sleep(std::time::Duration::from_secs(delay)) => {}
            }
        }

        if let Err(e) = node.pre_deploy(self.name(), &self.dir().lab_ca, &self.dir().lab_ca_root)
        {
            error!(node = %short_name, phase = "pre-deploy", "node failed: {e}");
            self.status().mark(&short_name, DeploymentStatus::Failed);
            return;
        }

        let deployed = tokio::select! {
            _ = ctx.cancelled() => return,
            result = node.deploy(ctx) => result,
        };
        match deployed {
            Ok(()) => {
                self.status().mark(&short_name, DeploymentStatus::Created);
                debug!(node = %short_name, "node created");
            }
            Err(e) => {
                error!(node = %short_name, phase = "deploy", "node failed: {e}");
                self.status().mark(&short_name, DeploymentStatus::Failed);
            }
        }
    }

    /// Runs every created node's post-deploy hook in a second concurrent
    /// pass, peers map in hand. No ordering within the pass.
    pub(crate) async fn post_deploy_nodes(&self, ctx: &CancellationToken, workers: usize) {
        let created: Vec<Arc<dyn Node>> = self
            .nodes()
            .iter()
            .filter(|(name, _)| self.status().get(name) == Some(DeploymentStatus::Created))
            .map(|(_, node)| Arc::clone(node))
            .collect();
        if created.is_empty() {
            return;
        }

        let limit = workers.min(created.len()).max(1);
        futures::stream::iter(created)
            .for_each_concurrent(limit, |node| async move {
                if ctx.is_cancelled() {
                    return;
                }
                let short_name = node.config().short_name.clone();
                let result = tokio::select! {
                    _ = ctx.cancelled() => return,
                    result = node.post_deploy(ctx, self.nodes()) => result,
                };
                if let Err(e) = result {
                    error!(node = %short_name, phase = "post-deploy", "node failed: {e}");
                }
            })
            .await;
    }

    /// Creates all eligible links on `workers` parallel workers.
    ///
    /// A mutable copy of the link map is drained: links whose endpoints are
    /// both `created` are dispatched, links with a `pending` endpoint are
    /// retried on the next pass, links touching a `failed` endpoint are
    /// dropped with an error.
    pub(crate) async fn create_links(&self, ctx: &CancellationToken, workers: usize) {
        let mut pending = self.links().clone();
        debug!("creating {} links", pending.len());

        while !pending.is_empty() {
            if ctx.is_cancelled() {
                debug!("link creation cancelled with {} links pending", pending.len());
                return;
            }

            let mut ready = Vec::new();
            let keys: Vec<usize> = pending.keys().copied().collect();
            for key in keys {
                // One critical section per link: both endpoint statuses are
                // observed atomically at dispatch time.
                let gate = match pending.get(&key) {
                    Some(link) => self.status().gate(&link.a.node, &link.b.node),
                    None => continue,
                };
                match gate {
                    LinkGate::Ready => {
                        if let Some(link) = pending.remove(&key) {
                            ready.push(link);
                        }
                    }
                    LinkGate::Wait => {}
                    LinkGate::Blocked(node) => {
                        if let Some(link) = pending.remove(&key) {
                            error!(link = %link, "dropping link: endpoint node {node:?} failed");
                        }
                    }
                }
            }

            if !ready.is_empty() {
                let limit = workers.min(ready.len()).max(1);
                futures::stream::iter(ready)
                    .for_each_concurrent(limit, |link| async move {
                        if let Err(e) = self.wire_link(ctx, &link).await {
                            error!(link = %link, "link wiring failed: {e}");
                        }
                    })
                    .await;
            }

            if pending.is_empty() {
                break;
            }
            tokio::select! {
                _ = ctx.cancelled() => return,
                _ = tokio::time::sleep(LINK_GATE_POLL) => {}
            }
        }
    }

    async fn wire_link(&self, ctx: &CancellationToken, link: &Link) -> crate::Result<()> {
        if ctx.is_cancelled() {
            return Err(crate::Error::Cancelled);
        }
        let a = self.resolve_wire_end(&link.a).await?;
        let b = self.resolve_wire_end(&link.b).await?;
        info!(link = %link, "creating virtual wire");
        self.wirer.wire(link, &a, &b).await
    }

    /// Deletes all node containers with the same pool-plus-serial-lane
    /// structure, without waves or link bookkeeping.
    pub(crate) async fn delete_nodes(
        &self,
        ctx: &CancellationToken,
        workers: usize,
        mut serial: HashSet<String>,
    ) {
        let mut lane = Vec::new();
        let mut pool = Vec::new();
        let mut names: Vec<&String> = self.nodes().keys().collect();
        names.sort();
        for name in names {
            let node = Arc::clone(&self.nodes()[name]);
            if serial.remove(&node.config().long_name) {
                lane.push(node);
            } else {
                pool.push(node);
            }
        }

        let limit = workers.min(pool.len()).max(1);
        let pool_done = futures::stream::iter(pool)
            .for_each_concurrent(limit, |node| self.delete_node(ctx, node));
        let lane_done = async {
            for node in lane {
                if ctx.is_cancelled() {
                    return;
                }
                self.delete_node(ctx, node).await;
            }
        };
        tokio::join!(pool_done, lane_done);
    }

    async fn delete_node(&self, ctx: &CancellationToken, node: Arc<dyn Node>) {
        if ctx.is_cancelled() {
            return;
        }
        let long_name = node.config().long_name.clone();
        let result = tokio::select! {
            _ = ctx.cancelled() => return,
            result = node.delete(ctx) => result,
        };
        if let Err(e) = result {
            error!(node = %long_name, phase = "delete", "could not remove container: {e}");
        }
    }
}
