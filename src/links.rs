//! Link wiring.
//!
//! The lifecycle engine decides *when* a link is created; *how* a virtual
//! wire is plumbed is behind the narrow [`LinkWirer`] interface. The
//! shipped implementation drives `ip(8)`; a netlink-based wirer can slot in
//! behind the same trait.

use crate::error::{Error, Result};
use crate::types::Link;
use crate::utils;
use async_trait::async_trait;
use tracing::debug;

/// Where one side of a wire terminates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireEnd {
    /// A container's network namespace, addressed by PID.
    Netns { pid: i64 },
    /// A named Linux bridge in the host namespace.
    Bridge { name: String },
    /// The host namespace itself.
    Host,
}

/// Creates and removes the virtual wires between node endpoints.
#[async_trait]
pub trait LinkWirer: Send + Sync {
    /// Creates the wire for `link`, with each side terminated as resolved
    /// by the lab.
    async fn wire(&self, link: &Link, a: &WireEnd, b: &WireEnd) -> Result<()>;

    /// Removes host-side leftovers of `link`. Interfaces living in a
    /// container namespace are reaped by the kernel with the namespace and
    /// need no explicit removal.
    async fn unwire(&self, link: &Link, a: &WireEnd, b: &WireEnd) -> Result<()>;
}

// =============================================================================
// ip(8) Implementation
// =============================================================================

/// Wirer shelling out to `ip link`.
#[derive(Debug, Default)]
pub struct IpWirer;

impl IpWirer {
    async fn ip(&self, link: &Link, args: &[String]) -> Result<()> {
        debug!(link = %link, cmd = ?args, "ip");
        let output = tokio::process::Command::new("ip")
            .args(args)
            .output()
            .await
            .map_err(|e| Error::LinkWireFailed {
                link: link.to_string(),
                reason: format!("cannot run ip: {e}"),
            })?;
        if !output.status.success() {
            return Err(Error::LinkWireFailed {
                link: link.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    /// Moves one freshly created veth end to its terminus, renames it to
    /// the endpoint interface, and brings it up.
    async fn place_end(
        &self,
        link: &Link,
        tmp: &str,
        iface: &str,
        end: &WireEnd,
    ) -> Result<()> {
        let mut args: Vec<String> = vec!["link".into(), "set".into(), "dev".into(), tmp.into()];
        match end {
            WireEnd::Netns { pid } => {
                args.extend([
                    "netns".into(),
                    pid.to_string(),
                    "name".into(),
                    iface.into(),
                ]);
            }
            WireEnd::Bridge { name } => {
                args.extend(["name".into(), iface.into(), "master".into(), name.clone()]);
            }
            WireEnd::Host => {
                args.extend(["name".into(), iface.into()]);
            }
        }
        if let Some(mtu) = link.mtu {
            args.extend(["mtu".into(), mtu.to_string()]);
        }
        args.push("up".into());
        self.ip(link, &args).await
    }

    /// Transient host-side veth names, unique per link and short enough for
    /// IFNAMSIZ.
    fn tmp_names(link: &Link) -> (String, String) {
        let mac = utils::gen_mac("00:00:00", &link.to_string());
        let tag: String = mac.split(':').skip(3).collect();
        (format!("clab{tag}a"), format!("clab{tag}b"))
    }
}

#[async_trait]
impl LinkWirer for IpWirer {
    async fn wire(&self, link: &Link, a: &WireEnd, b: &WireEnd) -> Result<()> {
        let (tmp_a, tmp_b) = Self::tmp_names(link);
        self.ip(
            link,
            &[
                "link".into(),
                "add".into(),
                tmp_a.clone(),
                "type".into(),
                "veth".into(),
                "peer".into(),
                "name".into(),
                tmp_b.clone(),
            ],
        )
        .await?;
        self.place_end(link, &tmp_a, &link.a.iface, a).await?;
        self.place_end(link, &tmp_b, &link.b.iface, b).await?;
        Ok(())
    }

    async fn unwire(&self, link: &Link, a: &WireEnd, b: &WireEnd) -> Result<()> {
        for (end, iface) in [(a, &link.a.iface), (b, &link.b.iface)] {
            if matches!(end, WireEnd::Netns { .. }) {
                continue;
            }
            // Best effort: the peer end may already have taken the pair down.
            let _ = self
                .ip(
                    link,
                    &["link".into(), "del".into(), "dev".into(), iface.clone()],
                )
                .await;
        }
        Ok(())
    }
}
