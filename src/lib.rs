//! clab - declarative container-based network labs.
//!
//! A topology file names a set of network-function containers and the
//! point-to-point virtual links between them; this crate materialises the
//! lab on one host and tears it down on demand.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │  Lab (lifecycle engine)                                    │
//! │    static wave ──► dynamic wave ──► links ──► post-deploy  │
//! │    worker pool + serial lane, link gate on node status     │
//! └──────────┬──────────────────────────────┬──────────────────┘
//!            │                              │
//!   ┌────────▼─────────┐          ┌─────────▼─────────┐
//!   │  Node registry   │          │  Runtime registry │
//!   │  linux, bridge,  │          │  docker, podman   │
//!   │  host, vr-sros,  │          │  (engine API over │
//!   │  ixia-c          │          │   unix sockets)   │
//!   └──────────────────┘          └───────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use clab::Lab;
//!
//! let lab = Lab::builder()
//!     .with_topology_file(Path::new("srl02.clab.yml"))?
//!     .with_runtime("docker")
//!     .build()
//!     .await?;
//!
//! let summary = lab.deploy().await?;
//! println!("{summary}");
//! lab.destroy().await?;
//! ```

pub mod constants;
pub mod error;
pub mod lab;
pub mod links;
pub mod nodes;
pub mod runtime;
pub mod runtimes;
pub mod topo;
pub mod types;
pub mod utils;

pub use error::{Error, Result};
pub use lab::{DeploySummary, Lab, LabBuilder};
