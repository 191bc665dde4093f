//! Administrative client for a distributed key-value database cluster.
//!
//! The crate discovers cluster membership from seed nodes, fans
//! info-protocol queries out to every member in parallel, and aggregates
//! the per-node replies into maps keyed by node. Higher-level views — the
//! partition-map analyzer and the JSON snapshot assembler — are built on
//! those aggregates. The tool is operational, not transactional: it only
//! reads cluster state.

pub mod cluster;
pub mod config;
pub mod error;
pub mod info;
pub mod node;
pub mod pmap;
pub mod pool;
pub mod snapshot;
pub mod task;


pub use cluster::{Cluster, NodeMap};
pub use error::Error;
pub use node::{Endpoint, Node, NodeKey};
