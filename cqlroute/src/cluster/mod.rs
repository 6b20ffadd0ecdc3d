//! This module holds entities that represent the cluster as a whole:
//! hosts together with their pools, and the routing state derived from
//! the cluster's topology.
//!
//! This includes:
//! - host representation ([Host]),
//! - [events](ClusterEvent) about topology and schema changes, delivered
//!   over a broadcast channel and to registered [HostListener]s,
//! - [Cluster], which ties hosts, the token ring and the tablet map together.

mod events;
mod host;
mod state;

pub use events::{ClusterEvent, HostListener, ListenerHandle};
pub use host::{Host, HostInfo};
pub use state::{Cluster, ClusterConfig};
