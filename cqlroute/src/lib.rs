//! Transport and routing core of an async driver for
//! [Scylla](https://scylladb.com) and [Apache Cassandra®](https://cassandra.apache.org/).
//!
//! # Overview
//! ### Connections
//! A [Connection](network::Connection) multiplexes concurrent requests over
//! one TCP connection, matching responses to callers by stream id.
//! Connections to a host are grouped in a
//! [HostConnectionPool](network::HostConnectionPool), which opens its core
//! connections on first use, grows under load up to a per-distance maximum
//! and replaces connections that break.
//!
//! ### Routing
//! Replicas of a partition are resolved in two tiers:
//! * the [TabletMap](routing::locator::TabletMap), holding per-table tablets
//!   pushed by tablet-aware clusters,
//! * the static [TokenMap](routing::locator::TokenMap), built from the tokens
//!   hosts advertise.
//!
//! [Sharder](routing::Sharder) maps a token to the shard of a Scylla host.
//!
//! ### Cluster
//! [Cluster] ties the above together. The embedding application reports
//! topology and schema changes to it, and asks it for replicas and for
//! connections to them:
//!
//! ```rust,no_run
//! use cqlroute::cluster::HostInfo;
//! use cqlroute::network::HostDistance;
//! use cqlroute::{Cluster, ClusterConfig};
//! use std::error::Error;
//! use uuid::Uuid;
//!
//! # async fn check_only_compiles() -> Result<(), Box<dyn Error>> {
//! let cluster = Cluster::new(ClusterConfig::default());
//! let host_id = Uuid::new_v4();
//! cluster.add_host(
//!     HostInfo {
//!         host_id,
//!         address: "127.0.0.1:9042".parse()?,
//!         datacenter: None,
//!         rack: None,
//!         tokens: vec!["-3074457345618258603".to_owned()],
//!     },
//!     HostDistance::Local,
//! );
//!
//! for (host_id, shard) in cluster.replicas_for_key("ks", "table", &[&b"key"[..]])? {
//!     let connection = cluster.connection_to(host_id, shard).await?;
//!     println!("{:?}", connection.get_connect_address());
//! }
//! # Ok(())
//! # }
//! ```

pub mod cluster;
pub mod errors;
pub mod network;
pub mod routing;

pub(crate) mod utils;

pub use cqlroute_cql::frame;
pub use cqlroute_cql::{Compression, ProtocolVersion};

pub use cluster::{Cluster, ClusterConfig, ClusterEvent};
pub use network::{Connection, ConnectionConfig, HostConnectionPool, PoolingOptions};
pub use routing::Token;
