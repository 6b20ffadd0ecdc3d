//! Connections to hosts: request multiplexing over a single connection
//! and per-host pools of such connections.

mod connection;
mod connection_pool;
mod multiplexer;

pub use connection::{Connection, ConnectionConfig, QueryResponse};
pub use connection_pool::{ConnectionLimits, HostConnectionPool, HostDistance, PoolingOptions};
