use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::errors::ConnectionPoolError;
use crate::network::{
    Connection, ConnectionConfig, HostConnectionPool, HostDistance, PoolingOptions,
};
use crate::routing::{Shard, Sharder};

/// What the topology source knows about a host when it joins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    /// Unique identifier of the host.
    pub host_id: Uuid,
    /// Address connections are opened to.
    pub address: SocketAddr,
    /// Datacenter of the host, if known.
    pub datacenter: Option<String>,
    /// Rack of the host, if known.
    pub rack: Option<String>,
    /// Ring tokens the host advertises, in their textual form.
    pub tokens: Vec<String>,
}

struct HostState {
    distance: HostDistance,
    pool: Option<Arc<HostConnectionPool>>,
}

/// A cluster host along with its connection pool.
///
/// Ignored hosts have no pool.
pub struct Host {
    /// Unique identifier of the host.
    pub host_id: Uuid,
    /// Address connections are opened to.
    pub address: SocketAddr,
    /// Datacenter of the host, if known.
    pub datacenter: Option<String>,
    /// Rack of the host, if known.
    pub rack: Option<String>,
    tokens: Vec<String>,
    up: AtomicBool,
    state: Mutex<HostState>,
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("host_id", &self.host_id)
            .field("address", &self.address)
            .field("datacenter", &self.datacenter)
            .field("rack", &self.rack)
            .field("distance", &self.distance())
            .field("up", &self.is_up())
            .finish_non_exhaustive()
    }
}

impl Host {
    /// Creates the host. Unless it is ignored, its pool is created too;
    /// connections open on first borrow.
    pub(crate) fn new(
        info: HostInfo,
        distance: HostDistance,
        connection_config: &ConnectionConfig,
        pooling: &PoolingOptions,
    ) -> Self {
        let pool = (distance != HostDistance::Ignored).then(|| {
            Arc::new(HostConnectionPool::new(
                info.host_id,
                info.address,
                distance,
                connection_config.clone(),
                pooling.clone(),
            ))
        });

        Host {
            host_id: info.host_id,
            address: info.address,
            datacenter: info.datacenter,
            rack: info.rack,
            tokens: info.tokens,
            // Optimistically up until the event source says otherwise.
            up: AtomicBool::new(true),
            state: Mutex::new(HostState { distance, pool }),
        }
    }

    /// Ring tokens the host advertised.
    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// Current distance of the host.
    pub fn distance(&self) -> HostDistance {
        // Nobody panics while holding this lock.
        self.state.lock().unwrap().distance
    }

    /// Whether the host was last reported up.
    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    /// Records the host's state. Returns whether it changed.
    pub(crate) fn set_up(&self, up: bool) -> bool {
        self.up.swap(up, Ordering::AcqRel) != up
    }

    /// The host's pool, absent for ignored hosts.
    pub fn pool(&self) -> Option<Arc<HostConnectionPool>> {
        // Nobody panics while holding this lock.
        self.state.lock().unwrap().pool.clone()
    }

    /// Sharding function of the host, known once a connection is open.
    pub fn sharder(&self) -> Option<Sharder> {
        self.pool().and_then(|pool| pool.sharder())
    }

    /// Borrows a connection, preferring `shard` if given.
    pub async fn borrow_connection(
        &self,
        shard: Option<Shard>,
    ) -> Result<Arc<Connection>, ConnectionPoolError> {
        let pool = self.pool().ok_or(ConnectionPoolError::HostIgnored)?;
        match shard {
            Some(shard) => pool.borrow_connection_for_shard(shard).await,
            None => pool.borrow_connection().await,
        }
    }

    /// Moves the host to `distance`. An ignored host loses its pool;
    /// a host leaving the ignored distance gets a fresh one.
    /// Returns whether the distance changed.
    pub(crate) fn set_distance(
        &self,
        distance: HostDistance,
        connection_config: &ConnectionConfig,
        pooling: &PoolingOptions,
    ) -> bool {
        // Nobody panics while holding this lock.
        let mut state = self.state.lock().unwrap();
        if state.distance == distance {
            return false;
        }
        state.distance = distance;

        if distance == HostDistance::Ignored {
            if let Some(pool) = state.pool.take() {
                pool.shutdown();
            }
        } else if let Some(pool) = &state.pool {
            pool.set_distance(distance);
        } else {
            state.pool = Some(Arc::new(HostConnectionPool::new(
                self.host_id,
                self.address,
                distance,
                connection_config.clone(),
                pooling.clone(),
            )));
        }
        true
    }

    /// Shuts the pool down, if any. Later borrows fail with
    /// [`ConnectionPoolError::Shutdown`].
    pub(crate) fn shutdown(&self) {
        if let Some(pool) = self.pool() {
            pool.shutdown();
        }
    }
}
