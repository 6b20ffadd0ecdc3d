use super::connection::{open_connection, Connection, ConnectionConfig, ErrorReceiver};

use crate::errors::{BrokenConnectionErrorKind, ConnectionError, ConnectionPoolError};
use crate::routing::{Shard, Sharder};
use crate::utils::safe_format::IteratorSafeFormatExt;

use arc_swap::{ArcSwap, ArcSwapOption};
use cqlroute_cql::ProtocolVersion;
use futures::{future::RemoteHandle, stream::FuturesUnordered, Future, FutureExt, StreamExt};
use rand::Rng;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, Notify, OnceCell};
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Distance of a host, as classified by the embedding application.
/// It decides how many connections the host gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HostDistance {
    /// Preferred hosts, usually in the local datacenter.
    #[default]
    Local,
    /// Hosts used as a fallback.
    Remote,
    /// Hosts never connected to.
    Ignored,
}

/// Connection count bounds for one host distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionLimits {
    /// Connections opened when the pool is first used, and kept open.
    pub core: usize,
    /// Upper bound the pool may grow to under load.
    pub max: usize,
}

/// Sizing of host connection pools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolingOptions {
    /// Limits for [`HostDistance::Local`] hosts.
    pub local: ConnectionLimits,
    /// Limits for [`HostDistance::Remote`] hosts.
    pub remote: ConnectionLimits,
    /// A pool grows by one connection when its least loaded connection
    /// has more requests in flight than this.
    pub new_connection_threshold: usize,
}

impl PoolingOptions {
    /// Defaults suited to the stream id space of `version`.
    pub fn for_protocol(version: ProtocolVersion) -> Self {
        if version.has_wide_stream_ids() {
            PoolingOptions {
                local: ConnectionLimits { core: 1, max: 2 },
                remote: ConnectionLimits { core: 1, max: 1 },
                new_connection_threshold: 1500,
            }
        } else {
            PoolingOptions {
                local: ConnectionLimits { core: 2, max: 8 },
                remote: ConnectionLimits { core: 1, max: 2 },
                new_connection_threshold: 100,
            }
        }
    }

    /// Limits applying to hosts at `distance`. Ignored hosts get none.
    pub fn limits(&self, distance: HostDistance) -> ConnectionLimits {
        match distance {
            HostDistance::Local => self.local,
            HostDistance::Remote => self.remote,
            HostDistance::Ignored => ConnectionLimits { core: 0, max: 0 },
        }
    }
}

impl Default for PoolingOptions {
    fn default() -> Self {
        Self::for_protocol(ProtocolVersion::V4)
    }
}

// TODO: Make it configurable through PoolingOptions.
const MIN_FILL_BACKOFF: Duration = Duration::from_millis(50);
const MAX_FILL_BACKOFF: Duration = Duration::from_secs(10);
const FILL_BACKOFF_MULTIPLIER: u32 = 2;

// A simple exponential strategy for pool fill backoffs.
struct RefillDelayStrategy {
    current_delay: Duration,
}

impl RefillDelayStrategy {
    fn new() -> Self {
        Self {
            current_delay: MIN_FILL_BACKOFF,
        }
    }

    fn get_delay(&self) -> Duration {
        self.current_delay
    }

    fn on_successful_fill(&mut self) {
        self.current_delay = MIN_FILL_BACKOFF;
    }

    fn on_fill_error(&mut self) {
        self.current_delay = std::cmp::min(
            MAX_FILL_BACKOFF,
            self.current_delay * FILL_BACKOFF_MULTIPLIER,
        );
    }
}

type Registration = (Weak<Connection>, ErrorReceiver);

// State shared by the pool handle, the watcher and growth tasks.
struct PoolShared {
    host_id: Uuid,
    address: SocketAddr,
    connection_config: ConnectionConfig,
    pooling: PoolingOptions,
    distance: RwLock<HostDistance>,

    conns: ArcSwap<Vec<Arc<Connection>>>,
    // Completed once the first batch of core connections was attempted.
    initialized: OnceCell<()>,
    // Set while a growth connection is being opened.
    growing: AtomicBool,
    disposed: AtomicBool,
    last_error: ArcSwapOption<ConnectionError>,

    // Hands new connections to the watcher, which waits for them to break.
    registration_sender: mpsc::UnboundedSender<Registration>,
    // Wakes the watcher after initialization, distance changes and shutdown.
    watcher_notify: Notify,
}

impl PoolShared {
    fn distance(&self) -> HostDistance {
        // Nobody panics while holding this lock.
        *self.distance.read().unwrap()
    }

    fn limits(&self) -> ConnectionLimits {
        self.pooling.limits(self.distance())
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    async fn initialize(&self) {
        let core = self.limits().core;
        debug!(
            address = %self.address,
            connections = core,
            "Opening core connections"
        );
        let opened = futures::future::join_all(
            (0..core).map(|_| open_connection(self.address, &self.connection_config)),
        )
        .await;
        for result in opened {
            self.handle_opened_connection(result);
        }
    }

    // Adds the connection unless the pool is full or gone.
    fn handle_opened_connection(&self, result: Result<(Connection, ErrorReceiver), ConnectionError>) {
        let (connection, error_receiver) = match result {
            Ok(opened) => opened,
            Err(err) => {
                debug!(address = %self.address, error = %err, "Failed to open a connection");
                self.last_error.store(Some(Arc::new(err)));
                return;
            }
        };
        if self.is_disposed() {
            trace!(address = %self.address, "Dropping a connection opened after shutdown");
            return;
        }

        let limit = self.limits().max;
        let connection = Arc::new(connection);
        let mut added = false;
        self.conns.rcu(|conns| {
            if conns.len() >= limit {
                added = false;
                Arc::clone(conns)
            } else {
                added = true;
                let mut new_conns = Vec::clone(conns);
                new_conns.push(Arc::clone(&connection));
                Arc::new(new_conns)
            }
        });

        if added {
            trace!(
                address = %self.address,
                connection = ?Arc::as_ptr(&connection),
                "Connection added to the pool"
            );
            let _ = self
                .registration_sender
                .send((Arc::downgrade(&connection), error_receiver));
        } else {
            debug!(address = %self.address, limit, "Pool is full, dropping the new connection");
        }
    }

    fn remove_connection(&self, connection: &Arc<Connection>, error: ConnectionError) {
        debug!(
            address = %self.address,
            connection = ?Arc::as_ptr(connection),
            error = %error,
            "Removing broken connection from the pool"
        );
        self.conns.rcu(|conns| {
            conns
                .iter()
                .filter(|conn| !Arc::ptr_eq(*conn, connection))
                .cloned()
                .collect::<Vec<_>>()
        });
        self.last_error.store(Some(Arc::new(error)));
    }

    async fn grow(self: Arc<Self>) {
        // The caller may have counted connections before the previous
        // growth finished.
        if self.conns.load().len() < self.limits().max {
            let result = open_connection(self.address, &self.connection_config).await;
            self.handle_opened_connection(result);
        }
        self.growing.store(false, Ordering::Release);
    }

    fn unavailable_error(&self) -> ConnectionPoolError {
        let last_connection_error = match self.last_error.load_full() {
            Some(err) => ConnectionError::clone(&err),
            None => ConnectionError::BrokenConnection(BrokenConnectionErrorKind::ChannelError.into()),
        };
        ConnectionPoolError::Broken {
            last_connection_error,
        }
    }
}

/// Multiplexed connections to one host.
///
/// Core connections are opened on first use. Under load the pool grows one
/// connection at a time up to the maximum for the host's distance. A
/// background watcher replaces broken connections up to the core count.
pub struct HostConnectionPool {
    shared: Arc<PoolShared>,
    _watcher_handle: RemoteHandle<()>,
}

impl std::fmt::Debug for HostConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostConnectionPool")
            .field("host_id", &self.shared.host_id)
            .field("address", &self.shared.address)
            .field("distance", &self.shared.distance())
            .field("connections", &self.shared.conns.load().len())
            .finish_non_exhaustive()
    }
}

impl HostConnectionPool {
    /// Creates an empty pool. No connection is opened until the first borrow.
    ///
    /// Must be called within a tokio runtime: the pool spawns its watcher.
    pub fn new(
        host_id: Uuid,
        address: SocketAddr,
        distance: HostDistance,
        connection_config: ConnectionConfig,
        pooling: PoolingOptions,
    ) -> Self {
        let (registration_sender, registration_receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(PoolShared {
            host_id,
            address,
            connection_config,
            pooling,
            distance: RwLock::new(distance),
            conns: ArcSwap::from_pointee(Vec::new()),
            initialized: OnceCell::new(),
            growing: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            last_error: ArcSwapOption::empty(),
            registration_sender,
            watcher_notify: Notify::new(),
        });

        let watcher = PoolWatcher {
            shared: Arc::clone(&shared),
            registrations: registration_receiver,
            connection_errors: FuturesUnordered::new(),
            ready_connections: FuturesUnordered::new(),
            refill_delay_strategy: RefillDelayStrategy::new(),
            had_error_since_last_refill: false,
        };
        let (fut, watcher_handle) = watcher.run().remote_handle();
        tokio::spawn(fut);

        HostConnectionPool {
            shared,
            _watcher_handle: watcher_handle,
        }
    }

    /// Returns the least loaded connection, opening the core connections
    /// first if this is the first borrow. Concurrent first borrowers wait
    /// for one shared initialization.
    ///
    /// May trigger growth of the pool. Fails with
    /// [`ConnectionPoolError::Overloaded`] only when the pool is at its
    /// maximum and the chosen connection has no free stream id.
    pub async fn borrow_connection(&self) -> Result<Arc<Connection>, ConnectionPoolError> {
        self.ensure_usable()?;
        self.ensure_initialized().await;
        self.try_borrow_connection()
    }

    /// Like [`borrow_connection`](Self::borrow_connection), preferring a
    /// connection to `shard`. Falls back to any connection if no connection
    /// to that shard is available.
    pub async fn borrow_connection_for_shard(
        &self,
        shard: Shard,
    ) -> Result<Arc<Connection>, ConnectionPoolError> {
        self.ensure_usable()?;
        self.ensure_initialized().await;

        let conns = self.shared.conns.load_full();
        let on_shard = conns.iter().filter(|conn| {
            !conn.is_broken()
                && conn
                    .get_shard_info()
                    .is_some_and(|info| Shard::from(info.shard) == shard)
        });
        match Self::least_loaded(on_shard) {
            Some(connection) => {
                trace!(shard, "Found connection for the target shard");
                self.maybe_grow(&connection, conns.len())?;
                Ok(connection)
            }
            None => {
                trace!(shard, "No connection to the target shard, choosing any");
                self.try_borrow_connection()
            }
        }
    }

    /// Borrows without waiting. Fails with
    /// [`ConnectionPoolError::Initializing`] before the core connections
    /// were attempted.
    pub fn try_borrow_connection(&self) -> Result<Arc<Connection>, ConnectionPoolError> {
        self.ensure_usable()?;
        if !self.shared.initialized.initialized() {
            return Err(ConnectionPoolError::Initializing);
        }

        let conns = self.shared.conns.load_full();
        trace!(
            connections = %conns
                .iter()
                .map(|conn| conn.in_flight())
                .safe_format(", "),
            "In-flight requests per connection"
        );
        let connection = Self::least_loaded(conns.iter().filter(|conn| !conn.is_broken()))
            .ok_or_else(|| self.shared.unavailable_error())?;
        self.maybe_grow(&connection, conns.len())?;
        Ok(connection)
    }

    async fn ensure_initialized(&self) {
        if self.shared.initialized.initialized() {
            return;
        }
        self.shared
            .initialized
            .get_or_init(|| self.shared.initialize())
            .await;
        // Failed core connections are retried by the watcher, which only
        // refills initialized pools.
        self.shared.watcher_notify.notify_one();
    }

    fn ensure_usable(&self) -> Result<(), ConnectionPoolError> {
        if self.shared.is_disposed() {
            return Err(ConnectionPoolError::Shutdown);
        }
        if self.shared.distance() == HostDistance::Ignored {
            return Err(ConnectionPoolError::HostIgnored);
        }
        Ok(())
    }

    // Picks the connection with the fewest requests in flight,
    // breaking ties randomly.
    fn least_loaded<'a>(
        conns: impl Iterator<Item = &'a Arc<Connection>>,
    ) -> Option<Arc<Connection>> {
        let mut best: Vec<&Arc<Connection>> = Vec::new();
        let mut best_load = usize::MAX;
        for conn in conns {
            let load = conn.in_flight();
            if load < best_load {
                best_load = load;
                best.clear();
            }
            if load == best_load {
                best.push(conn);
            }
        }
        match best.len() {
            0 => None,
            1 => Some(Arc::clone(best[0])),
            len => Some(Arc::clone(best[rand::rng().random_range(0..len)])),
        }
    }

    fn maybe_grow(
        &self,
        chosen: &Connection,
        connection_count: usize,
    ) -> Result<(), ConnectionPoolError> {
        let in_flight = chosen.in_flight();
        if in_flight <= self.shared.pooling.new_connection_threshold {
            return Ok(());
        }

        let max = self.shared.limits().max;
        if connection_count < max {
            if self
                .shared
                .growing
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                debug!(
                    address = %self.shared.address,
                    connections = connection_count,
                    in_flight,
                    "Growing the pool by one connection"
                );
                tokio::spawn(Arc::clone(&self.shared).grow());
            }
            return Ok(());
        }

        warn!(
            address = %self.shared.address,
            connections = connection_count,
            in_flight,
            "Pool is at its maximum size and its least loaded connection is over the threshold"
        );
        if chosen.available_stream_ids() == 0 {
            return Err(ConnectionPoolError::Overloaded {
                address: self.shared.address,
                connections: connection_count,
            });
        }
        Ok(())
    }

    /// Moves the host to another distance. Limits of the new distance apply
    /// from now on; [`HostDistance::Ignored`] shuts the pool down.
    pub fn set_distance(&self, distance: HostDistance) {
        let previous = {
            // Nobody panics while holding this lock.
            let mut guard = self.shared.distance.write().unwrap();
            std::mem::replace(&mut *guard, distance)
        };
        if previous == distance {
            return;
        }
        debug!(
            address = %self.shared.address,
            ?previous,
            ?distance,
            "Host distance changed"
        );

        if distance == HostDistance::Ignored {
            self.shutdown();
            return;
        }
        let max = self.shared.pooling.limits(distance).max;
        self.shared.conns.rcu(|conns| {
            conns.iter().take(max).cloned().collect::<Vec<_>>()
        });
        self.shared.watcher_notify.notify_one();
    }

    /// Closes every connection and stops the watcher. Later borrows fail
    /// with [`ConnectionPoolError::Shutdown`].
    pub fn shutdown(&self) {
        if self.shared.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(address = %self.shared.address, "Shutting down the pool");
        self.shared.conns.store(Arc::new(Vec::new()));
        self.shared.watcher_notify.notify_one();
    }

    /// Whether [`shutdown`](Self::shutdown) was called.
    pub fn is_shut_down(&self) -> bool {
        self.shared.is_disposed()
    }

    /// Current distance of the host.
    pub fn distance(&self) -> HostDistance {
        self.shared.distance()
    }

    /// Number of connections in the pool, broken ones not yet removed included.
    pub fn connection_count(&self) -> usize {
        self.shared.conns.load().len()
    }

    /// Sharding function of the host, known once a connection is open.
    pub fn sharder(&self) -> Option<Sharder> {
        self.shared
            .conns
            .load()
            .iter()
            .find_map(|conn| conn.get_sharder())
    }

    /// Id of the host.
    pub fn host_id(&self) -> Uuid {
        self.shared.host_id
    }

    /// Address connections are opened to.
    pub fn address(&self) -> SocketAddr {
        self.shared.address
    }
}

type OpenFuture =
    Pin<Box<dyn Future<Output = Result<(Connection, ErrorReceiver), ConnectionError>> + Send>>;

struct BrokenConnectionEvent {
    connection: Weak<Connection>,
    error: ConnectionError,
}

async fn wait_for_error(
    connection: Weak<Connection>,
    error_receiver: ErrorReceiver,
) -> BrokenConnectionEvent {
    BrokenConnectionEvent {
        connection,
        error: error_receiver.await.unwrap_or_else(|_| {
            ConnectionError::BrokenConnection(BrokenConnectionErrorKind::ChannelError.into())
        }),
    }
}

// Evicts broken connections and refills the pool up to its core size.
struct PoolWatcher {
    shared: Arc<PoolShared>,
    registrations: mpsc::UnboundedReceiver<Registration>,
    connection_errors: FuturesUnordered<Pin<Box<dyn Future<Output = BrokenConnectionEvent> + Send>>>,
    ready_connections: FuturesUnordered<OpenFuture>,
    refill_delay_strategy: RefillDelayStrategy,
    had_error_since_last_refill: bool,
}

impl PoolWatcher {
    async fn run(mut self) {
        debug!(address = %self.shared.address, "Started pool watcher");

        let mut next_refill_time = tokio::time::Instant::now();
        let mut refill_scheduled = false;

        loop {
            tokio::select! {
                _ = self.shared.watcher_notify.notified() => {
                    if self.shared.is_disposed() {
                        debug!(address = %self.shared.address, "Pool disposed, stopping the watcher");
                        return;
                    }
                }

                Some((connection, error_receiver)) = self.registrations.recv() => {
                    self.connection_errors
                        .push(Box::pin(wait_for_error(connection, error_receiver)));
                }

                evt = self.connection_errors.select_next_some(), if !self.connection_errors.is_empty() => {
                    if let Some(conn) = evt.connection.upgrade() {
                        self.shared.remove_connection(&conn, evt.error);
                    }
                }

                result = self.ready_connections.select_next_some(), if !self.ready_connections.is_empty() => {
                    if result.is_err() {
                        self.had_error_since_last_refill = true;
                    }
                    self.shared.handle_opened_connection(result);
                }

                _ = tokio::time::sleep_until(next_refill_time), if refill_scheduled => {
                    self.had_error_since_last_refill = false;
                    self.start_filling();
                    refill_scheduled = false;
                }
            }

            if self.shared.is_disposed() {
                return;
            }

            // Schedule refilling here
            if !refill_scheduled && self.need_filling() {
                if self.had_error_since_last_refill {
                    self.refill_delay_strategy.on_fill_error();
                } else {
                    self.refill_delay_strategy.on_successful_fill();
                }
                let delay = self.refill_delay_strategy.get_delay();
                debug!(
                    address = %self.shared.address,
                    "Scheduling next refill in {} ms",
                    delay.as_millis(),
                );

                next_refill_time = tokio::time::Instant::now() + delay;
                refill_scheduled = true;
            }
        }
    }

    fn need_filling(&self) -> bool {
        self.shared.initialized.initialized()
            && self.ready_connections.is_empty()
            && self.shared.conns.load().len() < self.shared.limits().core
    }

    fn start_filling(&mut self) {
        let to_open_count = self
            .shared
            .limits()
            .core
            .saturating_sub(self.shared.conns.load().len());
        trace!(
            address = %self.shared.address,
            "Will open {} connections",
            to_open_count,
        );
        for _ in 0..to_open_count {
            let address = self.shared.address;
            let config = self.shared.connection_config.clone();
            self.ready_connections
                .push(Box::pin(async move { open_connection(address, &config).await }));
        }
    }
}
