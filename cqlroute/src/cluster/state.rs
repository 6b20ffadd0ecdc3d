use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use arc_swap::ArcSwap;
use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::events::{ClusterEvent, HostListener, ListenerHandle, ListenerRegistry};
use super::host::{Host, HostInfo};
use crate::errors::{ConnectionPoolError, TabletParsingError, TokenCalculationError};
use crate::network::{Connection, ConnectionConfig, HostDistance, PoolingOptions};
use crate::routing::locator::tablet_updater::TabletUpdater;
use crate::routing::locator::{TableSpec, Tablet, TabletMap, TabletMapUpdateRequest, TokenMap};
use crate::routing::partitioner::PartitionerName;
use crate::routing::{Shard, Token};

/// Events a lagging broadcast subscriber may fall behind by before
/// it starts losing them.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Configuration of a [`Cluster`].
#[derive(Debug, Clone, Default)]
pub struct ClusterConfig {
    /// Used for every connection to every host.
    pub connection_config: ConnectionConfig,
    /// Sizing of host pools.
    pub pooling: PoolingOptions,
    /// Partitioner of the cluster, used to parse ring tokens and hash keys.
    pub partitioner: PartitionerName,
}

/// Hosts of a cluster with their pools, plus the routing state built on them.
///
/// The embedding application feeds topology and schema changes in through
/// the `add_host`/`remove_host`/`*_dropped` family; the cluster turns them
/// into [`ClusterEvent`]s, rebuilds the token ring and keeps the tablet map
/// in sync.
///
/// Must be created within a tokio runtime.
pub struct Cluster {
    config: ClusterConfig,
    hosts: RwLock<HashMap<Uuid, Arc<Host>>>,
    token_map: ArcSwap<TokenMap>,
    tablets: Arc<TabletMap>,
    tablet_updater: TabletUpdater,
    events: broadcast::Sender<ClusterEvent>,
    listeners: Arc<ListenerRegistry>,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("config", &self.config)
            .field("hosts", &self.hosts())
            .field("ring_tokens", &self.token_map.load().len())
            .field("tablet_tables", &self.tablets.table_count())
            .finish_non_exhaustive()
    }
}

impl Cluster {
    /// Creates a cluster without hosts.
    pub fn new(config: ClusterConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let tablets = Arc::new(TabletMap::new());
        let tablet_updater = TabletUpdater::new(Arc::clone(&tablets));
        let token_map = ArcSwap::from_pointee(TokenMap::new_empty(config.partitioner));

        Cluster {
            config,
            hosts: RwLock::new(HashMap::new()),
            token_map,
            tablets,
            tablet_updater,
            events,
            listeners: Arc::new(ListenerRegistry::default()),
        }
    }

    /// Async subscription to every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    /// Registers a synchronous observer. It is unsubscribed when the
    /// returned handle is dropped.
    pub fn add_listener(&self, listener: Arc<dyn HostListener>) -> ListenerHandle {
        self.listeners.register(listener)
    }

    fn publish(&self, event: ClusterEvent) {
        debug!(?event, "Publishing cluster event");
        // Queued behind earlier tablet updates.
        self.tablet_updater.handle_event(&event);
        self.listeners.notify(&event);
        // Fails only without subscribers.
        let _ = self.events.send(event);
    }

    /// Adds a host, or replaces the host with the same id. Its pool opens
    /// connections on first use; ignored hosts get no pool.
    pub fn add_host(&self, info: HostInfo, distance: HostDistance) {
        let host_id = info.host_id;
        let host = Arc::new(Host::new(
            info,
            distance,
            &self.config.connection_config,
            &self.config.pooling,
        ));
        info!(
            host_id = %host_id,
            address = %host.address,
            ?distance,
            "Adding host"
        );

        let previous = {
            // Nobody panics while holding this lock.
            let mut hosts = self.hosts.write().unwrap();
            let previous = hosts.insert(host_id, host);
            self.rebuild_token_map(&hosts);
            previous
        };
        match previous {
            Some(previous) => {
                debug!(host_id = %host_id, "Replaced a known host");
                previous.shutdown();
            }
            None => self.publish(ClusterEvent::HostAdded(host_id)),
        }
    }

    /// Removes a host: its pool is shut down, its ring tokens and every
    /// tablet listing it are dropped. Returns `false` for unknown hosts.
    pub fn remove_host(&self, host_id: Uuid) -> bool {
        let removed = {
            // Nobody panics while holding this lock.
            let mut hosts = self.hosts.write().unwrap();
            let removed = hosts.remove(&host_id);
            if removed.is_some() {
                self.rebuild_token_map(&hosts);
            }
            removed
        };
        let Some(host) = removed else {
            return false;
        };

        info!(host_id = %host_id, address = %host.address, "Removing host");
        host.shutdown();
        if host.set_up(false) {
            self.publish(ClusterEvent::HostDown(host_id));
        }
        self.publish(ClusterEvent::HostRemoved(host_id));
        true
    }

    /// Reclassifies a host. Returns `false` if the host is unknown or
    /// already at that distance.
    pub fn set_host_distance(&self, host_id: Uuid, distance: HostDistance) -> bool {
        let Some(host) = self.host(host_id) else {
            return false;
        };
        if !host.set_distance(distance, &self.config.connection_config, &self.config.pooling) {
            return false;
        }
        self.publish(ClusterEvent::DistanceChanged { host_id, distance });
        true
    }

    /// Records that the host is reachable. Repeated reports are ignored.
    pub fn mark_host_up(&self, host_id: Uuid) {
        if let Some(host) = self.host(host_id) {
            if host.set_up(true) {
                self.publish(ClusterEvent::HostUp(host_id));
            }
        }
    }

    /// Records that the host is unreachable. Repeated reports are ignored.
    pub fn mark_host_down(&self, host_id: Uuid) {
        if let Some(host) = self.host(host_id) {
            if host.set_up(false) {
                self.publish(ClusterEvent::HostDown(host_id));
            }
        }
    }

    /// Drops tablet info of every table in the keyspace.
    pub fn keyspace_dropped(&self, keyspace: impl Into<String>) {
        self.publish(ClusterEvent::KeyspaceDropped(keyspace.into()));
    }

    /// Drops tablet info of the table.
    pub fn table_dropped(&self, table: TableSpec) {
        self.publish(ClusterEvent::TableDropped(table));
    }

    fn rebuild_token_map(&self, hosts: &HashMap<Uuid, Arc<Host>>) {
        let token_map = TokenMap::build(
            self.config.partitioner,
            hosts.values().map(|host| (host.host_id, host.tokens())),
        );
        debug!(
            hosts = token_map.hosts().len(),
            tokens = token_map.len(),
            "Rebuilt token map"
        );
        self.token_map.store(Arc::new(token_map));
    }

    /// Snapshot of the static token ring.
    pub fn token_map(&self) -> Arc<TokenMap> {
        self.token_map.load_full()
    }

    /// The tablet map.
    pub fn tablets(&self) -> &TabletMap {
        &self.tablets
    }

    /// Looks up a host.
    pub fn host(&self, host_id: Uuid) -> Option<Arc<Host>> {
        // Nobody panics while holding this lock.
        self.hosts.read().unwrap().get(&host_id).cloned()
    }

    /// Every known host, in no particular order.
    pub fn hosts(&self) -> Vec<Arc<Host>> {
        // Nobody panics while holding this lock.
        self.hosts.read().unwrap().values().cloned().collect()
    }

    /// Replicas of `token` in the table.
    ///
    /// Tablets are consulted first and carry their shard. Without tablet
    /// coverage, the token ring answers; the shard is then computed from
    /// the host's sharding parameters, once a connection revealed them.
    pub fn replicas(&self, keyspace: &str, table: &str, token: Token) -> Vec<(Uuid, Option<Shard>)> {
        let tablet_replicas = self.tablets.get_replicas(keyspace, table, token);
        if !tablet_replicas.is_empty() {
            return tablet_replicas
                .into_iter()
                .map(|(host_id, shard)| (host_id, Some(shard)))
                .collect();
        }

        let token_map = self.token_map.load();
        // Nobody panics while holding this lock.
        let hosts = self.hosts.read().unwrap();
        token_map
            .get_replicas(&token)
            .iter()
            .map(|host_id| {
                let shard = hosts
                    .get(host_id)
                    .and_then(|host| host.sharder())
                    .map(|sharder| sharder.shard_of(token));
                (*host_id, shard)
            })
            .collect()
    }

    /// Hashes the serialized partition key components with the cluster's
    /// partitioner and resolves the replicas of the resulting token.
    pub fn replicas_for_key(
        &self,
        keyspace: &str,
        table: &str,
        partition_key: &[&[u8]],
    ) -> Result<Vec<(Uuid, Option<Shard>)>, TokenCalculationError> {
        let token = self.config.partitioner.hash_partition_key(partition_key)?;
        Ok(self.replicas(keyspace, table, token))
    }

    /// Borrows a connection to the host, preferring `shard` if given.
    pub async fn connection_to(
        &self,
        host_id: Uuid,
        shard: Option<Shard>,
    ) -> Result<Arc<Connection>, ConnectionPoolError> {
        let host = self
            .host(host_id)
            .ok_or(ConnectionPoolError::UnknownHost(host_id))?;
        host.borrow_connection(shard).await
    }

    /// Feeds the tablet routing info of a response's custom payload into
    /// the tablet map. Payloads without tablet info are ignored.
    pub fn handle_custom_payload(
        &self,
        table: &TableSpec,
        payload: &HashMap<String, Bytes>,
    ) -> Result<(), TabletParsingError> {
        let Some(tablet) = Tablet::from_custom_payload(payload) else {
            return Ok(());
        };
        let tablet = tablet.inspect_err(|err| {
            warn!(
                keyspace = table.ks_name(),
                table = table.table_name(),
                error = %err,
                "Received malformed tablet info"
            );
        })?;
        self.apply_tablet_update(TabletMapUpdateRequest::AddTablet {
            table: table.clone(),
            tablet,
        });
        Ok(())
    }

    /// Queues a structural tablet map change.
    pub fn apply_tablet_update(&self, request: TabletMapUpdateRequest) {
        self.tablet_updater.apply(request);
    }

    /// Waits until every tablet update queued and every event published
    /// so far is reflected in the tablet map.
    pub async fn flush_tablet_updates(&self) {
        self.tablet_updater.flush().await;
    }

    /// Shuts down every pool and the tablet updater.
    pub fn shutdown(&self) {
        info!("Shutting down cluster");
        for host in self.hosts() {
            host.shutdown();
        }
        self.tablet_updater.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Mutex;

    use assert_matches::assert_matches;
    use tokio::sync::broadcast::error::TryRecvError;

    use super::*;
    use crate::routing::locator::CUSTOM_PAYLOAD_TABLETS_V1_KEY;
    use crate::utils::test_utils::{
        serialize_tablet_payload, setup_tracing, MockNode, MockNodeConfig,
    };

    fn host_id(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    fn info(n: u128, address: SocketAddr, tokens: &[&str]) -> HostInfo {
        HostInfo {
            host_id: host_id(n),
            address,
            datacenter: Some("dc1".to_owned()),
            rack: None,
            tokens: tokens.iter().map(|t| (*t).to_owned()).collect(),
        }
    }

    // Pools are lazy, so unreachable addresses are fine until a borrow.
    fn unreachable(n: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], n))
    }

    fn three_host_cluster() -> Cluster {
        let cluster = Cluster::new(ClusterConfig::default());
        cluster.add_host(info(1, unreachable(1), &["10"]), HostDistance::Local);
        cluster.add_host(info(2, unreachable(2), &["20"]), HostDistance::Local);
        cluster.add_host(info(3, unreachable(3), &["30"]), HostDistance::Remote);
        cluster
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<ClusterEvent>>,
    }

    impl HostListener for Recorder {
        fn on_event(&self, event: &ClusterEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn ring_is_rebuilt_on_topology_changes() {
        setup_tracing();
        let cluster = three_host_cluster();
        assert_eq!(cluster.replicas("ks", "t", Token::new(25)), vec![(host_id(3), None)]);
        assert_eq!(cluster.replicas("ks", "t", Token::new(35)), vec![(host_id(1), None)]);

        let before = cluster.token_map();
        assert!(cluster.remove_host(host_id(3)));
        assert!(!cluster.remove_host(host_id(3)));
        assert_eq!(cluster.replicas("ks", "t", Token::new(25)), vec![(host_id(1), None)]);
        // Old snapshots are unaffected.
        assert_eq!(before.len(), 3);
        assert_eq!(cluster.token_map().len(), 2);
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn keys_are_hashed_with_the_cluster_partitioner() {
        setup_tracing();
        let cluster = Cluster::new(ClusterConfig::default());
        cluster.add_host(info(1, unreachable(1), &["-7000000000000000000"]), HostDistance::Local);
        cluster.add_host(info(2, unreachable(2), &["-6000000000000000000"]), HostDistance::Local);

        // "test" hashes to -6017608668500074083 under Murmur3.
        assert_eq!(
            cluster.replicas_for_key("ks", "t", &[&b"test"[..]]).unwrap(),
            vec![(host_id(2), None)]
        );
        let too_long = vec![0u8; 70000];
        assert_matches!(
            cluster.replicas_for_key("ks", "t", &[&too_long[..], &b"x"[..]]),
            Err(TokenCalculationError::ValueTooLong(70000))
        );
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn tablets_take_precedence_over_the_ring() {
        setup_tracing();
        let cluster = three_host_cluster();
        let table = TableSpec::new("ks", "t");

        let payload = HashMap::from([(
            CUSTOM_PAYLOAD_TABLETS_V1_KEY.to_owned(),
            serialize_tablet_payload(0, 100, &[(host_id(2), 5)]),
        )]);
        cluster.handle_custom_payload(&table, &payload).unwrap();
        cluster.handle_custom_payload(&table, &HashMap::new()).unwrap();
        cluster.flush_tablet_updates().await;

        assert_eq!(cluster.replicas("ks", "t", Token::new(25)), vec![(host_id(2), Some(5))]);
        // Outside the tablet and in another table the ring answers.
        assert_eq!(cluster.replicas("ks", "t", Token::new(150)), vec![(host_id(1), None)]);
        assert_eq!(cluster.replicas("ks", "u", Token::new(25)), vec![(host_id(3), None)]);

        cluster.table_dropped(table);
        cluster.flush_tablet_updates().await;
        assert_eq!(cluster.replicas("ks", "t", Token::new(25)), vec![(host_id(3), None)]);
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn malformed_tablet_payload_is_rejected() {
        setup_tracing();
        let cluster = three_host_cluster();
        let payload = HashMap::from([(
            CUSTOM_PAYLOAD_TABLETS_V1_KEY.to_owned(),
            serialize_tablet_payload(100, 0, &[(host_id(2), 5)]),
        )]);
        assert_matches!(
            cluster.handle_custom_payload(&TableSpec::new("ks", "t"), &payload),
            Err(TabletParsingError::EmptyRange { first: 100, last: 0 })
        );
        cluster.flush_tablet_updates().await;
        assert_eq!(cluster.tablets().table_count(), 0);
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn removed_host_loses_its_tablets() {
        setup_tracing();
        let cluster = three_host_cluster();
        for (ks, replicas) in [("a", vec![host_id(1), host_id(2)]), ("b", vec![host_id(2)])] {
            cluster.apply_tablet_update(TabletMapUpdateRequest::AddTablet {
                table: TableSpec::new(ks, "t"),
                tablet: Tablet::new(0, 100, replicas.into_iter().map(|id| (id, 0)).collect())
                    .unwrap(),
            });
        }
        cluster.flush_tablet_updates().await;

        cluster.remove_host(host_id(1));
        cluster.flush_tablet_updates().await;
        assert!(cluster.tablets().get_replicas("a", "t", Token::new(50)).is_empty());
        assert_eq!(
            cluster.tablets().get_replicas("b", "t", Token::new(50)),
            vec![(host_id(2), 0)]
        );

        cluster.keyspace_dropped("b");
        cluster.flush_tablet_updates().await;
        assert!(cluster.tablets().get_replicas("b", "t", Token::new(50)).is_empty());
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn host_removal_evicts_tablets_queued_before_it() {
        setup_tracing();
        let cluster = three_host_cluster();
        cluster.apply_tablet_update(TabletMapUpdateRequest::AddTablet {
            table: TableSpec::new("ks", "t"),
            tablet: Tablet::new(0, 100, vec![(host_id(1), 0)]).unwrap(),
        });
        // No flush in between: the update is still queued.
        cluster.remove_host(host_id(1));
        cluster.flush_tablet_updates().await;

        let replicas = cluster.replicas("ks", "t", Token::new(50));
        assert!(replicas.iter().all(|(id, _)| *id != host_id(1)));
        assert!(cluster.tablets().get_replicas("ks", "t", Token::new(50)).is_empty());
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn events_reach_subscribers_and_listeners() {
        setup_tracing();
        let cluster = Cluster::new(ClusterConfig::default());
        let mut events = cluster.subscribe();
        let recorder = Arc::new(Recorder::default());
        let handle = cluster.add_listener(recorder.clone());

        cluster.add_host(info(1, unreachable(1), &["10"]), HostDistance::Local);
        cluster.mark_host_up(host_id(1));
        cluster.mark_host_down(host_id(1));
        cluster.mark_host_down(host_id(1));
        cluster.mark_host_up(host_id(1));
        cluster.set_host_distance(host_id(1), HostDistance::Remote);
        cluster.set_host_distance(host_id(1), HostDistance::Remote);
        cluster.remove_host(host_id(1));

        let expected = vec![
            ClusterEvent::HostAdded(host_id(1)),
            ClusterEvent::HostDown(host_id(1)),
            ClusterEvent::HostUp(host_id(1)),
            ClusterEvent::DistanceChanged {
                host_id: host_id(1),
                distance: HostDistance::Remote,
            },
            ClusterEvent::HostDown(host_id(1)),
            ClusterEvent::HostRemoved(host_id(1)),
        ];
        assert_eq!(*recorder.events.lock().unwrap(), expected);
        for event in expected {
            assert_eq!(events.try_recv().unwrap(), event);
        }
        assert_matches!(events.try_recv(), Err(TryRecvError::Empty));

        drop(handle);
        cluster.keyspace_dropped("ks");
        assert_eq!(recorder.events.lock().unwrap().len(), 6);
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn ignored_hosts_have_no_pool() {
        setup_tracing();
        let cluster = Cluster::new(ClusterConfig::default());
        cluster.add_host(info(1, unreachable(1), &["10"]), HostDistance::Ignored);

        let host = cluster.host(host_id(1)).unwrap();
        assert!(host.pool().is_none());
        assert_matches!(
            cluster.connection_to(host_id(1), None).await,
            Err(ConnectionPoolError::HostIgnored)
        );
        assert_matches!(
            cluster.connection_to(host_id(9), None).await,
            Err(ConnectionPoolError::UnknownHost(id)) if id == host_id(9)
        );
        // Ignored hosts still own their ring range.
        assert_eq!(cluster.replicas("ks", "t", Token::new(0)), vec![(host_id(1), None)]);

        assert!(cluster.set_host_distance(host_id(1), HostDistance::Local));
        assert!(host.pool().is_some());
        assert!(cluster.set_host_distance(host_id(1), HostDistance::Ignored));
        assert!(host.pool().is_none());
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn connections_are_routed_to_shards() {
        setup_tracing();
        let node = MockNode::start(MockNodeConfig {
            shards: Some(2),
            ..Default::default()
        })
        .await;
        let cluster = Cluster::new(ClusterConfig {
            pooling: PoolingOptions {
                local: crate::network::ConnectionLimits { core: 2, max: 2 },
                ..Default::default()
            },
            ..Default::default()
        });
        cluster.add_host(info(1, node.address(), &["0"]), HostDistance::Local);

        // The shard is unknown until a connection revealed the sharding parameters.
        let token = Token::new(-100);
        assert_eq!(cluster.replicas("ks", "t", token), vec![(host_id(1), None)]);

        for shard in [0, 1] {
            let connection = cluster.connection_to(host_id(1), Some(shard)).await.unwrap();
            assert_eq!(Shard::from(connection.get_shard_info().unwrap().shard), shard);
        }

        let sharder = cluster.host(host_id(1)).unwrap().sharder().unwrap();
        assert_eq!(
            cluster.replicas("ks", "t", token),
            vec![(host_id(1), Some(sharder.shard_of(token)))]
        );

        cluster.shutdown();
        assert_matches!(
            cluster.connection_to(host_id(1), None).await,
            Err(ConnectionPoolError::Shutdown)
        );
    }
}
