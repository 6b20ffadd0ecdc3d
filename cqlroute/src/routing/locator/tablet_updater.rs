use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::RemoteHandle;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, trace};
use uuid::Uuid;

use super::tablets::{TableSpec, Tablet, TabletMap};
use crate::cluster::ClusterEvent;

/// A structural change of the [`TabletMap`].
#[derive(Debug, Clone)]
pub enum TabletMapUpdateRequest {
    /// Insert a tablet, evicting the tablets of the table it overlaps.
    AddTablet {
        /// Table the tablet belongs to.
        table: TableSpec,
        /// The new tablet.
        tablet: Tablet,
    },
    /// Forget every table of a keyspace.
    RemoveKeyspace(String),
    /// Forget one table.
    RemoveTable(TableSpec),
    /// Forget every tablet replicated on a host.
    RemoveHost(Uuid),
}

#[derive(Debug)]
enum UpdaterMessage {
    Update(TabletMapUpdateRequest),
    // Answered once every message queued before it has been applied.
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Default)]
struct UpdaterShared {
    disposed: AtomicBool,
    shutdown: Notify,
}

/// Upper bound on requests taken from the queue in one go.
const BATCH_SIZE: usize = 64;

/// How often the worker checks whether it was disposed without being woken.
const LIVENESS_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Serializes structural tablet map updates through one background task.
///
/// Requests come from [`apply`](Self::apply), fed by the custom payload
/// decoding layer, and from [`handle_event`](Self::handle_event), fed with
/// dropped keyspaces and tables and removed hosts. Both share one queue,
/// so requests are applied in the order they were made.
///
/// Dropping the updater stops the worker.
pub(crate) struct TabletUpdater {
    sender: mpsc::UnboundedSender<UpdaterMessage>,
    shared: Arc<UpdaterShared>,
    _worker_handle: RemoteHandle<()>,
}

impl TabletUpdater {
    pub(crate) fn new(map: Arc<TabletMap>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(UpdaterShared::default());
        let worker = UpdaterWorker {
            map,
            requests: receiver,
            shared: Arc::clone(&shared),
        };
        let (fut, worker_handle) = worker.run().remote_handle();
        tokio::spawn(fut);

        TabletUpdater {
            sender,
            shared,
            _worker_handle: worker_handle,
        }
    }

    /// Queues a request. Requests sent after shutdown are dropped.
    pub(crate) fn apply(&self, request: TabletMapUpdateRequest) {
        if self.sender.send(UpdaterMessage::Update(request)).is_err() {
            trace!("Tablet updater is shut down, dropping update request");
        }
    }

    /// Queues the tablet map change a cluster event implies, if any.
    pub(crate) fn handle_event(&self, event: &ClusterEvent) {
        if let Some(request) = request_for_event(event) {
            self.apply(request);
        }
    }

    /// Waits until everything queued so far has been applied to the map.
    pub(crate) async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(UpdaterMessage::Flush(tx)).is_ok() {
            // An error means the worker exited, which is as good as flushed.
            let _ = rx.await;
        }
    }

    /// Stops the worker. Pending requests are discarded.
    pub(crate) fn shutdown(&self) {
        self.shared.disposed.store(true, Ordering::Release);
        self.shared.shutdown.notify_one();
    }

    #[cfg(test)]
    fn is_shut_down(&self) -> bool {
        self.sender.is_closed()
    }
}

struct UpdaterWorker {
    map: Arc<TabletMap>,
    requests: mpsc::UnboundedReceiver<UpdaterMessage>,
    shared: Arc<UpdaterShared>,
}

impl UpdaterWorker {
    async fn run(mut self) {
        let mut batch = Vec::with_capacity(BATCH_SIZE);
        let mut liveness = tokio::time::interval(LIVENESS_CHECK_INTERVAL);
        liveness.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.shared.shutdown.notified() => {
                    debug!("Tablet updater received shutdown notification");
                    break;
                }
                received = self.requests.recv_many(&mut batch, BATCH_SIZE) => {
                    if received == 0 {
                        debug!("Tablet update queue closed, stopping the updater");
                        break;
                    }
                    for message in batch.drain(..) {
                        match message {
                            UpdaterMessage::Update(request) => self.apply(request),
                            UpdaterMessage::Flush(done) => {
                                let _ = done.send(());
                            }
                        }
                    }
                }
                _ = liveness.tick() => {
                    if self.shared.disposed.load(Ordering::Acquire) {
                        debug!("Tablet updater observed the disposed flag");
                        break;
                    }
                }
            }
        }

        self.requests.close();
    }

    fn apply(&self, request: TabletMapUpdateRequest) {
        trace!(?request, "Applying tablet map update");
        match request {
            TabletMapUpdateRequest::AddTablet { table, tablet } => {
                self.map
                    .add_tablet(table.ks_name(), table.table_name(), tablet)
            }
            TabletMapUpdateRequest::RemoveKeyspace(keyspace) => self.map.remove_keyspace(&keyspace),
            TabletMapUpdateRequest::RemoveTable(table) => {
                self.map.remove_table(table.ks_name(), table.table_name())
            }
            TabletMapUpdateRequest::RemoveHost(host_id) => {
                let removed = self.map.remove_host(host_id);
                debug!(host_id = %host_id, removed, "Removed tablets of a removed host");
            }
        }
    }
}

fn request_for_event(event: &ClusterEvent) -> Option<TabletMapUpdateRequest> {
    match event {
        ClusterEvent::KeyspaceDropped(keyspace) => {
            Some(TabletMapUpdateRequest::RemoveKeyspace(keyspace.clone()))
        }
        ClusterEvent::TableDropped(table) => {
            Some(TabletMapUpdateRequest::RemoveTable(table.clone()))
        }
        ClusterEvent::HostRemoved(host_id) => Some(TabletMapUpdateRequest::RemoveHost(*host_id)),
        ClusterEvent::HostAdded(_)
        | ClusterEvent::HostUp(_)
        | ClusterEvent::HostDown(_)
        | ClusterEvent::DistanceChanged { .. } => None,
    }
}
