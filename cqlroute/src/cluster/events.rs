//! Cluster events: topology and schema changes that drive routing state.
//!
//! Events are published two ways. A tokio [`broadcast`](tokio::sync::broadcast)
//! channel serves async consumers, such as the tablet updater. Synchronous
//! observers implement [`HostListener`] and stay registered for as long as
//! they hold the returned [`ListenerHandle`].

use std::sync::{Arc, RwLock, Weak};

use tracing::trace;
use uuid::Uuid;

use crate::network::HostDistance;
use crate::routing::locator::TableSpec;

/// A change in the cluster, as reported by the topology/schema event source.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ClusterEvent {
    /// A host joined the cluster.
    HostAdded(Uuid),
    /// A host left the cluster. Its tablets are dropped.
    HostRemoved(Uuid),
    /// Connectivity to a known host was established.
    HostUp(Uuid),
    /// Connectivity to a known host was lost.
    HostDown(Uuid),
    /// The host was reclassified.
    DistanceChanged {
        /// The host.
        host_id: Uuid,
        /// Its new distance.
        distance: HostDistance,
    },
    /// A keyspace was dropped. Tablets of all its tables are dropped.
    KeyspaceDropped(String),
    /// A table was dropped, along with its tablets.
    TableDropped(TableSpec),
}

/// Synchronous observer of [`ClusterEvent`]s.
///
/// Called on the thread publishing the event, so implementations
/// should return quickly.
///
/// UP and DOWN events are deduplicated: a host already up does not get
/// another UP until a DOWN occurs, and vice versa.
pub trait HostListener: Send + Sync {
    /// Called for every event published after registration.
    fn on_event(&self, event: &ClusterEvent);
}

type ListenerId = u64;

#[derive(Default)]
struct Listeners {
    next_id: ListenerId,
    entries: Vec<(ListenerId, Arc<dyn HostListener>)>,
}

/// Registered [`HostListener`]s.
#[derive(Default)]
pub(crate) struct ListenerRegistry {
    listeners: RwLock<Listeners>,
}

impl ListenerRegistry {
    pub(crate) fn register(self: &Arc<Self>, listener: Arc<dyn HostListener>) -> ListenerHandle {
        // Nobody panics while holding this lock.
        let mut listeners = self.listeners.write().unwrap();
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.entries.push((id, listener));
        trace!(id, "Registered host listener");

        ListenerHandle {
            registry: Arc::downgrade(self),
            id,
        }
    }

    pub(crate) fn notify(&self, event: &ClusterEvent) {
        // Listeners are called outside the lock, so they may (un)register others.
        let entries: Vec<Arc<dyn HostListener>> = {
            // Nobody panics while holding this lock.
            let listeners = self.listeners.read().unwrap();
            listeners
                .entries
                .iter()
                .map(|(_, listener)| Arc::clone(listener))
                .collect()
        };
        for listener in entries {
            listener.on_event(event);
        }
    }

    fn unregister(&self, id: ListenerId) {
        // Nobody panics while holding this lock.
        let mut listeners = self.listeners.write().unwrap();
        listeners.entries.retain(|(entry_id, _)| *entry_id != id);
        trace!(id, "Unregistered host listener");
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.listeners.read().unwrap().entries.len()
    }
}

/// Keeps a [`HostListener`] registered. Dropping it unsubscribes the listener.
#[must_use = "the listener is unsubscribed as soon as the handle is dropped"]
#[derive(Debug)]
pub struct ListenerHandle {
    registry: Weak<ListenerRegistry>,
    id: ListenerId,
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self.id);
        }
    }
}
