//! A routing table suitable for use in async contexts.

use std::{path::Path, sync::Arc};

use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::core::{
    error::Result,
    id::Id,
    routing_table::{InsertOutcome, PeerRecord, RoutingTable, Snapshot, Touch},
    traits::LivenessCheck,
};

/// Wraps [`RoutingTable`] behind a table-wide lock and implements the probing insertion.
///
/// The lock is never held across an `.await`: a full bucket's oldest entry is probed with the
/// lock released and the eviction is re-validated once the probe settles.
#[derive(Debug, Clone)]
pub struct SyncRoutingTable {
    routing_table: Arc<RwLock<RoutingTable>>,
}

impl SyncRoutingTable {
    pub fn new(local_id: Id, k: usize) -> Self {
        Self::from_table(RoutingTable::new(local_id, k))
    }

    pub fn from_table(routing_table: RoutingTable) -> Self {
        Self {
            routing_table: Arc::new(RwLock::new(routing_table)),
        }
    }

    pub fn local_id(&self) -> Id {
        self.routing_table.read().local_id()
    }

    pub fn k(&self) -> usize {
        self.routing_table.read().k()
    }

    pub fn len(&self) -> usize {
        self.routing_table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routing_table.read().is_empty()
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.routing_table.read().contains(id)
    }

    /// Returns a copy of every peer in the table.
    pub fn peers(&self) -> Vec<PeerRecord> {
        self.routing_table.read().peers().cloned().collect()
    }

    pub fn find_closest(&self, target: &Id, count: usize) -> Vec<PeerRecord> {
        self.routing_table.read().find_closest(target, count)
    }

    pub fn remove(&self, id: &Id) -> Option<PeerRecord> {
        self.routing_table.write().remove(id)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.routing_table.read().snapshot()
    }

    pub fn save_snapshot(&self, path: impl AsRef<Path>) -> Result<()> {
        self.routing_table.read().save_snapshot(path)
    }

    /// Replaces the table's content, used when restoring from a snapshot.
    pub fn restore(&self, routing_table: RoutingTable) {
        *self.routing_table.write() = routing_table;
    }

    /// Inserts or refreshes the peer.
    ///
    /// If the peer's bucket is full, the least-recently-seen entry is probed and the caller waits
    /// for the outcome: a dead incumbent is evicted in favour of the new peer, a live one is kept
    /// (and refreshed) and the new peer is dropped.
    pub async fn insert_node<L>(&self, peer: PeerRecord, liveness: &L) -> InsertOutcome
    where
        L: LivenessCheck + ?Sized,
    {
        let touch = self.routing_table.write().touch(peer.clone());

        let oldest = match touch {
            Touch::SelfEntry => return InsertOutcome::SelfEntry,
            Touch::Refreshed => return InsertOutcome::Refreshed,
            Touch::Appended => {
                trace!(peer = %peer.id, addr = %peer.addr, "appended peer");
                return InsertOutcome::Appended;
            }
            Touch::Full { oldest } => oldest,
        };

        let alive = liveness.is_alive(&oldest).await;

        if alive {
            self.routing_table.write().refresh(&oldest.id);
            trace!(peer = %peer.id, incumbent = %oldest.id, "bucket full, incumbent alive");
            return InsertOutcome::Rejected;
        }

        let replaced = self.routing_table.write().replace(&oldest.id, peer.clone());
        if replaced {
            debug!(evicted = %oldest.id, peer = %peer.id, "replaced unresponsive peer");
            return InsertOutcome::Replaced;
        }

        // The bucket changed while the probe was in flight, settle for whatever fits now.
        let retry = self.routing_table.write().touch(peer);
        match retry {
            Touch::Appended => InsertOutcome::Appended,
            Touch::Refreshed => InsertOutcome::Refreshed,
            Touch::SelfEntry => InsertOutcome::SelfEntry,
            Touch::Full { .. } => InsertOutcome::Rejected,
        }
    }
}
