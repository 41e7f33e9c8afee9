//! The store/replicate protocol.
//!
//! Each node decides locally whether a record is its to keep: it persists the record if it ranks
//! among the k closest peers to the key it knows of, otherwise it redirects the writer to those
//! peers. The network drivers wrap the decision in the iterative lookup, asking every peer of the
//! closest set and following redirects until enough of them confirm.

use std::{collections::HashSet, future::Future};

use tracing::{debug, info, trace};

use crate::{
    core::{
        config::is_majority,
        error::{Error, Result},
        id::Id,
        message::{Delete, Message, Route, Store},
        record::{DeletionMarker, Record},
        routing_table::PeerRecord,
        traits::{Storage, Transport},
    },
    lookup::{drive, Lookup, QueryOutcome},
    node::{nonce, Node},
    router::SyncRoutingTable,
};

/// Where a key belongs from the local node's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// The local node is among the k closest known peers to the key.
    Local,
    /// These peers are closer, closest first.
    Redirect(Vec<PeerRecord>),
}

/// Decides whether the key is the local node's to keep.
///
/// The local node keeps it unless the table already holds k peers closer to the key than itself.
pub fn placement(routing_table: &SyncRoutingTable, key: &Id) -> Placement {
    let local_id = routing_table.local_id();
    let k = routing_table.k();
    let closest = routing_table.find_closest(key, k);

    let own = local_id.distance(key);
    let closer = closest
        .iter()
        .filter(|peer| peer.id.distance(key) < own)
        .count();

    if closer < k {
        Placement::Local
    } else {
        Placement::Redirect(closest)
    }
}

/// Persists the record if the local node is responsible for the key, returns the peers to
/// forward to otherwise.
pub fn store_value<S: Storage + ?Sized>(
    routing_table: &SyncRoutingTable,
    storage: &S,
    key: Id,
    record: Record,
) -> Option<Vec<PeerRecord>> {
    match placement(routing_table, &key) {
        Placement::Local => {
            let fresh = storage.put(key, record);
            trace!(%key, fresh, "stored record locally");
            None
        }
        Placement::Redirect(nodes) => {
            trace!(%key, nodes = nodes.len(), "redirecting store");
            Some(nodes)
        }
    }
}

/// The local outcome of a delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The record was flagged as deleted (or already was).
    Deleted,
    /// The local node is responsible for the key but doesn't hold the record.
    Missing,
    /// These peers are closer, closest first.
    Redirect(Vec<PeerRecord>),
}

/// Applies the deletion marker if the local node is responsible for the key, with the same rule
/// as [`store_value`].
pub fn delete_value<S: Storage + ?Sized>(
    routing_table: &SyncRoutingTable,
    storage: &S,
    key: Id,
    marker: &DeletionMarker,
) -> DeleteOutcome {
    match placement(routing_table, &key) {
        Placement::Local if storage.mark_deleted(&key, marker) => DeleteOutcome::Deleted,
        Placement::Local => DeleteOutcome::Missing,
        Placement::Redirect(nodes) => DeleteOutcome::Redirect(nodes),
    }
}

/// The outcome of a network store or delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreReport {
    pub key: Id,
    /// The peers that confirmed, the local node included when it kept the record itself.
    pub confirmed: Vec<PeerRecord>,
    /// The closest peers known when the driver stopped, the intended replica set.
    pub replicas: Vec<PeerRecord>,
}

impl StoreReport {
    /// The replicas that haven't confirmed.
    pub fn awaiting(&self) -> Vec<PeerRecord> {
        let confirmed: HashSet<Id> = self.confirmed.iter().map(|peer| peer.id).collect();
        self.replicas
            .iter()
            .filter(|peer| !confirmed.contains(&peer.id))
            .cloned()
            .collect()
    }

    /// Returns `true` once `target` peers confirmed or a strict majority of the replica set did.
    pub fn is_complete(&self, target: usize) -> bool {
        let confirmed = self.confirmed.len();
        confirmed >= target || is_majority(confirmed, confirmed + self.awaiting().len())
    }
}

impl<T: Transport, S: Storage> Node<T, S> {
    /// Replicates the record to the k closest peers to its key, starting from the routing table.
    pub async fn store(&self, record: Record) -> Result<StoreReport> {
        let key = record.key(self.config.time_bucket)?;
        let seeds = self.routing_table.find_closest(&key, self.config.k);
        self.store_from(record, seeds).await
    }

    /// Replicates the record, starting from the supplied seeds.
    ///
    /// Every peer of the closest set is asked until the replication target is met. The local
    /// node then applies the same rule to itself with what the lookup taught its table, and counts
    /// as a replica when it keeps the record.
    pub async fn store_from(&self, record: Record, seeds: Vec<PeerRecord>) -> Result<StoreReport> {
        let key = record.key(self.config.time_bucket)?;

        let lookup = self
            .replicate(key, seeds, |peer| self.query_store(peer, key, record.clone()))
            .await;
        let kept = store_value(&self.routing_table, self.storage.as_ref(), key, record).is_none();

        let report = self.replica_report(key, lookup, kept);
        info!(
            %key,
            confirmed = report.confirmed.len(),
            replicas = report.replicas.len(),
            kept,
            "store finished"
        );

        Ok(report)
    }

    /// Soft-deletes the record the marker refers to on its replicas, starting from the routing
    /// table.
    pub async fn delete(&self, marker: DeletionMarker) -> Result<StoreReport> {
        let key = marker.key(self.config.time_bucket)?;
        let seeds = self.routing_table.find_closest(&key, self.config.k);
        self.delete_from(marker, seeds).await
    }

    /// Soft-deletes the record, starting from the supplied seeds.
    pub async fn delete_from(
        &self,
        marker: DeletionMarker,
        seeds: Vec<PeerRecord>,
    ) -> Result<StoreReport> {
        let key = marker.key(self.config.time_bucket)?;

        let lookup = self
            .replicate(key, seeds, |peer| self.query_delete(peer, key, marker.clone()))
            .await;
        let kept = delete_value(&self.routing_table, self.storage.as_ref(), key, &marker)
            == DeleteOutcome::Deleted;

        let report = self.replica_report(key, lookup, kept);
        debug!(%key, confirmed = report.confirmed.len(), kept, "delete finished");

        Ok(report)
    }

    // Runs the exhaustive confirmation lookup shared by stores and deletes.
    async fn replicate<F, Fut>(&self, key: Id, seeds: Vec<PeerRecord>, query: F) -> Lookup<()>
    where
        F: FnMut(PeerRecord) -> Fut,
        Fut: Future<Output = Result<QueryOutcome<()>>>,
    {
        if seeds.is_empty() {
            trace!(%key, "no seeds, local decision only");
            return Lookup {
                closest: Vec::new(),
                found: Vec::new(),
                rounds: 0,
            };
        }

        let mut session = self.session(key, seeds).exhaustive();
        drive(
            &mut session,
            &self.config,
            self.config.replication_target(),
            query,
            |peers| self.observe(peers),
        )
        .await
    }

    fn replica_report(&self, key: Id, lookup: Lookup<()>, kept: bool) -> StoreReport {
        let mut confirmed: Vec<PeerRecord> =
            lookup.found.into_iter().map(|(peer, ())| peer).collect();
        let mut replicas = lookup.closest;

        if kept {
            confirmed.push(self.contact());
            replicas.push(self.contact());
            replicas.sort_by_key(|peer| peer.id.distance(&key));
            replicas.truncate(self.config.k);
        }

        StoreReport {
            key,
            confirmed,
            replicas,
        }
    }

    async fn query_store(
        &self,
        peer: PeerRecord,
        key: Id,
        record: Record,
    ) -> Result<QueryOutcome<()>> {
        let nonce = nonce();
        let request = Message::Store(Store {
            nonce,
            sender: self.contact(),
            key,
            record,
        });

        match self.transport.request(&peer.addr, request).await? {
            message if message.nonce() != nonce => Err(Error::NonceMismatch),
            Message::Stored(_) => Ok(QueryOutcome::Found(())),
            Message::Redirect(redirect) => Ok(QueryOutcome::Redirect(redirect.nodes)),
            Message::Error(error) => Err(Error::Remote(error.reason)),
            other => Err(Error::UnexpectedResponse {
                expected: Route::Store,
                got: other.variant_as_str(),
            }),
        }
    }

    async fn query_delete(
        &self,
        peer: PeerRecord,
        key: Id,
        marker: DeletionMarker,
    ) -> Result<QueryOutcome<()>> {
        let nonce = nonce();
        let request = Message::Delete(Delete {
            nonce,
            sender: self.contact(),
            key,
            marker,
        });

        match self.transport.request(&peer.addr, request).await? {
            message if message.nonce() != nonce => Err(Error::NonceMismatch),
            Message::Deleted(_) => Ok(QueryOutcome::Found(())),
            Message::Redirect(redirect) => Ok(QueryOutcome::Redirect(redirect.nodes)),
            Message::Error(error) => Err(Error::Remote(error.reason)),
            other => Err(Error::UnexpectedResponse {
                expected: Route::Delete,
                got: other.variant_as_str(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::{record::TimeWindow, traits::LivenessCheck},
        memory::MemoryStorage,
    };

    struct AlwaysAlive;

    #[async_trait::async_trait]
    impl LivenessCheck for AlwaysAlive {
        async fn is_alive(&self, _peer: &PeerRecord) -> bool {
            true
        }
    }

    fn peer(raw: u16) -> PeerRecord {
        PeerRecord::new(Id::from_u16(raw), format!("127.0.0.1:{raw}"))
    }

    async fn table(local: u16, k: usize, peers: &[u16]) -> SyncRoutingTable {
        let rt = SyncRoutingTable::new(Id::from_u16(local), k);
        for raw in peers {
            rt.insert_node(peer(*raw), &AlwaysAlive).await;
        }
        rt
    }

    #[tokio::test]
    async fn placement_local_when_table_is_short() {
        let rt = table(9, 2, &[1]).await;

        assert_eq!(placement(&rt, &Id::from_u16(0)), Placement::Local);
    }

    #[tokio::test]
    async fn placement_local_when_among_k_closest() {
        // Key 0: 1 is closer than the local 2, 3 is farther.
        let rt = table(2, 2, &[1, 3]).await;

        assert_eq!(placement(&rt, &Id::from_u16(0)), Placement::Local);
    }

    #[tokio::test]
    async fn placement_redirects_when_k_peers_are_closer() {
        let rt = table(4, 2, &[1, 2]).await;

        match placement(&rt, &Id::from_u16(0)) {
            Placement::Redirect(nodes) => {
                let ids: Vec<_> = nodes.iter().map(|peer| peer.id).collect();
                assert_eq!(ids, [Id::from_u16(1), Id::from_u16(2)]);
            }
            Placement::Local => panic!("expected a redirect"),
        }
    }

    #[tokio::test]
    async fn store_value_is_idempotent() {
        let rt = table(2, 2, &[1, 3]).await;
        let storage = MemoryStorage::default();
        let record = Record::new("sig", 10, "payload");
        let key = Id::from_u16(0);

        assert_eq!(store_value(&rt, &storage, key, record.clone()), None);
        assert_eq!(store_value(&rt, &storage, key, record), None);
        assert_eq!(storage.get(&key, None).len(), 1);
    }

    #[tokio::test]
    async fn store_value_redirect_leaves_storage_untouched() {
        let rt = table(4, 2, &[1, 2]).await;
        let storage = MemoryStorage::default();
        let key = Id::from_u16(0);

        let first = store_value(&rt, &storage, key, Record::new("sig", 10, "payload"));
        let second = store_value(&rt, &storage, key, Record::new("sig", 10, "payload"));

        assert!(first.is_some());
        assert_eq!(first, second);
        assert!(storage.get(&key, None).is_empty());
    }

    #[tokio::test]
    async fn delete_value_outcomes() {
        let rt = table(2, 2, &[1, 3]).await;
        let storage = MemoryStorage::default();
        let record = Record::new("sig", 10, "payload");
        let key = Id::from_u16(0);
        let marker = DeletionMarker::for_record(&record);

        assert_eq!(
            delete_value(&rt, &storage, key, &marker),
            DeleteOutcome::Missing
        );

        store_value(&rt, &storage, key, record);
        assert_eq!(
            delete_value(&rt, &storage, key, &marker),
            DeleteOutcome::Deleted
        );

        let stored = storage.get(&key, Some(TimeWindow::new(0, 20)));
        assert_eq!(stored.len(), 1);
        assert!(stored[0].deleted);
    }

    #[test]
    fn report_completion() {
        let report = StoreReport {
            key: Id::from_u16(0),
            confirmed: vec![peer(1), peer(2)],
            replicas: vec![peer(1), peer(2), peer(3)],
        };

        let awaiting: Vec<_> = report.awaiting().iter().map(|peer| peer.id).collect();
        assert_eq!(awaiting, [Id::from_u16(3)]);
        assert!(report.is_complete(3));
        assert!(report.is_complete(2));

        let report = StoreReport {
            confirmed: vec![peer(1)],
            ..report
        };
        assert!(!report.is_complete(3));
    }
}
