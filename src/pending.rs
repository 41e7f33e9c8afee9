//! Partially acknowledged operations and their retries.
//!
//! A store or delete that didn't reach enough replicas is recorded in a [`PendingQueue`] along
//! with the replicas still awaited. The [`Scheduler`] periodically re-runs these operations until
//! a strict majority of the replica set confirmed, or gives up after a bounded number of retries.

use std::{
    collections::{BTreeMap, HashMap},
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use bincode::{Decode, Encode};
use parking_lot::Mutex;
use rand::{thread_rng, Rng};
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    core::{
        error::Result,
        id::Id,
        record::{DeletionMarker, Record},
        routing_table::PeerRecord,
        traits::{Storage, Transport},
    },
    node::Node,
    store::StoreReport,
};

/// The operation to replicate.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum Operation {
    Store(Record),
    Delete(DeletionMarker),
}

impl Operation {
    pub fn key(&self, bucket_secs: u64) -> Result<Id> {
        match self {
            Operation::Store(record) => record.key(bucket_secs),
            Operation::Delete(marker) => marker.key(bucket_secs),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Operation::Store(_) => "store",
            Operation::Delete(_) => "delete",
        }
    }
}

/// An operation some replicas haven't confirmed yet.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct PendingOperation {
    pub id: u64,
    pub operation: Operation,
    pub key: Id,
    /// Replicas that haven't confirmed.
    pub awaiting: Vec<PeerRecord>,
    /// Replicas that have.
    pub confirmed: Vec<PeerRecord>,
    pub retries: u32,
    #[bincode(with_serde)]
    pub created_at: OffsetDateTime,
    #[bincode(with_serde)]
    pub updated_at: OffsetDateTime,
}

impl PendingOperation {
    fn new(operation: Operation, report: &StoreReport) -> Self {
        let now = OffsetDateTime::now_utc();

        Self {
            id: thread_rng().gen(),
            operation,
            key: report.key,
            awaiting: report.awaiting(),
            confirmed: report.confirmed.clone(),
            retries: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Folds the outcome of a retry in: new confirmations are kept, the awaited set is replaced
    /// by whatever the latest attempt still considers outstanding.
    fn merge(&mut self, report: &StoreReport) {
        let mut confirmed: HashMap<Id, PeerRecord> = self
            .confirmed
            .drain(..)
            .map(|peer| (peer.id, peer))
            .collect();
        for peer in &report.confirmed {
            confirmed.insert(peer.id, peer.clone());
        }

        self.awaiting = report
            .awaiting()
            .into_iter()
            .filter(|peer| !confirmed.contains_key(&peer.id))
            .collect();
        self.confirmed = confirmed.into_values().collect();
        self.confirmed.sort_by_key(|peer| peer.id);
        self.updated_at = OffsetDateTime::now_utc();
    }

    fn report(&self) -> StoreReport {
        let mut replicas = self.confirmed.clone();
        replicas.extend(self.awaiting.iter().cloned());

        StoreReport {
            key: self.key,
            confirmed: self.confirmed.clone(),
            replicas,
        }
    }
}

/// The operations awaiting confirmation, optionally persisted to a file.
#[derive(Debug, Default)]
pub struct PendingQueue {
    path: Option<PathBuf>,
    operations: BTreeMap<u64, PendingOperation>,
}

impl PendingQueue {
    /// A queue that lives in memory only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the queue persisted at the path, starting empty if the file doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let operations = match fs::read(&path) {
            Ok(bytes) => {
                let (operations, _): (Vec<PendingOperation>, _) =
                    bincode::decode_from_slice(&bytes, bincode::config::standard())?;
                operations.into_iter().map(|op| (op.id, op)).collect()
            }
            Err(e) if e.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        debug!(path = %path.display(), pending = operations.len(), "opened pending queue");

        Ok(Self {
            path: Some(path),
            operations,
        })
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn get(&self, id: u64) -> Option<&PendingOperation> {
        self.operations.get(&id)
    }

    pub fn operations(&self) -> impl Iterator<Item = &PendingOperation> {
        self.operations.values()
    }

    pub fn track(&mut self, operation: PendingOperation) {
        self.operations.insert(operation.id, operation);
    }

    pub fn remove(&mut self, id: u64) -> Option<PendingOperation> {
        self.operations.remove(&id)
    }

    /// Writes the queue to its file, a no-op for in-memory queues.
    pub fn persist(&self) -> Result<()> {
        let path = match &self.path {
            Some(path) => path,
            None => return Ok(()),
        };

        let operations: Vec<PendingOperation> = self.operations.values().cloned().collect();
        let bytes = bincode::encode_to_vec(operations, bincode::config::standard())?;
        fs::write(path, bytes)?;

        Ok(())
    }
}

/// Runs operations through a node and retries the ones that fall short.
pub struct Scheduler<T, S> {
    node: Node<T, S>,
    queue: Arc<Mutex<PendingQueue>>,
}

impl<T, S> Clone for Scheduler<T, S> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
            queue: self.queue.clone(),
        }
    }
}

impl<T: Transport, S: Storage> Scheduler<T, S> {
    pub fn new(node: Node<T, S>, queue: PendingQueue) -> Self {
        Self {
            node,
            queue: Arc::new(Mutex::new(queue)),
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Returns a copy of the pending operations.
    pub fn operations(&self) -> Vec<PendingOperation> {
        self.queue.lock().operations().cloned().collect()
    }

    /// Runs the operation once, queueing it for retries if it isn't complete.
    pub async fn submit(&self, operation: Operation) -> Result<StoreReport> {
        let report = self.run(&operation, Vec::new()).await?;

        if !report.is_complete(self.node.config.replication_target()) {
            let pending = PendingOperation::new(operation, &report);
            info!(
                key = %pending.key,
                kind = pending.operation.kind(),
                awaiting = pending.awaiting.len(),
                "operation queued for retry"
            );

            let mut queue = self.queue.lock();
            queue.track(pending);
            queue.persist()?;
        }

        Ok(report)
    }

    /// Retries every pending operation once, against the replicas it still awaits.
    pub async fn tick(&self) -> Result<()> {
        let operations = self.operations();
        if operations.is_empty() {
            return Ok(());
        }

        let target = self.node.config.replication_target();
        let max_retries = self.node.config.max_retries;

        for mut pending in operations {
            let report = match self.run(&pending.operation, pending.awaiting.clone()).await {
                Ok(report) => report,
                Err(e) => {
                    warn!(key = %pending.key, error = %e, "dropping operation");
                    self.queue.lock().remove(pending.id);
                    continue;
                }
            };
            pending.merge(&report);
            pending.retries += 1;

            let mut queue = self.queue.lock();
            if pending.report().is_complete(target) {
                debug!(key = %pending.key, retries = pending.retries, "operation confirmed");
                queue.remove(pending.id);
            } else if pending.retries >= max_retries {
                warn!(
                    key = %pending.key,
                    kind = pending.operation.kind(),
                    confirmed = pending.confirmed.len(),
                    awaiting = pending.awaiting.len(),
                    "giving up on operation"
                );
                queue.remove(pending.id);
            } else {
                queue.track(pending);
            }
        }

        self.queue.lock().persist()
    }

    /// Spawns a task retrying pending operations every `retry_interval`.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.node.config.retry_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                interval.tick().await;

                if let Err(e) = self.tick().await {
                    warn!(error = %e, "couldn't persist the pending queue");
                }
            }
        })
    }

    // Without replicas to target, the operation starts over from the routing table.
    async fn run(&self, operation: &Operation, replicas: Vec<PeerRecord>) -> Result<StoreReport> {
        match (operation, replicas.is_empty()) {
            (Operation::Store(record), true) => self.node.store(record.clone()).await,
            (Operation::Store(record), false) => {
                self.node.store_from(record.clone(), replicas).await
            }
            (Operation::Delete(marker), true) => self.node.delete(marker.clone()).await,
            (Operation::Delete(marker), false) => {
                self.node.delete_from(marker.clone(), replicas).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(raw: u16) -> PeerRecord {
        PeerRecord::new(Id::from_u16(raw), format!("127.0.0.1:{raw}"))
    }

    fn report(confirmed: &[u16], replicas: &[u16]) -> StoreReport {
        StoreReport {
            key: Id::from_u16(0),
            confirmed: confirmed.iter().map(|raw| peer(*raw)).collect(),
            replicas: replicas.iter().map(|raw| peer(*raw)).collect(),
        }
    }

    fn operation() -> Operation {
        Operation::Store(Record::new("sig", 10, "payload"))
    }

    #[test]
    fn merge_accumulates_confirmations() {
        let mut pending = PendingOperation::new(operation(), &report(&[1], &[1, 2, 3]));
        assert_eq!(pending.awaiting.len(), 2);

        pending.merge(&report(&[2], &[1, 2, 3]));

        let confirmed: Vec<_> = pending.confirmed.iter().map(|peer| peer.id).collect();
        assert_eq!(confirmed, [Id::from_u16(1), Id::from_u16(2)]);
        assert_eq!(pending.awaiting.len(), 1);
        assert_eq!(pending.awaiting[0].id, Id::from_u16(3));
        assert!(pending.report().is_complete(3));
    }

    #[test]
    fn queue_persists_and_reopens() {
        let path = std::env::temp_dir().join(format!("kadstore-pending-{}", Id::rand()));

        let mut queue = PendingQueue::open(&path).unwrap();
        assert!(queue.is_empty());

        let pending = PendingOperation::new(operation(), &report(&[1], &[1, 2, 3]));
        let id = pending.id;
        queue.track(pending.clone());
        queue.persist().unwrap();

        let reopened = PendingQueue::open(&path).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.get(id), Some(&pending));

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn in_memory_queue_doesnt_touch_disk() {
        let mut queue = PendingQueue::new();
        queue.track(PendingOperation::new(operation(), &report(&[], &[1])));

        assert!(queue.persist().is_ok());
        assert_eq!(queue.len(), 1);
    }
}
