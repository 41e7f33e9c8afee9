//! An in-process network and storage backend.
//!
//! Nodes register their handler under a logical address and requests are delivered by calling
//! the handler directly. Addresses can be taken down or slowed down to simulate failures.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::core::{
    error::{Error, Result},
    id::Id,
    message::{Message, Route},
    record::{DeletionMarker, Record, StoredRecord, TimeWindow},
    routing_table::Addr,
    traits::{Handler, Storage, Transport},
};

#[derive(Default)]
struct Inner {
    handlers: RwLock<HashMap<Addr, Arc<dyn Handler>>>,
    down: RwLock<HashSet<Addr>>,
    delays: RwLock<HashMap<Addr, Duration>>,
    requests: Mutex<Vec<(Addr, Route)>>,
}

/// A shared in-process network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Inner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the handler reachable at the address, replacing any previous registration.
    pub fn register(&self, addr: impl Into<Addr>, handler: Arc<dyn Handler>) {
        self.inner.handlers.write().insert(addr.into(), handler);
    }

    pub fn unregister(&self, addr: &Addr) {
        self.inner.handlers.write().remove(addr);
    }

    /// Requests to a downed address fail as unreachable.
    pub fn set_down(&self, addr: &Addr, down: bool) {
        if down {
            self.inner.down.write().insert(addr.clone());
        } else {
            self.inner.down.write().remove(addr);
        }
    }

    /// Delays every request to the address before it is delivered.
    pub fn set_delay(&self, addr: &Addr, delay: Duration) {
        self.inner.delays.write().insert(addr.clone(), delay);
    }

    /// The requests delivered so far, in order.
    ///
    /// The log keeps every request for the lifetime of the network, call
    /// [`MemoryNetwork::clear_requests`] to reset it.
    pub fn requests(&self) -> Vec<(Addr, Route)> {
        self.inner.requests.lock().clone()
    }

    pub fn clear_requests(&self) {
        self.inner.requests.lock().clear();
    }

    /// The number of requests of the given route delivered to the address.
    pub fn request_count(&self, addr: &Addr, route: Route) -> usize {
        self.inner
            .requests
            .lock()
            .iter()
            .filter(|(a, r)| a == addr && *r == route)
            .count()
    }

    /// Returns a transport sending over this network.
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
        }
    }
}

/// The [`Transport`] of a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn request(&self, addr: &Addr, message: Message) -> Result<Message> {
        let inner = &self.network.inner;

        if inner.down.read().contains(addr) {
            return Err(Error::Unreachable(addr.to_string()));
        }

        // Release the locks before awaiting.
        let handler = inner.handlers.read().get(addr).cloned();
        let handler = handler.ok_or_else(|| Error::Unreachable(addr.to_string()))?;
        let delay = inner.delays.read().get(addr).copied();

        if let Some(route) = message.route() {
            inner.requests.lock().push((addr.clone(), route));
        }

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        trace!(%addr, message = message.variant_as_str(), "delivering");

        handler
            .handle(message)
            .await
            .ok_or_else(|| Error::Remote(format!("{addr} sent no response")))
    }
}

/// A [`Storage`] backend keeping records in a map.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    records: RwLock<HashMap<Id, Vec<StoredRecord>>>,
}

impl MemoryStorage {
    /// The number of records held, deleted ones included.
    pub fn len(&self) -> usize {
        self.records.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Storage for MemoryStorage {
    fn put(&self, key: Id, record: Record) -> bool {
        let mut records = self.records.write();
        let values = records.entry(key).or_default();

        if values
            .iter()
            .any(|stored| stored.record.signature == record.signature)
        {
            return false;
        }

        values.push(StoredRecord {
            record,
            deleted: false,
        });

        true
    }

    fn get(&self, key: &Id, window: Option<TimeWindow>) -> Vec<StoredRecord> {
        self.records
            .read()
            .get(key)
            .map(|values| {
                values
                    .iter()
                    .filter(|stored| window.map_or(true, |w| w.contains(stored.record.timestamp)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn mark_deleted(&self, key: &Id, marker: &DeletionMarker) -> bool {
        let mut records = self.records.write();

        match records.get_mut(key).and_then(|values| {
            values
                .iter_mut()
                .find(|stored| stored.record.signature == marker.signature)
        }) {
            Some(stored) => {
                stored.deleted = true;
                true
            }
            None => false,
        }
    }
}
