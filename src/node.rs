//! The node: a routing table, a transport and a storage backend tied together.

use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use rand::{thread_rng, Rng};
use tracing::{debug, trace, warn};

use crate::{
    core::{
        config::Config,
        error::{Error, Result},
        id::Id,
        message::{
            Delete, Deleted, ErrorEnvelope, FindNode, FindValue, Found, Message, Nodes, Nonce,
            Ping, Pong, Redirect, Store, Stored,
        },
        routing_table::{Addr, PeerRecord, RoutingTable},
        traits::{Handler, LivenessCheck, Storage, Transport},
    },
    router::SyncRoutingTable,
    store::{delete_value, store_value, DeleteOutcome},
};

/// Generates a fresh request nonce.
pub(crate) fn nonce() -> Nonce {
    thread_rng().gen()
}

/// A DHT node.
///
/// Cloning is cheap, clones share the routing table, transport and storage.
pub struct Node<T, S> {
    pub(crate) id: Id,
    pub(crate) addr: Addr,
    pub(crate) config: Arc<Config>,
    pub(crate) routing_table: SyncRoutingTable,
    pub(crate) transport: Arc<T>,
    pub(crate) storage: Arc<S>,
}

impl<T, S> Clone for Node<T, S> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            addr: self.addr.clone(),
            config: self.config.clone(),
            routing_table: self.routing_table.clone(),
            transport: self.transport.clone(),
            storage: self.storage.clone(),
        }
    }
}

impl<T: Transport, S: Storage> Node<T, S> {
    /// Creates a node whose identifier is derived from its address.
    pub fn new(config: Config, addr: impl Into<Addr>, transport: T, storage: S) -> Self {
        let addr = addr.into();
        let id = Id::generate(addr.as_str());

        Self::with_id(config, id, addr, transport, storage)
    }

    /// Creates a node with an explicit identifier.
    pub fn with_id(
        config: Config,
        id: Id,
        addr: impl Into<Addr>,
        transport: T,
        storage: S,
    ) -> Self {
        Self {
            id,
            addr: addr.into(),
            routing_table: SyncRoutingTable::new(id, config.k),
            config: Arc::new(config),
            transport: Arc::new(transport),
            storage: Arc::new(storage),
        }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn addr(&self) -> &Addr {
        &self.addr
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn routing_table(&self) -> &SyncRoutingTable {
        &self.routing_table
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// This node as other peers see it.
    pub fn contact(&self) -> PeerRecord {
        PeerRecord::new(self.id, self.addr.clone())
    }

    /// Inserts the peers into the routing table, probing full buckets.
    pub(crate) async fn observe(&self, peers: Vec<PeerRecord>) {
        for peer in peers {
            if peer.id != self.id {
                self.routing_table.insert_node(peer, self).await;
            }
        }
    }

    /// Writes the routing table to a file.
    pub fn save_snapshot(&self, path: impl AsRef<Path>) -> Result<()> {
        self.routing_table.save_snapshot(path)
    }

    /// Restores the routing table from a file. On error the current table is left untouched.
    pub fn load_snapshot(&self, path: impl AsRef<Path>) -> Result<()> {
        let routing_table = RoutingTable::load_snapshot(path)?;

        if routing_table.local_id() != self.id {
            return Err(Error::Snapshot(format!(
                "snapshot belongs to {}, not {}",
                routing_table.local_id(),
                self.id
            )));
        }

        debug!(peers = routing_table.len(), "restored routing table");
        self.routing_table.restore(routing_table);

        Ok(())
    }

    // MESSAGE PROCESSING

    /// Processes a peer's message. If it is a request, the response to send back is returned.
    pub async fn process_message(&self, message: Message) -> Option<Message> {
        if let Some(sender) = message.sender() {
            if sender.id != self.id {
                self.routing_table.insert_node(sender.clone(), self).await;
            }
        }

        trace!(message = message.variant_as_str(), nonce = message.nonce(), "processing");

        let response = match message {
            Message::Ping(ping) => Message::Pong(self.process_ping(ping)),
            Message::FindNode(find_node) => Message::Nodes(self.process_find_node(find_node)),
            Message::FindValue(find_value) => self.process_find_value(find_value),
            Message::Store(store) => self.process_store(store),
            Message::Delete(delete) => self.process_delete(delete),
            response => {
                debug!(
                    message = response.variant_as_str(),
                    "dropping unsolicited response"
                );
                return None;
            }
        };

        Some(response)
    }

    fn process_ping(&self, ping: Ping) -> Pong {
        // Send back the same nonce so the original sender can identify the request the response
        // corresponds to.
        Pong {
            nonce: ping.nonce,
            id: self.id,
        }
    }

    fn process_find_node(&self, find_node: FindNode) -> Nodes {
        Nodes {
            nonce: find_node.nonce,
            nodes: self.routing_table.find_closest(&find_node.id, self.config.k),
        }
    }

    fn process_find_value(&self, find_value: FindValue) -> Message {
        let values = self.storage.get(&find_value.key, find_value.window);

        if values.is_empty() {
            Message::Redirect(Redirect {
                nonce: find_value.nonce,
                nodes: self
                    .routing_table
                    .find_closest(&find_value.key, self.config.k),
            })
        } else {
            Message::Found(Found {
                nonce: find_value.nonce,
                values,
            })
        }
    }

    fn process_store(&self, store: Store) -> Message {
        let derived = store.record.key(self.config.time_bucket);
        if let Some(reason) = key_mismatch(derived, store.key) {
            return Message::Error(ErrorEnvelope {
                nonce: store.nonce,
                reason,
            });
        }

        match store_value(
            &self.routing_table,
            self.storage.as_ref(),
            store.key,
            store.record,
        ) {
            None => Message::Stored(Stored { nonce: store.nonce }),
            Some(nodes) => Message::Redirect(Redirect {
                nonce: store.nonce,
                nodes,
            }),
        }
    }

    fn process_delete(&self, delete: Delete) -> Message {
        let derived = delete.marker.key(self.config.time_bucket);
        if let Some(reason) = key_mismatch(derived, delete.key) {
            return Message::Error(ErrorEnvelope {
                nonce: delete.nonce,
                reason,
            });
        }

        match delete_value(
            &self.routing_table,
            self.storage.as_ref(),
            delete.key,
            &delete.marker,
        ) {
            DeleteOutcome::Deleted => Message::Deleted(Deleted {
                nonce: delete.nonce,
            }),
            DeleteOutcome::Missing => Message::Error(ErrorEnvelope {
                nonce: delete.nonce,
                reason: "record not found".into(),
            }),
            DeleteOutcome::Redirect(nodes) => Message::Redirect(Redirect {
                nonce: delete.nonce,
                nodes,
            }),
        }
    }
}

// Checks the key a request names against the one derived from its timestamp.
fn key_mismatch(derived: Result<Id>, key: Id) -> Option<String> {
    match derived {
        Ok(derived) if derived == key => None,
        Ok(_) => Some("key doesn't match the timestamp".into()),
        Err(e) => Some(e.to_string()),
    }
}

#[async_trait]
impl<T: Transport, S: Storage> LivenessCheck for Node<T, S> {
    async fn is_alive(&self, peer: &PeerRecord) -> bool {
        let ping = self.transport.ping(&peer.addr, self.contact());

        match tokio::time::timeout(self.config.request_timeout, ping).await {
            Ok(Ok(id)) if id == peer.id => true,
            Ok(Ok(id)) => {
                warn!(addr = %peer.addr, expected = %peer.id, got = %id, "peer changed identity");
                false
            }
            Ok(Err(e)) => {
                trace!(addr = %peer.addr, error = %e, "liveness probe failed");
                false
            }
            Err(_) => {
                trace!(addr = %peer.addr, "liveness probe timed out");
                false
            }
        }
    }
}

#[async_trait]
impl<T: Transport, S: Storage> Handler for Node<T, S> {
    async fn handle(&self, message: Message) -> Option<Message> {
        self.process_message(message).await
    }
}
