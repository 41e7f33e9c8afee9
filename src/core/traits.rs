//! The capabilities a node is built from.

use async_trait::async_trait;
use rand::{thread_rng, Rng};

use crate::core::{
    error::{Error, Result},
    id::Id,
    message::{Message, Ping, Route},
    record::{DeletionMarker, Record, StoredRecord, TimeWindow},
    routing_table::{Addr, PeerRecord},
};

/// The transport capability: "send a request, await the response", addressed by logical peer
/// address.
///
/// Kadstore never opens connections itself, it is handed a `Transport` at construction time.
/// Implementations exist for TCP ([`TcpTransport`](crate::tcp::TcpTransport), behind the `codec`
/// feature) and for in-process networks ([`MemoryTransport`](crate::memory::MemoryTransport)).
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends the request to the peer at `addr` and returns its response.
    async fn request(&self, addr: &Addr, message: Message) -> Result<Message>;

    /// Sends a PING and returns the identifier in the PONG; the provided implementation goes
    /// through [`Transport::request`].
    async fn ping(&self, addr: &Addr, sender: PeerRecord) -> Result<Id> {
        let nonce = thread_rng().gen();
        match self.request(addr, Message::Ping(Ping { nonce, sender })).await? {
            Message::Pong(pong) if pong.nonce == nonce => Ok(pong.id),
            other => Err(Error::UnexpectedResponse {
                expected: Route::Ping,
                got: other.variant_as_str(),
            }),
        }
    }
}

/// The liveness probe consulted when a bucket is full.
#[async_trait]
pub trait LivenessCheck: Send + Sync {
    /// Returns whether the peer answered.
    async fn is_alive(&self, peer: &PeerRecord) -> bool;
}

/// The local backing store for record payloads.
///
/// Storing is idempotent: records are identified by their signature, so storing the same record
/// twice leaves a single copy.
pub trait Storage: Send + Sync + 'static {
    /// Persists the record under the key, returns `false` if it was already present.
    fn put(&self, key: Id, record: Record) -> bool;

    /// Returns the records under the key, deleted ones included (flagged), optionally filtered
    /// by timestamp.
    fn get(&self, key: &Id, window: Option<TimeWindow>) -> Vec<StoredRecord>;

    /// Flags the record the marker refers to as deleted, returns `false` if it isn't held here.
    fn mark_deleted(&self, key: &Id, marker: &DeletionMarker) -> bool;
}

/// Serves inbound requests, implemented by [`Node`](crate::Node).
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Processes a request, returning the response to send back, if any.
    async fn handle(&self, message: Message) -> Option<Message>;
}
