//! Protocol message types.

use std::fmt;

use bincode::{Decode, Encode};

use crate::core::{
    id::Id,
    record::{DeletionMarker, Record, StoredRecord, TimeWindow},
    routing_table::PeerRecord,
};

pub type Nonce = u128;

/// The request routes served by a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub enum Route {
    Ping,
    FindNode,
    FindValue,
    Store,
    Delete,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Route::Ping => "ping",
            Route::FindNode => "find_node",
            Route::FindValue => "find_value",
            Route::Store => "store",
            Route::Delete => "delete",
        };

        f.write_str(s)
    }
}

/// Message variants, requests and their responses.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum Message {
    /// PING messages require a PONG response, used as the liveness probe.
    Ping(Ping),
    /// PONG is the correct response to PING, it must contain the same NONCE.
    Pong(Pong),

    /// FIND_NODE messages query a peer for its K closest nodes to an identifier.
    FindNode(FindNode),
    /// NODES is the correct response to FIND_NODE, closest first.
    Nodes(Nodes),

    /// FIND_VALUE messages query a peer for the records stored under a key.
    FindValue(FindValue),
    /// FOUND answers FIND_VALUE when the peer holds records for the key.
    Found(Found),

    /// STORE asks a peer to persist a record.
    Store(Store),
    /// STORED confirms the record was persisted.
    Stored(Stored),

    /// DELETE asks a peer to soft-delete a record.
    Delete(Delete),
    /// DELETED confirms the deletion marker was applied.
    Deleted(Deleted),

    /// REDIRECT answers FIND_VALUE, STORE and DELETE with peers closer to the key.
    Redirect(Redirect),
    /// ERROR is the envelope for requests the peer was responsible for but couldn't serve.
    Error(ErrorEnvelope),
}

impl Message {
    pub fn variant_as_str(&self) -> &'static str {
        match self {
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::FindNode(_) => "find_node",
            Message::Nodes(_) => "nodes",
            Message::FindValue(_) => "find_value",
            Message::Found(_) => "found",
            Message::Store(_) => "store",
            Message::Stored(_) => "stored",
            Message::Delete(_) => "delete",
            Message::Deleted(_) => "deleted",
            Message::Redirect(_) => "redirect",
            Message::Error(_) => "error",
        }
    }

    pub fn nonce(&self) -> Nonce {
        match self {
            Message::Ping(ping) => ping.nonce,
            Message::Pong(pong) => pong.nonce,
            Message::FindNode(find_node) => find_node.nonce,
            Message::Nodes(nodes) => nodes.nonce,
            Message::FindValue(find_value) => find_value.nonce,
            Message::Found(found) => found.nonce,
            Message::Store(store) => store.nonce,
            Message::Stored(stored) => stored.nonce,
            Message::Delete(delete) => delete.nonce,
            Message::Deleted(deleted) => deleted.nonce,
            Message::Redirect(redirect) => redirect.nonce,
            Message::Error(error) => error.nonce,
        }
    }

    pub fn is_response(&self) -> bool {
        self.route().is_none()
    }

    /// Returns the route of a request, `None` for responses.
    pub fn route(&self) -> Option<Route> {
        match self {
            Message::Ping(_) => Some(Route::Ping),
            Message::FindNode(_) => Some(Route::FindNode),
            Message::FindValue(_) => Some(Route::FindValue),
            Message::Store(_) => Some(Route::Store),
            Message::Delete(_) => Some(Route::Delete),
            _ => None,
        }
    }

    /// Returns the sender of a request, `None` for responses.
    pub fn sender(&self) -> Option<&PeerRecord> {
        match self {
            Message::Ping(ping) => Some(&ping.sender),
            Message::FindNode(find_node) => Some(&find_node.sender),
            Message::FindValue(find_value) => Some(&find_value.sender),
            Message::Store(store) => Some(&store.sender),
            Message::Delete(delete) => Some(&delete.sender),
            _ => None,
        }
    }
}

/// The data making up a PING message.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Ping {
    pub nonce: Nonce,
    pub sender: PeerRecord,
}

/// The data making up a PONG message.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Pong {
    pub nonce: Nonce,
    pub id: Id,
}

/// The data making up a FIND_NODE message.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct FindNode {
    pub nonce: Nonce,
    pub sender: PeerRecord,
    pub id: Id,
}

/// The data making up a NODES message.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Nodes {
    pub nonce: Nonce,
    pub nodes: Vec<PeerRecord>,
}

/// The data making up a FIND_VALUE message.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct FindValue {
    pub nonce: Nonce,
    pub sender: PeerRecord,
    pub key: Id,
    /// Only return records whose timestamp falls in the window.
    pub window: Option<TimeWindow>,
}

/// The data making up a FOUND message.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Found {
    pub nonce: Nonce,
    pub values: Vec<StoredRecord>,
}

/// The data making up a STORE message.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Store {
    pub nonce: Nonce,
    pub sender: PeerRecord,
    pub key: Id,
    pub record: Record,
}

/// The data making up a STORED message.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Stored {
    pub nonce: Nonce,
}

/// The data making up a DELETE message.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Delete {
    pub nonce: Nonce,
    pub sender: PeerRecord,
    pub key: Id,
    pub marker: DeletionMarker,
}

/// The data making up a DELETED message.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Deleted {
    pub nonce: Nonce,
}

/// The data making up a REDIRECT message.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Redirect {
    pub nonce: Nonce,
    pub nodes: Vec<PeerRecord>,
}

/// The data making up an ERROR message.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct ErrorEnvelope {
    pub nonce: Nonce,
    pub reason: String,
}
