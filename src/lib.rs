//! A peer-to-peer store for time-keyed, signed records built on a
//! [Kademlia](https://pdos.csail.mit.edu/~petar/papers/maymounkov-kademlia-lncs.pdf) DHT.
//!
//! Records are keyed by the time bucket of their timestamp and kept by the nodes whose
//! identifiers are closest to that key by XOR distance. A [`Node`] ties together:
//!
//! 1. a k-bucket [`RoutingTable`], shared behind a lock as a [`SyncRoutingTable`],
//! 2. the iterative lookup engine (FIND_NODE and FIND_VALUE, see [`lookup`]),
//! 3. the store/replicate protocol, where each node decides locally whether to keep a record or
//!    redirect the writer to closer peers (see [`store`]),
//! 4. the bootstrap procedure populating a fresh routing table through seed peers.
//!
//! The network is abstracted behind the [`Transport`] capability and record payloads behind
//! [`Storage`]. An in-process implementation of both lives in [`memory`], a TCP transport in
//! `tcp` (feature `codec`, enabled by default).
//!
//! Partially acknowledged stores and deletes can be handed to a [`pending::Scheduler`], which
//! persists them and retries until a strict majority of their replicas confirmed.

#![cfg_attr(doc_cfg, feature(doc_cfg))]

#[cfg(feature = "codec")]
#[cfg_attr(doc_cfg, doc(cfg(feature = "codec")))]
pub mod codec;
#[cfg(feature = "codec")]
#[cfg_attr(doc_cfg, doc(cfg(feature = "codec")))]
pub mod tcp;

pub mod bootstrap;
pub mod lookup;
pub mod memory;
pub mod node;
pub mod pending;
pub mod router;
pub mod store;

mod core;

pub use crate::{
    core::{
        config::{is_majority, Config},
        error::{Error, Result},
        id::{Distance, Id},
        message,
        record::{record_key, DeletionMarker, Record, StoredRecord, TimeWindow},
        routing_table::{Addr, InsertOutcome, PeerRecord, RoutingTable, Snapshot},
        traits::{Handler, LivenessCheck, Storage, Transport},
    },
    node::Node,
    router::SyncRoutingTable,
};
