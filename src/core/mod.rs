//! Foundational and often-reused types.

pub(crate) mod config;
pub(crate) mod error;
pub(crate) mod id;
pub mod message;
pub(crate) mod record;
pub(crate) mod routing_table;
pub(crate) mod traits;
