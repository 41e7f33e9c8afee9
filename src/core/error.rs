//! Error types.

use std::io;

use crate::core::message::Route;

/// The errors surfaced by this crate.
///
/// Network failures (`Timeout`, `Unreachable`, `Io`, `UnexpectedResponse`, `Decode`) are
/// transient from the point of view of the lookup and store drivers: they are logged and the peer
/// contributes nothing to the round. Local failures (`InvalidId`, `InvalidTimestamp`, snapshot
/// `Decode`) are returned to the immediate caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("request to {0} timed out")]
    Timeout(String),
    #[error("peer {0} is unreachable")]
    Unreachable(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("encoding failed: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("decoding failed: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("expected a response to {expected}, got {got}")]
    UnexpectedResponse { expected: Route, got: &'static str },
    #[error("response nonce doesn't match the request")]
    NonceMismatch,
    #[error("invalid identifier: {0:?}")]
    InvalidId(String),
    #[error("timestamp {0} has no representable time bucket")]
    InvalidTimestamp(i64),
    #[error("remote error: {0}")]
    Remote(String),
    #[error("malformed snapshot: {0}")]
    Snapshot(String),
}

impl Error {
    /// Returns `true` for failures that only mean "no contribution this round".
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::Unreachable(_)
                | Error::Io(_)
                | Error::UnexpectedResponse { .. }
                | Error::NonceMismatch
                | Error::Decode(_)
                | Error::Remote(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
