//! Error conditions surfaced by the cache.
//!
//! The variants mirror the places where a read can go wrong: the caller (empty key), the
//! registry (unknown group on the serving side), the backing source, the peer transport and
//! the wire protocol. Loader and peer failures carry their message as plain text - the cache
//! treats the backing source as opaque and never inspects its errors.
//!
//! All variants are `Clone` so that a single failed load can be handed to every waiter
//! attached to the same coalesced flight.
use thiserror::Error;

/// Enumerates the error conditions of a cache read.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The caller passed an empty key.
    #[error("key is required")]
    KeyRequired,

    /// A peer asked for a group which is not registered on this node.
    #[error("no such group: {0}")]
    UnknownGroup(String),

    /// The backing source failed to produce a value.
    ///
    /// The message is the loader's own error text, passed through verbatim.
    #[error("{0}")]
    Loader(String),

    /// Fetching a value from a remote peer failed - network trouble, a non-success status
    /// or an unreadable response body.
    #[error("peer request failed: {0}")]
    PeerTransport(String),

    /// A peer sent a request which does not match the `<base-path>/<group>/<key>` scheme.
    #[error("bad request: {0}")]
    BadRequest(String),
}
