//! Defines the contracts between a group and the peer fleet.
//!
//! A group never talks to the network itself. It asks a [PeerPicker] whether somebody else
//! owns a key and, if so, fetches the value through the returned [PeerFetcher]. The concrete
//! implementation of both contracts lives in [crate::http].
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::CacheError;

/// Locates the owner of a key within the peer fleet.
pub trait PeerPicker: Send + Sync {
    /// Returns a fetcher for the remote peer owning the given key.
    ///
    /// Answers `None` when the local node is the owner or when no peers are configured - in
    /// both cases the caller is expected to load the value itself.
    fn pick(&self, key: &str) -> Option<Arc<dyn PeerFetcher>>;
}

/// Fetches a single value from one specific remote peer.
#[async_trait]
pub trait PeerFetcher: Send + Sync {
    /// Retrieves the raw bytes stored for the given key in the given group.
    ///
    /// Fails with [CacheError::PeerTransport] for network trouble, a non-success status or an
    /// unreadable response.
    async fn fetch(&self, group: &str, key: &str) -> Result<Vec<u8>, CacheError>;
}
