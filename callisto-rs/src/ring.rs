//! Provides the consistent-hash ring which assigns keys to peers.
//!
//! Each peer is represented by a configurable number of virtual nodes to smooth out the key
//! distribution even for small fleets. The ring is rebuilt from scratch whenever the peer set
//! changes - peer removal is deliberately not supported as an in-place operation.
//!
//! The hash function maps byte strings to `u32` ring positions and defaults to CRC-32/IEEE,
//! which keeps the placement of keys stable across nodes and restarts.
use std::collections::HashMap;

/// Maps keys to peers via consistent hashing over virtual nodes.
///
/// # Examples
/// ```
/// # use callisto::ring::HashRing;
/// let mut ring = HashRing::new(50);
/// ring.add(&["http://cache-1:8001", "http://cache-2:8001"]);
///
/// // Every key deterministically belongs to one of the peers...
/// let owner = ring.get("Tom").unwrap();
/// assert_eq!(ring.get("Tom").unwrap(), owner);
/// ```
pub struct HashRing {
    hash: Box<dyn Fn(&[u8]) -> u32 + Send + Sync>,
    replicas: usize,
    points: Vec<u32>,
    owners: HashMap<u32, String>,
}

impl HashRing {
    /// Creates a ring which places **replicas** virtual nodes per peer, hashing with
    /// CRC-32/IEEE.
    ///
    /// Note that a replica count of zero admits no virtual nodes at all - such a ring stays
    /// empty and [get](HashRing::get) always answers `None`.
    pub fn new(replicas: usize) -> Self {
        HashRing::with_hash(replicas, |data| crc32fast::hash(data))
    }

    /// Creates a ring with a custom hash function.
    pub fn with_hash(replicas: usize, hash: impl Fn(&[u8]) -> u32 + Send + Sync + 'static) -> Self {
        HashRing {
            hash: Box::new(hash),
            replicas,
            points: Vec::new(),
            owners: HashMap::new(),
        }
    }

    /// Adds the given peers to the ring.
    ///
    /// For each peer, one virtual node is placed per replica by hashing the replica index
    /// (in decimal) concatenated with the peer identifier. Two virtual nodes hashing to the
    /// same position overwrite each other - the last writer wins, which is acceptable as
    /// lookup never assumes distinct positions.
    pub fn add<S: AsRef<str>>(&mut self, peers: &[S]) {
        for peer in peers {
            let peer = peer.as_ref();
            for index in 0..self.replicas {
                let point = (self.hash)(format!("{}{}", index, peer).as_bytes());
                self.points.push(point);
                let _ = self.owners.insert(point, peer.to_owned());
            }
        }

        self.points.sort_unstable();
    }

    /// Returns the peer owning the given key, or `None` for an empty ring.
    ///
    /// The owner is the peer of the first virtual node at or after the key's hash, wrapping
    /// around to the smallest position at the end of the ring.
    pub fn get(&self, key: &str) -> Option<&str> {
        if self.points.is_empty() {
            return None;
        }

        let hash = (self.hash)(key.as_bytes());
        let index = self.points.partition_point(|&point| point < hash);
        let point = self.points[index % self.points.len()];

        self.owners.get(&point).map(String::as_str)
    }

    /// Determines if no virtual nodes have been placed yet.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}
