//! Provides the cache namespaces and the read-through logic tying everything together.
//!
//! A [Group] is a named cache with its own capacity and its own backing [Loader]. Reading a
//! key consults the local cache first, then coalesces all concurrent misses per key and -
//! inside the coalesced call - either fetches the value from the remote owner or invokes the
//! loader.
//!
//! Groups are registered in a process wide registry so that the serving side of the peer pool
//! can resolve a group name received over the wire via [Group::lookup].
//!
//! # Example
//! ```
//! # use callisto::group::{Group, LoaderFn};
//! # #[tokio::main]
//! # async fn main() {
//! let group = Group::new(
//!     "scores",
//!     2048,
//!     LoaderFn(|key: String| async move {
//!         match key.as_str() {
//!             "Tom" => Ok(b"630".to_vec()),
//!             _ => Err(anyhow::anyhow!("{} not exist", key)),
//!         }
//!     }),
//! );
//!
//! assert_eq!(group.get("Tom").await.unwrap().to_string_lossy(), "630");
//! assert!(group.get("Nobody").await.is_err());
//! # }
//! ```
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use arc_swap::ArcSwap;
use async_trait::async_trait;

use crate::cache::ValueCache;
use crate::error::CacheError;
use crate::flight::SingleFlight;
use crate::peers::PeerPicker;
use crate::view::ByteView;

lazy_static::lazy_static! {
    /// The process wide registry of all groups, shared with the serving side of the peer
    /// pool. Lookups vastly outnumber registrations, hence the reader/writer lock.
    static ref GROUPS: RwLock<HashMap<String, Arc<Group>>> = RwLock::new(HashMap::new());
}

/// Loads a value from the backing source on a cache miss.
///
/// Implementations are supplied by the application - a database query, a file read, a
/// computation. The cache never interprets the returned bytes nor the error.
#[async_trait]
pub trait Loader: Send + Sync {
    /// Produces the value for the given key.
    async fn load(&self, key: &str) -> anyhow::Result<Vec<u8>>;
}

/// Adapts a closure into a [Loader].
///
/// # Example
/// ```
/// # use callisto::group::{Loader, LoaderFn};
/// let loader = LoaderFn(|key: String| async move { Ok::<_, anyhow::Error>(key.into_bytes()) });
/// ```
pub struct LoaderFn<F>(pub F);

#[async_trait]
impl<F, Fut> Loader for LoaderFn<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Vec<u8>>> + Send,
{
    async fn load(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        (self.0)(key.to_owned()).await
    }
}

/// A named cache namespace with a capacity, a backing loader and optional peer routing.
pub struct Group {
    name: String,
    loader: Arc<dyn Loader>,
    cache: ValueCache,
    peers: ArcSwap<Option<Arc<dyn PeerPicker>>>,
    flight: SingleFlight<Result<ByteView, CacheError>>,
}

impl Group {
    /// Creates a group and registers it in the process wide registry.
    ///
    /// **cache_bytes** caps the memory of the local cache (zero meaning unbounded). Creating
    /// a group under an already registered name replaces the previous registration.
    pub fn new(name: &str, cache_bytes: usize, loader: impl Loader + 'static) -> Arc<Group> {
        let group = Arc::new(Group {
            name: name.to_owned(),
            loader: Arc::new(loader),
            cache: ValueCache::new(cache_bytes),
            peers: ArcSwap::new(Arc::new(None)),
            flight: SingleFlight::new(),
        });

        let _ = GROUPS
            .write()
            .unwrap()
            .insert(name.to_owned(), group.clone());

        group
    }

    /// Returns the group registered under the given name.
    pub fn lookup(name: &str) -> Option<Arc<Group>> {
        GROUPS.read().unwrap().get(name).cloned()
    }

    /// Returns the name of this group.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attaches the peer picker which routes keys to their remote owners.
    ///
    /// # Panics
    /// Panics if a picker has already been attached - registering peers twice is a wiring
    /// error which must not be papered over.
    pub fn register_peers(&self, picker: Arc<dyn PeerPicker>) {
        let previous = self.peers.swap(Arc::new(Some(picker)));
        if previous.is_some() {
            panic!("register_peers called more than once for group '{}'", self.name);
        }
    }

    /// Returns the value for the given key.
    ///
    /// Answers from the local cache whenever possible. On a miss, all concurrent callers for
    /// the same key share a single load: the value is fetched from the remote owner if one is
    /// configured and reachable, otherwise the backing loader runs and its result is cached
    /// locally.
    pub async fn get(&self, key: &str) -> Result<ByteView, CacheError> {
        if key.is_empty() {
            return Err(CacheError::KeyRequired);
        }

        if let Some(view) = self.cache.get(key) {
            log::debug!("[{}] cache hit for '{}'", self.name, key);
            return Ok(view);
        }

        self.load(key).await
    }

    /// Returns the number of entries in the local cache.
    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }

    /// Performs the coalesced part of a miss.
    async fn load(&self, key: &str) -> Result<ByteView, CacheError> {
        match self.flight.execute(key, self.load_once(key)).await {
            Ok(result) => result,
            // The leading task vanished without a result - report this as a failed load so
            // that the caller can simply retry.
            Err(error) => Err(CacheError::Loader(error.to_string())),
        }
    }

    /// Produces the value for one coalesced flight: remote owner first, loader as fallback.
    async fn load_once(&self, key: &str) -> Result<ByteView, CacheError> {
        if let Some(picker) = self.peers.load().as_ref() {
            if let Some(fetcher) = picker.pick(key) {
                match fetcher.fetch(&self.name, key).await {
                    // The remote owner caches this key already - keeping a second copy here
                    // would just displace entries this node actually owns.
                    Ok(bytes) => return Ok(ByteView::from(bytes)),
                    Err(error) => {
                        log::warn!(
                            "[{}] Failed to fetch '{}' from its owner: {}. Falling back to the local loader...",
                            self.name,
                            key,
                            error
                        );
                    }
                }
            }
        }

        self.load_locally(key).await
    }

    /// Invokes the backing loader and populates the local cache.
    async fn load_locally(&self, key: &str) -> Result<ByteView, CacheError> {
        log::debug!("[{}] cache miss for '{}' - consulting the loader", self.name, key);

        match self.loader.load(key).await {
            Ok(bytes) => {
                let view = ByteView::from(bytes);
                self.cache.add(key, view.clone());
                Ok(view)
            }
            Err(error) => Err(CacheError::Loader(error.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::{Group, LoaderFn};
    use crate::error::CacheError;

    #[test]
    fn hits_and_misses_behave_as_expected() {
        crate::testing::test_async(async {
            let calls = Arc::new(AtomicUsize::new(0));
            let counter = calls.clone();
            let group = Group::new(
                "scores",
                2048,
                LoaderFn(move |key: String| {
                    let counter = counter.clone();
                    async move {
                        let _ = counter.fetch_add(1, Ordering::SeqCst);
                        match key.as_str() {
                            "Tom" => Ok(b"630".to_vec()),
                            "Jack" => Ok(b"589".to_vec()),
                            "Sam" => Ok(b"567".to_vec()),
                            _ => Err(anyhow::anyhow!("{} not exist", key)),
                        }
                    }
                }),
            );

            // The first read consults the loader...
            assert_eq!(group.get("Tom").await.unwrap().to_string_lossy(), "630");
            assert_eq!(calls.load(Ordering::SeqCst), 1);

            // ...the second one is served from the cache.
            assert_eq!(group.get("Tom").await.unwrap().to_string_lossy(), "630");
            assert_eq!(calls.load(Ordering::SeqCst), 1);

            // Unknown keys surface the loader's error verbatim and are not cached.
            let error = group.get("kkk").await.unwrap_err();
            assert_eq!(error.to_string(), "kkk not exist");
            let error = group.get("kkk").await.unwrap_err();
            assert_eq!(error.to_string(), "kkk not exist");
            assert_eq!(calls.load(Ordering::SeqCst), 3);
        });
    }

    #[test]
    fn empty_keys_are_rejected_upfront() {
        crate::testing::test_async(async {
            let calls = Arc::new(AtomicUsize::new(0));
            let counter = calls.clone();
            let group = Group::new(
                "empty_keys",
                1024,
                LoaderFn(move |_key: String| {
                    let counter = counter.clone();
                    async move {
                        let _ = counter.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, anyhow::Error>(Vec::new())
                    }
                }),
            );

            assert_eq!(group.get("").await.unwrap_err(), CacheError::KeyRequired);

            // Neither the loader nor the cache have been touched...
            assert_eq!(calls.load(Ordering::SeqCst), 0);
            assert_eq!(group.cached_entries(), 0);
        });
    }

    #[test]
    fn the_registry_resolves_groups_by_name() {
        crate::testing::test_async(async {
            let group = Group::new(
                "registry_test",
                1024,
                LoaderFn(|_key: String| async move { Ok::<_, anyhow::Error>(Vec::new()) }),
            );

            assert_eq!(Group::lookup("registry_test").unwrap().name(), group.name());
            assert!(Group::lookup("never_registered").is_none());
        });
    }

    #[test]
    #[should_panic(expected = "register_peers called more than once")]
    fn registering_peers_twice_is_fatal() {
        struct NoPeers;
        impl crate::peers::PeerPicker for NoPeers {
            fn pick(&self, _key: &str) -> Option<Arc<dyn crate::peers::PeerFetcher>> {
                None
            }
        }

        let group = Group::new(
            "double_peers",
            0,
            LoaderFn(|_key: String| async move { Ok::<_, anyhow::Error>(Vec::new()) }),
        );
        group.register_peers(Arc::new(NoPeers));
        group.register_peers(Arc::new(NoPeers));
    }

    #[test]
    fn concurrent_misses_collapse_into_one_load() {
        crate::testing::test_async(async {
            let calls = Arc::new(AtomicUsize::new(0));
            let counter = calls.clone();
            let group = Group::new(
                "coalesced",
                1024,
                LoaderFn(move |key: String| {
                    let counter = counter.clone();
                    async move {
                        let _ = counter.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(key.into_bytes())
                    }
                }),
            );

            let mut tasks = Vec::new();
            for _ in 0..10 {
                let group = group.clone();
                tasks.push(tokio::spawn(async move { group.get("K").await }));
            }
            for task in tasks {
                assert_eq!(task.await.unwrap().unwrap().to_string_lossy(), "K");
            }

            // Ten concurrent readers, one loader invocation...
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        });
    }
}
