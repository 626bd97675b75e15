//! Provides the HTTP peer pool - the concrete peer set implementation.
//!
//! The pool plays two independent roles which share the ring state:
//!
//! * **Serving side**: [HttpPool::handle] answers requests of the form
//!   `<base-path>/<group>/<key>` with the raw value bytes, so that remote peers can read
//!   entries owned by this node. [HttpPool::serve] binds a hyper server around it.
//! * **Client side**: the pool acts as the [PeerPicker] of a group. For keys owned by a
//!   remote peer it hands out an [HttpFetcher] which retrieves the value via a GET request,
//!   group and key percent-encoded as path segments.
//!
//! Peer membership is replaced wholesale via [HttpPool::set_peers]: a fresh consistent-hash
//! ring and a fresh fetcher per peer are swapped in atomically, discarding the previous
//! clients along with their pooled connections.
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hyper::client::HttpConnector;
use hyper::header::HeaderValue;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Client, Request, Response, StatusCode, Uri};
use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};

use crate::error::CacheError;
use crate::group::Group;
use crate::peers::{PeerFetcher, PeerPicker};
use crate::ring::HashRing;
use crate::view::ByteView;

/// The path prefix under which the cache protocol is served by default.
pub const DEFAULT_BASE_PATH: &str = "/_callisto/";

/// The default number of virtual nodes placed per peer.
pub const DEFAULT_REPLICAS: usize = 50;

/// The peer set of a node, usable as server and as [PeerPicker].
///
/// # Examples
/// ```no_run
/// # use callisto::http::HttpPool;
/// # use callisto::group::{Group, LoaderFn};
/// # use std::sync::Arc;
/// # #[tokio::main]
/// # async fn main() {
/// let group = Group::new("scores", 2048, LoaderFn(|key: String| async move {
///     Ok::<_, anyhow::Error>(key.into_bytes())
/// }));
///
/// let pool = Arc::new(HttpPool::new("http://127.0.0.1:8001"));
/// pool.set_peers(&[
///     "http://127.0.0.1:8001",
///     "http://127.0.0.1:8002",
///     "http://127.0.0.1:8003",
/// ]);
/// group.register_peers(pool.clone());
///
/// pool.serve("127.0.0.1:8001".parse().unwrap()).await.unwrap();
/// # }
/// ```
pub struct HttpPool {
    self_url: String,
    base_path: String,
    replicas: usize,
    state: Mutex<PoolState>,
}

struct PoolState {
    ring: HashRing,
    fetchers: HashMap<String, Arc<HttpFetcher>>,
}

impl HttpPool {
    /// Creates a pool for the node reachable under **self_url** (e.g. `http://10.0.0.1:8001`),
    /// using the default base path and replica count.
    pub fn new(self_url: impl Into<String>) -> Self {
        HttpPool::with_settings(self_url, DEFAULT_BASE_PATH, DEFAULT_REPLICAS)
    }

    /// Creates a pool with a custom base path and virtual node count.
    ///
    /// All nodes of a fleet must agree on both values, otherwise keys are routed to peers
    /// which either do not serve the path or disagree about ownership.
    pub fn with_settings(
        self_url: impl Into<String>,
        base_path: impl Into<String>,
        replicas: usize,
    ) -> Self {
        HttpPool {
            self_url: self_url.into(),
            base_path: base_path.into(),
            state: Mutex::new(PoolState {
                ring: HashRing::new(replicas),
                fetchers: HashMap::new(),
            }),
            replicas,
        }
    }

    /// Returns the URL under which this node expects to be reached by its peers.
    pub fn self_url(&self) -> &str {
        &self.self_url
    }

    /// Replaces the set of peers (which should include this node itself).
    ///
    /// The consistent-hash ring and the per-peer clients are rebuilt from scratch and swapped
    /// in atomically. Clients of dropped peers are discarded, releasing their pooled
    /// connections.
    pub fn set_peers<S: AsRef<str>>(&self, peers: &[S]) {
        let mut ring = HashRing::new(self.replicas);
        ring.add(peers);

        let mut fetchers = HashMap::new();
        for peer in peers {
            let peer = peer.as_ref();
            let _ = fetchers.insert(
                peer.to_owned(),
                Arc::new(HttpFetcher::new(format!("{}{}", peer, self.base_path))),
            );
        }

        *self.state.lock().unwrap() = PoolState { ring, fetchers };
    }

    /// Answers a single request of the cache protocol.
    ///
    /// The response carries the raw value bytes under `application/octet-stream`, or one of
    /// the protocol statuses: 400 for a malformed path, 404 for an unknown group and 500 if
    /// the read failed.
    ///
    /// # Panics
    /// Panics when invoked for a path outside of the configured base path - the pool has been
    /// mounted incorrectly and continuing would serve garbage.
    pub async fn handle(&self, request: Request<Body>) -> Result<Response<Body>, Infallible> {
        let path = request.uri().path().to_owned();
        if !path.starts_with(&self.base_path) {
            panic!("HttpPool serving unexpected path: {}", path);
        }
        log::debug!("[{}] {} {}", self.self_url, request.method(), path);

        let (group_name, key) = match parse_entry_path(&path[self.base_path.len()..]) {
            Ok(parts) => parts,
            Err(error) => {
                return Ok(text_response(StatusCode::BAD_REQUEST, &error.to_string()));
            }
        };

        let group = match Group::lookup(&group_name) {
            Some(group) => group,
            None => {
                let error = CacheError::UnknownGroup(group_name);
                return Ok(text_response(StatusCode::NOT_FOUND, &error.to_string()));
            }
        };

        match group.get(&key).await {
            Ok(view) => Ok(value_response(&view)),
            Err(error) => Ok(text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &error.to_string(),
            )),
        }
    }

    /// Binds a hyper server on the given address and serves the cache protocol until the
    /// server fails or the surrounding task is dropped.
    pub async fn serve(self: &Arc<Self>, address: SocketAddr) -> anyhow::Result<()> {
        let pool = self.clone();
        let make_svc = make_service_fn(move |_conn| {
            let pool = pool.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |request| {
                    let pool = pool.clone();
                    async move { pool.handle(request).await }
                }))
            }
        });

        log::info!("[{}] Serving the cache protocol on {}...", self.self_url, address);
        hyper::Server::try_bind(&address)?.serve(make_svc).await?;

        Ok(())
    }
}

impl PeerPicker for HttpPool {
    fn pick(&self, key: &str) -> Option<Arc<dyn PeerFetcher>> {
        let state = self.state.lock().unwrap();
        match state.ring.get(key) {
            Some(peer) if peer != self.self_url => {
                log::debug!("[{}] '{}' is owned by peer {}", self.self_url, key, peer);
                state.fetchers.get(peer).map(|fetcher| {
                    let fetcher: Arc<dyn PeerFetcher> = fetcher.clone();
                    fetcher
                })
            }
            _ => None,
        }
    }
}

/// Splits `<group>/<key>` and percent-decodes both segments.
fn parse_entry_path(trailer: &str) -> Result<(String, String), CacheError> {
    let mut parts = trailer.splitn(2, '/');
    match (parts.next(), parts.next()) {
        (Some(group), Some(key)) => Ok((decode_segment(group)?, decode_segment(key)?)),
        _ => Err(CacheError::BadRequest(format!(
            "expected <group>/<key>, got '{}'",
            trailer
        ))),
    }
}

fn decode_segment(segment: &str) -> Result<String, CacheError> {
    match percent_decode_str(segment).decode_utf8() {
        Ok(decoded) => Ok(decoded.into_owned()),
        Err(error) => Err(CacheError::BadRequest(format!(
            "invalid path segment '{}': {}",
            segment, error
        ))),
    }
}

fn text_response(status: StatusCode, message: &str) -> Response<Body> {
    let mut response = Response::new(Body::from(message.to_owned()));
    *response.status_mut() = status;
    response
}

fn value_response(view: &ByteView) -> Response<Body> {
    let mut response = Response::new(Body::from(view.to_vec()));
    let _ = response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    response
}

/// Reads single values from one remote peer via GET requests.
///
/// The underlying hyper client keeps its connections pooled, therefore a fetcher is created
/// once per peer and reused until the peer set changes.
pub struct HttpFetcher {
    base_url: String,
    client: Client<HttpConnector>,
}

impl HttpFetcher {
    fn new(base_url: String) -> Self {
        HttpFetcher {
            base_url,
            client: Client::new(),
        }
    }
}

#[async_trait]
impl PeerFetcher for HttpFetcher {
    async fn fetch(&self, group: &str, key: &str) -> Result<Vec<u8>, CacheError> {
        let url = format!(
            "{}{}/{}",
            self.base_url,
            utf8_percent_encode(group, NON_ALPHANUMERIC),
            utf8_percent_encode(key, NON_ALPHANUMERIC)
        );
        let uri = url
            .parse::<Uri>()
            .map_err(|error| CacheError::PeerTransport(format!("invalid url '{}': {}", url, error)))?;

        let response = self
            .client
            .get(uri)
            .await
            .map_err(|error| CacheError::PeerTransport(error.to_string()))?;

        if response.status() != StatusCode::OK {
            return Err(CacheError::PeerTransport(format!(
                "peer returned {}",
                response.status()
            )));
        }

        let body = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|error| CacheError::PeerTransport(format!("reading response body: {}", error)))?;

        Ok(body.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Client, Request, Response, StatusCode};

    use super::{HttpFetcher, HttpPool, DEFAULT_REPLICAS};
    use crate::error::CacheError;
    use crate::group::{Group, LoaderFn};
    use crate::peers::{PeerFetcher, PeerPicker};
    use crate::ring::HashRing;
    use crate::testing::{test_async, SHARED_TEST_RESOURCES};

    /// Starts a plain hyper server which answers every request with the given status and
    /// body, counting the requests it sees.
    fn start_stub_peer(address: &str, status: StatusCode, body: &'static str) -> Arc<AtomicUsize> {
        let hits = Arc::new(AtomicUsize::new(0));
        let address: SocketAddr = address.parse().unwrap();

        let peer_hits = hits.clone();
        let _ = tokio::spawn(async move {
            let make_svc = make_service_fn(move |_conn| {
                let hits = peer_hits.clone();
                async move {
                    Ok::<_, Infallible>(service_fn(move |_request| {
                        let hits = hits.clone();
                        async move {
                            let _ = hits.fetch_add(1, Ordering::SeqCst);
                            let mut response = Response::new(Body::from(body));
                            *response.status_mut() = status;
                            Ok::<_, Infallible>(response)
                        }
                    }))
                }
            });

            if let Err(error) = hyper::Server::bind(&address).serve(make_svc).await {
                panic!("stub peer failed: {}", error);
            }
        });

        hits
    }

    /// Finds a key which the pool's ring assigns to the given peer.
    fn key_owned_by<S: AsRef<str>>(peers: &[S], owner: &str) -> String {
        let mut probe = HashRing::new(DEFAULT_REPLICAS);
        probe.add(peers);

        (0..10_000)
            .map(|index| format!("probe-{}", index))
            .find(|key| probe.get(key) == Some(owner))
            .expect("no key maps to the requested owner")
    }

    #[test]
    fn the_pool_serves_the_cache_protocol() {
        let _guard = SHARED_TEST_RESOURCES.lock().unwrap();
        test_async(async {
            let _group = Group::new(
                "served_scores",
                2048,
                LoaderFn(|key: String| async move {
                    match key.as_str() {
                        "Tom" => Ok(b"630".to_vec()),
                        "kkk" => Err(anyhow::anyhow!("kkk not exist")),
                        _ => Ok(format!("echo:{}", key).into_bytes()),
                    }
                }),
            );

            let pool = Arc::new(HttpPool::new("http://127.0.0.1:7341"));
            pool.set_peers(&["http://127.0.0.1:7341"]);
            {
                let pool = pool.clone();
                let _ = tokio::spawn(async move {
                    pool.serve("127.0.0.1:7341".parse().unwrap()).await.unwrap();
                });
            }
            tokio::time::sleep(Duration::from_millis(100)).await;

            let client = Client::new();

            // A well-formed request yields the raw value bytes...
            let response = client
                .get("http://127.0.0.1:7341/_callisto/served_scores/Tom".parse().unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(
                response.headers()[hyper::header::CONTENT_TYPE],
                "application/octet-stream"
            );
            let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
            assert_eq!(&body[..], b"630");

            // ...an unknown group is a 404...
            let response = client
                .get("http://127.0.0.1:7341/_callisto/no_such_group/Tom".parse().unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);

            // ...a failing loader is a 500 carrying the loader's message...
            let response = client
                .get("http://127.0.0.1:7341/_callisto/served_scores/kkk".parse().unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
            let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
            assert_eq!(&body[..], b"kkk not exist");

            // ...and a path without a key is a 400.
            let response = client
                .get("http://127.0.0.1:7341/_callisto/served_scores".parse().unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);

            // The fetcher escapes group and key, the serving side decodes them again...
            let fetcher = HttpFetcher::new("http://127.0.0.1:7341/_callisto/".to_owned());
            let bytes = fetcher.fetch("served_scores", "Tom & Jr/é").await.unwrap();
            assert_eq!(bytes, "echo:Tom & Jr/é".as_bytes());
        });
    }

    #[test]
    fn remote_hits_are_not_cached_locally() {
        let _guard = SHARED_TEST_RESOURCES.lock().unwrap();
        test_async(async {
            let self_url = "http://127.0.0.1:7343";
            let peer_url = "http://127.0.0.1:7342";
            let peers = [self_url, peer_url];

            let peer_hits = start_stub_peer("127.0.0.1:7342", StatusCode::OK, "from-peer");
            tokio::time::sleep(Duration::from_millis(100)).await;

            let loader_calls = Arc::new(AtomicUsize::new(0));
            let counter = loader_calls.clone();
            let group = Group::new(
                "routed_scores",
                2048,
                LoaderFn(move |_key: String| {
                    let counter = counter.clone();
                    async move {
                        let _ = counter.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, anyhow::Error>(b"local".to_vec())
                    }
                }),
            );

            let pool = Arc::new(HttpPool::new(self_url));
            pool.set_peers(&peers);
            group.register_peers(pool.clone());

            // Reading a key owned by the peer goes over the wire...
            let key = key_owned_by(&peers, peer_url);
            assert_eq!(group.get(&key).await.unwrap().to_string_lossy(), "from-peer");
            assert_eq!(peer_hits.load(Ordering::SeqCst), 1);
            assert_eq!(loader_calls.load(Ordering::SeqCst), 0);

            // ...and is deliberately not cached here: the owner caches it already. A second
            // read therefore hits the peer again.
            assert_eq!(group.cached_entries(), 0);
            assert_eq!(group.get(&key).await.unwrap().to_string_lossy(), "from-peer");
            assert_eq!(peer_hits.load(Ordering::SeqCst), 2);
            assert_eq!(loader_calls.load(Ordering::SeqCst), 0);
        });
    }

    #[test]
    fn unreachable_peers_fall_back_to_the_local_loader() {
        let _guard = SHARED_TEST_RESOURCES.lock().unwrap();
        test_async(async {
            let self_url = "http://127.0.0.1:7345";
            // Nothing listens on this port - every fetch will fail...
            let peer_url = "http://127.0.0.1:7344";
            let peers = [self_url, peer_url];

            let loader_calls = Arc::new(AtomicUsize::new(0));
            let counter = loader_calls.clone();
            let group = Group::new(
                "fallback_scores",
                2048,
                LoaderFn(move |_key: String| {
                    let counter = counter.clone();
                    async move {
                        let _ = counter.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, anyhow::Error>(b"local".to_vec())
                    }
                }),
            );

            let pool = Arc::new(HttpPool::new(self_url));
            pool.set_peers(&peers);
            group.register_peers(pool.clone());

            // The peer is unreachable, therefore the local loader provides the value and the
            // local cache adopts it...
            let key = key_owned_by(&peers, peer_url);
            assert_eq!(group.get(&key).await.unwrap().to_string_lossy(), "local");
            assert_eq!(loader_calls.load(Ordering::SeqCst), 1);
            assert_eq!(group.cached_entries(), 1);

            // ...so the second read is a plain cache hit.
            assert_eq!(group.get(&key).await.unwrap().to_string_lossy(), "local");
            assert_eq!(loader_calls.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn error_statuses_become_transport_errors_and_recover_locally() {
        let _guard = SHARED_TEST_RESOURCES.lock().unwrap();
        test_async(async {
            let peer_hits = start_stub_peer(
                "127.0.0.1:7346",
                StatusCode::INTERNAL_SERVER_ERROR,
                "boom",
            );
            tokio::time::sleep(Duration::from_millis(100)).await;

            // The raw fetcher reports the status as a transport error...
            let fetcher = HttpFetcher::new("http://127.0.0.1:7346/_callisto/".to_owned());
            match fetcher.fetch("any_group", "any_key").await {
                Err(CacheError::PeerTransport(message)) => assert!(message.contains("500")),
                other => panic!("expected a transport error, got {:?}", other),
            }

            // ...while a group masks it entirely: the caller sees the loader's value.
            let self_url = "http://127.0.0.1:7347";
            let peer_url = "http://127.0.0.1:7346";
            let peers = [self_url, peer_url];

            let group = Group::new(
                "masked_scores",
                2048,
                LoaderFn(|_key: String| async move { Ok::<_, anyhow::Error>(b"local".to_vec()) }),
            );
            let pool = Arc::new(HttpPool::new(self_url));
            pool.set_peers(&peers);
            group.register_peers(pool.clone());

            let key = key_owned_by(&peers, peer_url);
            assert_eq!(group.get(&key).await.unwrap().to_string_lossy(), "local");
            assert!(peer_hits.load(Ordering::SeqCst) >= 2);
        });
    }

    #[test]
    fn self_owned_keys_are_not_picked() {
        test_async(async {
            let pool = Arc::new(HttpPool::new("http://127.0.0.1:7348"));

            // Without any peers there is nothing to pick...
            assert!(pool.pick("anything").is_none());

            // ...and with only this node in the ring, every key is owned locally.
            pool.set_peers(&["http://127.0.0.1:7348"]);
            assert!(pool.pick("anything").is_none());
        });
    }

    #[test]
    #[should_panic(expected = "unexpected path")]
    fn serving_a_foreign_path_is_fatal() {
        test_async(async {
            let pool = HttpPool::new("http://127.0.0.1:7349");
            let request = Request::builder()
                .uri("http://127.0.0.1:7349/other/group/key")
                .body(Body::empty())
                .unwrap();
            let _ = pool.handle(request).await;
        });
    }
}
