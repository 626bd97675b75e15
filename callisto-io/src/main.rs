use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::panic::{set_hook, take_hook};
use std::sync::Arc;

use hyper::header::HeaderValue;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, StatusCode};
use percent_encoding::percent_decode_str;

use callisto::config::{self, Config};
use callisto::fmt::parse_size;
use callisto::group::{Group, LoaderFn};
use callisto::http::HttpPool;
use callisto::{init_logging, spawn};

#[tokio::main]
async fn main() {
    // Installs a panic handler which crashes the whole process instead of trying to survive
    // with a missing tokio background thread. Having a panic in a tokio thread is quite ugly,
    // as the node seems to be healthy from the outside but won't handle any incoming
    // requests.
    //
    // Therefore we crash the whole process on purpose and hope for an external watchdog like
    // docker-compose to create a new container which is in a sane and consistent state.
    let original_panic_handler = take_hook();
    set_hook(Box::new(move |panic_info| {
        original_panic_handler(panic_info);
        eprintln!("PROGRAM ALARM: A panic occurred in a thread. Crashing the whole process to enable a clean restart...");
        std::process::exit(-1);
    }));

    init_logging();
    log::info!("Starting callisto {}...", callisto::CALLISTO_VERSION);

    let config = Arc::new(Config::new("config/settings.yml"));
    if let Err(error) = config.load().await {
        log::error!("{}", error);
    }
    config::monitor_changes(config.clone());

    let group = install_scores_group(&config);
    let pool = install_peer_pool(&config, &group);

    if let Some(api_address) = api_address(&config) {
        start_api_server(api_address, group.clone());
    }

    let address = cache_address(&config);
    tokio::select! {
        result = pool.serve(address) => {
            if let Err(error) = result {
                log::error!("The cache server failed: {}", error);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("Received CTRL-C. Shutting down...");
        }
    }
}

/// The stand-in for a slow backing source - replace this with a database or service call in a
/// real deployment.
fn sample_database() -> HashMap<&'static str, &'static str> {
    let mut db = HashMap::new();
    let _ = db.insert("Tom", "630");
    let _ = db.insert("Jack", "589");
    let _ = db.insert("Sam", "567");
    db
}

/// Creates the demo group backed by [sample_database].
fn install_scores_group(config: &Arc<Config>) -> Arc<Group> {
    let capacity = config
        .current()
        .query("cache.capacity")
        .as_str()
        .map(parse_size)
        .and_then(Result::ok)
        .unwrap_or(2048);

    Group::new(
        "scores",
        capacity,
        LoaderFn(|key: String| async move {
            log::info!("[SlowDB] searching for '{}'...", key);
            match sample_database().get(key.as_str()) {
                Some(value) => Ok(value.as_bytes().to_vec()),
                None => Err(anyhow::anyhow!("{} not exist", key)),
            }
        }),
    )
}

/// Builds the peer pool, attaches it to the group and keeps its peer list in sync with the
/// config file.
fn install_peer_pool(config: &Arc<Config>, group: &Arc<Group>) -> Arc<HttpPool> {
    let self_url = self_url(config);
    let pool = Arc::new(HttpPool::new(self_url.clone()));
    pool.set_peers(&read_peers(config, &self_url));
    group.register_peers(pool.clone());

    // Re-point the ring whenever the settings file changes - nodes can join or leave the
    // fleet without restarting this one...
    {
        let config = config.clone();
        let pool = pool.clone();
        spawn!(async move {
            let mut changes = config.notifier();
            loop {
                if changes.recv().await.is_err() {
                    return;
                }
                let peers = read_peers(&config, pool.self_url());
                log::info!("Config changed - now routing across {} peer(s).", peers.len());
                pool.set_peers(&peers);
            }
        });
    }

    pool
}

fn self_url(config: &Arc<Config>) -> String {
    config
        .current()
        .query("server.self_url")
        .as_str()
        .unwrap_or("http://127.0.0.1:8001")
        .to_owned()
}

fn read_peers(config: &Arc<Config>, self_url: &str) -> Vec<String> {
    let handle = config.current();
    let peers: Vec<String> = handle
        .query("server.peers")
        .as_vec()
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.as_str())
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default();

    if peers.is_empty() {
        // Without configured peers this node simply owns the whole key space...
        vec![self_url.to_owned()]
    } else {
        peers
    }
}

/// Determines the bind address of the cache protocol server.
///
/// If no, an invalid or a partial config is present, fallback values are used. By default we
/// bind to "0.0.0.0" on port 8001.
fn cache_address(config: &Arc<Config>) -> SocketAddr {
    let handle = config.current();
    let address = format!(
        "{}:{}",
        handle.query("server.host").as_str().unwrap_or("0.0.0.0"),
        handle
            .query("server.port")
            .as_i64()
            .filter(|port| *port > 0 && *port <= i64::from(u16::MAX))
            .unwrap_or(8001)
    );

    address.parse().unwrap_or_else(|_| {
        log::error!(
            "Invalid server address in config: {} - falling back to 0.0.0.0:8001",
            address
        );
        "0.0.0.0:8001".parse().unwrap()
    })
}

/// Determines the bind address of the front-end API (absent if not configured).
fn api_address(config: &Arc<Config>) -> Option<SocketAddr> {
    let handle = config.current();
    let port = handle
        .query("api.port")
        .as_i64()
        .filter(|port| *port > 0 && *port <= i64::from(u16::MAX))?;
    let address = format!(
        "{}:{}",
        handle.query("api.host").as_str().unwrap_or("0.0.0.0"),
        port
    );

    address.parse().ok()
}

/// Serves `GET /api?key=K`, answering with the bytes cached for K.
fn start_api_server(address: SocketAddr, group: Arc<Group>) {
    spawn!(async move {
        let make_svc = make_service_fn(move |_conn| {
            let group = group.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |request| {
                    let group = group.clone();
                    async move { handle_api_request(group, request).await }
                }))
            }
        });

        log::info!("Serving the front-end API on {}...", address);
        if let Err(error) = hyper::Server::bind(&address).serve(make_svc).await {
            log::error!("The API server failed: {}", error);
        }
    });
}

async fn handle_api_request(
    group: Arc<Group>,
    request: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    if request.uri().path() != "/api" {
        let mut response = Response::new(Body::from("not found"));
        *response.status_mut() = StatusCode::NOT_FOUND;
        return Ok(response);
    }

    let key = request
        .uri()
        .query()
        .and_then(|query| {
            query
                .split('&')
                .find_map(|pair| pair.strip_prefix("key="))
        })
        .map(|raw| percent_decode_str(raw).decode_utf8_lossy().into_owned())
        .unwrap_or_default();

    match group.get(&key).await {
        Ok(view) => {
            let mut response = Response::new(Body::from(view.to_vec()));
            let _ = response.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            );
            Ok(response)
        }
        Err(error) => {
            let mut response = Response::new(Body::from(error.to_string()));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            Ok(response)
        }
    }
}
