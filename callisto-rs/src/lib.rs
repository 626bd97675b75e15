//! Callisto is a library for running a fleet of nodes which cooperatively cache byte valued
//! entries.
//!
//! # Introduction
//! **Callisto** provides a read-through cache which is distributed across a set of peer nodes.
//! Entries are opaque byte payloads keyed by strings and organized into named namespaces called
//! [groups](group::Group). For every key exactly one node of the fleet is the *owner* - selected
//! via a consistent-hash [ring](ring::HashRing) - and every other node forwards requests for this
//! key to it. The owner answers from its local [LRU cache](lru::LruStore) and consults the
//! application supplied [loader](group::Loader) on a miss.
//!
//! The expensive part of a miss (hitting the backing source or a remote peer) is guarded by a
//! [single-flight coalescer](flight::SingleFlight): no matter how many tasks stumble over the
//! same missing key at the same time, the work is performed once and the result is shared.
//!
//! # Features
//! * **Byte bounded LRU caching** - each group enforces a memory limit by evicting the least
//!   recently used entries, accounting for the actual key and value sizes.
//! * **Consistent-hash peer routing** - virtual nodes smooth out the key distribution even for
//!   small fleets; membership changes only relocate a fraction of the key space.
//! * **100% Async/Await** - the whole system builds upon [tokio](https://tokio.rs/) and the
//!   peer protocol is plain HTTP served and consumed via [hyper](https://hyper.rs/).
//! * **Reload-aware config facility** which permits to re-point the peer set during operation
//!   without restarting the node.
//!
//! # Modules
//! * **group**: The read-through entry point - create a group with a capacity and a loader and
//!   call [Group::get](group::Group::get). See [crate::group].
//! * **http**: The peer pool which serves the cache protocol to other nodes and fetches entries
//!   from remote owners. See [crate::http].
//! * **lru** / **cache** / **ring** / **flight**: The building blocks, usable on their own.
//!
//! # Example
//! A complete runnable node can be found in the `callisto-io` crate of this workspace.
#![deny(
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces
)]
use simplelog::{format_description, ConfigBuilder, LevelFilter, SimpleLogger};
use std::sync::Once;

pub mod cache;
pub mod config;
pub mod error;
pub mod flight;
pub mod fmt;
pub mod group;
pub mod http;
pub mod lru;
pub mod peers;
pub mod ring;
pub mod view;

/// Contains the version of the Callisto library.
pub const CALLISTO_VERSION: &str = "DEVELOPMENT-SNAPSHOT";

/// Initializes the logging system.
///
/// Logs are written to stdout in a format which is digestible by established log shippers. As a
/// node is expected to run in a container, this is all that is needed.
pub fn init_logging() {
    static INIT_LOGGING: Once = Once::new();

    // We need to do this as otherwise the integration tests might crash as the logging system
    // is initialized several times...
    INIT_LOGGING.call_once(|| {
        if let Err(error) = SimpleLogger::init(
            LevelFilter::Debug,
            ConfigBuilder::new()
                .set_time_format_custom(format_description!(
                    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]"
                ))
                .set_thread_level(LevelFilter::Trace)
                .set_target_level(LevelFilter::Error)
                .set_location_level(LevelFilter::Trace)
                .build(),
        ) {
            panic!("Failed to initialize logging system: {}", error);
        }
    });
}

/// Provides a simple macro to execute an async lambda within `tokio::spawn`.
///
/// Note that this also applies std::mem::drop on the returned closure to make
/// clippy happy.
///
/// # Example
/// ```rust
/// # #[macro_use] extern crate callisto;
/// # #[tokio::main]
/// # async fn main() {
/// spawn!(async move {
///     // perform some async stuff here...
/// });
/// # }
#[macro_export]
macro_rules! spawn {
    ($e:expr) => {{
        std::mem::drop(tokio::spawn($e));
    }};
}
