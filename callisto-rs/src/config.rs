//! Contains the node configuration.
//!
//! Provides access to the settings which are loaded from a YAML file (most probably
//! **config/settings.yml**). The file is observed for changes and reloaded once a change is
//! detected. Therefore each user of the config should attach itself to the
//! [Config::notifier](Config::notifier) and re-process its settings once a change message is
//! received - this is how a running node picks up an updated peer list without a restart.
//!
//! Note that the **Config** struct is kind of constant and can be kept around. However, a
//! [Handle] obtained via [Config::current](Config::current) should not be stored, as it will
//! not be updated once a new config has been loaded.
//!
//! # Examples
//! ```
//! # use callisto::config::Config;
//! let config = Config::new("somefile.yml");
//! config.load_from_string("
//! server:
//!     port: 12345
//! ", None).unwrap();
//!
//! assert_eq!(config.current().query("server.port").as_i64().unwrap(), 12345);
//! ```
use std::sync::Arc;
use std::time::SystemTime;

use arc_swap::ArcSwap;
use yaml_rust::{Yaml, YamlLoader};

/// Provides access to the node configuration.
pub struct Config {
    filename: String,
    tx: tokio::sync::broadcast::Sender<()>,
    config: ArcSwap<(Yaml, Option<SystemTime>)>,
}

/// Represents the change listener.
///
/// Internally this is simply the receiver of a broadcast. The actual message being broadcast
/// can and should be ignored. All that matters is, once a message has been received, the
/// config was changed and needs to be re-processed.
pub type ChangeNotifier = tokio::sync::broadcast::Receiver<()>;

/// Represents a handle to the currently loaded configuration.
///
/// Note that this handle should not be stored or kept around for long, as it will not be
/// updated if the underlying config changed.
pub struct Handle {
    config: Arc<(Yaml, Option<SystemTime>)>,
}

impl Config {
    /// Creates a new config reading the given file.
    ///
    /// Note that this will not install a change listener. This is only done by
    /// [monitor_changes](monitor_changes).
    pub fn new(file: &str) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(1);
        Config {
            filename: file.to_owned(),
            config: ArcSwap::new(Arc::new((Yaml::Null, None))),
            tx,
        }
    }

    /// Obtains a change notifier which receives a message once the config changed.
    pub fn notifier(&self) -> ChangeNotifier {
        self.tx.subscribe()
    }

    /// Obtains a handle to the currently loaded configuration.
    pub fn current(&self) -> Handle {
        Handle {
            config: self.config.load_full(),
        }
    }

    /// Determines the last modified date of the config file on disk.
    ///
    /// As within docker, the file is presented as volume, we check that it is a file, as an
    /// unmounted docker volume is always presented as directory.
    async fn last_modified(&self) -> Option<SystemTime> {
        tokio::fs::metadata(&self.filename)
            .await
            .ok()
            .filter(|meta| meta.is_file())
            .and_then(|meta| meta.modified().ok())
    }

    /// Forces the config to read the underlying file.
    ///
    /// Note that this is normally called by the framework and should not be invoked manually.
    pub async fn load(&self) -> anyhow::Result<()> {
        log::info!("Loading config file {}...", &self.filename);

        if let Ok(metadata) = tokio::fs::metadata(&self.filename).await {
            if !metadata.is_file() {
                log::info!(
                    "Config file doesn't exist or is an unmounted docker volume - skipping config load."
                );
                return Ok(());
            }
        }

        let config_data = match tokio::fs::read_to_string(&self.filename).await {
            Ok(data) => data,
            Err(error) => {
                return Err(anyhow::anyhow!(
                    "Cannot load config file {}: {}",
                    &self.filename,
                    error
                ));
            }
        };

        let last_modified = self.last_modified().await;

        self.load_from_string(config_data.as_str(), last_modified)
    }

    /// Loads a configuration from the given string instead of a file.
    ///
    /// This is intended to be used in test environments where we cannot / do not want to load
    /// a config file from disk.
    pub fn load_from_string(
        &self,
        data: &str,
        last_modified: Option<SystemTime>,
    ) -> anyhow::Result<()> {
        let docs = match YamlLoader::load_from_str(data) {
            Ok(docs) => docs,
            Err(error) => {
                return Err(anyhow::anyhow!(
                    "Cannot parse config file {}: {}",
                    &self.filename,
                    error
                ));
            }
        };

        let doc = match docs.into_iter().next() {
            Some(doc @ Yaml::Hash(_)) => doc,
            _ => Yaml::Null,
        };

        // Store the updated config...
        self.config.store(Arc::new((doc, last_modified)));

        // Notify all listeners - we ignore if there are none...
        let _ = self.tx.send(());

        Ok(())
    }
}

impl Handle {
    /// Provides access to the currently loaded configuration document.
    pub fn config(&self) -> &Yaml {
        &self.config.0
    }

    /// Resolves a dotted path like `server.port` within the configuration.
    ///
    /// Missing elements yield `Yaml::BadValue`, therefore the accessors of the result
    /// (`as_i64`, `as_str`, ...) simply answer `None` for absent settings.
    pub fn query(&self, path: &str) -> &Yaml {
        let mut node = self.config();
        for part in path.split('.') {
            node = &node[part];
        }

        node
    }
}

/// Spawns a task which re-loads the config whenever the file on disk changes.
///
/// The watcher only compares the "last modified" date of the file every two seconds and does
/// not perform a structural comparison. Therefore it is the duty of each config user to
/// gracefully handle partial config changes.
pub fn monitor_changes(config: Arc<Config>) {
    let _ = tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;

            // This will contain the last modified date of the file on disk or be None if the
            // file is absent...
            let last_modified = config.last_modified().await;

            // Contains the timestamp when the file was loaded the last time or None if no
            // data has been loaded yet...
            let last_loaded = config.config.load().1;

            // If a file is present and newer than the one previously loaded (or if none has
            // been loaded so far) -> perform a reload and broadcast an update if the file has
            // been successfully loaded...
            if last_modified.is_some() && (last_loaded.is_none() || last_modified > last_loaded) {
                match config.load().await {
                    Ok(_) => {
                        log::info!("Node configuration was re-loaded.");
                    }
                    Err(error) => log::error!("Failed to re-load node config: {}", error),
                }
            }
        }
    });
}
