//! Daemon assembly
//!
//! Wires configuration into the issuer cache, stable caches and entry
//! registry, seeds entries from disk, starts their refresh loops and serves
//! the HTTP responder.

use crate::cache::{Cache, CacheOptions, OnDemand};
use crate::cancel::{CancelHandle, CancelToken};
use crate::config::Config;
use crate::definition::{DefinitionLoader, HttpTransports, TransportFactory};
use crate::entry::{Entry, RefreshPolicy};
use crate::error::StapledError;
use crate::fetcher::Fetcher;
use crate::issuer_cache::{HttpIssuerSource, IssuerCache, IssuerSource};
use crate::responder::{start_responder, ResponseSource};
use crate::stable_cache::{DiskCache, StableCache, StableCaches};
use crate::stats::start_stats_server;
use crate::watcher::DirWatcher;
use async_trait::async_trait;
use stapled_proto::OcspRequest;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Interval between certificate directory polls
pub const DIRECTORY_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Pluggable collaborators; [`Collaborators::http`] is the production set
pub struct Collaborators {
    pub transports: Arc<dyn TransportFactory>,
    pub issuer_source: Arc<dyn IssuerSource>,
    pub fetcher: Fetcher,
    pub stable: Arc<StableCaches>,
}

impl Collaborators {
    pub async fn http(config: &Config) -> Result<Self, StapledError> {
        Ok(Self {
            transports: Arc::new(HttpTransports::new(config.fetch_timeout())),
            issuer_source: Arc::new(HttpIssuerSource::new(config.fetch_timeout())?),
            fetcher: Fetcher::default(),
            stable: Arc::new(stable_caches(config).await?),
        })
    }
}

/// Disk backend unless caching is disabled or no folder is configured
pub async fn stable_caches(config: &Config) -> Result<StableCaches, StapledError> {
    if config.dont_cache {
        info!("Response caching disabled");
        return Ok(StableCaches::none());
    }
    let Some(folder) = config.disk.cache_folder.as_deref() else {
        return Ok(StableCaches::none());
    };
    let disk: Arc<dyn StableCache> = Arc::new(DiskCache::new(folder).await?);
    info!(folder = %folder, "Persisting responses to disk");
    Ok(StableCaches::new(vec![disk]))
}

/// Seed entries whose storage key is persisted; returns the stored keys nobody claimed
///
/// Stored keys are listed once up front so entries with nothing on disk skip
/// the read. If a backend cannot be listed every entry tries its own read.
async fn seed_entries(entries: &[Arc<Entry>], stable: &StableCaches) -> Vec<String> {
    if stable.is_empty() {
        return Vec::new();
    }
    let stored = stable.list().await;

    let mut seeded = 0;
    let mut claimed = BTreeSet::new();
    for entry in entries {
        let key = entry.storage_key();
        let listed = stored.as_ref().map_or(true, |keys| keys.contains(&key));
        claimed.insert(key.clone());
        if !listed {
            debug!(entry = %entry.name(), key = %key, "No persisted response");
            continue;
        }
        if entry.seed_from_stable().await {
            seeded += 1;
        }
    }

    let unclaimed: Vec<String> = stored
        .map(|keys| keys.difference(&claimed).cloned().collect())
        .unwrap_or_default();
    for key in &unclaimed {
        debug!(key = %key, "Persisted response matches no configured certificate");
    }
    info!(seeded, unclaimed = unclaimed.len(), "Seeded entries from stable cache");
    unclaimed
}

/// The running daemon
pub struct Stapled {
    config: Config,
    cache: Arc<Cache>,
    shutdown: CancelHandle,
    unclaimed: Vec<String>,
}

impl Stapled {
    /// Build with HTTP transports and the configured disk cache
    pub async fn new(config: Config) -> Result<Self, StapledError> {
        let collaborators = Collaborators::http(&config).await?;
        Self::with_collaborators(config, collaborators).await
    }

    pub async fn with_collaborators(
        config: Config,
        collaborators: Collaborators,
    ) -> Result<Self, StapledError> {
        let shutdown = CancelHandle::new();

        let issuers = Arc::new(IssuerCache::new());
        if let Some(folder) = config.definitions.issuer_folder.as_deref() {
            issuers.load_folder(Path::new(folder))?;
        }

        let on_demand = if config.fetcher.upstream_responders.is_empty() {
            None
        } else {
            Some(OnDemand {
                transport: collaborators
                    .transports
                    .transport(config.fetcher.proxy.as_deref())?,
                fetcher: collaborators.fetcher.clone(),
                policy: RefreshPolicy::from_config(&config),
                stable: collaborators.stable.clone(),
            })
        };

        let cache = Arc::new(Cache::new(
            issuers.clone(),
            on_demand,
            CacheOptions {
                die_on_stale: !config.dont_die_on_stale_response,
                fill_wait: config.fill_wait(),
                background_refresh: true,
            },
            shutdown.token(),
        ));

        let loader = DefinitionLoader {
            config: &config,
            issuers: &issuers,
            issuer_source: collaborators.issuer_source.as_ref(),
            transports: collaborators.transports.as_ref(),
            fetcher: collaborators.fetcher.clone(),
            stable: collaborators.stable.clone(),
        };

        let mut entries = Vec::with_capacity(config.definitions.certificates.len());
        for definition in &config.definitions.certificates {
            let params = loader.entry_params(definition).await?;
            let entry = Arc::new(Entry::new(params));
            info!(
                entry = %entry.name(),
                key = %entry.primary_key(),
                responders = entry.responders().len(),
                "Loaded certificate definition"
            );
            entries.push(entry);
        }
        let unclaimed = if config.dont_seed_cache_from_disk {
            Vec::new()
        } else {
            seed_entries(&entries, &collaborators.stable).await
        };
        cache.add_multi(entries);

        Ok(Self {
            config,
            cache,
            shutdown,
            unclaimed,
        })
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Persisted responses no configured certificate claimed at startup
    pub fn unclaimed_responses(&self) -> &[String] {
        &self.unclaimed
    }

    /// Stop refresh loops and the directory watch
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancelToken {
        self.shutdown.token()
    }

    /// Apply one directory poll; removed files deregister the entry of the same name
    pub fn check_cert_directory(&self, watcher: &mut DirWatcher) {
        let (added, removed) = match watcher.check() {
            Ok(changes) => changes,
            Err(e) => {
                error!(folder = %watcher.folder().display(), error = %e, "Failed to poll certificate directory");
                return;
            }
        };
        for name in added {
            debug!(file = %name, "Certificate file appeared");
        }
        for name in removed {
            if !self.cache.remove(&name) {
                debug!(file = %name, "Removed file had no entry");
            }
        }
    }

    async fn watch_cert_directory(self: Arc<Self>, folder: String) {
        let mut watcher = DirWatcher::new(folder);
        let shutdown = self.shutdown.token();
        let mut ticker = tokio::time::interval(DIRECTORY_POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.check_cert_directory(&mut watcher),
            }
        }
    }

    /// Serve until the HTTP listener fails; stats are served alongside when configured
    pub async fn run(self: Arc<Self>) -> Result<(), StapledError> {
        let addr = self.config.socket_addr()?;
        if let Some(stats_addr) = self.config.stats_socket_addr()? {
            let cache = self.cache.clone();
            tokio::spawn(async move {
                if let Err(e) = start_stats_server(cache, stats_addr).await {
                    error!(addr = %stats_addr, error = %e, "Stats server failed");
                }
            });
        }
        if let Some(folder) = self.config.definitions.folder.clone() {
            tokio::spawn(self.clone().watch_cert_directory(folder));
        }
        let source: Arc<dyn ResponseSource> = self.clone();
        let result = start_responder(source, addr).await;
        self.shutdown();
        result.map_err(StapledError::from)
    }
}

#[async_trait]
impl ResponseSource for Stapled {
    /// Cached response, filled on demand when upstream responders are configured
    async fn response(&self, request: &OcspRequest) -> Option<Vec<u8>> {
        if let Some(bytes) = self.cache.lookup_response(request) {
            return Some(bytes);
        }
        let upstream = &self.config.fetcher.upstream_responders;
        if upstream.is_empty() {
            return None;
        }
        match self.cache.add_from_request(request, upstream).await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(serial = %request.cert_id.serial, error = %e, "On-demand fill failed");
                None
            }
        }
    }
}

impl Drop for Stapled {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
