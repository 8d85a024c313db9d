//! Entry registry and lookup
//!
//! Entries are registered under one [`LookupKey`] per CertID hash algorithm
//! and indexed by name for removal. Lookups take the read lock only and
//! never touch the network; misses can be filled on demand, with concurrent
//! fills for the same key sharing one upstream fetch.

use crate::cancel::CancelToken;
use crate::entry::{Entry, EntryParams, RefreshPolicy};
use crate::error::CacheError;
use crate::fetcher::{Fetcher, Transport};
use crate::issuer_cache::IssuerCache;
use crate::key::LookupKey;
use crate::stable_cache::StableCaches;
use chrono::Utc;
use dashmap::DashMap;
use stapled_proto::OcspRequest;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Cache-wide behaviour
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Refuse to serve responses past nextUpdate
    pub die_on_stale: bool,
    /// How long a request waits on another request's fill
    pub fill_wait: Duration,
    /// Spawn a refresh task for every registered entry
    pub background_refresh: bool,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            die_on_stale: true,
            fill_wait: Duration::from_secs(10),
            background_refresh: true,
        }
    }
}

/// What on-demand entries are built from
#[derive(Clone)]
pub struct OnDemand {
    pub transport: Arc<dyn Transport>,
    pub fetcher: Fetcher,
    pub policy: RefreshPolicy,
    pub stable: Arc<StableCaches>,
}

#[derive(Default)]
struct Registry {
    by_key: HashMap<LookupKey, Arc<Entry>>,
    /// Names are file names and may repeat across folders
    by_name: HashMap<String, Vec<Arc<Entry>>>,
}

impl Registry {
    /// Drop every index pointing at `entry`
    fn unlink(&mut self, entry: &Arc<Entry>) {
        for key in entry.keys() {
            if self.by_key.get(key).is_some_and(|e| Arc::ptr_eq(e, entry)) {
                self.by_key.remove(key);
            }
        }
        if let Some(named) = self.by_name.get_mut(entry.name()) {
            named.retain(|e| !Arc::ptr_eq(e, entry));
            if named.is_empty() {
                self.by_name.remove(entry.name());
            }
        }
    }
}

#[derive(Debug, Clone)]
enum FillState {
    Pending,
    Ready(Vec<u8>),
    Failed,
}

/// Clears the in-flight marker even if the leader is dropped mid-fill
struct InflightGuard<'a> {
    inflight: &'a DashMap<LookupKey, watch::Receiver<FillState>>,
    key: LookupKey,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.inflight.remove(&self.key);
    }
}

/// Registry of entries keyed by CertID
pub struct Cache {
    registry: RwLock<Registry>,
    issuers: Arc<IssuerCache>,
    inflight: DashMap<LookupKey, watch::Receiver<FillState>>,
    on_demand: Option<OnDemand>,
    options: CacheOptions,
    shutdown: CancelToken,
}

impl Cache {
    pub fn new(
        issuers: Arc<IssuerCache>,
        on_demand: Option<OnDemand>,
        options: CacheOptions,
        shutdown: CancelToken,
    ) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            issuers,
            inflight: DashMap::new(),
            on_demand,
            options,
            shutdown,
        }
    }

    pub fn issuers(&self) -> &Arc<IssuerCache> {
        &self.issuers
    }

    /// Number of registered entries, counting each certificate once
    pub fn len(&self) -> usize {
        self.read().by_name.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// First entry registered under `name`
    pub fn entry(&self, name: &str) -> Option<Arc<Entry>> {
        self.read().by_name.get(name)?.first().cloned()
    }

    pub fn entries(&self) -> Vec<Arc<Entry>> {
        let mut entries: Vec<Arc<Entry>> =
            self.read().by_name.values().flatten().cloned().collect();
        entries.sort_by(|a, b| a.name().cmp(b.name()));
        entries
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register entries; a later entry displaces any earlier one sharing a key
    ///
    /// Only CertID collisions conflict. Two certificates that happen to have
    /// the same file name are both kept.
    pub fn add_multi(&self, entries: Vec<Arc<Entry>>) {
        let mut started = Vec::with_capacity(entries.len());
        {
            let mut registry = self.write();
            for entry in entries {
                let mut displaced: Vec<Arc<Entry>> = Vec::new();
                for key in entry.keys() {
                    if let Some(old) = registry.by_key.get(key) {
                        if !Arc::ptr_eq(old, &entry) && !displaced.iter().any(|d| Arc::ptr_eq(d, old)) {
                            displaced.push(old.clone());
                        }
                    }
                }

                for old in displaced {
                    warn!(
                        entry = %entry.name(),
                        replaced = %old.name(),
                        key = %entry.primary_key(),
                        "Conflicting certificate definitions, keeping the later one"
                    );
                    registry.unlink(&old);
                    old.remove();
                }

                for key in entry.keys() {
                    registry.by_key.insert(*key, entry.clone());
                }
                let named = registry.by_name.entry(entry.name().to_string()).or_default();
                if named.iter().any(|e| Arc::ptr_eq(e, &entry)) {
                    continue;
                }
                named.push(entry.clone());
                debug!(entry = %entry.name(), key = %entry.primary_key(), "Registered entry");
                started.push(entry);
            }
        }

        if self.options.background_refresh {
            for entry in started {
                tokio::spawn(entry.run(self.shutdown.clone()));
            }
        }
    }

    /// Deregister every entry with this name; refresh loops stop and in-flight work is discarded
    pub fn remove(&self, name: &str) -> bool {
        let removed = {
            let mut registry = self.write();
            let named = registry.by_name.get(name).cloned().unwrap_or_default();
            for entry in &named {
                registry.unlink(entry);
            }
            named
        };

        for entry in &removed {
            entry.remove();
            info!(entry = %name, serial = %entry.serial(), "Removed entry");
        }
        !removed.is_empty()
    }

    /// Servable bytes for the certificate the request names
    pub fn lookup_response(&self, request: &OcspRequest) -> Option<Vec<u8>> {
        let key = LookupKey::from_cert_id(&request.cert_id);
        let entry = self.read().by_key.get(&key).cloned()?;
        entry.servable_response(Utc::now(), self.options.die_on_stale)
    }

    /// Fetch and register a response for a certificate nobody configured
    ///
    /// The issuer must already be known. Concurrent callers for the same key
    /// share one fetch and wait at most `fill_wait` for it. Failures are not
    /// remembered, so the next request tries again.
    pub async fn add_from_request(
        &self,
        request: &OcspRequest,
        responders: &[String],
    ) -> Result<Vec<u8>, CacheError> {
        let key = LookupKey::from_cert_id(&request.cert_id);
        if let Some(bytes) = self.lookup_response(request) {
            return Ok(bytes);
        }

        let leader = match self.inflight.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => Err(occupied.get().clone()),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let (tx, rx) = watch::channel(FillState::Pending);
                vacant.insert(rx);
                Ok(tx)
            }
        };

        match leader {
            Ok(tx) => {
                let _guard = InflightGuard {
                    inflight: &self.inflight,
                    key,
                };
                let result = self.fill(request, key, responders).await;
                tx.send_replace(match &result {
                    Ok(bytes) => FillState::Ready(bytes.clone()),
                    Err(_) => FillState::Failed,
                });
                result
            }
            Err(mut rx) => {
                debug!(key = %key, "Waiting for in-flight fill");
                let waited = tokio::time::timeout(
                    self.options.fill_wait,
                    rx.wait_for(|state| !matches!(state, FillState::Pending)),
                )
                .await;
                match waited {
                    Err(_) => Err(CacheError::WaitExpired(self.options.fill_wait)),
                    Ok(Err(_)) => Err(CacheError::LeaderGone),
                    Ok(Ok(state)) => match &*state {
                        FillState::Ready(bytes) => Ok(bytes.clone()),
                        FillState::Failed | FillState::Pending => Err(CacheError::LeaderFailed),
                    },
                }
            }
        }
    }

    async fn fill(
        &self,
        request: &OcspRequest,
        key: LookupKey,
        responders: &[String],
    ) -> Result<Vec<u8>, CacheError> {
        // Another leader may have finished between our lookup and taking the slot
        if let Some(bytes) = self.lookup_response(request) {
            return Ok(bytes);
        }

        let Some(on_demand) = &self.on_demand else {
            return Err(CacheError::NoResponders);
        };
        if responders.is_empty() {
            return Err(CacheError::NoResponders);
        }

        let cert_id = &request.cert_id;
        let issuer = self
            .issuers
            .get_by_hashes(
                cert_id.hash_algorithm,
                &cert_id.issuer_name_hash,
                &cert_id.issuer_key_hash,
            )
            .ok_or(CacheError::UnknownIssuer)?;

        let entry = Arc::new(Entry::new(EntryParams {
            name: key.to_hex(),
            serial: cert_id.serial.clone(),
            issuer,
            responders: responders.to_vec(),
            response_name: None,
            transport: on_demand.transport.clone(),
            fetcher: on_demand.fetcher.clone(),
            policy: on_demand.policy,
            stable: on_demand.stable.clone(),
        }));

        info!(entry = %entry.name(), serial = %entry.serial(), "Filling cache on demand");
        entry.refresh(&self.shutdown).await?;
        let bytes = entry
            .servable_response(Utc::now(), self.options.die_on_stale)
            .ok_or(CacheError::LeaderFailed)?;
        self.add_multi(vec![entry]);
        Ok(bytes)
    }
}
