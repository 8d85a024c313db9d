//! Per-certificate refresh state machine
//!
//! ```text
//! Uninitialized --seed--> Fresh --(clock passes nextUpdate)--> Stale
//!       |                   ^                                   |
//!       +-----refresh-------+------------ Fetching <------------+
//!                                            |
//!                                            +--failure--> ErrorRetry
//! any state --remove--> Removed
//! ```
//!
//! `Fresh` and `Stale` are derived from the wall clock on read. A failed
//! refresh keeps the last known good response.

use crate::cancel::{CancelHandle, CancelToken};
use crate::config::Config;
use crate::error::{FetchError, SeedError};
use crate::fetcher::{FetchOutcome, FetchRequest, FetchedResponse, Fetcher, Transport};
use crate::key::LookupKey;
use crate::stable_cache::StableCaches;
use chrono::{DateTime, Utc};
use num_bigint::BigUint;
use stapled_proto::{verify_response, CertificateStatus, Issuer, OcspResponse, VerificationError};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Observable lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Uninitialized,
    Fresh,
    Stale,
    Fetching,
    ErrorRetry,
    Removed,
}

/// Timing knobs for refreshes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshPolicy {
    /// Deadline for one refresh including retries
    pub fetch_timeout: Duration,
    pub base_backoff: Duration,
    pub max_interval: Duration,
    pub safety_margin: Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(30),
            base_backoff: Duration::from_secs(10),
            max_interval: Duration::from_secs(43200),
            safety_margin: Duration::from_secs(3600),
        }
    }
}

impl RefreshPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            fetch_timeout: config.fetch_timeout(),
            base_backoff: config.base_backoff(),
            max_interval: config.max_interval(),
            safety_margin: config.safety_margin(),
        }
    }

    /// `base_backoff * 2^(failures-1)`, capped at `max_interval`
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.base_backoff
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_interval)
            .min(self.max_interval)
    }
}

/// The response currently held by an entry
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub bytes: Vec<u8>,
    pub produced_at: DateTime<Utc>,
    pub this_update: DateTime<Utc>,
    pub next_update: DateTime<Utc>,
    pub status: CertificateStatus,
    pub etag: Option<String>,
    pub max_age: Option<Duration>,
}

impl CachedResponse {
    fn from_parsed(
        response: OcspResponse,
        bytes: Vec<u8>,
        etag: Option<String>,
        max_age: Option<Duration>,
    ) -> Option<Self> {
        Some(Self {
            next_update: response.next_update?,
            produced_at: response.produced_at,
            this_update: response.this_update,
            status: response.cert_status,
            bytes,
            etag,
            max_age,
        })
    }
}

#[derive(Debug, Default)]
struct RefreshState {
    failures: u32,
    backoff: Duration,
    fetching: bool,
}

/// Result of one refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A new response was installed
    Updated,
    /// The responder confirmed the held response
    NotModified,
    /// The entry was removed while fetching
    Discarded,
}

/// Everything needed to build an [`Entry`]
pub struct EntryParams {
    pub name: String,
    pub serial: BigUint,
    pub issuer: Arc<Issuer>,
    pub responders: Vec<String>,
    /// Persisted file name instead of the primary key
    pub response_name: Option<String>,
    pub transport: Arc<dyn Transport>,
    pub fetcher: Fetcher,
    pub policy: RefreshPolicy,
    pub stable: Arc<StableCaches>,
}

/// One certificate's cached response and refresh schedule
pub struct Entry {
    name: String,
    serial: BigUint,
    issuer: Arc<Issuer>,
    responders: Vec<String>,
    response_name: Option<String>,
    primary_key: LookupKey,
    keys: Vec<LookupKey>,
    transport: Arc<dyn Transport>,
    fetcher: Fetcher,
    policy: RefreshPolicy,
    stable: Arc<StableCaches>,
    response: RwLock<Option<Arc<CachedResponse>>>,
    refresh: Mutex<RefreshState>,
    removed: CancelHandle,
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("name", &self.name)
            .field("serial", &self.serial)
            .field("primary_key", &self.primary_key)
            .field("responders", &self.responders)
            .finish_non_exhaustive()
    }
}

impl Entry {
    pub fn new(params: EntryParams) -> Self {
        let primary_key = LookupKey::primary(&params.issuer, &params.serial);
        let keys = LookupKey::all_for(&params.issuer, &params.serial);
        Self {
            name: params.name,
            serial: params.serial,
            issuer: params.issuer,
            responders: params.responders,
            response_name: params.response_name,
            primary_key,
            keys,
            transport: params.transport,
            fetcher: params.fetcher,
            policy: params.policy,
            stable: params.stable,
            response: RwLock::new(None),
            refresh: Mutex::new(RefreshState::default()),
            removed: CancelHandle::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn serial(&self) -> &BigUint {
        &self.serial
    }

    pub fn issuer(&self) -> &Arc<Issuer> {
        &self.issuer
    }

    pub fn responders(&self) -> &[String] {
        &self.responders
    }

    pub fn primary_key(&self) -> LookupKey {
        self.primary_key
    }

    /// One key per supported CertID hash algorithm
    pub fn keys(&self) -> &[LookupKey] {
        &self.keys
    }

    /// Key under which the response is persisted
    pub fn storage_key(&self) -> String {
        self.response_name
            .clone()
            .unwrap_or_else(|| self.primary_key.to_hex())
    }

    pub fn response(&self) -> Option<Arc<CachedResponse>> {
        self.response
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn failures(&self) -> u32 {
        self.lock_refresh().failures
    }

    pub fn state(&self, now: DateTime<Utc>) -> EntryState {
        if self.is_removed() {
            return EntryState::Removed;
        }
        {
            let refresh = self.lock_refresh();
            if refresh.fetching {
                return EntryState::Fetching;
            }
            if refresh.failures > 0 {
                return EntryState::ErrorRetry;
            }
        }
        match self.response() {
            None => EntryState::Uninitialized,
            Some(r) if now > r.next_update => EntryState::Stale,
            Some(_) => EntryState::Fresh,
        }
    }

    /// Bytes to hand to a client, if any
    pub fn servable_response(&self, now: DateTime<Utc>, die_on_stale: bool) -> Option<Vec<u8>> {
        if self.is_removed() {
            return None;
        }
        let response = self.response()?;
        if now <= response.next_update || !die_on_stale {
            Some(response.bytes.clone())
        } else {
            None
        }
    }

    pub fn remove(&self) {
        self.removed.cancel();
    }

    pub fn is_removed(&self) -> bool {
        self.removed.is_cancelled()
    }

    fn lock_refresh(&self) -> std::sync::MutexGuard<'_, RefreshState> {
        self.refresh.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn install(&self, response: CachedResponse) {
        *self.response.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(response));
    }

    /// Install a persisted response without network access
    ///
    /// The signature, serial and thisUpdate are checked; a response already
    /// past nextUpdate is kept as stale so it can still be served when stale
    /// responses are allowed.
    pub fn seed(&self, bytes: &[u8], now: DateTime<Utc>) -> Result<(), SeedError> {
        let response = OcspResponse::parse(bytes, Some(&self.serial))?;
        response.verify_signature(&self.issuer)?;
        match verify_response(now, &self.serial, &response) {
            Ok(()) | Err(VerificationError::Stale { next_update: Some(_), .. }) => {}
            Err(e) => return Err(e.into()),
        }

        let cached = CachedResponse::from_parsed(response, bytes.to_vec(), None, None)
            .ok_or(SeedError::NoNextUpdate)?;
        info!(
            entry = %self.name,
            next_update = %cached.next_update,
            "Seeded response from stable cache"
        );
        self.install(cached);
        Ok(())
    }

    /// Seed from the stable caches; failures are logged and ignored
    pub async fn seed_from_stable(&self) -> bool {
        let Some(bytes) = self.stable.get(&self.storage_key()).await else {
            return false;
        };
        match self.seed(&bytes, Utc::now()) {
            Ok(()) => true,
            Err(e) => {
                warn!(entry = %self.name, error = %e, "Ignoring persisted response");
                false
            }
        }
    }

    /// Fetch a new response once, bounded by the fetch timeout
    pub async fn refresh(&self, cancel: &CancelToken) -> Result<RefreshOutcome, FetchError> {
        if self.is_removed() {
            return Ok(RefreshOutcome::Discarded);
        }

        let current = self.response();
        self.lock_refresh().fetching = true;

        let request = FetchRequest {
            name: &self.name,
            serial: &self.serial,
            issuer: &self.issuer,
            responders: &self.responders,
            etag: current.as_ref().and_then(|r| r.etag.as_deref()),
        };
        let result = match tokio::time::timeout(
            self.policy.fetch_timeout,
            self.fetcher.fetch(self.transport.as_ref(), &request, cancel),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout(self.policy.fetch_timeout)),
        };

        let outcome = match result {
            Ok(_) if self.is_removed() => {
                debug!(entry = %self.name, "Discarding response for removed entry");
                Ok(RefreshOutcome::Discarded)
            }
            Ok(FetchOutcome::Fetched(fetched)) => self.apply_fetched(fetched).await,
            Ok(FetchOutcome::NotModified { max_age }) => match current {
                Some(current) => {
                    let mut updated = (*current).clone();
                    updated.max_age = max_age.or(updated.max_age);
                    self.install(updated);
                    self.record_success();
                    debug!(entry = %self.name, "Response not modified");
                    Ok(RefreshOutcome::NotModified)
                }
                None => Err(FetchError::Status {
                    url: self.name.clone(),
                    status: 304,
                }),
            },
            Err(e) => Err(e),
        };

        self.lock_refresh().fetching = false;
        if let Err(e) = &outcome {
            if !matches!(e, FetchError::Cancelled) {
                self.record_failure(e);
            }
        }
        outcome
    }

    async fn apply_fetched(&self, fetched: FetchedResponse) -> Result<RefreshOutcome, FetchError> {
        let FetchedResponse {
            response,
            bytes,
            etag,
            max_age,
        } = fetched;
        let Some(cached) = CachedResponse::from_parsed(response, bytes, etag, max_age) else {
            return Err(FetchError::Verification {
                url: self.name.clone(),
                source: VerificationError::Stale {
                    next_update: None,
                    now: Utc::now(),
                },
            });
        };

        let bytes = cached.bytes.clone();
        info!(
            entry = %self.name,
            this_update = %cached.this_update,
            next_update = %cached.next_update,
            "Installed new OCSP response"
        );
        self.install(cached);
        self.record_success();

        let written = self.stable.put(&self.storage_key(), &bytes).await;
        debug!(entry = %self.name, backends = written, "Persisted response");
        Ok(RefreshOutcome::Updated)
    }

    fn record_success(&self) {
        let mut refresh = self.lock_refresh();
        refresh.failures = 0;
        refresh.backoff = Duration::ZERO;
    }

    fn record_failure(&self, error: &FetchError) {
        let mut refresh = self.lock_refresh();
        refresh.failures = refresh.failures.saturating_add(1);
        refresh.backoff = self.policy.backoff(refresh.failures);
        warn!(
            entry = %self.name,
            failures = refresh.failures,
            retry_in = ?refresh.backoff,
            error = %error,
            "OCSP refresh failed"
        );
    }

    /// When the next refresh should start
    ///
    /// With a response: `min(nextUpdate - margin, now + max_interval,
    /// now + max-age)` and never before `now + 1s`, where the margin is the
    /// configured safety margin capped at half the validity window. After a
    /// failure: `now + backoff`. Without a response: now.
    pub fn next_refresh_time(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        {
            let refresh = self.lock_refresh();
            if refresh.failures > 0 {
                return add_std(now, refresh.backoff);
            }
        }

        let Some(response) = self.response() else {
            return now;
        };

        let window = response.next_update - response.this_update;
        let margin = to_chrono(self.policy.safety_margin).min(window / 2);
        let mut at = response.next_update - margin;
        at = at.min(add_std(now, self.policy.max_interval));
        if let Some(max_age) = response.max_age {
            at = at.min(add_std(now, max_age));
        }
        at.max(now + chrono::Duration::seconds(1))
    }

    /// Refresh on schedule until removed or shut down
    pub async fn run(self: Arc<Self>, shutdown: CancelToken) {
        let removed = self.removed.token();
        debug!(entry = %self.name, "Refresh loop started");

        loop {
            if removed.is_cancelled() || shutdown.is_cancelled() {
                break;
            }

            let now = Utc::now();
            let wait = (self.next_refresh_time(now) - now)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if !wait.is_zero() {
                tokio::select! {
                    _ = removed.cancelled() => break,
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
            }

            if let Err(FetchError::Cancelled) = self.refresh(&shutdown).await {
                break;
            }
        }

        debug!(entry = %self.name, "Refresh loop stopped");
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

fn add_std(time: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    time.checked_add_signed(to_chrono(duration))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
