//! OCSP protocol client
//!
//! One call picks a responder and retries it until a response passes parsing,
//! signature and freshness checks, or until cancelled. Requests use HTTP GET
//! (RFC 5019) so responders and proxies can cache them.

use crate::cancel::CancelToken;
use crate::error::FetchError;
use async_trait::async_trait;
use chrono::Utc;
use num_bigint::BigUint;
use rand::Rng;
use stapled_proto::{verify_response, Issuer, OcspRequest, OcspResponse};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Largest response body accepted from a responder
pub const MAX_RESPONSE_SIZE: usize = 1024 * 1024;

/// Wait between attempts when the responder gives no Retry-After
pub const FALLBACK_RETRY_DELAY: Duration = Duration::from_secs(10);

/// What the fetcher needs from an HTTP exchange
#[derive(Debug, Clone, Default)]
pub struct HttpReply {
    pub status: u16,
    pub etag: Option<String>,
    pub cache_control: Option<String>,
    pub retry_after: Option<String>,
    pub body: Vec<u8>,
}

/// HTTP GET with optional `If-None-Match`
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str, etag: Option<&str>) -> Result<HttpReply, FetchError>;
}

/// [`Transport`] backed by a pooled `reqwest` client
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport, routing through `proxy` if given
    pub fn new(proxy: Option<&str>, timeout: Duration) -> Result<Self, FetchError> {
        let transport_error = |url: &str, e: reqwest::Error| FetchError::Transport {
            url: url.to_string(),
            source: Box::new(e),
        };

        let mut builder = reqwest::Client::builder().timeout(timeout);
        if let Some(proxy) = proxy {
            let proxy_config = reqwest::Proxy::all(proxy).map_err(|e| transport_error(proxy, e))?;
            builder = builder.proxy(proxy_config);
        }
        let client = builder.build().map_err(|e| transport_error("", e))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &str, etag: Option<&str>) -> Result<HttpReply, FetchError> {
        let mut request = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/ocsp-response");
        if let Some(etag) = etag {
            request = request.header(reqwest::header::IF_NONE_MATCH, etag);
        }

        let response = request.send().await.map_err(|e| FetchError::Transport {
            url: url.to_string(),
            source: Box::new(e),
        })?;

        let header = |name: reqwest::header::HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let status = response.status().as_u16();
        let etag = header(reqwest::header::ETAG);
        let cache_control = header(reqwest::header::CACHE_CONTROL);
        let retry_after = header(reqwest::header::RETRY_AFTER);

        if response
            .content_length()
            .is_some_and(|len| len as usize > MAX_RESPONSE_SIZE)
        {
            return Err(FetchError::Body {
                url: url.to_string(),
                reason: format!("response larger than {} bytes", MAX_RESPONSE_SIZE),
            });
        }

        let body = response.bytes().await.map_err(|e| FetchError::Body {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        Ok(HttpReply {
            status,
            etag,
            cache_control,
            retry_after,
            body: body.to_vec(),
        })
    }
}

/// Chooses the responder for one fetch call
pub trait ResponderPicker: Send + Sync {
    fn pick<'a>(&self, responders: &'a [String]) -> Option<&'a str>;
}

/// Uniform random choice
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomPicker;

impl ResponderPicker for RandomPicker {
    fn pick<'a>(&self, responders: &'a [String]) -> Option<&'a str> {
        if responders.is_empty() {
            return None;
        }
        let index = rand::rng().random_range(0..responders.len());
        Some(responders[index].as_str())
    }
}

/// Identity of the certificate being fetched
#[derive(Debug, Clone, Copy)]
pub struct FetchRequest<'a> {
    /// Entry name, for logs
    pub name: &'a str,
    pub serial: &'a BigUint,
    pub issuer: &'a Issuer,
    pub responders: &'a [String],
    /// ETag of the response currently held
    pub etag: Option<&'a str>,
}

/// A verified response fresh from a responder
#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub response: OcspResponse,
    pub bytes: Vec<u8>,
    pub etag: Option<String>,
    /// Advisory `Cache-Control: max-age`
    pub max_age: Option<Duration>,
}

#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Fetched(FetchedResponse),
    /// 304: the held response is still current
    NotModified { max_age: Option<Duration> },
}

struct AttemptError {
    error: FetchError,
    retry_after: Option<Duration>,
}

impl From<FetchError> for AttemptError {
    fn from(error: FetchError) -> Self {
        Self {
            error,
            retry_after: None,
        }
    }
}

/// Retrying OCSP fetcher
#[derive(Clone)]
pub struct Fetcher {
    picker: Arc<dyn ResponderPicker>,
    fallback_delay: Duration,
}

impl Default for Fetcher {
    fn default() -> Self {
        Self::new(Arc::new(RandomPicker))
    }
}

impl Fetcher {
    pub fn new(picker: Arc<dyn ResponderPicker>) -> Self {
        Self {
            picker,
            fallback_delay: FALLBACK_RETRY_DELAY,
        }
    }

    pub fn with_fallback_delay(mut self, delay: Duration) -> Self {
        self.fallback_delay = delay;
        self
    }

    /// Fetch until success or cancellation
    ///
    /// The first attempt is immediate. After a failure the next attempt
    /// waits for the responder's `Retry-After` (positive integer seconds) or
    /// the fallback delay. Cancellation interrupts both the request and the
    /// wait.
    pub async fn fetch(
        &self,
        transport: &dyn Transport,
        request: &FetchRequest<'_>,
        cancel: &CancelToken,
    ) -> Result<FetchOutcome, FetchError> {
        let responder = self
            .picker
            .pick(request.responders)
            .ok_or(FetchError::NoResponders)?;
        let ocsp_request = OcspRequest::for_certificate(request.issuer, request.serial);
        let url = format!(
            "{}/{}",
            responder.trim_end_matches('/'),
            ocsp_request.to_get_path()
        );

        loop {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }

            let attempt = tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                attempt = self.attempt(transport, request, responder, &url) => attempt,
            };

            let failure = match attempt {
                Ok(outcome) => return Ok(outcome),
                Err(failure) => failure,
            };

            let delay = failure.retry_after.unwrap_or(self.fallback_delay);
            warn!(
                entry = %request.name,
                url = %responder,
                error = %failure.error,
                retry_in = ?delay,
                "OCSP fetch attempt failed"
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn attempt(
        &self,
        transport: &dyn Transport,
        request: &FetchRequest<'_>,
        responder: &str,
        url: &str,
    ) -> Result<FetchOutcome, AttemptError> {
        debug!(entry = %request.name, url = %responder, "Requesting OCSP response");
        let reply = transport.get(url, request.etag).await?;
        let retry_after = parse_retry_after(reply.retry_after.as_deref());
        let failed = |error: FetchError| AttemptError { error, retry_after };

        if reply.status == 304 {
            debug!(entry = %request.name, "OCSP response not modified");
            return Ok(FetchOutcome::NotModified {
                max_age: parse_max_age(reply.cache_control.as_deref()),
            });
        }
        if reply.status != 200 {
            return Err(failed(FetchError::Status {
                url: responder.to_string(),
                status: reply.status,
            }));
        }
        if reply.body.len() > MAX_RESPONSE_SIZE {
            return Err(failed(FetchError::Body {
                url: responder.to_string(),
                reason: format!("response larger than {} bytes", MAX_RESPONSE_SIZE),
            }));
        }

        let protocol = |source| FetchError::Protocol {
            url: responder.to_string(),
            source,
        };
        let response = OcspResponse::parse(&reply.body, Some(request.serial))
            .map_err(|e| failed(protocol(e)))?;
        response
            .verify_signature(request.issuer)
            .map_err(|e| failed(protocol(e)))?;
        verify_response(Utc::now(), request.serial, &response).map_err(|source| {
            failed(FetchError::Verification {
                url: responder.to_string(),
                source,
            })
        })?;

        Ok(FetchOutcome::Fetched(FetchedResponse {
            response,
            bytes: reply.body,
            etag: reply.etag,
            max_age: parse_max_age(reply.cache_control.as_deref()),
        }))
    }
}

/// `Retry-After` in positive integer seconds; HTTP dates are ignored
pub fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    let seconds: u64 = value?.trim().parse().ok()?;
    (seconds > 0).then(|| Duration::from_secs(seconds))
}

/// `max-age` directive of a `Cache-Control` header
pub fn parse_max_age(value: Option<&str>) -> Option<Duration> {
    value?.split(',').find_map(|directive| {
        let (name, seconds) = directive.trim().split_once('=')?;
        if !name.trim().eq_ignore_ascii_case("max-age") {
            return None;
        }
        let seconds: u64 = seconds.trim().trim_matches('"').parse().ok()?;
        Some(Duration::from_secs(seconds))
    })
}
