//! HTTP OCSP responder
//!
//! Serves cached responses to TLS terminators. Requests arrive either as
//! `GET /{base64 request}` or as a `POST /` body. Every OCSP answer is a
//! `200` with `application/ocsp-response`; failures are signalled inside the
//! OCSP response status, as RFC 5019 clients expect.

use async_trait::async_trait;
use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::{StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use stapled_proto::{OcspRequest, OcspResponseStatus};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

pub const OCSP_RESPONSE_CONTENT_TYPE: &str = "application/ocsp-response";

/// Lookup contract between the HTTP layer and the cache
#[async_trait]
pub trait ResponseSource: Send + Sync {
    /// DER response for the certificate the request names, if servable
    async fn response(&self, request: &OcspRequest) -> Option<Vec<u8>>;
}

type SharedSource = Arc<dyn ResponseSource>;

fn ocsp_reply(body: Vec<u8>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, OCSP_RESPONSE_CONTENT_TYPE)],
        body,
    )
        .into_response()
}

async fn answer(source: &SharedSource, request: Result<OcspRequest, stapled_proto::OcspError>) -> Response {
    let request = match request {
        Ok(request) => request,
        Err(e) => {
            debug!(error = %e, "Malformed OCSP request");
            return ocsp_reply(OcspResponseStatus::MalformedRequest.to_response_der());
        }
    };

    match source.response(&request).await {
        Some(bytes) => {
            debug!(serial = %request.cert_id.serial, "Serving cached response");
            ocsp_reply(bytes)
        }
        None => {
            debug!(serial = %request.cert_id.serial, "No response for requested certificate");
            ocsp_reply(OcspResponseStatus::Unauthorized.to_response_der())
        }
    }
}

/// `GET /{request}`; the raw path is used so percent-escapes are decoded once
async fn get_handler(State(source): State<SharedSource>, uri: Uri) -> Response {
    let encoded = uri.path().trim_start_matches('/');
    answer(&source, OcspRequest::from_get_path(encoded)).await
}

async fn post_handler(State(source): State<SharedSource>, body: Bytes) -> Response {
    answer(&source, OcspRequest::parse(&body)).await
}

async fn live_handler() -> Response {
    (StatusCode::OK, "alive").into_response()
}

/// Create the responder router
pub fn create_responder(source: SharedSource) -> Router {
    Router::new()
        .route("/health/live", get(live_handler))
        .route("/", post(post_handler).get(get_handler))
        .route("/*request", get(get_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(source)
}

/// Bind `addr` and serve until the listener fails
pub async fn start_responder(source: SharedSource, addr: SocketAddr) -> std::io::Result<()> {
    let app = create_responder(source);

    info!("Starting OCSP responder on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}
