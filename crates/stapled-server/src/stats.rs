//! Prometheus stats exporter
//!
//! Served on `stats_addr` when configured. Reports registered entries by
//! lifecycle state, known issuers and uptime.

use crate::cache::Cache;
use crate::entry::EntryState;
use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::Utc;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;
use tower_http::trace::TraceLayer;
use tracing::info;

const STATES: [(EntryState, &str); 6] = [
    (EntryState::Uninitialized, "uninitialized"),
    (EntryState::Fresh, "fresh"),
    (EntryState::Stale, "stale"),
    (EntryState::Fetching, "fetching"),
    (EntryState::ErrorRetry, "error_retry"),
    (EntryState::Removed, "removed"),
];

/// Metrics in Prometheus text format
#[derive(Debug, Clone, Default)]
pub struct PrometheusMetrics {
    pub content: String,
}

impl PrometheusMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn header(&mut self, name: &str, help: &str, kind: &str) {
        let _ = writeln!(self.content, "# HELP {} {}", name, help);
        let _ = writeln!(self.content, "# TYPE {} {}", name, kind);
    }

    fn add_gauge(&mut self, name: &str, value: impl std::fmt::Display, help: &str) {
        self.header(name, help, "gauge");
        let _ = writeln!(self.content, "{} {}", name, value);
    }

    fn add_counter(&mut self, name: &str, value: impl std::fmt::Display, help: &str) {
        self.header(name, help, "counter");
        let _ = writeln!(self.content, "{} {}", name, value);
    }

    /// One gauge family, one sample per label value
    fn add_labeled_gauges(
        &mut self,
        name: &str,
        label: &str,
        samples: &[(&str, usize)],
        help: &str,
    ) {
        self.header(name, help, "gauge");
        for (value, count) in samples {
            let _ = writeln!(self.content, "{}{{{}=\"{}\"}} {}", name, label, value, count);
        }
    }
}

/// Stats server state
#[derive(Clone)]
pub struct StatsState {
    cache: Arc<Cache>,
    start_time: SystemTime,
}

impl StatsState {
    pub fn new(cache: Arc<Cache>) -> Self {
        Self {
            cache,
            start_time: SystemTime::now(),
        }
    }

    fn collect_metrics(&self) -> PrometheusMetrics {
        let mut metrics = PrometheusMetrics::new();
        self.collect_entry_metrics(&mut metrics);

        metrics.add_gauge(
            "stapled_issuers",
            self.cache.issuers().len(),
            "Issuer certificates known to the issuer cache",
        );

        let uptime = self.start_time.elapsed().unwrap_or_default().as_secs();
        metrics.add_counter("stapled_uptime_seconds", uptime, "Daemon uptime in seconds");
        metrics
    }

    fn collect_entry_metrics(&self, metrics: &mut PrometheusMetrics) {
        let entries = self.cache.entries();
        let now = Utc::now();

        let mut counts = [0usize; STATES.len()];
        for entry in &entries {
            let state = entry.state(now);
            if let Some(slot) = STATES.iter().position(|(s, _)| *s == state) {
                counts[slot] += 1;
            }
        }
        let samples: Vec<(&str, usize)> = STATES
            .iter()
            .zip(counts)
            .map(|((_, label), count)| (*label, count))
            .collect();

        metrics.add_gauge("stapled_entries", entries.len(), "Registered certificate entries");
        metrics.add_labeled_gauges(
            "stapled_entries_by_state",
            "state",
            &samples,
            "Registered entries by lifecycle state",
        );
    }
}

async fn metrics_handler(State(state): State<StatsState>) -> Response {
    let metrics = state.collect_metrics();

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics.content,
    )
        .into_response()
}

/// Create the stats router
pub fn create_stats_server(cache: Arc<Cache>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(StatsState::new(cache))
}

/// Bind `addr` and serve stats until the listener fails
pub async fn start_stats_server(cache: Arc<Cache>, addr: SocketAddr) -> std::io::Result<()> {
    let app = create_stats_server(cache);

    info!("Starting stats server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}
