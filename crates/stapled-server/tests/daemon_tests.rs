//! End-to-end daemon tests
//!
//! An in-process axum server plays the upstream OCSP responder; the daemon
//! talks to it over real HTTP and is queried both directly and through its
//! own responder.

use axum::{Router, extract::State, routing::get};
use chrono::{Duration as ChronoDuration, Utc};
use num_bigint::BigUint;
use stapled_proto::test_support::{CertificateBuilder, ResponseBuilder, TestAuthority};
use stapled_proto::{CertId, HashAlgorithm, OcspRequest};
use stapled_server::{
    CertDefinition, Config, DirWatcher, LookupKey, ResponseSource, Stapled, create_responder,
};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Upstream responder that always answers with the same body
struct Upstream {
    body: Mutex<Vec<u8>>,
    calls: AtomicUsize,
    delay: Duration,
}

impl Upstream {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

async fn upstream_handler(State(upstream): State<Arc<Upstream>>) -> Vec<u8> {
    upstream.calls.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(upstream.delay).await;
    upstream.body.lock().unwrap().clone()
}

async fn start_upstream(body: Vec<u8>, delay: Duration) -> (Arc<Upstream>, String) {
    let upstream = Arc::new(Upstream {
        body: Mutex::new(body),
        calls: AtomicUsize::new(0),
        delay,
    });
    let app = Router::new()
        .route("/*request", get(upstream_handler))
        .with_state(upstream.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (upstream, format!("http://{}", addr))
}

fn write_issuer(dir: &Path, ca: &TestAuthority) -> String {
    let path = dir.join("issuer.der");
    std::fs::write(&path, CertificateBuilder::new(ca).sign(ca)).unwrap();
    path.display().to_string()
}

fn request(ca: &TestAuthority, serial: u32, alg: HashAlgorithm) -> OcspRequest {
    OcspRequest::new(CertId::for_issuer(ca.issuer(), &BigUint::from(serial), alg))
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

fn serial_definition(name: &str, serial: &str, issuer: &str, responder: &str) -> CertDefinition {
    CertDefinition {
        name: Some(name.to_string()),
        serial: Some(serial.to_string()),
        issuer: Some(issuer.to_string()),
        responders: vec![responder.to_string()],
        ..Default::default()
    }
}

#[tokio::test]
async fn test_serial_definition_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let cache_dir = dir.path().join("cache");
    let ca = TestAuthority::new("E2E CA");
    let body = ResponseBuilder::new(BigUint::from(258u32)).sign(&ca);
    let (upstream, url) = start_upstream(body.clone(), Duration::ZERO).await;

    let mut config = Config::default();
    config.disk.cache_folder = Some(cache_dir.display().to_string());
    config.definitions.certificates = vec![serial_definition(
        "api",
        "0102",
        &write_issuer(dir.path(), &ca),
        &url,
    )];

    let daemon = Arc::new(Stapled::new(config).await.unwrap());
    let entry = daemon.cache().entry("api").unwrap();
    assert_eq!(entry.serial(), &BigUint::from(258u32));
    eventually("first fetch", || entry.response().is_some()).await;
    assert_eq!(upstream.calls(), 1);

    for alg in HashAlgorithm::ALL {
        assert_eq!(daemon.response(&request(&ca, 258, alg)).await, Some(body.clone()));
    }
    assert_eq!(daemon.response(&request(&ca, 259, HashAlgorithm::Sha1)).await, None);

    // Written through under the primary key
    let key = LookupKey::primary(ca.issuer(), &BigUint::from(258u32));
    eventually("write-through", || cache_dir.join(key.to_hex()).exists()).await;
    assert_eq!(std::fs::read(cache_dir.join(key.to_hex())).unwrap(), body);

    // Through the HTTP responder
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let source: Arc<dyn ResponseSource> = daemon.clone();
    tokio::spawn(async move {
        axum::serve(listener, create_responder(source)).await.unwrap();
    });
    let reply = reqwest::get(format!(
        "http://{}/{}",
        addr,
        request(&ca, 258, HashAlgorithm::Sha1).to_get_path()
    ))
    .await
    .unwrap();
    assert_eq!(reply.status(), 200);
    assert_eq!(reply.bytes().await.unwrap().to_vec(), body);

    daemon.shutdown();
}

#[tokio::test]
async fn test_restart_serves_persisted_response_without_fetching() {
    let dir = tempfile::tempdir().unwrap();
    let cache_dir = dir.path().join("cache");
    let ca = TestAuthority::new("Restart CA");
    let issuer = write_issuer(dir.path(), &ca);
    let body = ResponseBuilder::new(BigUint::from(7u32)).sign(&ca);
    let (upstream, url) = start_upstream(body.clone(), Duration::ZERO).await;

    let mut config = Config::default();
    config.disk.cache_folder = Some(cache_dir.display().to_string());
    config.definitions.certificates = vec![serial_definition("seven", "07", &issuer, &url)];

    {
        let first = Stapled::new(config.clone()).await.unwrap();
        let entry = first.cache().entry("seven").unwrap();
        eventually("first fetch", || entry.response().is_some()).await;
        let key = LookupKey::primary(ca.issuer(), &BigUint::from(7u32));
        eventually("write-through", || cache_dir.join(key.to_hex()).exists()).await;
    }
    let calls = upstream.calls();

    let second = Stapled::new(config).await.unwrap();
    assert_eq!(
        second.response(&request(&ca, 7, HashAlgorithm::Sha256)).await,
        Some(body)
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(upstream.calls(), calls);
}

#[tokio::test]
async fn test_seeding_reports_unclaimed_responses() {
    let dir = tempfile::tempdir().unwrap();
    let cache_dir = dir.path().join("cache");
    std::fs::create_dir_all(&cache_dir).unwrap();
    let ca = TestAuthority::new("Listing CA");
    let issuer = write_issuer(dir.path(), &ca);
    let body = ResponseBuilder::new(BigUint::from(0x21u32)).sign(&ca);
    let key = LookupKey::primary(ca.issuer(), &BigUint::from(0x21u32));
    std::fs::write(cache_dir.join(key.to_hex()), &body).unwrap();
    // Left behind by a certificate that is no longer configured
    let orphan = LookupKey::primary(ca.issuer(), &BigUint::from(0x22u32)).to_hex();
    std::fs::write(cache_dir.join(&orphan), b"stale").unwrap();

    let mut config = Config::default();
    config.disk.cache_folder = Some(cache_dir.display().to_string());
    config.definitions.certificates = vec![
        serial_definition("listed", "21", &issuer, "http://127.0.0.1:9"),
        serial_definition("nothing-stored", "23", &issuer, "http://127.0.0.1:9"),
    ];

    let daemon = Stapled::new(config).await.unwrap();
    assert_eq!(
        daemon.response(&request(&ca, 0x21, HashAlgorithm::Sha1)).await,
        Some(body)
    );
    assert!(daemon.cache().entry("nothing-stored").unwrap().response().is_none());
    assert_eq!(daemon.unclaimed_responses(), [orphan]);
    daemon.shutdown();
}

#[tokio::test]
async fn test_seeding_can_be_disabled() {
    let dir = tempfile::tempdir().unwrap();
    let cache_dir = dir.path().join("cache");
    std::fs::create_dir_all(&cache_dir).unwrap();
    let ca = TestAuthority::new("No Seed CA");
    let issuer = write_issuer(dir.path(), &ca);
    let body = ResponseBuilder::new(BigUint::from(8u32)).sign(&ca);
    let key = LookupKey::primary(ca.issuer(), &BigUint::from(8u32));
    std::fs::write(cache_dir.join(key.to_hex()), &body).unwrap();

    let mut config = Config::default();
    config.dont_seed_cache_from_disk = true;
    config.disk.cache_folder = Some(cache_dir.display().to_string());
    // Nothing listens here, so the entry can only be served if it was seeded
    config.definitions.certificates =
        vec![serial_definition("eight", "08", &issuer, "http://127.0.0.1:9")];

    let daemon = Stapled::new(config).await.unwrap();
    assert_eq!(daemon.response(&request(&ca, 8, HashAlgorithm::Sha1)).await, None);
    assert!(daemon.unclaimed_responses().is_empty());
    daemon.shutdown();
}

#[tokio::test]
async fn test_concurrent_on_demand_fills_share_one_fetch() {
    let dir = tempfile::tempdir().unwrap();
    let issuer_dir = dir.path().join("issuers");
    std::fs::create_dir_all(&issuer_dir).unwrap();
    let ca = TestAuthority::new("On Demand CA");
    write_issuer(&issuer_dir, &ca);
    let body = ResponseBuilder::new(BigUint::from(42u32)).sign(&ca);
    let (upstream, url) = start_upstream(body.clone(), Duration::from_millis(300)).await;

    let mut config = Config::default();
    config.fetcher.upstream_responders = vec![url];
    config.definitions.issuer_folder = Some(issuer_dir.display().to_string());

    let daemon = Arc::new(Stapled::new(config).await.unwrap());
    assert!(daemon.cache().is_empty());

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let daemon = daemon.clone();
        let request = request(&ca, 42, HashAlgorithm::Sha1);
        tasks.push(tokio::spawn(async move { daemon.response(&request).await }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), Some(body.clone()));
    }

    assert_eq!(upstream.calls(), 1);
    assert_eq!(daemon.cache().len(), 1);

    // Unknown issuers fail closed without touching the upstream
    let stranger = TestAuthority::new("Stranger CA");
    assert_eq!(
        daemon.response(&request(&stranger, 42, HashAlgorithm::Sha1)).await,
        None
    );
    assert_eq!(upstream.calls(), 1);
    daemon.shutdown();
}

#[tokio::test]
async fn test_expired_upstream_response_is_not_installed() {
    let dir = tempfile::tempdir().unwrap();
    let issuer_dir = dir.path().join("issuers");
    std::fs::create_dir_all(&issuer_dir).unwrap();
    let ca = TestAuthority::new("Expired Upstream CA");
    write_issuer(&issuer_dir, &ca);
    let now = Utc::now();
    let expired = ResponseBuilder::new(BigUint::from(5u32))
        .this_update(now - ChronoDuration::hours(3))
        .next_update(Some(now - ChronoDuration::hours(1)))
        .sign(&ca);
    let (upstream, url) = start_upstream(expired, Duration::ZERO).await;

    let mut config = Config::default();
    config.fetcher.timeout_secs = 1;
    config.fetcher.upstream_responders = vec![url];
    config.definitions.issuer_folder = Some(issuer_dir.display().to_string());

    let daemon = Stapled::new(config).await.unwrap();
    assert_eq!(daemon.response(&request(&ca, 5, HashAlgorithm::Sha1)).await, None);
    assert!(upstream.calls() >= 1);
    assert!(daemon.cache().is_empty());

    // Failures are not remembered: the next request asks upstream again
    let before = upstream.calls();
    assert_eq!(daemon.response(&request(&ca, 5, HashAlgorithm::Sha1)).await, None);
    assert!(upstream.calls() > before);
    daemon.shutdown();
}

#[tokio::test]
async fn test_conflicting_definitions_keep_the_later_one() {
    let dir = tempfile::tempdir().unwrap();
    let ca = TestAuthority::new("Conflict CA");
    let issuer = write_issuer(dir.path(), &ca);
    let body = ResponseBuilder::new(BigUint::from(0x10u32)).sign(&ca);
    let (_upstream, url) = start_upstream(body, Duration::ZERO).await;

    let mut config = Config::default();
    config.definitions.certificates = vec![
        serial_definition("first", "10", &issuer, &url),
        serial_definition("second", "0010", &issuer, &url),
    ];

    let daemon = Stapled::new(config).await.unwrap();
    assert_eq!(daemon.cache().len(), 1);
    assert!(daemon.cache().entry("first").is_none());
    assert!(daemon.cache().entry("second").is_some());
    daemon.shutdown();
}

#[tokio::test]
async fn test_removed_certificate_file_removes_entry() {
    let dir = tempfile::tempdir().unwrap();
    let certs = dir.path().join("certs");
    std::fs::create_dir_all(&certs).unwrap();
    let ca = TestAuthority::new("Watch CA");
    let issuer = write_issuer(dir.path(), &ca);
    let body = ResponseBuilder::new(BigUint::from(99u32)).sign(&ca);
    let (_upstream, url) = start_upstream(body, Duration::ZERO).await;

    let leaf = TestAuthority::new("www.example.com");
    let cert_path = certs.join("www.pem");
    std::fs::write(
        &cert_path,
        CertificateBuilder::new(&leaf)
            .serial(BigUint::from(99u32))
            .ocsp_url(&url)
            .sign(&ca),
    )
    .unwrap();

    let mut config = Config::default();
    config.definitions.folder = Some(certs.display().to_string());
    config.definitions.certificates = vec![CertDefinition {
        certificate: Some(cert_path.display().to_string()),
        issuer: Some(issuer),
        ..Default::default()
    }];

    let daemon = Stapled::new(config).await.unwrap();
    let entry = daemon.cache().entry("www.pem").unwrap();
    assert_eq!(entry.responders(), [url.clone()]);
    eventually("first fetch", || entry.response().is_some()).await;

    let mut watcher = DirWatcher::new(&certs);
    daemon.check_cert_directory(&mut watcher);
    assert_eq!(daemon.cache().len(), 1);

    std::fs::remove_file(&cert_path).unwrap();
    daemon.check_cert_directory(&mut watcher);
    assert!(daemon.cache().is_empty());
    assert!(entry.is_removed());
    assert_eq!(daemon.response(&request(&ca, 99, HashAlgorithm::Sha1)).await, None);
    daemon.shutdown();
}
