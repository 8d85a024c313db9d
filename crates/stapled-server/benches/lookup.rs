use async_trait::async_trait;
use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use num_bigint::BigUint;
use stapled_proto::test_support::{ResponseBuilder, TestAuthority};
use stapled_proto::{CertId, HashAlgorithm, OcspRequest};
use stapled_server::{
    Cache, CacheOptions, CancelToken, Entry, EntryParams, FetchError, Fetcher, HttpReply,
    IssuerCache, LookupKey, RefreshPolicy, StableCaches, Transport,
};
use std::sync::Arc;

struct Offline;

#[async_trait]
impl Transport for Offline {
    async fn get(&self, url: &str, _etag: Option<&str>) -> Result<HttpReply, FetchError> {
        Err(FetchError::Status {
            url: url.to_string(),
            status: 503,
        })
    }
}

fn seeded_cache(ca: &TestAuthority, entries: u32) -> Cache {
    let cache = Cache::new(
        Arc::new(IssuerCache::new()),
        None,
        CacheOptions {
            background_refresh: false,
            ..Default::default()
        },
        CancelToken::never(),
    );
    let issuer = Arc::new(ca.issuer().clone());
    let transport: Arc<dyn Transport> = Arc::new(Offline);
    let now = Utc::now();

    let mut registered = Vec::new();
    for serial in 0..entries {
        let entry = Entry::new(EntryParams {
            name: format!("cert-{}", serial),
            serial: BigUint::from(serial),
            issuer: issuer.clone(),
            responders: vec!["http://ocsp.example.com".to_string()],
            response_name: None,
            transport: transport.clone(),
            fetcher: Fetcher::default(),
            policy: RefreshPolicy::default(),
            stable: Arc::new(StableCaches::none()),
        });
        let body = ResponseBuilder::new(BigUint::from(serial)).sign(ca);
        entry.seed(&body, now).expect("Failed to seed entry");
        registered.push(Arc::new(entry));
    }
    cache.add_multi(registered);
    cache
}

fn bench_lookup_hit(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup_hit");
    let ca = TestAuthority::new("Bench CA");

    for entries in [10u32, 1_000].iter() {
        let cache = seeded_cache(&ca, *entries);
        let request = OcspRequest::new(CertId::for_issuer(
            ca.issuer(),
            &BigUint::from(entries / 2),
            HashAlgorithm::Sha1,
        ));
        group.bench_with_input(BenchmarkId::from_parameter(entries), &request, |b, request| {
            b.iter(|| cache.lookup_response(black_box(request)).expect("lookup miss"));
        });
    }

    group.finish();
}

fn bench_request_decode(c: &mut Criterion) {
    let ca = TestAuthority::new("Bench CA");
    let request = OcspRequest::new(CertId::for_issuer(
        ca.issuer(),
        &BigUint::from(0x0102u32),
        HashAlgorithm::Sha256,
    ));
    let path = request.to_get_path();

    c.bench_function("request_from_get_path", |b| {
        b.iter(|| OcspRequest::from_get_path(black_box(&path)).expect("Failed to decode"));
    });
    c.bench_function("lookup_key_from_cert_id", |b| {
        b.iter(|| LookupKey::from_cert_id(black_box(&request.cert_id)));
    });
}

criterion_group!(benches, bench_lookup_hit, bench_request_decode);
criterion_main!(benches);
