mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::routing::get;
use common::*;
use specular_gate::http::HttpService;
use specular_gate::middleware::{
    CacheConfig, CircuitBreaker, CircuitBreakerConfig, MemorySnapshot, ResponseCache, TtlCache,
};
use tower::Layer;

const MB: u64 = 1024 * 1024;

/// Breaker whose memory reading (MB used out of 1000) the test controls.
fn controlled_breaker(cooldown: Duration) -> (Arc<AtomicU64>, CircuitBreaker) {
    let used = Arc::new(AtomicU64::new(100));
    let reading = used.clone();
    let breaker = CircuitBreaker::with_probe(
        CircuitBreakerConfig {
            cooldown_period: cooldown,
            ..Default::default()
        },
        move || MemorySnapshot {
            heap_used: reading.load(Ordering::SeqCst) * MB,
            heap_total: 1000 * MB,
            rss: reading.load(Ordering::SeqCst) * MB,
            external: 0,
        },
    );
    (used, breaker)
}

#[tokio::test]
async fn circuit_breaker_trips_and_recovers() {
    let upstream_addr = start_upstream("hello").await;
    let (used, breaker) = controlled_breaker(Duration::from_millis(300));

    let layer = breaker.clone();
    let server_addr = start_server(
        upstream_addr,
        vec![Box::new(move |inner: HttpService| {
            tower::util::BoxService::new(layer.layer(inner))
        })],
    )
    .await;
    let client = reqwest::Client::new();
    let url = format!("http://{server_addr}/");

    let resp = client.get(&url).send().await.unwrap();
    assert_eq!(resp.text().await.unwrap(), "hello", "closed circuit passes through");

    used.store(900, Ordering::SeqCst);
    breaker.check_now();
    assert!(breaker.is_open());

    let resp = client.get(&url).send().await.unwrap();
    assert_eq!(resp.status(), 503, "open circuit should shed load");
    assert_eq!(resp.headers()["retry-after"], "1");
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "memory_pressure");
    assert_eq!(body["memoryUsage"]["used"], 900);
    assert_eq!(body["memoryUsage"]["total"], 1000);
    assert_eq!(body["memoryUsage"]["percent"], 90.0);
    assert_eq!(body["retryAfter"], 1);

    // The close timer fires after the cooldown even though memory is still high.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!breaker.is_open());
    let resp = client.get(&url).send().await.unwrap();
    assert_eq!(resp.status(), 200, "circuit should close after the cooldown");
    assert_eq!(breaker.status().trip_count, 1);
}

#[tokio::test]
async fn background_sampler_trips_the_circuit() {
    let upstream_addr = start_upstream("hello").await;
    let used = Arc::new(AtomicU64::new(950));
    let reading = used.clone();
    let breaker = CircuitBreaker::with_probe(
        CircuitBreakerConfig {
            check_interval: Duration::from_millis(20),
            ..Default::default()
        },
        move || MemorySnapshot {
            heap_used: reading.load(Ordering::SeqCst),
            heap_total: 1000,
            ..Default::default()
        },
    );
    breaker.start();

    let layer = breaker.clone();
    let server_addr = start_server(
        upstream_addr,
        vec![Box::new(move |inner: HttpService| {
            tower::util::BoxService::new(layer.layer(inner))
        })],
    )
    .await;

    wait_until("sampler trip", || breaker.is_open()).await;
    let resp = reqwest::get(format!("http://{server_addr}/")).await.unwrap();
    assert_eq!(resp.status(), 503);
    breaker.stop();
}

#[tokio::test]
async fn trip_clears_the_response_cache() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let upstream_addr = start_app(Router::new().route(
        "/pools",
        get(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                "pools"
            }
        }),
    ))
    .await;

    let cache = TtlCache::new(CacheConfig::default());
    let (used, breaker) = controlled_breaker(Duration::from_millis(100));
    let breaker = {
        let cache = cache.clone();
        breaker.on_trip(move || cache.clear())
    };

    let breaker_layer = breaker.clone();
    let cache_layer = ResponseCache::new(cache.clone());
    let server_addr = start_server(
        upstream_addr,
        vec![
            Box::new(move |inner: HttpService| {
                tower::util::BoxService::new(breaker_layer.layer(inner))
            }),
            Box::new(move |inner: HttpService| {
                tower::util::BoxService::new(cache_layer.layer(inner))
            }),
        ],
    )
    .await;
    let client = reqwest::Client::new();
    let url = format!("http://{server_addr}/pools");

    client.get(&url).send().await.unwrap().text().await.unwrap();
    let resp = client.get(&url).send().await.unwrap();
    assert_eq!(resp.headers()["x-cache"], "HIT");
    assert_eq!(cache.len(), 1);

    used.store(990, Ordering::SeqCst);
    breaker.check_now();
    assert!(cache.is_empty(), "trip should release cached responses");

    tokio::time::sleep(Duration::from_millis(200)).await;
    let resp = client.get(&url).send().await.unwrap();
    assert_eq!(resp.headers()["x-cache"], "MISS");
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}
