mod common;

use common::*;
use specular_gate::http::HttpService;
use specular_gate::middleware::{
    CircuitBreaker, CircuitBreakerConfig, MemorySnapshot, RequestLimiter, RequestLimiterConfig,
    StatusEndpoint,
};
use tower::Layer;

#[tokio::test]
async fn health_reports_components_without_consuming_slots() {
    let upstream_addr = start_upstream("hello").await;
    let breaker = CircuitBreaker::with_probe(CircuitBreakerConfig::default(), || {
        MemorySnapshot {
            heap_used: 256 * 1024 * 1024,
            heap_total: 1024 * 1024 * 1024,
            rss: 300 * 1024 * 1024,
            external: 10 * 1024 * 1024,
        }
    });
    let limiter = RequestLimiter::new(RequestLimiterConfig::default()).unwrap();
    let status = StatusEndpoint::new("/health")
        .circuit_breaker(&breaker)
        .request_limiter(&limiter);

    let limiter_layer = limiter.clone();
    let server_addr = start_server(
        upstream_addr,
        vec![
            Box::new(move |inner: HttpService| {
                tower::util::BoxService::new(status.layer(inner))
            }),
            Box::new(move |inner: HttpService| {
                tower::util::BoxService::new(limiter_layer.layer(inner))
            }),
        ],
    )
    .await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("http://{server_addr}/"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.text().await.unwrap(), "hello");

    let resp = client
        .get(format!("http://{server_addr}/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-type"], "application/json");
    let body: serde_json::Value = resp.json().await.unwrap();

    assert_eq!(body["status"], "ok");
    assert!(body.get("cache").is_none());
    assert_eq!(body["circuitBreaker"]["isOpen"], false);
    assert_eq!(body["circuitBreaker"]["tripCount"], 0);
    assert_eq!(body["circuitBreaker"]["memory"]["heapUsed"], 256);
    assert_eq!(body["circuitBreaker"]["memory"]["heapTotal"], 1024);
    assert_eq!(body["circuitBreaker"]["memory"]["rss"], 300);
    assert_eq!(body["circuitBreaker"]["memory"]["usagePercent"], 25.0);
    assert_eq!(
        body["requestLimiter"]["totalRequests"], 1,
        "health checks should not pass through the limiter"
    );
    assert_eq!(body["requestLimiter"]["queueSize"], 100);
}
