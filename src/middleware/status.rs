use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use http::{Method, Request, Response, StatusCode};
use serde::Serialize;
use tower::Service;

use super::cache::{CacheStats, TtlCache};
use super::circuit_breaker::{BreakerStatus, CircuitBreaker};
use super::request_limiter::{LimiterStats, RequestLimiter};
use crate::http::{Body, BoxError, HttpService, json_response};

type CacheStatsFn = Arc<dyn Fn() -> CacheStats + Send + Sync>;

/// Document served by [`StatusEndpoint`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    /// `"ok"`, or `"degraded"` while the circuit breaker is open.
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<BreakerStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_limiter: Option<LimiterStats>,
}

/// Tower layer that serves the state of the guard middlewares as JSON.
///
/// `GET` on the configured path (default `/health`) is answered directly;
/// everything else goes to the inner service. Place it outside the
/// [`RequestLimiter`] so health checks are answered while the server is
/// saturated.
///
/// # Examples
///
/// ```rust,no_run
/// use specular_gate::middleware::{
///     CircuitBreaker, CircuitBreakerConfig, RequestLimiter, RequestLimiterConfig, StatusEndpoint,
/// };
///
/// # fn main() -> anyhow::Result<()> {
/// let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
/// let limiter = RequestLimiter::new(RequestLimiterConfig::default())?;
/// let status = StatusEndpoint::new("/health")
///     .circuit_breaker(&breaker)
///     .request_limiter(&limiter);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct StatusEndpoint {
    path: String,
    cache: Option<CacheStatsFn>,
    breaker: Option<CircuitBreaker>,
    limiter: Option<RequestLimiter>,
}

impl StatusEndpoint {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            cache: None,
            breaker: None,
            limiter: None,
        }
    }

    pub fn cache<V: Clone + Send + 'static>(mut self, cache: &TtlCache<V>) -> Self {
        let cache = cache.clone();
        self.cache = Some(Arc::new(move || cache.stats()));
        self
    }

    pub fn circuit_breaker(mut self, breaker: &CircuitBreaker) -> Self {
        self.breaker = Some(breaker.clone());
        self
    }

    pub fn request_limiter(mut self, limiter: &RequestLimiter) -> Self {
        self.limiter = Some(limiter.clone());
        self
    }

    pub fn report(&self) -> StatusReport {
        let circuit_breaker = self.breaker.as_ref().map(CircuitBreaker::status);
        let degraded = circuit_breaker.as_ref().is_some_and(|s| s.is_open);
        StatusReport {
            status: if degraded { "degraded" } else { "ok" },
            cache: self.cache.as_ref().map(|stats| stats()),
            circuit_breaker,
            request_limiter: self.limiter.as_ref().map(RequestLimiter::stats),
        }
    }
}

impl Default for StatusEndpoint {
    fn default() -> Self {
        Self::new("/health")
    }
}

impl tower::Layer<HttpService> for StatusEndpoint {
    type Service = StatusEndpointService;

    fn layer(&self, inner: HttpService) -> Self::Service {
        StatusEndpointService {
            inner,
            endpoint: self.clone(),
        }
    }
}

pub struct StatusEndpointService {
    inner: HttpService,
    endpoint: StatusEndpoint,
}

impl Service<Request<Body>> for StatusEndpointService {
    type Response = Response<Body>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Response<Body>, BoxError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        if req.method() == Method::GET && req.uri().path() == self.endpoint.path {
            let resp = json_response(StatusCode::OK, &self.endpoint.report());
            return Box::pin(async move { Ok(resp) });
        }
        self.inner.call(req)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http_body_util::BodyExt;
    use tower::{Layer, ServiceExt};

    use super::*;
    use crate::http::full_body;
    use crate::middleware::{
        CacheConfig, CircuitBreakerConfig, MemorySnapshot, RequestLimiterConfig,
    };

    fn passthrough() -> HttpService {
        tower::util::BoxService::new(tower::service_fn(|_req: Request<Body>| async {
            Ok::<_, BoxError>(Response::new(full_body("app")))
        }))
    }

    fn breaker(used: u64) -> CircuitBreaker {
        CircuitBreaker::with_probe(CircuitBreakerConfig::default(), move || MemorySnapshot {
            heap_used: used,
            heap_total: 100,
            rss: used,
            external: 0,
        })
    }

    #[tokio::test]
    async fn serves_every_registered_component() {
        let cache: TtlCache<String> = TtlCache::new(CacheConfig::default());
        cache.set("a", "b".to_string());
        let limiter = RequestLimiter::new(RequestLimiterConfig::default()).unwrap();
        let endpoint = StatusEndpoint::default()
            .cache(&cache)
            .circuit_breaker(&breaker(10))
            .request_limiter(&limiter);

        let resp = endpoint
            .layer(passthrough())
            .oneshot(Request::get("/health").body(full_body("")).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(json["status"], "ok");
        assert_eq!(json["cache"]["size"], 1);
        assert_eq!(json["circuitBreaker"]["isOpen"], false);
        assert_eq!(json["requestLimiter"]["maxConcurrent"], 50);
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_reports_degraded() {
        let breaker = breaker(95);
        breaker.check_now();
        let report = StatusEndpoint::default().circuit_breaker(&breaker).report();
        assert_eq!(report.status, "degraded");
        assert!(report.cache.is_none());
        assert!(report.request_limiter.is_none());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(StatusEndpoint::default().circuit_breaker(&breaker).report().status, "ok");
    }

    #[tokio::test]
    async fn other_paths_reach_the_application() {
        let resp = StatusEndpoint::new("/status")
            .layer(passthrough())
            .oneshot(Request::get("/health").body(full_body("")).unwrap())
            .await
            .unwrap();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"app");
    }
}
