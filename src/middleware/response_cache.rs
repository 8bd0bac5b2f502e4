use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use tower::Service;

use super::cache::TtlCache;
use crate::http::{Body, BoxError, HttpService, full_body};

const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;
const X_CACHE: &str = "x-cache";

/// A fully buffered `200 OK` response as stored by [`ResponseCache`].
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl CachedResponse {
    fn to_response(&self) -> Response<Body> {
        let mut resp = Response::new(full_body(self.body.clone()));
        *resp.headers_mut() = self.headers.clone();
        resp.headers_mut()
            .insert(X_CACHE, HeaderValue::from_static("HIT"));
        resp
    }
}

fn forbids_caching(headers: &HeaderMap) -> bool {
    headers
        .get_all(http::header::CACHE_CONTROL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| {
            let v = v.to_ascii_lowercase();
            v.contains("no-store") || v.contains("no-cache") || v.contains("private")
        })
}

/// Tower layer that answers repeated `GET` requests from a [`TtlCache`].
///
/// Only `200 OK` responses with a known `content-length` up to
/// `max_body_bytes` are stored. Requests or responses carrying
/// `cache-control: no-store`, `no-cache` or `private` bypass the cache.
/// Responses are tagged `x-cache: HIT` or `x-cache: MISS`.
///
/// # Examples
///
/// ```rust,no_run
/// use specular_gate::Server;
/// use specular_gate::middleware::{CacheConfig, ResponseCache, TtlCache};
///
/// # fn main() -> anyhow::Result<()> {
/// let cache = TtlCache::new(CacheConfig::default());
/// let server = Server::builder()
///     .http_layer(ResponseCache::new(cache))
///     .upstream("http://127.0.0.1:3000")
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ResponseCache {
    cache: TtlCache<CachedResponse>,
    max_body_bytes: usize,
}

impl ResponseCache {
    pub fn new(cache: TtlCache<CachedResponse>) -> Self {
        Self {
            cache,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    /// Largest body that will be stored. Defaults to 1 MiB.
    pub fn max_body_bytes(mut self, max: usize) -> Self {
        self.max_body_bytes = max;
        self
    }

    pub fn cache(&self) -> &TtlCache<CachedResponse> {
        &self.cache
    }
}

impl tower::Layer<HttpService> for ResponseCache {
    type Service = ResponseCacheService;

    fn layer(&self, inner: HttpService) -> Self::Service {
        ResponseCacheService {
            inner,
            cache: self.cache.clone(),
            max_body_bytes: self.max_body_bytes,
        }
    }
}

pub struct ResponseCacheService {
    inner: HttpService,
    cache: TtlCache<CachedResponse>,
    max_body_bytes: usize,
}

impl Service<Request<Body>> for ResponseCacheService {
    type Response = Response<Body>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Response<Body>, BoxError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        if req.method() != Method::GET || forbids_caching(req.headers()) {
            return self.inner.call(req);
        }

        let key = match req.uri().path_and_query() {
            Some(pq) => format!("GET {pq}"),
            None => format!("GET {}", req.uri().path()),
        };
        if let Some(hit) = self.cache.get(&key) {
            let resp = hit.to_response();
            return Box::pin(async move { Ok(resp) });
        }

        let cache = self.cache.clone();
        let max_body_bytes = self.max_body_bytes;
        let fut = self.inner.call(req);

        Box::pin(async move {
            let mut resp = fut.await?;
            resp.headers_mut()
                .insert(X_CACHE, HeaderValue::from_static("MISS"));

            let content_length = resp
                .headers()
                .get(http::header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<usize>().ok());
            let storable = resp.status() == StatusCode::OK
                && !forbids_caching(resp.headers())
                && content_length.is_some_and(|len| len <= max_body_bytes);
            if !storable {
                return Ok(resp);
            }

            let (parts, body) = resp.into_parts();
            let bytes = body.collect().await?.to_bytes();
            let mut headers = parts.headers.clone();
            headers.remove(X_CACHE);
            cache.set(
                key,
                CachedResponse {
                    headers,
                    body: bytes.clone(),
                },
            );
            Ok(Response::from_parts(parts, full_body(bytes)))
        })
    }
}
