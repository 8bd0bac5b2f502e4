use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use bytes::Bytes;
use http::{Request, Response, StatusCode, Uri};
use http_body::{Frame, SizeHint};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpStream;
use tower::Service;

use crate::pool::ConnectionPool;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type Body = http_body_util::combinators::BoxBody<Bytes, BoxError>;
pub type HttpService = tower::util::BoxService<Request<Body>, Response<Body>, BoxError>;

pub fn full_body(data: impl Into<Bytes>) -> Body {
    http_body_util::Full::new(data.into())
        .map_err(|e| match e {})
        .boxed()
}

pub fn empty_body() -> Body {
    http_body_util::Empty::new().map_err(|e| match e {}).boxed()
}

/// Convert a hyper `Incoming` body into our boxed body type.
pub fn incoming_to_body(incoming: Incoming) -> Body {
    incoming.map_err(|e| -> BoxError { Box::new(e) }).boxed()
}

/// Build a JSON response with the given status.
pub fn json_response(status: StatusCode, value: &impl Serialize) -> Response<Body> {
    let mut resp = Response::new(match serde_json::to_vec(value) {
        Ok(bytes) => full_body(bytes),
        Err(_) => empty_body(),
    });
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/json"),
    );
    resp
}

/// Error payload shared by every rejection the middlewares produce.
#[derive(Debug, Serialize)]
pub struct ErrorBody<'a> {
    pub error: &'a str,
    pub message: String,
}

/// Wrap `body` so that `f` runs once the body has been fully produced, or
/// when it is dropped early.
pub fn on_complete(body: Body, f: impl FnOnce() + Send + 'static) -> Body {
    CompletionBody {
        inner: body,
        on_complete: Mutex::new(Some(Box::new(f))),
    }
    .boxed()
}

type CompletionFn = Box<dyn FnOnce() + Send>;

struct CompletionBody {
    inner: Body,
    on_complete: Mutex<Option<CompletionFn>>,
}

impl CompletionBody {
    fn complete(&mut self) {
        let f = self
            .on_complete
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(f) = f {
            f();
        }
    }
}

impl http_body::Body for CompletionBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        if let Poll::Ready(None) = polled {
            this.complete();
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for CompletionBody {
    fn drop(&mut self) {
        self.complete();
    }
}

/// Tower service that forwards requests to a plain-HTTP upstream over pooled
/// HTTP/1.1 connections.
#[derive(Clone)]
pub struct UpstreamService {
    authority: http::uri::Authority,
    pool: ConnectionPool,
}

impl UpstreamService {
    /// Create a forwarder for an `http://host:port` upstream.
    pub fn new(upstream: &str, pool: ConnectionPool) -> anyhow::Result<Self> {
        let uri: Uri = upstream.parse()?;
        match uri.scheme_str() {
            Some("http") => {}
            Some(other) => anyhow::bail!("unsupported upstream scheme '{other}'"),
            None => anyhow::bail!("upstream must be an absolute http:// URL, got '{upstream}'"),
        }
        let authority = uri
            .authority()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("upstream URL has no host: '{upstream}'"))?;
        Ok(Self { authority, pool })
    }

    fn address(&self) -> String {
        let port = self.authority.port_u16().unwrap_or(80);
        format!("{}:{port}", self.authority.host())
    }
}

async fn connect(address: &str) -> Result<hyper::client::conn::http1::SendRequest<Body>, BoxError> {
    let stream = TcpStream::connect(address).await?;
    let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    let address = address.to_string();
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!(upstream = %address, error = %e, "upstream connection closed");
        }
    });
    Ok(sender)
}

impl Service<Request<Body>> for UpstreamService {
    type Response = Response<Body>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Response<Body>, BoxError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let (mut parts, body) = req.into_parts();
        let origin_form = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let host = http::HeaderValue::from_str(self.authority.as_str());
        let address = self.address();
        let pool = self.pool.clone();

        Box::pin(async move {
            parts.uri = origin_form.parse()?;
            parts.headers.insert(http::header::HOST, host?);
            let mut sender = match pool.checkout() {
                Some(sender) => sender,
                None => connect(&address).await?,
            };
            sender.ready().await?;
            let resp = sender
                .send_request(Request::from_parts(parts, body))
                .await?;
            Ok(resp.map(|incoming| {
                on_complete(incoming_to_body(incoming), move || pool.checkin(sender))
            }))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn completion_runs_once_after_body_is_read() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let body = on_complete(full_body("payload"), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let bytes = body.collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"payload");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn completion_runs_when_body_is_dropped_unread() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let body = on_complete(full_body("payload"), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        drop(body);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn upstream_rejects_non_http_schemes() {
        let pool = ConnectionPool::new(Default::default());
        assert!(UpstreamService::new("https://example.com", pool.clone()).is_err());
        assert!(UpstreamService::new("/relative", pool.clone()).is_err());
        let upstream = UpstreamService::new("http://127.0.0.1:3000", pool).unwrap();
        assert_eq!(upstream.address(), "127.0.0.1:3000");
    }
}
