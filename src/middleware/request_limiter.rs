use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use http::{Request, Response, StatusCode};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tower::{Service, ServiceExt};

use crate::http::{Body, BoxError, HttpService, json_response, on_complete};

pub const DEFAULT_MAX_CONCURRENT: usize = 50;
pub const DEFAULT_QUEUE_SIZE: usize = 100;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Advisory delay sent with queue-full rejections.
pub const QUEUE_FULL_RETRY_AFTER_SECS: u64 = 5;

/// Settings for a [`RequestLimiter`].
#[derive(Debug, Clone)]
pub struct RequestLimiterConfig {
    /// Requests processed at once.
    pub max_concurrent: usize,
    /// Requests allowed to wait for a slot.
    pub queue_size: usize,
    /// How long a request may wait before it is answered with 504.
    pub timeout: Duration,
}

impl Default for RequestLimiterConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            queue_size: DEFAULT_QUEUE_SIZE,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Counters returned by [`RequestLimiter::stats`]. `queued`, `rejected` and
/// `timed_out` are cumulative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimiterStats {
    pub total_requests: u64,
    pub queued: u64,
    pub rejected: u64,
    pub timed_out: u64,
    pub active: usize,
    pub queue_length: usize,
    pub max_concurrent: usize,
    pub queue_size: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueueFull {
    error: &'static str,
    message: String,
    retry_after: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueueTimeout {
    error: &'static str,
    message: String,
    queued_for: u64,
}

struct Waiter {
    id: u64,
    admit: oneshot::Sender<Permit>,
}

struct LimiterState {
    active: usize,
    queue: VecDeque<Waiter>,
    next_id: u64,
    total_requests: u64,
    queued: u64,
    rejected: u64,
    timed_out: u64,
    max_concurrent: usize,
    queue_size: usize,
}

impl LimiterState {
    fn remove_waiter(&mut self, id: u64) -> bool {
        match self.queue.iter().position(|w| w.id == id) {
            Some(pos) => {
                self.queue.remove(pos);
                true
            }
            None => false,
        }
    }
}

type SharedState = Arc<Mutex<LimiterState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, LimiterState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One processing slot. Dropping it frees the slot, or hands it straight to
/// the oldest queued request so the active count never dips in between.
struct Permit {
    state: Option<SharedState>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        let Some(state) = self.state.take() else {
            return;
        };
        loop {
            let waiter = {
                let mut guard = lock(&state);
                match guard.queue.pop_front() {
                    Some(waiter) => waiter,
                    None => {
                        guard.active -= 1;
                        return;
                    }
                }
            };
            let handoff = Permit {
                state: Some(state.clone()),
            };
            match waiter.admit.send(handoff) {
                Ok(()) => return,
                // The waiter went away; disarm the unused permit and move on.
                Err(mut unused) => unused.state = None,
            }
        }
    }
}

/// A queue slot that is given back if the waiting request is dropped.
struct QueueTicket {
    state: SharedState,
    id: u64,
    enqueued_at: Instant,
}

impl Drop for QueueTicket {
    fn drop(&mut self) {
        lock(&self.state).remove_waiter(self.id);
    }
}

enum Admission {
    Admitted(Permit),
    Queued {
        ticket: QueueTicket,
        admit: oneshot::Receiver<Permit>,
    },
    Rejected {
        active: usize,
        queued: usize,
    },
}

/// Tower layer that caps how many requests are processed concurrently.
///
/// Up to `max_concurrent` requests run at once. Further requests wait in a
/// FIFO queue of at most `queue_size` entries and are admitted oldest first
/// as slots free up. When the queue is full a request is answered at once
/// with `503` and a `retryAfter` hint of 5 seconds; a request that waits
/// longer than `timeout` is answered with `504`.
///
/// A slot is held until the response body has been fully sent (or dropped),
/// not merely until the handler returns.
///
/// Cheaply cloneable; clones share the same slots and queue.
///
/// # Examples
///
/// ```rust,no_run
/// use std::time::Duration;
/// use specular_gate::Server;
/// use specular_gate::middleware::{RequestLimiter, RequestLimiterConfig};
///
/// # fn main() -> anyhow::Result<()> {
/// let limiter = RequestLimiter::new(RequestLimiterConfig {
///     max_concurrent: 10,
///     queue_size: 20,
///     timeout: Duration::from_secs(5),
/// })?;
/// let server = Server::builder()
///     .http_layer(limiter)
///     .upstream("http://127.0.0.1:3000")
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RequestLimiter {
    state: SharedState,
    timeout: Duration,
}

impl RequestLimiter {
    pub fn new(config: RequestLimiterConfig) -> anyhow::Result<Self> {
        if config.max_concurrent == 0 {
            anyhow::bail!("max_concurrent must be at least 1");
        }
        Ok(Self {
            state: Arc::new(Mutex::new(LimiterState {
                active: 0,
                queue: VecDeque::new(),
                next_id: 0,
                total_requests: 0,
                queued: 0,
                rejected: 0,
                timed_out: 0,
                max_concurrent: config.max_concurrent,
                queue_size: config.queue_size,
            })),
            timeout: config.timeout,
        })
    }

    pub fn stats(&self) -> LimiterStats {
        let state = lock(&self.state);
        LimiterStats {
            total_requests: state.total_requests,
            queued: state.queued,
            rejected: state.rejected,
            timed_out: state.timed_out,
            active: state.active,
            queue_length: state.queue.len(),
            max_concurrent: state.max_concurrent,
            queue_size: state.queue_size,
        }
    }

    fn acquire(&self) -> Admission {
        let mut state = lock(&self.state);
        state.total_requests += 1;

        if state.active < state.max_concurrent {
            state.active += 1;
            return Admission::Admitted(Permit {
                state: Some(self.state.clone()),
            });
        }

        if state.queue.len() < state.queue_size {
            let id = state.next_id;
            state.next_id += 1;
            let (tx, rx) = oneshot::channel();
            state.queue.push_back(Waiter { id, admit: tx });
            state.queued += 1;
            tracing::debug!(
                active = state.active,
                queue_length = state.queue.len(),
                "at capacity, request queued"
            );
            return Admission::Queued {
                ticket: QueueTicket {
                    state: self.state.clone(),
                    id,
                    enqueued_at: Instant::now(),
                },
                admit: rx,
            };
        }

        state.rejected += 1;
        tracing::warn!(
            active = state.active,
            queue_length = state.queue.len(),
            "queue full, request rejected"
        );
        Admission::Rejected {
            active: state.active,
            queued: state.queue.len(),
        }
    }

    /// Wait for promotion. Exactly one of promotion or expiry wins: expiry
    /// only counts if the ticket is still in the queue.
    async fn wait(
        &self,
        ticket: QueueTicket,
        mut admit: oneshot::Receiver<Permit>,
    ) -> Result<Permit, Response<Body>> {
        // The deadline runs from enqueue, not from the first poll.
        let left = self.timeout.saturating_sub(ticket.enqueued_at.elapsed());
        match tokio::time::timeout(left, &mut admit).await {
            Ok(Ok(permit)) => return Ok(permit),
            Ok(Err(_)) => return Err(queue_timeout(ticket.enqueued_at.elapsed())),
            Err(_) => {}
        }

        let queued_for = ticket.enqueued_at.elapsed();
        let expired = {
            let mut state = lock(&self.state);
            let expired = state.remove_waiter(ticket.id);
            if expired {
                state.timed_out += 1;
            }
            expired
        };
        if expired {
            tracing::warn!(
                queued_for_ms = queued_for.as_millis() as u64,
                "queued request timed out"
            );
            return Err(queue_timeout(queued_for));
        }

        // Promoted between the deadline firing and taking the lock; the
        // permit is already on its way.
        admit.await.map_err(|_| queue_timeout(queued_for))
    }
}

fn queue_full(active: usize, queued: usize) -> Response<Body> {
    let body = QueueFull {
        error: "queue_full",
        message: format!(
            "Server is at capacity ({active} active, {queued} queued), please retry later"
        ),
        retry_after: QUEUE_FULL_RETRY_AFTER_SECS,
    };
    let mut resp = json_response(StatusCode::SERVICE_UNAVAILABLE, &body);
    resp.headers_mut().insert(
        http::header::RETRY_AFTER,
        QUEUE_FULL_RETRY_AFTER_SECS.into(),
    );
    resp
}

fn queue_timeout(queued_for: Duration) -> Response<Body> {
    let queued_for = queued_for.as_millis() as u64;
    let body = QueueTimeout {
        error: "queue_timeout",
        message: format!("Request timed out after waiting {queued_for}ms in queue"),
        queued_for,
    };
    json_response(StatusCode::GATEWAY_TIMEOUT, &body)
}

impl tower::Layer<HttpService> for RequestLimiter {
    type Service = RequestLimiterService;

    fn layer(&self, inner: HttpService) -> Self::Service {
        RequestLimiterService {
            inner: Arc::new(tokio::sync::Mutex::new(inner)),
            limiter: self.clone(),
        }
    }
}

pub struct RequestLimiterService {
    inner: Arc<tokio::sync::Mutex<HttpService>>,
    limiter: RequestLimiter,
}

impl Service<Request<Body>> for RequestLimiterService {
    type Response = Response<Body>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Response<Body>, BoxError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        // Admission is decided at call time so queue order is arrival order.
        let admission = self.limiter.acquire();
        let limiter = self.limiter.clone();
        let inner = self.inner.clone();

        Box::pin(async move {
            let permit = match admission {
                Admission::Admitted(permit) => permit,
                Admission::Rejected { active, queued } => return Ok(queue_full(active, queued)),
                Admission::Queued { ticket, admit } => match limiter.wait(ticket, admit).await {
                    Ok(permit) => permit,
                    Err(resp) => return Ok(resp),
                },
            };

            let fut = {
                let mut svc = inner.lock().await;
                svc.ready().await?;
                svc.call(req)
            };
            let resp = fut.await?;
            Ok(resp.map(|body| on_complete(body, move || drop(permit))))
        })
    }
}
