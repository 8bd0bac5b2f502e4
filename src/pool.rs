use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::http::Body;

type Sender = hyper::client::conn::http1::SendRequest<Body>;

/// Limits for idle upstream connections.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_idle: usize,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: 8,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

struct IdleHttp1 {
    sender: Sender,
    idle_since: Instant,
}

struct PoolInner {
    idle: Vec<IdleHttp1>,
    config: PoolConfig,
}

/// Idle HTTP/1.1 connections to the upstream API server.
///
/// Connections are handed out LIFO so the most recently used (and least
/// likely to have been closed by the upstream) is reused first.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<Mutex<PoolInner>>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolInner {
                idle: Vec::new(),
                config,
            })),
        }
    }

    pub(crate) fn checkout(&self) -> Option<Sender> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let timeout = inner.config.idle_timeout;
        while let Some(idle) = inner.idle.pop() {
            if idle.idle_since.elapsed() < timeout && !idle.sender.is_closed() {
                return Some(idle.sender);
            }
        }
        None
    }

    pub(crate) fn checkin(&self, sender: Sender) {
        if sender.is_closed() || !sender.is_ready() {
            return;
        }
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.idle.len() < inner.config.max_idle {
            inner.idle.push(IdleHttp1 {
                sender,
                idle_since: Instant::now(),
            });
        }
    }

    /// Number of idle connections currently held.
    pub fn idle_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .idle
            .len()
    }
}
