use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use http::{Request, Response, StatusCode};
use serde::Serialize;
use tokio::time::{Instant, MissedTickBehavior};
use tower::Service;

use super::memory::{MemoryProbe, MemorySnapshot, SystemMemoryProbe, to_mb};
use crate::http::{Body, BoxError, HttpService, json_response};
use crate::task::TaskSlot;

pub const DEFAULT_MEMORY_THRESHOLD: f64 = 0.85;
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_COOLDOWN_PERIOD: Duration = Duration::from_secs(30);
/// Shortest sampling period; smaller values are raised to it.
pub const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(1);

type ReliefHook = Arc<dyn Fn() + Send + Sync>;

/// Settings for a [`CircuitBreaker`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Usage ratio above which the circuit opens, in `(0, 1]`.
    pub memory_threshold: f64,
    /// How often the sampler reads memory. At least [`MIN_CHECK_INTERVAL`].
    pub check_interval: Duration,
    /// How long the circuit stays open after a trip.
    pub cooldown_period: Duration,
    /// Memory budget in bytes for the default probe. `None` measures against
    /// total system memory.
    pub memory_limit: Option<u64>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            memory_threshold: DEFAULT_MEMORY_THRESHOLD,
            check_interval: DEFAULT_CHECK_INTERVAL,
            cooldown_period: DEFAULT_COOLDOWN_PERIOD,
            memory_limit: None,
        }
    }
}

/// Observability snapshot returned by [`CircuitBreaker::status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerStatus {
    pub is_open: bool,
    pub trip_count: u64,
    pub last_trip_ago_ms: Option<u64>,
    pub memory: MemoryStatus,
}

/// Memory figures in MB plus usage percentage.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStatus {
    pub heap_used: u64,
    pub heap_total: u64,
    pub rss: u64,
    pub external: u64,
    pub usage_percent: f64,
}

impl From<MemorySnapshot> for MemoryStatus {
    fn from(s: MemorySnapshot) -> Self {
        Self {
            heap_used: to_mb(s.heap_used),
            heap_total: to_mb(s.heap_total),
            rss: to_mb(s.rss),
            external: to_mb(s.external),
            usage_percent: s.usage_percent(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PressureRejection {
    error: &'static str,
    message: String,
    memory_usage: MemoryUsage,
    retry_after: u64,
}

#[derive(Serialize)]
struct MemoryUsage {
    used: u64,
    total: u64,
    percent: f64,
}

enum State {
    Closed,
    Open { until: Instant },
}

struct BreakerState {
    state: State,
    trip_count: u64,
    last_trip: Option<Instant>,
    last_sample: MemorySnapshot,
    threshold: f64,
    cooldown: Duration,
}

impl BreakerState {
    fn new(threshold: f64, cooldown: Duration) -> Self {
        Self {
            state: State::Closed,
            trip_count: 0,
            last_trip: None,
            last_sample: MemorySnapshot::default(),
            threshold,
            cooldown,
        }
    }

    /// Close the circuit if its cooldown has run out.
    fn refresh(&mut self, now: Instant) {
        if let State::Open { until } = self.state {
            if now >= until {
                self.state = State::Closed;
                tracing::info!(trip_count = self.trip_count, "cooldown elapsed, circuit closed");
            }
        }
    }

    /// Remaining cooldown, or `None` while closed.
    fn remaining(&mut self, now: Instant) -> Option<Duration> {
        self.refresh(now);
        match self.state {
            State::Open { until } => Some(until - now),
            State::Closed => None,
        }
    }

    /// Record a sample and trip if it crosses the threshold while closed.
    /// Returns the close deadline when this sample opened the circuit.
    fn observe(&mut self, snapshot: MemorySnapshot, now: Instant) -> Option<Instant> {
        self.last_sample = snapshot;
        self.refresh(now);
        if !matches!(self.state, State::Closed) || snapshot.usage_ratio() <= self.threshold {
            return None;
        }
        let until = now + self.cooldown;
        self.state = State::Open { until };
        self.trip_count += 1;
        self.last_trip = Some(now);
        tracing::warn!(
            usage_percent = snapshot.usage_percent(),
            heap_used_mb = to_mb(snapshot.heap_used),
            heap_total_mb = to_mb(snapshot.heap_total),
            trip_count = self.trip_count,
            cooldown_ms = self.cooldown.as_millis() as u64,
            "memory pressure detected, circuit opened"
        );
        Some(until)
    }
}

struct Shared {
    state: Mutex<BreakerState>,
    probe: Arc<dyn MemoryProbe>,
    relief: Mutex<Option<ReliefHook>>,
    check_interval: Duration,
    monitor: TaskSlot,
    closer: TaskSlot,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Tower layer that sheds load while the process is under memory pressure.
///
/// A background sampler reads memory every `check_interval`. When usage
/// crosses `memory_threshold` the circuit opens and every request is answered
/// with `503 Service Unavailable` and a JSON body describing memory usage and
/// how many seconds remain before retrying. The usage reported there is the
/// latest sample, at most one `check_interval` old; rejections do not read
/// memory themselves. [`status`](Self::status) always takes a fresh sample.
/// The circuit closes exactly
/// `cooldown_period` after the trip; memory is not re-checked at that moment,
/// so a process that is still under pressure re-trips on the next sample.
///
/// Cheaply cloneable; clones share one circuit. Call [`start`](Self::start)
/// to begin sampling.
///
/// # Examples
///
/// ```rust,no_run
/// use specular_gate::Server;
/// use specular_gate::middleware::{CircuitBreaker, CircuitBreakerConfig};
///
/// # async fn run() -> anyhow::Result<()> {
/// let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
/// breaker.start();
/// let server = Server::builder()
///     .http_layer(breaker)
///     .upstream("http://127.0.0.1:3000")
///     .build()?;
/// server.listen("127.0.0.1:8080").await
/// # }
/// ```
#[derive(Clone)]
pub struct CircuitBreaker {
    shared: Arc<Shared>,
}

impl CircuitBreaker {
    /// Breaker sampling this process through [`SystemMemoryProbe`].
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let mut probe = SystemMemoryProbe::new();
        if let Some(limit) = config.memory_limit {
            probe = probe.with_limit(limit);
        }
        Self::with_probe(config, probe)
    }

    /// Breaker reading memory from a custom probe.
    pub fn with_probe(config: CircuitBreakerConfig, probe: impl MemoryProbe) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BreakerState::new(
                    config.memory_threshold,
                    config.cooldown_period,
                )),
                probe: Arc::new(probe),
                relief: Mutex::new(None),
                check_interval: config.check_interval.max(MIN_CHECK_INTERVAL),
                monitor: TaskSlot::default(),
                closer: TaskSlot::default(),
            }),
        }
    }

    /// Run `f` every time the circuit trips, to give memory back (for
    /// example by clearing caches).
    pub fn on_trip(self, f: impl Fn() + Send + Sync + 'static) -> Self {
        *self
            .shared
            .relief
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(f));
        self
    }

    /// Start the periodic sampler. Must be called within a tokio runtime.
    pub fn start(&self) {
        let weak = Arc::downgrade(&self.shared);
        let period = self.shared.check_interval;
        self.shared.monitor.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                CircuitBreaker { shared }.check_now();
            }
        });
    }

    /// Stop sampling and cancel the pending close timer. An open circuit
    /// still closes once its cooldown has elapsed.
    pub fn stop(&self) {
        self.shared.monitor.stop();
        self.shared.closer.stop();
    }

    /// Take one memory sample and apply it, as the sampler does on each tick.
    pub fn check_now(&self) {
        let snapshot = self.shared.probe.sample();
        let opened_until = self.shared.lock().observe(snapshot, Instant::now());
        let Some(until) = opened_until else {
            return;
        };
        self.schedule_close(until);
        let relief = self
            .shared
            .relief
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(relief) = relief {
            relief();
        }
    }

    fn schedule_close(&self, until: Instant) {
        if tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        let weak = Arc::downgrade(&self.shared);
        self.shared.closer.spawn(async move {
            tokio::time::sleep_until(until).await;
            if let Some(shared) = weak.upgrade() {
                shared.lock().refresh(Instant::now());
            }
        });
    }

    pub fn is_open(&self) -> bool {
        self.shared.lock().remaining(Instant::now()).is_some()
    }

    /// Current circuit state with a fresh memory reading.
    pub fn status(&self) -> BreakerStatus {
        let snapshot = self.shared.probe.sample();
        let now = Instant::now();
        let mut state = self.shared.lock();
        state.last_sample = snapshot;
        BreakerStatus {
            is_open: state.remaining(now).is_some(),
            trip_count: state.trip_count,
            last_trip_ago_ms: state
                .last_trip
                .map(|t| now.saturating_duration_since(t).as_millis() as u64),
            memory: snapshot.into(),
        }
    }

    /// The 503 to send if the circuit is open right now.
    fn rejection(&self) -> Option<Response<Body>> {
        let (remaining, sample) = {
            let mut state = self.shared.lock();
            (state.remaining(Instant::now())?, state.last_sample)
        };
        let retry_after = remaining.as_millis().div_ceil(1000).max(1) as u64;
        let body = PressureRejection {
            error: "memory_pressure",
            message: "Server is under memory pressure, please retry later".to_string(),
            memory_usage: MemoryUsage {
                used: to_mb(sample.heap_used),
                total: to_mb(sample.heap_total),
                percent: sample.usage_percent(),
            },
            retry_after,
        };
        let mut resp = json_response(StatusCode::SERVICE_UNAVAILABLE, &body);
        resp.headers_mut()
            .insert(http::header::RETRY_AFTER, retry_after.into());
        Some(resp)
    }
}

impl tower::Layer<HttpService> for CircuitBreaker {
    type Service = CircuitBreakerService;

    fn layer(&self, inner: HttpService) -> Self::Service {
        CircuitBreakerService {
            inner,
            breaker: self.clone(),
        }
    }
}

pub struct CircuitBreakerService {
    inner: HttpService,
    breaker: CircuitBreaker,
}

impl Service<Request<Body>> for CircuitBreakerService {
    type Response = Response<Body>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Response<Body>, BoxError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        match self.breaker.rejection() {
            Some(resp) => {
                tracing::debug!(path = %req.uri().path(), "rejected by open circuit");
                Box::pin(async move { Ok(resp) })
            }
            None => self.inner.call(req),
        }
    }
}
