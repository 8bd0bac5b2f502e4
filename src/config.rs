use std::time::Duration;

use serde::Deserialize;

use crate::middleware::{
    CacheConfig, CachedResponse, CircuitBreaker, CircuitBreakerConfig, RequestLimiter,
    RequestLimiterConfig, ResponseCache, StatusEndpoint, TtlCache,
};
use crate::pool::PoolConfig;

/// Top-level server configuration, usually loaded from TOML.
///
/// ```toml
/// upstream = "http://127.0.0.1:3000"
/// port = 8080
///
/// [request_limiter]
/// max_concurrent = 50
/// queue_size = 100
/// timeout = "30s"
///
/// [circuit_breaker]
/// memory_threshold = 0.85
/// cooldown_period = "30s"
///
/// [cache]
/// ttl = "5m"
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct ServerConfig {
    /// Bind address, e.g. "127.0.0.1".
    pub bind: Option<String>,

    /// Listen port.
    pub port: Option<u16>,

    /// The API server requests are forwarded to, e.g. "http://127.0.0.1:3000".
    pub upstream: Option<String>,

    /// Path of the JSON status document. Default: "/health".
    pub status_path: Option<String>,

    #[serde(default)]
    pub pool: PoolSection,

    #[serde(default)]
    pub cache: CacheSection,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSection,

    #[serde(default)]
    pub request_limiter: RequestLimiterSection,
}

/// A single duration, deserialized from a string like `"10s"` or `"200ms"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurationValue(pub Duration);

impl<'de> Deserialize<'de> for DurationValue {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s)
            .map(DurationValue)
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    /// Max idle upstream connections (0 to disable pooling). Default: 8.
    pub max_idle: usize,
    /// Idle timeout for pooled connections. Default: 90s.
    pub idle_timeout: DurationValue,
}

impl Default for PoolSection {
    fn default() -> Self {
        let pool = PoolConfig::default();
        Self {
            max_idle: pool.max_idle,
            idle_timeout: DurationValue(pool.idle_timeout),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub enabled: bool,
    pub max_size: usize,
    pub ttl: DurationValue,
    pub sweep_interval: DurationValue,
    /// Largest response body kept in the cache. Default: 1 MiB.
    pub max_body_bytes: usize,
}

impl Default for CacheSection {
    fn default() -> Self {
        let cache = CacheConfig::default();
        Self {
            enabled: true,
            max_size: cache.max_size,
            ttl: DurationValue(cache.ttl),
            sweep_interval: DurationValue(cache.sweep_interval),
            max_body_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSection {
    pub enabled: bool,
    /// Usage ratio above which the circuit trips, in (0, 1].
    pub memory_threshold: f64,
    pub check_interval: DurationValue,
    pub cooldown_period: DurationValue,
    /// Memory budget in bytes. Default: total system memory.
    pub memory_limit: Option<u64>,
    /// Empty the response cache when the circuit trips. Default: true.
    pub clear_cache_on_trip: bool,
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        let breaker = CircuitBreakerConfig::default();
        Self {
            enabled: true,
            memory_threshold: breaker.memory_threshold,
            check_interval: DurationValue(breaker.check_interval),
            cooldown_period: DurationValue(breaker.cooldown_period),
            memory_limit: breaker.memory_limit,
            clear_cache_on_trip: true,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RequestLimiterSection {
    pub enabled: bool,
    pub max_concurrent: usize,
    pub queue_size: usize,
    pub timeout: DurationValue,
}

impl Default for RequestLimiterSection {
    fn default() -> Self {
        let limiter = RequestLimiterConfig::default();
        Self {
            enabled: true,
            max_concurrent: limiter.max_concurrent,
            queue_size: limiter.queue_size,
            timeout: DurationValue(limiter.timeout),
        }
    }
}

/// Parse `"250ms"`, `"30s"`, `"1.5s"` or `"5m"`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        let n: u64 = ms.parse().map_err(|e| format!("invalid duration: {e}"))?;
        Ok(Duration::from_millis(n))
    } else if let Some(secs) = s.strip_suffix('s') {
        let n: f64 = secs.parse().map_err(|e| format!("invalid duration: {e}"))?;
        Duration::try_from_secs_f64(n).map_err(|e| format!("invalid duration: {e}"))
    } else if let Some(mins) = s.strip_suffix('m') {
        let n: u64 = mins.parse().map_err(|e| format!("invalid duration: {e}"))?;
        let secs = n
            .checked_mul(60)
            .ok_or_else(|| format!("invalid duration: {s} is too large"))?;
        Ok(Duration::from_secs(secs))
    } else {
        Err(format!("expected duration like '200ms', '1s' or '5m', got '{s}'"))
    }
}

fn non_zero(name: &str, value: DurationValue) -> anyhow::Result<()> {
    if value.0.is_zero() {
        anyhow::bail!("{name} must be greater than zero");
    }
    Ok(())
}

/// Handles to the components a [`ServerConfig`] wired into the server.
///
/// Background work (cache sweeping, memory sampling) only runs after
/// [`Components::start`].
#[derive(Clone, Default)]
pub struct Components {
    pub cache: Option<TtlCache<CachedResponse>>,
    pub circuit_breaker: Option<CircuitBreaker>,
    pub request_limiter: Option<RequestLimiter>,
}

impl Components {
    /// Start the cache sweeper and the memory sampler. Must be called within
    /// a tokio runtime.
    pub fn start(&self) {
        if let Some(cache) = &self.cache {
            cache.start_sweeper();
        }
        if let Some(breaker) = &self.circuit_breaker {
            breaker.start();
        }
    }

    pub fn stop(&self) {
        if let Some(cache) = &self.cache {
            cache.stop();
        }
        if let Some(breaker) = &self.circuit_breaker {
            breaker.stop();
        }
    }
}

impl ServerConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Load config from a TOML file.
    pub fn from_toml_file(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// `bind:port`, defaulting to `127.0.0.1:8080`.
    pub fn listen_addr(&self) -> String {
        let bind = self.bind.as_deref().unwrap_or("127.0.0.1");
        let port = self.port.unwrap_or(8080);
        format!("{bind}:{port}")
    }

    /// Build a [`ServerBuilder`](crate::ServerBuilder) with the status
    /// endpoint, request limiter, circuit breaker and response cache layered
    /// in that order in front of the upstream.
    pub fn into_builder(self) -> anyhow::Result<(crate::ServerBuilder, Components)> {
        let upstream = self
            .upstream
            .ok_or_else(|| anyhow::anyhow!("no upstream configured"))?;

        let cache = if self.cache.enabled {
            let section = &self.cache;
            if section.max_size == 0 {
                anyhow::bail!("cache max_size must be at least 1");
            }
            non_zero("cache sweep_interval", section.sweep_interval)?;
            Some(TtlCache::new(CacheConfig {
                max_size: section.max_size,
                ttl: section.ttl.0,
                sweep_interval: section.sweep_interval.0,
            }))
        } else {
            None
        };

        let circuit_breaker = if self.circuit_breaker.enabled {
            let section = self.circuit_breaker;
            if !(section.memory_threshold > 0.0 && section.memory_threshold <= 1.0) {
                anyhow::bail!(
                    "memory_threshold must be in (0, 1], got {}",
                    section.memory_threshold
                );
            }
            non_zero("circuit_breaker check_interval", section.check_interval)?;
            non_zero("circuit_breaker cooldown_period", section.cooldown_period)?;
            let mut breaker = CircuitBreaker::new(CircuitBreakerConfig {
                memory_threshold: section.memory_threshold,
                check_interval: section.check_interval.0,
                cooldown_period: section.cooldown_period.0,
                memory_limit: section.memory_limit,
            });
            if let Some(cache) = cache.clone().filter(|_| section.clear_cache_on_trip) {
                breaker = breaker.on_trip(move || {
                    let dropped = cache.len();
                    cache.clear();
                    tracing::info!(dropped, "cleared response cache under memory pressure");
                });
            }
            Some(breaker)
        } else {
            None
        };

        let request_limiter = if self.request_limiter.enabled {
            Some(RequestLimiter::new(RequestLimiterConfig {
                max_concurrent: self.request_limiter.max_concurrent,
                queue_size: self.request_limiter.queue_size,
                timeout: self.request_limiter.timeout.0,
            })?)
        } else {
            None
        };

        let mut status =
            StatusEndpoint::new(self.status_path.unwrap_or_else(|| "/health".to_string()));
        if let Some(cache) = &cache {
            status = status.cache(cache);
        }
        if let Some(breaker) = &circuit_breaker {
            status = status.circuit_breaker(breaker);
        }
        if let Some(limiter) = &request_limiter {
            status = status.request_limiter(limiter);
        }

        let mut builder = crate::Server::builder()
            .pool(PoolConfig {
                max_idle: self.pool.max_idle,
                idle_timeout: self.pool.idle_timeout.0,
            })
            .http_layer(status);
        if let Some(limiter) = &request_limiter {
            builder = builder.http_layer(limiter.clone());
        }
        if let Some(breaker) = &circuit_breaker {
            builder = builder.http_layer(breaker.clone());
        }
        if let Some(cache) = &cache {
            builder = builder.http_layer(
                ResponseCache::new(cache.clone()).max_body_bytes(self.cache.max_body_bytes),
            );
        }
        builder = builder.upstream(upstream);

        Ok((
            builder,
            Components {
                cache,
                circuit_breaker,
                request_limiter,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_fixed_millis() {
        assert_eq!(parse_duration("200ms").unwrap(), Duration::from_millis(200));
    }

    #[test]
    fn parse_fixed_seconds() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn parse_fractional_seconds() {
        assert_eq!(parse_duration("2.5s").unwrap(), Duration::from_secs_f64(2.5));
    }

    #[test]
    fn parse_minutes() {
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
    }

    #[test]
    fn parse_invalid() {
        assert!(parse_duration("foo").is_err());
        assert!(parse_duration("200").is_err());
        assert!(parse_duration("-1s").is_err());
    }

    #[test]
    fn parse_rejects_overflowing_minutes() {
        let err = parse_duration(&format!("{}m", u64::MAX)).unwrap_err();
        assert!(err.contains("invalid duration"), "{err}");
    }

    #[test]
    fn deserialize_full_config() {
        let toml = r#"
            bind = "0.0.0.0"
            port = 9090
            upstream = "http://127.0.0.1:3000"
            status_path = "/status"

            [pool]
            max_idle = 16
            idle_timeout = "120s"

            [cache]
            max_size = 500
            ttl = "5m"
            sweep_interval = "30s"
            max_body_bytes = 65536

            [circuit_breaker]
            memory_threshold = 0.9
            check_interval = "1s"
            cooldown_period = "10s"
            memory_limit = 536870912
            clear_cache_on_trip = false

            [request_limiter]
            max_concurrent = 20
            queue_size = 40
            timeout = "500ms"
        "#;

        let config = ServerConfig::from_toml(toml).unwrap();

        assert_eq!(config.listen_addr(), "0.0.0.0:9090");
        assert_eq!(config.upstream.as_deref(), Some("http://127.0.0.1:3000"));
        assert_eq!(config.status_path.as_deref(), Some("/status"));

        assert_eq!(config.pool.max_idle, 16);
        assert_eq!(config.pool.idle_timeout.0, Duration::from_secs(120));

        assert!(config.cache.enabled);
        assert_eq!(config.cache.max_size, 500);
        assert_eq!(config.cache.ttl.0, Duration::from_secs(300));
        assert_eq!(config.cache.sweep_interval.0, Duration::from_secs(30));
        assert_eq!(config.cache.max_body_bytes, 65536);

        let cb = &config.circuit_breaker;
        assert!((cb.memory_threshold - 0.9).abs() < f64::EPSILON);
        assert_eq!(cb.check_interval.0, Duration::from_secs(1));
        assert_eq!(cb.cooldown_period.0, Duration::from_secs(10));
        assert_eq!(cb.memory_limit, Some(512 * 1024 * 1024));
        assert!(!cb.clear_cache_on_trip);

        let rl = &config.request_limiter;
        assert_eq!(rl.max_concurrent, 20);
        assert_eq!(rl.queue_size, 40);
        assert_eq!(rl.timeout.0, Duration::from_millis(500));
    }

    #[test]
    fn deserialize_minimal_config() {
        let config = ServerConfig::from_toml("").unwrap();
        assert!(config.upstream.is_none());
        assert_eq!(config.listen_addr(), "127.0.0.1:8080");
        assert!(config.cache.enabled);
        assert_eq!(config.cache.max_size, 100);
        assert_eq!(config.cache.ttl.0, Duration::from_secs(300));
        assert!((config.circuit_breaker.memory_threshold - 0.85).abs() < f64::EPSILON);
        assert_eq!(config.circuit_breaker.check_interval.0, Duration::from_secs(5));
        assert_eq!(config.circuit_breaker.cooldown_period.0, Duration::from_secs(30));
        assert_eq!(config.request_limiter.max_concurrent, 50);
        assert_eq!(config.request_limiter.queue_size, 100);
        assert_eq!(config.request_limiter.timeout.0, Duration::from_secs(30));
    }

    #[test]
    fn rejects_bad_duration() {
        let err = ServerConfig::from_toml("[request_limiter]\ntimeout = \"soon\"").unwrap_err();
        assert!(err.to_string().contains("duration"), "{err}");
    }

    #[test]
    fn into_builder_wires_every_component() {
        let config = ServerConfig {
            upstream: Some("http://127.0.0.1:3000".to_string()),
            ..Default::default()
        };
        let (builder, components) = config.into_builder().unwrap();
        assert!(builder.build().is_ok());
        assert!(components.cache.is_some());
        assert!(components.circuit_breaker.is_some());
        assert!(components.request_limiter.is_some());
    }

    #[test]
    fn into_builder_skips_disabled_components() {
        let config = ServerConfig::from_toml(
            r#"
            upstream = "http://127.0.0.1:3000"
            [cache]
            enabled = false
            [circuit_breaker]
            enabled = false
            "#,
        )
        .unwrap();
        let (_, components) = config.into_builder().unwrap();
        assert!(components.cache.is_none());
        assert!(components.circuit_breaker.is_none());
        assert!(components.request_limiter.is_some());
    }

    #[test]
    fn into_builder_requires_upstream() {
        assert!(ServerConfig::default().into_builder().is_err());
    }

    #[test]
    fn into_builder_validates_limits() {
        let mut config = ServerConfig {
            upstream: Some("http://127.0.0.1:3000".to_string()),
            ..Default::default()
        };
        config.circuit_breaker.memory_threshold = 1.5;
        assert!(config.into_builder().is_err());

        let mut config = ServerConfig {
            upstream: Some("http://127.0.0.1:3000".to_string()),
            ..Default::default()
        };
        config.request_limiter.max_concurrent = 0;
        assert!(config.into_builder().is_err());

        let config = ServerConfig::from_toml(
            r#"
            upstream = "http://127.0.0.1:3000"
            [circuit_breaker]
            check_interval = "0ms"
            "#,
        )
        .unwrap();
        let err = config.into_builder().err().unwrap();
        assert!(err.to_string().contains("check_interval"), "{err}");

        let mut config = ServerConfig {
            upstream: Some("http://127.0.0.1:3000".to_string()),
            ..Default::default()
        };
        config.circuit_breaker.cooldown_period = DurationValue(Duration::ZERO);
        assert!(config.into_builder().is_err());

        let config = ServerConfig::from_toml(
            r#"
            upstream = "http://127.0.0.1:3000"
            [cache]
            sweep_interval = "0s"
            "#,
        )
        .unwrap();
        let err = config.into_builder().err().unwrap();
        assert!(err.to_string().contains("sweep_interval"), "{err}");

        let mut config = ServerConfig {
            upstream: Some("http://127.0.0.1:3000".to_string()),
            ..Default::default()
        };
        config.cache.max_size = 0;
        let err = config.into_builder().err().unwrap();
        assert!(err.to_string().contains("max_size"), "{err}");
    }

    #[test]
    fn disabled_components_skip_validation() {
        let config = ServerConfig::from_toml(
            r#"
            upstream = "http://127.0.0.1:3000"
            [cache]
            enabled = false
            sweep_interval = "0s"
            [circuit_breaker]
            enabled = false
            check_interval = "0ms"
            "#,
        )
        .unwrap();
        assert!(config.into_builder().is_ok());
    }
}
