mod cache;
mod circuit_breaker;
mod memory;
mod request_limiter;
mod response_cache;
mod status;

pub use cache::{CacheConfig, CacheStats, TtlCache};
pub use circuit_breaker::{BreakerStatus, CircuitBreaker, CircuitBreakerConfig, MemoryStatus};
pub use memory::{MemoryProbe, MemorySnapshot, SystemMemoryProbe};
pub use request_limiter::{LimiterStats, RequestLimiter, RequestLimiterConfig};
pub use response_cache::{CachedResponse, ResponseCache};
pub use status::{StatusEndpoint, StatusReport};
