use clap::Parser;
use specular_gate::config::{DurationValue, ServerConfig, parse_duration};

#[derive(Parser)]
#[command(
    name = "specular-gate",
    about = "Overload protection in front of the Specular lending API"
)]
struct Cli {
    /// Path to TOML config file
    #[arg(short, long)]
    config: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(long)]
    bind: Option<String>,

    /// API server to forward traffic to (e.g. "http://127.0.0.1:3000")
    #[arg(long)]
    upstream: Option<String>,

    /// Path of the JSON status document (default: /health)
    #[arg(long = "status-path")]
    status_path: Option<String>,

    /// Requests processed concurrently before queueing (default: 50)
    #[arg(long = "max-concurrent")]
    max_concurrent: Option<usize>,

    /// Requests allowed to wait for a slot (default: 100)
    #[arg(long = "queue-size")]
    queue_size: Option<usize>,

    /// Longest a request may wait in the queue (e.g. "30s")
    #[arg(long = "queue-timeout")]
    queue_timeout: Option<String>,

    /// Disable the request limiter
    #[arg(long = "no-request-limiter")]
    no_request_limiter: bool,

    /// Memory usage ratio that trips the circuit breaker (default: 0.85)
    #[arg(long = "memory-threshold")]
    memory_threshold: Option<f64>,

    /// Memory budget in bytes (default: total system memory)
    #[arg(long = "memory-limit")]
    memory_limit: Option<u64>,

    /// How often memory is sampled (e.g. "5s")
    #[arg(long = "check-interval")]
    check_interval: Option<String>,

    /// How long the circuit stays open after tripping (e.g. "30s")
    #[arg(long = "cooldown")]
    cooldown: Option<String>,

    /// Disable the memory circuit breaker
    #[arg(long = "no-circuit-breaker")]
    no_circuit_breaker: bool,

    /// Response cache TTL (e.g. "5m")
    #[arg(long = "cache-ttl")]
    cache_ttl: Option<String>,

    /// Maximum number of cached responses (default: 100)
    #[arg(long = "cache-max-size")]
    cache_max_size: Option<usize>,

    /// Disable the response cache
    #[arg(long = "no-cache")]
    no_cache: bool,

    /// Max idle connections in the upstream pool (default: 8, 0 to disable)
    #[arg(long = "pool-max-idle")]
    pool_max_idle: Option<usize>,

    /// Idle timeout for pooled upstream connections (e.g. "90s")
    #[arg(long = "pool-idle-timeout")]
    pool_idle_timeout: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("specular_gate=info"));
    let span_events = tracing_subscriber::fmt::format::FmtSpan::CLOSE;
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_span_events(span_events)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_span_events(span_events)
            .init();
    }

    // Load config file or start with defaults
    let mut config = if let Some(ref path) = cli.config {
        ServerConfig::from_toml_file(path)?
    } else {
        ServerConfig::default()
    };

    // CLI overrides
    if cli.port.is_some() {
        config.port = cli.port;
    }
    if cli.bind.is_some() {
        config.bind = cli.bind;
    }
    if cli.upstream.is_some() {
        config.upstream = cli.upstream;
    }
    if cli.status_path.is_some() {
        config.status_path = cli.status_path;
    }

    if let Some(max) = cli.max_concurrent {
        config.request_limiter.max_concurrent = max;
    }
    if let Some(size) = cli.queue_size {
        config.request_limiter.queue_size = size;
    }
    if let Some(ref timeout) = cli.queue_timeout {
        config.request_limiter.timeout = duration_arg("queue-timeout", timeout)?;
    }
    if cli.no_request_limiter {
        config.request_limiter.enabled = false;
    }

    if let Some(threshold) = cli.memory_threshold {
        config.circuit_breaker.memory_threshold = threshold;
    }
    if cli.memory_limit.is_some() {
        config.circuit_breaker.memory_limit = cli.memory_limit;
    }
    if let Some(ref interval) = cli.check_interval {
        config.circuit_breaker.check_interval = duration_arg("check-interval", interval)?;
    }
    if let Some(ref cooldown) = cli.cooldown {
        config.circuit_breaker.cooldown_period = duration_arg("cooldown", cooldown)?;
    }
    if cli.no_circuit_breaker {
        config.circuit_breaker.enabled = false;
    }

    if let Some(ref ttl) = cli.cache_ttl {
        config.cache.ttl = duration_arg("cache-ttl", ttl)?;
    }
    if let Some(size) = cli.cache_max_size {
        config.cache.max_size = size;
    }
    if cli.no_cache {
        config.cache.enabled = false;
    }

    if let Some(max) = cli.pool_max_idle {
        config.pool.max_idle = max;
    }
    if let Some(ref timeout) = cli.pool_idle_timeout {
        config.pool.idle_timeout = duration_arg("pool-idle-timeout", timeout)?;
    }

    let listen = config.listen_addr();
    let (builder, components) = config.into_builder()?;
    let server = builder.build()?;
    components.start();

    let result = server
        .listen_with_shutdown(&listen, async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await;
    components.stop();
    result
}

fn duration_arg(flag: &str, value: &str) -> anyhow::Result<DurationValue> {
    parse_duration(value)
        .map(DurationValue)
        .map_err(|e| anyhow::anyhow!("invalid {flag}: {e}"))
}
