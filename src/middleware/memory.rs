use std::sync::{Mutex, PoisonError};

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// One reading of process memory, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemorySnapshot {
    /// Memory the process is using against its budget.
    pub heap_used: u64,
    /// The budget `heap_used` is measured against.
    pub heap_total: u64,
    /// Resident set size.
    pub rss: u64,
    /// Mapped but non-resident memory.
    pub external: u64,
}

impl MemorySnapshot {
    /// `heap_used / heap_total`, or `0.0` when the total is unknown.
    pub fn usage_ratio(&self) -> f64 {
        if self.heap_total == 0 {
            0.0
        } else {
            self.heap_used as f64 / self.heap_total as f64
        }
    }

    /// Usage as a percentage rounded to one decimal.
    pub fn usage_percent(&self) -> f64 {
        (self.usage_ratio() * 1000.0).round() / 10.0
    }
}

/// Round a byte count to whole megabytes.
pub fn to_mb(bytes: u64) -> u64 {
    (bytes as f64 / BYTES_PER_MB).round() as u64
}

/// Source of memory readings for the
/// [`CircuitBreaker`](super::CircuitBreaker).
///
/// Any `Fn() -> MemorySnapshot` closure is a probe, which is how tests feed
/// the breaker synthetic pressure.
pub trait MemoryProbe: Send + Sync + 'static {
    fn sample(&self) -> MemorySnapshot;
}

impl<F> MemoryProbe for F
where
    F: Fn() -> MemorySnapshot + Send + Sync + 'static,
{
    fn sample(&self) -> MemorySnapshot {
        self()
    }
}

/// Probe backed by `sysinfo`.
///
/// Reports the current process's resident memory as `heap_used`, measured
/// against an explicit limit when one is configured (for example a container
/// memory limit) and against total system memory otherwise.
pub struct SystemMemoryProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
    limit: Option<u64>,
}

impl SystemMemoryProbe {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                tracing::warn!(error = e, "cannot resolve own pid, process memory reads as zero");
                None
            }
        };
        Self {
            system: Mutex::new(System::new()),
            pid,
            limit: None,
        }
    }

    /// Measure usage against `bytes` instead of total system memory.
    pub fn with_limit(mut self, bytes: u64) -> Self {
        self.limit = Some(bytes);
        self
    }
}

impl Default for SystemMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn sample(&self) -> MemorySnapshot {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        let heap_total = match self.limit {
            Some(limit) => limit,
            None => {
                system.refresh_memory();
                system.total_memory()
            }
        };
        let (rss, virtual_memory) = match self.pid {
            Some(pid) => {
                system.refresh_processes_specifics(
                    ProcessesToUpdate::Some(&[pid]),
                    true,
                    ProcessRefreshKind::nothing().with_memory(),
                );
                system
                    .process(pid)
                    .map(|p| (p.memory(), p.virtual_memory()))
                    .unwrap_or_default()
            }
            None => (0, 0),
        };
        MemorySnapshot {
            heap_used: rss,
            heap_total,
            rss,
            external: virtual_memory.saturating_sub(rss),
        }
    }
}
