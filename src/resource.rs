//! System resource detection and adaptive pipeline tuning.
//!
//! Detects available RAM and CPU cores, then computes the memory budgets
//! and worker counts the pipeline stages default to. Stateless: each call
//! to `ResourceManager::auto_tune()` re-probes the system.

use sysinfo::{MemoryRefreshKind, RefreshKind, System};

// ── Constants ───────────────────────────────────────────────────────

const MB: usize = 1024 * 1024;
const GB: u64 = 1024 * 1024 * 1024;

/// Prefetch budget floor (8 MB).
const PREFETCH_MIN: usize = 8 * MB;

/// Prefetch budget ceiling (256 MB).
const PREFETCH_MAX: usize = 256 * MB;

/// Fraction of available memory buffered ahead of the consumer.
const PREFETCH_FRACTION: f64 = 0.01;

/// Sort memory floor (64 MB).
const SORT_MIN: usize = 64 * MB;

/// Sort memory ceiling (4 GB).
const SORT_MAX: usize = 4 * 1024 * MB;

/// Fraction of available memory a sort may hold before spilling.
const SORT_FRACTION: f64 = 0.10;

const MAX_WORKER_THREADS: usize = 16;

// ── SystemResources ─────────────────────────────────────────────────

/// Snapshot of detected hardware resources.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total physical RAM in bytes.
    pub total_memory_bytes: u64,
    /// Available (re-usable) RAM in bytes.
    pub available_memory_bytes: u64,
    /// Logical CPU count.
    pub cpu_count: usize,
}

impl SystemResources {
    /// Probe the current system for RAM and CPU information.
    pub fn detect() -> Self {
        let mut sys = System::new_with_specifics(
            RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
        );
        sys.refresh_memory();

        let cpu_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self {
            total_memory_bytes: sys.total_memory(),
            available_memory_bytes: sys.available_memory(),
            cpu_count,
        }
    }

    /// Memory pressure indicator (0.0 = no pressure, 1.0 = critical).
    pub fn memory_pressure(&self) -> f64 {
        if self.total_memory_bytes == 0 {
            return 1.0;
        }
        let ratio = self.available_memory_bytes as f64 / self.total_memory_bytes as f64;
        (1.0 - ratio).clamp(0.0, 1.0)
    }
}

// ── TuningProfile ───────────────────────────────────────────────────

/// Budgets computed from system resources.
#[derive(Debug, Clone)]
pub struct TuningProfile {
    /// Bytes a prefetch stage buffers ahead of its consumer.
    pub prefetch_max_bytes: usize,
    /// Bytes a sort holds in memory before spilling a run.
    pub sort_memory_limit: usize,
    /// Workers for parallel filtering.
    pub worker_threads: usize,
    /// Memory pressure at detection time.
    pub memory_pressure: f64,
}

impl TuningProfile {
    /// Heuristics:
    /// - `prefetch_max_bytes`: `clamp(available * 0.01, 8 MB, 256 MB)`.
    /// - `sort_memory_limit`: `clamp(available * 0.10, 64 MB, 4 GB)`.
    /// - `worker_threads`: `clamp(cpu_count, 1, 16)`.
    pub fn from_resources(res: &SystemResources) -> Self {
        let available = res.available_memory_bytes as f64;

        let prefetch_max_bytes =
            ((available * PREFETCH_FRACTION) as usize).clamp(PREFETCH_MIN, PREFETCH_MAX);
        let sort_memory_limit = ((available * SORT_FRACTION) as usize).clamp(SORT_MIN, SORT_MAX);
        let worker_threads = res.cpu_count.clamp(1, MAX_WORKER_THREADS);

        Self {
            prefetch_max_bytes,
            sort_memory_limit,
            worker_threads,
            memory_pressure: res.memory_pressure(),
        }
    }
}

impl Default for TuningProfile {
    /// Conservative defaults suitable for tests and unknown environments.
    fn default() -> Self {
        Self {
            prefetch_max_bytes: 64 * MB,
            sort_memory_limit: 256 * MB,
            worker_threads: 4,
            memory_pressure: 0.0,
        }
    }
}

// ── ResourceManager ─────────────────────────────────────────────────

/// Stateless utility: detect system resources and compute tuning profile.
pub struct ResourceManager;

impl ResourceManager {
    pub fn auto_tune() -> TuningProfile {
        let resources = SystemResources::detect();
        let profile = TuningProfile::from_resources(&resources);
        tracing::debug!(
            available = resources.available_memory_bytes,
            cpus = resources.cpu_count,
            prefetch = profile.prefetch_max_bytes,
            sort = profile.sort_memory_limit,
            threads = profile.worker_threads,
            "tuned pipeline budgets"
        );
        profile
    }
}

// ── Tests ───────────────────────────────────────────────────────────
