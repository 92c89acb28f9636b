//! Persistent configuration for sinks and pipeline stages.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::codec::CompressionConfig;
use crate::error::Result;
use crate::resource::TuningProfile;

const MB: usize = 1024 * 1024;

// ── SinkConfig ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkConfig {
    pub compression: CompressionConfig,
    /// fsync the file on close.
    pub sync_on_close: bool,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            compression: CompressionConfig::default(),
            sync_on_close: false,
        }
    }
}

// ── PipelineConfig ──────────────────────────────────────────────────

/// Budgets for the threaded and buffering stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub prefetch_max_bytes: usize,
    pub parallel_threads: usize,
    /// Output queue budget of a parallel filter.
    pub parallel_queue_bytes: usize,
    pub sort_memory_limit: usize,
    /// Largest output extent a sort emits; 0 emits everything as one extent.
    pub sort_extent_size_limit: usize,
    /// Compress spilled sort runs.
    pub sort_compress_temp: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_tuning(&TuningProfile::default())
    }
}

impl PipelineConfig {
    pub fn from_tuning(profile: &TuningProfile) -> Self {
        Self {
            prefetch_max_bytes: profile.prefetch_max_bytes,
            parallel_threads: profile.worker_threads,
            parallel_queue_bytes: profile.prefetch_max_bytes,
            sort_memory_limit: profile.sort_memory_limit,
            sort_extent_size_limit: 8 * MB,
            sort_compress_temp: true,
        }
    }

    /// Read config from `path`. Returns None if the file doesn't exist.
    pub fn read_from(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        Ok(Some(config))
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
