//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Elements handed to the GC worker in one batch.
pub const GC_BATCH_COUNT: usize = 256;

/// Tunables of one namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Expired elements per GC batch.
    pub gc_batch_size: usize,
    /// Scan period for timeout sets that do not declare their own.
    pub gc_interval_ms: u64,
    /// Run the periodic GC scanner thread.
    pub gc_worker: bool,
    /// Turn extension lookup misses into module requests.
    pub autoload: bool,
    /// Buffer of the broadcast notification channel.
    pub notify_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            gc_batch_size: GC_BATCH_COUNT,
            gc_interval_ms: 1000,
            gc_worker: true,
            autoload: true,
            notify_capacity: 1024,
        }
    }
}

impl EngineConfig {
    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms)
    }

    /// Parses a JSON configuration; missing fields keep their defaults.
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}
