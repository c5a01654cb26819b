//! Configuration for the indexing manager and its tasks.

use std::path::PathBuf;

use aumeta_core::defaults;

/// Configuration for the indexing manager.
#[derive(Debug, Clone)]
pub struct IndexerConfig {
    /// Whether pending AUs are admitted at all.
    pub enabled: bool,
    /// Maximum number of tasks active at once, removals included.
    pub max_reindexing_tasks: usize,
    /// Units of work requested from a task per scheduler turn.
    pub steps_per_call: usize,
    /// Directory holding spill buffers.
    pub spill_dir: PathBuf,
    /// Admit AUs that were never indexed ahead of older ones.
    pub prioritize_new_aus: bool,
    /// Finished task snapshots kept for status surfaces.
    pub history_max: usize,
    /// Pending entries read per admission pass.
    pub pending_batch: i64,
    /// How often the pending queue is rescanned while idle.
    pub poll_interval_ms: u64,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_reindexing_tasks: defaults::MAX_REINDEXING_TASKS,
            steps_per_call: defaults::STEPS_PER_CALL,
            spill_dir: std::env::temp_dir(),
            prioritize_new_aus: true,
            history_max: defaults::HISTORY_MAX,
            pending_batch: defaults::PENDING_BATCH,
            poll_interval_ms: defaults::ADMISSION_POLL_INTERVAL_MS,
        }
    }
}

impl IndexerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `METADATA_INDEXING_ENABLED` | `true` | Enable/disable admission of pending AUs |
    /// | `METADATA_MAX_REINDEXING_TASKS` | `1` | Concurrent reindexing tasks |
    /// | `METADATA_STEPS_PER_CALL` | `10` | Articles processed per scheduler turn |
    /// | `METADATA_SPILL_DIR` | system temp dir | Where spill buffers are written |
    /// | `METADATA_PRIORITIZE_NEW_AUS` | `true` | Index never-indexed AUs first |
    /// | `METADATA_HISTORY_MAX` | `200` | Finished tasks kept for inspection |
    /// | `METADATA_PENDING_BATCH` | `1000` | Pending entries scanned per admission |
    /// | `METADATA_POLL_INTERVAL_MS` | `5000` | Pending-queue rescan interval |
    pub fn from_env() -> Self {
        let base = Self::default();

        let enabled = std::env::var("METADATA_INDEXING_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(base.enabled);

        let max_reindexing_tasks = std::env::var("METADATA_MAX_REINDEXING_TASKS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(base.max_reindexing_tasks)
            .max(1);

        let steps_per_call = std::env::var("METADATA_STEPS_PER_CALL")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(base.steps_per_call)
            .max(1);

        let spill_dir = std::env::var("METADATA_SPILL_DIR")
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or(base.spill_dir);

        let prioritize_new_aus = std::env::var("METADATA_PRIORITIZE_NEW_AUS")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(base.prioritize_new_aus);

        let history_max = std::env::var("METADATA_HISTORY_MAX")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(base.history_max);

        let pending_batch = std::env::var("METADATA_PENDING_BATCH")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(base.pending_batch);

        let poll_interval_ms = std::env::var("METADATA_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(base.poll_interval_ms);

        Self {
            enabled,
            max_reindexing_tasks,
            steps_per_call,
            spill_dir,
            prioritize_new_aus,
            history_max,
            pending_batch,
            poll_interval_ms,
        }
    }

    /// Enable or disable admission.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the number of concurrent reindexing tasks.
    pub fn with_max_reindexing_tasks(mut self, max: usize) -> Self {
        self.max_reindexing_tasks = max.max(1);
        self
    }

    pub fn with_steps_per_call(mut self, steps: usize) -> Self {
        self.steps_per_call = steps.max(1);
        self
    }

    pub fn with_spill_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spill_dir = dir.into();
        self
    }

    pub fn with_prioritize_new_aus(mut self, prioritize: bool) -> Self {
        self.prioritize_new_aus = prioritize;
        self
    }

    pub fn with_history_max(mut self, max: usize) -> Self {
        self.history_max = max;
        self
    }

    /// Set the pending-queue rescan interval.
    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }
}
