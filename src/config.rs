//! Scheduler configuration.

use std::collections::HashMap;
use std::time::Duration;

/// Tunables for the background task scheduler. Every value can be
/// overridden; the defaults are the production settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Concurrency limit applied to keys with no explicit override.
    pub default_concurrency: usize,
    /// Per-key (model or agent) concurrency overrides.
    pub key_concurrency: HashMap<String, usize>,
    /// Interval between completion-detector ticks.
    pub poll_interval: Duration,
    /// Staleness limit once the session has shown progress at least once.
    pub stale_timeout: Duration,
    /// Staleness limit for sessions that never showed any progress.
    pub no_progress_timeout: Duration,
    /// No staleness check fires before the task has run this long.
    pub min_runtime_before_stale: Duration,
    /// Absolute lifetime ceiling; exceeded tasks fail regardless of activity.
    pub task_ttl: Duration,
    /// Consecutive polls with the session absent from the status map before
    /// falling back to message-count inspection.
    pub max_unknown_status_polls: u32,
    /// Consecutive polls with a stable message count before declaring
    /// completion.
    pub stable_poll_threshold: u32,
    /// Minimum elapsed time after last activity before an idle report is
    /// trusted (debounces a momentary idle blip).
    pub quiet_period: Duration,
    /// Idle reports within this window after start are ignored entirely.
    pub minimum_runtime: Duration,
    /// Default timeout for `wait_for` / `wait_all`.
    pub default_wait_timeout: Duration,
    /// Persisted outputs older than this are swept on construction.
    pub output_retention: Duration,
}

impl SchedulerConfig {
    /// Resolve the running-task limit for a concurrency key.
    pub fn limit(&self, key: &str) -> usize {
        self.key_concurrency
            .get(key)
            .copied()
            .unwrap_or(self.default_concurrency)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_concurrency: 5,
            key_concurrency: HashMap::new(),
            poll_interval: Duration::from_millis(1500),
            stale_timeout: Duration::from_secs(30 * 60),
            no_progress_timeout: Duration::from_secs(15 * 60),
            min_runtime_before_stale: Duration::from_secs(30),
            task_ttl: Duration::from_secs(60 * 60),
            max_unknown_status_polls: 40, // 40 × 1.5s ≈ 60 seconds
            stable_poll_threshold: 3,
            quiet_period: Duration::from_secs(4),
            minimum_runtime: Duration::from_secs(8),
            default_wait_timeout: Duration::from_secs(30 * 60),
            output_retention: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}
