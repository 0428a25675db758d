use serde::Deserialize;

/// Tuning knobs for one queue instance.
///
/// Every field has a default, so an orchestrator can embed this struct in its
/// own configuration file and set only what it needs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Queue name, used in log fields and diagnostic dumps.
    pub name: String,
    /// Element ceiling of the job info cache. 0 disables eviction.
    pub job_info_cache_size: usize,
    /// Pending/Done set mutations between automatic compactions.
    pub compaction_threshold: u64,
    /// Maximum unreferenced affinities deleted per reclamation pass.
    pub affinity_gc_batch: usize,
    /// Maximum tracked jobs checked for expiry per reclamation pass.
    pub reclaim_batch: usize,
    /// Period of the background reclaimer.
    pub reclaim_interval_ms: u64,
    /// Lifetime of a job after admission or its last state change.
    pub job_lifetime_secs: i64,
    /// Execution deadline granted to a worker for a dispatched job.
    pub run_timeout_secs: i64,
    /// Minimum gap between two conditional notification rounds.
    pub notify_timeout_ms: i64,
    /// How long a session stays valid after its last contact.
    pub live_timeout_secs: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            job_info_cache_size: 10_000,
            compaction_threshold: 10_000,
            affinity_gc_batch: 1_000,
            reclaim_batch: 10_000,
            reclaim_interval_ms: 1_000,
            job_lifetime_secs: 3_600,
            run_timeout_secs: 3_600,
            notify_timeout_ms: 100,
            live_timeout_secs: 60,
        }
    }
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_cache_size(mut self, size: usize) -> Self {
        self.job_info_cache_size = size;
        self
    }

    pub fn with_compaction_threshold(mut self, threshold: u64) -> Self {
        self.compaction_threshold = threshold;
        self
    }

    pub fn with_job_lifetime_secs(mut self, secs: i64) -> Self {
        self.job_lifetime_secs = secs;
        self
    }

    pub fn with_run_timeout_secs(mut self, secs: i64) -> Self {
        self.run_timeout_secs = secs;
        self
    }

    pub fn with_reclaim_interval_ms(mut self, ms: u64) -> Self {
        self.reclaim_interval_ms = ms;
        self
    }

    pub fn job_lifetime(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.job_lifetime_secs)
    }

    pub fn run_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.run_timeout_secs)
    }

    pub fn notify_timeout(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.notify_timeout_ms)
    }

    pub fn live_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.live_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_config_default() {
        let cfg = QueueConfig::default();
        assert_eq!(cfg.name, "default");
        assert_eq!(cfg.job_info_cache_size, 10_000);
        assert_eq!(cfg.compaction_threshold, 10_000);
        assert_eq!(cfg.affinity_gc_batch, 1_000);
        assert_eq!(cfg.reclaim_interval_ms, 1_000);
        assert_eq!(cfg.job_lifetime(), chrono::Duration::hours(1));
    }

    #[test]
    fn queue_config_builders() {
        let cfg = QueueConfig::new("batch")
            .with_cache_size(0)
            .with_compaction_threshold(5)
            .with_job_lifetime_secs(10)
            .with_run_timeout_secs(20)
            .with_reclaim_interval_ms(50);
        assert_eq!(cfg.name, "batch");
        assert_eq!(cfg.job_info_cache_size, 0);
        assert_eq!(cfg.compaction_threshold, 5);
        assert_eq!(cfg.job_lifetime(), chrono::Duration::seconds(10));
        assert_eq!(cfg.run_timeout(), chrono::Duration::seconds(20));
        assert_eq!(cfg.reclaim_interval_ms, 50);
    }

    #[test]
    fn queue_config_partial_deserialize() {
        let cfg: QueueConfig =
            serde_json::from_str(r#"{"name": "q1", "job_info_cache_size": 7}"#).unwrap();
        assert_eq!(cfg.name, "q1");
        assert_eq!(cfg.job_info_cache_size, 7);
        assert_eq!(cfg.live_timeout_secs, 60);
    }
}
