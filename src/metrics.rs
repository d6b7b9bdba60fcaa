use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-job run counters kept by the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct JobStats {
    pub runs: u64,
    pub failures: u64,
    pub last_error: Option<String>,
}

/// Orchestrator counters, logged on every heartbeat
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Metrics {
    pub uptime_sec: u64,
    pub cycles_total: u64,
    pub cycles_failed: u64,
    pub memory_bytes: u64,
    pub jobs: BTreeMap<String, JobStats>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update memory usage from system
    pub fn update_memory(&mut self) {
        #[cfg(target_os = "linux")]
        {
            if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
                for line in status.lines() {
                    if line.starts_with("VmRSS:") {
                        if let Some(kb) = line.split_whitespace().nth(1) {
                            if let Ok(kb) = kb.parse::<u64>() {
                                self.memory_bytes = kb * 1024;
                            }
                        }
                    }
                }
            }
        }
    }

    pub fn record_success(&mut self, job: &str) {
        self.cycles_total += 1;
        self.jobs.entry(job.to_string()).or_default().runs += 1;
    }

    pub fn record_failure(&mut self, job: &str, error: impl Into<String>) {
        self.cycles_total += 1;
        self.cycles_failed += 1;
        let stats = self.jobs.entry(job.to_string()).or_default();
        stats.runs += 1;
        stats.failures += 1;
        stats.last_error = Some(error.into());
    }

    /// Share of cycles that completed without an unhandled error
    pub fn success_rate(&self) -> f64 {
        if self.cycles_total == 0 {
            return 100.0;
        }
        ((self.cycles_total - self.cycles_failed) as f64 / self.cycles_total as f64) * 100.0
    }

    pub fn increment_uptime(&mut self, seconds: u64) {
        self.uptime_sec += seconds;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.uptime_sec, 0);
        assert_eq!(metrics.cycles_total, 0);
        assert!(metrics.jobs.is_empty());
    }

    #[test]
    fn test_record_per_job() {
        let mut metrics = Metrics::new();
        metrics.record_success("intake");
        metrics.record_success("intake");
        metrics.record_failure("reasoning", "disk full");

        assert_eq!(metrics.cycles_total, 3);
        assert_eq!(metrics.cycles_failed, 1);
        assert_eq!(metrics.jobs["intake"].runs, 2);
        let reasoning = &metrics.jobs["reasoning"];
        assert_eq!(reasoning.failures, 1);
        assert_eq!(reasoning.last_error.as_deref(), Some("disk full"));
    }

    #[test]
    fn test_success_rate() {
        let mut metrics = Metrics::new();
        assert_eq!(metrics.success_rate(), 100.0);
        metrics.record_success("a");
        metrics.record_failure("a", "x");
        assert!((metrics.success_rate() - 50.0).abs() < 0.01);
    }

    #[test]
    fn test_uptime() {
        let mut metrics = Metrics::new();
        metrics.increment_uptime(30);
        metrics.increment_uptime(30);
        assert_eq!(metrics.uptime_sec, 60);
    }
}
