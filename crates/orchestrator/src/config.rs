//! Orchestrator configuration.

use std::str::FromStr;
use std::time::Duration;

use suit_common::RetryPolicy;

/// Limits and timings for running analysis jobs.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Backoff for retrying failed pipeline stages.
    pub retry: RetryPolicy,

    /// Wall-clock budget of one job run.
    pub job_timeout: Duration,

    /// How often a running job refreshes its heartbeat.
    pub heartbeat_interval: Duration,

    /// Heartbeat age after which a RUNNING job is considered orphaned.
    pub stale_threshold: Duration,

    /// How often the reaper looks for orphaned jobs.
    pub reap_interval: Duration,

    /// How long a dequeue blocks waiting for a ticket.
    pub poll_wait: Duration,

    /// Jobs run concurrently by one worker.
    pub concurrency: usize,

    /// Largest AOI accepted at submission.
    pub max_aoi_km2: f64,

    /// Runs allowed per job, counting re-runs after reclaim.
    pub max_job_runs: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            job_timeout: Duration::from_secs(3600),
            heartbeat_interval: Duration::from_secs(15),
            stale_threshold: Duration::from_secs(120),
            reap_interval: Duration::from_secs(60),
            poll_wait: Duration::from_secs(5),
            concurrency: 2,
            max_aoi_km2: 10_000.0,
            max_job_runs: 3,
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

impl OrchestratorConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(n) = env_parse("JOB_RETRY_MAX_ATTEMPTS") {
            config.retry.max_attempts = n;
        }
        if let Some(ms) = env_parse("JOB_RETRY_INITIAL_DELAY_MS") {
            config.retry.initial_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = env_parse("JOB_RETRY_MAX_DELAY_SECS") {
            config.retry.max_delay = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("JOB_TIMEOUT_SECS") {
            config.job_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("HEARTBEAT_INTERVAL_SECS") {
            config.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("STALE_THRESHOLD_SECS") {
            config.stale_threshold = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("REAP_INTERVAL_SECS") {
            config.reap_interval = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse("WORKER_CONCURRENCY") {
            config.concurrency = n;
        }
        if let Some(km2) = env_parse("MAX_AOI_KM2") {
            config.max_aoi_km2 = km2;
        }
        if let Some(n) = env_parse("MAX_JOB_RUNS") {
            config.max_job_runs = n;
        }

        config
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.concurrency == 0 {
            return Err("concurrency must be > 0".to_string());
        }
        if self.job_timeout.is_zero() {
            return Err("job_timeout must be > 0".to_string());
        }
        if self.heartbeat_interval.is_zero() {
            return Err("heartbeat_interval must be > 0".to_string());
        }
        // A live worker must get at least two heartbeats in before it looks stale
        if self.stale_threshold < self.heartbeat_interval * 2 {
            return Err(format!(
                "stale_threshold ({:?}) must be at least twice heartbeat_interval ({:?})",
                self.stale_threshold, self.heartbeat_interval
            ));
        }
        if !(self.max_aoi_km2.is_finite() && self.max_aoi_km2 > 0.0) {
            return Err("max_aoi_km2 must be a positive number".to_string());
        }
        if self.max_job_runs == 0 {
            return Err("max_job_runs must be > 0".to_string());
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err("retry backoff multiplier must be >= 1".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = OrchestratorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_aoi_km2, 10_000.0);
        assert_eq!(config.job_timeout, Duration::from_secs(3600));
    }

    #[test]
    fn test_stale_threshold_must_exceed_heartbeats() {
        let config = OrchestratorConfig {
            heartbeat_interval: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(45),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let config = OrchestratorConfig {
            concurrency: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
