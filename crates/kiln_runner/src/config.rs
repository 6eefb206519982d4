use kiln_core::constants::defaults;
use std::time::Duration;

use crate::retry::RetryConfig;

/// Tunables of the job lifecycle.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Number of admission slots, i.e. accelerators available to jobs.
    pub capacity: usize,
    /// How long a job may wait for a slot before it fails.
    pub admission_timeout: Duration,
    pub poll_interval: Duration,
    /// Consecutive failed status queries before a job fails.
    pub max_poll_failures: u32,
    /// Wall-clock limit of a job once submitted. [`None`] disables the limit.
    pub max_runtime: Option<Duration>,
    /// How long to keep looking for the output of a succeeded job.
    pub output_grace: Duration,
    pub output_probe_interval: Duration,
    pub submit_retry: RetryConfig,
    pub cleanup_retry: RetryConfig,
    /// Bound on the delete sent as soon as a running job is cancelled.
    pub cancel_delete_timeout: Duration,
    /// Number of log lines kept for diagnostics.
    pub log_tail: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            capacity: defaults::CAPACITY,
            admission_timeout: Duration::from_secs(defaults::ADMISSION_TIMEOUT_SECS),
            poll_interval: Duration::from_secs(defaults::POLL_INTERVAL_SECS),
            max_poll_failures: defaults::MAX_POLL_FAILURES,
            max_runtime: Some(Duration::from_secs(defaults::MAX_RUNTIME_SECS)),
            output_grace: Duration::from_secs(10),
            output_probe_interval: Duration::from_secs(1),
            submit_retry: RetryConfig::with_max_attempts(defaults::SUBMIT_ATTEMPTS),
            cleanup_retry: RetryConfig::with_max_attempts(defaults::DELETE_ATTEMPTS),
            cancel_delete_timeout: Duration::from_secs(10),
            log_tail: defaults::LOG_TAIL_LINES,
        }
    }
}
