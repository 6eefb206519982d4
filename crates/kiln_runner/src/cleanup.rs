use kiln_core::prelude::*;
use tracing::{debug, error, info};

use crate::admission::AdmissionSlot;
use crate::retry::{RetryConfig, retry_with_backoff};

/// Tears down the execution unit of a finished job.
#[derive(Clone)]
pub struct CleanupManager<C: ClusterBackend> {
    cluster: C,
    retry: RetryConfig,
    log_tail: usize,
}

impl<C: ClusterBackend> CleanupManager<C> {
    pub fn new(cluster: C, retry: RetryConfig, log_tail: usize) -> Self {
        Self {
            cluster,
            retry,
            log_tail,
        }
    }

    /// Releases the slot, keeps the log tail and deletes `unit`.
    ///
    /// The slot is returned before anything else so a slow deletion never holds up the queue.
    /// A deletion that keeps failing is recorded in `record.cleanup_error`.
    pub async fn finalize(
        &self,
        record: &mut JobRecord,
        slot: Option<AdmissionSlot>,
        unit: Option<&str>,
    ) {
        if let Some(slot) = slot {
            slot.release();
            debug!(job_id = %record.id, "Admission slot released");
        }

        let Some(unit) = unit else {
            return;
        };

        if record.logs.is_none() {
            record.logs = self.capture_logs(&record.id, unit).await;
        }

        let deleted = retry_with_backoff(
            &self.retry,
            "delete_unit",
            ClusterError::is_transient,
            || self.cluster.delete(unit),
        )
        .await;

        match deleted {
            Ok(()) => info!(job_id = %record.id, unit, "Execution unit deleted"),
            Err(e) => {
                error!(job_id = %record.id, unit, error = %e, "Failed to delete execution unit");
                record.cleanup_error = Some(e.to_string());
            }
        }
    }

    async fn capture_logs(&self, job_id: &str, unit: &str) -> Option<String> {
        match self.cluster.logs(unit, self.log_tail).await {
            Ok(logs) => Some(logs),
            Err(e) => {
                debug!(job_id, unit, error = %e, "No logs captured");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionController;
    use kiln_compute_mock::ScriptedCluster;
    use std::path::PathBuf;
    use std::time::Duration;

    fn manifest() -> Manifest {
        Manifest {
            job_id: "job-1".into(),
            model: "chatterbox".into(),
            unit_name: "gpu-job-1".into(),
            body: String::new(),
            output: OutputTarget {
                dir: PathBuf::from("/data/output/job-1"),
                file: None,
                extension: "wav".into(),
                strategy: RetrievalStrategy::Shared,
                container: None,
            },
        }
    }

    #[tokio::test]
    async fn releases_slot_and_deletes_unit() {
        let cluster = ScriptedCluster::new();
        cluster.set_logs("loading weights\nsynthesizing\ndone");
        cluster.create(&manifest()).await.unwrap();

        let admission = AdmissionController::new(1);
        let slot = admission
            .acquire("job-1", Duration::from_millis(10))
            .await
            .unwrap();
        let mut record = JobRecord::new("job-1", "chatterbox");

        CleanupManager::new(cluster.clone(), RetryConfig::immediate(3), 2)
            .finalize(&mut record, Some(slot), Some("gpu-job-1"))
            .await;

        assert_eq!(admission.available(), 1);
        assert_eq!(cluster.deleted(), vec!["gpu-job-1".to_string()]);
        assert_eq!(record.logs.as_deref(), Some("synthesizing\ndone"));
        assert_eq!(record.cleanup_error, None);
    }

    #[tokio::test]
    async fn delete_failures_are_retried() {
        let cluster = ScriptedCluster::new();
        cluster.create(&manifest()).await.unwrap();
        cluster.fail_deletes(2);
        let mut record = JobRecord::new("job-1", "chatterbox");

        CleanupManager::new(cluster.clone(), RetryConfig::immediate(3), 100)
            .finalize(&mut record, None, Some("gpu-job-1"))
            .await;

        assert!(!cluster.exists("gpu-job-1"));
        assert_eq!(record.cleanup_error, None);
    }

    #[tokio::test]
    async fn persistent_delete_failure_is_recorded_without_holding_the_slot() {
        let cluster = ScriptedCluster::new();
        cluster.create(&manifest()).await.unwrap();
        cluster.fail_deletes(10);

        let admission = AdmissionController::new(1);
        let slot = admission
            .acquire("job-1", Duration::from_millis(10))
            .await
            .unwrap();
        let mut record = JobRecord::new("job-1", "chatterbox");

        CleanupManager::new(cluster.clone(), RetryConfig::immediate(3), 100)
            .finalize(&mut record, Some(slot), Some("gpu-job-1"))
            .await;

        assert_eq!(admission.available(), 1);
        assert!(cluster.exists("gpu-job-1"));
        assert!(record.cleanup_error.is_some());
    }
}
