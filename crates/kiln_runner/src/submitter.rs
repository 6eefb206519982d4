use kiln_core::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, instrument, warn};

use crate::retry::{RetryConfig, retry_with_backoff};

/// Creates execution units on the cluster.
#[derive(Clone)]
pub struct JobSubmitter<C: ClusterBackend> {
    cluster: C,
    retry: RetryConfig,
}

impl<C: ClusterBackend> JobSubmitter<C> {
    pub fn new(cluster: C, retry: RetryConfig) -> Self {
        Self { cluster, retry }
    }

    /// Creates the unit for `manifest`.
    ///
    /// Transient errors are retried with backoff. A name collision is reported as
    /// [`JobError::DuplicateJob`] right away; everything else becomes
    /// [`JobError::SubmissionFailed`].
    ///
    /// A transient error does not prove the create never happened. Once one was seen, a unit
    /// already carrying this job's id is taken over instead of failing the job.
    #[instrument(skip_all, fields(job_id = %manifest.job_id, unit = %manifest.unit_name))]
    pub async fn submit(&self, manifest: &Manifest) -> Result<ExecutionHandle, JobError> {
        let saw_transient = AtomicBool::new(false);
        let created = retry_with_backoff(
            &self.retry,
            "create_unit",
            |e: &ClusterError| {
                let transient = e.is_transient();
                if transient {
                    saw_transient.store(true, Ordering::Relaxed);
                }
                transient
            },
            || self.cluster.create(manifest),
        )
        .await;

        let err = match created {
            Ok(handle) => {
                info!("Execution unit created");
                return Ok(handle);
            }
            Err(e) => e,
        };

        let maybe_ours = saw_transient.load(Ordering::Relaxed)
            && matches!(
                err,
                ClusterError::AlreadyExists(_) | ClusterError::Transient(_)
            );
        if maybe_ours && let Some(handle) = self.claim(manifest).await {
            return Ok(handle);
        }

        Err(match err {
            ClusterError::AlreadyExists(_) => JobError::DuplicateJob(manifest.job_id.clone()),
            e => JobError::SubmissionFailed(e.to_string()),
        })
    }

    /// Returns a handle to the unit named in `manifest` if it was created for this job.
    async fn claim(&self, manifest: &Manifest) -> Option<ExecutionHandle> {
        let inspected = retry_with_backoff(
            &self.retry,
            "inspect_unit",
            ClusterError::is_transient,
            || self.cluster.inspect(&manifest.unit_name),
        )
        .await;

        match inspected {
            Ok(info) if info.belongs_to(&manifest.job_id) => {
                info!("Adopted execution unit created by an unanswered request");
                Some(ExecutionHandle {
                    job_id: manifest.job_id.clone(),
                    unit: info.name,
                })
            }
            Ok(info) => {
                warn!(owner = ?info.job_id, "Execution unit belongs to another job");
                None
            }
            Err(ClusterError::NotFound(_)) => None,
            Err(e) => {
                warn!(error = %e, "Could not check ownership of the execution unit");
                None
            }
        }
    }
}
