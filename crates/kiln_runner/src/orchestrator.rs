use dashmap::{DashMap, mapref::entry::Entry};
use kiln_core::manifest;
use kiln_core::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::admission::{AdmissionController, AdmissionSlot, AdmissionTicket};
use crate::cleanup::CleanupManager;
use crate::config::OrchestratorConfig;
use crate::poller::{PollOutcome, StatusPoller};
use crate::retriever::OutputRetriever;
use crate::retry::retry_with_backoff;
use crate::submitter::JobSubmitter;

/// The caller-facing entry point: submits jobs and answers questions about them.
///
/// Every job runs in its own task, which owns the [`JobRecord`] and publishes snapshots of it.
/// All query methods read those snapshots.
pub struct Orchestrator<C: ClusterBackend, S: OutputStore> {
    inner: Arc<Inner<C, S>>,
}

impl<C: ClusterBackend, S: OutputStore> Clone for Orchestrator<C, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<C: ClusterBackend, S: OutputStore> {
    registry: Arc<ModelRegistry>,
    cluster: C,
    store: S,
    config: OrchestratorConfig,
    admission: AdmissionController,
    submitter: JobSubmitter<C>,
    poller: StatusPoller<C>,
    retriever: OutputRetriever<C, S>,
    cleanup: CleanupManager<C>,
    jobs: DashMap<String, JobHandle>,
    shutdown: CancellationToken,
    /// Serializes writes of the job history.
    history: Mutex<()>,
}

/// What [`Orchestrator::reconcile`] did with the execution units it found.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconciled {
    /// Jobs whose units were taken over and are tracked again.
    pub adopted: Vec<String>,
    /// Units that belonged to no job and were deleted.
    pub deleted: Vec<String>,
}

struct JobHandle {
    record: watch::Receiver<JobRecord>,
    cancel: CancellationToken,
    unit_name: String,
}

impl JobHandle {
    /// The job task drops its sender when it is done.
    fn is_finished(&self) -> bool {
        self.record.has_changed().is_err()
    }
}

impl<C: ClusterBackend, S: OutputStore> Orchestrator<C, S> {
    pub fn new(
        registry: Arc<ModelRegistry>,
        cluster: C,
        store: S,
        config: OrchestratorConfig,
    ) -> Self {
        let inner = Inner {
            admission: AdmissionController::new(config.capacity),
            submitter: JobSubmitter::new(cluster.clone(), config.submit_retry.clone()),
            poller: StatusPoller::new(
                cluster.clone(),
                config.poll_interval,
                config.max_poll_failures,
                config.max_runtime,
            ),
            retriever: OutputRetriever::new(
                cluster.clone(),
                store.clone(),
                config.output_grace,
                config.output_probe_interval,
            ),
            cleanup: CleanupManager::new(
                cluster.clone(),
                config.cleanup_retry.clone(),
                config.log_tail,
            ),
            registry,
            cluster,
            store,
            config,
            jobs: DashMap::new(),
            shutdown: CancellationToken::new(),
            history: Mutex::new(()),
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Checks that the cluster is reachable.
    pub async fn init(&self) -> Result<(), JobError> {
        self.inner
            .cluster
            .init()
            .await
            .map_err(|e| JobError::System(e.to_string()))
    }

    /// Validates `request`, queues it for admission and returns its job id.
    ///
    /// Validation errors are returned before anything is queued or sent to the cluster.
    /// Everything after that (admission timeout, submission and execution failures) is reported
    /// through the job's record. Must be called from within a Tokio runtime.
    pub fn submit(&self, request: JobRequest) -> Result<String, JobError> {
        let descriptor = self.inner.registry.resolve(&request.model)?;
        self.inner.admission.check(&descriptor)?;

        let job_id = match &request.id {
            Some(id) => id.clone(),
            None => generate_job_id(&descriptor.id),
        };
        let manifest = manifest::render(&descriptor, &request, &job_id)?;

        let record = JobRecord::new(&job_id, &descriptor.id);
        let (tx, rx) = watch::channel(record.clone());
        let cancel = self.inner.shutdown.child_token();

        let ticket = match self.inner.jobs.entry(job_id.clone()) {
            Entry::Occupied(_) => return Err(JobError::DuplicateJob(job_id)),
            Entry::Vacant(entry) => {
                // Queue position is taken while the id is reserved.
                let ticket = self.inner.admission.enqueue(&job_id);
                entry.insert(JobHandle {
                    record: rx,
                    cancel: cancel.clone(),
                    unit_name: manifest.unit_name.clone(),
                });
                ticket
            }
        };

        info!(
            job_id = %job_id,
            model = %descriptor.id,
            unit = %manifest.unit_name,
            waiting = self.inner.admission.waiting(),
            "Job queued"
        );

        let inner = self.inner.clone();
        let span = info_span!("job", job_id = %job_id, model = %descriptor.id);
        tokio::spawn(
            async move {
                inner.clone().run(record, tx, ticket, manifest, cancel).await;
                inner.persist().await;
            }
            .instrument(span),
        );

        Ok(job_id)
    }

    pub fn status(&self, job_id: &str) -> Result<Phase, JobError> {
        Ok(self.record(job_id)?.phase)
    }

    /// The latest snapshot of a job.
    pub fn record(&self, job_id: &str) -> Result<JobRecord, JobError> {
        self.inner
            .jobs
            .get(job_id)
            .map(|handle| handle.record.borrow().clone())
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))
    }

    /// The output of a job, or the phase it is in while the output is not ready.
    pub fn output(&self, job_id: &str) -> Result<OutputStatus, JobError> {
        let record = self.record(job_id)?;
        match record.phase {
            Phase::Succeeded => match (record.output, record.failure) {
                (Some(path), _) => Ok(OutputStatus::Ready { path }),
                (None, Some(failure)) => Err(failure.to_error(&record.id)),
                // Retrieval still in progress.
                (None, None) => Ok(OutputStatus::Pending {
                    phase: Phase::Succeeded,
                }),
            },
            Phase::Failed => Err(record
                .failure
                .map(|f| f.to_error(&record.id))
                .unwrap_or_else(|| JobError::Execution("unknown failure".into()))),
            Phase::Cancelled => Err(JobError::Cancelled(record.id)),
            phase => Ok(OutputStatus::Pending { phase }),
        }
    }

    /// Requests cancellation of a job.
    pub fn cancel(&self, job_id: &str) -> Result<CancelAck, JobError> {
        let handle = self
            .inner
            .jobs
            .get(job_id)
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;

        let phase = handle.record.borrow().phase;
        if phase.is_terminal() {
            return Ok(CancelAck::AlreadyTerminal { phase });
        }

        info!(job_id, %phase, "Cancellation requested");
        handle.cancel.cancel();
        Ok(CancelAck::Cancelling)
    }

    /// The log tail of a job: captured at cleanup, or fetched live while the unit exists.
    pub async fn logs(&self, job_id: &str) -> Result<Option<String>, JobError> {
        let record = self.record(job_id)?;
        if record.logs.is_some() {
            return Ok(record.logs);
        }
        let Some(unit) = record.unit.filter(|_| !record.phase.is_terminal()) else {
            return Ok(None);
        };

        match self.inner.cluster.logs(&unit, self.inner.config.log_tail).await {
            Ok(logs) => Ok(Some(logs)),
            Err(ClusterError::NotFound(_) | ClusterError::Unsupported(_)) => Ok(None),
            Err(e) => Err(JobError::System(e.to_string())),
        }
    }

    /// Waits until the job task is done (terminal phase, output retrieved, unit cleaned up).
    pub async fn wait(&self, job_id: &str) -> Result<JobRecord, JobError> {
        let mut rx = self
            .inner
            .jobs
            .get(job_id)
            .map(|handle| handle.record.clone())
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;

        while rx.changed().await.is_ok() {}
        let record = rx.borrow().clone();
        Ok(record)
    }

    /// Removes a finished job from memory and returns its last record.
    pub fn purge(&self, job_id: &str) -> Result<JobRecord, JobError> {
        let finished = self
            .inner
            .jobs
            .get(job_id)
            .map(|handle| handle.is_finished())
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
        if !finished {
            return Err(JobError::Active(job_id.to_string()));
        }

        let record = self
            .inner
            .jobs
            .remove(job_id)
            .map(|(_, handle)| handle.record.borrow().clone())
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
        self.persist_in_background();
        Ok(record)
    }

    /// Removes all finished jobs and returns their ids.
    pub fn purge_finished(&self) -> Vec<String> {
        let finished: Vec<String> = self
            .inner
            .jobs
            .iter()
            .filter(|entry| entry.is_finished())
            .map(|entry| entry.key().clone())
            .collect();

        for id in &finished {
            self.inner.jobs.remove(id);
        }
        info!(count = finished.len(), "Purged finished jobs");
        if !finished.is_empty() {
            self.persist_in_background();
        }
        finished
    }

    fn persist_in_background(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.persist().await });
    }

    /// All tracked jobs, oldest first.
    pub fn jobs(&self) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> = self
            .inner
            .jobs
            .iter()
            .map(|entry| entry.record.borrow().clone())
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        records
    }

    pub fn jobs_for_model(&self, model: &str) -> Vec<JobRecord> {
        self.jobs().into_iter().filter(|r| r.model == model).collect()
    }

    pub fn models(&self) -> Vec<Arc<ModelDescriptor>> {
        self.inner.registry.iter().cloned().collect()
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.inner.registry
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.inner.admission
    }

    /// Loads the records of jobs that finished before the last restart. Returns how many were
    /// restored; ids that are already tracked are skipped.
    pub async fn restore(&self) -> Result<usize, JobError> {
        let records = self
            .inner
            .store
            .load_records()
            .await
            .map_err(|e| JobError::System(e.to_string()))?;

        let mut restored = 0;
        for record in records {
            if !record.is_terminal() {
                warn!(job_id = %record.id, phase = %record.phase, "Skipping unfinished record");
                continue;
            }
            if let Entry::Vacant(entry) = self.inner.jobs.entry(record.id.clone()) {
                let unit_name = record.unit.clone().unwrap_or_default();
                // No sender: the job reads as finished.
                let (_, rx) = watch::channel(record);
                entry.insert(JobHandle {
                    record: rx,
                    cancel: CancellationToken::new(),
                    unit_name,
                });
                restored += 1;
            }
        }

        info!(count = restored, "Restored job history");
        Ok(restored)
    }

    /// Writes the records of all finished jobs to the store.
    pub async fn save_history(&self) -> Result<(), JobError> {
        self.inner
            .save_history()
            .await
            .map_err(|e| JobError::System(e.to_string()))
    }

    /// Brings managed execution units without a live job back under control, e.g. after a
    /// restart.
    ///
    /// A unit labelled with the id of an unknown job of a registered model is adopted: the job
    /// is tracked again, holds a slot and is polled, retrieved and cleaned up as usual. Every
    /// other unit is deleted. Units whose ownership cannot be read are left alone.
    pub async fn reconcile(&self) -> Result<Reconciled, JobError> {
        let units = self
            .inner
            .cluster
            .list(labels::MANAGED_SELECTOR)
            .await
            .map_err(|e| JobError::System(e.to_string()))?;

        let live: HashSet<String> = self
            .inner
            .jobs
            .iter()
            .filter(|entry| !entry.is_finished())
            .map(|entry| entry.unit_name.clone())
            .collect();

        let mut reconciled = Reconciled::default();
        for unit in units.into_iter().filter(|u| !live.contains(u)) {
            let inspected = retry_with_backoff(
                &self.inner.config.cleanup_retry,
                "inspect_unit",
                ClusterError::is_transient,
                || self.inner.cluster.inspect(&unit),
            )
            .await;

            let info = match inspected {
                Ok(info) => info,
                Err(ClusterError::NotFound(_)) => continue,
                Err(e) => {
                    error!(unit = %unit, error = %e, "Cannot read owner of execution unit");
                    continue;
                }
            };

            if let Some(job_id) = self.adopt(&info) {
                reconciled.adopted.push(job_id);
                continue;
            }

            let result = retry_with_backoff(
                &self.inner.config.cleanup_retry,
                "delete_orphan",
                ClusterError::is_transient,
                || self.inner.cluster.delete(&unit),
            )
            .await;

            match result {
                Ok(()) => {
                    info!(unit = %unit, "Deleted orphaned execution unit");
                    reconciled.deleted.push(unit);
                }
                Err(e) => error!(unit = %unit, error = %e, "Failed to delete orphaned unit"),
            }
        }
        Ok(reconciled)
    }

    /// Tracks the job `unit` was created for again. Returns its id, or [`None`] when the unit
    /// cannot be attributed to a new job of a registered model.
    fn adopt(&self, unit: &UnitInfo) -> Option<String> {
        let job_id = unit.job_id.as_deref()?;
        let descriptor = self.inner.registry.resolve(unit.model.as_deref()?).ok()?;
        if manifest::validate_job_id(job_id).is_err() {
            return None;
        }

        let mut record = JobRecord::new(job_id, &descriptor.id);
        record.unit = Some(unit.name.clone());
        let _ = record.transition(Phase::Pending, Some("adopted after restart".into()));
        let (tx, rx) = watch::channel(record.clone());
        let cancel = self.inner.shutdown.child_token();

        match self.inner.jobs.entry(job_id.to_string()) {
            Entry::Occupied(_) => return None,
            Entry::Vacant(entry) => {
                entry.insert(JobHandle {
                    record: rx,
                    cancel: cancel.clone(),
                    unit_name: unit.name.clone(),
                });
            }
        }

        let slot = self.inner.admission.claim(job_id);
        let output = manifest::recovered_output(&descriptor, job_id);
        info!(job_id, model = %descriptor.id, unit = %unit.name, "Adopted execution unit");

        let inner = self.inner.clone();
        let unit_name = unit.name.clone();
        let span = info_span!("job", job_id = %job_id, model = %descriptor.id);
        tokio::spawn(
            async move {
                inner
                    .drive(record, &tx, slot, &unit_name, &output, &cancel)
                    .await;
                drop(tx);
                inner.persist().await;
            }
            .instrument(span),
        );

        Some(job_id.to_string())
    }

    /// Cancels every job that has not finished yet.
    pub fn shutdown(&self) {
        info!("Shutting down orchestrator");
        self.inner.shutdown.cancel();
    }
}

impl<C: ClusterBackend, S: OutputStore> Inner<C, S> {
    /// The lifecycle of one job: admission, submission, polling, retrieval and cleanup.
    async fn run(
        self: Arc<Self>,
        mut record: JobRecord,
        tx: watch::Sender<JobRecord>,
        ticket: AdmissionTicket,
        manifest: Manifest,
        cancel: CancellationToken,
    ) {
        let admitted = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            slot = ticket.wait(self.config.admission_timeout) => Some(slot),
        };
        let slot = match admitted {
            None => {
                let _ = record.transition(Phase::Cancelled, Some("cancelled while queued".into()));
                info!("Job cancelled while queued");
                tx.send_replace(record);
                return;
            }
            Some(Err(e)) => {
                warn!(error = %e, "Job was not admitted");
                let message = match e {
                    JobError::AdmissionTimeout(message) => message,
                    e => e.to_string(),
                };
                record.fail(FailureKind::AdmissionTimeout, message);
                tx.send_replace(record);
                return;
            }
            Some(Ok(slot)) => slot,
        };
        info!(
            available = self.admission.available(),
            "Admission slot acquired"
        );

        let submitted = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.submitter.submit(&manifest) => Some(result),
        };
        let unit = match submitted {
            None => {
                let _ = record.transition(
                    Phase::Cancelled,
                    Some("cancelled during submission".into()),
                );
                tx.send_replace(record.clone());
                // The create call may have reached the cluster before it was abandoned.
                self.cleanup
                    .finalize(&mut record, Some(slot), Some(&manifest.unit_name))
                    .await;
                tx.send_replace(record);
                return;
            }
            Some(Err(JobError::DuplicateJob(_))) => {
                // The unit belongs to someone else and must survive.
                record.fail(
                    FailureKind::DuplicateJob,
                    format!("execution unit {} already exists", manifest.unit_name),
                );
                tx.send_replace(record.clone());
                self.cleanup.finalize(&mut record, Some(slot), None).await;
                tx.send_replace(record);
                return;
            }
            Some(Err(e)) => {
                let message = match e {
                    JobError::SubmissionFailed(message) => message,
                    e => e.to_string(),
                };
                record.fail(FailureKind::SubmissionFailed, message);
                tx.send_replace(record.clone());
                self.cleanup.finalize(&mut record, Some(slot), None).await;
                tx.send_replace(record);
                return;
            }
            Some(Ok(handle)) => handle.unit,
        };

        record.unit = Some(unit.clone());
        let _ = record.transition(Phase::Pending, Some("execution unit created".into()));
        tx.send_replace(record.clone());

        self.drive(record, &tx, slot, &unit, &manifest.output, &cancel)
            .await;
    }

    /// Polls a created unit to the end, retrieves the output and cleans up.
    async fn drive(
        &self,
        mut record: JobRecord,
        tx: &watch::Sender<JobRecord>,
        slot: AdmissionSlot,
        unit: &str,
        output: &OutputTarget,
        cancel: &CancellationToken,
    ) {
        let mut slot = Some(slot);

        let outcome = self.poller.track(&mut record, unit, tx, cancel).await;
        if outcome == PollOutcome::Cancelled {
            release_early(&mut slot, "cancelled");
            let limit = self.config.cancel_delete_timeout;
            match tokio::time::timeout(limit, self.cluster.delete(unit)).await {
                Ok(Ok(())) => {}
                // Retried during cleanup.
                Ok(Err(e)) => warn!(unit, error = %e, "Immediate deletion failed"),
                Err(_) => warn!(unit, "Immediate deletion timed out"),
            }
        }

        if record.phase == Phase::Succeeded {
            // Copied outputs need the unit alive; shared ones only need the volume.
            if output.strategy == RetrievalStrategy::Shared {
                release_early(&mut slot, "workload finished");
            }
            match self.retriever.retrieve(&mut record, output, cancel).await {
                Ok(_) => {}
                Err(JobError::OutputMissing(message)) => {
                    record.failure = Some(JobFailure::new(FailureKind::OutputMissing, message));
                }
                Err(e) => {
                    record.failure =
                        Some(JobFailure::new(FailureKind::OutputMissing, e.to_string()));
                }
            }
            tx.send_replace(record.clone());
        }

        self.cleanup.finalize(&mut record, slot, Some(unit)).await;
        info!(phase = %record.phase, "Job finished");
        tx.send_replace(record);
    }

    async fn save_history(&self) -> Result<(), StorageError> {
        let _guard = self.history.lock().await;
        let mut records: Vec<JobRecord> = self
            .jobs
            .iter()
            .filter(|entry| entry.is_finished())
            .map(|entry| entry.record.borrow().clone())
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        self.store.save_records(&records).await
    }

    async fn persist(&self) {
        if let Err(e) = self.save_history().await {
            warn!(error = %e, "Failed to save job history");
        }
    }
}

fn release_early(slot: &mut Option<AdmissionSlot>, reason: &str) {
    if let Some(slot) = slot.take() {
        debug!(job_id = slot.job_id(), reason, "Admission slot released before cleanup");
        slot.release();
    }
}
