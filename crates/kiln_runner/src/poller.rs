//! Drives a submitted job through its lifecycle by polling the cluster.

use chrono::Utc;
use kiln_core::prelude::*;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How [`StatusPoller::track`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The record reached a terminal phase on its own.
    Finished,
    /// The cancellation token fired and the record is now `Cancelled`.
    Cancelled,
}

#[derive(Clone)]
pub struct StatusPoller<C: ClusterBackend> {
    cluster: C,
    interval: Duration,
    max_failures: u32,
    max_runtime: Option<Duration>,
}

impl<C: ClusterBackend> StatusPoller<C> {
    pub fn new(
        cluster: C,
        interval: Duration,
        max_failures: u32,
        max_runtime: Option<Duration>,
    ) -> Self {
        Self {
            cluster,
            interval,
            max_failures: max_failures.max(1),
            max_runtime,
        }
    }

    /// Polls `unit` until `record` is terminal or `cancel` fires.
    ///
    /// Every observation is published on `publish`.
    pub async fn track(
        &self,
        record: &mut JobRecord,
        unit: &str,
        publish: &watch::Sender<JobRecord>,
        cancel: &CancellationToken,
    ) -> PollOutcome {
        let started = Instant::now();
        let mut failures = 0u32;

        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return cancel_record(record, publish),
                result = self.cluster.status(unit) => result,
            };

            match result {
                Ok(status) => {
                    failures = 0;
                    record.last_polled = Some(Utc::now());
                    if apply_status(record, &status) {
                        info!(job_id = %record.id, unit, phase = %record.phase, "Phase changed");
                    }
                }
                Err(ClusterError::NotFound(_)) => {
                    warn!(job_id = %record.id, unit, "Execution unit disappeared");
                    record.fail(FailureKind::Execution, "execution unit not found");
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        job_id = %record.id,
                        unit,
                        attempt = failures,
                        error = %e,
                        "Status query failed"
                    );
                    if failures >= self.max_failures {
                        record.fail(
                            FailureKind::PollingExhausted,
                            format!("{failures} consecutive status queries failed, last: {e}"),
                        );
                    }
                }
            }

            if !record.is_terminal()
                && let Some(limit) = self.max_runtime
                && started.elapsed() >= limit
            {
                record.fail(
                    FailureKind::Execution,
                    format!("exceeded the wall-clock limit of {}s", limit.as_secs()),
                );
            }

            publish.send_replace(record.clone());
            if record.is_terminal() {
                return PollOutcome::Finished;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return cancel_record(record, publish),
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}

fn cancel_record(record: &mut JobRecord, publish: &watch::Sender<JobRecord>) -> PollOutcome {
    match record.transition(Phase::Cancelled, Some("cancelled by caller".into())) {
        Ok(_) => {
            info!(job_id = %record.id, "Job cancelled");
            publish.send_replace(record.clone());
            PollOutcome::Cancelled
        }
        // Reached a terminal phase just before the cancellation.
        Err(_) => PollOutcome::Finished,
    }
}

/// Applies one observation to the record. Returns whether the phase changed.
pub fn apply_status(record: &mut JobRecord, status: &UnitStatus) -> bool {
    let before = record.phase;

    match &status.phase {
        UnitPhase::Pending => {
            if let Some(message) = &status.message {
                debug!(job_id = %record.id, message, "Execution unit pending");
            }
        }
        UnitPhase::Running => {
            let _ = record.transition(Phase::Running, None);
        }
        UnitPhase::Succeeded => {
            if record.phase == Phase::Pending {
                let _ = record.transition(
                    Phase::Running,
                    Some("completed before a running state was observed".into()),
                );
            }
            let _ = record.transition(Phase::Succeeded, status.message.clone());
        }
        UnitPhase::Failed(reason) => {
            record.fail(FailureKind::Execution, reason.clone());
        }
        UnitPhase::Unknown => {
            debug!(job_id = %record.id, "Execution unit state unknown");
        }
    }

    record.phase != before
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_compute_mock::ScriptedCluster;
    use std::path::PathBuf;

    fn pending_record() -> JobRecord {
        let mut record = JobRecord::new("job-1", "realesrgan");
        record.transition(Phase::Pending, None).unwrap();
        record
    }

    fn manifest() -> Manifest {
        Manifest {
            job_id: "job-1".into(),
            model: "realesrgan".into(),
            unit_name: "gpu-realesrgan-job-1".into(),
            body: String::new(),
            output: OutputTarget {
                dir: PathBuf::from("/data/output/job-1"),
                file: None,
                extension: "mp4".into(),
                strategy: RetrievalStrategy::Shared,
                container: None,
            },
        }
    }

    fn poller(cluster: &ScriptedCluster) -> StatusPoller<ScriptedCluster> {
        StatusPoller::new(cluster.clone(), Duration::from_millis(5), 3, None)
    }

    #[test]
    fn succeeded_from_pending_passes_through_running() {
        let mut record = pending_record();
        assert!(apply_status(
            &mut record,
            &UnitStatus::new(UnitPhase::Succeeded)
        ));

        let phases: Vec<_> = record.history.iter().map(|t| t.to).collect();
        assert_eq!(
            phases,
            vec![Phase::Pending, Phase::Running, Phase::Succeeded]
        );
    }

    #[test]
    fn failure_reason_is_preserved() {
        let mut record = pending_record();
        apply_status(
            &mut record,
            &UnitStatus::new(UnitPhase::Failed("ImagePullBackOff: not found".into())),
        );
        assert_eq!(record.phase, Phase::Failed);
        assert_eq!(
            record.failure.unwrap().message,
            "ImagePullBackOff: not found"
        );
    }

    #[test]
    fn pending_and_unknown_keep_phase() {
        let mut record = pending_record();
        let status = UnitStatus::new(UnitPhase::Pending).with_message("0/1 nodes available");
        assert!(!apply_status(&mut record, &status));
        assert!(!apply_status(&mut record, &UnitStatus::new(UnitPhase::Unknown)));
        assert_eq!(record.phase, Phase::Pending);
    }

    #[tokio::test]
    async fn tracks_until_terminal() {
        let cluster = ScriptedCluster::new();
        let handle = cluster.create(&manifest()).await.unwrap();
        let mut record = pending_record();
        let (tx, rx) = watch::channel(record.clone());

        let outcome = poller(&cluster)
            .track(&mut record, &handle.unit, &tx, &CancellationToken::new())
            .await;

        assert_eq!(outcome, PollOutcome::Finished);
        assert_eq!(record.phase, Phase::Succeeded);
        assert!(record.last_polled.is_some());
        assert_eq!(rx.borrow().phase, Phase::Succeeded);
    }

    #[tokio::test]
    async fn transient_errors_keep_phase_until_bound() {
        let cluster = ScriptedCluster::new();
        cluster.script(
            "job-1",
            vec![
                Ok(UnitStatus::new(UnitPhase::Running)),
                Err(ClusterError::Transient("timeout".into())),
                Err(ClusterError::Transient("timeout".into())),
                Ok(UnitStatus::new(UnitPhase::Succeeded)),
            ],
        );
        let handle = cluster.create(&manifest()).await.unwrap();
        let mut record = pending_record();
        let (tx, _rx) = watch::channel(record.clone());

        poller(&cluster)
            .track(&mut record, &handle.unit, &tx, &CancellationToken::new())
            .await;
        assert_eq!(record.phase, Phase::Succeeded);
    }

    #[tokio::test]
    async fn exhausts_after_consecutive_failures() {
        let cluster =
            ScriptedCluster::with_default_script(vec![Err(ClusterError::Transient(
                "connection refused".into(),
            ))]);
        let handle = cluster.create(&manifest()).await.unwrap();
        let mut record = pending_record();
        let (tx, _rx) = watch::channel(record.clone());

        poller(&cluster)
            .track(&mut record, &handle.unit, &tx, &CancellationToken::new())
            .await;

        assert_eq!(record.phase, Phase::Failed);
        assert_eq!(
            record.failure.unwrap().kind,
            FailureKind::PollingExhausted
        );
    }

    #[tokio::test]
    async fn vanished_unit_fails_the_job() {
        let cluster = ScriptedCluster::new();
        let mut record = pending_record();
        let (tx, _rx) = watch::channel(record.clone());

        poller(&cluster)
            .track(&mut record, "gpu-never-created", &tx, &CancellationToken::new())
            .await;

        assert_eq!(record.phase, Phase::Failed);
        assert_eq!(record.failure.unwrap().message, "execution unit not found");
    }

    #[tokio::test]
    async fn wall_clock_limit_fails_long_jobs() {
        let cluster = ScriptedCluster::with_default_script(vec![Ok(UnitStatus::new(
            UnitPhase::Running,
        ))]);
        let handle = cluster.create(&manifest()).await.unwrap();
        let mut record = pending_record();
        let (tx, _rx) = watch::channel(record.clone());

        StatusPoller::new(
            cluster.clone(),
            Duration::from_millis(5),
            3,
            Some(Duration::from_millis(30)),
        )
        .track(&mut record, &handle.unit, &tx, &CancellationToken::new())
        .await;

        assert_eq!(record.phase, Phase::Failed);
        assert!(record.failure.unwrap().message.contains("wall-clock"));
    }

    #[tokio::test]
    async fn cancellation_bypasses_the_interval() {
        let cluster = ScriptedCluster::with_default_script(vec![Ok(UnitStatus::new(
            UnitPhase::Running,
        ))]);
        let handle = cluster.create(&manifest()).await.unwrap();
        let mut record = pending_record();
        let (tx, _rx) = watch::channel(record.clone());
        let cancel = CancellationToken::new();

        let slow = StatusPoller::new(cluster.clone(), Duration::from_secs(60), 3, None);
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            slow.track(&mut record, &handle.unit, &tx, &cancel),
        )
        .await
        .unwrap();

        assert_eq!(outcome, PollOutcome::Cancelled);
        assert_eq!(record.phase, Phase::Cancelled);
    }
}
