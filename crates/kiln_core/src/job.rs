use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::JobError;
use crate::model::RetrievalStrategy;

/// A request to run a job of a registered model.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct JobRequest {
    /// Caller-supplied id. Generated by the orchestrator when [`None`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// The model to run.
    pub model: String,
    /// Model parameters, validated against the model's schema.
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
    /// Input files keyed by slot name (e.g. `video`, `image`, `audio`).
    #[serde(default)]
    pub inputs: BTreeMap<String, PathBuf>,
}

impl JobRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_param(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_input(mut self, slot: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.inputs.insert(slot.into(), path.into());
        self
    }
}

/// Lifecycle phase of a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Waiting for an admission slot.
    Queued,
    /// Admitted; the execution unit is created but not running yet.
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Succeeded | Phase::Failed | Phase::Cancelled)
    }

    /// Whether the job currently holds an admission slot.
    pub fn is_active(self) -> bool {
        matches!(self, Phase::Pending | Phase::Running)
    }

    pub fn can_transition_to(self, next: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, next),
            (Queued, Pending | Failed | Cancelled)
                | (Pending, Running | Failed | Cancelled)
                | (Running, Succeeded | Failed | Cancelled)
        )
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Queued => "Queued",
            Phase::Pending => "Pending",
            Phase::Running => "Running",
            Phase::Succeeded => "Succeeded",
            Phase::Failed => "Failed",
            Phase::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseTransition {
    pub from: Phase,
    pub to: Phase,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    AdmissionTimeout,
    DuplicateJob,
    SubmissionFailed,
    Execution,
    PollingExhausted,
    OutputMissing,
}

/// Why a job did not produce an output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl JobFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Converts the stored failure back into the error the caller sees.
    pub fn to_error(&self, job_id: &str) -> JobError {
        match self.kind {
            FailureKind::AdmissionTimeout => JobError::AdmissionTimeout(self.message.clone()),
            FailureKind::DuplicateJob => JobError::DuplicateJob(job_id.to_string()),
            FailureKind::SubmissionFailed => JobError::SubmissionFailed(self.message.clone()),
            FailureKind::Execution => JobError::Execution(self.message.clone()),
            FailureKind::PollingExhausted => JobError::PollingExhausted(self.message.clone()),
            FailureKind::OutputMissing => JobError::OutputMissing(self.message.clone()),
        }
    }
}

/// An attempted transition the state machine does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: Phase,
    pub to: Phase,
}

/// The orchestrator's view of one job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRecord {
    pub id: String,
    pub model: String,
    /// Name of the execution unit, known after submission.
    pub unit: Option<String>,
    pub phase: Phase,
    pub created_at: DateTime<Utc>,
    pub last_polled: Option<DateTime<Utc>>,
    pub history: Vec<PhaseTransition>,
    pub output: Option<PathBuf>,
    pub failure: Option<JobFailure>,
    /// Set when teardown of the execution unit was abandoned.
    pub cleanup_error: Option<String>,
    /// Tail of the execution unit's log, captured before deletion.
    pub logs: Option<String>,
}

impl JobRecord {
    pub fn new(id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            unit: None,
            phase: Phase::Queued,
            created_at: Utc::now(),
            last_polled: None,
            history: Vec::new(),
            output: None,
            failure: None,
            cleanup_error: None,
            logs: None,
        }
    }

    /// Moves the record to `next`. Re-entering the current phase is a no-op and returns `Ok(false)`.
    pub fn transition(
        &mut self,
        next: Phase,
        reason: Option<String>,
    ) -> Result<bool, InvalidTransition> {
        if self.phase == next {
            return Ok(false);
        }
        if !self.phase.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.phase,
                to: next,
            });
        }

        self.history.push(PhaseTransition {
            from: self.phase,
            to: next,
            at: Utc::now(),
            reason,
        });
        self.phase = next;
        Ok(true)
    }

    /// Fails the record with the given kind, keeping the reason in both the history and `failure`.
    pub fn fail(&mut self, kind: FailureKind, message: impl Into<String>) -> bool {
        let message = message.into();
        match self.transition(Phase::Failed, Some(message.clone())) {
            Ok(true) => {
                self.failure = Some(JobFailure::new(kind, message));
                true
            }
            Ok(false) | Err(_) => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }
}

/// Identity of an execution unit created on the cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionHandle {
    pub job_id: String,
    pub unit: String,
}

/// An execution unit found on the cluster, with the ownership labels it carries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnitInfo {
    pub name: String,
    pub job_id: Option<String>,
    pub model: Option<String>,
}

impl UnitInfo {
    /// Whether the unit was created for `job_id`.
    pub fn belongs_to(&self, job_id: &str) -> bool {
        self.job_id.as_deref() == Some(job_id)
    }
}

/// Where a rendered job will write its result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputTarget {
    /// Per-job directory, as seen from inside the execution unit.
    pub dir: PathBuf,
    /// Exact output file when the name is deterministic.
    pub file: Option<PathBuf>,
    pub extension: String,
    pub strategy: RetrievalStrategy,
    pub container: Option<String>,
}

/// A fully rendered description of one execution unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    pub job_id: String,
    pub model: String,
    pub unit_name: String,
    /// The rendered template (YAML).
    pub body: String,
    pub output: OutputTarget,
}

/// Phase reported by the cluster for an execution unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum UnitPhase {
    Pending,
    Running,
    Succeeded,
    /// The unit failed. Carries the underlying reason (exit code, OOM, eviction ...).
    Failed(String),
    Unknown,
}

/// A single status observation of an execution unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnitStatus {
    pub phase: UnitPhase,
    /// Extra context, e.g. a scheduling message while pending.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl UnitStatus {
    pub fn new(phase: UnitPhase) -> Self {
        Self {
            phase,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Result of asking for a job's output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutputStatus {
    Ready { path: PathBuf },
    Pending { phase: Phase },
}

/// Response to a cancellation request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CancelAck {
    /// The job was not terminal; it is being cancelled.
    Cancelling,
    /// The job had already reached a terminal phase. Nothing changed.
    AlreadyTerminal { phase: Phase },
}

/// Generates a job id of the form `<model>-<YYYYmmdd-HHMMSS>-<8 hex>`.
pub fn generate_job_id(model_id: &str) -> String {
    let timestamp = Utc::now().format("%Y%m%d-%H%M%S");
    let short = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", model_id, timestamp, &short[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_state_machine() {
        assert!(Phase::Queued.can_transition_to(Phase::Pending));
        assert!(Phase::Pending.can_transition_to(Phase::Running));
        assert!(Phase::Pending.can_transition_to(Phase::Failed));
        assert!(Phase::Running.can_transition_to(Phase::Succeeded));
        assert!(Phase::Running.can_transition_to(Phase::Cancelled));

        assert!(!Phase::Pending.can_transition_to(Phase::Succeeded));
        assert!(!Phase::Running.can_transition_to(Phase::Pending));
        assert!(!Phase::Queued.can_transition_to(Phase::Running));
    }

    #[test]
    fn terminal_phases_have_no_exits() {
        for terminal in [Phase::Succeeded, Phase::Failed, Phase::Cancelled] {
            assert!(terminal.is_terminal());
            for next in [
                Phase::Queued,
                Phase::Pending,
                Phase::Running,
                Phase::Succeeded,
                Phase::Failed,
                Phase::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn transition_records_history() {
        let mut record = JobRecord::new("job-1", "chatterbox");
        assert_eq!(record.phase, Phase::Queued);

        assert_eq!(record.transition(Phase::Pending, None), Ok(true));
        assert_eq!(record.transition(Phase::Pending, None), Ok(false));
        assert_eq!(
            record.transition(Phase::Running, Some("started".into())),
            Ok(true)
        );

        assert_eq!(record.history.len(), 2);
        assert_eq!(record.history[1].from, Phase::Pending);
        assert_eq!(record.history[1].to, Phase::Running);
        assert_eq!(record.history[1].reason.as_deref(), Some("started"));
    }

    #[test]
    fn transition_out_of_terminal_is_rejected() {
        let mut record = JobRecord::new("job-1", "chatterbox");
        record.transition(Phase::Cancelled, None).unwrap();

        let err = record.transition(Phase::Running, None).unwrap_err();
        assert_eq!(err.from, Phase::Cancelled);
        assert_eq!(record.phase, Phase::Cancelled);
    }

    #[test]
    fn fail_preserves_reason() {
        let mut record = JobRecord::new("job-1", "realesrgan");
        record.transition(Phase::Pending, None).unwrap();

        assert!(record.fail(FailureKind::Execution, "exit code 137 (OOMKilled)"));
        assert_eq!(record.phase, Phase::Failed);
        let failure = record.failure.clone().unwrap();
        assert_eq!(failure.kind, FailureKind::Execution);
        assert_eq!(
            failure.to_error(&record.id),
            JobError::Execution("exit code 137 (OOMKilled)".into())
        );

        // A second failure does not overwrite the first one.
        assert!(!record.fail(FailureKind::OutputMissing, "late"));
        assert_eq!(record.failure.unwrap().kind, FailureKind::Execution);
    }

    #[test]
    fn generated_ids_are_prefixed_and_unique() {
        let a = generate_job_id("realesrgan");
        let b = generate_job_id("realesrgan");
        assert!(a.starts_with("realesrgan-"));
        assert_ne!(a, b);
        // model + date + time + 8 hex
        assert_eq!(a.split('-').count(), 4);
        assert_eq!(a.rsplit('-').next().unwrap().len(), 8);
    }

    #[test]
    fn output_status_serializes_with_tag() {
        let ready = OutputStatus::Ready {
            path: PathBuf::from("/data/output/a.wav"),
        };
        let json = serde_json::to_value(&ready).unwrap();
        assert_eq!(json["status"], "ready");
        assert_eq!(json["path"], "/data/output/a.wav");
    }
}
