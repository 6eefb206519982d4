use thiserror::Error;

/// Errors surfaced to callers of the orchestrator.
///
/// Each variant is distinct so that a caller can tell "the job failed" apart from
/// "the job succeeded but its output was lost".
#[derive(Error, Debug, Clone, PartialEq)]
pub enum JobError {
    /// The request failed parameter or input validation. No cluster call was made.
    /// Maps to **HTTP 400 Bad Request**.
    #[error("Validation error: {0}")]
    Validation(#[from] TemplateError),

    /// The requested model id is not in the registry.
    /// Maps to **HTTP 404 Not Found**.
    #[error("Model {0} not found")]
    ModelNotFound(String),

    /// The model exists but is disabled.
    /// Maps to **HTTP 409 Conflict**.
    #[error("Model {0} is disabled")]
    ModelDisabled(String),

    /// The requested job is not tracked.
    /// Maps to **HTTP 404 Not Found**.
    #[error("Job {0} not found")]
    NotFound(String),

    /// A job with the same id already exists. The caller must pick another id.
    /// Maps to **HTTP 409 Conflict**.
    #[error("Job {0} already exists")]
    DuplicateJob(String),

    /// No admission slot became free in time. The request may be resubmitted.
    /// Maps to **HTTP 503 Service Unavailable**.
    #[error("Admission timed out: {0}")]
    AdmissionTimeout(String),

    /// The cluster rejected creation of the execution unit, or retries ran out.
    /// Maps to **HTTP 502 Bad Gateway**.
    #[error("Submission failed: {0}")]
    SubmissionFailed(String),

    /// The job ran but did not succeed. The underlying reason is preserved.
    /// Maps to **HTTP 422 Unprocessable Entity**.
    #[error("Execution failed: {0}")]
    Execution(String),

    /// Status could not be queried for too many consecutive intervals.
    /// Maps to **HTTP 422 Unprocessable Entity**.
    #[error("Status polling exhausted: {0}")]
    PollingExhausted(String),

    /// The job succeeded but no output artifact was found.
    /// Maps to **HTTP 410 Gone**.
    #[error("Output missing: {0}")]
    OutputMissing(String),

    /// The job is still being processed and cannot be removed yet.
    /// Maps to **HTTP 409 Conflict**.
    #[error("Job {0} is still active")]
    Active(String),

    /// The job was cancelled before it produced an output.
    /// Maps to **HTTP 409 Conflict**.
    #[error("Job {0} was cancelled")]
    Cancelled(String),

    /// Internal orchestrator failure (e.g. a job task went away).
    /// Maps to **HTTP 500 Internal Server Error**.
    #[error("Orchestrator failure: {0}")]
    System(String),
}

/// Why a request could not be rendered into a manifest.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TemplateError {
    #[error("unknown parameter '{0}'")]
    UnknownParameter(String),

    #[error("missing required parameter '{0}'")]
    MissingParameter(String),

    #[error("invalid value for parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("missing input file for slot '{0}'")]
    MissingInput(String),

    #[error("unexpected input slot '{0}'")]
    UnknownInput(String),

    #[error("invalid input path for slot '{slot}': {reason}")]
    InvalidInput { slot: String, reason: String },

    #[error("placeholder '${{{0}}}' has no value")]
    UnresolvedPlaceholder(String),

    #[error("malformed template: {0}")]
    Malformed(String),

    #[error("invalid job id '{0}'")]
    InvalidJobId(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClusterError {
    /// An execution unit with the same name already exists.
    #[error("Execution unit {0} already exists")]
    AlreadyExists(String),

    /// The execution unit was not found.
    #[error("Execution unit {0} not found")]
    NotFound(String),

    /// Network hiccups, rate limiting, server-side errors. Safe to retry.
    #[error("Transient cluster error: {0}")]
    Transient(String),

    /// The cluster refused the request (e.g. an invalid manifest).
    #[error("Cluster rejected request: {0}")]
    Rejected(String),

    /// The backend does not support this operation.
    #[error("Operation not supported: {0}")]
    Unsupported(String),
}

impl ClusterError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ClusterError::Transient(_))
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    /// Low-level I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The requested path was not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Generic backend failure.
    #[error("Storage system failure: {0}")]
    System(String),
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse registry: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("model {0} is declared more than once")]
    DuplicateModel(String),

    #[error("model {model}: {reason}")]
    InvalidModel { model: String, reason: String },
}
