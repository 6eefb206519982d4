//! # Kiln Runner
//!
//! The job lifecycle of the kiln orchestrator.
//!
//! A submitted job waits for an [`AdmissionSlot`](admission::AdmissionSlot), gets its execution
//! unit created by the [`JobSubmitter`](submitter::JobSubmitter), is driven to a terminal phase
//! by the [`StatusPoller`](poller::StatusPoller), has its output located by the
//! [`OutputRetriever`](retriever::OutputRetriever) and is torn down by the
//! [`CleanupManager`](cleanup::CleanupManager). The [`Orchestrator`](orchestrator::Orchestrator)
//! runs these steps in one task per job.
//!
//! ## Usage
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use kiln_core::prelude::*;
//! # use kiln_runner::prelude::*;
//! # async fn run<C: ClusterBackend, S: OutputStore>(cluster: C, store: S) -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Arc::new(ModelRegistry::load("deploy/models.yaml")?);
//! let orchestrator = Orchestrator::new(registry, cluster, store, OrchestratorConfig::default());
//!
//! let job_id = orchestrator.submit(
//!     JobRequest::new("chatterbox").with_input("text", "/data/input/text/hello.txt"),
//! )?;
//! let record = orchestrator.wait(&job_id).await?;
//! println!("{} finished as {}", record.id, record.phase);
//! # Ok(())
//! # }
//! ```

pub mod admission;
pub mod cleanup;
pub mod config;
pub mod orchestrator;
pub mod poller;
pub mod retriever;
pub mod retry;
pub mod submitter;

pub mod prelude {
    pub use super::admission::{AdmissionController, AdmissionSlot, AdmissionTicket};
    pub use super::config::OrchestratorConfig;
    pub use super::orchestrator::{Orchestrator, Reconciled};
    pub use super::retry::RetryConfig;
}
