//! # Kiln Server
//!
//! An Axum-based HTTP surface over an [`Orchestrator`](kiln_runner::prelude::Orchestrator).
//!
//! ## Routes
//!
//! * `GET /health`
//! * `GET /models`: the catalog, with availability.
//! * `POST /jobs`: submit a [`JobRequest`](kiln_core::job::JobRequest), returns the job id.
//! * `GET /jobs`: all tracked records, optionally `?model=<id>`.
//! * `GET /jobs/{id}`, `DELETE /jobs/{id}`: read or purge a record.
//! * `GET /jobs/{id}/status`, `GET /jobs/{id}/output`, `GET /jobs/{id}/logs`
//! * `POST /jobs/{id}/cancel`
//!
//! ## Example
//!
//! ```no_run
//! use kiln_server::KilnServer;
//! use kiln_runner::prelude::*;
//! use kiln_core::prelude::*;
//! use kiln_compute_mock::ScriptedCluster;
//! use kiln_fs::FileSystemOutputs;
//! use std::sync::Arc;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let registry = ModelRegistry::load("deploy/models.yaml")?;
//! let orchestrator = Orchestrator::new(
//!     Arc::new(registry),
//!     ScriptedCluster::new(),
//!     FileSystemOutputs::new("./results"),
//!     OrchestratorConfig::default(),
//! );
//!
//! let app = KilnServer::default().build(orchestrator);
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8000").await?;
//! axum::serve(listener, app).await?;
//! # Ok(())
//! # }
//! ```

mod api;

pub mod state;

use axum::{
    Router,
    routing::{get, post},
};
use kiln_core::prelude::{routes::*, *};
use kiln_runner::prelude::*;
use state::AppState;
use tower_http::trace::TraceLayer;

pub use api::ApiError;

/// The builder for the Kiln server.
#[derive(Clone, Debug, Default)]
pub struct KilnServer;

impl KilnServer {
    pub fn build<C: ClusterBackend, S: OutputStore>(
        self,
        orchestrator: Orchestrator<C, S>,
    ) -> Router {
        Router::new()
            .route(HEALTH, get(|| async { "OK" }))
            .route(MODELS, get(api::list_models))
            .route(JOBS, post(api::submit_job).get(api::list_jobs))
            .route(JOBS_BY_ID, get(api::get_job).delete(api::purge_job))
            .route(JOBS_STATUS, get(api::job_status))
            .route(JOBS_OUTPUT, get(api::job_output))
            .route(JOBS_LOGS, get(api::job_logs))
            .route(JOBS_CANCEL, post(api::cancel_job))
            .layer(TraceLayer::new_for_http())
            .with_state(AppState { orchestrator })
    }
}

pub mod prelude {
    pub use crate::KilnServer;
    pub use crate::api::ApiError;
    pub use crate::state::*;
}
