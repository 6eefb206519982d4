//! # Kiln
//!
//! A GPU batch-job orchestrator. Callers ask for a job of a registered model (super-resolution,
//! text to speech, talking avatars, lip-sync evaluation, ...); kiln validates the request,
//! renders a Pod manifest from the model's template, waits for one of a fixed number of
//! accelerator slots, runs the Pod on Kubernetes and hands back the path of the produced file.
//!
//! This crate serves as an entry point, re-exporting the core types and the runner and
//! optionally including the server, client and backend implementations via feature flags.
//!
//! ## Feature Flags
//!
//! | Feature | Description |
//! |---------|-------------|
//! | **`server`** | Includes the Axum-based HTTP API (`kiln_server`). |
//! | **`client`** | Includes the HTTP client (`kiln_client`) for tooling. |
//! | **`fs`** | Output store on a shared filesystem (`kiln_fs`). |
//! | **`k8s`** | Cluster backend running jobs as Kubernetes Pods (`kiln_compute_k8s`). |
//! | **`mock`** | Scripted in-memory cluster for tests and local development (`kiln_compute_mock`). |
//!
//! ## Example: Custom Server
//!
//! ```toml
//! [dependencies]
//! kiln = { version = "0.3", features = ["server", "fs", "k8s"] }
//! ```
//!
//! ```rust,ignore
//! use kiln::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = Arc::new(ModelRegistry::load("deploy/models.yaml")?);
//!     let cluster = KubeClusterBackend::try_default("gpu-jobs").await?;
//!     let store = FileSystemOutputs::new("./results")
//!         .with_mount("/data", "/mnt/shared")
//!         .with_history("./results/jobs.json");
//!
//!     let orchestrator = Orchestrator::new(registry, cluster, store, OrchestratorConfig::default());
//!     orchestrator.restore().await?;
//!     orchestrator.reconcile().await?;
//!
//!     let app = KilnServer::default().build(orchestrator);
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8000").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```

pub use kiln_core::*;

pub mod runner {
    pub use kiln_runner::*;
}

#[cfg(feature = "server")]
pub mod server {
    pub use kiln_server::*;
}

#[cfg(feature = "client")]
pub mod client {
    pub use kiln_client::*;
}

#[cfg(feature = "fs")]
pub mod fs {
    pub use kiln_fs::*;
}

#[cfg(feature = "k8s")]
pub mod k8s {
    pub use kiln_compute_k8s::*;
}

#[cfg(feature = "mock")]
pub mod mock {
    pub use kiln_compute_mock::*;
}

pub mod prelude {
    pub use kiln_core::prelude::*;
    pub use kiln_runner::prelude::*;

    #[cfg(feature = "server")]
    pub use kiln_server::prelude::*;

    #[cfg(feature = "client")]
    pub use kiln_client::KilnClient;

    #[cfg(feature = "fs")]
    pub use kiln_fs::FileSystemOutputs;

    #[cfg(feature = "k8s")]
    pub use kiln_compute_k8s::KubeClusterBackend;

    #[cfg(feature = "mock")]
    pub use kiln_compute_mock::ScriptedCluster;
}
