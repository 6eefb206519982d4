//! # Kiln Core
//!
//! Types and traits shared by the orchestrator, its backends and its clients.
//!
//! - **[`ModelRegistry`](registry::ModelRegistry)**: The static catalog of job kinds, loaded from YAML.
//! - **[`render`](manifest::render)**: Turns a descriptor and a request into a [`Manifest`](job::Manifest).
//! - **[`JobRecord`](job::JobRecord)**: The lifecycle state machine of one job.
//! - **[`ClusterBackend`](traits::ClusterBackend)**: Trait for the cluster that runs execution units.
//! - **[`OutputStore`](traits::OutputStore)**: Trait for the storage that job outputs land on.

pub mod api;
pub mod constants;
pub mod error;
pub mod job;
pub mod manifest;
pub mod model;
pub mod registry;
pub mod traits;

pub mod prelude {
    pub use super::api::*;
    pub use super::constants::*;
    pub use super::error::*;
    pub use super::job::*;
    pub use super::manifest::render;
    pub use super::model::*;
    pub use super::registry::*;
    pub use super::traits::*;
}
