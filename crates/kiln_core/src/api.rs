//! Bodies exchanged over the HTTP surface.

use serde::{Deserialize, Serialize};

use crate::job::Phase;
use crate::model::ModelDescriptor;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmitResponse {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusResponse {
    pub id: String,
    pub phase: Phase,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogsResponse {
    pub id: String,
    /// `None` when no log could be fetched.
    pub logs: Option<String>,
}

/// A catalog entry as listed by `GET /models`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelSummary {
    #[serde(flatten)]
    pub descriptor: ModelDescriptor,
    /// Enabled and its working directory is present.
    pub available: bool,
}

/// Body of every error response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}
