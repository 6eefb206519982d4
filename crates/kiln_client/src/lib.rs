//! # Kiln Client
//!
//! An async HTTP client for a kiln server.
//!
//! ## Example
//!
//! ```no_run
//! use kiln_client::KilnClient;
//! use kiln_core::prelude::*;
//! use std::time::Duration;
//!
//! async fn run() -> anyhow::Result<()> {
//!     let client = KilnClient::new("http://localhost:8000");
//!
//!     let request = JobRequest::new("chatterbox")
//!         .with_input("text", "/data/input/text/hello.txt")
//!         .with_param("voice", "female1");
//!     let id = client.submit(&request).await?;
//!
//!     let record = client.wait(&id, Duration::from_secs(5)).await?;
//!     if let OutputStatus::Ready { path } = client.output(&record.id).await? {
//!         println!("{}", path.display());
//!     }
//!     Ok(())
//! }
//! ```

use kiln_core::prelude::{routes::*, *};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KilnClientError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The server answered with an error body.
    #[error("Server returned {status} ({error}): {message}")]
    Api {
        status: StatusCode,
        error: String,
        message: String,
    },

    /// The server answered with something that is not an error body.
    #[error("Server returned error {0}: {1}")]
    ServerError(StatusCode, String),
}

impl KilnClientError {
    /// The stable error name sent by the server, e.g. `validation` or `not_found`.
    pub fn api_error(&self) -> Option<&str> {
        match self {
            KilnClientError::Api { error, .. } => Some(error),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, KilnClientError>;

#[derive(Clone)]
pub struct KilnClient {
    base_url: String,
    client: Client,
}

fn by_id(route: &str, id: &str) -> String {
    route.replace("{id}", id)
}

impl KilnClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn parse<T: DeserializeOwned>(response: Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }

        let text = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => Err(KilnClientError::Api {
                status,
                error: body.error,
                message: body.message,
            }),
            Err(_) => Err(KilnClientError::ServerError(status, text)),
        }
    }

    pub async fn health(&self) -> Result<()> {
        let response = self.client.get(self.url(HEALTH)).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(KilnClientError::ServerError(status, text));
        }
        Ok(())
    }

    pub async fn models(&self) -> Result<Vec<ModelSummary>> {
        let response = self.client.get(self.url(MODELS)).send().await?;
        Self::parse(response).await
    }

    /// Submits a job and returns its id.
    pub async fn submit(&self, request: &JobRequest) -> Result<String> {
        let response = self.client.post(self.url(JOBS)).json(request).send().await?;
        let body: SubmitResponse = Self::parse(response).await?;
        Ok(body.id)
    }

    pub async fn jobs(&self, model: Option<&str>) -> Result<Vec<JobRecord>> {
        let mut request = self.client.get(self.url(JOBS));
        if let Some(model) = model {
            request = request.query(&[("model", model)]);
        }
        Self::parse(request.send().await?).await
    }

    pub async fn record(&self, id: &str) -> Result<JobRecord> {
        let response = self.client.get(self.url(&by_id(JOBS_BY_ID, id))).send().await?;
        Self::parse(response).await
    }

    pub async fn status(&self, id: &str) -> Result<Phase> {
        let response = self.client.get(self.url(&by_id(JOBS_STATUS, id))).send().await?;
        let body: StatusResponse = Self::parse(response).await?;
        Ok(body.phase)
    }

    pub async fn output(&self, id: &str) -> Result<OutputStatus> {
        let response = self.client.get(self.url(&by_id(JOBS_OUTPUT, id))).send().await?;
        Self::parse(response).await
    }

    pub async fn logs(&self, id: &str) -> Result<Option<String>> {
        let response = self.client.get(self.url(&by_id(JOBS_LOGS, id))).send().await?;
        let body: LogsResponse = Self::parse(response).await?;
        Ok(body.logs)
    }

    pub async fn cancel(&self, id: &str) -> Result<CancelAck> {
        let response = self.client.post(self.url(&by_id(JOBS_CANCEL, id))).send().await?;
        Self::parse(response).await
    }

    /// Removes a finished job from the server.
    pub async fn purge(&self, id: &str) -> Result<JobRecord> {
        let response = self
            .client
            .delete(self.url(&by_id(JOBS_BY_ID, id)))
            .send()
            .await?;
        Self::parse(response).await
    }

    /// Polls the job record every `interval` until it is terminal.
    pub async fn wait(&self, id: &str, interval: Duration) -> Result<JobRecord> {
        loop {
            let record = self.record(id).await?;
            if record.is_terminal() {
                return Ok(record);
            }
            tokio::time::sleep(interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_are_built_from_routes() {
        let client = KilnClient::new("http://kiln.local:8000/");
        assert_eq!(
            client.url(&by_id(JOBS_CANCEL, "chatterbox-1")),
            "http://kiln.local:8000/jobs/chatterbox-1/cancel"
        );
        assert_eq!(client.url(MODELS), "http://kiln.local:8000/models");
    }

    #[test]
    fn api_error_exposes_the_error_name() {
        let err = KilnClientError::Api {
            status: StatusCode::CONFLICT,
            error: "duplicate_job".into(),
            message: "Job x already exists".into(),
        };
        assert_eq!(err.api_error(), Some("duplicate_job"));
        assert_eq!(
            err.to_string(),
            "Server returned 409 Conflict (duplicate_job): Job x already exists"
        );
    }
}
