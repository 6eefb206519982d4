//! # Kiln Kubernetes Backend
//!
//! Runs every job as a single Pod in one namespace.

mod pod;

pub use pod::{classify, owner, prepare_pod};

use bytes::Bytes;
use k8s_openapi::api::core::v1::Pod;
use kiln_core::prelude::*;
use kube::api::{Api, AttachParams, DeleteParams, ListParams, LogParams, PostParams};
use kube::Client;
use std::path::Path;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

#[derive(Clone)]
pub struct KubeClusterBackend {
    client: Client,
    namespace: String,
}

impl KubeClusterBackend {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    /// Connects with the ambient kubeconfig or in-cluster service account.
    pub async fn try_default(namespace: impl Into<String>) -> Result<Self, ClusterError> {
        let client = Client::try_default()
            .await
            .map_err(|e| ClusterError::Rejected(format!("Failed to build kube client: {e}")))?;
        Ok(Self::new(client, namespace))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

/// Translates a kube error into the backend-neutral error.
fn map_kube_error(e: kube::Error) -> ClusterError {
    match e {
        kube::Error::Api(ae) => match ae.code {
            409 => ClusterError::AlreadyExists(ae.message),
            404 => ClusterError::NotFound(ae.message),
            429 | 500..=599 => ClusterError::Transient(ae.message),
            _ => ClusterError::Rejected(format!("{} ({})", ae.message, ae.code)),
        },
        kube::Error::SerdeError(e) => ClusterError::Rejected(e.to_string()),
        other => ClusterError::Transient(other.to_string()),
    }
}

impl ClusterBackend for KubeClusterBackend {
    async fn init(&self) -> Result<(), ClusterError> {
        let version = self
            .client
            .apiserver_version()
            .await
            .map_err(map_kube_error)?;
        info!(
            version = %version.git_version,
            namespace = %self.namespace,
            "Connected to Kubernetes"
        );
        Ok(())
    }

    async fn create(&self, manifest: &Manifest) -> Result<ExecutionHandle, ClusterError> {
        let pod = prepare_pod(manifest, &self.namespace)?;
        let created = self
            .pods()
            .create(&PostParams::default(), &pod)
            .await
            .map_err(map_kube_error)?;

        let unit = created
            .metadata
            .name
            .unwrap_or_else(|| manifest.unit_name.clone());
        debug!(job_id = %manifest.job_id, unit, "Pod created");

        Ok(ExecutionHandle {
            job_id: manifest.job_id.clone(),
            unit,
        })
    }

    async fn status(&self, unit: &str) -> Result<UnitStatus, ClusterError> {
        let pod = self.pods().get(unit).await.map_err(map_kube_error)?;
        Ok(classify(&pod))
    }

    async fn inspect(&self, unit: &str) -> Result<UnitInfo, ClusterError> {
        let pod = self.pods().get(unit).await.map_err(map_kube_error)?;
        Ok(owner(&pod))
    }

    async fn delete(&self, unit: &str) -> Result<(), ClusterError> {
        match self.pods().delete(unit, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(unit, "Pod already gone");
                Ok(())
            }
            Err(e) => Err(map_kube_error(e)),
        }
    }

    async fn list(&self, selector: &str) -> Result<Vec<String>, ClusterError> {
        let pods = self
            .pods()
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(map_kube_error)?;

        Ok(pods
            .items
            .into_iter()
            .filter_map(|p| p.metadata.name)
            .collect())
    }

    async fn copy_from(
        &self,
        unit: &str,
        container: &str,
        path: &Path,
    ) -> Result<Bytes, ClusterError> {
        let path = path.to_string_lossy().to_string();
        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(false);

        let mut attached = self
            .pods()
            .exec(unit, vec!["cat".to_string(), path.clone()], &params)
            .await
            .map_err(map_kube_error)?;

        let mut stdout = attached
            .stdout()
            .ok_or_else(|| ClusterError::Rejected("exec session has no stdout".into()))?;
        let mut buf = Vec::new();
        stdout
            .read_to_end(&mut buf)
            .await
            .map_err(|e| ClusterError::Transient(format!("reading {path} from {unit}: {e}")))?;

        if let Some(status) = attached.take_status()
            && let Some(status) = status.await
            && status.status.as_deref() == Some("Failure")
        {
            return Err(ClusterError::NotFound(format!(
                "{path} in {unit}/{container}: {}",
                status.message.unwrap_or_default()
            )));
        }

        debug!(unit, container, path, bytes = buf.len(), "Copied file out of pod");
        Ok(Bytes::from(buf))
    }

    async fn logs(&self, unit: &str, tail: usize) -> Result<String, ClusterError> {
        let params = LogParams {
            tail_lines: Some(tail as i64),
            ..Default::default()
        };
        self.pods()
            .logs(unit, &params)
            .await
            .map_err(map_kube_error)
    }
}
