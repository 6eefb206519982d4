//! Locates the output of a succeeded job.

use kiln_core::prelude::*;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct OutputRetriever<C: ClusterBackend, S: OutputStore> {
    cluster: C,
    store: S,
    grace: Duration,
    probe_interval: Duration,
}

impl<C: ClusterBackend, S: OutputStore> OutputRetriever<C, S> {
    pub fn new(cluster: C, store: S, grace: Duration, probe_interval: Duration) -> Self {
        Self {
            cluster,
            store,
            grace,
            probe_interval,
        }
    }

    /// Resolves the output of a succeeded job and stores its path on the record.
    ///
    /// Calling it again returns the stored path without touching the cluster or the store.
    pub async fn retrieve(
        &self,
        record: &mut JobRecord,
        target: &OutputTarget,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, JobError> {
        if let Some(path) = &record.output {
            return Ok(path.clone());
        }
        if record.phase != Phase::Succeeded {
            return Err(JobError::System(format!(
                "job {} is {}, output is only retrieved after success",
                record.id, record.phase
            )));
        }

        let deadline = Instant::now() + self.grace;
        loop {
            if let Some(path) = self.locate(record, target).await {
                info!(job_id = %record.id, path = %path.display(), "Output retrieved");
                record.output = Some(path.clone());
                return Ok(path);
            }

            if Instant::now() >= deadline {
                break;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.probe_interval) => {}
            }
        }

        let expected = target
            .file
            .as_ref()
            .map(|f| f.display().to_string())
            .unwrap_or_else(|| format!("*.{} in {}", target.extension, target.dir.display()));
        warn!(job_id = %record.id, expected, "Output missing");
        Err(JobError::OutputMissing(format!("no output found at {expected}")))
    }

    /// One attempt to find the output.
    async fn locate(&self, record: &JobRecord, target: &OutputTarget) -> Option<PathBuf> {
        let found = match target.strategy {
            RetrievalStrategy::Shared => self.locate_shared(target).await,
            RetrievalStrategy::Copy => self.copy_out(record, target).await,
        };

        match found {
            Ok(path) => path,
            Err(e) => {
                debug!(job_id = %record.id, error = %e, "Output not available yet");
                None
            }
        }
    }

    async fn locate_shared(&self, target: &OutputTarget) -> Result<Option<PathBuf>, String> {
        match &target.file {
            Some(file) => {
                let exists = self.store.exists(file).await.map_err(|e| e.to_string())?;
                Ok(exists.then(|| self.store.locate(file)))
            }
            None => self
                .store
                .newest_matching(&target.dir, &target.extension)
                .await
                .map_err(|e| e.to_string()),
        }
    }

    async fn copy_out(
        &self,
        record: &JobRecord,
        target: &OutputTarget,
    ) -> Result<Option<PathBuf>, String> {
        let (Some(unit), Some(file), Some(container)) =
            (&record.unit, &target.file, &target.container)
        else {
            return Err("copy retrieval needs a unit, a file name and a container".into());
        };
        let file_name = file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| format!("{} has no file name", file.display()))?;

        let data = self
            .cluster
            .copy_from(unit, container, file)
            .await
            .map_err(|e| e.to_string())?;
        let path = self
            .store
            .write(&record.id, &file_name, data)
            .await
            .map_err(|e| e.to_string())?;

        Ok(Some(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_compute_mock::ScriptedCluster;
    use kiln_fs::FileSystemOutputs;
    use tempfile::TempDir;

    fn succeeded(unit: &str) -> JobRecord {
        let mut record = JobRecord::new("job-1", "chatterbox");
        record.unit = Some(unit.to_string());
        for phase in [Phase::Pending, Phase::Running, Phase::Succeeded] {
            record.transition(phase, None).unwrap();
        }
        record
    }

    fn retriever(
        cluster: &ScriptedCluster,
        store: FileSystemOutputs,
    ) -> OutputRetriever<ScriptedCluster, FileSystemOutputs> {
        OutputRetriever::new(
            cluster.clone(),
            store,
            Duration::from_millis(60),
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn shared_declared_file() {
        let shared = TempDir::new().unwrap();
        std::fs::create_dir_all(shared.path().join("output/tts/job-1")).unwrap();
        std::fs::write(shared.path().join("output/tts/job-1/tts_job-1.wav"), b"RIFF").unwrap();

        let store = FileSystemOutputs::new("/unused").with_mount("/data", shared.path());
        let target = OutputTarget {
            dir: PathBuf::from("/data/output/tts/job-1"),
            file: Some(PathBuf::from("/data/output/tts/job-1/tts_job-1.wav")),
            extension: "wav".into(),
            strategy: RetrievalStrategy::Shared,
            container: None,
        };
        let mut record = succeeded("gpu-job-1");

        let path = retriever(&ScriptedCluster::new(), store)
            .retrieve(&mut record, &target, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(path, shared.path().join("output/tts/job-1/tts_job-1.wav"));
        assert_eq!(record.output, Some(path));
    }

    #[tokio::test]
    async fn shared_newest_by_extension() {
        let shared = TempDir::new().unwrap();
        let dir = shared.path().join("job-1");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("result_000.mp4"), b"video").unwrap();

        let target = OutputTarget {
            dir: dir.clone(),
            file: None,
            extension: "mp4".into(),
            strategy: RetrievalStrategy::Shared,
            container: None,
        };
        let mut record = succeeded("gpu-job-1");

        let path = retriever(&ScriptedCluster::new(), FileSystemOutputs::new("/unused"))
            .retrieve(&mut record, &target, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(path, dir.join("result_000.mp4"));
    }

    #[tokio::test]
    async fn missing_output_after_grace() {
        let shared = TempDir::new().unwrap();
        let target = OutputTarget {
            dir: shared.path().join("job-1"),
            file: None,
            extension: "wav".into(),
            strategy: RetrievalStrategy::Shared,
            container: None,
        };
        let mut record = succeeded("gpu-job-1");

        let err = retriever(&ScriptedCluster::new(), FileSystemOutputs::new("/unused"))
            .retrieve(&mut record, &target, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, JobError::OutputMissing(_)));
        assert_eq!(record.output, None);
    }

    #[tokio::test]
    async fn copy_is_idempotent() {
        let results = TempDir::new().unwrap();
        let cluster = ScriptedCluster::new();
        let manifest = Manifest {
            job_id: "job-1".into(),
            model: "syncnet".into(),
            unit_name: "gpu-job-1".into(),
            body: String::new(),
            output: OutputTarget {
                dir: PathBuf::from("/workspace/out/job-1"),
                file: Some(PathBuf::from("/workspace/out/job-1/summary.json")),
                extension: "json".into(),
                strategy: RetrievalStrategy::Copy,
                container: Some("results".into()),
            },
        };
        cluster.create(&manifest).await.unwrap();
        cluster.add_file("/workspace/out/job-1/summary.json", &b"{\"lse_c\": 7.1}"[..]);

        let retriever = retriever(&cluster, FileSystemOutputs::new(results.path()));
        let mut record = succeeded("gpu-job-1");
        let cancel = CancellationToken::new();

        let first = retriever
            .retrieve(&mut record, &manifest.output, &cancel)
            .await
            .unwrap();
        let second = retriever
            .retrieve(&mut record, &manifest.output, &cancel)
            .await
            .unwrap();

        assert_eq!(first, results.path().join("job-1/summary.json"));
        assert_eq!(first, second);
        assert_eq!(cluster.copies(), 1);
        assert_eq!(std::fs::read(&first).unwrap(), b"{\"lse_c\": 7.1}");
    }

    #[tokio::test]
    async fn refuses_jobs_that_did_not_succeed() {
        let mut record = JobRecord::new("job-1", "chatterbox");
        record.transition(Phase::Pending, None).unwrap();
        record.fail(FailureKind::Execution, "exit code 1");
        let target = OutputTarget {
            dir: PathBuf::from("/data"),
            file: None,
            extension: "wav".into(),
            strategy: RetrievalStrategy::Shared,
            container: None,
        };

        let result = retriever(&ScriptedCluster::new(), FileSystemOutputs::new("/unused"))
            .retrieve(&mut record, &target, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(JobError::System(_))));
    }
}
