use crate::error::*;
use crate::job::{ExecutionHandle, JobRecord, Manifest, UnitInfo, UnitStatus};

use bytes::Bytes;
use std::path::{Path, PathBuf};

/// A trait for injecting cluster access into the orchestrator.
///
/// Implementations translate their native errors into [`ClusterError`] and must report
/// retryable failures as [`ClusterError::Transient`].
pub trait ClusterBackend: Send + Sync + 'static + Clone {
    /// Checks that the cluster is reachable.
    fn init(&self) -> impl Future<Output = Result<(), ClusterError>> + Send {
        async { Ok(()) }
    }

    /// Creates the execution unit described by `manifest`.
    ///
    /// Returns [`ClusterError::AlreadyExists`] when a unit with the same name exists.
    fn create(
        &self,
        manifest: &Manifest,
    ) -> impl Future<Output = Result<ExecutionHandle, ClusterError>> + Send;

    /// Reads the current status of an execution unit.
    fn status(&self, unit: &str) -> impl Future<Output = Result<UnitStatus, ClusterError>> + Send;

    /// Reads the ownership labels of an execution unit.
    fn inspect(&self, unit: &str) -> impl Future<Output = Result<UnitInfo, ClusterError>> + Send;

    /// Deletes an execution unit. Deleting a unit that is already gone succeeds.
    fn delete(&self, unit: &str) -> impl Future<Output = Result<(), ClusterError>> + Send;

    /// Lists the names of execution units matching a label selector.
    fn list(&self, selector: &str)
    -> impl Future<Output = Result<Vec<String>, ClusterError>> + Send;

    /// Optional: Copies a file out of a container of a live execution unit.
    fn copy_from(
        &self,
        _unit: &str,
        _container: &str,
        _path: &Path,
    ) -> impl Future<Output = Result<Bytes, ClusterError>> + Send {
        async {
            Err(ClusterError::Unsupported(
                "Copying files is not supported by this backend".into(),
            ))
        }
    }

    /// Optional: Returns the last `tail` lines of the unit's log.
    fn logs(
        &self,
        _unit: &str,
        _tail: usize,
    ) -> impl Future<Output = Result<String, ClusterError>> + Send {
        async {
            Err(ClusterError::Unsupported(
                "Logs are not supported by this backend".into(),
            ))
        }
    }
}

/// A trait for injecting output storage into the orchestrator.
///
/// Paths handed to the store are paths as the execution unit sees them.
pub trait OutputStore: Send + Sync + 'static + Clone {
    /// Maps a path inside the execution unit to the path the orchestrator reads.
    fn locate(&self, unit_path: &Path) -> PathBuf;

    /// Checks if a file exists.
    fn exists(&self, unit_path: &Path)
    -> impl Future<Output = Result<bool, StorageError>> + Send;

    /// Returns the most recently modified file in `dir` with the given extension.
    fn newest_matching(
        &self,
        dir: &Path,
        extension: &str,
    ) -> impl Future<Output = Result<Option<PathBuf>, StorageError>> + Send;

    /// Stores a copied artifact for `job_id` and returns its local path.
    fn write(
        &self,
        job_id: &str,
        file_name: &str,
        data: Bytes,
    ) -> impl Future<Output = Result<PathBuf, StorageError>> + Send;

    /// Optional: Loads the job records kept by [`save_records`](Self::save_records).
    fn load_records(&self) -> impl Future<Output = Result<Vec<JobRecord>, StorageError>> + Send {
        async { Ok(Vec::new()) }
    }

    /// Optional: Replaces the kept job records with `records`.
    fn save_records(
        &self,
        _records: &[JobRecord],
    ) -> impl Future<Output = Result<(), StorageError>> + Send {
        async { Ok(()) }
    }
}
