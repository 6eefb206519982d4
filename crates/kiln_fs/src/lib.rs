//! # Kiln FileSystem Outputs
//!
//! An [`OutputStore`] on the file system.
//!
//! Execution units and the orchestrator usually mount the same shared volume at different
//! paths. [`FileSystemOutputs::with_mount`] maps paths under the unit's mount point onto the
//! orchestrator's local mount.
//!
//! ## Features
//!
//! * **Atomic Writes**: Copied artifacts go to a temporary file first and are renamed into place, so a
//!   reader never sees a partial result.
//! * **Job History**: With [`FileSystemOutputs::with_history`], finished job records are kept in a
//!   JSON file and survive a restart.
//!
//! ## Usage
//!
//! ```no_run
//! use kiln_fs::FileSystemOutputs;
//!
//! let outputs = FileSystemOutputs::new("./kiln_results")
//!     .with_mount("/data", "/mnt/shared")
//!     .with_history("./kiln_results/jobs.json");
//! ```

use bytes::Bytes;
use kiln_core::prelude::*;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

async fn atomic_write(path: &Path, data: Bytes) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(StorageError::Io)?;
    }

    let file_name = path
        .file_name()
        .ok_or_else(|| StorageError::System(format!("{} has no file name", path.display())))?;
    let tmp_path = path.with_file_name(format!(".{}.tmp", file_name.to_string_lossy()));

    fs::write(&tmp_path, data).await.map_err(StorageError::Io)?;
    fs::rename(&tmp_path, path)
        .await
        .map_err(StorageError::Io)?;

    Ok(())
}

#[derive(Clone, Debug)]
pub struct FileSystemOutputs {
    /// Where copied artifacts are stored.
    results: PathBuf,
    /// `(unit side, local side)` of the shared volume.
    mount: Option<(PathBuf, PathBuf)>,
    /// JSON file holding finished job records.
    history: Option<PathBuf>,
}

impl FileSystemOutputs {
    pub fn new(results: impl Into<PathBuf>) -> Self {
        Self {
            results: results.into(),
            mount: None,
            history: None,
        }
    }

    /// Keeps job records in the JSON file at `path`.
    pub fn with_history(mut self, path: impl Into<PathBuf>) -> Self {
        self.history = Some(path.into());
        self
    }

    /// Maps paths below `unit_path` (as seen by execution units) to `local_path`.
    pub fn with_mount(
        mut self,
        unit_path: impl Into<PathBuf>,
        local_path: impl Into<PathBuf>,
    ) -> Self {
        self.mount = Some((unit_path.into(), local_path.into()));
        self
    }

    pub fn results_dir(&self) -> &Path {
        &self.results
    }

    fn get_result_path(&self, job_id: &str, file_name: &str) -> Result<PathBuf, StorageError> {
        let name = Path::new(file_name)
            .file_name()
            .filter(|n| *n == std::ffi::OsStr::new(file_name))
            .ok_or_else(|| StorageError::System(format!("invalid file name '{file_name}'")))?;
        Ok(self.results.join(job_id).join(name))
    }
}

impl OutputStore for FileSystemOutputs {
    fn locate(&self, unit_path: &Path) -> PathBuf {
        match &self.mount {
            Some((unit_root, local_root)) => match unit_path.strip_prefix(unit_root) {
                Ok(rest) => local_root.join(rest),
                Err(_) => unit_path.to_path_buf(),
            },
            None => unit_path.to_path_buf(),
        }
    }

    async fn exists(&self, unit_path: &Path) -> Result<bool, StorageError> {
        let path = self.locate(unit_path);
        Ok(fs::try_exists(&path).await? && fs::metadata(&path).await?.is_file())
    }

    async fn newest_matching(
        &self,
        dir: &Path,
        extension: &str,
    ) -> Result<Option<PathBuf>, StorageError> {
        let dir = self.locate(dir);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::Io(e)),
        };

        let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let matches = path
                .extension()
                .is_some_and(|ext| ext.to_string_lossy().eq_ignore_ascii_case(extension));
            if !matches {
                continue;
            }

            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let modified = metadata.modified()?;

            // Ties resolve to the greater name so the pick does not depend on directory order.
            let newer = match &newest {
                None => true,
                Some((time, current)) => (modified, &path) > (*time, current),
            };
            if newer {
                newest = Some((modified, path));
            }
        }

        debug!(
            dir = %dir.display(),
            extension,
            found = ?newest.as_ref().map(|(_, p)| p),
            "Scanned output directory"
        );
        Ok(newest.map(|(_, path)| path))
    }

    async fn write(
        &self,
        job_id: &str,
        file_name: &str,
        data: Bytes,
    ) -> Result<PathBuf, StorageError> {
        let path = self.get_result_path(job_id, file_name)?;
        atomic_write(&path, data).await?;
        Ok(path)
    }

    async fn load_records(&self) -> Result<Vec<JobRecord>, StorageError> {
        let Some(path) = &self.history else {
            return Ok(Vec::new());
        };

        let data = match fs::read(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::Io(e)),
        };
        let records: Vec<JobRecord> = serde_json::from_slice(&data).map_err(|e| {
            StorageError::System(format!("failed to parse {}: {e}", path.display()))
        })?;

        debug!(path = %path.display(), count = records.len(), "Loaded job history");
        Ok(records)
    }

    async fn save_records(&self, records: &[JobRecord]) -> Result<(), StorageError> {
        let Some(path) = &self.history else {
            return Ok(());
        };

        let data = serde_json::to_vec_pretty(records)
            .map_err(|e| StorageError::System(format!("failed to encode job history: {e}")))?;
        atomic_write(path, Bytes::from(data)).await?;

        debug!(path = %path.display(), count = records.len(), "Saved job history");
        Ok(())
    }
}
