//! # Kiln Compute Mock
//!
//! A scripted, in-memory [`ClusterBackend`] for tests and local development.
//!
//! Every execution unit replays a script of status observations. The last step repeats
//! forever, so `[Pending, Running, Succeeded]` ends in `Succeeded`.
//!
//! **DO NOT use this in production!!!** Nothing is ever executed.
//!
//! ## Usage
//!
//! ```rust
//! # use kiln_compute_mock::ScriptedCluster;
//! # use kiln_core::prelude::*;
//! let cluster = ScriptedCluster::new();
//! cluster.script(
//!     "job-1",
//!     vec![
//!         Ok(UnitStatus::new(UnitPhase::Running)),
//!         Ok(UnitStatus::new(UnitPhase::Failed("exit code 1".into()))),
//!     ],
//! );
//! ```

use bytes::Bytes;
use kiln_core::prelude::*;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// One scripted answer to a status query.
pub type Step = Result<UnitStatus, ClusterError>;

type SuccessHook = Arc<dyn Fn(&Manifest) + Send + Sync>;

#[derive(Clone, Default)]
pub struct ScriptedCluster {
    state: Arc<Mutex<State>>,
    on_success: Arc<Mutex<Option<SuccessHook>>>,
}

#[derive(Default)]
struct State {
    default_script: Vec<Step>,
    scripts: HashMap<String, Vec<Step>>,
    units: BTreeMap<String, Unit>,
    create_failures: VecDeque<ClusterError>,
    lost_responses: u32,
    delete_failures: u32,
    stalled_deletes: u32,
    files: HashMap<PathBuf, Bytes>,
    logs: String,
    created: Vec<String>,
    deleted: Vec<String>,
    create_attempts: u32,
    copies: u32,
    max_active: usize,
}

struct Unit {
    manifest: Option<Manifest>,
    job_id: Option<String>,
    model: Option<String>,
    steps: VecDeque<Step>,
    phase: UnitPhase,
    succeeded_once: bool,
}

impl State {
    fn active(&self) -> usize {
        self.units
            .values()
            .filter(|u| matches!(u.phase, UnitPhase::Pending | UnitPhase::Running))
            .count()
    }
}

impl ScriptedCluster {
    /// Every unit goes `Pending -> Running -> Succeeded` unless scripted otherwise.
    pub fn new() -> Self {
        Self::with_default_script(vec![
            Ok(UnitStatus::new(UnitPhase::Pending)),
            Ok(UnitStatus::new(UnitPhase::Running)),
            Ok(UnitStatus::new(UnitPhase::Succeeded)),
        ])
    }

    pub fn with_default_script(steps: Vec<Step>) -> Self {
        let cluster = Self::default();
        cluster.state.lock().default_script = steps;
        cluster
    }

    /// Scripts the status observations of the unit created for `job_id`.
    pub fn script(&self, job_id: &str, steps: Vec<Step>) {
        self.state.lock().scripts.insert(job_id.to_string(), steps);
    }

    /// The next `create` calls fail with these errors, in order.
    pub fn fail_creates(&self, errors: impl IntoIterator<Item = ClusterError>) {
        self.state.lock().create_failures.extend(errors);
    }

    /// The next `n` successful creates still create the unit but report a transient error, as if
    /// the response got lost on the way back.
    pub fn lose_create_responses(&self, n: u32) {
        self.state.lock().lost_responses = n;
    }

    /// The next `n` delete calls fail with a transient error.
    pub fn fail_deletes(&self, n: u32) {
        self.state.lock().delete_failures = n;
    }

    /// The next `n` delete calls never complete, like requests to an unresponsive API server.
    pub fn stall_deletes(&self, n: u32) {
        self.state.lock().stalled_deletes = n;
    }

    /// Makes `path` available to `copy_from`.
    pub fn add_file(&self, path: impl Into<PathBuf>, data: impl Into<Bytes>) {
        self.state.lock().files.insert(path.into(), data.into());
    }

    pub fn set_logs(&self, logs: impl Into<String>) {
        self.state.lock().logs = logs.into();
    }

    /// Runs `hook` the first time a unit reports `Succeeded`, e.g. to write its output file.
    pub fn on_success(&self, hook: impl Fn(&Manifest) + Send + Sync + 'static) {
        *self.on_success.lock() = Some(Arc::new(hook));
    }

    /// Adds a unit that was not created through this backend, like a leftover from a previous run.
    pub fn insert_unit(&self, name: &str, phase: UnitPhase) {
        self.state.lock().units.insert(
            name.to_string(),
            Unit {
                manifest: None,
                job_id: None,
                model: None,
                steps: VecDeque::from([Ok(UnitStatus::new(phase.clone()))]),
                phase,
                succeeded_once: false,
            },
        );
    }

    /// Adds a unit labelled as created for `job_id`, like one left running by a previous process.
    pub fn insert_owned_unit(&self, name: &str, job_id: &str, model: &str, steps: Vec<Step>) {
        self.state.lock().units.insert(
            name.to_string(),
            Unit {
                manifest: None,
                job_id: Some(job_id.to_string()),
                model: Some(model.to_string()),
                steps: steps.into(),
                phase: UnitPhase::Running,
                succeeded_once: false,
            },
        );
    }

    /// Names of all units ever created, in creation order.
    pub fn created(&self) -> Vec<String> {
        self.state.lock().created.clone()
    }

    /// Names of all units deleted, in deletion order.
    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().deleted.clone()
    }

    pub fn exists(&self, unit: &str) -> bool {
        self.state.lock().units.contains_key(unit)
    }

    pub fn create_attempts(&self) -> u32 {
        self.state.lock().create_attempts
    }

    pub fn copies(&self) -> u32 {
        self.state.lock().copies
    }

    /// Units currently pending or running.
    pub fn active(&self) -> usize {
        self.state.lock().active()
    }

    /// Highest number of units ever pending or running at the same time.
    pub fn max_active(&self) -> usize {
        self.state.lock().max_active
    }
}

impl ClusterBackend for ScriptedCluster {
    async fn create(&self, manifest: &Manifest) -> Result<ExecutionHandle, ClusterError> {
        let mut state = self.state.lock();
        state.create_attempts += 1;

        if let Some(err) = state.create_failures.pop_front() {
            debug!(unit = %manifest.unit_name, error = %err, "Injected create failure");
            return Err(err);
        }
        if state.units.contains_key(&manifest.unit_name) {
            return Err(ClusterError::AlreadyExists(manifest.unit_name.clone()));
        }

        let steps = state
            .scripts
            .get(&manifest.job_id)
            .unwrap_or(&state.default_script)
            .clone();
        state.units.insert(
            manifest.unit_name.clone(),
            Unit {
                manifest: Some(manifest.clone()),
                job_id: Some(manifest.job_id.clone()),
                model: Some(manifest.model.clone()),
                steps: steps.into(),
                phase: UnitPhase::Pending,
                succeeded_once: false,
            },
        );
        state.created.push(manifest.unit_name.clone());
        state.max_active = state.max_active.max(state.active());

        if state.lost_responses > 0 {
            state.lost_responses -= 1;
            debug!(unit = %manifest.unit_name, "Dropped create response");
            return Err(ClusterError::Transient("timeout reading response".into()));
        }

        Ok(ExecutionHandle {
            job_id: manifest.job_id.clone(),
            unit: manifest.unit_name.clone(),
        })
    }

    async fn status(&self, unit: &str) -> Result<UnitStatus, ClusterError> {
        let (step, fire) = {
            let mut state = self.state.lock();
            let entry = state
                .units
                .get_mut(unit)
                .ok_or_else(|| ClusterError::NotFound(unit.to_string()))?;

            let step = if entry.steps.len() > 1 {
                entry.steps.pop_front()
            } else {
                entry.steps.front().cloned()
            }
            .unwrap_or_else(|| Ok(UnitStatus::new(entry.phase.clone())));

            let mut fire = None;
            if let Ok(status) = &step {
                entry.phase = status.phase.clone();
                if status.phase == UnitPhase::Succeeded && !entry.succeeded_once {
                    entry.succeeded_once = true;
                    fire = entry.manifest.clone();
                }
            }
            state.max_active = state.max_active.max(state.active());
            (step, fire)
        };

        if let Some(manifest) = fire {
            let hook = self.on_success.lock().clone();
            if let Some(hook) = hook {
                hook(&manifest);
            }
        }

        step
    }

    async fn inspect(&self, unit: &str) -> Result<UnitInfo, ClusterError> {
        let state = self.state.lock();
        let entry = state
            .units
            .get(unit)
            .ok_or_else(|| ClusterError::NotFound(unit.to_string()))?;

        Ok(UnitInfo {
            name: unit.to_string(),
            job_id: entry.job_id.clone(),
            model: entry.model.clone(),
        })
    }

    async fn delete(&self, unit: &str) -> Result<(), ClusterError> {
        let stall = {
            let mut state = self.state.lock();
            let stall = state.stalled_deletes > 0;
            state.stalled_deletes = state.stalled_deletes.saturating_sub(1);
            stall
        };
        if stall {
            debug!(unit, "Stalling delete");
            std::future::pending::<()>().await;
        }

        let mut state = self.state.lock();
        if state.delete_failures > 0 {
            state.delete_failures -= 1;
            return Err(ClusterError::Transient("injected delete failure".into()));
        }
        if state.units.remove(unit).is_some() {
            state.deleted.push(unit.to_string());
        }
        Ok(())
    }

    async fn list(&self, _selector: &str) -> Result<Vec<String>, ClusterError> {
        Ok(self.state.lock().units.keys().cloned().collect())
    }

    async fn copy_from(
        &self,
        unit: &str,
        _container: &str,
        path: &Path,
    ) -> Result<Bytes, ClusterError> {
        let mut state = self.state.lock();
        if !state.units.contains_key(unit) {
            return Err(ClusterError::NotFound(unit.to_string()));
        }
        let data = state
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| ClusterError::Rejected(format!("{}: No such file", path.display())))?;
        state.copies += 1;
        Ok(data)
    }

    async fn logs(&self, unit: &str, tail: usize) -> Result<String, ClusterError> {
        let state = self.state.lock();
        if !state.units.contains_key(unit) {
            return Err(ClusterError::NotFound(unit.to_string()));
        }
        let lines: Vec<&str> = state.logs.lines().collect();
        let start = lines.len().saturating_sub(tail);
        Ok(lines[start..].join("\n"))
    }
}
