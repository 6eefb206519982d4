use kiln_core::prelude::*;
use kiln_runner::prelude::*;

#[derive(Clone)]
pub struct AppState<C: ClusterBackend, S: OutputStore> {
    pub orchestrator: Orchestrator<C, S>,
}
