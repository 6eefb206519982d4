use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// What a model consumes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    Text,
    Audio,
    Image,
    ImageAudio,
    Video,
}

/// What a model produces.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Audio,
    Video,
    Image,
    Evaluation,
}

/// How the output of a succeeded job reaches the orchestrator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalStrategy {
    /// The output lands on a volume the orchestrator can see.
    #[default]
    Shared,
    /// The output has to be copied out of the execution unit before it is deleted.
    Copy,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    String,
    Integer,
    Float,
    Bool,
}

/// Schema of a single model parameter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParamSpec {
    #[serde(rename = "type")]
    pub kind: ParamType,
    /// Enumerated set of allowed values. Empty means unrestricted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<serde_json::Value>,
    /// Inclusive lower bound for numeric parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// Inclusive upper bound for numeric parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub required: bool,
    /// For `bool` parameters: the text rendered when the value is `true`
    /// (e.g. `--fp32`). `false` renders as an empty string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flag: Option<String>,
}

/// Where a job writes its result and how to get it back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputSpec {
    /// Base directory as seen from inside the execution unit. Each job writes into `<dir>/<job id>/`.
    pub dir: PathBuf,
    /// Deterministic file name, may contain `${JOB_ID}`. [`None`] when the model picks its own name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Extension used to select the newest output when `name` is not set (e.g. `wav`).
    pub extension: String,
    #[serde(default)]
    pub strategy: RetrievalStrategy,
    /// Container to copy from when using [`RetrievalStrategy::Copy`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceLimits {
    pub cpu: String,
    pub memory: String,
    pub gpu: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu: "8".to_string(),
            memory: "32Gi".to_string(),
            gpu: 1,
        }
    }
}

/// A manifest template loaded at startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManifestTemplate {
    /// Identifier of the template (its file name in the registry).
    pub id: String,
    #[serde(skip)]
    pub body: String,
}

/// Immutable catalog entry describing one kind of job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelDescriptor {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Working directory of the model checkout on the shared volume.
    pub workdir: PathBuf,
    /// Execution environment (virtualenv) used by the model scripts.
    pub environment: PathBuf,
    pub image: String,
    pub template: ManifestTemplate,
    pub input: InputKind,
    pub output_kind: OutputKind,
    /// Input slots the request must provide, e.g. `["image", "audio"]`.
    pub inputs: Vec<String>,
    pub params: BTreeMap<String, ParamSpec>,
    pub output: OutputSpec,
    pub resources: ResourceLimits,
    pub enabled: bool,
}
