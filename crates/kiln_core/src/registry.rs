//! The static model catalog.
//!
//! Loaded once from a YAML file at startup and never mutated afterwards.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::constants::placeholders;
use crate::error::{JobError, RegistryError};
use crate::manifest::check_param;
use crate::model::*;

/// On-disk format of the registry file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RegistryConfig {
    #[serde(default)]
    pub models: Vec<ModelConfig>,
}

/// One model entry of the registry file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub workdir: PathBuf,
    pub environment: PathBuf,
    pub image: String,
    /// Template file, relative to the registry file's directory.
    pub template: PathBuf,
    pub input: InputKind,
    pub output_kind: OutputKind,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub params: BTreeMap<String, ParamSpec>,
    pub output: OutputSpec,
    #[serde(default)]
    pub resources: ResourceLimits,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: BTreeMap<String, Arc<ModelDescriptor>>,
}

impl ModelRegistry {
    /// Loads the registry from a YAML file. Template paths resolve against the file's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| RegistryError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: RegistryConfig = serde_yaml::from_str(&raw)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));

        let registry = Self::from_config(config, base)?;
        info!(
            path = %path.display(),
            models = registry.models.len(),
            "Model registry loaded"
        );
        Ok(registry)
    }

    /// Builds the registry from an already parsed config, reading templates from `base`.
    pub fn from_config(config: RegistryConfig, base: &Path) -> Result<Self, RegistryError> {
        let descriptors = config
            .models
            .into_iter()
            .map(|model| {
                let template_path = base.join(&model.template);
                let body = std::fs::read_to_string(&template_path).map_err(|source| {
                    RegistryError::Io {
                        path: template_path.display().to_string(),
                        source,
                    }
                })?;
                debug!(model = %model.id, template = %template_path.display(), "Template loaded");

                Ok(ModelDescriptor {
                    template: ManifestTemplate {
                        id: model.template.display().to_string(),
                        body,
                    },
                    id: model.id,
                    name: model.name,
                    description: model.description,
                    workdir: model.workdir,
                    environment: model.environment,
                    image: model.image,
                    input: model.input,
                    output_kind: model.output_kind,
                    inputs: model.inputs,
                    params: model.params,
                    output: model.output,
                    resources: model.resources,
                    enabled: model.enabled,
                })
            })
            .collect::<Result<Vec<_>, RegistryError>>()?;

        Self::from_descriptors(descriptors)
    }

    /// Builds the registry from descriptors with their template bodies already loaded.
    pub fn from_descriptors(
        descriptors: impl IntoIterator<Item = ModelDescriptor>,
    ) -> Result<Self, RegistryError> {
        let mut models = BTreeMap::new();
        for descriptor in descriptors {
            validate(&descriptor)?;
            if models.contains_key(&descriptor.id) {
                return Err(RegistryError::DuplicateModel(descriptor.id));
            }
            models.insert(descriptor.id.clone(), Arc::new(descriptor));
        }
        Ok(Self { models })
    }

    /// Looks up a model. Disabled models resolve too.
    pub fn resolve(&self, id: &str) -> Result<Arc<ModelDescriptor>, JobError> {
        self.models
            .get(id)
            .cloned()
            .ok_or_else(|| JobError::ModelNotFound(id.to_string()))
    }

    /// Ids of enabled models, sorted.
    pub fn enabled(&self) -> Vec<String> {
        self.models
            .values()
            .filter(|m| m.enabled)
            .map(|m| m.id.clone())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ModelDescriptor>> {
        self.models.values()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Whether the model is enabled and its working directory is present.
    pub fn is_available(&self, id: &str) -> bool {
        self.models
            .get(id)
            .is_some_and(|m| m.enabled && m.workdir.exists())
    }
}

fn validate(descriptor: &ModelDescriptor) -> Result<(), RegistryError> {
    let invalid = |reason: String| RegistryError::InvalidModel {
        model: descriptor.id.clone(),
        reason,
    };

    if descriptor.id.is_empty()
        || !descriptor
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(invalid("id must be non-empty and alphanumeric".into()));
    }

    if descriptor.output.extension.is_empty() {
        return Err(invalid("output extension must not be empty".into()));
    }

    if descriptor.output.strategy == RetrievalStrategy::Copy {
        if descriptor.output.name.is_none() {
            return Err(invalid(
                "copy retrieval requires a deterministic output name".into(),
            ));
        }
        if descriptor.output.container.is_none() {
            return Err(invalid("copy retrieval requires a container".into()));
        }
    }

    for slot in &descriptor.inputs {
        if !is_key_fragment(slot) {
            return Err(invalid(format!("invalid input slot '{slot}'")));
        }
    }

    for (name, spec) in &descriptor.params {
        let key = name.to_uppercase();
        if !is_key_fragment(name)
            || placeholders::BUILTIN.contains(&key.as_str())
            || key.starts_with(placeholders::INPUT_PREFIX)
        {
            return Err(invalid(format!("parameter name '{name}' is not allowed")));
        }
        if spec.flag.is_some() && spec.kind != ParamType::Bool {
            return Err(invalid(format!(
                "parameter '{name}' declares a flag but is not a bool"
            )));
        }
        if let Some(default) = &spec.default {
            check_param(name, spec, default)
                .map_err(|e| invalid(format!("default does not validate: {e}")))?;
        }
    }

    Ok(())
}

fn is_key_fragment(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const REGISTRY: &str = r#"
models:
  - id: chatterbox
    name: Chatterbox TTS
    description: Text to speech with voice cloning
    workdir: /data/chatterbox
    environment: /data/chatterbox-venv
    image: registry.local/svfr-base:latest
    template: templates/chatterbox.yaml
    input: text
    output_kind: audio
    inputs: [text]
    params:
      voice:
        type: string
        choices: [default, female1, male1]
        default: default
      speed:
        type: float
        min: 0.5
        max: 2.0
        default: 1.0
    output:
      dir: /data/output/tts
      name: "tts_${JOB_ID}.wav"
      extension: wav
  - id: syncnet
    name: SyncNet
    workdir: /data/syncnet
    environment: /data/syncnet-venv
    image: registry.local/svfr-base:latest
    template: templates/syncnet.yaml
    input: video
    output_kind: evaluation
    inputs: [video]
    output:
      dir: /data/output/eval
      extension: json
    enabled: false
"#;

    fn write_registry(dir: &TempDir, registry: &str) -> PathBuf {
        let templates = dir.path().join("templates");
        std::fs::create_dir_all(&templates).unwrap();
        std::fs::write(templates.join("chatterbox.yaml"), "name: ${POD_NAME}\n").unwrap();
        std::fs::write(templates.join("syncnet.yaml"), "name: ${POD_NAME}\n").unwrap();

        let path = dir.path().join("models.yaml");
        std::fs::write(&path, registry).unwrap();
        path
    }

    #[test]
    fn loads_models_and_templates() {
        let dir = TempDir::new().unwrap();
        let registry = ModelRegistry::load(write_registry(&dir, REGISTRY)).unwrap();

        assert_eq!(registry.len(), 2);
        let tts = registry.resolve("chatterbox").unwrap();
        assert_eq!(tts.template.body, "name: ${POD_NAME}\n");
        assert_eq!(tts.template.id, "templates/chatterbox.yaml");
        assert_eq!(tts.params["speed"].max, Some(2.0));
        assert_eq!(tts.output.strategy, RetrievalStrategy::Shared);
        assert_eq!(tts.resources, ResourceLimits::default());
        assert!(tts.enabled);
    }

    #[test]
    fn disabled_models_resolve_but_are_not_listed() {
        let dir = TempDir::new().unwrap();
        let registry = ModelRegistry::load(write_registry(&dir, REGISTRY)).unwrap();

        assert!(!registry.resolve("syncnet").unwrap().enabled);
        assert_eq!(registry.enabled(), vec!["chatterbox".to_string()]);
        assert!(!registry.is_available("syncnet"));
        // The working directory does not exist on the test machine.
        assert!(!registry.is_available("chatterbox"));
    }

    #[test]
    fn unknown_model_is_not_found() {
        let registry = ModelRegistry::default();
        assert_eq!(
            registry.resolve("missing").unwrap_err(),
            JobError::ModelNotFound("missing".into())
        );
    }

    #[test]
    fn rejects_duplicate_ids() {
        let dir = TempDir::new().unwrap();
        let doubled = REGISTRY.replace("id: syncnet", "id: chatterbox");
        let err = ModelRegistry::load(write_registry(&dir, &doubled)).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateModel(id) if id == "chatterbox"));
    }

    #[test]
    fn rejects_missing_template() {
        let dir = TempDir::new().unwrap();
        let broken = REGISTRY.replace("templates/syncnet.yaml", "templates/nope.yaml");
        let err = ModelRegistry::load(write_registry(&dir, &broken)).unwrap_err();
        assert!(matches!(err, RegistryError::Io { .. }));
    }

    #[test]
    fn rejects_defaults_outside_constraints() {
        let dir = TempDir::new().unwrap();
        let broken = REGISTRY.replace("default: 1.0", "default: 3.0");
        let err = ModelRegistry::load(write_registry(&dir, &broken)).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidModel { model, .. } if model == "chatterbox"));
    }

    #[test]
    fn copy_strategy_needs_name_and_container() {
        let dir = TempDir::new().unwrap();
        let broken = REGISTRY.replace("extension: json", "extension: json\n      strategy: copy");
        let err = ModelRegistry::load(write_registry(&dir, &broken)).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidModel { model, .. } if model == "syncnet"));
    }

    #[test]
    fn rejects_parameter_shadowing_builtin() {
        let dir = TempDir::new().unwrap();
        let broken = REGISTRY.replace("      voice:\n", "      job_id:\n");
        let err = ModelRegistry::load(write_registry(&dir, &broken)).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidModel { .. }));
    }

    #[test]
    fn rejects_invalid_yaml() {
        let dir = TempDir::new().unwrap();
        let err = ModelRegistry::load(write_registry(&dir, "models: [oops")).unwrap_err();
        assert!(matches!(err, RegistryError::Parse(_)));
    }
}
