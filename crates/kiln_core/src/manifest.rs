//! Rendering of execution manifests.
//!
//! [`render`] is a pure function of a [`ModelDescriptor`], a [`JobRequest`] and a job id.
//! It performs no I/O, so rendering the same inputs twice yields byte-identical manifests.
//!
//! Templates use `${NAME}` placeholders, `$$` for a literal `$`. A `$` that does not start a
//! placeholder is kept as is, so shell snippets like `$HOME` survive untouched.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use crate::constants::placeholders::*;
use crate::error::TemplateError;
use crate::job::{JobRequest, Manifest, OutputTarget};
use crate::model::{ModelDescriptor, ParamSpec, ParamType};

/// Characters that would end a quoted shell word or start an expansion.
const FORBIDDEN_PATH_CHARS: &[char] = &['"', '`', '$', '\\'];

/// Kubernetes object names are limited to 63 characters.
const MAX_UNIT_NAME: usize = 63;
const MAX_JOB_ID: usize = 128;

/// Renders the descriptor's template for `request`.
pub fn render(
    descriptor: &ModelDescriptor,
    request: &JobRequest,
    job_id: &str,
) -> Result<Manifest, TemplateError> {
    validate_job_id(job_id)?;

    let params = resolve_params(descriptor, request)?;
    let inputs = resolve_inputs(descriptor, request)?;

    let unit_name = unit_name(&descriptor.id, job_id);
    let mut values = BTreeMap::new();
    values.insert(JOB_ID.to_string(), job_id.to_string());
    values.insert(POD_NAME.to_string(), unit_name.clone());
    values.insert(MODEL_ID.to_string(), descriptor.id.clone());
    values.insert(IMAGE.to_string(), descriptor.image.clone());
    values.insert(
        MODEL_DIR.to_string(),
        descriptor.workdir.display().to_string(),
    );
    values.insert(
        ENVIRONMENT.to_string(),
        descriptor.environment.display().to_string(),
    );
    values.insert(CPU_LIMIT.to_string(), descriptor.resources.cpu.clone());
    values.insert(
        MEMORY_LIMIT.to_string(),
        descriptor.resources.memory.clone(),
    );
    values.insert(
        GPU_LIMIT.to_string(),
        descriptor.resources.gpu.to_string(),
    );

    for (slot, path) in inputs {
        values.insert(input_key(&slot), path);
    }

    let output = output_target(descriptor, job_id, &values)?;
    values.insert(OUTPUT_DIR.to_string(), output.dir.display().to_string());
    if let Some(file) = &output.file {
        values.insert(OUTPUT_PATH.to_string(), file.display().to_string());
    }

    for (name, value) in params {
        values.insert(name.to_uppercase(), value);
    }

    let body = substitute(&descriptor.template.body, &values)?;

    Ok(Manifest {
        job_id: job_id.to_string(),
        model: descriptor.id.clone(),
        unit_name,
        body,
        output,
    })
}

fn output_target(
    descriptor: &ModelDescriptor,
    job_id: &str,
    values: &BTreeMap<String, String>,
) -> Result<OutputTarget, TemplateError> {
    let dir = descriptor.output.dir.join(job_id);
    let file = match &descriptor.output.name {
        Some(name) => Some(dir.join(substitute(name, values)?)),
        None => None,
    };

    Ok(OutputTarget {
        dir,
        file,
        extension: descriptor.output.extension.clone(),
        strategy: descriptor.output.strategy,
        container: descriptor.output.container.clone(),
    })
}

/// Output location of a job whose request is no longer known, e.g. one found running at startup.
///
/// A declared name that needs more than the job id falls back to the newest matching file in
/// the per-job directory.
pub fn recovered_output(descriptor: &ModelDescriptor, job_id: &str) -> OutputTarget {
    let mut values = BTreeMap::new();
    values.insert(JOB_ID.to_string(), job_id.to_string());
    values.insert(POD_NAME.to_string(), unit_name(&descriptor.id, job_id));
    values.insert(MODEL_ID.to_string(), descriptor.id.clone());

    output_target(descriptor, job_id, &values).unwrap_or_else(|_| OutputTarget {
        dir: descriptor.output.dir.join(job_id),
        file: None,
        extension: descriptor.output.extension.clone(),
        strategy: descriptor.output.strategy,
        container: descriptor.output.container.clone(),
    })
}

/// Validates the request's parameters against the schema and returns their rendered text.
///
/// Missing optional parameters take their declared default. Parameters without a value or
/// default are left out, so a template that references them fails with
/// [`TemplateError::UnresolvedPlaceholder`].
pub fn resolve_params(
    descriptor: &ModelDescriptor,
    request: &JobRequest,
) -> Result<BTreeMap<String, String>, TemplateError> {
    if let Some(unknown) = request
        .params
        .keys()
        .find(|k| !descriptor.params.contains_key(*k))
    {
        return Err(TemplateError::UnknownParameter(unknown.clone()));
    }

    let mut rendered = BTreeMap::new();
    for (name, spec) in &descriptor.params {
        let value = match request.params.get(name).or(spec.default.as_ref()) {
            Some(value) => value,
            None if spec.required => return Err(TemplateError::MissingParameter(name.clone())),
            None => continue,
        };
        rendered.insert(name.clone(), check_param(name, spec, value)?);
    }

    Ok(rendered)
}

/// Checks one value against its spec and renders it as template text.
pub fn check_param(
    name: &str,
    spec: &ParamSpec,
    value: &serde_json::Value,
) -> Result<String, TemplateError> {
    let invalid = |reason: String| TemplateError::InvalidParameter {
        name: name.to_string(),
        reason,
    };

    let text = match spec.kind {
        ParamType::String => {
            let s = value
                .as_str()
                .ok_or_else(|| invalid(format!("expected a string, got {value}")))?;
            if s.chars().any(char::is_control) {
                return Err(invalid("control characters are not allowed".into()));
            }
            s.to_string()
        }
        ParamType::Integer => {
            let n = value
                .as_i64()
                .ok_or_else(|| invalid(format!("expected an integer, got {value}")))?;
            check_range(spec, n as f64).map_err(invalid)?;
            n.to_string()
        }
        ParamType::Float => {
            let n = value
                .as_f64()
                .ok_or_else(|| invalid(format!("expected a number, got {value}")))?;
            check_range(spec, n).map_err(invalid)?;
            value.to_string()
        }
        ParamType::Bool => {
            let b = value
                .as_bool()
                .ok_or_else(|| invalid(format!("expected a boolean, got {value}")))?;
            match &spec.flag {
                Some(flag) if b => flag.clone(),
                Some(_) => String::new(),
                None => b.to_string(),
            }
        }
    };

    if !spec.choices.is_empty() && !spec.choices.iter().any(|c| same_value(c, value)) {
        let allowed: Vec<String> = spec.choices.iter().map(|c| c.to_string()).collect();
        return Err(invalid(format!(
            "{value} is not one of [{}]",
            allowed.join(", ")
        )));
    }

    Ok(text)
}

fn check_range(spec: &ParamSpec, n: f64) -> Result<(), String> {
    if let Some(min) = spec.min
        && n < min
    {
        return Err(format!("{n} is below the minimum of {min}"));
    }
    if let Some(max) = spec.max
        && n > max
    {
        return Err(format!("{n} is above the maximum of {max}"));
    }
    Ok(())
}

/// `4` and `4.0` are the same choice.
fn same_value(a: &serde_json::Value, b: &serde_json::Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn resolve_inputs(
    descriptor: &ModelDescriptor,
    request: &JobRequest,
) -> Result<BTreeMap<String, String>, TemplateError> {
    if let Some(extra) = request
        .inputs
        .keys()
        .find(|slot| !descriptor.inputs.contains(slot))
    {
        return Err(TemplateError::UnknownInput(extra.clone()));
    }

    descriptor
        .inputs
        .iter()
        .map(|slot| match request.inputs.get(slot) {
            Some(path) if !path.as_os_str().is_empty() => {
                Ok((slot.clone(), check_input(slot, path)?))
            }
            _ => Err(TemplateError::MissingInput(slot.clone())),
        })
        .collect()
}

/// Input paths are pasted into quoted shell commands inside YAML, so only plain absolute paths
/// are accepted.
pub fn check_input(slot: &str, path: &Path) -> Result<String, TemplateError> {
    let invalid = |reason: &str| TemplateError::InvalidInput {
        slot: slot.to_string(),
        reason: reason.to_string(),
    };

    let text = path
        .to_str()
        .ok_or_else(|| invalid("path is not valid UTF-8"))?;
    if !path.is_absolute() {
        return Err(invalid("path must be absolute"));
    }
    if text.chars().any(char::is_control) {
        return Err(invalid("control characters are not allowed"));
    }
    if text.contains(FORBIDDEN_PATH_CHARS) {
        return Err(invalid("quotes, backticks, '$' and '\\' are not allowed"));
    }
    if path.components().any(|c| c == Component::ParentDir) {
        return Err(invalid("'..' components are not allowed"));
    }

    Ok(text.to_string())
}

/// Placeholder key of an input slot, e.g. `video` -> `INPUT_VIDEO`.
pub fn input_key(slot: &str) -> String {
    format!("{INPUT_PREFIX}{}", slot.to_uppercase())
}

/// Replaces every `${NAME}` in `template` with its value.
pub fn substitute(
    template: &str,
    values: &BTreeMap<String, String>,
) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos + 1..];

        if let Some(after) = tail.strip_prefix('$') {
            out.push('$');
            rest = after;
        } else if let Some(after) = tail.strip_prefix('{') {
            let end = after
                .find('}')
                .ok_or_else(|| TemplateError::Malformed("unterminated '${'".into()))?;
            let name = &after[..end];
            if name.is_empty()
                || !name
                    .chars()
                    .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
            {
                return Err(TemplateError::Malformed(format!(
                    "invalid placeholder name '{name}'"
                )));
            }
            let value = values
                .get(name)
                .ok_or_else(|| TemplateError::UnresolvedPlaceholder(name.to_string()))?;
            out.push_str(value);
            rest = &after[end + 1..];
        } else {
            out.push('$');
            rest = tail;
        }
    }

    out.push_str(rest);
    Ok(out)
}

/// Job ids end up in object names and paths, so they are restricted to a safe alphabet.
pub fn validate_job_id(id: &str) -> Result<(), TemplateError> {
    let valid = !id.is_empty()
        && id.len() <= MAX_JOB_ID
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

    if valid {
        Ok(())
    } else {
        Err(TemplateError::InvalidJobId(id.to_string()))
    }
}

/// Derives a Kubernetes-compliant name for the execution unit of a job.
pub fn unit_name(model_id: &str, job_id: &str) -> String {
    let raw = if job_id.starts_with(&format!("{model_id}-")) {
        format!("gpu-{job_id}")
    } else {
        format!("gpu-{model_id}-{job_id}")
    };

    let mut name: String = raw
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();

    if name.len() > MAX_UNIT_NAME {
        // Keep names of distinct long ids distinct.
        let suffix = format!("{:08x}", fnv1a(raw.as_bytes()) as u32);
        name.truncate(MAX_UNIT_NAME - suffix.len() - 1);
        name = format!("{}-{}", name.trim_end_matches('-'), suffix);
    }

    name.trim_end_matches('-').to_string()
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf29ce484222325, |hash, b| {
        (hash ^ *b as u64).wrapping_mul(0x100000001b3)
    })
}

/// Path of an output file relative to the per-job output directory.
pub fn output_file_name(target: &OutputTarget) -> Option<PathBuf> {
    target
        .file
        .as_ref()
        .and_then(|f| f.file_name())
        .map(PathBuf::from)
}
