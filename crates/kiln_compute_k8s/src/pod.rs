//! Pod preparation and status classification.

use k8s_openapi::api::core::v1::{ContainerState, ContainerStatus, Pod};
use kiln_core::prelude::*;

/// Waiting reasons that will not resolve by themselves.
const FATAL_WAITING_REASONS: &[&str] = &[
    "ImagePullBackOff",
    "ErrImagePull",
    "InvalidImageName",
    "CreateContainerConfigError",
    "CreateContainerError",
    "CrashLoopBackOff",
];

/// Parses a rendered manifest into a Pod and stamps the name, namespace and ownership labels.
pub fn prepare_pod(manifest: &Manifest, namespace: &str) -> Result<Pod, ClusterError> {
    let mut pod: Pod = serde_yaml::from_str(&manifest.body)
        .map_err(|e| ClusterError::Rejected(format!("invalid pod manifest: {e}")))?;

    let meta = &mut pod.metadata;
    meta.name = Some(manifest.unit_name.clone());
    meta.namespace = Some(namespace.to_string());

    let pod_labels = meta.labels.get_or_insert_with(Default::default);
    pod_labels.insert(
        labels::MANAGED_BY.to_string(),
        labels::MANAGED_BY_VALUE.to_string(),
    );
    pod_labels.insert(labels::JOB_ID.to_string(), manifest.job_id.clone());
    pod_labels.insert(labels::MODEL.to_string(), manifest.model.clone());

    if pod.spec.as_ref().is_none_or(|s| s.containers.is_empty()) {
        return Err(ClusterError::Rejected(
            "pod manifest declares no containers".into(),
        ));
    }

    Ok(pod)
}

/// Reads the ownership labels stamped by [`prepare_pod`].
pub fn owner(pod: &Pod) -> UnitInfo {
    let label = |key: &str| {
        pod.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(key))
            .cloned()
    };

    UnitInfo {
        name: pod.metadata.name.clone().unwrap_or_default(),
        job_id: label(labels::JOB_ID),
        model: label(labels::MODEL),
    }
}

/// Maps a Pod to the phase of its execution unit.
///
/// The first container is the workload. A pod that keeps running after the workload exited
/// (e.g. because of a sidecar holding the results) is classified by the workload's exit code.
pub fn classify(pod: &Pod) -> UnitStatus {
    let Some(status) = pod.status.as_ref() else {
        return UnitStatus::new(UnitPhase::Unknown);
    };
    let containers = status.container_statuses.as_deref().unwrap_or_default();

    if let Some(reason) = containers.iter().find_map(fatal_waiting) {
        return UnitStatus::new(UnitPhase::Failed(reason));
    }

    match status.phase.as_deref() {
        Some("Pending") => {
            let status = UnitStatus::new(UnitPhase::Pending);
            match scheduling_message(pod) {
                Some(message) => status.with_message(message),
                None => status,
            }
        }
        Some("Running") => match workload(pod, containers).and_then(terminated) {
            Some((0, _)) => UnitStatus::new(UnitPhase::Succeeded),
            Some((_, reason)) => UnitStatus::new(UnitPhase::Failed(reason)),
            None => UnitStatus::new(UnitPhase::Running),
        },
        Some("Succeeded") => UnitStatus::new(UnitPhase::Succeeded),
        Some("Failed") => UnitStatus::new(UnitPhase::Failed(failure_reason(pod, containers))),
        _ => UnitStatus::new(UnitPhase::Unknown),
    }
}

fn workload<'a>(pod: &Pod, containers: &'a [ContainerStatus]) -> Option<&'a ContainerStatus> {
    let name = pod.spec.as_ref()?.containers.first()?.name.as_str();
    containers.iter().find(|c| c.name == name)
}

fn fatal_waiting(container: &ContainerStatus) -> Option<String> {
    let waiting = container.state.as_ref()?.waiting.as_ref()?;
    let reason = waiting.reason.as_deref()?;
    FATAL_WAITING_REASONS.contains(&reason).then(|| match &waiting.message {
        Some(message) => format!("{reason}: {message}"),
        None => reason.to_string(),
    })
}

/// Exit code and description of a terminated container.
fn terminated(container: &ContainerStatus) -> Option<(i32, String)> {
    let state: &ContainerState = container.state.as_ref()?;
    let t = state.terminated.as_ref()?;

    let mut reason = format!("container {} exited with code {}", container.name, t.exit_code);
    if let Some(r) = &t.reason {
        reason.push_str(&format!(" ({r})"));
    }
    if let Some(m) = t.message.as_ref().filter(|m| !m.is_empty()) {
        reason.push_str(&format!(": {m}"));
    }
    Some((t.exit_code, reason))
}

fn failure_reason(pod: &Pod, containers: &[ContainerStatus]) -> String {
    if let Some((_, reason)) = containers
        .iter()
        .filter_map(terminated)
        .find(|(code, _)| *code != 0)
    {
        return reason;
    }

    // Evictions and deadline kills carry their reason on the pod.
    let status = pod.status.as_ref();
    match (
        status.and_then(|s| s.reason.as_deref()),
        status.and_then(|s| s.message.as_deref()),
    ) {
        (Some(reason), Some(message)) => format!("{reason}: {message}"),
        (Some(reason), None) => reason.to_string(),
        (None, Some(message)) => message.to_string(),
        (None, None) => "pod failed".to_string(),
    }
}

/// The scheduler's explanation while a pod is not scheduled, e.g. missing GPUs.
fn scheduling_message(pod: &Pod) -> Option<String> {
    pod.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == "PodScheduled" && c.status == "False")
        .and_then(|c| c.message.clone())
}
