//! Pure pod-set logic for the reconciler: label bookkeeping, the
//! relabel-pending-first renumbering, slicing pods into replica buckets, and
//! deriving the create/delete/restart actions for a pass.

use std::collections::{BTreeMap, HashSet};

use k8s_openapi::api::core::v1::{Pod, PodSpec};
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use tracing::warn;

use crate::crd::{
    is_retryable_exit_code, ReplicaStatus, RestartPolicy, TrainingJob, DEFAULT_CONTAINER_NAME,
    DEFAULT_REPLICA_TYPE, JOB_NAME_LABEL, OPERATOR_NAME_LABEL, REPLICA_INDEX_LABEL,
    REPLICA_TYPE_LABEL,
};

pub const CONTROLLER_NAME: &str = "trainingjob-reconciler";

/// Labels identifying all pods of a job.
pub fn job_labels(job_name: &str) -> BTreeMap<String, String> {
    let safe_name = job_name.replace('/', "-");
    [
        (OPERATOR_NAME_LABEL.to_string(), CONTROLLER_NAME.to_string()),
        (JOB_NAME_LABEL.to_string(), safe_name),
    ]
    .into_iter()
    .collect()
}

/// Labels for one worker replica.
pub fn worker_labels(job_name: &str, index: i32) -> BTreeMap<String, String> {
    let mut labels = job_labels(job_name);
    labels.insert(REPLICA_TYPE_LABEL.to_string(), DEFAULT_REPLICA_TYPE.to_string());
    labels.insert(REPLICA_INDEX_LABEL.to_string(), index.to_string());
    labels
}

/// Label-selector string matching all pods of a job.
pub fn job_label_selector(job_name: &str) -> String {
    job_labels(job_name)
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

pub fn replica_index(pod: &Pod) -> Option<i32> {
    pod.labels().get(REPLICA_INDEX_LABEL)?.parse().ok()
}

pub fn is_pending(pod: &Pod) -> bool {
    pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Pending")
}

pub fn is_terminating(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

/// Running and not being torn down.
pub fn num_running_pods(pods: &[Pod]) -> i32 {
    pods.iter()
        .filter(|pod| {
            pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running")
                && !is_terminating(pod)
        })
        .count() as i32
}

/// No pod still Pending or terminating.
pub fn all_pods_ready(pods: &[Pod]) -> bool {
    pods.iter().all(|pod| !is_pending(pod) && !is_terminating(pod))
}

/// Names already taken by live pods; new workers pick the first free suffix.
#[derive(Debug, Default)]
pub struct PodNamePool(HashSet<String>);

impl PodNamePool {
    pub fn from_pods(pods: &[Pod]) -> Self {
        Self(pods.iter().map(|p| p.name_any()).collect())
    }

    pub fn claim_unique_name(&mut self, job_name: &str) -> String {
        let mut idx = 0;
        loop {
            let candidate = format!("{job_name}-{DEFAULT_REPLICA_TYPE}-{idx}");
            if !self.0.contains(&candidate) {
                self.0.insert(candidate.clone());
                return candidate;
            }
            idx += 1;
        }
    }
}

/// New replica indices that put every non-Pending pod ahead of every Pending
/// one, preserving relative order within each group.
///
/// The deletion pass removes the highest indices first, so after this
/// renumbering a scale-down kills Pending pods before Running ones. Deleting
/// a Running pod mid-downscale can report exit 0 and flip the whole job to
/// succeeded, which this ordering avoids.
pub fn relabel_assignments(pods: &[Pod]) -> Vec<(String, i32)> {
    let mut ordered: Vec<&Pod> = pods.iter().collect();
    ordered.sort_by_key(|pod| replica_index(pod).unwrap_or(i32::MAX));

    let mut assignments = Vec::with_capacity(ordered.len());
    let mut next = 0;

    for pod in ordered.iter().filter(|p| !is_pending(p)) {
        assignments.push((pod.name_any(), next));
        next += 1;
    }
    for pod in ordered.iter().filter(|p| is_pending(p)) {
        assignments.push((pod.name_any(), next));
        next += 1;
    }

    assignments
}

/// What one reconcile pass should do to the pod set.
#[derive(Debug, Default, PartialEq)]
pub struct PodSetPlan {
    /// Replica indices that need a new pod.
    pub create_indices: Vec<i32>,
    /// Pods to delete: out-of-range indices plus restartable failures.
    pub delete_names: Vec<String>,
    /// Observed phase counters for the execution status.
    pub counters: ReplicaStatus,
}

impl PodSetPlan {
    pub fn is_noop(&self) -> bool {
        self.create_indices.is_empty() && self.delete_names.is_empty()
    }
}

/// Slice the pods into per-replica buckets and derive the actions.
///
/// Buckets `0..replicas` with no pod get a create; pods with an index at or
/// beyond `replicas` are deleted; a Failed pod whose restart policy allows a
/// retry is deleted so the next pass replaces it.
pub fn plan_pod_set(pods: &[Pod], replicas: i32, restart_policy: RestartPolicy) -> PodSetPlan {
    let mut plan = PodSetPlan::default();

    let highest = pods.iter().filter_map(replica_index).max().unwrap_or(-1);
    let buckets = (highest + 1).max(replicas) as usize;
    let mut slices: Vec<Vec<&Pod>> = vec![Vec::new(); buckets];
    for pod in pods {
        match replica_index(pod) {
            Some(index) if index >= 0 => slices[index as usize].push(pod),
            _ => warn!(pod = %pod.name_any(), "pod carries no usable replica index"),
        }
    }

    for (index, bucket) in slices.iter().enumerate() {
        let index = index as i32;
        match bucket.as_slice() {
            [] => {
                if index < replicas {
                    plan.create_indices.push(index);
                }
            }
            [pod] => {
                if index >= replicas {
                    plan.delete_names.push(pod.name_any());
                } else if should_restart(pod, restart_policy) {
                    plan.delete_names.push(pod.name_any());
                }
                count_pod(&mut plan.counters, pod);
            }
            many => {
                warn!(index, count = many.len(), "too many pods for one replica bucket");
                for pod in many {
                    count_pod(&mut plan.counters, pod);
                }
            }
        }
    }

    plan
}

fn count_pod(counters: &mut ReplicaStatus, pod: &Pod) {
    match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
        Some("Running") => counters.active += 1,
        Some("Succeeded") => counters.succeeded += 1,
        Some("Failed") => counters.failed += 1,
        _ => {}
    }
}

/// Exit code of the job container, when it terminated.
fn container_exit_code(pod: &Pod) -> Option<i32> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .iter()
        .find(|s| s.name == DEFAULT_CONTAINER_NAME)?
        .state
        .as_ref()?
        .terminated
        .as_ref()
        .map(|t| t.exit_code)
}

/// A Failed pod is deleted for a retry when the policy allows it.
fn should_restart(pod: &Pod, restart_policy: RestartPolicy) -> bool {
    if pod.status.as_ref().and_then(|s| s.phase.as_deref()) != Some("Failed") {
        return false;
    }
    match restart_policy {
        RestartPolicy::Always | RestartPolicy::OnFailure => true,
        RestartPolicy::ExitCode => container_exit_code(pod).is_some_and(is_retryable_exit_code),
        RestartPolicy::Never => false,
    }
}

/// Build the worker pod for one replica index from the job's (already
/// decorated) template.
pub fn build_worker_pod(job: &TrainingJob, name: &str, index: i32) -> Pod {
    let template = &job.spec.replica_specs.template;
    let job_name = job.name_any();

    let mut labels = template.metadata.as_ref().and_then(|m| m.labels.clone()).unwrap_or_default();
    labels.extend(worker_labels(&job_name, index));

    let mut spec: PodSpec = template.spec.clone().unwrap_or_default();
    let policy = job
        .spec
        .replica_specs
        .restart_policy
        .unwrap_or(RestartPolicy::Never);
    if spec.restart_policy.is_some() {
        warn!(
            job = %job_name,
            "restart policy in pod template is overwritten by the replica-level policy"
        );
    }
    spec.restart_policy = Some(policy.pod_restart_policy().to_string());

    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: job.namespace(),
            labels: Some(labels),
            annotations: template.metadata.as_ref().and_then(|m| m.annotations.clone()),
            owner_references: job.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        spec: Some(spec),
        status: None,
    }
}
