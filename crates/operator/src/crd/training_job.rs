//! The TrainingJob custom resource.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::exec_status::{ExecStatus, ReplicaSpec, RestartPolicy, RunPolicy};

/// TrainingJob describes one elastic training workload.
///
/// The scheduler only ever considers running it with `[minSize, maxSize]`
/// workers; the worker count in between is decided dynamically from cluster
/// capacity and job priority.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "lattice.ai",
    version = "v1",
    kind = "TrainingJob",
    namespaced,
    status = "TrainingJobStatus",
    shortname = "tj",
    scale = r#"{"specReplicasPath":".spec.replicaSpecs.replicas","statusReplicasPath":".status.currentSize","labelSelectorPath":".status.execStatus.replicaStatuses.worker.selector"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.stage"}"#,
    printcolumn = r#"{"name":"Size","type":"integer","jsonPath":".status.currentSize"}"#,
    printcolumn = r#"{"name":"Priority","type":"integer","jsonPath":".spec.priority"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TrainingJobSpec {
    /// Runtime policies: pod cleanup, TTL after finish, active deadline.
    #[serde(default)]
    pub run_policy: RunPolicy,

    /// Pod template and restart policy for the workers. The replica count in
    /// here is ignored on input; the autoscaler decides it.
    pub replica_specs: ReplicaSpec,

    /// Elastic bounds. The job only runs with `minSize..=maxSize` workers.
    /// Both default to 1.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_size: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_size: Option<i32>,

    /// Wrap the container entrypoint with the installer and agent launcher.
    /// Requires python + pip in the image and an explicit command in the
    /// template (the implicit image entrypoint cannot be wrapped).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inject_lattice: Option<bool>,

    /// Training framework, forwarded to the agent. Default: pytorch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub framework: Option<TrainingJobFramework>,

    /// Higher priority is scheduled first and may preempt workers from
    /// equal-or-lower priority jobs. Default: 0.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum TrainingJobFramework {
    Generic,
    Pytorch,
}

impl TrainingJobFramework {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrainingJobFramework::Generic => "generic",
            TrainingJobFramework::Pytorch => "pytorch",
        }
    }
}

/// Where a job sits in the scheduling lifecycle. Only the operator writes
/// this.
///
/// The empty string doubles as "never seen by the operator" so that a freshly
/// created object (no status at all) and one with a zeroed status read the
/// same.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum TrainingJobStage {
    #[default]
    #[serde(rename = "")]
    Init,
    Waiting,
    Running,
    #[serde(rename = "WrongConfiguration")]
    Wrong,
    Cancelled,
    Completed,
    #[serde(rename = "RequeueCooldown")]
    Requeuing,
}

impl std::fmt::Display for TrainingJobStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TrainingJobStage::Init => "Init",
            TrainingJobStage::Waiting => "Waiting",
            TrainingJobStage::Running => "Running",
            TrainingJobStage::Wrong => "WrongConfiguration",
            TrainingJobStage::Cancelled => "Cancelled",
            TrainingJobStage::Completed => "Completed",
            TrainingJobStage::Requeuing => "RequeueCooldown",
        };
        f.write_str(s)
    }
}

/// Observed + intended status of a TrainingJob.
///
/// Option fields deliberately serialize as explicit nulls: status updates go
/// out as merge patches, and clearing `requeueTime` must reach the cluster.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TrainingJobStatus {
    /// Execution status maintained by the pod reconciler: condition history
    /// and per-replica-type counters.
    #[serde(default)]
    pub exec_status: ExecStatus,

    /// Intended worker count. Zero unless `stage` is Running.
    #[serde(default)]
    pub current_size: i32,

    /// Where the job sits in the scheduling lifecycle.
    #[serde(default)]
    pub stage: TrainingJobStage,

    /// When the job was first submitted. Set once, on first queueing.
    pub submit_time: Option<Time>,

    /// When the job last entered the waiting/running population. FIFO
    /// tiebreaker among equal priorities; reset on cooldown requeue.
    pub queued_time: Option<Time>,

    /// When the job last started executing.
    pub last_exec_time: Option<Time>,

    /// When the job reached a terminal stage.
    pub completion_time: Option<Time>,

    /// Deadline after which a Running job with a stuck-Pending pod is pulled
    /// from the running population. Cleared whenever the autoscaler touches
    /// `stage` or `currentSize`.
    pub requeue_time: Option<Time>,

    /// Instant before which a requeued job may not be re-admitted.
    pub cooldown_time: Option<Time>,
}

impl TrainingJob {
    /// Stage, defaulting to Init when no status was ever written.
    pub fn stage(&self) -> TrainingJobStage {
        self.status.as_ref().map(|s| s.stage).unwrap_or_default()
    }

    pub fn current_size(&self) -> i32 {
        self.status.as_ref().map(|s| s.current_size).unwrap_or(0)
    }

    pub fn status_mut(&mut self) -> &mut TrainingJobStatus {
        self.status.get_or_insert_with(Default::default)
    }

    pub fn min_size(&self) -> i32 {
        self.spec.min_size.unwrap_or(1)
    }

    pub fn max_size(&self) -> i32 {
        self.spec.max_size.unwrap_or(1)
    }

    pub fn priority(&self) -> i32 {
        self.spec.priority.unwrap_or(0)
    }

    pub fn framework(&self) -> TrainingJobFramework {
        self.spec.framework.unwrap_or(TrainingJobFramework::Pytorch)
    }

    pub fn queued_time(&self) -> Option<&Time> {
        self.status.as_ref().and_then(|s| s.queued_time.as_ref())
    }
}

/// Fill in the optional fields the way the admission path would.
///
/// Both loops call this on every fetched job. The elastic bounds are
/// deliberately left alone: a job without them is misconfigured and must
/// surface as such rather than silently run with one worker.
pub fn apply_defaults(job: &mut TrainingJob) {
    let name = kube::ResourceExt::name_any(job);
    let spec = &mut job.spec;
    if spec.run_policy.clean_pod_policy.is_none() {
        spec.run_policy.clean_pod_policy = Some(super::CleanPodPolicy::All);
    }
    if spec.replica_specs.replicas.is_none() {
        spec.replica_specs.replicas = Some(1);
    }
    if spec.replica_specs.restart_policy.is_none() {
        spec.replica_specs.restart_policy = Some(RestartPolicy::Never);
    }
    if spec.priority.is_none() {
        spec.priority = Some(0);
    }
    if spec.framework.is_none() {
        spec.framework = Some(TrainingJobFramework::Pytorch);
    }
    if spec.inject_lattice.is_none() {
        spec.inject_lattice = Some(false);
    }

    // A job nobody has touched yet gets its Created condition here, so the
    // scheduler can tell a fresh job from one with history.
    let status = job.status.get_or_insert_with(Default::default);
    if status.exec_status.conditions.is_empty() {
        super::update_job_conditions(
            &mut status.exec_status,
            super::JobConditionType::Created,
            "TrainingJobCreated",
            &format!("TrainingJob {name} is created."),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_wire_values_are_stable() {
        let json = |s: TrainingJobStage| serde_json::to_string(&s).unwrap();
        assert_eq!(json(TrainingJobStage::Init), "\"\"");
        assert_eq!(json(TrainingJobStage::Waiting), "\"Waiting\"");
        assert_eq!(json(TrainingJobStage::Wrong), "\"WrongConfiguration\"");
        assert_eq!(json(TrainingJobStage::Requeuing), "\"RequeueCooldown\"");
    }

    #[test]
    fn missing_stage_deserializes_as_init() {
        let status: TrainingJobStatus = serde_json::from_str("{}").unwrap();
        assert_eq!(status.stage, TrainingJobStage::Init);
        assert_eq!(status.current_size, 0);
    }

    #[test]
    fn cleared_requeue_time_serializes_as_null() {
        let status = TrainingJobStatus::default();
        let value = serde_json::to_value(&status).unwrap();
        assert!(value.get("requeueTime").unwrap().is_null());
    }
}
