//! Execution-status model: replica spec, conditions, and status counters.
//!
//! This is the half of the status the pod reconciler owns. The autoscaler
//! never writes these fields; it only reads the terminal conditions to decide
//! when a job leaves the running population.

use std::collections::BTreeMap;

use chrono::Utc;
use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Worker template plus restart behavior. The replica count is operator-set.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSpec {
    /// Desired worker count. Managed by the operator, not the user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Pod template for each worker. Exactly one container is required.
    pub template: PodTemplateSpec,

    /// What to do when a worker pod fails.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<RestartPolicy>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum RestartPolicy {
    Always,
    OnFailure,
    Never,
    /// Restart only on retryable exit codes (128-255). 1-127 are treated as
    /// permanent failures.
    ExitCode,
}

impl RestartPolicy {
    /// Pod-level restart policy accepts only Always/OnFailure/Never; the
    /// exit-code policy keeps the pod dead and lets the reconciler decide.
    pub fn pod_restart_policy(&self) -> &'static str {
        match self {
            RestartPolicy::Always => "Always",
            RestartPolicy::OnFailure => "OnFailure",
            RestartPolicy::Never | RestartPolicy::ExitCode => "Never",
        }
    }
}

/// An exit code the agent signals as worth retrying.
pub fn is_retryable_exit_code(exit_code: i32) -> bool {
    (128..=255).contains(&exit_code)
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RunPolicy {
    /// Which pods to clean up once the job finishes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clean_pod_policy: Option<CleanPodPolicy>,

    /// Seconds to keep the finished job around before garbage collection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_finished: Option<i32>,

    /// Wall-clock bound on the job's execution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_deadline_seconds: Option<i64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum CleanPodPolicy {
    All,
    Running,
    None,
}

/// Condition history of the execution, kubelet-style.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecStatus {
    /// Latest available observations, one entry per condition type.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<JobCondition>,

    /// Per-replica-type pod counters keyed by replica type name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub replica_statuses: BTreeMap<String, ReplicaStatus>,

    /// When the reconciler first acted on the job.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Time>,

    /// When the execution finished, successfully or not.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<Time>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobCondition {
    #[serde(rename = "type")]
    pub type_: JobConditionType,
    /// "True", "False", or "Unknown".
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<Time>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum JobConditionType {
    Created,
    Running,
    Restarting,
    Succeeded,
    Failed,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaStatus {
    #[serde(default)]
    pub active: i32,
    #[serde(default)]
    pub succeeded: i32,
    #[serde(default)]
    pub failed: i32,
    /// Label selector for this replica type, for the scale subresource.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
}

impl ExecStatus {
    pub fn has_condition(&self, type_: JobConditionType) -> bool {
        self.conditions
            .iter()
            .any(|c| c.type_ == type_ && c.status == "True")
    }

    pub fn is_succeeded(&self) -> bool {
        self.has_condition(JobConditionType::Succeeded)
    }

    pub fn is_failed(&self) -> bool {
        self.has_condition(JobConditionType::Failed)
    }

    /// True when the only thing that ever happened to the job is creation.
    pub fn is_created_only(&self) -> bool {
        match self.conditions.as_slice() {
            [only] => only.type_ == JobConditionType::Created && only.status == "True",
            _ => false,
        }
    }
}

/// Time left before a finished job should be garbage collected, per its
/// `ttlSecondsAfterFinished`. `None` means never (not finished, or no TTL).
/// Zero means it is already due.
pub fn duration_until_expiry(
    run_policy: &RunPolicy,
    exec: &ExecStatus,
    now: chrono::DateTime<Utc>,
) -> Option<std::time::Duration> {
    if !exec.is_succeeded() && !exec.is_failed() {
        return None;
    }
    let ttl = run_policy.ttl_seconds_after_finished?;
    let finished_at = exec.completion_time.as_ref()?.0;
    let expire_at = finished_at + chrono::Duration::seconds(i64::from(ttl));
    Some((expire_at - now).to_std().unwrap_or_default())
}

/// Append or refresh a condition.
///
/// A Running condition retires any Restarting one, and a terminal condition
/// (Succeeded/Failed) flips Running to "False"; everything else keeps its
/// history entry with refreshed timestamps.
pub fn update_job_conditions(
    status: &mut ExecStatus,
    type_: JobConditionType,
    reason: &str,
    message: &str,
) {
    let now = Time(Utc::now());

    if type_ == JobConditionType::Running {
        status
            .conditions
            .retain(|c| c.type_ != JobConditionType::Restarting);
    }
    if matches!(type_, JobConditionType::Succeeded | JobConditionType::Failed) {
        for cond in status
            .conditions
            .iter_mut()
            .filter(|c| c.type_ == JobConditionType::Running)
        {
            cond.status = "False".to_string();
            cond.last_update_time = Some(now.clone());
            cond.last_transition_time = Some(now.clone());
        }
    }

    if let Some(existing) = status.conditions.iter_mut().find(|c| c.type_ == type_) {
        if existing.status != "True" {
            existing.last_transition_time = Some(now.clone());
        }
        existing.status = "True".to_string();
        existing.reason = Some(reason.to_string());
        existing.message = Some(message.to_string());
        existing.last_update_time = Some(now);
        return;
    }

    status.conditions.push(JobCondition {
        type_,
        status: "True".to_string(),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        last_update_time: Some(now.clone()),
        last_transition_time: Some(now),
    });
}
