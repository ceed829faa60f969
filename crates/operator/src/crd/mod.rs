//! TrainingJob CRD and the execution-status model attached to it.
//!
//! The operator keeps two views of a job:
//! - the *intended* view (`stage`, `currentSize`, the scheduling timestamps),
//!   written by the autoscaler, and
//! - the *observed* execution view (`execStatus`), written by the pod
//!   reconciler as it converges pods toward the intended size.

use std::time::Duration;

mod exec_status;
mod training_job;

pub use exec_status::{
    duration_until_expiry, is_retryable_exit_code, update_job_conditions, CleanPodPolicy,
    ExecStatus, JobCondition, JobConditionType, ReplicaSpec, ReplicaStatus, RestartPolicy,
    RunPolicy,
};
pub use training_job::{
    apply_defaults, TrainingJob, TrainingJobFramework, TrainingJobSpec, TrainingJobStage,
    TrainingJobStatus,
};

/// Container name the operator expects inside the replica template.
pub const DEFAULT_CONTAINER_NAME: &str = "trainingjob";

/// All replicas are workers; the in-pod agent elects its own coordinator.
pub const DEFAULT_REPLICA_TYPE: &str = "worker";

/// Delay before a failed pass (or an unlicensed one) is retried.
pub const RERUN_DURATION: Duration = Duration::from_secs(30);

/// How long a Running job may keep a Pending pod before it is requeued.
pub const SCHEDULE_FAILURE_DURATION: Duration = Duration::from_secs(5 * 60);

/// Lockout applied to a requeued job before it may re-enter the queue.
pub const COOLDOWN_DURATION: Duration = Duration::from_secs(3 * 60 * 60);

/// Pod labels the operator stamps on every worker it creates.
pub const OPERATOR_NAME_LABEL: &str = "lattice.ai/operator-name";
pub const JOB_NAME_LABEL: &str = "lattice.ai/job-name";
pub const REPLICA_TYPE_LABEL: &str = "lattice.ai/replica-type";
pub const REPLICA_INDEX_LABEL: &str = "lattice.ai/replica-index";
