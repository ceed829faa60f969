//! The pod reconciler control loop.
//!
//! Converges the pod set of each TrainingJob to the intended worker count
//! decided by the autoscaler, watching both the jobs and the pods they own.
//! All pod-set decisions are made by the pure helpers in [`pods`]; this
//! module does the cluster I/O around them.

pub mod entrypoint;
pub mod expectations;
pub mod pods;

use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, warn};

use crate::autoscaler::plan;
use crate::config::OperatorConfig;
use crate::crd::{
    apply_defaults, duration_until_expiry, update_job_conditions, CleanPodPolicy,
    JobConditionType, ReplicaStatus, RestartPolicy, TrainingJob, TrainingJobStage,
    COOLDOWN_DURATION, DEFAULT_REPLICA_TYPE, REPLICA_INDEX_LABEL, REPLICA_TYPE_LABEL,
    RERUN_DURATION, SCHEDULE_FAILURE_DURATION,
};
use crate::error::{Error, Result};
use crate::metrics::OperatorMetrics;

use expectations::Expectations;

/// Outcome of the pending guard for one pass.
///
/// A Running job with an unready pod gets a grace window
/// (`SCHEDULE_FAILURE_DURATION`) before it is requeued; as long as the pod
/// count matches the intent there is nothing to fix locally, so the pass
/// waits instead of thrashing the pod set.
#[derive(Debug, PartialEq)]
enum PendingGuard {
    /// All pods ready (or job not running): drop the failure timer.
    ClearTimer,
    /// Count matches the intent: leave the pods alone and check back later.
    Wait { start_timer: bool },
    /// The deadline passed: pull the job from the running population.
    Requeue,
    /// The pod count is wrong: reconcile normally.
    Fix { start_timer: bool },
}

fn pending_guard(job: &TrainingJob, pods: &[Pod], now: chrono::DateTime<Utc>) -> PendingGuard {
    if pods::all_pods_ready(pods) || job.stage() != TrainingJobStage::Running {
        return PendingGuard::ClearTimer;
    }

    let due = job.status.as_ref().and_then(|s| s.requeue_time.as_ref()).map(|t| t.0);
    let start_timer = due.is_none();

    if pods.len() as i32 == job.current_size() {
        match due {
            Some(due) if now > due => PendingGuard::Requeue,
            _ => PendingGuard::Wait { start_timer },
        }
    } else {
        PendingGuard::Fix { start_timer }
    }
}

pub struct TrainingJobReconciler {
    client: Client,
    config: Arc<OperatorConfig>,
    metrics: Arc<OperatorMetrics>,
    expectations: Expectations,
}

impl TrainingJobReconciler {
    pub fn new(
        client: Client,
        config: Arc<OperatorConfig>,
        metrics: Arc<OperatorMetrics>,
    ) -> Self {
        Self {
            client,
            config,
            metrics,
            expectations: Expectations::new(),
        }
    }

    fn jobs_api(&self) -> Api<TrainingJob> {
        match self.config.namespace.as_deref() {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    fn pods_api(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn patch_job_status(&self, namespace: &str, name: &str, job: &TrainingJob) -> Result<()> {
        let api: Api<TrainingJob> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": job.status });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn pods_for_job(&self, namespace: &str, job_name: &str) -> Result<Vec<Pod>> {
        let params = ListParams::default().labels(&pods::job_label_selector(job_name));
        let list = self.pods_api(namespace).list(&params).await?;
        Ok(list
            .items
            .into_iter()
            .filter(|pod| {
                pod.labels()
                    .get(REPLICA_TYPE_LABEL)
                    .map_or(true, |t| t == DEFAULT_REPLICA_TYPE)
            })
            .collect())
    }

    /// Renumber replica indices so Pending pods sit at the tail, patching
    /// both the cluster and the local copies.
    async fn relabel_pending_pods(&self, namespace: &str, pods: &mut [Pod]) -> Result<()> {
        let assignments = pods::relabel_assignments(pods);
        let api = self.pods_api(namespace);

        for (pod_name, index) in assignments {
            let Some(pod) = pods.iter_mut().find(|p| p.name_any() == pod_name) else {
                continue;
            };
            if pods::replica_index(pod) == Some(index) {
                continue;
            }

            let patch = serde_json::json!({
                "metadata": { "labels": { REPLICA_INDEX_LABEL: index.to_string() } }
            });
            api.patch(&pod_name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
            pod.labels_mut()
                .insert(REPLICA_INDEX_LABEL.to_string(), index.to_string());
        }
        Ok(())
    }

    /// Apply the create/delete decisions, accounting for them in the
    /// expectations cache so later triggers wait for convergence.
    async fn apply_pod_plan(
        &self,
        key: &str,
        job: &TrainingJob,
        pods: &[Pod],
        pod_plan: &pods::PodSetPlan,
    ) -> Result<()> {
        let namespace = job.namespace().unwrap_or_default();
        let job_name = job.name_any();
        let api = self.pods_api(&namespace);

        let mut name_pool = pods::PodNamePool::from_pods(pods);
        let mut created = 0;
        let mut deleted = 0;
        let baseline = pods.len() as i64;

        for &index in &pod_plan.create_indices {
            let pod_name = name_pool.claim_unique_name(&job_name);
            let pod = pods::build_worker_pod(job, &pod_name, index);
            info!(job = %key, pod = %pod_name, index, "creating worker pod");

            if let Err(err) = api.create(&PostParams::default(), &pod).await {
                self.expectations.record(key, baseline, created, deleted);
                return Err(err.into());
            }
            created += 1;
        }

        for pod_name in &pod_plan.delete_names {
            info!(job = %key, pod = %pod_name, "deleting worker pod");
            if let Err(err) = api.delete(pod_name, &DeleteParams::default()).await {
                self.expectations.record(key, baseline, created, deleted);
                return Err(err.into());
            }
            deleted += 1;
        }

        self.expectations.record(key, baseline, created, deleted);
        Ok(())
    }

    /// Tear down a finished job: delete pods per its clean-pod policy, then
    /// garbage-collect the object itself once the TTL runs out.
    async fn cleanup_finished_job(
        &self,
        key: &str,
        job: &TrainingJob,
        pods: &[Pod],
    ) -> Result<Action> {
        let namespace = job.namespace().unwrap_or_default();
        let name = job.name_any();
        let api = self.pods_api(&namespace);

        let policy = job
            .spec
            .run_policy
            .clean_pod_policy
            .unwrap_or(CleanPodPolicy::All);
        let mut deleted = 0;
        for pod in pods {
            if pods::is_terminating(pod) {
                continue;
            }
            let delete = match policy {
                CleanPodPolicy::All => true,
                CleanPodPolicy::Running => {
                    pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running")
                }
                CleanPodPolicy::None => false,
            };
            if delete {
                info!(job = %key, pod = %pod.name_any(), "cleaning up pod of finished job");
                api.delete(&pod.name_any(), &DeleteParams::default()).await?;
                deleted += 1;
            }
        }
        self.expectations.record(key, pods.len() as i64, 0, deleted);

        let exec = &job.status.as_ref().map(|s| s.exec_status.clone()).unwrap_or_default();
        match duration_until_expiry(&job.spec.run_policy, exec, Utc::now()) {
            Some(remaining) if remaining.is_zero() => {
                info!(job = %key, "ttl expired, deleting finished job");
                let jobs: Api<TrainingJob> = Api::namespaced(self.client.clone(), &namespace);
                jobs.delete(&name, &DeleteParams::default()).await?;
                Ok(Action::await_change())
            }
            Some(remaining) => Ok(Action::requeue(remaining)),
            None => Ok(Action::await_change()),
        }
    }

    /// Fold the observed counters into the execution status, moving the job
    /// to a terminal stage when the workers are done.
    fn update_exec_status(&self, job: &mut TrainingJob, counters: ReplicaStatus) {
        let namespace = job.namespace().unwrap_or_default();
        let name = job.name_any();
        let framework = job.framework().as_str();
        let replicas = job.spec.replica_specs.replicas.unwrap_or(0);
        let restart_policy = job
            .spec
            .replica_specs
            .restart_policy
            .unwrap_or(RestartPolicy::Never);

        let selector = pods::job_label_selector(&name);
        let status = job.status_mut();
        let exec = &mut status.exec_status;

        if exec.start_time.is_none() {
            exec.start_time = Some(Time(Utc::now()));
        }

        let (running, succeeded, failed) = (counters.active, counters.succeeded, counters.failed);
        let mut entry = counters;
        entry.selector = Some(selector);
        exec.replica_statuses
            .insert(DEFAULT_REPLICA_TYPE.to_string(), entry);

        debug!(
            job = %name,
            expected = replicas - succeeded,
            running,
            succeeded,
            failed,
            replicas,
            "worker replica status"
        );

        if replicas - succeeded == 0 && succeeded > 0 {
            info!(job = %name, "trainingjob successfully completed");
            if exec.completion_time.is_none() {
                exec.completion_time = Some(Time(Utc::now()));
            }
            update_job_conditions(
                exec,
                JobConditionType::Succeeded,
                "JobSucceeded",
                &format!("TrainingJob {namespace}/{name} successfully completed."),
            );
            self.metrics.job_successful_inc(&namespace, framework);
            plan::complete_job(job);
        } else if running > 0 {
            update_job_conditions(
                &mut job.status_mut().exec_status,
                JobConditionType::Running,
                "JobRunning",
                &format!("TrainingJob {namespace}/{name} is running."),
            );
        }

        if failed > 0 && replicas > succeeded + running {
            if restart_policy != RestartPolicy::Never {
                warn!(job = %name, failed, "trainingjob is restarting failed workers");
                update_job_conditions(
                    &mut job.status_mut().exec_status,
                    JobConditionType::Restarting,
                    "JobRestarting",
                    &format!("TrainingJob {name} is restarting because {failed} worker(s) failed."),
                );
                self.metrics.job_restarted_inc(&namespace, framework);
            } else {
                warn!(job = %name, failed, "trainingjob failed");
                let exec = &mut job.status_mut().exec_status;
                if exec.completion_time.is_none() {
                    exec.completion_time = Some(Time(Utc::now()));
                }
                update_job_conditions(
                    exec,
                    JobConditionType::Failed,
                    "JobFailed",
                    &format!("TrainingJob {name} is failed because {failed} worker(s) failed."),
                );
                self.metrics.job_failed_inc(&namespace, framework);
                plan::complete_job(job);
            }
        }
    }

    async fn reconcile_job(&self, job: Arc<TrainingJob>) -> Result<Action> {
        let namespace = job
            .namespace()
            .ok_or(Error::MissingObjectKey("namespace"))?;
        let name = job.name_any();
        let key = format!("{namespace}/{name}");

        if job.metadata.deletion_timestamp.is_some() {
            self.metrics.running_pods_delete(&namespace, &name);
            self.metrics
                .job_deleted_inc(&namespace, job.framework().as_str());
            self.expectations.forget(&key);
            debug!(job = %key, "job is being deleted, skipping reconciliation");
            return Ok(Action::await_change());
        }

        let mut job = (*job).clone();
        apply_defaults(&mut job);
        let original_status = job.status.clone();

        let mut pods = self.pods_for_job(&namespace, &name).await?;
        self.metrics
            .running_pods_set(&namespace, &name, pods::num_running_pods(&pods));

        // Finished jobs only need cleanup, never pod-set convergence.
        let exec_finished = job
            .status
            .as_ref()
            .map(|s| s.exec_status.is_succeeded() || s.exec_status.is_failed())
            .unwrap_or(false);
        if exec_finished {
            return self.cleanup_finished_job(&key, &job, &pods).await;
        }

        match pending_guard(&job, &pods, Utc::now()) {
            PendingGuard::ClearTimer => {
                job.status_mut().requeue_time = None;
            }
            PendingGuard::Wait { start_timer } => {
                if start_timer {
                    job.status_mut().requeue_time =
                        Some(Time(Utc::now() + SCHEDULE_FAILURE_DURATION));
                    self.patch_job_status(&namespace, &name, &job).await?;
                }
                debug!(job = %key, "waiting for pods to become ready");
                return Ok(Action::requeue(RERUN_DURATION));
            }
            PendingGuard::Requeue => {
                info!(job = %key, "pods failed to schedule in time, requeueing the job");
                plan::requeue_job(&mut job, Time(Utc::now() + COOLDOWN_DURATION));
                self.patch_job_status(&namespace, &name, &job).await?;
                // Stage is Requeuing now; fall through so the pods get
                // torn down below.
            }
            PendingGuard::Fix { start_timer } => {
                if start_timer {
                    job.status_mut().requeue_time =
                        Some(Time(Utc::now() + SCHEDULE_FAILURE_DURATION));
                    self.patch_job_status(&namespace, &name, &job).await?;
                }
                // The pod count is wrong; reconcile despite unready pods.
            }
        }

        let intended = if job.stage() == TrainingJobStage::Running {
            job.current_size()
        } else {
            0
        };
        job.spec.replica_specs.replicas = Some(intended);

        // Resizing 0 -> 0 must not touch anything; bail out before the
        // bucket logic, which would otherwise create one pod.
        if intended == 0 && pods.is_empty() {
            return Ok(Action::await_change());
        }

        if !self.expectations.satisfied(&key, pods.len() as i64) {
            debug!(job = %key, "pending pod operations not yet observed, skipping");
            return Ok(Action::requeue(RERUN_DURATION));
        }

        info!(job = %key, stage = %job.stage(), size = intended, "reconciling job");

        if job.spec.inject_lattice.unwrap_or(false) {
            // Injection failures (e.g. missing secret) leave the template
            // untouched; the job still runs, just unwrapped.
            if let Err(err) = entrypoint::wrap_entrypoint(&mut job, &self.config) {
                error!(job = %key, error = %err, "failed to inject entrypoint");
            }
        }
        entrypoint::merge_job_node_selector(&mut job, &self.config);

        if pods.len() as i32 > intended {
            self.relabel_pending_pods(&namespace, &mut pods).await?;
        }

        let restart_policy = job
            .spec
            .replica_specs
            .restart_policy
            .unwrap_or(RestartPolicy::Never);
        let pod_plan = pods::plan_pod_set(&pods, intended, restart_policy);
        self.apply_pod_plan(&key, &job, &pods, &pod_plan).await?;

        self.update_exec_status(&mut job, pod_plan.counters.clone());

        if job.status != original_status {
            self.patch_job_status(&namespace, &name, &job).await?;
        }

        Ok(Action::await_change())
    }

    /// Run the controller until shutdown.
    pub async fn run(self: Arc<Self>) {
        let jobs = self.jobs_api();
        let pods: Api<Pod> = match self.config.namespace.as_deref() {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };

        Controller::new(jobs, watcher::Config::default())
            .owns(pods, watcher::Config::default())
            .shutdown_on_signal()
            .run(Self::reconcile, Self::error_policy, self)
            .for_each(|result| async {
                match result {
                    Ok((obj, _)) => debug!(job = %obj.name, "reconciled"),
                    Err(err) => debug!(error = %err, "reconcile failed"),
                }
            })
            .await;
    }

    async fn reconcile(job: Arc<TrainingJob>, reconciler: Arc<Self>) -> Result<Action> {
        reconciler.reconcile_job(job).await
    }

    fn error_policy(job: Arc<TrainingJob>, error: &Error, _reconciler: Arc<Self>) -> Action {
        warn!(job = %job.name_any(), error = %error, "reconcile error, will retry");
        Action::requeue(RERUN_DURATION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ReplicaSpec, TrainingJobSpec};
    use k8s_openapi::api::core::v1::PodStatus;
    use kube::api::ObjectMeta;

    fn running_job(current_size: i32, requeue_in_secs: Option<i64>) -> TrainingJob {
        let mut job = TrainingJob::new(
            "job-a",
            TrainingJobSpec {
                run_policy: Default::default(),
                replica_specs: ReplicaSpec::default(),
                min_size: Some(1),
                max_size: Some(4),
                inject_lattice: None,
                framework: None,
                priority: None,
            },
        );
        let status = job.status_mut();
        status.stage = TrainingJobStage::Running;
        status.current_size = current_size;
        status.requeue_time =
            requeue_in_secs.map(|secs| Time(Utc::now() + chrono::Duration::seconds(secs)));
        job
    }

    fn pod(name: &str, phase: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: None,
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn ready_pods_clear_the_failure_timer() {
        let job = running_job(2, Some(60));
        let pods = vec![pod("w-0", "Running"), pod("w-1", "Running")];
        assert_eq!(pending_guard(&job, &pods, Utc::now()), PendingGuard::ClearTimer);
    }

    #[test]
    fn first_pending_sighting_starts_the_timer_and_waits() {
        let job = running_job(2, None);
        let pods = vec![pod("w-0", "Running"), pod("w-1", "Pending")];
        assert_eq!(
            pending_guard(&job, &pods, Utc::now()),
            PendingGuard::Wait { start_timer: true }
        );
    }

    #[test]
    fn pending_within_the_window_keeps_waiting() {
        let job = running_job(2, Some(120));
        let pods = vec![pod("w-0", "Running"), pod("w-1", "Pending")];
        assert_eq!(
            pending_guard(&job, &pods, Utc::now()),
            PendingGuard::Wait { start_timer: false }
        );
    }

    #[test]
    fn pending_beyond_the_deadline_requeues() {
        let job = running_job(2, Some(-1));
        let pods = vec![pod("w-0", "Running"), pod("w-1", "Pending")];
        assert_eq!(pending_guard(&job, &pods, Utc::now()), PendingGuard::Requeue);
    }

    #[test]
    fn wrong_pod_count_reconciles_despite_pending() {
        let job = running_job(3, Some(-1));
        let pods = vec![pod("w-0", "Running"), pod("w-1", "Pending")];
        assert_eq!(
            pending_guard(&job, &pods, Utc::now()),
            PendingGuard::Fix { start_timer: false }
        );
    }

    #[test]
    fn non_running_job_never_trips_the_guard() {
        let mut job = running_job(2, None);
        job.status_mut().stage = TrainingJobStage::Waiting;
        let pods = vec![pod("w-0", "Pending")];
        assert_eq!(pending_guard(&job, &pods, Utc::now()), PendingGuard::ClearTimer);
    }

    #[test]
    fn terminating_pod_counts_as_unready() {
        let job = running_job(1, None);
        let mut terminating = pod("w-0", "Running");
        terminating.metadata.deletion_timestamp = Some(Time(Utc::now()));
        assert_eq!(
            pending_guard(&job, &[terminating], Utc::now()),
            PendingGuard::Wait { start_timer: true }
        );
    }
}
