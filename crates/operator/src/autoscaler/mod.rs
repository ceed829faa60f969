//! The autoscaler control loop.
//!
//! Re-plans the whole namespace on any TrainingJob or worker-pool Node
//! change. The plan itself is pure (see [`plan`]); this module feeds it the
//! cluster view and writes the resulting intended state back, gated by the
//! billing daemon.

pub mod plan;

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, warn};

use crate::billing::Daemon;
use crate::config::{OperatorConfig, NODE_RESOURCE_UNIT};
use crate::crd::{apply_defaults, TrainingJob, TrainingJobStage, RERUN_DURATION};
use crate::error::{Error, Result};
use crate::metrics::OperatorMetrics;

pub struct AutoScaler {
    client: Client,
    config: Arc<OperatorConfig>,
    metrics: Arc<OperatorMetrics>,
    billing: Arc<Daemon>,
    /// One planning pass at a time; concurrent triggers coalesce behind it.
    pass_lock: tokio::sync::Mutex<()>,
}

impl AutoScaler {
    pub fn new(
        client: Client,
        config: Arc<OperatorConfig>,
        metrics: Arc<OperatorMetrics>,
        billing: Arc<Daemon>,
    ) -> Self {
        Self {
            client,
            config,
            metrics,
            billing,
            pass_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn jobs_api(&self) -> Api<TrainingJob> {
        match self.config.namespace.as_deref() {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    /// Total resource units in the worker pool: the debug override if set,
    /// otherwise summed over the nodes matching the pool selector.
    async fn total_resources(&self) -> Result<i32> {
        if let Some(size) = self.config.debug_world_size {
            return Ok(size);
        }

        let nodes: Api<Node> = Api::all(self.client.clone());
        let selector = self
            .config
            .job_node_selector
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.labels(&selector);
        }

        let mut total: i64 = 0;
        for node in nodes.list(&params).await? {
            if self.config.resource_unit == NODE_RESOURCE_UNIT {
                total += 1;
            } else if let Some(quantity) = node
                .status
                .as_ref()
                .and_then(|s| s.allocatable.as_ref())
                .and_then(|alloc| alloc.get(&self.config.resource_unit))
            {
                total += quantity.0.parse::<i64>().unwrap_or(0);
            }
        }

        if total > i64::from(i32::MAX) {
            return Err(Error::Config(format!(
                "allocatable {} count {total} exceeds the supported range",
                self.config.resource_unit
            )));
        }
        Ok(total as i32)
    }

    /// One full planning pass over every job in scope.
    async fn run_pass(&self) -> Result<Action> {
        let _serialized = self.pass_lock.lock().await;

        let resource_unit = self.config.resource_unit.clone();
        let total_resources = match self.total_resources().await {
            Ok(total) => total,
            Err(err) => {
                warn!(error = %err, "failed to size the worker pool, assuming empty");
                0
            }
        };

        let jobs_api = self.jobs_api();
        let mut jobs = match jobs_api.list(&ListParams::default()).await {
            Ok(list) => list.items,
            Err(err) => {
                info!(error = %err, "unable to fetch trainingjobs, will rerun");
                return Ok(Action::requeue(RERUN_DURATION));
            }
        };

        for job in jobs.iter_mut() {
            apply_defaults(job);
        }
        let snapshot = jobs.clone();

        for problem in plan::reset_job_status(&mut jobs) {
            info!(%problem, "trainingjob status inconsistency");
        }

        let order = plan::construct_priority_list(&jobs);
        for problem in plan::dispatch_workers(&mut jobs, &order, total_resources, &resource_unit) {
            info!(%problem, "dispatch reported a job over cluster capacity");
        }

        match plan::construct_scheduling_lists(&jobs, &order) {
            Ok((mut running, mut waiting)) => {
                plan::start_waiting_jobs(
                    &mut jobs,
                    &mut running,
                    &mut waiting,
                    total_resources,
                    &resource_unit,
                );
            }
            Err(err) => info!(error = %err, "failed to split running and waiting lists"),
        }

        // Planning is done; nothing becomes effective without a license.
        if !self.billing.is_approved() {
            error!("invalid license, dropping the scheduling decisions of this pass");
            return Ok(Action::requeue(RERUN_DURATION));
        }

        self.publish_metrics(&snapshot, &jobs, total_resources, &resource_unit);

        let mut rerun = false;
        for (old, job) in snapshot.iter().zip(jobs.iter_mut()) {
            if plan::job_autoscaled(old, job) {
                // The decision changed; restart the stuck-pending timer.
                job.status_mut().requeue_time = None;
            }

            if old.status == job.status {
                continue;
            }
            let name = job.name_any();
            let api: Api<TrainingJob> =
                Api::namespaced(self.client.clone(), &job.namespace().unwrap_or_default());
            let patch = serde_json::json!({ "status": job.status });
            if let Err(err) = api
                .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
            {
                info!(job = %name, error = %err, "unable to update job status, will rerun");
                rerun = true;
            }
        }

        if rerun {
            return Ok(Action::requeue(RERUN_DURATION));
        }
        if let Some(delay) = plan::find_cooldown_rerun(&jobs) {
            debug!(?delay, "rerunning at the nearest cooldown deadline");
            return Ok(Action::requeue(delay));
        }
        Ok(Action::await_change())
    }

    fn publish_metrics(
        &self,
        snapshot: &[TrainingJob],
        jobs: &[TrainingJob],
        total_resources: i32,
        resource_unit: &str,
    ) {
        self.metrics.live_workers_reset();

        let mut active = 0;
        for (old, job) in snapshot.iter().zip(jobs.iter()) {
            let namespace = job.namespace().unwrap_or_default();
            let uid = job.uid().unwrap_or_default();
            self.metrics
                .live_workers_set(&namespace, &uid, job.current_size());
            active += job.current_size() * plan::resource_usage_per_pod(job, resource_unit);

            if old.stage() == TrainingJobStage::Init && job.stage() == TrainingJobStage::Waiting {
                self.metrics
                    .job_created_inc(&namespace, job.framework().as_str());
            }
        }

        self.metrics.cluster_size_set(total_resources);
        self.metrics.active_size_set(active);
    }

    /// Run the controller until shutdown. Node events re-enqueue every known
    /// job; the pass is global, so any one of them reaching the reconciler
    /// triggers a re-plan and the rest coalesce.
    pub async fn run(self: Arc<Self>) {
        let jobs = self.jobs_api();
        let nodes: Api<Node> = Api::all(self.client.clone());

        let controller = Controller::new(jobs, watcher::Config::default());
        let store = controller.store();

        controller
            .watches(nodes, watcher::Config::default(), move |_node: Node| {
                store
                    .state()
                    .iter()
                    .map(|job| ObjectRef::from_obj(job.as_ref()))
                    .collect::<Vec<_>>()
            })
            .shutdown_on_signal()
            .run(Self::reconcile, Self::error_policy, self)
            .for_each(|result| async {
                match result {
                    Ok((obj, _)) => debug!(job = %obj.name, "autoscaler pass complete"),
                    Err(err) => debug!(error = %err, "autoscaler pass failed"),
                }
            })
            .await;
    }

    async fn reconcile(_job: Arc<TrainingJob>, scaler: Arc<Self>) -> Result<Action> {
        scaler.run_pass().await
    }

    fn error_policy(_job: Arc<TrainingJob>, error: &Error, _scaler: Arc<Self>) -> Action {
        warn!(error = %error, "autoscaler pass error, will retry");
        Action::requeue(RERUN_DURATION)
    }
}
