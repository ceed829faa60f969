//! Prometheus metrics for the operator.
//!
//! The gauges double as the data source for the billing usage push, so the
//! metric names are part of the external contract and must stay stable.

use prometheus::{Encoder, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

pub struct OperatorMetrics {
    registry: Registry,

    jobs_created: IntCounterVec,
    jobs_deleted: IntCounterVec,
    jobs_successful: IntCounterVec,
    jobs_failed: IntCounterVec,
    jobs_restarted: IntCounterVec,

    /// Intended workers per job, keyed by namespace and job uid.
    live_workers: IntGaugeVec,
    /// Observed running pods per job, keyed by namespace and job name.
    running_pods: IntGaugeVec,
    /// Total resource units in the worker pool.
    cluster_size: IntGauge,
    /// Resource units claimed by running jobs. Read back by the usage push.
    active_size: IntGauge,
}

impl OperatorMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| {
            IntCounterVec::new(Opts::new(name, help), &["job_namespace", "framework"])
        };

        let jobs_created = counter(
            "training_operator_jobs_created_total",
            "Counts number of jobs created",
        )?;
        let jobs_deleted = counter(
            "training_operator_jobs_deleted_total",
            "Counts number of jobs deleted",
        )?;
        let jobs_successful = counter(
            "training_operator_jobs_successful_total",
            "Counts number of jobs successful",
        )?;
        let jobs_failed = counter(
            "training_operator_jobs_failed_total",
            "Counts number of jobs failed",
        )?;
        let jobs_restarted = counter(
            "training_operator_jobs_restarted_total",
            "Counts number of jobs restarted",
        )?;

        let live_workers = IntGaugeVec::new(
            Opts::new(
                "training_operator_live_pods_total",
                "Gauge of number of live pods",
            ),
            &["job_namespace", "job_id"],
        )?;
        let running_pods = IntGaugeVec::new(
            Opts::new(
                "training_operator_running_pods_total",
                "Gauge of number of running pods",
            ),
            &["job_namespace", "job_name"],
        )?;
        let cluster_size = IntGauge::new(
            "training_operator_cluster_size",
            "Gauge of the cluster size (number of resource units)",
        )?;
        let active_size = IntGauge::new(
            "training_operator_active_size",
            "Gauge of the active size (number of resource units in use)",
        )?;

        registry.register(Box::new(jobs_created.clone()))?;
        registry.register(Box::new(jobs_deleted.clone()))?;
        registry.register(Box::new(jobs_successful.clone()))?;
        registry.register(Box::new(jobs_failed.clone()))?;
        registry.register(Box::new(jobs_restarted.clone()))?;
        registry.register(Box::new(live_workers.clone()))?;
        registry.register(Box::new(running_pods.clone()))?;
        registry.register(Box::new(cluster_size.clone()))?;
        registry.register(Box::new(active_size.clone()))?;

        Ok(Self {
            registry,
            jobs_created,
            jobs_deleted,
            jobs_successful,
            jobs_failed,
            jobs_restarted,
            live_workers,
            running_pods,
            cluster_size,
            active_size,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render the registry in the text exposition format.
    pub fn gather(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(err) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::error!(error = %err, "failed to encode metrics");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    pub fn job_created_inc(&self, namespace: &str, framework: &str) {
        self.jobs_created.with_label_values(&[namespace, framework]).inc();
    }

    pub fn job_deleted_inc(&self, namespace: &str, framework: &str) {
        self.jobs_deleted.with_label_values(&[namespace, framework]).inc();
    }

    pub fn job_successful_inc(&self, namespace: &str, framework: &str) {
        self.jobs_successful.with_label_values(&[namespace, framework]).inc();
    }

    pub fn job_failed_inc(&self, namespace: &str, framework: &str) {
        self.jobs_failed.with_label_values(&[namespace, framework]).inc();
    }

    pub fn job_restarted_inc(&self, namespace: &str, framework: &str) {
        self.jobs_restarted.with_label_values(&[namespace, framework]).inc();
    }

    /// Reset and republish the per-job intended worker gauge. Called once per
    /// autoscaler pass so deleted jobs drop out.
    pub fn live_workers_reset(&self) {
        self.live_workers.reset();
    }

    pub fn live_workers_set(&self, namespace: &str, job_uid: &str, size: i32) {
        self.live_workers
            .with_label_values(&[namespace, job_uid])
            .set(i64::from(size));
    }

    pub fn running_pods_set(&self, namespace: &str, job_name: &str, count: i32) {
        self.running_pods
            .with_label_values(&[namespace, job_name])
            .set(i64::from(count));
    }

    pub fn running_pods_delete(&self, namespace: &str, job_name: &str) {
        let _ = self
            .running_pods
            .remove_label_values(&[namespace, job_name]);
    }

    pub fn cluster_size_set(&self, size: i32) {
        self.cluster_size.set(i64::from(size));
    }

    pub fn active_size_set(&self, size: i32) {
        self.active_size.set(i64::from(size));
    }

    pub fn active_size_get(&self) -> i64 {
        self.active_size.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_size_round_trips() {
        let metrics = OperatorMetrics::new().unwrap();
        metrics.active_size_set(7);
        assert_eq!(metrics.active_size_get(), 7);
    }

    #[test]
    fn live_workers_reset_drops_series() {
        let metrics = OperatorMetrics::new().unwrap();
        metrics.live_workers_set("default", "uid-1", 4);
        assert!(metrics.gather().contains("uid-1"));

        metrics.live_workers_reset();
        assert!(!metrics.gather().contains("uid-1"));
    }
}
