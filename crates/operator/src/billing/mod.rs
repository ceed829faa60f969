//! Billing daemon: periodic license validation and usage metering.
//!
//! Two independent tickers share one atomic `approved` flag. The autoscaler
//! reads the flag after planning and before writing; a stale read delays
//! gating by at most one tick, which is acceptable.

pub mod license;
pub mod usage;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::metrics::OperatorMetrics;
use license::{LicenseValidator, RemoteLicenseValidator};
use usage::{usage_sample, RemoteWriteSink, UsageSink};

const LICENSE_CHECK_INTERVAL: Duration = Duration::from_secs(60);
const USAGE_PUSH_INTERVAL: Duration = Duration::from_secs(60);

pub struct Daemon {
    /// The operator may make scheduling decisions effective only while true.
    approved: AtomicBool,

    license: Box<dyn LicenseValidator>,
    usage: Box<dyn UsageSink>,
    license_key: Option<String>,
    metrics: Arc<OperatorMetrics>,
}

impl Daemon {
    pub fn new(license_key: Option<String>, metrics: Arc<OperatorMetrics>) -> Self {
        Self {
            approved: AtomicBool::new(false),
            license: Box::new(RemoteLicenseValidator::new(license_key.clone())),
            usage: Box::new(RemoteWriteSink::new()),
            license_key,
            metrics,
        }
    }

    #[cfg(test)]
    fn with_parts(
        license: Box<dyn LicenseValidator>,
        usage: Box<dyn UsageSink>,
        license_key: Option<String>,
        metrics: Arc<OperatorMetrics>,
    ) -> Self {
        Self {
            approved: AtomicBool::new(false),
            license,
            usage,
            license_key,
            metrics,
        }
    }

    pub fn is_approved(&self) -> bool {
        self.approved.load(Ordering::Relaxed)
    }

    async fn check_license(&self) {
        let approved = self.license.validate().await;
        self.approved.store(approved, Ordering::Relaxed);
    }

    async fn push_usage(&self) {
        let Some(key) = self.license_key.as_deref() else {
            return;
        };
        let active = self.metrics.active_size_get() as f64;
        // Push failures never affect the approval gate.
        if let Err(err) = self.usage.push(vec![usage_sample(key, active)]).await {
            warn!(error = %err, "usage push failed");
        }
    }

    /// Spawn both tickers. They run for the lifetime of the process.
    pub fn start(self: &Arc<Self>) {
        info!("starting billing daemon");

        let daemon = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(LICENSE_CHECK_INTERVAL);
            loop {
                ticker.tick().await;
                daemon.check_license().await;
            }
        });

        let daemon = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(USAGE_PUSH_INTERVAL);
            loop {
                ticker.tick().await;
                daemon.push_usage().await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FixedLicense(bool);

    #[async_trait]
    impl LicenseValidator for FixedLicense {
        async fn validate(&self) -> bool {
            self.0
        }
    }

    #[derive(Clone, Default)]
    struct RecordingSink {
        pushed: Arc<Mutex<Vec<f64>>>,
        fail: bool,
    }

    #[async_trait]
    impl UsageSink for RecordingSink {
        async fn push(&self, series: Vec<usage::TimeSeries>) -> Result<()> {
            if self.fail {
                return Err(Error::UsagePush("boom".into()));
            }
            let mut pushed = self.pushed.lock().unwrap();
            pushed.extend(series.iter().flat_map(|s| s.samples.iter().map(|x| x.value)));
            Ok(())
        }
    }

    #[tokio::test]
    async fn approval_follows_license_validation() {
        let metrics = Arc::new(OperatorMetrics::new().unwrap());
        let daemon = Daemon::with_parts(
            Box::new(FixedLicense(true)),
            Box::new(RecordingSink::default()),
            Some("key-123".to_string()),
            metrics,
        );
        assert!(!daemon.is_approved());

        daemon.check_license().await;
        assert!(daemon.is_approved());
    }

    #[tokio::test]
    async fn failed_validation_revokes_approval() {
        let metrics = Arc::new(OperatorMetrics::new().unwrap());
        let daemon = Daemon::with_parts(
            Box::new(FixedLicense(false)),
            Box::new(RecordingSink::default()),
            Some("key-123".to_string()),
            metrics,
        );
        daemon.approved.store(true, Ordering::Relaxed);

        daemon.check_license().await;
        assert!(!daemon.is_approved());
    }

    #[tokio::test]
    async fn usage_push_reads_the_active_size_gauge() {
        let metrics = Arc::new(OperatorMetrics::new().unwrap());
        let sink = RecordingSink::default();
        let daemon = Daemon::with_parts(
            Box::new(FixedLicense(true)),
            Box::new(sink.clone()),
            Some("key-123".to_string()),
            metrics.clone(),
        );

        metrics.active_size_set(6);
        daemon.push_usage().await;

        assert_eq!(*sink.pushed.lock().unwrap(), vec![6.0]);
    }

    #[tokio::test]
    async fn failed_usage_push_never_revokes_approval() {
        let metrics = Arc::new(OperatorMetrics::new().unwrap());
        let daemon = Daemon::with_parts(
            Box::new(FixedLicense(true)),
            Box::new(RecordingSink {
                pushed: Arc::default(),
                fail: true,
            }),
            Some("key-123".to_string()),
            metrics,
        );
        daemon.approved.store(true, Ordering::Relaxed);

        daemon.push_usage().await;
        assert!(daemon.is_approved());
    }

    #[tokio::test]
    async fn usage_push_without_license_key_is_skipped() {
        let metrics = Arc::new(OperatorMetrics::new().unwrap());
        let sink = RecordingSink::default();
        let daemon = Daemon::with_parts(
            Box::new(FixedLicense(true)),
            Box::new(sink.clone()),
            None,
            metrics,
        );

        daemon.push_usage().await;
        assert!(sink.pushed.lock().unwrap().is_empty());
    }
}
