//! Lattice Operator - Main Entry Point
//!
//! Hosts the TrainingJob autoscaler and pod reconciler plus the billing
//! daemon in one process, and serves prometheus metrics and health probes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use chrono::Utc;
use clap::Parser;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use kube::Client;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use lattice_operator::config::ENV_KUBE_CONTEXT;
use lattice_operator::{AutoScaler, Daemon, OperatorConfig, OperatorMetrics, TrainingJobReconciler};

const LEADER_LEASE_NAME: &str = "lattice-operator-leader";
const LEADER_LEASE_SECONDS: i32 = 30;
const LEADER_RENEW_INTERVAL: Duration = Duration::from_secs(10);

/// Lattice Kubernetes Operator for elastic TrainingJobs
#[derive(Parser, Debug)]
#[command(name = "lattice-operator")]
#[command(about = "Elastic training-job autoscaler and reconciler", long_about = None)]
struct Args {
    /// The address the metric endpoint binds to.
    #[arg(long, default_value = "0.0.0.0:8080")]
    metrics_bind_address: SocketAddr,

    /// The address the probe endpoint binds to.
    #[arg(long, default_value = "0.0.0.0:8081")]
    health_probe_bind_address: SocketAddr,

    /// Ensure only one active operator per cluster via a Lease.
    #[arg(long)]
    leader_elect: bool,

    /// The namespace to monitor jobs in. If unset, all namespaces are
    /// monitored cluster-wide.
    #[arg(long, default_value = "")]
    namespace: String,

    /// Port reserved for the monitoring endpoint of the manager. Accepted
    /// for deployment compatibility.
    #[arg(long, default_value_t = 9443)]
    monitoring_port: u16,
}

fn init_tracing() {
    let level = std::env::var(lattice_operator::config::ENV_LOG_LEVEL)
        .unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Build the cluster client, honoring a `KUBE_CONTEXT` override.
async fn build_client() -> Result<Client> {
    if let Ok(context) = std::env::var(ENV_KUBE_CONTEXT) {
        let options = kube::config::KubeConfigOptions {
            context: Some(context.clone()),
            ..Default::default()
        };
        let config = kube::Config::from_kubeconfig(&options)
            .await
            .with_context(|| format!("unable to load kubeconfig context {context}"))?;
        return Client::try_from(config).context("unable to build cluster client");
    }
    Client::try_default()
        .await
        .context("unable to build cluster client")
}

fn lease_holder_identity() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| format!("lattice-operator-{}", std::process::id()))
}

fn build_lease(holder: &str, namespace: &str) -> Lease {
    let now = MicroTime(Utc::now());
    Lease {
        metadata: ObjectMeta {
            name: Some(LEADER_LEASE_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(LeaseSpec {
            holder_identity: Some(holder.to_string()),
            lease_duration_seconds: Some(LEADER_LEASE_SECONDS),
            acquire_time: Some(now.clone()),
            renew_time: Some(now),
            ..Default::default()
        }),
    }
}

/// Block until this process holds the leader lease, then keep renewing it in
/// the background.
async fn acquire_leadership(client: Client, namespace: &str) -> Result<()> {
    let api: Api<Lease> = Api::namespaced(client, namespace);
    let holder = lease_holder_identity();

    loop {
        match api.get_opt(LEADER_LEASE_NAME).await? {
            None => {
                let lease = build_lease(&holder, namespace);
                match api.create(&PostParams::default(), &lease).await {
                    Ok(_) => break,
                    // Another replica won the create race; retry the loop.
                    Err(kube::Error::Api(err)) if err.code == 409 => {}
                    Err(err) => return Err(err.into()),
                }
            }
            Some(existing) => {
                let spec = existing.spec.unwrap_or_default();
                let held_by_us = spec.holder_identity.as_deref() == Some(holder.as_str());
                let expired = spec
                    .renew_time
                    .map(|t| {
                        (Utc::now() - t.0).num_seconds()
                            > i64::from(spec.lease_duration_seconds.unwrap_or(LEADER_LEASE_SECONDS))
                    })
                    .unwrap_or(true);

                if held_by_us || expired {
                    let lease = build_lease(&holder, namespace);
                    api.patch(
                        LEADER_LEASE_NAME,
                        &PatchParams::apply("lattice-operator").force(),
                        &Patch::Apply(&lease),
                    )
                    .await?;
                    break;
                }
                debug!(
                    holder = spec.holder_identity.as_deref().unwrap_or(""),
                    "leader lease held elsewhere, waiting"
                );
            }
        }
        tokio::time::sleep(LEADER_RENEW_INTERVAL).await;
    }

    info!(identity = %holder, "acquired leader lease");

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(LEADER_RENEW_INTERVAL);
        loop {
            ticker.tick().await;
            let patch = serde_json::json!({
                "spec": { "renewTime": MicroTime(Utc::now()) }
            });
            if let Err(err) = api
                .patch(LEADER_LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
                .await
            {
                warn!(error = %err, "failed to renew leader lease");
            }
        }
    });

    Ok(())
}

async fn serve_metrics(addr: SocketAddr, metrics: Arc<OperatorMetrics>) -> Result<()> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let metrics = metrics.clone();
            async move { metrics.gather() }
        }),
    );
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("unable to bind metrics endpoint on {addr}"))?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn serve_probes(addr: SocketAddr) -> Result<()> {
    let app = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("unable to bind probe endpoint on {addr}"))?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing();

    info!(
        namespace = %args.namespace,
        monitoring_port = args.monitoring_port,
        "starting lattice operator"
    );

    let client = build_client().await?;
    let config = Arc::new(OperatorConfig::from_env(&args.namespace));
    let metrics =
        Arc::new(OperatorMetrics::new().context("unable to register prometheus metrics")?);

    if args.leader_elect {
        let lease_namespace = config.namespace.clone().unwrap_or_else(|| "default".to_string());
        acquire_leadership(client.clone(), &lease_namespace)
            .await
            .context("leader election failed")?;
    }

    // The billing daemon runs from the start so the first autoscaler pass
    // already sees a fresh license verdict.
    let billing = Arc::new(Daemon::new(config.license_key.clone(), metrics.clone()));
    billing.start();

    let autoscaler = Arc::new(AutoScaler::new(
        client.clone(),
        config.clone(),
        metrics.clone(),
        billing,
    ));
    let reconciler = Arc::new(TrainingJobReconciler::new(
        client,
        config,
        metrics.clone(),
    ));

    let metrics_server = tokio::spawn(serve_metrics(args.metrics_bind_address, metrics));
    let probe_server = tokio::spawn(serve_probes(args.health_probe_bind_address));
    let autoscaler_loop = tokio::spawn(autoscaler.run());
    let reconciler_loop = tokio::spawn(reconciler.run());

    tokio::select! {
        result = metrics_server => result?.context("metrics server exited")?,
        result = probe_server => result?.context("probe server exited")?,
        result = autoscaler_loop => result.context("autoscaler exited")?,
        result = reconciler_loop => result.context("reconciler exited")?,
    }

    Ok(())
}
