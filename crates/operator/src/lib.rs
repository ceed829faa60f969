//! Lattice Operator
//!
//! Cluster-side operator for elastic TrainingJobs. Two control loops share
//! the TrainingJob kind: the autoscaler decides how many workers each job
//! should run (and which jobs run at all), the reconciler drives the pod set
//! toward that decision. A billing daemon gates the autoscaler's writes on a
//! valid license and meters resource usage.

pub mod autoscaler;
pub mod billing;
pub mod config;
pub mod crd;
pub mod error;
pub mod metrics;
pub mod reconciler;

pub use autoscaler::AutoScaler;
pub use billing::Daemon;
pub use config::OperatorConfig;
pub use crd::TrainingJob;
pub use error::{Error, Result};
pub use metrics::OperatorMetrics;
pub use reconciler::TrainingJobReconciler;
