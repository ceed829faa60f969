//! Environment-driven operator configuration.
//!
//! Everything the two control loops and the billing daemon need is read once
//! at startup. Worker pods are configured indirectly: the reconciler copies
//! the rendezvous/checkpoint settings into pod environment variables when
//! entrypoint injection is enabled.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::warn;

use crate::error::{Error, Result};

/// Resource unit meaning "one pod per node"; any other value is looked up in
/// node allocatable / container requests (e.g. `nvidia.com/gpu`).
pub const NODE_RESOURCE_UNIT: &str = "node";
pub const NVIDIA_GPU_RESOURCE_UNIT: &str = "nvidia.com/gpu";

// Operator-level environment variables.
pub const ENV_NAMESPACE: &str = "NAMESPACE";
pub const ENV_RESOURCE_SCHEDULING_UNIT: &str = "RESOURCE_SCHEDULING_UNIT";
pub const ENV_DEBUG_WORLD_SIZE: &str = "DEBUG_WORLD_SIZE";
pub const ENV_JOB_NODE_SELECTOR_PATH: &str = "LATTICE_JOB_NODE_SELECTOR_PATH";
pub const ENV_JFROG_SECRET_PATH: &str = "LATTICE_JFROG_SECRET_PATH";
pub const ENV_LICENSE: &str = "LATTICE_LICENSE";
pub const ENV_RDZV_BACKEND: &str = "RDZV_BACKEND";
pub const ENV_RDZV_SERVICE_ENDPOINT: &str = "RDZV_SERVICE_ENDPOINT";
pub const ENV_RDZV_SERVICE_PORT: &str = "RDZV_SERVICE_PORT";
pub const ENV_CHECKPOINT_TYPE: &str = "ADDONS_CHECKPOINT_TYPE";
pub const ENV_CHECKPOINT_SERVICE_ENDPOINT: &str = "CHECKPOINT_SERVICE_ENDPOINT";
pub const ENV_CHECKPOINT_SERVICE_PORT: &str = "CHECKPOINT_SERVICE_PORT";
pub const ENV_KUBE_CONTEXT: &str = "KUBE_CONTEXT";
pub const ENV_LOG_LEVEL: &str = "LOG_LEVEL";

/// Credentials for the private package index worker pods install the agent
/// from. Mounted as a folder with `username` and `password` files.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistrySecret {
    pub username: String,
    pub password: String,
}

/// Configuration shared by the autoscaler, the reconciler, and billing.
#[derive(Clone, Debug, Default)]
pub struct OperatorConfig {
    /// Namespace to watch. `None` watches cluster-wide.
    pub namespace: Option<String>,

    /// Node labels selecting the worker pool. Applied both when counting
    /// capacity and when pinning worker pods.
    pub job_node_selector: BTreeMap<String, String>,

    /// Package-index credentials for entrypoint injection. `None` makes
    /// injection fail per-job instead of failing startup.
    pub registry_secret: Option<RegistrySecret>,

    /// The resource the scheduler budgets over.
    pub resource_unit: String,

    /// Manual pool-size override for debugging; skips node counting.
    pub debug_world_size: Option<i32>,

    /// License key presented to the validation endpoint.
    pub license_key: Option<String>,

    // Forwarded into worker pods by entrypoint injection.
    pub checkpoint_type: String,
    pub checkpoint_endpoint: String,
    pub checkpoint_port: String,
    pub rendezvous_backend: String,
    pub rendezvous_endpoint: String,
    pub rendezvous_port: String,
}

impl OperatorConfig {
    /// Assemble the configuration from the process environment.
    ///
    /// `namespace` comes from the CLI; the empty string means cluster-wide.
    pub fn from_env(namespace: &str) -> Self {
        let env = |name: &str| std::env::var(name).unwrap_or_default();

        OperatorConfig {
            namespace: (!namespace.is_empty()).then(|| namespace.to_string()),
            job_node_selector: load_job_node_selector(),
            registry_secret: match load_registry_secret() {
                Ok(secret) => Some(secret),
                Err(err) => {
                    warn!(error = %err, "package-index secret unavailable, entrypoint injection will fail");
                    None
                }
            },
            resource_unit: match std::env::var(ENV_RESOURCE_SCHEDULING_UNIT) {
                Ok(unit) if !unit.is_empty() => unit,
                _ => NODE_RESOURCE_UNIT.to_string(),
            },
            debug_world_size: match load_debug_world_size() {
                Ok(size) => size,
                Err(err) => {
                    warn!(error = %err, "ignoring {}", ENV_DEBUG_WORLD_SIZE);
                    None
                }
            },
            license_key: std::env::var(ENV_LICENSE).ok(),
            checkpoint_type: env(ENV_CHECKPOINT_TYPE),
            checkpoint_endpoint: env(ENV_CHECKPOINT_SERVICE_ENDPOINT),
            checkpoint_port: env(ENV_CHECKPOINT_SERVICE_PORT),
            rendezvous_backend: env(ENV_RDZV_BACKEND),
            rendezvous_endpoint: env(ENV_RDZV_SERVICE_ENDPOINT),
            rendezvous_port: env(ENV_RDZV_SERVICE_PORT),
        }
    }
}

/// Parse `key=value` lines into selector labels.
///
/// Values may themselves contain `=`; the split is on the first one.
/// Malformed lines are dropped.
pub fn parse_node_selectors(lines: impl IntoIterator<Item = String>) -> BTreeMap<String, String> {
    let mut result = BTreeMap::new();
    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                result.insert(key.to_string(), value.to_string());
            }
            _ => warn!(line, "skipping malformed node selector line"),
        }
    }
    result
}

fn load_job_node_selector() -> BTreeMap<String, String> {
    let Ok(path) = std::env::var(ENV_JOB_NODE_SELECTOR_PATH) else {
        return BTreeMap::new();
    };
    match std::fs::read_to_string(&path) {
        Ok(contents) => parse_node_selectors(contents.lines().map(str::to_string)),
        Err(err) => {
            warn!(%path, error = %err, "failed to read job node selector file");
            BTreeMap::new()
        }
    }
}

fn load_registry_secret() -> Result<RegistrySecret> {
    let path = std::env::var(ENV_JFROG_SECRET_PATH)
        .map_err(|_| Error::Config(format!("{ENV_JFROG_SECRET_PATH} is not set")))?;
    read_registry_secret(Path::new(&path))
}

/// Read the `username`/`password` files from a mounted secret folder.
pub fn read_registry_secret(dir: &Path) -> Result<RegistrySecret> {
    let read = |file: &str| -> Result<String> {
        let contents = std::fs::read_to_string(dir.join(file)).map_err(|err| {
            Error::Config(format!("failed to read secret file {}/{file}: {err}", dir.display()))
        })?;
        // Mounted secrets often carry a trailing newline.
        Ok(contents.trim_end_matches('\n').to_string())
    };

    Ok(RegistrySecret {
        username: read("username")?,
        password: read("password")?,
    })
}

fn load_debug_world_size() -> Result<Option<i32>> {
    let Ok(raw) = std::env::var(ENV_DEBUG_WORLD_SIZE) else {
        return Ok(None);
    };
    match raw.parse::<i32>() {
        Ok(size) if size > 0 => Ok(Some(size)),
        _ => Err(Error::Config(format!(
            "{ENV_DEBUG_WORLD_SIZE} should be a positive integer, got {raw:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn node_selector_parsing() {
        let labels = parse_node_selectors(
            [
                "pool=workers",
                "nvidia.com/gpu.present=true",
                "not-a-pair",
                "",
                "tag=a=b",
            ]
            .map(String::from),
        );

        assert_eq!(labels.len(), 3);
        assert_eq!(labels["pool"], "workers");
        assert_eq!(labels["nvidia.com/gpu.present"], "true");
        // split is on the first '=' so values keep the rest
        assert_eq!(labels["tag"], "a=b");
    }

    #[test]
    fn registry_secret_trims_trailing_newline() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("username"), "robot\n").unwrap();
        fs::write(dir.path().join("password"), "hunter2\n").unwrap();

        let secret = read_registry_secret(dir.path()).unwrap();
        assert_eq!(secret.username, "robot");
        assert_eq!(secret.password, "hunter2");
    }

    #[test]
    fn registry_secret_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("username"), "robot").unwrap();

        assert!(read_registry_secret(dir.path()).is_err());
    }
}
