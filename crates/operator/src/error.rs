use crate::crd::DEFAULT_CONTAINER_NAME;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("job {job} is misconfigured: {reason}")]
    InvalidJob { job: String, reason: String },

    #[error("object has no {0}")]
    MissingObjectKey(&'static str),

    #[error("usage push rejected: {0}")]
    UsagePush(String),
}

impl Error {
    pub fn invalid_job(job: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidJob {
            job: job.into(),
            reason: reason.into(),
        }
    }

    pub fn single_container_violation(job: impl Into<String>, count: usize) -> Self {
        Error::InvalidJob {
            job: job.into(),
            reason: format!(
                "expected exactly one container named {DEFAULT_CONTAINER_NAME}, found {count}"
            ),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
