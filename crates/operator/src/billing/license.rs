//! License validation against the licensing service.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Default endpoint of the hosted licensing service.
const LICENSE_SERVER_ENDPOINT: &str = "https://api.lemonsqueezy.com/v1/licenses/validate";

/// Per-request timeout for billing HTTP calls.
pub(crate) const HTTP_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(4);

// Store/product identity the license must be issued for. Baked in at build
// time; the dev fallback values never validate against the real service.
const STORE_ID: Option<&str> = option_env!("LATTICE_STORE_ID");
const PRODUCT_ID: Option<&str> = option_env!("LATTICE_PRODUCT_ID");
const PRODUCT_NAME: Option<&str> = option_env!("LATTICE_PRODUCT_NAME");

/// Something that can decide whether this deployment is licensed.
#[async_trait]
pub trait LicenseValidator: Send + Sync {
    async fn validate(&self) -> bool;
}

#[derive(Serialize)]
struct ValidateRequest<'a> {
    license_key: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct LicenseKey {
    #[allow(dead_code)]
    id: i64,
    #[allow(dead_code)]
    status: String,
    #[allow(dead_code)]
    key: String,
}

#[derive(Debug, Default, Deserialize)]
struct LicenseMeta {
    store_id: i64,
    product_id: i64,
    product_name: String,
}

#[derive(Debug, Deserialize)]
struct ValidateResponse {
    valid: bool,
    #[serde(default)]
    #[allow(dead_code)]
    license_key: LicenseKey,
    #[serde(default)]
    meta: LicenseMeta,
}

/// Validates the configured license key against the remote endpoint.
///
/// Fail-closed: any transport, decode, or metadata mismatch means invalid.
pub struct RemoteLicenseValidator {
    client: reqwest::Client,
    endpoint: String,
    license_key: Option<String>,
    store_id: i64,
    product_id: i64,
    product_name: String,
}

impl RemoteLicenseValidator {
    pub fn new(license_key: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            client,
            endpoint: LICENSE_SERVER_ENDPOINT.to_string(),
            license_key,
            store_id: STORE_ID.and_then(|v| v.parse().ok()).unwrap_or(0),
            product_id: PRODUCT_ID.and_then(|v| v.parse().ok()).unwrap_or(0),
            product_name: PRODUCT_NAME.unwrap_or_default().to_string(),
        }
    }

    #[cfg(test)]
    fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl LicenseValidator for RemoteLicenseValidator {
    async fn validate(&self) -> bool {
        let Some(key) = self.license_key.as_deref() else {
            warn!("no license key configured");
            return false;
        };

        let response = match self
            .client
            .post(&self.endpoint)
            .json(&ValidateRequest { license_key: key })
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(err) => {
                warn!(error = %err, "license validation request failed");
                return false;
            }
        };

        if !response.status().is_success() {
            warn!(status = %response.status(), "license validation rejected");
            return false;
        }

        let decoded: ValidateResponse = match response.json().await {
            Ok(body) => body,
            Err(err) => {
                warn!(error = %err, "license validation response unreadable");
                return false;
            }
        };

        let approved = decoded.valid
            && decoded.meta.store_id == self.store_id
            && decoded.meta.product_id == self.product_id
            && decoded.meta.product_name == self.product_name;
        debug!(valid = decoded.valid, approved, "license checked");
        approved
    }
}
