//! Usage metering: pushes the active resource-unit count to a remote
//! time-series endpoint.
//!
//! The endpoint speaks the prometheus remote-write protocol: a
//! protobuf-encoded `WriteRequest` inside a snappy frame, POSTed with basic
//! auth. Only the four message shapes we emit are modeled here; the field
//! tags follow the upstream `remote.proto`.

use async_trait::async_trait;
use prost::Message;
use tracing::debug;

use crate::error::{Error, Result};

pub const USAGE_METRIC_NAME: &str = "training_operator_active_size";

// Remote-write endpoint and credentials, baked in at build time.
const REMOTE_WRITE_URL: Option<&str> = option_env!("LATTICE_USAGE_URL");
const REMOTE_WRITE_USERNAME: Option<&str> = option_env!("LATTICE_USAGE_USERNAME");
const REMOTE_WRITE_PASSWORD: Option<&str> = option_env!("LATTICE_USAGE_PASSWORD");

#[derive(Clone, PartialEq, Message)]
pub struct Label {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct Sample {
    #[prost(double, tag = "1")]
    pub value: f64,
    /// Milliseconds since the epoch.
    #[prost(int64, tag = "2")]
    pub timestamp: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct TimeSeries {
    #[prost(message, repeated, tag = "1")]
    pub labels: Vec<Label>,
    #[prost(message, repeated, tag = "2")]
    pub samples: Vec<Sample>,
}

#[derive(Clone, PartialEq, Message)]
pub struct WriteRequest {
    #[prost(message, repeated, tag = "1")]
    pub timeseries: Vec<TimeSeries>,
}

/// One usage sample: the active size right now, labeled with the license so
/// the receiving side can attribute it.
pub fn usage_sample(license_key: &str, active_size: f64) -> TimeSeries {
    TimeSeries {
        labels: vec![
            Label {
                name: "__name__".to_string(),
                value: USAGE_METRIC_NAME.to_string(),
            },
            Label {
                name: "license".to_string(),
                value: license_key.to_string(),
            },
        ],
        samples: vec![Sample {
            value: active_size,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }],
    }
}

/// Encode a write request the way the remote-write endpoint expects it.
pub fn encode_write_request(series: Vec<TimeSeries>) -> Vec<u8> {
    let request = WriteRequest { timeseries: series };
    let encoded = request.encode_to_vec();
    snap::raw::Encoder::new()
        .compress_vec(&encoded)
        .unwrap_or_default()
}

/// Sink for usage samples.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn push(&self, series: Vec<TimeSeries>) -> Result<()>;
}

/// Pushes usage to the remote-write endpoint with basic auth.
pub struct RemoteWriteSink {
    client: reqwest::Client,
    url: Option<String>,
    username: String,
    password: String,
}

impl RemoteWriteSink {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(super::license::HTTP_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            client,
            url: REMOTE_WRITE_URL.map(str::to_string),
            username: REMOTE_WRITE_USERNAME.unwrap_or_default().to_string(),
            password: REMOTE_WRITE_PASSWORD.unwrap_or_default().to_string(),
        }
    }
}

impl Default for RemoteWriteSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UsageSink for RemoteWriteSink {
    async fn push(&self, series: Vec<TimeSeries>) -> Result<()> {
        let Some(url) = self.url.as_deref() else {
            return Err(Error::UsagePush("no usage endpoint configured".into()));
        };

        let body = encode_write_request(series);
        let response = self
            .client
            .post(url)
            .basic_auth(&self.username, Some(&self.password))
            .header("Content-Encoding", "snappy")
            .header("Content-Type", "application/x-protobuf")
            .header("X-Prometheus-Remote-Write-Version", "0.1.0")
            .body(body)
            .send()
            .await
            .map_err(|err| Error::UsagePush(err.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::UsagePush(format!(
                "server returned HTTP status {}",
                response.status()
            )));
        }
        debug!("usage sample pushed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_is_labeled_with_metric_name_and_license() {
        let series = usage_sample("key-123", 8.0);
        assert_eq!(series.labels[0].name, "__name__");
        assert_eq!(series.labels[0].value, USAGE_METRIC_NAME);
        assert_eq!(series.labels[1].name, "license");
        assert_eq!(series.labels[1].value, "key-123");
        assert_eq!(series.samples.len(), 1);
        assert_eq!(series.samples[0].value, 8.0);
        assert!(series.samples[0].timestamp > 0);
    }

    #[test]
    fn encoded_request_round_trips_through_snappy() {
        let payload = encode_write_request(vec![usage_sample("key-123", 3.0)]);
        assert!(!payload.is_empty());

        let raw = snap::raw::Decoder::new().decompress_vec(&payload).unwrap();
        let decoded = WriteRequest::decode(raw.as_slice()).unwrap();
        assert_eq!(decoded.timeseries.len(), 1);
        assert_eq!(decoded.timeseries[0].samples[0].value, 3.0);
    }

    #[tokio::test]
    async fn missing_endpoint_is_an_error_not_a_panic() {
        let sink = RemoteWriteSink {
            client: reqwest::Client::new(),
            url: None,
            username: String::new(),
            password: String::new(),
        };
        assert!(sink.push(vec![usage_sample("k", 1.0)]).await.is_err());
    }
}
