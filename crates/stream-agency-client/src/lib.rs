//! Outbound HTTP adapters for the Stream Agency daemon: the Stream Client
//! and the Epoch Oracle.
//!
//! Both are defined as small traits so the Scheduler can be tested against
//! fakes without a network. The production implementations are thin
//! `reqwest` wrappers behind those trait boundaries.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use stream_agency_schemas::AgencyError;

const TIMEOUT: Duration = Duration::from_secs(20);

// ---------------------------------------------------------------------------
// Stream Client
// ---------------------------------------------------------------------------

/// Outcome of one `POST {stream_url}` call. This type is never a `Result` —
/// a network failure is itself a valid, recordable outcome, not an
/// exceptional one.
#[derive(Debug, Clone)]
pub struct StreamResponse {
    pub ok: bool,
    pub status: i64,
    pub body: String,
    pub parsed: Option<Value>,
}

impl StreamResponse {
    /// First integer field present among `end_stream`, `can_stream_again_at`.
    pub fn end_stream_ms(&self) -> Option<i64> {
        let obj = self.parsed.as_ref()?.as_object()?;
        for key in ["end_stream", "can_stream_again_at"] {
            if let Some(v) = obj.get(key).and_then(Value::as_i64) {
                return Some(v);
            }
        }
        None
    }

    /// True when this is the 403/"already streaming" resync case.
    pub fn is_already_streaming(&self) -> bool {
        !self.ok && self.status == 403 && self.body.to_lowercase().contains("already streaming")
    }
}

#[async_trait]
pub trait StreamClient: Send + Sync {
    async fn post_stream(&self, address: &str, signature: &str) -> StreamResponse;
}

fn normalize_signature(sig: &str) -> String {
    sig.trim().strip_prefix("0x").unwrap_or(sig.trim()).to_string()
}

pub struct HttpStreamClient {
    client: reqwest::Client,
    stream_url: String,
}

impl HttpStreamClient {
    pub fn new(stream_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(TIMEOUT)
                .build()
                .expect("reqwest client build"),
            stream_url: stream_url.into(),
        }
    }
}

#[async_trait]
impl StreamClient for HttpStreamClient {
    async fn post_stream(&self, address: &str, signature: &str) -> StreamResponse {
        let payload = serde_json::json!({
            "signature": normalize_signature(signature),
            "message": "stream",
            "address": address,
        });

        let resp = self
            .client
            .post(&self.stream_url)
            .json(&payload)
            .send()
            .await;

        match resp {
            Ok(resp) => {
                let status = resp.status().as_u16() as i64;
                let ok = resp.status().is_success();
                let body = resp.text().await.unwrap_or_default();
                let parsed = serde_json::from_str::<Value>(&body).ok();
                StreamResponse {
                    ok,
                    status,
                    body,
                    parsed,
                }
            }
            Err(e) => StreamResponse {
                ok: false,
                status: 0,
                body: format!("URLError: {e}"),
                parsed: None,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Epoch Oracle
// ---------------------------------------------------------------------------

#[async_trait]
pub trait EpochOracle: Send + Sync {
    /// Current chain epoch. Fails with `EpochUnavailable` when neither the
    /// primary nor fallback endpoint yields a parseable epoch.
    async fn get_epoch(&self) -> Result<i64, AgencyError>;
}

pub struct HttpEpochOracle {
    client: reqwest::Client,
    base_url: String,
}

impl HttpEpochOracle {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        let base_url = base_url.trim_end_matches('/').to_string();
        Self {
            client: reqwest::Client::builder()
                .timeout(TIMEOUT)
                .build()
                .expect("reqwest client build"),
            base_url,
        }
    }

    async fn get_json(&self, path: &str) -> anyhow::Result<Value> {
        let resp = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json::<Value>().await?)
    }

    fn extract_epoch(data: &Value) -> Option<i64> {
        let status = data.pointer("/data/status");
        for key in ["erd_epoch", "erd_epoch_number", "epoch"] {
            if let Some(v) = status.and_then(|s| s.get(key)).and_then(Value::as_i64) {
                return Some(v);
            }
        }
        data.pointer("/data/metrics/erd_epoch").and_then(Value::as_i64)
    }
}

#[async_trait]
impl EpochOracle for HttpEpochOracle {
    async fn get_epoch(&self) -> Result<i64, AgencyError> {
        // Primary, then fallback.
        let primary = self.get_json("/network/status/4294967295").await;
        let data = match primary {
            Ok(data) => data,
            Err(primary_err) => self.get_json("/network/status").await.map_err(|fallback_err| {
                AgencyError::EpochUnavailable(format!(
                    "primary: {primary_err}; fallback: {fallback_err}"
                ))
            })?,
        };

        Self::extract_epoch(&data).ok_or_else(|| {
            AgencyError::EpochUnavailable(format!(
                "no integer epoch field in /network/status response: {data}"
            ))
        })
    }
}
