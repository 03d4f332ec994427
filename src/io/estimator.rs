//! HTTP client for the wait-time prediction service
//!
//! `POST {base_url}/predict/wait-time` with
//! `{service_id, queue_position, current_time, priority}` and expects
//! `{predicted_wait_time, confidence, model_used}` back. Timeouts and
//! fallback are handled by the stats aggregator, not here.

use crate::services::stats::{WaitEstimateRequest, WaitTimeEstimator};
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Serialize)]
struct PredictionRequest<'a> {
    service_id: &'a str,
    queue_position: usize,
    /// RFC 3339
    current_time: String,
    priority: &'a str,
}

#[derive(Debug, Deserialize)]
struct PredictionResponse {
    /// Minutes
    predicted_wait_time: f64,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    model_used: Option<String>,
}

pub struct HttpWaitTimeEstimator {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpWaitTimeEstimator {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build estimator HTTP client")?;
        let endpoint = format!("{}/predict/wait-time", base_url.trim_end_matches('/'));
        info!(endpoint = %endpoint, timeout_ms = %timeout.as_millis(), "wait_estimator_configured");
        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl WaitTimeEstimator for HttpWaitTimeEstimator {
    async fn estimate(&self, request: &WaitEstimateRequest) -> anyhow::Result<u32> {
        let body = PredictionRequest {
            service_id: request.service_id.as_str(),
            queue_position: request.queue_position,
            current_time: request.current_time.to_rfc3339(),
            priority: request.priority.as_str(),
        };

        let response: PredictionResponse = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .context("prediction request failed")?
            .error_for_status()
            .context("prediction service returned an error")?
            .json()
            .await
            .context("invalid prediction response")?;

        if !response.predicted_wait_time.is_finite() || response.predicted_wait_time < 0.0 {
            anyhow::bail!("prediction out of range: {}", response.predicted_wait_time);
        }

        debug!(
            service_id = %request.service_id,
            predicted = %response.predicted_wait_time,
            confidence = ?response.confidence,
            model = ?response.model_used,
            "prediction_received"
        );
        Ok(response.predicted_wait_time.ceil().min(u32::MAX as f64) as u32)
    }

    fn name(&self) -> &str {
        "http"
    }
}
