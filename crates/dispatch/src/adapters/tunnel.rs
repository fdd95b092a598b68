//! Tunnel backend: self-hosted GPU service behind an ephemeral tunnel
//!
//! Self-hosted boxes come and go; the tunnel URL is rotated whenever the
//! instance is reprovisioned, so the base URL is plain configuration here
//! and ownership of rotation lives with the operator. The wire contract is
//! a minimal job API:
//!
//! - `POST {base}/generate` → `{"job_id": "..."}`
//! - `GET  {base}/jobs/{id}` → `{"status": "pending" | "processing" | "done" | "error", "output_url": ..., "detail": ...}`

use super::{GenerationBackend, GenerationRequest, PollStatus};
use async_trait::async_trait;
use lumen_core_resilience::BackendFailure;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

fn failure_from_reqwest(e: reqwest::Error) -> BackendFailure {
    if e.is_timeout() {
        BackendFailure::Timeout(e.to_string())
    } else if e.is_connect() {
        BackendFailure::Connect(e.to_string())
    } else if let Some(status) = e.status() {
        BackendFailure::http(status.as_u16(), e.to_string())
    } else {
        BackendFailure::other(e.to_string())
    }
}

/// Self-hosted generation service adapter
pub struct TunnelBackend {
    client: reqwest::Client,
    base_url: String,
}

impl TunnelBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn check(response: reqwest::Response) -> Result<Value, BackendFailure> {
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            let message: String = body.chars().take(300).collect();
            return Err(BackendFailure::http(status, message));
        }
        response.json().await.map_err(failure_from_reqwest)
    }
}

#[async_trait]
impl GenerationBackend for TunnelBackend {
    fn name(&self) -> &str {
        "tunnel"
    }

    async fn submit(&self, request: &GenerationRequest) -> Result<String, BackendFailure> {
        let url = format!("{}/generate", self.base_url);
        debug!(model = %request.model, url = %url, "submitting to tunnel");

        let payload = json!({
            "model": request.model,
            "prompt": request.prompt,
            "image_url": request.image_url,
            "resolution": request.resolution,
            "duration_sec": request.duration_sec,
            "negative_prompt": request.negative_prompt,
            "num_outputs": request.num_outputs.max(1),
        });

        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(failure_from_reqwest)?;

        let data = Self::check(response).await?;
        let job_id = data
            .get("job_id")
            .and_then(Value::as_str)
            .ok_or_else(|| BackendFailure::other("no job_id in tunnel response"))?;

        info!(model = %request.model, job_id, "job submitted to tunnel");
        Ok(job_id.to_string())
    }

    async fn poll(&self, _model: &str, request_id: &str) -> Result<PollStatus, BackendFailure> {
        let url = format!("{}/jobs/{}", self.base_url, request_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(failure_from_reqwest)?;

        let data = Self::check(response).await?;
        Ok(map_poll(&data, request_id))
    }
}

fn map_poll(data: &Value, request_id: &str) -> PollStatus {
    let status = data.get("status").and_then(Value::as_str).unwrap_or("");

    match status {
        "pending" => PollStatus::Queued,
        "processing" => PollStatus::Running,
        "done" => match data.get("output_url").and_then(Value::as_str) {
            Some(url) => PollStatus::Completed {
                result_url: url.to_string(),
            },
            None => PollStatus::Failed {
                message: "done job carried no output_url".to_string(),
            },
        },
        "error" => PollStatus::Failed {
            message: data
                .get("detail")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error from tunnel")
                .to_string(),
        },
        other => {
            debug!(request_id, remote_status = other, "unrecognized tunnel status");
            PollStatus::Queued
        }
    }
}
