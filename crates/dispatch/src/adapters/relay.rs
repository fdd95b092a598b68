//! Relay backend: queue-style cloud inference API
//!
//! The relay exposes a submit/status/result triple per model route:
//!
//! - `POST {base}/{route}` → `{"request_id": "..."}`
//! - `GET  {base}/{family}/requests/{id}/status` → `{"status": "IN_QUEUE" | "IN_PROGRESS" | "COMPLETED" | "FAILED", ...}`
//! - `GET  {base}/{family}/requests/{id}` → the result payload with the artifact URL
//!
//! Model keys map onto vendor routes below. The adapter never retries; it
//! surfaces transport and status failures as [`BackendFailure`] and lets the
//! orchestration layer decide.

use super::{GenerationBackend, GenerationRequest, PollStatus};
use async_trait::async_trait;
use lumen_core_resilience::BackendFailure;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, error, info};

/// Vendor route and status family per model key
fn model_routes(model: &str) -> Option<(&'static str, &'static str)> {
    match model {
        "wan" => Some(("fal-ai/wan-25-preview/image-to-video", "fal-ai/wan-25-preview")),
        "wan21" => Some(("fal-ai/wan/v2.1/image-to-video", "fal-ai/wan")),
        "wan22" => Some(("fal-ai/wan/v2.2-a14b/image-to-video", "fal-ai/wan")),
        "wan-pro" => Some(("fal-ai/wan-pro/image-to-video", "fal-ai/wan-pro")),
        "kling" => Some((
            "fal-ai/kling-video/v2.5-turbo/pro/image-to-video",
            "fal-ai/kling-video",
        )),
        "kling-standard" => Some((
            "fal-ai/kling-video/v2.5-turbo/standard/image-to-video",
            "fal-ai/kling-video",
        )),
        "kling-master" => Some((
            "fal-ai/kling-video/v2.5-master/image-to-video",
            "fal-ai/kling-video",
        )),
        "veo2" => Some(("fal-ai/veo2/image-to-video", "fal-ai/veo2")),
        "veo31" => Some(("fal-ai/veo3.1/image-to-video", "fal-ai/veo3.1")),
        "veo31-fast" => Some(("fal-ai/veo3.1/fast/image-to-video", "fal-ai/veo3.1")),
        "sora-2" => Some(("fal-ai/sora-2/image-to-video", "fal-ai/sora-2")),
        "sora-2-pro" => Some(("fal-ai/sora-2/pro/image-to-video", "fal-ai/sora-2")),
        "kling-image" => Some(("fal-ai/kling-image/v2", "fal-ai/kling-image")),
        "nano-banana" => Some(("fal-ai/nano-banana/edit", "fal-ai/nano-banana")),
        _ => None,
    }
}

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

async fn failure_from_response(response: reqwest::Response) -> BackendFailure {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let message: String = body.chars().take(300).collect();
    BackendFailure::http(status, message)
}

/// Cloud inference API adapter
pub struct RelayBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl RelayBackend {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    fn routes(&self, model: &str) -> Result<(String, String), BackendFailure> {
        let (submit_route, family) = model_routes(model)
            .ok_or_else(|| BackendFailure::other(format!("invalid model for relay: {}", model)))?;
        Ok((
            format!("{}/{}", self.base_url, submit_route),
            format!("{}/{}", self.base_url, family),
        ))
    }

    fn payload(request: &GenerationRequest) -> Value {
        let mut payload = json!({
            "prompt": request.prompt,
            "negative_prompt": request
                .negative_prompt
                .as_deref()
                .unwrap_or("low resolution, error, worst quality, low quality, artifacts"),
        });

        if let Some(image_url) = &request.image_url {
            payload["image_url"] = json!(image_url);
        }
        if let Some(resolution) = &request.resolution {
            payload["resolution"] = json!(resolution);
        }
        if let Some(duration) = request.duration_sec {
            payload["duration"] = json!(duration.to_string());
        }
        if let Some(aspect_ratio) = &request.aspect_ratio {
            payload["aspect_ratio"] = json!(aspect_ratio);
        }
        if request.num_outputs > 1 {
            payload["num_images"] = json!(request.num_outputs);
        }

        payload
    }

    /// Pull the artifact URL out of a result payload, whichever shape the
    /// route uses (`video.url`, `image.url`, or `images[0].url`)
    fn extract_result_url(data: &Value) -> Option<String> {
        for key in ["video", "image"] {
            if let Some(url) = data.get(key).and_then(|o| o.get("url")).and_then(Value::as_str) {
                return Some(url.to_string());
            }
        }
        data.get("images")
            .and_then(Value::as_array)
            .and_then(|a| a.first())
            .and_then(|o| o.get("url"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

#[async_trait]
impl GenerationBackend for RelayBackend {
    fn name(&self) -> &str {
        "relay"
    }

    async fn submit(&self, request: &GenerationRequest) -> Result<String, BackendFailure> {
        let (submit_url, _) = self.routes(&request.model)?;
        debug!(model = %request.model, url = %submit_url, "submitting to relay");

        let response = self
            .client
            .post(&submit_url)
            .header("Authorization", format!("Key {}", self.api_key))
            .json(&Self::payload(request))
            .send()
            .await
            .map_err(failure_from_reqwest)?;

        if !response.status().is_success() {
            let failure = failure_from_response(response).await;
            error!(model = %request.model, error = %failure, "relay submit failed");
            return Err(failure);
        }

        let data: Value = response.json().await.map_err(failure_from_reqwest)?;
        let request_id = data
            .get("request_id")
            .and_then(Value::as_str)
            .ok_or_else(|| BackendFailure::other("no request_id in relay response"))?;

        info!(model = %request.model, request_id, "job submitted to relay");
        Ok(request_id.to_string())
    }

    async fn poll(&self, model: &str, request_id: &str) -> Result<PollStatus, BackendFailure> {
        let (_, family_url) = self.routes(model)?;
        let status_url = format!("{}/requests/{}/status", family_url, request_id);

        let response = self
            .client
            .get(&status_url)
            .header("Authorization", format!("Key {}", self.api_key))
            .send()
            .await
            .map_err(failure_from_reqwest)?;

        if !response.status().is_success() {
            return Err(failure_from_response(response).await);
        }

        let data: Value = response.json().await.map_err(failure_from_reqwest)?;
        let remote_status = data.get("status").and_then(Value::as_str).unwrap_or("");

        match remote_status {
            "IN_QUEUE" => Ok(PollStatus::Queued),
            "IN_PROGRESS" => Ok(PollStatus::Running),
            "FAILED" => Ok(PollStatus::Failed {
                message: data
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown error from relay")
                    .to_string(),
            }),
            "COMPLETED" => {
                // Status says done; fetch the result payload for the URL
                let result_url = format!("{}/requests/{}", family_url, request_id);
                let response = self
                    .client
                    .get(&result_url)
                    .header("Authorization", format!("Key {}", self.api_key))
                    .send()
                    .await
                    .map_err(failure_from_reqwest)?;

                if !response.status().is_success() {
                    return Err(failure_from_response(response).await);
                }

                let data: Value = response.json().await.map_err(failure_from_reqwest)?;
                match Self::extract_result_url(&data) {
                    Some(url) => Ok(PollStatus::Completed { result_url: url }),
                    None => Ok(PollStatus::Failed {
                        message: "completed result carried no artifact URL".to_string(),
                    }),
                }
            }
            other => {
                debug!(model, request_id, remote_status = other, "unrecognized relay status");
                Ok(PollStatus::Queued)
            }
        }
    }
}
