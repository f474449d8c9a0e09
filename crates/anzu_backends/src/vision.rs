//! Local inference adapter for per-image vision review.
//!
//! No fallback here: when the vision service fails, the caller must leave
//! the generation record in `in_review` for a manual decision.

use std::path::Path;
use std::time::Duration;

use base64::Engine;
use serde_json::{json, Value};
use tracing::debug;

use crate::circuit::{BreakerSnapshot, CircuitBreaker};
use crate::error::{BackendError, BackendResult};
use crate::retry::RetryPolicy;

/// Default multimodal model for image review.
const VISION_MODEL: &str = "llava:13b";

pub struct VisionService {
    client: reqwest::Client,
    base_url: String,
    model: String,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    request_timeout: Duration,
}

impl VisionService {
    pub fn new(base_url: impl Into<String>) -> Self {
        VisionService {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            model: VISION_MODEL.to_string(),
            breaker: CircuitBreaker::new("vision"),
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(180),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Run a prompt, optionally against an image on disk. Returns the raw
    /// model response text; callers parse it (see
    /// `anzu_protocol::VisionReview`).
    pub async fn query(&self, prompt: &str, image_path: Option<&Path>) -> BackendResult<String> {
        if prompt.trim().is_empty() {
            return Err(BackendError::Validation("empty prompt".into()));
        }

        let images = match image_path {
            Some(path) => {
                let bytes = tokio::fs::read(path).await?;
                vec![base64::engine::general_purpose::STANDARD.encode(bytes)]
            }
            None => Vec::new(),
        };

        let body = json!({
            "model": self.model,
            "prompt": prompt,
            "images": images,
            "stream": false,
        });

        let body_ref = &body;
        self.breaker
            .call(|| async move {
                self.retry
                    .run("vision query", || async move { self.post(body_ref).await })
                    .await
            })
            .await
    }

    /// Loaded models and their VRAM, for the GPU status snapshot.
    pub async fn loaded_models(&self) -> BackendResult<Vec<Value>> {
        let url = format!("{}/api/ps", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await?;
        let payload: Value = response.json().await?;
        let models = payload
            .get("models")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(models
            .into_iter()
            .map(|m| {
                json!({
                    "name": m.get("name").and_then(Value::as_str).unwrap_or("unknown"),
                    "size_mb": m.get("size").and_then(Value::as_i64).unwrap_or(0) / (1024 * 1024),
                    "vram_mb": m.get("size_vram").and_then(Value::as_i64).unwrap_or(0) / (1024 * 1024),
                })
            })
            .collect())
    }

    pub fn breaker_snapshot(&self) -> BreakerSnapshot {
        self.breaker.snapshot()
    }

    async fn post(&self, body: &Value) -> BackendResult<String> {
        let url = format!("{}/api/generate", self.base_url);
        let response = self
            .client
            .post(&url)
            .timeout(self.request_timeout)
            .json(body)
            .send()
            .await?;

        let code = response.status().as_u16();
        if !response.status().is_success() {
            return Err(BackendError::Status {
                service: "vision".into(),
                code,
                body: response.text().await.unwrap_or_default(),
            });
        }

        let payload: Value = response.json().await?;
        let text = payload
            .get("response")
            .and_then(Value::as_str)
            .ok_or_else(|| BackendError::Validation("vision response missing 'response'".into()))?;
        debug!("Vision response: {} chars", text.len());
        Ok(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_prompt_rejected() {
        let svc = VisionService::new("http://127.0.0.1:1");
        let err = svc.query("", None).await.unwrap_err();
        assert!(matches!(err, BackendError::Validation(_)));
    }

    #[tokio::test]
    async fn test_missing_image_file_is_io_error() {
        let svc = VisionService::new("http://127.0.0.1:1");
        let err = svc
            .query("review this", Some(Path::new("/nonexistent/image.png")))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Io(_)));
    }
}
