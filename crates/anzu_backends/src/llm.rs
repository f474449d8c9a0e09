//! LLM/dialogue adapter with tiered model selection, a content-hashed
//! response cache and an optional local-inference fallback.
//!
//! Model selection keeps a rolling window of the last 100 calls per model
//! and scores `success_rate * 0.7 + (1 / (avg_secs + 1)) * 0.3`. Models
//! under 70% success over at least 3 calls are excluded from selection.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use anzu_protocol::defaults::{
    DEFAULT_LLM_CACHE_TTL_SECS, MODEL_MIN_CALLS, MODEL_MIN_SUCCESS_RATE, MODEL_STATS_WINDOW,
};
use anzu_protocol::types::ModelTier;

use crate::circuit::{BreakerSnapshot, CircuitBreaker};
use crate::error::{BackendError, BackendResult};
use crate::retry::RetryPolicy;

/// Model used when routing to the local fallback endpoint.
const FALLBACK_MODEL: &str = "llama3.2:3b";

#[derive(Debug, Clone, Serialize)]
pub struct LlmResponse {
    pub response: String,
    pub model_used: String,
    pub confidence: f64,
    pub fallback_used: bool,
    pub cached: bool,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    /// Local inference endpoint used when the primary fails; None disables
    /// fallback.
    pub fallback_url: Option<String>,
    pub cache_ttl: Duration,
    pub request_timeout: Duration,
    /// Preferred models per tier, best-first.
    pub tier_models: HashMap<ModelTier, Vec<String>>,
}

impl LlmConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut tier_models = HashMap::new();
        tier_models.insert(
            ModelTier::Fast,
            vec!["mistral:7b".to_string(), "llama3.2:3b".to_string()],
        );
        tier_models.insert(
            ModelTier::Standard,
            vec!["qwen2.5:14b".to_string(), "mistral:7b".to_string()],
        );
        tier_models.insert(
            ModelTier::Advanced,
            vec!["qwen2.5:32b".to_string(), "qwen2.5:14b".to_string()],
        );
        LlmConfig {
            base_url: base_url.into(),
            fallback_url: None,
            cache_ttl: Duration::from_secs(DEFAULT_LLM_CACHE_TTL_SECS),
            request_timeout: Duration::from_secs(120),
            tier_models,
        }
    }

    pub fn with_fallback(mut self, url: impl Into<String>) -> Self {
        self.fallback_url = Some(url.into());
        self
    }
}

/// One observed call: success flag and elapsed seconds.
#[derive(Debug, Clone, Copy)]
struct Observation {
    success: bool,
    elapsed_secs: f64,
}

#[derive(Debug, Default)]
struct ModelStats {
    window: VecDeque<Observation>,
}

impl ModelStats {
    fn record(&mut self, success: bool, elapsed_secs: f64) {
        self.window.push_back(Observation {
            success,
            elapsed_secs,
        });
        while self.window.len() > MODEL_STATS_WINDOW {
            self.window.pop_front();
        }
    }

    fn calls(&self) -> usize {
        self.window.len()
    }

    fn success_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 1.0;
        }
        let ok = self.window.iter().filter(|o| o.success).count();
        ok as f64 / self.window.len() as f64
    }

    fn avg_time_secs(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().map(|o| o.elapsed_secs).sum::<f64>() / self.window.len() as f64
    }

    fn score(&self) -> f64 {
        self.success_rate() * 0.7 + (1.0 / (self.avg_time_secs() + 1.0)) * 0.3
    }
}

struct CacheEntry {
    response: LlmResponse,
    stored_at: Instant,
}

pub struct LlmService {
    client: reqwest::Client,
    config: LlmConfig,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    stats: Mutex<HashMap<String, ModelStats>>,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl LlmService {
    pub fn new(config: LlmConfig) -> Self {
        LlmService {
            client: reqwest::Client::new(),
            config,
            breaker: CircuitBreaker::new("llm"),
            retry: RetryPolicy::default(),
            stats: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Query the dialogue service.
    ///
    /// `intelligence_level` is an opaque caller hint forwarded to the
    /// service and mixed into the cache key.
    pub async fn query(
        &self,
        prompt: &str,
        context: Option<&str>,
        tier: ModelTier,
        intelligence_level: &str,
    ) -> BackendResult<LlmResponse> {
        if prompt.trim().is_empty() {
            return Err(BackendError::Validation("empty prompt".into()));
        }

        let cache_key = cache_key(prompt, context, intelligence_level);
        if let Some(hit) = self.cache_get(&cache_key) {
            debug!("LLM cache hit for {}", &cache_key[..12]);
            return Ok(hit);
        }

        let model = self.select_model(tier);
        let model_ref = model.as_str();
        let started = Instant::now();
        let primary = self
            .breaker
            .call(|| async move {
                self.retry
                    .run("llm query", || async move {
                        self.query_primary(model_ref, prompt, context, intelligence_level)
                            .await
                    })
                    .await
            })
            .await;
        let elapsed = started.elapsed().as_secs_f64();

        match primary {
            Ok(mut response) => {
                self.record_stats(&model, true, elapsed);
                response.model_used = model;
                self.cache_put(cache_key, &response);
                Ok(response)
            }
            Err(primary_err) => {
                self.record_stats(&model, false, elapsed);
                let Some(fallback_url) = self.config.fallback_url.clone() else {
                    return Err(primary_err);
                };
                warn!(
                    "Primary LLM failed ({}), routing to local fallback",
                    primary_err
                );
                let response = self.query_fallback(&fallback_url, prompt, context).await?;
                self.cache_put(cache_key, &response);
                Ok(response)
            }
        }
    }

    /// Pick the healthiest model for a tier.
    pub fn select_model(&self, tier: ModelTier) -> String {
        let candidates = self
            .config
            .tier_models
            .get(&tier)
            .cloned()
            .unwrap_or_default();
        let stats = self
            .stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut best: Option<(f64, &String)> = None;
        for model in &candidates {
            let model_stats = stats.get(model);
            let (calls, rate, score) = match model_stats {
                Some(s) => (s.calls(), s.success_rate(), s.score()),
                // Unobserved model: neutral score so it gets tried.
                None => (0, 1.0, 1.0),
            };
            if calls >= MODEL_MIN_CALLS && rate < MODEL_MIN_SUCCESS_RATE {
                debug!(
                    "Excluding {} from selection ({}% success over {} calls)",
                    model,
                    (rate * 100.0).round(),
                    calls
                );
                continue;
            }
            if best.map(|(s, _)| score > s).unwrap_or(true) {
                best = Some((score, model));
            }
        }

        best.map(|(_, m)| m.clone())
            .or_else(|| candidates.first().cloned())
            .unwrap_or_else(|| FALLBACK_MODEL.to_string())
    }

    pub fn breaker_snapshot(&self) -> BreakerSnapshot {
        self.breaker.snapshot()
    }

    /// Per-model rolling metrics for the operator surface.
    pub fn model_metrics(&self) -> HashMap<String, Value> {
        let stats = self
            .stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        stats
            .iter()
            .map(|(model, s)| {
                (
                    model.clone(),
                    json!({
                        "calls": s.calls(),
                        "success_rate": s.success_rate(),
                        "avg_time_secs": s.avg_time_secs(),
                        "score": s.score(),
                    }),
                )
            })
            .collect()
    }

    fn record_stats(&self, model: &str, success: bool, elapsed_secs: f64) {
        let mut stats = self
            .stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        stats
            .entry(model.to_string())
            .or_default()
            .record(success, elapsed_secs);
    }

    async fn query_primary(
        &self,
        model: &str,
        prompt: &str,
        context: Option<&str>,
        intelligence_level: &str,
    ) -> BackendResult<LlmResponse> {
        let body = json!({
            "model": model,
            "prompt": prompt,
            "context": context,
            "intelligence_level": intelligence_level,
            "stream": false,
        });
        let url = format!("{}/query", self.config.base_url);
        let response = self
            .client
            .post(&url)
            .timeout(self.config.request_timeout)
            .json(&body)
            .send()
            .await?;

        let code = response.status().as_u16();
        if !response.status().is_success() {
            return Err(BackendError::Status {
                service: "llm".into(),
                code,
                body: response.text().await.unwrap_or_default(),
            });
        }

        let payload: Value = response.json().await?;
        let text = payload
            .get("response")
            .and_then(Value::as_str)
            .ok_or_else(|| BackendError::Validation("llm response missing 'response'".into()))?;
        Ok(LlmResponse {
            response: text.to_string(),
            model_used: model.to_string(),
            confidence: payload
                .get("confidence")
                .and_then(Value::as_f64)
                .unwrap_or(0.8),
            fallback_used: false,
            cached: false,
        })
    }

    async fn query_fallback(
        &self,
        fallback_url: &str,
        prompt: &str,
        context: Option<&str>,
    ) -> BackendResult<LlmResponse> {
        let full_prompt = match context {
            Some(ctx) if !ctx.is_empty() => format!("{}\n\n{}", ctx, prompt),
            _ => prompt.to_string(),
        };
        let body = json!({
            "model": FALLBACK_MODEL,
            "prompt": full_prompt,
            "stream": false,
        });
        let url = format!("{}/api/generate", fallback_url);
        let response = self
            .client
            .post(&url)
            .timeout(self.config.request_timeout)
            .json(&body)
            .send()
            .await?;

        let code = response.status().as_u16();
        if !response.status().is_success() {
            return Err(BackendError::Status {
                service: "llm_fallback".into(),
                code,
                body: response.text().await.unwrap_or_default(),
            });
        }

        let payload: Value = response.json().await?;
        let text = payload
            .get("response")
            .and_then(Value::as_str)
            .unwrap_or_default();
        info!("LLM fallback answered via {}", FALLBACK_MODEL);
        Ok(LlmResponse {
            response: text.to_string(),
            model_used: FALLBACK_MODEL.to_string(),
            confidence: 0.5,
            fallback_used: true,
            cached: false,
        })
    }

    fn cache_get(&self, key: &str) -> Option<LlmResponse> {
        let mut cache = self
            .cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match cache.get(key) {
            Some(entry) if entry.stored_at.elapsed() < self.config.cache_ttl => {
                let mut response = entry.response.clone();
                response.cached = true;
                Some(response)
            }
            Some(_) => {
                cache.remove(key);
                None
            }
            None => None,
        }
    }

    fn cache_put(&self, key: String, response: &LlmResponse) {
        let mut cache = self
            .cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        cache.insert(
            key,
            CacheEntry {
                response: response.clone(),
                stored_at: Instant::now(),
            },
        );
    }
}

/// Content hash of `prompt|context|intelligence_level`.
fn cache_key(prompt: &str, context: Option<&str>, intelligence_level: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(b"|");
    hasher.update(context.unwrap_or("").as_bytes());
    hasher.update(b"|");
    hasher.update(intelligence_level.as_bytes());
    hex::encode(hasher.finalize())
}
