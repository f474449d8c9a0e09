//! Image-generation backend adapter (ComfyUI-shaped HTTP API).
//!
//! The workflow graph is an opaque JSON blob; this adapter only owns
//! parameter substitution into a fixed-shape template, submission, queue
//! polling, stuck-job detection and output collection.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use anzu_protocol::defaults::{
    DEFAULT_REQUEST_DEADLINE_SECS, POLL_INTERVAL_SECS, STUCK_AFTER_SECS,
};
use anzu_protocol::types::{BackendJobStatus, StyleParams};

use crate::circuit::{BreakerSnapshot, CircuitBreaker};
use crate::error::{BackendError, BackendResult};
use crate::retry::RetryPolicy;

/// Queue occupancy as reported by the backend.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct QueueCounts {
    pub running: usize,
    pub pending: usize,
}

pub struct ImageBackend {
    client: reqwest::Client,
    base_url: String,
    /// Root the backend writes outputs under; joined with the per-file
    /// subfolder/filename from history to produce absolute paths.
    output_root: PathBuf,
    client_id: String,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    poll_interval: Duration,
    stuck_after: Duration,
}

impl ImageBackend {
    pub fn new(base_url: impl Into<String>, output_root: impl Into<PathBuf>) -> Self {
        ImageBackend {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            output_root: output_root.into(),
            client_id: Uuid::new_v4().to_string(),
            breaker: CircuitBreaker::new("image_backend"),
            retry: RetryPolicy::default(),
            poll_interval: Duration::from_secs(POLL_INTERVAL_SECS),
            stuck_after: Duration::from_secs(STUCK_AFTER_SECS),
        }
    }

    /// POST the workflow graph; returns the backend job id.
    pub async fn submit(&self, workflow: &Value) -> BackendResult<String> {
        if !workflow.is_object() {
            return Err(BackendError::Validation(
                "workflow graph must be a JSON object".into(),
            ));
        }
        let body = json!({ "prompt": workflow, "client_id": self.client_id });
        let body_ref = &body;

        self.breaker
            .call(|| async move {
                let response = self
                    .retry
                    .run("image submit", || async move {
                        self.post_json("/prompt", body_ref).await
                    })
                    .await?;
                response
                    .get("prompt_id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| {
                        BackendError::Validation("submit response missing prompt_id".into())
                    })
            })
            .await
    }

    /// Current status of a job, from the queue and history endpoints.
    pub async fn poll_status(&self, job_id: &str) -> BackendResult<BackendJobStatus> {
        let queue = self.get_json("/queue").await?;
        if queue_contains(&queue, "queue_running", job_id) {
            return Ok(BackendJobStatus::Running);
        }
        if queue_contains(&queue, "queue_pending", job_id) {
            return Ok(BackendJobStatus::Queued);
        }

        let history = self.get_json(&format!("/history/{}", job_id)).await?;
        match history.get(job_id) {
            Some(entry) => {
                let completed = entry
                    .pointer("/status/completed")
                    .and_then(Value::as_bool)
                    .unwrap_or_else(|| entry.get("outputs").is_some());
                if completed {
                    Ok(BackendJobStatus::Completed)
                } else {
                    Ok(BackendJobStatus::Failed)
                }
            }
            // Not queued, not in history: the backend dropped it.
            None => Ok(BackendJobStatus::Failed),
        }
    }

    /// Absolute paths of the files a completed job produced.
    pub async fn fetch_outputs(&self, job_id: &str) -> BackendResult<Vec<PathBuf>> {
        let history = self.get_json(&format!("/history/{}", job_id)).await?;
        let entry = history
            .get(job_id)
            .ok_or_else(|| BackendError::MissingOutput {
                job_id: job_id.to_string(),
            })?;

        let paths = collect_output_paths(entry, &self.output_root);
        if paths.is_empty() {
            return Err(BackendError::MissingOutput {
                job_id: job_id.to_string(),
            });
        }
        Ok(paths)
    }

    /// Ask the backend to unload cached models from VRAM.
    pub async fn free_memory(&self) -> BackendResult<()> {
        let body = json!({ "unload_models": true, "free_memory": true });
        self.post_json("/free", &body).await?;
        info!("Image backend instructed to free VRAM");
        Ok(())
    }

    /// True if any job is running or queued.
    pub async fn is_busy(&self) -> BackendResult<bool> {
        let counts = self.queue_counts().await?;
        Ok(counts.running > 0 || counts.pending > 0)
    }

    pub async fn queue_counts(&self) -> BackendResult<QueueCounts> {
        let queue = self.get_json("/queue").await?;
        Ok(QueueCounts {
            running: queue
                .get("queue_running")
                .and_then(Value::as_array)
                .map(Vec::len)
                .unwrap_or(0),
            pending: queue
                .get("queue_pending")
                .and_then(Value::as_array)
                .map(Vec::len)
                .unwrap_or(0),
        })
    }

    /// Poll until the job completes, fails, stalls, or the deadline passes.
    ///
    /// A job that is not queued and reports no status change for the stuck
    /// window is declared stuck and surfaced as an integrity failure.
    pub async fn wait_for_completion(
        &self,
        job_id: &str,
        deadline: Option<Duration>,
    ) -> BackendResult<Vec<PathBuf>> {
        let deadline = deadline.unwrap_or(Duration::from_secs(DEFAULT_REQUEST_DEADLINE_SECS));
        let started = Instant::now();
        let mut last_status = BackendJobStatus::Queued;
        let mut last_change = Instant::now();

        loop {
            if started.elapsed() > deadline {
                return Err(BackendError::DeadlineExceeded {
                    seconds: deadline.as_secs(),
                });
            }

            let status = self
                .retry
                .run("image poll", || async move { self.poll_status(job_id).await })
                .await?;

            if status != last_status {
                debug!("Job {}: {} -> {}", job_id, last_status, status);
                last_status = status;
                last_change = Instant::now();
            }

            match status {
                BackendJobStatus::Completed => return self.fetch_outputs(job_id).await,
                BackendJobStatus::Failed => {
                    return Err(BackendError::MissingOutput {
                        job_id: job_id.to_string(),
                    })
                }
                BackendJobStatus::Queued => {}
                BackendJobStatus::Running => {
                    if last_change.elapsed() > self.stuck_after {
                        warn!(
                            "Job {} stuck: running with no progress for {:?}",
                            job_id,
                            last_change.elapsed()
                        );
                        return Err(BackendError::StuckJob {
                            job_id: job_id.to_string(),
                            stalled_secs: last_change.elapsed().as_secs(),
                        });
                    }
                }
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    pub fn breaker_snapshot(&self) -> BreakerSnapshot {
        self.breaker.snapshot()
    }

    async fn get_json(&self, path: &str) -> BackendResult<Value> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.get(&url).send().await?;
        check_status("image_backend", &response)?;
        Ok(response.json().await?)
    }

    async fn post_json(&self, path: &str, body: &Value) -> BackendResult<Value> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.post(&url).json(body).send().await?;
        check_status("image_backend", &response)?;
        Ok(response.json().await.unwrap_or(Value::Null))
    }
}

fn check_status(service: &str, response: &reqwest::Response) -> BackendResult<()> {
    let code = response.status().as_u16();
    if response.status().is_success() {
        Ok(())
    } else {
        Err(BackendError::Status {
            service: service.to_string(),
            code,
            body: response
                .status()
                .canonical_reason()
                .unwrap_or("")
                .to_string(),
        })
    }
}

/// Walk a history entry's node outputs and resolve every produced file to
/// an absolute path under the backend's output root.
fn collect_output_paths(entry: &Value, output_root: &Path) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    let Some(outputs) = entry.get("outputs").and_then(Value::as_object) else {
        return paths;
    };
    for node_output in outputs.values() {
        for key in ["images", "gifs", "videos"] {
            let Some(files) = node_output.get(key).and_then(Value::as_array) else {
                continue;
            };
            for file in files {
                let Some(filename) = file.get("filename").and_then(Value::as_str) else {
                    continue;
                };
                let subfolder = file.get("subfolder").and_then(Value::as_str).unwrap_or("");
                let mut path = output_root.to_path_buf();
                if !subfolder.is_empty() {
                    path.push(subfolder);
                }
                path.push(filename);
                paths.push(path);
            }
        }
    }
    paths
}

/// Does a queue array (`[[number, prompt_id, ...], ...]`) mention the job?
fn queue_contains(queue: &Value, key: &str, job_id: &str) -> bool {
    queue
        .get(key)
        .and_then(Value::as_array)
        .map(|entries| {
            entries.iter().any(|entry| match entry {
                Value::Array(fields) => fields.iter().any(|f| f.as_str() == Some(job_id)),
                Value::String(s) => s == job_id,
                _ => false,
            })
        })
        .unwrap_or(false)
}

/// Substitute SSOT parameters into the fixed-shape text-to-image workflow.
///
/// The graph layout itself is owned by the backend; the core only fills in
/// the style tuple, prompts and seed.
pub fn build_image_workflow(
    style: &StyleParams,
    positive_prompt: &str,
    negative_prompt: &str,
    seed: i64,
) -> Value {
    json!({
        "3": {
            "class_type": "KSampler",
            "inputs": {
                "cfg": style.cfg_scale,
                "steps": style.steps,
                "sampler_name": style.sampler,
                "scheduler": style.scheduler,
                "seed": seed,
                "denoise": 1.0,
                "model": ["4", 0],
                "positive": ["6", 0],
                "negative": ["7", 0],
                "latent_image": ["5", 0]
            }
        },
        "4": {
            "class_type": "CheckpointLoaderSimple",
            "inputs": { "ckpt_name": style.checkpoint_model }
        },
        "5": {
            "class_type": "EmptyLatentImage",
            "inputs": { "width": style.width, "height": style.height, "batch_size": 1 }
        },
        "6": {
            "class_type": "CLIPTextEncode",
            "inputs": { "text": positive_prompt, "clip": ["4", 1] }
        },
        "7": {
            "class_type": "CLIPTextEncode",
            "inputs": { "text": negative_prompt, "clip": ["4", 1] }
        },
        "8": {
            "class_type": "VAEDecode",
            "inputs": { "samples": ["3", 0], "vae": ["4", 2] }
        },
        "9": {
            "class_type": "SaveImage",
            "inputs": { "images": ["8", 0], "filename_prefix": "anzu" }
        }
    })
}

/// Substitute parameters into the fixed-shape image-to-video workflow used
/// for shot rendering.
pub fn build_video_workflow(
    source_image_path: &str,
    motion_prompt: &str,
    duration_seconds: f64,
    seed: i64,
) -> Value {
    let frames = (duration_seconds * 24.0).round().max(1.0) as i64;
    json!({
        "1": {
            "class_type": "LoadImage",
            "inputs": { "image": source_image_path }
        },
        "2": {
            "class_type": "ImageToVideoSampler",
            "inputs": {
                "image": ["1", 0],
                "motion_prompt": motion_prompt,
                "frames": frames,
                "fps": 24,
                "seed": seed
            }
        },
        "3": {
            "class_type": "SaveVideo",
            "inputs": { "frames": ["2", 0], "filename_prefix": "anzu_shot" }
        }
    })
}

/// Render the positive prompt from the style template and the character's
/// design prompt. `{prompt}` in the template marks the insertion point; a
/// template without the marker gets the prompt appended.
pub fn render_prompt(template: &str, design_prompt: &str) -> String {
    if template.is_empty() {
        return design_prompt.to_string();
    }
    if template.contains("{prompt}") {
        template.replace("{prompt}", design_prompt)
    } else if design_prompt.is_empty() {
        template.to_string()
    } else {
        format!("{}, {}", template, design_prompt)
    }
}

/// Join the style's negative template with learned additions.
pub fn render_negative(template: &str, learned_negatives: &str) -> String {
    match (template.is_empty(), learned_negatives.is_empty()) {
        (true, true) => String::new(),
        (false, true) => template.to_string(),
        (true, false) => learned_negatives.to_string(),
        (false, false) => format!("{}, {}", template, learned_negatives),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn style() -> StyleParams {
        StyleParams {
            name: "cel".into(),
            checkpoint_model: "animeCheckpoint_v1.safetensors".into(),
            cfg_scale: 7.0,
            steps: 28,
            sampler: "euler_a".into(),
            scheduler: "normal".into(),
            width: 768,
            height: 1024,
            positive_template: "masterpiece, {prompt}".into(),
            negative_template: "lowres, bad anatomy".into(),
            architecture: "sd15".into(),
            prompt_format: "tags".into(),
        }
    }

    #[test]
    fn test_workflow_substitution() {
        let wf = build_image_workflow(&style(), "green plumber", "lowres", 42);
        assert_eq!(wf["3"]["inputs"]["cfg"], 7.0);
        assert_eq!(wf["3"]["inputs"]["seed"], 42);
        assert_eq!(wf["4"]["inputs"]["ckpt_name"], "animeCheckpoint_v1.safetensors");
        assert_eq!(wf["6"]["inputs"]["text"], "green plumber");
        assert_eq!(wf["7"]["inputs"]["text"], "lowres");
    }

    #[test]
    fn test_render_prompt_marker_and_append() {
        assert_eq!(
            render_prompt("masterpiece, {prompt}", "green plumber"),
            "masterpiece, green plumber"
        );
        assert_eq!(
            render_prompt("masterpiece", "green plumber"),
            "masterpiece, green plumber"
        );
        assert_eq!(render_prompt("", "green plumber"), "green plumber");
    }

    #[test]
    fn test_render_negative_joins() {
        assert_eq!(render_negative("lowres", "extra fingers"), "lowres, extra fingers");
        assert_eq!(render_negative("lowres", ""), "lowres");
        assert_eq!(render_negative("", ""), "");
    }

    #[test]
    fn test_collect_output_paths_resolves_subfolders() {
        let entry = json!({
            "outputs": {
                "9": {
                    "images": [
                        { "filename": "anzu_00001.png", "subfolder": "", "type": "output" },
                        { "filename": "anzu_00002.png", "subfolder": "luigi", "type": "output" }
                    ]
                },
                "3": {
                    "videos": [
                        { "filename": "shot.mp4", "subfolder": "shots" }
                    ]
                }
            }
        });
        let mut paths = collect_output_paths(&entry, Path::new("/out"));
        paths.sort();
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/out/anzu_00001.png"),
                PathBuf::from("/out/luigi/anzu_00002.png"),
                PathBuf::from("/out/shots/shot.mp4"),
            ]
        );
    }

    #[test]
    fn test_collect_output_paths_empty_for_failed_job() {
        let entry = json!({ "status": { "completed": false } });
        assert!(collect_output_paths(&entry, Path::new("/out")).is_empty());
    }

    #[test]
    fn test_queue_contains_matches_nested_ids() {
        let queue = json!({
            "queue_running": [[0, "job-a", {}]],
            "queue_pending": [[1, "job-b", {}]]
        });
        assert!(queue_contains(&queue, "queue_running", "job-a"));
        assert!(queue_contains(&queue, "queue_pending", "job-b"));
        assert!(!queue_contains(&queue, "queue_running", "job-c"));
    }
}
