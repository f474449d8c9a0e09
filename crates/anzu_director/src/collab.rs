//! External collaborator seams.
//!
//! Video assembly, media-library publishing and LoRA training are outside
//! the core: each is a capability trait with table-selected variants, so
//! the orchestrator never cares which implementation is wired in.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde_json::json;
use tokio::process::Command;
use tracing::{info, warn};

use anzu_db::Character;

/// Crossfades shot videos into a scene, concatenates scenes into an
/// episode.
#[async_trait::async_trait]
pub trait VideoAssembler: Send + Sync {
    async fn assemble_scene(
        &self,
        shot_videos: &[PathBuf],
        output: &Path,
        crossfade_seconds: f64,
    ) -> Result<PathBuf>;

    async fn assemble_episode(
        &self,
        scene_videos: &[PathBuf],
        transitions: &[Option<String>],
        output: &Path,
    ) -> Result<PathBuf>;
}

/// Publishes an assembled episode into the media library.
#[async_trait::async_trait]
pub trait MediaLibrary: Send + Sync {
    async fn publish(
        &self,
        project_name: &str,
        episode_number: i64,
        episode_title: &str,
        video_path: &Path,
        thumbnail_path: Option<&Path>,
    ) -> Result<PathBuf>;
}

/// Enqueues a LoRA training job for a character.
#[async_trait::async_trait]
pub trait LoraTrainer: Send + Sync {
    async fn enqueue(&self, character: &Character, approved_dir: &Path) -> Result<String>;
}

// ── Default variants ───────────────────────────────────────────────────

/// Shells out to an operator-configured assembler command. The command
/// receives an input list file and the output path; its argument layout is
/// owned by the operator, not the core.
pub struct CommandAssembler {
    command: String,
}

impl CommandAssembler {
    pub fn new(command: impl Into<String>) -> Self {
        CommandAssembler {
            command: command.into(),
        }
    }

    async fn run(&self, list_path: &Path, output: &Path, mode: &str) -> Result<()> {
        let status = Command::new(&self.command)
            .arg(mode)
            .arg(list_path)
            .arg(output)
            .status()
            .await
            .with_context(|| format!("failed to launch assembler '{}'", self.command))?;
        if !status.success() {
            bail!("assembler exited with {}", status);
        }
        Ok(())
    }

    async fn write_list(&self, output: &Path, inputs: &[PathBuf]) -> Result<PathBuf> {
        let list_path = output.with_extension("inputs.txt");
        let mut contents = String::new();
        for input in inputs {
            contents.push_str(&input.to_string_lossy());
            contents.push('\n');
        }
        tokio::fs::write(&list_path, contents).await?;
        Ok(list_path)
    }
}

#[async_trait::async_trait]
impl VideoAssembler for CommandAssembler {
    async fn assemble_scene(
        &self,
        shot_videos: &[PathBuf],
        output: &Path,
        _crossfade_seconds: f64,
    ) -> Result<PathBuf> {
        if shot_videos.is_empty() {
            bail!("no shot videos to assemble");
        }
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let list = self.write_list(output, shot_videos).await?;
        self.run(&list, output, "crossfade").await?;
        Ok(output.to_path_buf())
    }

    async fn assemble_episode(
        &self,
        scene_videos: &[PathBuf],
        _transitions: &[Option<String>],
        output: &Path,
    ) -> Result<PathBuf> {
        if scene_videos.is_empty() {
            bail!("no scene videos to assemble");
        }
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let list = self.write_list(output, scene_videos).await?;
        self.run(&list, output, "concat").await?;
        Ok(output.to_path_buf())
    }
}

/// Jellyfin-shaped library: copies the episode into the library's series
/// directory convention and pokes the refresh endpoint. Publishing is a
/// no-op without an API key.
pub struct JellyfinLibrary {
    library_root: PathBuf,
    api_key: Option<String>,
    base_url: Option<String>,
    client: reqwest::Client,
}

impl JellyfinLibrary {
    pub fn new(library_root: PathBuf, api_key: Option<String>, base_url: Option<String>) -> Self {
        JellyfinLibrary {
            library_root,
            api_key,
            base_url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl MediaLibrary for JellyfinLibrary {
    async fn publish(
        &self,
        project_name: &str,
        episode_number: i64,
        episode_title: &str,
        video_path: &Path,
        thumbnail_path: Option<&Path>,
    ) -> Result<PathBuf> {
        let Some(api_key) = self.api_key.as_deref() else {
            info!("No media-library API key configured; publish is a no-op");
            return Ok(video_path.to_path_buf());
        };

        let season_dir = self.library_root.join(project_name).join("Season 01");
        tokio::fs::create_dir_all(&season_dir).await?;

        let extension = video_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("mp4");
        let file_name = format!(
            "{} - S01E{:02} - {}.{}",
            project_name, episode_number, episode_title, extension
        );
        let target = season_dir.join(&file_name);
        tokio::fs::copy(video_path, &target)
            .await
            .with_context(|| format!("copying episode into library at {}", target.display()))?;

        if let Some(thumb) = thumbnail_path {
            let thumb_target = target.with_extension("jpg");
            if let Err(e) = tokio::fs::copy(thumb, &thumb_target).await {
                warn!("Thumbnail copy failed (continuing): {}", e);
            }
        }

        if let Some(base_url) = self.base_url.as_deref() {
            let url = format!("{}/Library/Refresh", base_url);
            let result = self
                .client
                .post(&url)
                .header("X-Emby-Token", api_key)
                .send()
                .await;
            if let Err(e) = result {
                warn!("Library refresh request failed (continuing): {}", e);
            }
        }

        info!("Published {} to {}", episode_title, target.display());
        Ok(target)
    }
}

/// HTTP trainer: posts a training job to a configured endpoint.
pub struct HttpTrainer {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpTrainer {
    pub fn new(endpoint: impl Into<String>) -> Self {
        HttpTrainer {
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl LoraTrainer for HttpTrainer {
    async fn enqueue(&self, character: &Character, approved_dir: &Path) -> Result<String> {
        let body = json!({
            "character_name": character.name,
            "character_slug": character.slug,
            "dataset_dir": approved_dir,
        });
        let response = self
            .client
            .post(format!("{}/train", self.endpoint))
            .json(&body)
            .send()
            .await
            .context("trainer endpoint unreachable")?;
        if !response.status().is_success() {
            bail!("trainer returned {}", response.status());
        }
        let payload: serde_json::Value = response.json().await.unwrap_or_default();
        let job_ref = payload
            .get("job_id")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("queued")
            .to_string();
        info!("LoRA training enqueued for {}: {}", character.slug, job_ref);
        Ok(job_ref)
    }
}

/// Trainer used when no endpoint is configured: reports the job as queued
/// so the gate (which watches the LoRA directory) drives progression.
pub struct NullTrainer;

#[async_trait::async_trait]
impl LoraTrainer for NullTrainer {
    async fn enqueue(&self, character: &Character, _approved_dir: &Path) -> Result<String> {
        warn!(
            "No trainer endpoint configured; training for {} must be started externally",
            character.slug
        );
        Ok("external".to_string())
    }
}
