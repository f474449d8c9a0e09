//! Per-phase workers.
//!
//! Every worker is idempotent and safe to re-dispatch: ticks re-invoke a
//! worker until its gate passes, so side-effects are keyed (upserts,
//! "next missing item" selection) rather than accumulated.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use anzu_backends::{build_image_workflow, build_video_workflow, render_negative, render_prompt};
use anzu_db::store::{episodes, generations, projects, scenes, storyline};
use anzu_db::store::generations::NewGeneration;
use anzu_db::{Decision, GenerationStyle};
use anzu_events::{
    EPISODE_ASSEMBLED, EPISODE_PUBLISHED, SCENE_PLANNING_COMPLETE, SCENE_READY, TRAINING_STARTED,
};
use anzu_learning::recommend_params;
use anzu_protocol::review::VisionReview;
use anzu_protocol::types::{GateCheck, GenerationKind, GpuTask, ModelTier, ReviewSource,
    REJECTION_CATEGORIES};

use crate::context::Director;
use crate::recommender::recommend_for_shots;

/// One generation request, SSOT-driven. Corrections carry their ancestry
/// and extra negatives.
#[derive(Debug, Clone, Default)]
pub(crate) struct GenerationJob {
    pub slug: String,
    pub project_id: i64,
    pub correction_of: Option<i64>,
    pub extra_negatives: String,
    pub seed: Option<i64>,
}

impl Director {
    // ── training_data ──────────────────────────────────────────────────

    pub(crate) async fn work_training_data(
        self: &Arc<Self>,
        slug: &str,
        project_id: i64,
        gate: &GateCheck,
    ) -> Result<()> {
        let job = GenerationJob {
            slug: slug.to_string(),
            project_id,
            ..GenerationJob::default()
        };
        let Some(generation_id) = self.generate_and_review(job).await? else {
            // Admission denied; the next tick retries.
            return Ok(());
        };

        let project_name = projects::project_name(&self.pool, project_id).await?;
        self.audit.record(
            Decision::new("orchestrator_training_data")
                .character(slug)
                .project(project_name.unwrap_or_default())
                .context(json!({
                    "gate": serde_json::to_value(gate)?,
                    "generation_id": generation_id,
                }))
                .made("generated_and_reviewed")
                .confidence(0.9)
                .reason(format!(
                    "Character needs {} more approved images",
                    gate.metrics.get("deficit").cloned().unwrap_or(json!("?"))
                )),
        );
        Ok(())
    }

    /// One generate-and-review cycle: build the workflow from the SSOT,
    /// submit, wait, record, review. Returns None when GPU admission was
    /// denied (a transient condition, not a failure).
    pub(crate) async fn generate_and_review(
        self: &Arc<Self>,
        job: GenerationJob,
    ) -> Result<Option<i64>> {
        let admission = self.gpu.ensure_ready(GpuTask::ImageGeneration).await;
        if !admission.admitted {
            info!(
                "Generation for {} deferred: {}",
                job.slug, admission.reason
            );
            return Ok(None);
        }

        let character = projects::get_character(&self.pool, job.project_id, &job.slug)
            .await?
            .ok_or_else(|| anyhow!("unknown character slug: {}", job.slug))?;
        let design_prompt = character
            .design_prompt
            .clone()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| anyhow!("character {} has an empty design prompt", job.slug))?;
        let project_name = projects::project_name(&self.pool, job.project_id)
            .await?
            .ok_or_else(|| anyhow!("unknown project id: {}", job.project_id))?;

        let mut style = match projects::default_style_for_project(&self.pool, job.project_id).await?
        {
            Some(style) => style,
            None => builtin_style(),
        };

        // Learned history refines the SSOT; the SSOT stays authoritative
        // for everything the history is silent on.
        let rec = recommend_params(
            &self.pool,
            &job.slug,
            Some(&project_name),
            Some(&style.checkpoint_model),
        )
        .await;
        if let Some(cfg) = rec.cfg_scale {
            style.cfg_scale = cfg;
        }
        if let Some(steps) = rec.steps {
            style.steps = steps;
        }

        let positive = render_prompt(&style.positive_template, &design_prompt);
        let mut learned = rec.learned_negatives.clone();
        if !job.extra_negatives.is_empty() {
            if !learned.is_empty() {
                learned.push_str(", ");
            }
            learned.push_str(&job.extra_negatives);
        }
        let negative = render_negative(&style.negative_template, &learned);
        let seed = job.seed.unwrap_or_else(derive_seed);

        let workflow = build_image_workflow(&style_params(&style), &positive, &negative, seed);
        let started = Instant::now();
        let backend_job_id = self.image_backend.submit(&workflow).await?;
        let outputs = self
            .image_backend
            .wait_for_completion(&backend_job_id, None)
            .await?;
        let output_path = outputs
            .first()
            .ok_or_else(|| anyhow!("backend produced no outputs"))?;

        let generation_id = generations::insert_generation(
            &self.pool,
            &NewGeneration {
                character_slug: Some(job.slug.clone()),
                project_name: Some(project_name.clone()),
                kind: GenerationKind::Image,
                backend_job_id: Some(backend_job_id),
                checkpoint_model: Some(style.checkpoint_model.clone()),
                cfg_scale: Some(style.cfg_scale),
                steps: Some(style.steps),
                sampler: Some(style.sampler.clone()),
                scheduler: Some(style.scheduler.clone()),
                width: Some(style.width),
                height: Some(style.height),
                seed: Some(seed),
                output_path: Some(output_path.to_string_lossy().into_owned()),
                solo: true,
                species_verified: false,
                correction_of: job.correction_of,
                generation_time_ms: Some(started.elapsed().as_millis() as i64),
            },
        )
        .await?;

        if let Err(e) = storyline::record_style_use(
            &self.pool,
            job.project_id,
            &style.name,
            Some(&style.checkpoint_model),
        )
        .await
        {
            warn!("Style history write failed (continuing): {:#}", e);
        }

        self.review_generation(generation_id, &design_prompt, output_path)
            .await;
        Ok(Some(generation_id))
    }

    /// Vision review of one output. Review failure is not a worker
    /// failure: the record is parked `in_review` for a manual decision.
    async fn review_generation(
        self: &Arc<Self>,
        generation_id: i64,
        design_prompt: &str,
        output_path: &std::path::Path,
    ) {
        let categories: Vec<&str> = REJECTION_CATEGORIES.iter().map(|c| c.as_str()).collect();
        let prompt = format!(
            "Review this generated anime character image against the design: \
             \"{}\". Reply with a JSON object: {{\"quality_score\": 0..1, \
             \"character_match_score\": 0..1, \"clarity_score\": 0..1, \
             \"training_value\": 0..1, \"solo\": bool, \"species_verified\": bool, \
             \"categories\": [zero or more of {:?}], \"feedback\": string}}.",
            design_prompt, categories
        );

        let review = match self.vision.query(&prompt, Some(output_path)).await {
            Ok(text) => VisionReview::from_response_text(&text),
            Err(e) => {
                warn!(
                    "Vision review unavailable for generation {}: {}",
                    generation_id, e
                );
                None
            }
        };

        match review {
            Some(review) => {
                if let Err(e) = anzu_learning::evaluate_review(
                    &self.pool,
                    &self.bus,
                    &self.audit,
                    generation_id,
                    &review,
                    ReviewSource::Vision,
                )
                .await
                {
                    warn!("Gate evaluation failed for {}: {:#}", generation_id, e);
                }
            }
            None => {
                if let Err(e) = generations::mark_in_review(&self.pool, generation_id).await {
                    warn!("Could not park {} for review: {:#}", generation_id, e);
                }
            }
        }
    }

    // ── lora_training ──────────────────────────────────────────────────

    pub(crate) async fn work_lora_training(
        self: &Arc<Self>,
        slug: &str,
        project_id: i64,
    ) -> Result<()> {
        let character = projects::get_character(&self.pool, project_id, slug)
            .await?
            .ok_or_else(|| anyhow!("unknown character slug: {}", slug))?;

        self.bus.emit(
            TRAINING_STARTED,
            json!({
                "character_slug": slug,
                "character_name": character.name,
            }),
        );

        let dataset_dir = self.config.media_root.join(slug).join("images");
        let job_ref = self
            .trainer
            .enqueue(&character, &dataset_dir)
            .await
            .context("enqueue LoRA training")?;

        self.audit.record(
            Decision::new("orchestrator_lora_training")
                .character(slug)
                .context(json!({ "character_name": character.name, "job_ref": job_ref }))
                .made("started_training")
                .confidence(0.9)
                .reason(format!(
                    "Character has {}+ approved images, starting LoRA training",
                    self.training_target()
                )),
        );
        Ok(())
    }

    // ── scene_planning ─────────────────────────────────────────────────

    pub(crate) async fn work_scene_planning(self: &Arc<Self>, project_id: i64) -> Result<()> {
        let project = projects::get_project(&self.pool, project_id)
            .await?
            .ok_or_else(|| anyhow!("unknown project id: {}", project_id))?;

        // Latest storyline revision wins; the project premise is the
        // fallback for projects that never versioned one.
        let context = match storyline::latest_storyline(&self.pool, project_id).await? {
            Some((_, content)) => content,
            None => project.premise.clone().unwrap_or_default(),
        };
        let prompt = format!(
            "Plan the opening scenes for an episodic {} series titled \"{}\". \
             Reply with a JSON array of scene objects: {{\"title\", \"description\", \
             \"location\", \"time_of_day\", \"mood\", \"suggested_shots\": \
             [{{\"shot_type\", \"description\", \"motion_prompt\", \
             \"duration_seconds\", \"characters_present\"}}]}}.",
            project.genre.as_deref().unwrap_or("anime"),
            project.name
        );

        let response = self
            .llm
            .query(&prompt, Some(&context), ModelTier::Advanced, "creative")
            .await
            .context("scene planning query")?;
        let plans = parse_scene_plans(&response.response)
            .ok_or_else(|| anyhow!("scene planner returned no parseable scene list"))?;
        if plans.is_empty() {
            bail!("scene planner returned an empty scene list");
        }

        for (i, plan) in plans.iter().enumerate() {
            let scene_id = scenes::insert_scene(
                &self.pool,
                project_id,
                (i + 1) as i64,
                plan.title.as_deref().unwrap_or(&format!("Scene {}", i + 1)),
                plan.description.as_deref(),
                plan.location.as_deref(),
                plan.time_of_day.as_deref(),
                plan.mood.as_deref(),
            )
            .await?;

            for (j, shot) in plan.suggested_shots.iter().enumerate() {
                let characters_json = serde_json::to_string(&shot.characters_present)?;
                scenes::insert_shot(
                    &self.pool,
                    scene_id,
                    (j + 1) as i64,
                    shot.shot_type.as_deref().unwrap_or("medium"),
                    None,
                    Some(&characters_json),
                    shot.description.as_deref(),
                    shot.motion_prompt.as_deref(),
                    shot.duration_seconds.unwrap_or(3.0),
                )
                .await?;
            }
        }

        self.bus.emit(
            SCENE_PLANNING_COMPLETE,
            json!({ "project_id": project_id, "scene_count": plans.len() }),
        );

        self.audit.record(
            Decision::new("orchestrator_scene_planning")
                .project(project.name)
                .context(json!({
                    "project_id": project_id,
                    "scene_count": plans.len(),
                    "model_used": response.model_used,
                    "fallback_used": response.fallback_used,
                }))
                .made("generated_scenes")
                .confidence(0.8)
                .reason("Generated scenes from storyline via LLM"),
        );
        Ok(())
    }

    // ── shot_preparation ───────────────────────────────────────────────

    pub(crate) async fn work_shot_preparation(self: &Arc<Self>, project_id: i64) -> Result<()> {
        let shots = scenes::shots_missing_source(&self.pool, project_id).await?;
        if shots.is_empty() {
            return Ok(());
        }

        let project_name = projects::project_name(&self.pool, project_id)
            .await?
            .ok_or_else(|| anyhow!("unknown project id: {}", project_id))?;
        let approved = generations::approved_images_for_project(&self.pool, &project_name).await?;
        if approved.is_empty() {
            warn!("No approved images for project {} yet", project_name);
            return Ok(());
        }

        let mut by_character: HashMap<String, Vec<_>> = HashMap::new();
        for image in approved {
            let slug = image.character_slug.clone().unwrap_or_default();
            by_character.entry(slug).or_default().push(image);
        }
        let total_images: usize = by_character.values().map(Vec::len).sum();

        let assignments = recommend_for_shots(&shots, &by_character);
        if assignments.is_empty() {
            warn!(
                "No image matched any of {} unassigned shots for {}",
                shots.len(),
                project_name
            );
            return Ok(());
        }

        let updates: Vec<(i64, String)> = assignments
            .iter()
            .map(|a| (a.shot_id, a.image_path.clone()))
            .collect();
        scenes::assign_shot_sources(&self.pool, &updates).await?;

        info!(
            "Smart-assigned source images to {}/{} shots (pool: {} images across {} characters)",
            assignments.len(),
            shots.len(),
            total_images,
            by_character.len()
        );

        self.audit.record(
            Decision::new("orchestrator_shot_prep")
                .project(&project_name)
                .context(json!({
                    "shots_needing_images": shots.len(),
                    "pool_images": total_images,
                    "characters": by_character.len(),
                    "assignments": serde_json::to_value(&assignments)?,
                }))
                .made("smart_assigned_source_images")
                .confidence(0.85)
                .reason(format!(
                    "Smart assignment: {}/{} shots via pose+quality+diversity scoring",
                    assignments.len(),
                    shots.len()
                )),
        );
        Ok(())
    }

    // ── video_generation ───────────────────────────────────────────────

    /// Renders one scene per invocation: all its shots in order, then the
    /// crossfaded scene video. One scene at a time across the whole
    /// process (GPU memory constraint).
    pub(crate) async fn work_video_generation(self: &Arc<Self>, project_id: i64) -> Result<()> {
        let Some(scene) = scenes::next_unrendered_scene(&self.pool, project_id).await? else {
            return Ok(());
        };

        let admission = self.gpu.ensure_ready(GpuTask::VideoGeneration).await;
        if !admission.admitted {
            info!(
                "Video generation for scene {} deferred: {}",
                scene.id, admission.reason
            );
            return Ok(());
        }

        let shots = scenes::shots_for_scene(&self.pool, scene.id).await?;
        if shots.is_empty() {
            bail!("scene {} has no shots", scene.id);
        }

        let mut shot_videos = Vec::new();
        for shot in &shots {
            if let Some(existing) = shot.output_video_path.clone() {
                shot_videos.push(PathBuf::from(existing));
                continue;
            }
            let source = shot.source_image_path.clone().ok_or_else(|| {
                anyhow!("shot {} has no source image assigned", shot.id)
            })?;

            let workflow = build_video_workflow(
                &source,
                shot.motion_prompt.as_deref().unwrap_or(""),
                shot.duration_seconds,
                derive_seed(),
            );
            let job_id = self.image_backend.submit(&workflow).await?;
            let outputs = self.image_backend.wait_for_completion(&job_id, None).await?;
            let video = outputs
                .first()
                .ok_or_else(|| anyhow!("shot {} render produced no output", shot.id))?;
            scenes::set_shot_video(
                &self.pool,
                shot.id,
                &video.to_string_lossy(),
                "completed",
            )
            .await?;
            shot_videos.push(video.clone());
        }

        let assembler = self
            .assembler
            .as_ref()
            .ok_or_else(|| anyhow!("no assembler command configured"))?;
        let scene_output = self
            .config
            .media_root
            .join("scenes")
            .join(format!("scene_{:03}.mp4", scene.scene_number));
        let final_path = assembler
            .assemble_scene(&shot_videos, &scene_output, 0.5)
            .await
            .context("scene assembly")?;
        scenes::set_scene_video(&self.pool, scene.id, &final_path.to_string_lossy()).await?;

        self.bus.emit(
            SCENE_READY,
            json!({ "project_id": project_id, "scene_id": scene.id }),
        );

        self.audit.record(
            Decision::new("orchestrator_video_gen")
                .context(json!({ "scene_id": scene.id, "shots": shots.len() }))
                .made("generated_scene_video")
                .confidence(0.8)
                .reason(format!(
                    "Rendered {} shots and assembled scene {}",
                    shots.len(),
                    scene.scene_number
                )),
        );
        Ok(())
    }

    // ── episode_assembly ───────────────────────────────────────────────

    pub(crate) async fn work_episode_assembly(self: &Arc<Self>, project_id: i64) -> Result<()> {
        // First run: create the episode from the assembled scenes.
        let (total, _, _) = episodes::episode_counts(&self.pool, project_id).await?;
        if total == 0 {
            let episode_id =
                episodes::create_episode(&self.pool, project_id, 1, "Episode 1").await?;
            for (position, scene) in scenes::scenes_for_project(&self.pool, project_id)
                .await?
                .iter()
                .enumerate()
            {
                episodes::link_scene(
                    &self.pool,
                    episode_id,
                    scene.id,
                    (position + 1) as i64,
                    Some("crossfade"),
                )
                .await?;
            }
        }

        let Some(episode) = episodes::next_unassembled_episode(&self.pool, project_id).await?
        else {
            return Ok(());
        };

        let linked = episodes::scene_videos_for_episode(&self.pool, episode.id).await?;
        let videos: Vec<PathBuf> = linked
            .iter()
            .filter_map(|(path, _)| path.as_deref().map(PathBuf::from))
            .collect();
        let transitions: Vec<Option<String>> =
            linked.iter().map(|(_, t)| t.clone()).collect();
        if videos.is_empty() {
            warn!("No scene videos linked to episode {}", episode.id);
            return Ok(());
        }

        let assembler = self
            .assembler
            .as_ref()
            .ok_or_else(|| anyhow!("no assembler command configured"))?;
        let output = self
            .config
            .media_root
            .join("episodes")
            .join(format!("episode_{:03}.mp4", episode.episode_number));
        let final_path = assembler
            .assemble_episode(&videos, &transitions, &output)
            .await
            .context("episode assembly")?;
        episodes::set_episode_video(&self.pool, episode.id, &final_path.to_string_lossy()).await?;

        self.bus.emit(
            EPISODE_ASSEMBLED,
            json!({
                "project_id": project_id,
                "episode_id": episode.id,
                "episode_number": episode.episode_number,
                "path": final_path.to_string_lossy(),
            }),
        );

        self.audit.record(
            Decision::new("orchestrator_episode_assembly")
                .context(json!({ "episode_id": episode.id, "scene_count": videos.len() }))
                .made("assembled_episode")
                .confidence(0.9)
                .reason(format!(
                    "Assembled episode {} from {} scenes",
                    episode.episode_number,
                    videos.len()
                )),
        );
        Ok(())
    }

    // ── publishing ─────────────────────────────────────────────────────

    pub(crate) async fn work_publishing(self: &Arc<Self>, project_id: i64) -> Result<()> {
        let Some(episode) = episodes::next_publishable_episode(&self.pool, project_id).await?
        else {
            return Ok(());
        };
        let project_name = projects::project_name(&self.pool, project_id)
            .await?
            .ok_or_else(|| anyhow!("unknown project id: {}", project_id))?;
        let video_path = episode
            .final_video_path
            .clone()
            .ok_or_else(|| anyhow!("episode {} has no assembled video", episode.id))?;

        let published_path = self
            .library
            .publish(
                &project_name,
                episode.episode_number,
                &episode.title,
                std::path::Path::new(&video_path),
                episode.thumbnail_path.as_deref().map(std::path::Path::new),
            )
            .await
            .context("publishing episode")?;
        episodes::mark_published(&self.pool, episode.id).await?;

        self.bus.emit(
            EPISODE_PUBLISHED,
            json!({
                "project_id": project_id,
                "episode_id": episode.id,
                "episode_number": episode.episode_number,
                "published_path": published_path.to_string_lossy(),
            }),
        );

        self.audit.record(
            Decision::new("orchestrator_publish")
                .project(&project_name)
                .context(json!({ "episode_number": episode.episode_number }))
                .made("published_episode")
                .confidence(0.9)
                .reason(format!(
                    "Published episode {} to the media library",
                    episode.episode_number
                )),
        );
        Ok(())
    }
}

// ── helpers ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ScenePlan {
    title: Option<String>,
    description: Option<String>,
    location: Option<String>,
    time_of_day: Option<String>,
    mood: Option<String>,
    #[serde(default)]
    suggested_shots: Vec<ShotPlan>,
}

#[derive(Debug, Deserialize)]
struct ShotPlan {
    shot_type: Option<String>,
    description: Option<String>,
    motion_prompt: Option<String>,
    duration_seconds: Option<f64>,
    #[serde(default)]
    characters_present: Vec<String>,
}

/// Extract the scene array out of a chatty model response.
fn parse_scene_plans(text: &str) -> Option<Vec<ScenePlan>> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

fn builtin_style() -> GenerationStyle {
    GenerationStyle {
        name: "builtin".to_string(),
        checkpoint_model: "animeCheckpoint_v1.safetensors".to_string(),
        cfg_scale: 7.0,
        steps: 28,
        sampler: "euler_a".to_string(),
        scheduler: "normal".to_string(),
        width: 768,
        height: 1024,
        positive_template: "masterpiece, best quality, {prompt}".to_string(),
        negative_template: "lowres, bad anatomy, watermark".to_string(),
        architecture: "sd15".to_string(),
        prompt_format: "tags".to_string(),
    }
}

fn style_params(style: &GenerationStyle) -> anzu_protocol::types::StyleParams {
    anzu_protocol::types::StyleParams {
        name: style.name.clone(),
        checkpoint_model: style.checkpoint_model.clone(),
        cfg_scale: style.cfg_scale,
        steps: style.steps,
        sampler: style.sampler.clone(),
        scheduler: style.scheduler.clone(),
        width: style.width,
        height: style.height,
        positive_template: style.positive_template.clone(),
        negative_template: style.negative_template.clone(),
        architecture: style.architecture.clone(),
        prompt_format: style.prompt_format.clone(),
    }
}

fn derive_seed() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| (d.as_nanos() % i64::MAX as u128) as i64)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anzu_db::store::scenes::{insert_scene, insert_shot, shot_counts};
    use anzu_protocol::AnzuConfig;
    use anzu_test_utils::{seed_project, test_pool, SeedGeneration};

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shot_preparation_assigns_distinct_best_images() {
        let pool = test_pool().await;
        let director = Director::with_pool(AnzuConfig::default(), pool.clone());
        let project_id = seed_project(&pool, "P1", "luigi").await.unwrap();
        projects::create_character(&pool, project_id, "peach", "Peach", Some("pink"), None, None)
            .await
            .unwrap();

        // Twelve approved images across the cast.
        for i in 0..8 {
            SeedGeneration::approved("luigi", "P1", 0.7 + (i as f64) * 0.02)
                .output(&format!("/m/luigi/images/{:02}.png", i))
                .insert(&pool)
                .await
                .unwrap();
        }
        for i in 0..4 {
            SeedGeneration::approved("peach", "P1", 0.8 + (i as f64) * 0.02)
                .output(&format!("/m/peach/images/{:02}.png", i))
                .insert(&pool)
                .await
                .unwrap();
        }

        let scene_id = insert_scene(&pool, project_id, 1, "Opening", None, None, None, None)
            .await
            .unwrap();
        for (number, (shot_type, cast)) in [
            ("medium", r#"["luigi"]"#),
            ("medium", r#"["luigi"]"#),
            ("close", r#"["peach"]"#),
            ("wide", r#"["luigi","peach"]"#),
        ]
        .into_iter()
        .enumerate()
        {
            insert_shot(
                &pool,
                scene_id,
                (number + 1) as i64,
                shot_type,
                None,
                Some(cast),
                Some("shot"),
                None,
                3.0,
            )
            .await
            .unwrap();
        }

        director.work_shot_preparation(project_id).await.unwrap();

        let (_, missing, _) = shot_counts(&pool, project_id).await.unwrap();
        assert_eq!(missing, 0, "every shot gets a source image");

        let assigned: Vec<(String, String)> = sqlx::query_as(
            "SELECT shot_type, source_image_path FROM shots ORDER BY shot_number",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        // The two medium shots had 8 candidates; they must differ.
        assert_ne!(assigned[0].1, assigned[1].1);
        assert!(assigned[2].1.contains("/peach/"));

        // Idempotent: a second run has nothing left to assign.
        director.work_shot_preparation(project_id).await.unwrap();
    }

    #[test]
    fn test_parse_scene_plans_from_chatty_response() {
        let text = r#"Sure! Here are the scenes:
        [
          {"title": "Cold Open", "description": "Rooftop chase", "mood": "tense",
           "suggested_shots": [
             {"shot_type": "wide", "description": "city skyline",
              "duration_seconds": 4, "characters_present": ["luigi"]}
           ]}
        ]
        Let me know if you want changes."#;
        let plans = parse_scene_plans(text).unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].title.as_deref(), Some("Cold Open"));
        assert_eq!(plans[0].suggested_shots.len(), 1);
        assert_eq!(
            plans[0].suggested_shots[0].characters_present,
            vec!["luigi"]
        );
    }

    #[test]
    fn test_parse_scene_plans_rejects_garbage() {
        assert!(parse_scene_plans("no list here").is_none());
        assert!(parse_scene_plans("] broken [").is_none());
    }

    #[test]
    fn test_derive_seed_positive() {
        assert!(derive_seed() > 0);
    }
}
