//! Tick-driven pipeline scheduler.
//!
//! Advances characters through `training_data -> lora_training -> ready`
//! and projects through `scene_planning -> ... -> publishing`, gated on
//! stored state. The tick loop never fails: every per-row error is caught,
//! logged and retried on the next pass.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use anzu_db::store::{generations, pipeline, projects, scenes};
use anzu_db::store::episodes;
use anzu_db::{Decision, PipelineRow};
use anzu_events::{IMAGE_APPROVED, PIPELINE_PHASE_ADVANCED, TRAINING_COMPLETE};
use anzu_protocol::defaults::{BLOCKED_ON_CHARACTERS, MAX_REASON_LEN};
use anzu_protocol::error::truncate_reason;
use anzu_protocol::types::{EntityType, GateCheck, OverrideAction, Phase, PipelineStatus};
use anzu_protocol::ErrorEnvelope;

use crate::context::Director;

impl Director {
    // ── Enable / configure ─────────────────────────────────────────────

    pub fn enable(&self, on: bool) {
        self.enabled.store(on, Ordering::SeqCst);
        info!("Orchestrator {}", if on { "enabled" } else { "disabled" });
    }

    pub fn training_target(&self) -> i64 {
        self.training_target.load(Ordering::SeqCst)
    }

    /// Zero is a valid target: the training gate then passes immediately.
    pub fn set_training_target(&self, target: i64) {
        self.training_target.store(target.max(0), Ordering::SeqCst);
        info!("Orchestrator training target set to {}", target.max(0));
    }

    // ── Admission ──────────────────────────────────────────────────────

    /// Bootstrap pipeline rows for a project: one `training_data` row per
    /// character plus the project's `scene_planning` row. Later phases are
    /// created only by phase advancement, which enforces sequentiality.
    /// Idempotent.
    pub async fn initialize_project(
        &self,
        project_id: i64,
        training_target: Option<i64>,
    ) -> Result<Value> {
        if let Some(target) = training_target {
            self.set_training_target(target);
        }

        let project = projects::get_project(&self.pool, project_id)
            .await?
            .ok_or_else(|| {
                ErrorEnvelope::validation(format!("unknown project id: {}", project_id))
            })?;

        let characters = projects::admissible_characters(&self.pool, project_id).await?;
        if characters.is_empty() {
            return Err(ErrorEnvelope::validation(format!(
                "project {} has no characters with a design prompt",
                project.name
            ))
            .into());
        }

        for character in &characters {
            pipeline::upsert_row(
                &self.pool,
                EntityType::Character,
                &character.slug,
                project_id,
                Phase::TrainingData,
            )
            .await?;
        }
        pipeline::upsert_row(
            &self.pool,
            EntityType::Project,
            &project_id.to_string(),
            project_id,
            Phase::ScenePlanning,
        )
        .await?;

        let entries_created = characters.len() + 1;
        self.audit.record(
            Decision::new("orchestrator_init")
                .project(&project.name)
                .context(json!({
                    "project_id": project_id,
                    "characters": characters.len(),
                    "entries_created": entries_created,
                    "training_target": self.training_target(),
                }))
                .made("initialized_pipeline")
                .confidence(1.0)
                .reason(format!(
                    "Bootstrapped pipeline: {} characters (first phase) + 1 project phase",
                    characters.len()
                )),
        );

        Ok(json!({
            "project_id": project_id,
            "characters": characters.len(),
            "entries_created": entries_created,
            "training_target": self.training_target(),
        }))
    }

    // ── Tick loop ──────────────────────────────────────────────────────

    pub(crate) fn spawn_tick_loop(self: &Arc<Self>) {
        let director = Arc::clone(self);
        let mut shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            info!(
                "Orchestrator tick loop started (interval={:?}, enabled={})",
                director.tick_interval,
                director.is_enabled()
            );
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(director.tick_interval) => {}
                    _ = shutdown.changed() => {}
                }
                if *shutdown.borrow() {
                    info!("Orchestrator tick loop exiting");
                    return;
                }
                if director.is_enabled() {
                    if let Err(e) = director.tick().await {
                        error!("Orchestrator tick error: {:#}", e);
                    }
                }
            }
        });
    }

    /// Single evaluation pass over all non-terminal pipeline rows.
    pub async fn tick(self: &Arc<Self>) -> Result<Value> {
        if !self.is_enabled() {
            return Ok(json!({ "skipped": true, "reason": "orchestrator disabled" }));
        }

        let rows = pipeline::open_rows(&self.pool).await?;
        let mut evaluated = 0;
        for row in rows {
            if let Err(e) = self.evaluate_entry(&row).await {
                // One bad row must not stop the pass.
                error!(
                    "Evaluation failed for {} (continuing): {:#}",
                    row.work_key(),
                    e
                );
            }
            evaluated += 1;
        }

        Ok(json!({
            "evaluated": evaluated,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }))
    }

    async fn evaluate_entry(self: &Arc<Self>, row: &PipelineRow) -> Result<()> {
        let entity_type: EntityType = row.entity_type().map_err(anyhow::Error::msg)?;
        let phase: Phase = row.phase().map_err(anyhow::Error::msg)?;
        let mut status: PipelineStatus = row.status().map_err(anyhow::Error::msg)?;

        // Project phases block until every character is ready.
        if entity_type == EntityType::Project {
            let characters_ready =
                pipeline::all_characters_ready(&self.pool, row.project_id).await?;
            if !characters_ready {
                if status != PipelineStatus::Blocked {
                    pipeline::set_blocked(&self.pool, row.id, BLOCKED_ON_CHARACTERS).await?;
                }
                return Ok(());
            }
            if status == PipelineStatus::Blocked {
                pipeline::clear_blocked(&self.pool, row.id).await?;
                status = PipelineStatus::Pending;
            }
        }

        let gate = self
            .check_gate(entity_type, &row.entity_id, row.project_id, phase)
            .await?;
        pipeline::record_gate_check(&self.pool, row.id, &serde_json::to_string(&gate)?).await?;

        if gate.passed {
            self.advance_phase(row).await?;
        } else if gate.action_needed {
            if status != PipelineStatus::Active {
                pipeline::set_active(&self.pool, row.id).await?;
            }
            self.dispatch_work(row, phase, gate).await;
        }
        Ok(())
    }

    // ── Gate predicates ────────────────────────────────────────────────

    pub(crate) async fn check_gate(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        project_id: i64,
        phase: Phase,
    ) -> Result<GateCheck> {
        match (entity_type, phase) {
            (EntityType::Character, Phase::TrainingData) => {
                let target = self.training_target();
                let approved = generations::approved_count(&self.pool, entity_id).await?;
                let mut gate = if approved >= target {
                    GateCheck::passed()
                } else {
                    GateCheck::needs_action()
                };
                gate = gate
                    .with_metric("approved", approved)
                    .with_metric("target", target)
                    .with_metric("deficit", (target - approved).max(0));
                Ok(gate)
            }
            (EntityType::Character, Phase::LoraTraining) => {
                // Both the SD1.5 and SDXL filename conventions count.
                let sd15 = self.config.lora_dir.join(format!("{}_lora.safetensors", entity_id));
                let sdxl = self
                    .config
                    .lora_dir
                    .join(format!("{}_xl_lora.safetensors", entity_id));
                let exists = sd15.exists() || sdxl.exists();
                let gate = if exists {
                    GateCheck::passed()
                } else {
                    GateCheck::needs_action()
                };
                Ok(gate.with_metric("lora_exists", exists).with_metric(
                    "checked_paths",
                    json!([sd15.display().to_string(), sdxl.display().to_string()]),
                ))
            }
            (EntityType::Character, Phase::Ready) => Ok(GateCheck::passed()),

            (EntityType::Project, Phase::ScenePlanning) => {
                let count = scenes::scene_count(&self.pool, project_id).await?;
                let gate = if count > 0 {
                    GateCheck::passed()
                } else {
                    GateCheck::needs_action()
                };
                Ok(gate.with_metric("scene_count", count))
            }
            (EntityType::Project, Phase::ShotPreparation) => {
                let (total, missing, _) = scenes::shot_counts(&self.pool, project_id).await?;
                let gate = if total > 0 && missing == 0 {
                    GateCheck::passed()
                } else if missing > 0 {
                    GateCheck::needs_action()
                } else {
                    GateCheck::waiting()
                };
                Ok(gate
                    .with_metric("total_shots", total)
                    .with_metric("missing_source_image", missing))
            }
            (EntityType::Project, Phase::VideoGeneration) => {
                let (total, _, completed) = scenes::shot_counts(&self.pool, project_id).await?;
                let gate = if total > 0 && completed >= total {
                    GateCheck::passed()
                } else if completed < total {
                    GateCheck::needs_action()
                } else {
                    GateCheck::waiting()
                };
                Ok(gate
                    .with_metric("total_shots", total)
                    .with_metric("completed_shots", completed))
            }
            (EntityType::Project, Phase::SceneAssembly) => {
                let (total, assembled) =
                    scenes::scene_assembly_counts(&self.pool, project_id).await?;
                let gate = if total > 0 && assembled >= total {
                    GateCheck::passed()
                } else if assembled < total {
                    GateCheck::needs_action()
                } else {
                    GateCheck::waiting()
                };
                Ok(gate
                    .with_metric("total_scenes", total)
                    .with_metric("assembled_scenes", assembled))
            }
            (EntityType::Project, Phase::EpisodeAssembly) => {
                let (total, assembled, _) = episodes::episode_counts(&self.pool, project_id).await?;
                // Zero episodes needs action too: the worker creates the
                // first episode from the assembled scenes.
                let gate = if total > 0 && assembled >= total {
                    GateCheck::passed()
                } else {
                    GateCheck::needs_action()
                };
                Ok(gate
                    .with_metric("total_episodes", total)
                    .with_metric("assembled_episodes", assembled))
            }
            (EntityType::Project, Phase::Publishing) => {
                let (total, _, published) =
                    episodes::episode_counts(&self.pool, project_id).await?;
                let gate = if total > 0 && published >= total {
                    GateCheck::passed()
                } else if total > 0 && published < total {
                    GateCheck::needs_action()
                } else {
                    GateCheck::waiting()
                };
                Ok(gate
                    .with_metric("total_episodes", total)
                    .with_metric("published_episodes", published))
            }
            (entity_type, phase) => Err(ErrorEnvelope::validation(format!(
                "phase {} is not valid for entity type {}",
                phase, entity_type
            ))
            .into()),
        }
    }

    // ── Phase advancement ──────────────────────────────────────────────

    /// Mark the row completed and create the next phase row. Running this
    /// twice on the same row is a no-op the second time.
    pub async fn advance_phase(&self, row: &PipelineRow) -> Result<()> {
        let freshly_completed = pipeline::complete_row(&self.pool, row.id).await?;
        if !freshly_completed {
            return Ok(());
        }

        let phase: Phase = row.phase().map_err(anyhow::Error::msg)?;
        let entity_type: EntityType = row.entity_type().map_err(anyhow::Error::msg)?;
        let next_phase = phase.next();

        if let Some(next) = next_phase {
            pipeline::upsert_row(&self.pool, entity_type, &row.entity_id, row.project_id, next)
                .await?;
        }

        // Leaving lora_training means the trained model landed on disk.
        if phase == Phase::LoraTraining {
            self.bus.emit(
                TRAINING_COMPLETE,
                json!({
                    "character_slug": row.entity_id,
                    "project_id": row.project_id,
                }),
            );
        }

        self.bus.emit(
            PIPELINE_PHASE_ADVANCED,
            json!({
                "entity_type": row.entity_type,
                "entity_id": row.entity_id,
                "project_id": row.project_id,
                "completed_phase": phase.as_str(),
                "next_phase": next_phase.map(|p| p.as_str()),
            }),
        );

        info!(
            "{}:{} advanced from {} -> {}",
            row.entity_type,
            row.entity_id,
            phase,
            next_phase.map(|p| p.as_str()).unwrap_or("DONE")
        );
        Ok(())
    }

    // ── Work dispatch ──────────────────────────────────────────────────

    /// Spawn the phase worker unless one is already running for this key.
    async fn dispatch_work(self: &Arc<Self>, row: &PipelineRow, phase: Phase, gate: GateCheck) {
        let key = row.work_key();
        let mut active = self.active_work.lock().await;
        if let Some(handle) = active.get(&key) {
            if !handle.is_finished() {
                return;
            }
        }

        let director = Arc::clone(self);
        let entity_id = row.entity_id.clone();
        let project_id = row.project_id;
        let entity_type = match row.entity_type() {
            Ok(t) => t,
            Err(e) => {
                warn!("Cannot dispatch work for {}: {}", key, e);
                return;
            }
        };

        let handle = tokio::spawn(async move {
            director
                .do_work(entity_type, entity_id, project_id, phase, gate)
                .await;
        });
        active.insert(key, handle);
    }

    async fn do_work(
        self: Arc<Self>,
        entity_type: EntityType,
        entity_id: String,
        project_id: i64,
        phase: Phase,
        gate: GateCheck,
    ) {
        if !self.is_enabled() {
            info!(
                "Orchestrator disabled, skipping work for {}:{} phase={}",
                entity_type, entity_id, phase
            );
            return;
        }

        let result = match phase {
            Phase::TrainingData => self.work_training_data(&entity_id, project_id, &gate).await,
            Phase::LoraTraining => self.work_lora_training(&entity_id, project_id).await,
            Phase::ScenePlanning => self.work_scene_planning(project_id).await,
            Phase::ShotPreparation => self.work_shot_preparation(project_id).await,
            Phase::VideoGeneration => self.work_video_generation(project_id).await,
            Phase::EpisodeAssembly => self.work_episode_assembly(project_id).await,
            Phase::Publishing => self.work_publishing(project_id).await,
            Phase::Ready | Phase::SceneAssembly => Ok(()),
        };

        if let Err(e) = result {
            error!(
                "Worker failed: {}:{} phase={}: {:#}",
                entity_type, entity_id, phase, e
            );
            let reason = truncate_reason(&format!("{:#}", e), MAX_REASON_LEN);
            if let Err(db_err) =
                pipeline::fail_row(&self.pool, entity_type, &entity_id, phase, &reason).await
            {
                error!("Could not mark row failed: {:#}", db_err);
            }
        }
    }

    // ── Manual override ────────────────────────────────────────────────

    pub async fn override_phase(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        phase: Phase,
        action: OverrideAction,
    ) -> Result<Value> {
        let row = pipeline::get_row(&self.pool, entity_type, entity_id, phase)
            .await?
            .ok_or_else(|| {
                ErrorEnvelope::validation(format!(
                    "no pipeline entry: {}:{}:{}",
                    entity_type, entity_id, phase
                ))
            })?;

        match action {
            OverrideAction::Skip => pipeline::skip_row(&self.pool, row.id).await?,
            OverrideAction::Reset => pipeline::reset_row(&self.pool, row.id).await?,
            OverrideAction::Complete => self.advance_phase(&row).await?,
        }

        self.audit.record(
            Decision::new("orchestrator_override")
                .context(json!({
                    "entity_type": entity_type.as_str(),
                    "entity_id": entity_id,
                    "phase": phase.as_str(),
                    "action": action.as_str(),
                }))
                .made(format!("manual_{}", action.as_str()))
                .confidence(1.0)
                .reason(format!(
                    "Manual override: {} on {}:{}:{}",
                    action.as_str(),
                    entity_type,
                    entity_id,
                    phase
                )),
        );

        Ok(json!({
            "entity_type": entity_type.as_str(),
            "entity_id": entity_id,
            "phase": phase.as_str(),
            "action": action.as_str(),
        }))
    }

    // ── Status / summary ───────────────────────────────────────────────

    /// Structured pipeline snapshot for a project, grouped by entity.
    pub async fn pipeline_status(&self, project_id: i64) -> Result<Value> {
        let rows = pipeline::rows_for_project(&self.pool, project_id).await?;
        let project_name = projects::project_name(&self.pool, project_id).await?;

        let total = rows.len();
        let mut completed = 0;
        let mut active = 0;
        let mut failed = 0;
        let mut characters: serde_json::Map<String, Value> = serde_json::Map::new();
        let mut project_phases: serde_json::Map<String, Value> = serde_json::Map::new();

        for row in &rows {
            match row.status.as_str() {
                "completed" => completed += 1,
                "active" => active += 1,
                "failed" => failed += 1,
                _ => {}
            }

            let mut entry = serde_json::to_value(row).context("serializing pipeline row")?;
            // Persisted gate JSON is parsed back for the dashboard.
            if let Some(raw) = row.gate_check_result.as_deref() {
                if let Ok(parsed) = serde_json::from_str::<Value>(raw) {
                    entry["gate_check_result"] = parsed;
                }
            }

            if row.entity_type == "character" {
                characters
                    .entry(row.entity_id.clone())
                    .or_insert_with(|| Value::Array(Vec::new()))
                    .as_array_mut()
                    .map(|list| list.push(entry));
            } else {
                project_phases.insert(row.phase.clone(), entry);
            }
        }

        let percent = if total > 0 {
            (completed as f64 / total as f64 * 1000.0).round() / 10.0
        } else {
            0.0
        };

        Ok(json!({
            "project_id": project_id,
            "project_name": project_name,
            "enabled": self.is_enabled(),
            "training_target": self.training_target(),
            "progress": {
                "total_phases": total,
                "completed": completed,
                "active": active,
                "failed": failed,
                "percent": percent,
            },
            "characters": characters,
            "project_phases": project_phases,
        }))
    }

    /// Human-readable multi-line summary, used for LLM context injection.
    pub async fn pipeline_summary(&self, project_id: i64) -> Result<String> {
        let status = self.pipeline_status(project_id).await?;
        let mut lines = Vec::new();

        let project_label = status["project_name"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| format!("Project {}", project_id));
        lines.push(format!("Production Pipeline: {}", project_label));
        lines.push(format!(
            "Overall: {}/{} phases complete ({}%)",
            status["progress"]["completed"],
            status["progress"]["total_phases"],
            status["progress"]["percent"]
        ));
        if status["progress"]["failed"].as_i64().unwrap_or(0) > 0 {
            lines.push(format!(
                "ALERT: {} phase(s) FAILED",
                status["progress"]["failed"]
            ));
        }
        lines.push(String::new());

        lines.push("Characters:".to_string());
        if let Some(characters) = status["characters"].as_object() {
            for (slug, phases) in characters {
                let current = phases
                    .as_array()
                    .and_then(|list| {
                        list.iter()
                            .find(|p| {
                                matches!(
                                    p["status"].as_str(),
                                    Some("pending") | Some("active") | Some("blocked")
                                )
                            })
                            .or_else(|| list.last())
                    })
                    .cloned();
                match current {
                    Some(entry) => lines.push(format!(
                        "  {}: {} ({})",
                        slug,
                        entry["phase"].as_str().unwrap_or("?"),
                        entry["status"].as_str().unwrap_or("?")
                    )),
                    None => lines.push(format!("  {}: all complete", slug)),
                }
            }
        }
        lines.push(String::new());

        lines.push("Project Phases:".to_string());
        for phase in Phase::sequence(EntityType::Project) {
            match status["project_phases"].get(phase.as_str()) {
                Some(entry) => {
                    let mut detail = entry["status"].as_str().unwrap_or("?").to_string();
                    if let Some(reason) = entry["blocked_reason"].as_str() {
                        detail.push_str(" - ");
                        detail.push_str(reason);
                    }
                    lines.push(format!("  {}: {}", phase, detail));
                }
                None => lines.push(format!("  {}: not started", phase)),
            }
        }

        Ok(lines.join("\n"))
    }

    // ── Bus handlers ───────────────────────────────────────────────────

    /// IMAGE_APPROVED keeps the training-data progress counters fresh;
    /// PIPELINE_PHASE_ADVANCED records an audit decision.
    pub fn register_orchestrator_handlers(self: &Arc<Self>) {
        let director = Arc::clone(self);
        self.bus.subscribe(IMAGE_APPROVED, move |payload| {
            let director = Arc::clone(&director);
            async move {
                let Some(slug) = payload.get("character_slug").and_then(Value::as_str) else {
                    return Ok(());
                };
                let approved = generations::approved_count(&director.pool, slug).await?;
                pipeline::set_progress(
                    &director.pool,
                    EntityType::Character,
                    slug,
                    Phase::TrainingData,
                    approved,
                    director.training_target(),
                )
                .await?;
                Ok(())
            }
        });

        let director = Arc::clone(self);
        self.bus.subscribe(PIPELINE_PHASE_ADVANCED, move |payload| {
            let director = Arc::clone(&director);
            async move {
                director.audit.record(
                    Decision::new("orchestrator_phase_advanced")
                        .project(
                            payload
                                .get("project_id")
                                .map(|v| v.to_string())
                                .unwrap_or_default(),
                        )
                        .context(payload.clone())
                        .made("phase_advanced")
                        .confidence(1.0)
                        .reason(format!(
                            "{}:{} completed {} -> {}",
                            payload.get("entity_type").and_then(Value::as_str).unwrap_or("?"),
                            payload.get("entity_id").and_then(Value::as_str).unwrap_or("?"),
                            payload
                                .get("completed_phase")
                                .and_then(Value::as_str)
                                .unwrap_or("?"),
                            payload
                                .get("next_phase")
                                .and_then(Value::as_str)
                                .unwrap_or("DONE"),
                        )),
                );
                Ok(())
            }
        });
    }
}
