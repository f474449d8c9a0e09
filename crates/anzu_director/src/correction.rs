//! Auto-correction.
//!
//! Subscribes to IMAGE_REJECTED and proposes a corrected regeneration:
//! same base prompt and recommended parameters, negative prompt augmented
//! from the rejection categories, seed offset deterministically so the
//! output differs. Corrections of corrections stop at the depth limit.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Result;
use serde_json::{json, Value};
use tracing::{info, warn};

use anzu_db::store::generations;
use anzu_db::Decision;
use anzu_events::IMAGE_REJECTED;
use anzu_protocol::defaults::{CORRECTION_DEPTH_LIMIT, CORRECTION_SEED_OFFSET};
use anzu_protocol::types::RejectionCategory;

use crate::context::Director;
use crate::workers::GenerationJob;

impl Director {
    pub fn correction_enabled(&self) -> bool {
        self.correction_enabled.load(Ordering::SeqCst)
    }

    pub fn enable_correction(&self, on: bool) {
        self.correction_enabled.store(on, Ordering::SeqCst);
        info!("Auto-correction {}", if on { "enabled" } else { "disabled" });
    }

    /// Correction success metrics, straight from the store: a correction
    /// succeeded when the corrected record reached `approved`.
    pub async fn correction_stats(&self) -> Result<Value> {
        let (attempts, succeeded): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*),
                COUNT(*) FILTER (WHERE status = 'approved')
            FROM generation_history
            WHERE correction_of IS NOT NULL
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let success_rate = if attempts > 0 {
            (succeeded as f64 / attempts as f64 * 100.0).round() / 100.0
        } else {
            0.0
        };
        Ok(json!({
            "enabled": self.correction_enabled(),
            "attempts": attempts,
            "succeeded": succeeded,
            "success_rate": success_rate,
            "depth_limit": CORRECTION_DEPTH_LIMIT,
        }))
    }

    pub(crate) fn register_correction_handlers(self: &Arc<Self>) {
        let director = Arc::clone(self);
        self.bus.subscribe(IMAGE_REJECTED, move |payload| {
            let director = Arc::clone(&director);
            async move {
                director.handle_rejection(payload).await;
                Ok(())
            }
        });
    }

    async fn handle_rejection(self: &Arc<Self>, payload: Value) {
        if !self.correction_enabled() {
            return;
        }
        let Some(generation_id) = payload.get("generation_id").and_then(Value::as_i64) else {
            return;
        };
        if let Err(e) = self.correct_rejection(generation_id, &payload).await {
            warn!("Auto-correction failed for {}: {:#}", generation_id, e);
        }
    }

    async fn correct_rejection(self: &Arc<Self>, generation_id: i64, payload: &Value) -> Result<()> {
        let Some(rejected) = generations::get_generation(&self.pool, generation_id).await? else {
            return Ok(());
        };
        let Some(slug) = rejected.character_slug.clone() else {
            return Ok(());
        };

        // Depth limit: never correct a correction chain past the cap.
        let depth = generations::correction_depth(&self.pool, generation_id).await?;
        if depth >= CORRECTION_DEPTH_LIMIT {
            info!(
                "Not correcting {}: correction depth {} at limit",
                generation_id, depth
            );
            self.audit.record(
                Decision::new("correction_depth_limit")
                    .character(&slug)
                    .context(json!({ "generation_id": generation_id, "depth": depth }))
                    .made("skipped")
                    .confidence(1.0)
                    .reason("Correction chain reached the depth limit"),
            );
            return Ok(());
        }

        // Map this rejection's categories into extra negative terms.
        let categories: Vec<RejectionCategory> = payload
            .get("categories")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .filter_map(|s| s.parse().ok())
                    .collect()
            })
            .unwrap_or_default();
        let extra_negatives = anzu_learning::join_negatives(&categories);

        let project_id = match rejected.project_name.as_deref() {
            Some(name) => match anzu_db::store::projects::get_project_by_name(&self.pool, name)
                .await?
            {
                Some(project) => project.id,
                None => return Ok(()),
            },
            None => return Ok(()),
        };

        let seed = rejected
            .seed
            .map(|s| s.wrapping_add(CORRECTION_SEED_OFFSET));
        let job = GenerationJob {
            slug: slug.clone(),
            project_id,
            correction_of: Some(generation_id),
            extra_negatives: extra_negatives.clone(),
            seed,
        };

        self.audit.record(
            Decision::new("regeneration")
                .character(&slug)
                .context(json!({
                    "correction_of": generation_id,
                    "depth": depth,
                    "categories": payload.get("categories").cloned().unwrap_or(json!([])),
                    "extra_negatives": extra_negatives,
                }))
                .made("corrected_generation")
                .confidence(0.7)
                .reason(format!(
                    "Rejection at depth {}; regenerating with augmented negatives",
                    depth
                )),
        );

        match self.generate_and_review(job).await {
            Ok(Some(corrected_id)) => {
                info!(
                    "Correction {} dispatched for rejected {}",
                    corrected_id, generation_id
                );
            }
            Ok(None) => info!("Correction for {} deferred (backend busy)", generation_id),
            Err(e) => warn!("Correction generation failed: {:#}", e),
        }
        Ok(())
    }
}
