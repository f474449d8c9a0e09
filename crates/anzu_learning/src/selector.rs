//! Parameter recommendation from learned data.
//!
//! Combines project-level SSOT with history: the caller decides whether to
//! apply any of this; the SSOT stays authoritative.

use anyhow::Result;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::warn;

use anzu_db::DbPool;
use anzu_protocol::defaults::{MIN_CONFIDENCE_SAMPLES, NEGATIVE_MIN_FREQUENCY, QUALITY_FLOOR};
use anzu_protocol::types::Confidence;

use crate::learning::{median_f64, median_i64, round1, round3};
use crate::negatives::negatives_for;

/// Recommendation for one character, possibly empty of parameters when the
/// history is thin.
#[derive(Debug, Clone, Serialize)]
pub struct Recommendation {
    pub confidence: Confidence,
    pub sample_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_quality: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cfg_scale: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steps: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampler: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<Value>,
    pub learned_negatives: String,
}

impl Recommendation {
    fn thin(sample_count: i64, learned_negatives: String) -> Self {
        Recommendation {
            confidence: Confidence::None,
            sample_count,
            avg_quality: None,
            cfg_scale: None,
            steps: None,
            sampler: None,
            scheduler: None,
            checkpoint: None,
            learned_negatives,
        }
    }
}

/// Recommend optimal generation parameters for a character.
///
/// When `checkpoint_model` is given, history is filtered to that model so a
/// checkpoint switch does not inherit another model's parameter sweet spot.
/// Never raises; a thin recommendation with confidence `none` is the error
/// shape.
pub async fn recommend_params(
    pool: &DbPool,
    character_slug: &str,
    project_name: Option<&str>,
    checkpoint_model: Option<&str>,
) -> Recommendation {
    match recommend_params_inner(pool, character_slug, project_name, checkpoint_model).await {
        Ok(rec) => rec,
        Err(e) => {
            warn!("recommend_params failed for {}: {}", character_slug, e);
            Recommendation::thin(0, String::new())
        }
    }
}

async fn recommend_params_inner(
    pool: &DbPool,
    character_slug: &str,
    project_name: Option<&str>,
    checkpoint_model: Option<&str>,
) -> Result<Recommendation> {
    // Successful samples for this character, optionally pinned to one
    // checkpoint to prevent cross-model contamination.
    let mut query = String::from(
        r#"
        SELECT cfg_scale, steps, sampler, scheduler, quality_score
        FROM generation_history
        WHERE character_slug = ?
          AND quality_score >= ?
          AND quality_score IS NOT NULL
          AND cfg_scale IS NOT NULL
        "#,
    );
    if checkpoint_model.is_some() {
        query.push_str(" AND checkpoint_model = ?");
    }

    let mut q = sqlx::query_as::<_, (Option<f64>, Option<i64>, Option<String>, Option<String>, f64)>(
        &query,
    )
    .bind(character_slug)
    .bind(QUALITY_FLOOR);
    if let Some(ckpt) = checkpoint_model {
        q = q.bind(ckpt);
    }
    let samples = q.fetch_all(pool).await?;

    let sample_count = samples.len() as i64;
    let negatives = learned_negatives(pool, character_slug).await?;

    if sample_count < MIN_CONFIDENCE_SAMPLES {
        return Ok(Recommendation::thin(sample_count, negatives));
    }

    let confidence = Confidence::from_sample_count(sample_count, MIN_CONFIDENCE_SAMPLES);
    let avg_quality = samples.iter().map(|s| s.4).sum::<f64>() / sample_count as f64;

    // Best checkpoint for the project, compared across all models.
    let checkpoint = match project_name {
        Some(project) => {
            let row: Option<(String, f64, i64)> = sqlx::query_as(
                r#"
                SELECT checkpoint_model, AVG(quality_score) as avg_q, COUNT(*) as n
                FROM generation_history
                WHERE project_name = ?
                  AND quality_score >= ?
                  AND quality_score IS NOT NULL
                  AND checkpoint_model IS NOT NULL
                GROUP BY checkpoint_model
                HAVING COUNT(*) >= 3
                ORDER BY avg_q DESC
                LIMIT 1
                "#,
            )
            .bind(project)
            .bind(QUALITY_FLOOR)
            .fetch_optional(pool)
            .await?;

            row.map(|(model, avg_q, n)| {
                let mut rec = json!({
                    "model": model,
                    "avg_quality": round3(avg_q),
                    "sample_count": n,
                });
                if let Some(current) = checkpoint_model {
                    if current != model {
                        rec["note"] = json!(format!(
                            "Current model ({}) differs from best ({})",
                            current, model
                        ));
                    }
                }
                rec
            })
        }
        None => None,
    };

    Ok(Recommendation {
        confidence,
        sample_count,
        avg_quality: Some(round3(avg_quality)),
        cfg_scale: median_f64(samples.iter().filter_map(|s| s.0)).map(round1),
        steps: median_i64(samples.iter().filter_map(|s| s.1)),
        sampler: mode(samples.iter().filter_map(|s| s.2.clone())),
        scheduler: mode(samples.iter().filter_map(|s| s.3.clone())),
        checkpoint,
        learned_negatives: negatives,
    })
}

/// Negative-prompt additions from the character's rejection categories:
/// any category seen at least twice contributes its mapped terms.
pub async fn learned_negatives(pool: &DbPool, character_slug: &str) -> Result<String> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        r#"
        SELECT rc.category, COUNT(*) as freq
        FROM rejection_categories rc
        JOIN rejections r ON rc.rejection_id = r.id
        WHERE r.character_slug = ?
        GROUP BY rc.category
        ORDER BY freq DESC
        LIMIT 10
        "#,
    )
    .bind(character_slug)
    .fetch_all(pool)
    .await?;

    let terms: Vec<&str> = rows
        .iter()
        .filter(|(_, freq)| *freq >= NEGATIVE_MIN_FREQUENCY)
        .filter_map(|(category, _)| category.parse().ok().map(negatives_for))
        .collect();
    Ok(terms.join(", "))
}

/// Per-character quality summary for a project, for dashboards and gates.
pub async fn character_quality_summary(pool: &DbPool, project_name: &str) -> Vec<Value> {
    let result: Result<Vec<CharacterSummaryRow>> = async {
        Ok(sqlx::query_as(
            r#"
            SELECT
                character_slug,
                COUNT(*) as total,
                COUNT(*) FILTER (WHERE status = 'approved') as approved,
                COUNT(*) FILTER (WHERE status = 'rejected') as rejected,
                AVG(quality_score) FILTER (WHERE quality_score IS NOT NULL) as avg_quality,
                MAX(quality_score) as best_quality,
                MIN(quality_score) FILTER (WHERE quality_score IS NOT NULL) as worst_quality,
                MAX(generated_at) as last_generated
            FROM generation_history
            WHERE project_name = ?
              AND character_slug IS NOT NULL
            GROUP BY character_slug
            ORDER BY avg_quality DESC
            "#,
        )
        .bind(project_name)
        .fetch_all(pool)
        .await?)
    }
    .await;

    match result {
        Ok(rows) => rows
            .into_iter()
            .map(|r| {
                let approval_rate = if r.total > 0 {
                    (r.approved as f64 / r.total as f64 * 100.0).round() / 100.0
                } else {
                    0.0
                };
                json!({
                    "character_slug": r.character_slug,
                    "total": r.total,
                    "approved": r.approved,
                    "rejected": r.rejected,
                    "avg_quality": r.avg_quality.map(round3),
                    "best_quality": r.best_quality.map(round3),
                    "worst_quality": r.worst_quality.map(round3),
                    "approval_rate": approval_rate,
                    "last_generated": r.last_generated,
                })
            })
            .collect(),
        Err(e) => {
            warn!("Character quality summary failed: {}", e);
            Vec::new()
        }
    }
}

#[derive(sqlx::FromRow)]
struct CharacterSummaryRow {
    character_slug: String,
    total: i64,
    approved: i64,
    rejected: i64,
    avg_quality: Option<f64>,
    best_quality: Option<f64>,
    worst_quality: Option<f64>,
    last_generated: Option<String>,
}

fn mode(values: impl Iterator<Item = String>) -> Option<String> {
    let mut counts: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
    for value in values {
        *counts.entry(value).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
        .map(|(value, _)| value)
}
