//! SQL-based pattern analysis over generation history, rejections and
//! approvals.
//!
//! No in-memory ML: counts, averages and groupings run in SQL; medians are
//! computed over the fetched successful-sample columns. Every public
//! function here is total: on error it logs and returns its empty shape.

use anyhow::Result;
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use tracing::{debug, warn};

use anzu_db::DbPool;
use anzu_events::{EventBus, Payload, IMAGE_APPROVED, IMAGE_REJECTED};
use anzu_protocol::defaults::{LEARNING_LOOKBACK_DAYS, MIN_SAMPLES, SUCCESS_THRESHOLD};
use anzu_protocol::types::PatternType;

/// Suggest optimal generation parameters based on historical quality data.
///
/// Returns `{}` unless at least MIN_SAMPLES generations scored at or above
/// SUCCESS_THRESHOLD; otherwise medians for cfg/steps/width/height plus the
/// best sampler once it has three successful uses.
pub async fn suggest_params(pool: &DbPool, character_slug: &str) -> Value {
    match suggest_params_inner(pool, character_slug).await {
        Ok(value) => value,
        Err(e) => {
            warn!("Failed to suggest params for {}: {}", character_slug, e);
            json!({})
        }
    }
}

async fn suggest_params_inner(pool: &DbPool, character_slug: &str) -> Result<Value> {
    let samples: Vec<(Option<f64>, Option<i64>, Option<i64>, Option<i64>, f64)> = sqlx::query_as(
        r#"
        SELECT cfg_scale, steps, width, height, quality_score
        FROM generation_history
        WHERE character_slug = ?
          AND quality_score >= ?
          AND quality_score IS NOT NULL
          AND cfg_scale IS NOT NULL
        "#,
    )
    .bind(character_slug)
    .bind(SUCCESS_THRESHOLD)
    .fetch_all(pool)
    .await?;

    if (samples.len() as i64) < MIN_SAMPLES {
        return Ok(json!({}));
    }

    let avg_quality = samples.iter().map(|s| s.4).sum::<f64>() / samples.len() as f64;
    let cfg = median_f64(samples.iter().filter_map(|s| s.0));
    let steps = median_i64(samples.iter().filter_map(|s| s.1));
    let width = median_i64(samples.iter().filter_map(|s| s.2));
    let height = median_i64(samples.iter().filter_map(|s| s.3));

    let mut suggestions = json!({
        "sample_count": samples.len(),
        "avg_quality": round3(avg_quality),
        "cfg_scale": cfg.map(round1),
        "steps": steps,
        "width": width,
        "height": height,
    });

    // Best sampler by average quality, needing >= 3 successful uses.
    let sampler_row: Option<(String, f64, i64)> = sqlx::query_as(
        r#"
        SELECT sampler, AVG(quality_score) as avg_q, COUNT(*) as n
        FROM generation_history
        WHERE character_slug = ?
          AND quality_score >= ?
          AND quality_score IS NOT NULL
          AND sampler IS NOT NULL
        GROUP BY sampler
        HAVING COUNT(*) >= 3
        ORDER BY avg_q DESC
        LIMIT 1
        "#,
    )
    .bind(character_slug)
    .bind(SUCCESS_THRESHOLD)
    .fetch_optional(pool)
    .await?;

    if let Some((sampler, avg_q, _)) = sampler_row {
        suggestions["sampler"] = json!(sampler);
        suggestions["sampler_avg_quality"] = json!(round3(avg_q));
    }

    Ok(suggestions)
}

/// Top rejection categories for a character, ordered by frequency.
pub async fn rejection_patterns(pool: &DbPool, character_slug: &str, limit: i64) -> Vec<Value> {
    let result: Result<Vec<(String, i64, Option<String>)>> = async {
        Ok(sqlx::query_as(
            r#"
            SELECT rc.category, COUNT(*) as count, MAX(r.created_at) as latest_at
            FROM rejection_categories rc
            JOIN rejections r ON rc.rejection_id = r.id
            WHERE r.character_slug = ?
            GROUP BY rc.category
            ORDER BY count DESC
            LIMIT ?
            "#,
        )
        .bind(character_slug)
        .bind(limit)
        .fetch_all(pool)
        .await?)
    }
    .await;

    match result {
        Ok(rows) => rows
            .into_iter()
            .map(|(category, count, latest_at)| {
                json!({ "category": category, "count": count, "latest_at": latest_at })
            })
            .collect(),
        Err(e) => {
            warn!(
                "Failed to get rejection patterns for {}: {}",
                character_slug, e
            );
            Vec::new()
        }
    }
}

/// Rank checkpoints by average quality score for a project.
pub async fn checkpoint_rankings(pool: &DbPool, project_name: &str) -> Vec<Value> {
    let cutoff = (Utc::now() - Duration::days(LEARNING_LOOKBACK_DAYS)).to_rfc3339();
    let result: Result<Vec<(String, f64, i64, i64, i64)>> = async {
        Ok(sqlx::query_as(
            r#"
            SELECT
                checkpoint_model,
                AVG(quality_score) as avg_quality,
                COUNT(*) as total,
                COUNT(*) FILTER (WHERE status = 'approved') as approved,
                COUNT(*) FILTER (WHERE status = 'rejected') as rejected
            FROM generation_history
            WHERE project_name = ?
              AND quality_score IS NOT NULL
              AND checkpoint_model IS NOT NULL
              AND generated_at > ?
            GROUP BY checkpoint_model
            ORDER BY avg_quality DESC
            "#,
        )
        .bind(project_name)
        .bind(&cutoff)
        .fetch_all(pool)
        .await?)
    }
    .await;

    match result {
        Ok(rows) => rows
            .into_iter()
            .map(|(checkpoint, avg_quality, total, approved, rejected)| {
                let approval_rate = if total > 0 {
                    (approved as f64 / total as f64 * 100.0).round() / 100.0
                } else {
                    0.0
                };
                json!({
                    "checkpoint": checkpoint,
                    "avg_quality": round3(avg_quality),
                    "total": total,
                    "approved": approved,
                    "rejected": rejected,
                    "approval_rate": approval_rate,
                })
            })
            .collect(),
        Err(e) => {
            warn!("Failed to get checkpoint rankings for {}: {}", project_name, e);
            Vec::new()
        }
    }
}

/// Quality trend over recent days for a character or project.
pub async fn quality_trend(
    pool: &DbPool,
    character_slug: Option<&str>,
    project_name: Option<&str>,
    days: i64,
) -> Vec<Value> {
    let (filter_column, filter_value) = match (character_slug, project_name) {
        (Some(slug), _) => ("character_slug", slug),
        (None, Some(project)) => ("project_name", project),
        (None, None) => return Vec::new(),
    };
    let cutoff = (Utc::now() - Duration::days(days)).to_rfc3339();

    let query = format!(
        r#"
        SELECT
            DATE(generated_at) as gen_date,
            AVG(quality_score) as avg_quality,
            COUNT(*) as total,
            COUNT(*) FILTER (WHERE status = 'approved') as approved,
            COUNT(*) FILTER (WHERE status = 'rejected') as rejected
        FROM generation_history
        WHERE {} = ?
          AND quality_score IS NOT NULL
          AND generated_at > ?
        GROUP BY gen_date
        ORDER BY gen_date
        "#,
        filter_column
    );

    let result: Result<Vec<(String, f64, i64, i64, i64)>> = async {
        Ok(sqlx::query_as(&query)
            .bind(filter_value)
            .bind(&cutoff)
            .fetch_all(pool)
            .await?)
    }
    .await;

    match result {
        Ok(rows) => rows
            .into_iter()
            .map(|(date, avg_quality, total, approved, rejected)| {
                json!({
                    "date": date,
                    "avg_quality": round3(avg_quality),
                    "count": total,
                    "approved": approved,
                    "rejected": rejected,
                })
            })
            .collect(),
        Err(e) => {
            warn!("Failed to get quality trend: {}", e);
            Vec::new()
        }
    }
}

/// Overall learning-system statistics over the last 30 days.
pub async fn learning_stats(pool: &DbPool) -> Value {
    match learning_stats_inner(pool).await {
        Ok(value) => value,
        Err(e) => {
            warn!("Failed to get learning stats: {}", e);
            json!({})
        }
    }
}

async fn learning_stats_inner(pool: &DbPool) -> Result<Value> {
    let cutoff = (Utc::now() - Duration::days(LEARNING_LOOKBACK_DAYS)).to_rfc3339();

    let history: (i64, i64, Option<f64>, i64, i64, i64, i64) = sqlx::query_as(
        r#"
        SELECT
            COUNT(*) as total_generations,
            COUNT(*) FILTER (WHERE quality_score IS NOT NULL) as reviewed,
            AVG(quality_score) FILTER (WHERE quality_score IS NOT NULL) as avg_quality,
            COUNT(*) FILTER (WHERE status = 'approved') as approved,
            COUNT(*) FILTER (WHERE status = 'rejected') as rejected,
            COUNT(DISTINCT character_slug) FILTER (WHERE character_slug IS NOT NULL) as characters_tracked,
            COUNT(DISTINCT checkpoint_model) FILTER (WHERE checkpoint_model IS NOT NULL) as checkpoints_used
        FROM generation_history
        WHERE generated_at > ?
        "#,
    )
    .bind(&cutoff)
    .fetch_one(pool)
    .await?;

    let rejections: (i64, i64) = sqlx::query_as(
        r#"
        SELECT COUNT(*) as total_rejections,
               COUNT(DISTINCT character_slug) as characters_rejected
        FROM rejections
        WHERE created_at > ?
        "#,
    )
    .bind(&cutoff)
    .fetch_one(pool)
    .await?;

    let patterns: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM learned_patterns")
        .fetch_one(pool)
        .await?;

    let decisions: (i64, i64, i64, i64) = sqlx::query_as(
        r#"
        SELECT COUNT(*) as total_decisions,
               COUNT(*) FILTER (WHERE decision_type = 'auto_approve') as auto_approves,
               COUNT(*) FILTER (WHERE decision_type = 'auto_reject') as auto_rejects,
               COUNT(*) FILTER (WHERE decision_type = 'regeneration') as regenerations
        FROM autonomy_decisions
        WHERE created_at > ?
        "#,
    )
    .bind(&cutoff)
    .fetch_one(pool)
    .await?;

    Ok(json!({
        "generation_history": {
            "total": history.0,
            "reviewed": history.1,
            "avg_quality": history.2.map(round3),
            "approved": history.3,
            "rejected": history.4,
            "characters_tracked": history.5,
            "checkpoints_used": history.6,
        },
        "rejections": {
            "total": rejections.0,
            "characters_affected": rejections.1,
        },
        "learned_patterns": patterns,
        "autonomy_decisions": {
            "total": decisions.0,
            "auto_approves": decisions.1,
            "auto_rejects": decisions.2,
            "regenerations": decisions.3,
        },
        "period": "last_30_days",
    }))
}

/// Data point for the learned-pattern upsert.
#[derive(Debug, Clone, Default)]
pub struct PatternSample {
    pub project_name: Option<String>,
    pub checkpoint_model: Option<String>,
    pub quality_score: Option<f64>,
    pub cfg_scale: Option<f64>,
    pub steps: Option<i64>,
}

/// Upsert into `learned_patterns` by (character_slug, pattern_type,
/// checkpoint_model): increment frequency, fold the quality score into the
/// running average, widen the cfg/steps ranges.
pub async fn record_learned_pattern(
    pool: &DbPool,
    character_slug: &str,
    pattern_type: PatternType,
    sample: &PatternSample,
) {
    if let Err(e) = record_learned_pattern_inner(pool, character_slug, pattern_type, sample).await {
        warn!("Failed to record learned pattern: {}", e);
    }
}

async fn record_learned_pattern_inner(
    pool: &DbPool,
    character_slug: &str,
    pattern_type: PatternType,
    sample: &PatternSample,
) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    sqlx::query(
        r#"
        INSERT INTO learned_patterns
            (character_slug, project_name, pattern_type, checkpoint_model,
             quality_score_avg, frequency, cfg_range_min, cfg_range_max,
             steps_range_min, steps_range_max, updated_at)
        VALUES (?, ?, ?, COALESCE(?, ''), ?, 1, ?, ?, ?, ?, ?)
        ON CONFLICT (character_slug, pattern_type, checkpoint_model) DO UPDATE SET
            quality_score_avg = CASE
                WHEN excluded.quality_score_avg IS NULL THEN quality_score_avg
                ELSE (COALESCE(quality_score_avg, 0) * frequency + excluded.quality_score_avg)
                     / (frequency + 1)
            END,
            frequency = frequency + 1,
            cfg_range_min = CASE
                WHEN excluded.cfg_range_min IS NULL THEN cfg_range_min
                ELSE MIN(COALESCE(cfg_range_min, excluded.cfg_range_min), excluded.cfg_range_min)
            END,
            cfg_range_max = CASE
                WHEN excluded.cfg_range_max IS NULL THEN cfg_range_max
                ELSE MAX(COALESCE(cfg_range_max, excluded.cfg_range_max), excluded.cfg_range_max)
            END,
            steps_range_min = CASE
                WHEN excluded.steps_range_min IS NULL THEN steps_range_min
                ELSE MIN(COALESCE(steps_range_min, excluded.steps_range_min), excluded.steps_range_min)
            END,
            steps_range_max = CASE
                WHEN excluded.steps_range_max IS NULL THEN steps_range_max
                ELSE MAX(COALESCE(steps_range_max, excluded.steps_range_max), excluded.steps_range_max)
            END,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(character_slug)
    .bind(&sample.project_name)
    .bind(pattern_type.as_str())
    .bind(&sample.checkpoint_model)
    .bind(sample.quality_score)
    .bind(sample.cfg_scale)
    .bind(sample.cfg_scale)
    .bind(sample.steps)
    .bind(sample.steps)
    .bind(&now)
    .execute(pool)
    .await?;
    Ok(())
}

/// Wire the learning handlers onto the bus: approvals feed `success`
/// patterns, rejections feed `failure` patterns.
pub fn register_learning_handlers(bus: &EventBus, pool: DbPool) {
    let approve_pool = pool.clone();
    bus.subscribe(IMAGE_APPROVED, move |payload| {
        let pool = approve_pool.clone();
        async move {
            handle_review_event(&pool, PatternType::Success, payload).await;
            Ok(())
        }
    });

    bus.subscribe(IMAGE_REJECTED, move |payload| {
        let pool = pool.clone();
        async move {
            handle_review_event(&pool, PatternType::Failure, payload).await;
            Ok(())
        }
    });
}

async fn handle_review_event(pool: &DbPool, pattern_type: PatternType, payload: Payload) {
    let Some(slug) = payload.get("character_slug").and_then(Value::as_str) else {
        return;
    };
    let sample = PatternSample {
        project_name: payload
            .get("project_name")
            .and_then(Value::as_str)
            .map(str::to_string),
        checkpoint_model: payload
            .get("checkpoint_model")
            .and_then(Value::as_str)
            .map(str::to_string),
        quality_score: payload.get("quality_score").and_then(Value::as_f64),
        cfg_scale: payload.get("cfg_scale").and_then(Value::as_f64),
        steps: payload.get("steps").and_then(Value::as_i64),
    };
    record_learned_pattern(pool, slug, pattern_type, &sample).await;
    debug!("Learning: recorded {} pattern for {}", pattern_type, slug);
}

// ── small numeric helpers ──────────────────────────────────────────────

pub(crate) fn median_f64(values: impl Iterator<Item = f64>) -> Option<f64> {
    let mut sorted: Vec<f64> = values.collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    Some(if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    })
}

pub(crate) fn median_i64(values: impl Iterator<Item = i64>) -> Option<i64> {
    median_f64(values.map(|v| v as f64)).map(|m| m.round() as i64)
}

pub(crate) fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

pub(crate) fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use anzu_test_utils::{seed_project, test_pool, SeedGeneration};

    #[test]
    fn test_median_even_and_odd() {
        assert_eq!(median_f64([1.0, 3.0, 2.0].into_iter()), Some(2.0));
        assert_eq!(median_f64([1.0, 2.0, 3.0, 4.0].into_iter()), Some(2.5));
        assert_eq!(median_f64(std::iter::empty()), None);
        assert_eq!(median_i64([10, 20].into_iter()), Some(15));
    }

    #[tokio::test]
    async fn test_suggest_params_needs_min_samples() {
        let pool = test_pool().await;
        seed_project(&pool, "P1", "luigi").await.unwrap();

        for _ in 0..4 {
            SeedGeneration::approved("luigi", "P1", 0.8)
                .insert(&pool)
                .await
                .unwrap();
        }
        assert_eq!(suggest_params(&pool, "luigi").await, json!({}));

        SeedGeneration::approved("luigi", "P1", 0.9)
            .insert(&pool)
            .await
            .unwrap();
        let suggestion = suggest_params(&pool, "luigi").await;
        assert_eq!(suggestion["sample_count"], 5);
        assert_eq!(suggestion["cfg_scale"], 7.0);
        assert_eq!(suggestion["steps"], 28);
    }

    #[tokio::test]
    async fn test_suggest_params_ignores_low_quality() {
        let pool = test_pool().await;
        seed_project(&pool, "P1", "luigi").await.unwrap();
        for _ in 0..5 {
            SeedGeneration::rejected("luigi", "P1", 0.3)
                .insert(&pool)
                .await
                .unwrap();
        }
        assert_eq!(suggest_params(&pool, "luigi").await, json!({}));
    }

    #[tokio::test]
    async fn test_best_sampler_requires_three_uses() {
        let pool = test_pool().await;
        seed_project(&pool, "P1", "luigi").await.unwrap();

        for _ in 0..5 {
            SeedGeneration::approved("luigi", "P1", 0.75)
                .sampler("euler_a")
                .insert(&pool)
                .await
                .unwrap();
        }
        // Better sampler but only two uses: must not win.
        for _ in 0..2 {
            SeedGeneration::approved("luigi", "P1", 0.95)
                .sampler("dpmpp_2m")
                .insert(&pool)
                .await
                .unwrap();
        }

        let suggestion = suggest_params(&pool, "luigi").await;
        assert_eq!(suggestion["sampler"], "euler_a");
    }

    #[tokio::test]
    async fn test_pattern_upsert_running_average() {
        let pool = test_pool().await;

        let sample = |q: f64, cfg: f64| PatternSample {
            quality_score: Some(q),
            cfg_scale: Some(cfg),
            steps: Some(28),
            checkpoint_model: Some("ckpt_a".into()),
            ..PatternSample::default()
        };

        record_learned_pattern(&pool, "luigi", PatternType::Success, &sample(0.8, 7.0)).await;
        record_learned_pattern(&pool, "luigi", PatternType::Success, &sample(0.6, 5.0)).await;
        record_learned_pattern(&pool, "luigi", PatternType::Success, &sample(0.7, 9.0)).await;

        let (freq, avg, cfg_min, cfg_max): (i64, f64, f64, f64) = sqlx::query_as(
            r#"
            SELECT frequency, quality_score_avg, cfg_range_min, cfg_range_max
            FROM learned_patterns
            WHERE character_slug = 'luigi' AND pattern_type = 'success' AND checkpoint_model = 'ckpt_a'
            "#,
        )
        .fetch_one(&pool)
        .await
        .unwrap();

        assert_eq!(freq, 3);
        assert!((avg - 0.7).abs() < 1e-9, "running avg converges: {}", avg);
        assert_eq!(cfg_min, 5.0);
        assert_eq!(cfg_max, 9.0);
    }

    #[tokio::test]
    async fn test_pattern_keys_isolated_by_checkpoint() {
        let pool = test_pool().await;
        let sample = |ckpt: &str| PatternSample {
            quality_score: Some(0.8),
            checkpoint_model: Some(ckpt.to_string()),
            ..PatternSample::default()
        };
        record_learned_pattern(&pool, "luigi", PatternType::Success, &sample("a")).await;
        record_learned_pattern(&pool, "luigi", PatternType::Success, &sample("b")).await;

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM learned_patterns")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(rows, 2);
    }

    #[tokio::test]
    async fn test_learning_stats_counts_recent_only() {
        let pool = test_pool().await;
        seed_project(&pool, "P1", "luigi").await.unwrap();
        SeedGeneration::approved("luigi", "P1", 0.9)
            .insert(&pool)
            .await
            .unwrap();
        SeedGeneration::approved("luigi", "P1", 0.9)
            .aged(45)
            .insert(&pool)
            .await
            .unwrap();

        let stats = learning_stats(&pool).await;
        assert_eq!(stats["generation_history"]["total"], 1);
        assert_eq!(stats["generation_history"]["approved"], 1);
    }
}
