//! Generation history, rejections and approvals.
//!
//! Review-status writes keep the record invariant: a row only reaches
//! `approved` or `rejected` together with `reviewed_at` and a quality score.

use anyhow::Result;
use chrono::{DateTime, Utc};

use anzu_protocol::defaults::CORRECTION_DEPTH_LIMIT;
use anzu_protocol::types::{GenerationKind, RejectionCategory, ReviewSource, ReviewStatus};

use crate::models::{GenerationRecord, Rejection};
use crate::pool::DbPool;

/// Parameters for a new generation row. Everything optional is unknown at
/// submit time and filled in by review.
#[derive(Debug, Clone, Default)]
pub struct NewGeneration {
    pub character_slug: Option<String>,
    pub project_name: Option<String>,
    pub kind: GenerationKind,
    pub backend_job_id: Option<String>,
    pub checkpoint_model: Option<String>,
    pub cfg_scale: Option<f64>,
    pub steps: Option<i64>,
    pub sampler: Option<String>,
    pub scheduler: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub seed: Option<i64>,
    pub output_path: Option<String>,
    pub solo: bool,
    pub species_verified: bool,
    pub correction_of: Option<i64>,
    pub generation_time_ms: Option<i64>,
}

pub async fn insert_generation(pool: &DbPool, gen: &NewGeneration) -> Result<i64> {
    let now = Utc::now().to_rfc3339();
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO generation_history
            (character_slug, project_name, kind, backend_job_id, checkpoint_model,
             cfg_scale, steps, sampler, scheduler, width, height, seed, output_path,
             solo, species_verified, status, correction_of, generation_time_ms, generated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(&gen.character_slug)
    .bind(&gen.project_name)
    .bind(gen.kind.as_str())
    .bind(&gen.backend_job_id)
    .bind(&gen.checkpoint_model)
    .bind(gen.cfg_scale)
    .bind(gen.steps)
    .bind(&gen.sampler)
    .bind(&gen.scheduler)
    .bind(gen.width)
    .bind(gen.height)
    .bind(gen.seed)
    .bind(&gen.output_path)
    .bind(gen.solo)
    .bind(gen.species_verified)
    .bind(gen.correction_of)
    .bind(gen.generation_time_ms)
    .bind(&now)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

pub async fn get_generation(pool: &DbPool, id: i64) -> Result<Option<GenerationRecord>> {
    let record = sqlx::query_as("SELECT * FROM generation_history WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(record)
}

/// Scores attached to a record during review.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReviewScores {
    pub quality_score: f64,
    pub character_match_score: Option<f64>,
    pub clarity_score: Option<f64>,
    pub training_value: Option<f64>,
    pub solo: Option<bool>,
    pub species_verified: Option<bool>,
}

/// Write the review outcome. `approved`/`rejected` always get `reviewed_at`
/// and the quality score in the same statement; `in_review` keeps the score
/// for the eventual manual decision.
pub async fn set_review(
    pool: &DbPool,
    generation_id: i64,
    status: ReviewStatus,
    scores: &ReviewScores,
) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    sqlx::query(
        r#"
        UPDATE generation_history
        SET status = ?,
            quality_score = ?,
            character_match_score = COALESCE(?, character_match_score),
            clarity_score = COALESCE(?, clarity_score),
            training_value = COALESCE(?, training_value),
            solo = COALESCE(?, solo),
            species_verified = COALESCE(?, species_verified),
            reviewed_at = ?
        WHERE id = ?
        "#,
    )
    .bind(status.as_str())
    .bind(scores.quality_score)
    .bind(scores.character_match_score)
    .bind(scores.clarity_score)
    .bind(scores.training_value)
    .bind(scores.solo)
    .bind(scores.species_verified)
    .bind(&now)
    .bind(generation_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Park a record for manual review without scores, used when the vision
/// service is unavailable.
pub async fn mark_in_review(pool: &DbPool, generation_id: i64) -> Result<()> {
    sqlx::query("UPDATE generation_history SET status = 'in_review' WHERE id = ?")
        .bind(generation_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn approved_count(pool: &DbPool, character_slug: &str) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM generation_history WHERE character_slug = ? AND status = 'approved'",
    )
    .bind(character_slug)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

/// Approved image records for a project, grouped for shot preparation.
pub async fn approved_images_for_project(
    pool: &DbPool,
    project_name: &str,
) -> Result<Vec<GenerationRecord>> {
    let records = sqlx::query_as(
        r#"
        SELECT * FROM generation_history
        WHERE project_name = ?
          AND kind = 'image'
          AND status = 'approved'
          AND output_path IS NOT NULL
        ORDER BY quality_score DESC
        "#,
    )
    .bind(project_name)
    .fetch_all(pool)
    .await?;
    Ok(records)
}

/// Generations started for a character since the given UTC day boundary.
pub async fn count_since(
    pool: &DbPool,
    character_slug: &str,
    since: DateTime<Utc>,
) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM generation_history WHERE character_slug = ? AND generated_at >= ?",
    )
    .bind(character_slug)
    .bind(since.to_rfc3339())
    .fetch_one(pool)
    .await?;
    Ok(count)
}

/// Rejections since the last approval: the consecutive-rejection streak.
pub async fn consecutive_rejections(pool: &DbPool, character_slug: &str) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM generation_history
        WHERE character_slug = ?
          AND status = 'rejected'
          AND id > COALESCE((
              SELECT MAX(id) FROM generation_history
              WHERE character_slug = ? AND status = 'approved'
          ), 0)
        "#,
    )
    .bind(character_slug)
    .bind(character_slug)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

/// How many correction-of hops sit above this record. Walks at most the
/// depth limit; the chain cannot be deeper than the limit allows anyway.
pub async fn correction_depth(pool: &DbPool, generation_id: i64) -> Result<i64> {
    let mut depth = 0;
    let mut current = generation_id;
    while depth <= CORRECTION_DEPTH_LIMIT {
        let parent: Option<i64> =
            sqlx::query_scalar("SELECT correction_of FROM generation_history WHERE id = ?")
                .bind(current)
                .fetch_optional(pool)
                .await?
                .flatten();
        match parent {
            Some(parent_id) => {
                depth += 1;
                current = parent_id;
            }
            None => break,
        }
    }
    Ok(depth)
}

/// Record a rejection with its categories in one transaction.
pub async fn insert_rejection(
    pool: &DbPool,
    generation_id: i64,
    character_slug: &str,
    categories: &[RejectionCategory],
    feedback: Option<&str>,
    negative_additions: Option<&str>,
    review_source: ReviewSource,
    quality_score: Option<f64>,
) -> Result<i64> {
    let now = Utc::now().to_rfc3339();
    let mut tx = pool.begin().await?;

    let rejection_id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO rejections
            (generation_id, character_slug, feedback, negative_additions,
             review_source, quality_score, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(generation_id)
    .bind(character_slug)
    .bind(feedback)
    .bind(negative_additions)
    .bind(review_source.as_str())
    .bind(quality_score)
    .bind(&now)
    .fetch_one(&mut *tx)
    .await?;

    for category in categories {
        sqlx::query(
            r#"
            INSERT INTO rejection_categories (rejection_id, category)
            VALUES (?, ?)
            ON CONFLICT (rejection_id, category) DO NOTHING
            "#,
        )
        .bind(rejection_id)
        .bind(category.as_str())
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(rejection_id)
}

pub async fn insert_approval(
    pool: &DbPool,
    generation_id: i64,
    character_slug: &str,
    auto_approved: bool,
    vision_review: Option<&str>,
    quality_score: Option<f64>,
) -> Result<i64> {
    let now = Utc::now().to_rfc3339();
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO approvals
            (generation_id, character_slug, auto_approved, vision_review, quality_score, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(generation_id)
    .bind(character_slug)
    .bind(auto_approved)
    .bind(vision_review)
    .bind(quality_score)
    .bind(&now)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

pub async fn rejections_for_character(
    pool: &DbPool,
    character_slug: &str,
    limit: i64,
) -> Result<Vec<Rejection>> {
    let rejections = sqlx::query_as(
        "SELECT * FROM rejections WHERE character_slug = ? ORDER BY created_at DESC LIMIT ?",
    )
    .bind(character_slug)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rejections)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::run_migrations;
    use crate::pool::{create_pool, DbConfig};

    async fn setup() -> DbPool {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    fn gen_for(slug: &str) -> NewGeneration {
        NewGeneration {
            character_slug: Some(slug.to_string()),
            project_name: Some("P1".to_string()),
            solo: true,
            ..NewGeneration::default()
        }
    }

    #[tokio::test]
    async fn test_review_invariant_fields_set_together() {
        let pool = setup().await;
        let id = insert_generation(&pool, &gen_for("luigi")).await.unwrap();

        let scores = ReviewScores {
            quality_score: 0.85,
            ..ReviewScores::default()
        };
        set_review(&pool, id, ReviewStatus::Approved, &scores)
            .await
            .unwrap();

        let record = get_generation(&pool, id).await.unwrap().unwrap();
        assert_eq!(record.status, "approved");
        assert!(record.reviewed_at.is_some());
        assert_eq!(record.quality_score, Some(0.85));
    }

    #[tokio::test]
    async fn test_consecutive_rejections_reset_by_approval() {
        let pool = setup().await;
        let reject = ReviewScores {
            quality_score: 0.2,
            ..ReviewScores::default()
        };
        let approve = ReviewScores {
            quality_score: 0.9,
            ..ReviewScores::default()
        };

        for _ in 0..2 {
            let id = insert_generation(&pool, &gen_for("luigi")).await.unwrap();
            set_review(&pool, id, ReviewStatus::Rejected, &reject).await.unwrap();
        }
        assert_eq!(consecutive_rejections(&pool, "luigi").await.unwrap(), 2);

        let id = insert_generation(&pool, &gen_for("luigi")).await.unwrap();
        set_review(&pool, id, ReviewStatus::Approved, &approve).await.unwrap();
        assert_eq!(consecutive_rejections(&pool, "luigi").await.unwrap(), 0);

        let id = insert_generation(&pool, &gen_for("luigi")).await.unwrap();
        set_review(&pool, id, ReviewStatus::Rejected, &reject).await.unwrap();
        assert_eq!(consecutive_rejections(&pool, "luigi").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_correction_depth_walks_chain() {
        let pool = setup().await;
        let root = insert_generation(&pool, &gen_for("luigi")).await.unwrap();
        assert_eq!(correction_depth(&pool, root).await.unwrap(), 0);

        let mut child = NewGeneration {
            correction_of: Some(root),
            ..gen_for("luigi")
        };
        let first = insert_generation(&pool, &child).await.unwrap();
        assert_eq!(correction_depth(&pool, first).await.unwrap(), 1);

        child.correction_of = Some(first);
        let second = insert_generation(&pool, &child).await.unwrap();
        assert_eq!(correction_depth(&pool, second).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_rejection_categories_persisted() {
        let pool = setup().await;
        let id = insert_generation(&pool, &gen_for("luigi")).await.unwrap();
        insert_rejection(
            &pool,
            id,
            "luigi",
            &[RejectionCategory::LowQuality, RejectionCategory::NotSolo],
            Some("blurry crowd shot"),
            None,
            ReviewSource::Vision,
            Some(0.3),
        )
        .await
        .unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM rejection_categories")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 2);
    }
}
