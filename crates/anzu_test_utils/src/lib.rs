//! Shared fixtures for Anzu tests: an in-memory migrated pool and seed
//! helpers for the common entity shapes.

use anyhow::Result;
use chrono::{Duration, Utc};

use anzu_db::store::generations::{insert_generation, set_review, NewGeneration, ReviewScores};
use anzu_db::store::projects::{create_character, create_project};
use anzu_db::{create_pool, run_migrations, DbConfig, DbPool};
use anzu_protocol::types::{GenerationKind, ReviewStatus};

/// A migrated in-memory SQLite pool.
pub async fn test_pool() -> DbPool {
    let pool = create_pool(DbConfig::sqlite_memory())
        .await
        .expect("in-memory pool");
    run_migrations(&pool).await.expect("bootstrap migration");
    pool
}

/// A project with one character, returning (project_id, slug).
pub async fn seed_project(pool: &DbPool, name: &str, slug: &str) -> Result<i64> {
    let project_id = create_project(pool, name, Some("fantasy"), None, Some("PG-13"), None).await?;
    create_character(
        pool,
        project_id,
        slug,
        &slug.replace('_', " "),
        Some("green-clad plumber, cap, mustache"),
        None,
        None,
    )
    .await?;
    Ok(project_id)
}

/// Builder for reviewed generation rows.
#[derive(Debug, Clone)]
pub struct SeedGeneration {
    pub slug: String,
    pub project: String,
    pub quality: f64,
    pub status: ReviewStatus,
    pub cfg_scale: f64,
    pub steps: i64,
    pub sampler: String,
    pub checkpoint: String,
    pub solo: bool,
    pub species_verified: bool,
    pub output_path: Option<String>,
    /// Shift generated_at into the past by this many days.
    pub age_days: i64,
}

impl SeedGeneration {
    pub fn approved(slug: &str, project: &str, quality: f64) -> Self {
        SeedGeneration {
            slug: slug.to_string(),
            project: project.to_string(),
            quality,
            status: ReviewStatus::Approved,
            cfg_scale: 7.0,
            steps: 28,
            sampler: "euler_a".to_string(),
            checkpoint: "animeCheckpoint_v1".to_string(),
            solo: true,
            species_verified: true,
            output_path: Some(format!("/media/{}/images/gen.png", slug)),
            age_days: 0,
        }
    }

    pub fn rejected(slug: &str, project: &str, quality: f64) -> Self {
        SeedGeneration {
            status: ReviewStatus::Rejected,
            ..Self::approved(slug, project, quality)
        }
    }

    pub fn cfg(mut self, cfg_scale: f64) -> Self {
        self.cfg_scale = cfg_scale;
        self
    }

    pub fn steps(mut self, steps: i64) -> Self {
        self.steps = steps;
        self
    }

    pub fn sampler(mut self, sampler: &str) -> Self {
        self.sampler = sampler.to_string();
        self
    }

    pub fn checkpoint(mut self, checkpoint: &str) -> Self {
        self.checkpoint = checkpoint.to_string();
        self
    }

    pub fn output(mut self, path: &str) -> Self {
        self.output_path = Some(path.to_string());
        self
    }

    pub fn aged(mut self, days: i64) -> Self {
        self.age_days = days;
        self
    }

    /// Insert the row (and its review) and return the generation id.
    pub async fn insert(self, pool: &DbPool) -> Result<i64> {
        let gen = NewGeneration {
            character_slug: Some(self.slug.clone()),
            project_name: Some(self.project.clone()),
            kind: GenerationKind::Image,
            checkpoint_model: Some(self.checkpoint.clone()),
            cfg_scale: Some(self.cfg_scale),
            steps: Some(self.steps),
            sampler: Some(self.sampler.clone()),
            scheduler: Some("normal".to_string()),
            width: Some(768),
            height: Some(1024),
            seed: Some(1234),
            output_path: self.output_path.clone(),
            solo: self.solo,
            species_verified: self.species_verified,
            ..NewGeneration::default()
        };
        let id = insert_generation(pool, &gen).await?;

        if self.status != ReviewStatus::Pending {
            let scores = ReviewScores {
                quality_score: self.quality,
                ..ReviewScores::default()
            };
            set_review(pool, id, self.status, &scores).await?;
        }

        if self.age_days > 0 {
            let shifted = (Utc::now() - Duration::days(self.age_days)).to_rfc3339();
            sqlx::query("UPDATE generation_history SET generated_at = ? WHERE id = ?")
                .bind(&shifted)
                .bind(id)
                .execute(pool)
                .await?;
        }
        Ok(id)
    }
}
