//! Projects, characters and generation styles.

use anyhow::Result;
use chrono::Utc;

use anzu_protocol::types::StyleParams;

use crate::models::{Character, GenerationStyle, Project};
use crate::pool::DbPool;

pub async fn create_project(
    pool: &DbPool,
    name: &str,
    genre: Option<&str>,
    premise: Option<&str>,
    content_rating: Option<&str>,
    default_style: Option<&str>,
) -> Result<i64> {
    let now = Utc::now().to_rfc3339();
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO projects (name, genre, premise, content_rating, default_style, status, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, 'active', ?, ?)
        RETURNING id
        "#,
    )
    .bind(name)
    .bind(genre)
    .bind(premise)
    .bind(content_rating)
    .bind(default_style)
    .bind(&now)
    .bind(&now)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

pub async fn get_project(pool: &DbPool, project_id: i64) -> Result<Option<Project>> {
    let project = sqlx::query_as("SELECT * FROM projects WHERE id = ?")
        .bind(project_id)
        .fetch_optional(pool)
        .await?;
    Ok(project)
}

pub async fn get_project_by_name(pool: &DbPool, name: &str) -> Result<Option<Project>> {
    let project = sqlx::query_as("SELECT * FROM projects WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await?;
    Ok(project)
}

pub async fn list_projects(pool: &DbPool) -> Result<Vec<Project>> {
    let projects = sqlx::query_as("SELECT * FROM projects ORDER BY id")
        .fetch_all(pool)
        .await?;
    Ok(projects)
}

pub async fn project_name(pool: &DbPool, project_id: i64) -> Result<Option<String>> {
    let name = sqlx::query_scalar("SELECT name FROM projects WHERE id = ?")
        .bind(project_id)
        .fetch_optional(pool)
        .await?;
    Ok(name)
}

#[allow(clippy::too_many_arguments)]
pub async fn create_character(
    pool: &DbPool,
    project_id: i64,
    slug: &str,
    name: &str,
    design_prompt: Option<&str>,
    appearance: Option<&str>,
    voice_profile: Option<&str>,
) -> Result<i64> {
    let now = Utc::now().to_rfc3339();
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO characters (project_id, slug, name, design_prompt, appearance, voice_profile, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(project_id)
    .bind(slug)
    .bind(name)
    .bind(design_prompt)
    .bind(appearance)
    .bind(voice_profile)
    .bind(&now)
    .bind(&now)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

pub async fn characters_for_project(pool: &DbPool, project_id: i64) -> Result<Vec<Character>> {
    let characters = sqlx::query_as("SELECT * FROM characters WHERE project_id = ? ORDER BY id")
        .bind(project_id)
        .fetch_all(pool)
        .await?;
    Ok(characters)
}

/// Characters eligible for pipeline admission: non-empty design prompt.
pub async fn admissible_characters(pool: &DbPool, project_id: i64) -> Result<Vec<Character>> {
    let characters = sqlx::query_as(
        r#"
        SELECT * FROM characters
        WHERE project_id = ?
          AND design_prompt IS NOT NULL AND design_prompt != ''
        ORDER BY id
        "#,
    )
    .bind(project_id)
    .fetch_all(pool)
    .await?;
    Ok(characters)
}

pub async fn get_character(pool: &DbPool, project_id: i64, slug: &str) -> Result<Option<Character>> {
    let character = sqlx::query_as("SELECT * FROM characters WHERE project_id = ? AND slug = ?")
        .bind(project_id)
        .bind(slug)
        .fetch_optional(pool)
        .await?;
    Ok(character)
}

pub async fn get_character_by_slug(pool: &DbPool, slug: &str) -> Result<Option<Character>> {
    let character = sqlx::query_as("SELECT * FROM characters WHERE slug = ? ORDER BY id LIMIT 1")
        .bind(slug)
        .fetch_optional(pool)
        .await?;
    Ok(character)
}

/// All (slug, project name) pairs, for the character -> project cache.
pub async fn character_project_pairs(pool: &DbPool) -> Result<Vec<(String, String)>> {
    let pairs = sqlx::query_as(
        r#"
        SELECT c.slug, p.name
        FROM characters c
        JOIN projects p ON c.project_id = p.id
        WHERE p.status = 'active'
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(pairs)
}

pub async fn get_style(pool: &DbPool, name: &str) -> Result<Option<GenerationStyle>> {
    let style = sqlx::query_as("SELECT * FROM generation_styles WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await?;
    Ok(style)
}

pub async fn upsert_style(pool: &DbPool, style: &StyleParams) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO generation_styles
            (name, checkpoint_model, cfg_scale, steps, sampler, scheduler,
             width, height, positive_template, negative_template, architecture, prompt_format)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (name) DO UPDATE SET
            checkpoint_model = excluded.checkpoint_model,
            cfg_scale = excluded.cfg_scale,
            steps = excluded.steps,
            sampler = excluded.sampler,
            scheduler = excluded.scheduler,
            width = excluded.width,
            height = excluded.height,
            positive_template = excluded.positive_template,
            negative_template = excluded.negative_template,
            architecture = excluded.architecture,
            prompt_format = excluded.prompt_format
        "#,
    )
    .bind(&style.name)
    .bind(&style.checkpoint_model)
    .bind(style.cfg_scale)
    .bind(style.steps)
    .bind(&style.sampler)
    .bind(&style.scheduler)
    .bind(style.width)
    .bind(style.height)
    .bind(&style.positive_template)
    .bind(&style.negative_template)
    .bind(&style.architecture)
    .bind(&style.prompt_format)
    .execute(pool)
    .await?;
    Ok(())
}

/// Default style for a project, falling back to None when unset.
pub async fn default_style_for_project(
    pool: &DbPool,
    project_id: i64,
) -> Result<Option<GenerationStyle>> {
    let style = sqlx::query_as(
        r#"
        SELECT gs.* FROM generation_styles gs
        JOIN projects p ON p.default_style = gs.name
        WHERE p.id = ?
        "#,
    )
    .bind(project_id)
    .fetch_optional(pool)
    .await?;
    Ok(style)
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

    #[tokio::test]
    async fn test_project_and_character_round_trip() {
        let pool = setup().await;
        let project_id = create_project(&pool, "P1", Some("fantasy"), None, Some("PG"), None)
            .await
            .unwrap();
        create_character(&pool, project_id, "luigi", "Luigi", Some("green plumber"), None, None)
            .await
            .unwrap();

        let characters = characters_for_project(&pool, project_id).await.unwrap();
        assert_eq!(characters.len(), 1);
        assert_eq!(characters[0].slug, "luigi");

        let pairs = character_project_pairs(&pool).await.unwrap();
        assert_eq!(pairs, vec![("luigi".to_string(), "P1".to_string())]);
    }

    #[tokio::test]
    async fn test_admissible_requires_design_prompt() {
        let pool = setup().await;
        let project_id = create_project(&pool, "P1", None, None, None, None).await.unwrap();
        create_character(&pool, project_id, "blank", "Blank", None, None, None)
            .await
            .unwrap();
        create_character(&pool, project_id, "luigi", "Luigi", Some("green"), None, None)
            .await
            .unwrap();

        let admissible = admissible_characters(&pool, project_id).await.unwrap();
        assert_eq!(admissible.len(), 1);
        assert_eq!(admissible[0].slug, "luigi");
    }

    #[tokio::test]
    async fn test_style_upsert_overwrites() {
        let pool = setup().await;
        let mut style = StyleParams {
            name: "cel".to_string(),
            checkpoint_model: "animeCheckpoint_v1".to_string(),
            cfg_scale: 7.0,
            steps: 28,
            sampler: "euler_a".to_string(),
            scheduler: "normal".to_string(),
            width: 768,
            height: 1024,
            positive_template: "{prompt}".to_string(),
            negative_template: "lowres".to_string(),
            architecture: "sd15".to_string(),
            prompt_format: "tags".to_string(),
        };
        upsert_style(&pool, &style).await.unwrap();
        style.cfg_scale = 5.5;
        upsert_style(&pool, &style).await.unwrap();

        let stored = get_style(&pool, "cel").await.unwrap().unwrap();
        assert_eq!(stored.cfg_scale, 5.5);
    }
}
