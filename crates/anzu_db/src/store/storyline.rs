//! Storyline versions and style history.
//!
//! The storyline is append-only: every revision gets the next version
//! number and earlier versions stay queryable. Style history records which
//! generation style a project actually used over time.

use anyhow::Result;
use chrono::Utc;

use crate::pool::DbPool;

/// Append a new storyline revision, returning its version number.
pub async fn append_storyline(
    pool: &DbPool,
    project_id: i64,
    content: &str,
    author: Option<&str>,
) -> Result<i64> {
    let now = Utc::now().to_rfc3339();
    let mut tx = pool.begin().await?;

    let next_version: i64 = sqlx::query_scalar(
        "SELECT COALESCE(MAX(version), 0) + 1 FROM storyline_versions WHERE project_id = ?",
    )
    .bind(project_id)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO storyline_versions (project_id, version, content, author, created_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(project_id)
    .bind(next_version)
    .bind(content)
    .bind(author)
    .bind(&now)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(next_version)
}

/// Latest storyline revision, if any: (version, content).
pub async fn latest_storyline(pool: &DbPool, project_id: i64) -> Result<Option<(i64, String)>> {
    let row = sqlx::query_as(
        r#"
        SELECT version, content FROM storyline_versions
        WHERE project_id = ?
        ORDER BY version DESC
        LIMIT 1
        "#,
    )
    .bind(project_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// All revisions, oldest first: (version, author, created_at).
pub async fn storyline_history(
    pool: &DbPool,
    project_id: i64,
) -> Result<Vec<(i64, Option<String>, String)>> {
    let rows = sqlx::query_as(
        r#"
        SELECT version, author, created_at FROM storyline_versions
        WHERE project_id = ?
        ORDER BY version
        "#,
    )
    .bind(project_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Record that a style was applied for a project's generation.
pub async fn record_style_use(
    pool: &DbPool,
    project_id: i64,
    style_name: &str,
    checkpoint_model: Option<&str>,
) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    sqlx::query(
        r#"
        INSERT INTO style_history (project_id, style_name, checkpoint_model, applied_at)
        VALUES (?, ?, ?, ?)
        "#,
    )
    .bind(project_id)
    .bind(style_name)
    .bind(checkpoint_model)
    .bind(&now)
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::run_migrations;
    use crate::pool::{create_pool, DbConfig};
    use crate::store::projects::create_project;

    async fn setup() -> (DbPool, i64) {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        run_migrations(&pool).await.unwrap();
        let project_id = create_project(&pool, "P1", None, None, None, None).await.unwrap();
        (pool, project_id)
    }

    #[tokio::test]
    async fn test_versions_are_sequential_and_latest_wins() {
        let (pool, project_id) = setup().await;
        assert!(latest_storyline(&pool, project_id).await.unwrap().is_none());

        let v1 = append_storyline(&pool, project_id, "Act one: the harbor.", Some("op"))
            .await
            .unwrap();
        let v2 = append_storyline(&pool, project_id, "Act one, revised.", None)
            .await
            .unwrap();
        assert_eq!((v1, v2), (1, 2));

        let (version, content) = latest_storyline(&pool, project_id).await.unwrap().unwrap();
        assert_eq!(version, 2);
        assert_eq!(content, "Act one, revised.");

        let history = storyline_history(&pool, project_id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].1.as_deref(), Some("op"));
    }

    #[tokio::test]
    async fn test_style_history_accumulates() {
        let (pool, project_id) = setup().await;
        record_style_use(&pool, project_id, "cel", Some("ckpt_a")).await.unwrap();
        record_style_use(&pool, project_id, "cel", Some("ckpt_b")).await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM style_history")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 2);
    }
}
