//! Episodes and their scene ordering.

use anyhow::Result;
use chrono::Utc;

use crate::models::Episode;
use crate::pool::DbPool;

pub async fn create_episode(
    pool: &DbPool,
    project_id: i64,
    episode_number: i64,
    title: &str,
) -> Result<i64> {
    let now = Utc::now().to_rfc3339();
    sqlx::query(
        r#"
        INSERT INTO episodes (project_id, episode_number, title, status, created_at, updated_at)
        VALUES (?, ?, ?, 'draft', ?, ?)
        ON CONFLICT (project_id, episode_number) DO NOTHING
        "#,
    )
    .bind(project_id)
    .bind(episode_number)
    .bind(title)
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await?;

    let id: i64 =
        sqlx::query_scalar("SELECT id FROM episodes WHERE project_id = ? AND episode_number = ?")
            .bind(project_id)
            .bind(episode_number)
            .fetch_one(pool)
            .await?;
    Ok(id)
}

pub async fn link_scene(
    pool: &DbPool,
    episode_id: i64,
    scene_id: i64,
    position: i64,
    transition: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO episode_scenes (episode_id, scene_id, position, transition)
        VALUES (?, ?, ?, ?)
        ON CONFLICT (episode_id, scene_id) DO UPDATE SET
            position = excluded.position,
            transition = excluded.transition
        "#,
    )
    .bind(episode_id)
    .bind(scene_id)
    .bind(position)
    .bind(transition)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn episodes_for_project(pool: &DbPool, project_id: i64) -> Result<Vec<Episode>> {
    let episodes =
        sqlx::query_as("SELECT * FROM episodes WHERE project_id = ? ORDER BY episode_number")
            .bind(project_id)
            .fetch_all(pool)
            .await?;
    Ok(episodes)
}

/// Episode totals used by the assembly and publishing gates:
/// (total, assembled, published).
pub async fn episode_counts(pool: &DbPool, project_id: i64) -> Result<(i64, i64, i64)> {
    let counts: (i64, i64, i64) = sqlx::query_as(
        r#"
        SELECT
            COUNT(*),
            COUNT(*) FILTER (WHERE final_video_path IS NOT NULL),
            COUNT(*) FILTER (WHERE status = 'published')
        FROM episodes
        WHERE project_id = ?
        "#,
    )
    .bind(project_id)
    .fetch_one(pool)
    .await?;
    Ok(counts)
}

/// The next episode still needing assembly, in episode order.
pub async fn next_unassembled_episode(pool: &DbPool, project_id: i64) -> Result<Option<Episode>> {
    let episode = sqlx::query_as(
        r#"
        SELECT * FROM episodes
        WHERE project_id = ? AND final_video_path IS NULL
        ORDER BY episode_number
        LIMIT 1
        "#,
    )
    .bind(project_id)
    .fetch_optional(pool)
    .await?;
    Ok(episode)
}

/// The next assembled but unpublished episode, in episode order.
pub async fn next_publishable_episode(pool: &DbPool, project_id: i64) -> Result<Option<Episode>> {
    let episode = sqlx::query_as(
        r#"
        SELECT * FROM episodes
        WHERE project_id = ?
          AND final_video_path IS NOT NULL
          AND status != 'published'
        ORDER BY episode_number
        LIMIT 1
        "#,
    )
    .bind(project_id)
    .fetch_optional(pool)
    .await?;
    Ok(episode)
}

/// Scene video paths and transitions for an episode, in position order.
pub async fn scene_videos_for_episode(
    pool: &DbPool,
    episode_id: i64,
) -> Result<Vec<(Option<String>, Option<String>)>> {
    let rows: Vec<(Option<String>, Option<String>)> = sqlx::query_as(
        r#"
        SELECT s.final_video_path, es.transition
        FROM episode_scenes es
        JOIN scenes s ON es.scene_id = s.id
        WHERE es.episode_id = ?
        ORDER BY es.position
        "#,
    )
    .bind(episode_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn set_episode_video(pool: &DbPool, episode_id: i64, path: &str) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    sqlx::query("UPDATE episodes SET final_video_path = ?, updated_at = ? WHERE id = ?")
        .bind(path)
        .bind(&now)
        .bind(episode_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn mark_published(pool: &DbPool, episode_id: i64) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    sqlx::query("UPDATE episodes SET status = 'published', updated_at = ? WHERE id = ?")
        .bind(&now)
        .bind(episode_id)
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
    use crate::store::scenes::{insert_scene, set_scene_video};

    async fn setup() -> (DbPool, i64) {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        run_migrations(&pool).await.unwrap();
        let project_id = create_project(&pool, "P1", None, None, None, None).await.unwrap();
        (pool, project_id)
    }

    #[tokio::test]
    async fn test_episode_lifecycle_counts() {
        let (pool, project_id) = setup().await;
        let ep = create_episode(&pool, project_id, 1, "Pilot").await.unwrap();

        assert_eq!(episode_counts(&pool, project_id).await.unwrap(), (1, 0, 0));

        set_episode_video(&pool, ep, "/media/ep1.mp4").await.unwrap();
        assert_eq!(episode_counts(&pool, project_id).await.unwrap(), (1, 1, 0));

        mark_published(&pool, ep).await.unwrap();
        assert_eq!(episode_counts(&pool, project_id).await.unwrap(), (1, 1, 1));
        assert!(next_publishable_episode(&pool, project_id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_scene_videos_in_position_order() {
        let (pool, project_id) = setup().await;
        let ep = create_episode(&pool, project_id, 1, "Pilot").await.unwrap();
        let s1 = insert_scene(&pool, project_id, 1, "One", None, None, None, None)
            .await
            .unwrap();
        let s2 = insert_scene(&pool, project_id, 2, "Two", None, None, None, None)
            .await
            .unwrap();
        set_scene_video(&pool, s1, "/media/s1.mp4").await.unwrap();
        set_scene_video(&pool, s2, "/media/s2.mp4").await.unwrap();

        // Linked out of order; positions decide.
        link_scene(&pool, ep, s2, 2, Some("fade")).await.unwrap();
        link_scene(&pool, ep, s1, 1, None).await.unwrap();

        let videos = scene_videos_for_episode(&pool, ep).await.unwrap();
        assert_eq!(videos[0].0.as_deref(), Some("/media/s1.mp4"));
        assert_eq!(videos[1].1.as_deref(), Some("fade"));
    }
}
