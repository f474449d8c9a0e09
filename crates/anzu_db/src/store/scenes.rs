//! Scenes and shots.

use anyhow::Result;
use chrono::Utc;

use crate::models::{Scene, Shot};
use crate::pool::DbPool;

/// Insert a scene; the `(project_id, scene_number)` upsert keeps planning
/// idempotent when the worker is re-dispatched.
#[allow(clippy::too_many_arguments)]
pub async fn insert_scene(
    pool: &DbPool,
    project_id: i64,
    scene_number: i64,
    title: &str,
    description: Option<&str>,
    location: Option<&str>,
    time_of_day: Option<&str>,
    mood: Option<&str>,
) -> Result<i64> {
    let now = Utc::now().to_rfc3339();
    sqlx::query(
        r#"
        INSERT INTO scenes
            (project_id, scene_number, title, description, location, time_of_day, mood, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (project_id, scene_number) DO NOTHING
        "#,
    )
    .bind(project_id)
    .bind(scene_number)
    .bind(title)
    .bind(description)
    .bind(location)
    .bind(time_of_day)
    .bind(mood)
    .bind(&now)
    .execute(pool)
    .await?;

    let id: i64 =
        sqlx::query_scalar("SELECT id FROM scenes WHERE project_id = ? AND scene_number = ?")
            .bind(project_id)
            .bind(scene_number)
            .fetch_one(pool)
            .await?;
    Ok(id)
}

#[allow(clippy::too_many_arguments)]
pub async fn insert_shot(
    pool: &DbPool,
    scene_id: i64,
    shot_number: i64,
    shot_type: &str,
    camera_angle: Option<&str>,
    characters_present: Option<&str>,
    generation_prompt: Option<&str>,
    motion_prompt: Option<&str>,
    duration_seconds: f64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO shots
            (scene_id, shot_number, shot_type, camera_angle, characters_present,
             generation_prompt, motion_prompt, duration_seconds)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (scene_id, shot_number) DO NOTHING
        "#,
    )
    .bind(scene_id)
    .bind(shot_number)
    .bind(shot_type)
    .bind(camera_angle)
    .bind(characters_present)
    .bind(generation_prompt)
    .bind(motion_prompt)
    .bind(duration_seconds)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn scene_count(pool: &DbPool, project_id: i64) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM scenes WHERE project_id = ?")
        .bind(project_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

pub async fn scenes_for_project(pool: &DbPool, project_id: i64) -> Result<Vec<Scene>> {
    let scenes = sqlx::query_as("SELECT * FROM scenes WHERE project_id = ? ORDER BY scene_number")
        .bind(project_id)
        .fetch_all(pool)
        .await?;
    Ok(scenes)
}

/// Shot totals used by the video-generation and shot-preparation gates:
/// (total, missing_source_image, completed).
pub async fn shot_counts(pool: &DbPool, project_id: i64) -> Result<(i64, i64, i64)> {
    let counts: (i64, i64, i64) = sqlx::query_as(
        r#"
        SELECT
            COUNT(*),
            COUNT(*) FILTER (WHERE s.source_image_path IS NULL),
            COUNT(*) FILTER (WHERE s.status IN ('completed', 'accepted_best'))
        FROM shots s
        JOIN scenes sc ON s.scene_id = sc.id
        WHERE sc.project_id = ?
        "#,
    )
    .bind(project_id)
    .fetch_one(pool)
    .await?;
    Ok(counts)
}

/// Shots under the project still lacking a source image, in scene/shot
/// order.
pub async fn shots_missing_source(pool: &DbPool, project_id: i64) -> Result<Vec<Shot>> {
    let shots = sqlx::query_as(
        r#"
        SELECT s.* FROM shots s
        JOIN scenes sc ON s.scene_id = sc.id
        WHERE sc.project_id = ? AND s.source_image_path IS NULL
        ORDER BY sc.scene_number, s.shot_number
        "#,
    )
    .bind(project_id)
    .fetch_all(pool)
    .await?;
    Ok(shots)
}

pub async fn shots_for_scene(pool: &DbPool, scene_id: i64) -> Result<Vec<Shot>> {
    let shots = sqlx::query_as("SELECT * FROM shots WHERE scene_id = ? ORDER BY shot_number")
        .bind(scene_id)
        .fetch_all(pool)
        .await?;
    Ok(shots)
}

/// Assign source images to shots in a single transaction so a re-dispatched
/// worker never sees a half-assigned set.
pub async fn assign_shot_sources(pool: &DbPool, assignments: &[(i64, String)]) -> Result<()> {
    let mut tx = pool.begin().await?;
    for (shot_id, image_path) in assignments {
        sqlx::query("UPDATE shots SET source_image_path = ? WHERE id = ?")
            .bind(image_path)
            .bind(shot_id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// The first scene still needing video generation, if any.
pub async fn next_unrendered_scene(pool: &DbPool, project_id: i64) -> Result<Option<Scene>> {
    let scene = sqlx::query_as(
        r#"
        SELECT * FROM scenes
        WHERE project_id = ? AND final_video_path IS NULL
        ORDER BY scene_number
        LIMIT 1
        "#,
    )
    .bind(project_id)
    .fetch_optional(pool)
    .await?;
    Ok(scene)
}

pub async fn set_shot_video(pool: &DbPool, shot_id: i64, path: &str, status: &str) -> Result<()> {
    sqlx::query("UPDATE shots SET output_video_path = ?, status = ? WHERE id = ?")
        .bind(path)
        .bind(status)
        .bind(shot_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_scene_video(pool: &DbPool, scene_id: i64, path: &str) -> Result<()> {
    sqlx::query("UPDATE scenes SET final_video_path = ? WHERE id = ?")
        .bind(path)
        .bind(scene_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Scene totals used by the scene-assembly gate: (total, assembled).
pub async fn scene_assembly_counts(pool: &DbPool, project_id: i64) -> Result<(i64, i64)> {
    let counts: (i64, i64) = sqlx::query_as(
        r#"
        SELECT
            COUNT(*),
            COUNT(*) FILTER (WHERE final_video_path IS NOT NULL)
        FROM scenes
        WHERE project_id = ?
        "#,
    )
    .bind(project_id)
    .fetch_one(pool)
    .await?;
    Ok(counts)
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
    async fn test_scene_insert_idempotent() {
        let (pool, project_id) = setup().await;
        let a = insert_scene(&pool, project_id, 1, "Opening", None, None, None, None)
            .await
            .unwrap();
        let b = insert_scene(&pool, project_id, 1, "Opening again", None, None, None, None)
            .await
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(scene_count(&pool, project_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_shot_counts_track_assignment_and_completion() {
        let (pool, project_id) = setup().await;
        let scene_id = insert_scene(&pool, project_id, 1, "Opening", None, None, None, None)
            .await
            .unwrap();
        insert_shot(&pool, scene_id, 1, "wide", None, None, Some("exterior"), None, 3.0)
            .await
            .unwrap();
        insert_shot(&pool, scene_id, 2, "close", None, None, Some("face"), None, 2.0)
            .await
            .unwrap();

        let (total, missing, completed) = shot_counts(&pool, project_id).await.unwrap();
        assert_eq!((total, missing, completed), (2, 2, 0));

        let shots = shots_missing_source(&pool, project_id).await.unwrap();
        assign_shot_sources(&pool, &[(shots[0].id, "/media/a.png".to_string())])
            .await
            .unwrap();
        let (_, missing, _) = shot_counts(&pool, project_id).await.unwrap();
        assert_eq!(missing, 1);

        set_shot_video(&pool, shots[0].id, "/media/a.mp4", "completed")
            .await
            .unwrap();
        let (_, _, completed) = shot_counts(&pool, project_id).await.unwrap();
        assert_eq!(completed, 1);
    }

    #[tokio::test]
    async fn test_next_unrendered_scene_ordering() {
        let (pool, project_id) = setup().await;
        let first = insert_scene(&pool, project_id, 1, "One", None, None, None, None)
            .await
            .unwrap();
        insert_scene(&pool, project_id, 2, "Two", None, None, None, None)
            .await
            .unwrap();

        let next = next_unrendered_scene(&pool, project_id).await.unwrap().unwrap();
        assert_eq!(next.id, first);

        set_scene_video(&pool, first, "/media/s1.mp4").await.unwrap();
        let next = next_unrendered_scene(&pool, project_id).await.unwrap().unwrap();
        assert_eq!(next.scene_number, 2);
    }
}
