//! Production pipeline rows.
//!
//! The orchestrator is the only writer that inserts next-phase rows; every
//! insert here is an upsert on `(entity_type, entity_id, phase)` so
//! admission and advancement stay idempotent.

use anyhow::Result;
use chrono::Utc;

use anzu_protocol::types::{EntityType, Phase};

use crate::models::PipelineRow;
use crate::pool::DbPool;

/// Insert a pipeline row at `pending` if it does not already exist.
pub async fn upsert_row(
    pool: &DbPool,
    entity_type: EntityType,
    entity_id: &str,
    project_id: i64,
    phase: Phase,
) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    sqlx::query(
        r#"
        INSERT INTO production_pipeline
            (entity_type, entity_id, project_id, phase, status, created_at, updated_at)
        VALUES (?, ?, ?, ?, 'pending', ?, ?)
        ON CONFLICT (entity_type, entity_id, phase) DO NOTHING
        "#,
    )
    .bind(entity_type.as_str())
    .bind(entity_id)
    .bind(project_id)
    .bind(phase.as_str())
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_row(
    pool: &DbPool,
    entity_type: EntityType,
    entity_id: &str,
    phase: Phase,
) -> Result<Option<PipelineRow>> {
    let row = sqlx::query_as(
        "SELECT * FROM production_pipeline WHERE entity_type = ? AND entity_id = ? AND phase = ?",
    )
    .bind(entity_type.as_str())
    .bind(entity_id)
    .bind(phase.as_str())
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// All rows the tick loop re-evaluates, characters before their project row
/// so a project's block clears on the same pass its last character
/// completes.
pub async fn open_rows(pool: &DbPool) -> Result<Vec<PipelineRow>> {
    let rows = sqlx::query_as(
        r#"
        SELECT * FROM production_pipeline
        WHERE status NOT IN ('completed', 'skipped')
        ORDER BY project_id, entity_type, phase
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn rows_for_project(pool: &DbPool, project_id: i64) -> Result<Vec<PipelineRow>> {
    let rows = sqlx::query_as(
        r#"
        SELECT * FROM production_pipeline
        WHERE project_id = ?
        ORDER BY entity_type DESC, entity_id, phase
        "#,
    )
    .bind(project_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// True once every character in the project has reached its `ready` row
/// (rows for earlier phases all completed) and at least one character row
/// exists.
pub async fn all_characters_ready(pool: &DbPool, project_id: i64) -> Result<bool> {
    let not_ready: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM production_pipeline
        WHERE project_id = ?
          AND entity_type = 'character'
          AND phase != 'ready'
          AND status != 'completed'
        "#,
    )
    .bind(project_id)
    .fetch_one(pool)
    .await?;

    let total: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM production_pipeline WHERE project_id = ? AND entity_type = 'character'",
    )
    .bind(project_id)
    .fetch_one(pool)
    .await?;

    Ok(total > 0 && not_ready == 0)
}

pub async fn set_blocked(pool: &DbPool, row_id: i64, reason: &str) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    sqlx::query(
        r#"
        UPDATE production_pipeline
        SET status = 'blocked', blocked_reason = ?, last_checked_at = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(reason)
    .bind(&now)
    .bind(&now)
    .bind(row_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn clear_blocked(pool: &DbPool, row_id: i64) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    sqlx::query(
        r#"
        UPDATE production_pipeline
        SET status = 'pending', blocked_reason = NULL, last_checked_at = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&now)
    .bind(&now)
    .bind(row_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Persist a gate check outcome against the row.
pub async fn record_gate_check(pool: &DbPool, row_id: i64, gate_json: &str) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    sqlx::query(
        r#"
        UPDATE production_pipeline
        SET last_checked_at = ?, gate_check_result = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&now)
    .bind(gate_json)
    .bind(&now)
    .bind(row_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Mark a row active, stamping `started_at` only on the first transition.
pub async fn set_active(pool: &DbPool, row_id: i64) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    sqlx::query(
        r#"
        UPDATE production_pipeline
        SET status = 'active', started_at = COALESCE(started_at, ?), updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&now)
    .bind(&now)
    .bind(row_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Complete a row. Returns false when the row was already completed, which
/// makes double-advancement a no-op.
pub async fn complete_row(pool: &DbPool, row_id: i64) -> Result<bool> {
    let now = Utc::now().to_rfc3339();
    let affected = sqlx::query(
        r#"
        UPDATE production_pipeline
        SET status = 'completed', completed_at = ?, updated_at = ?
        WHERE id = ? AND status != 'completed'
        "#,
    )
    .bind(&now)
    .bind(&now)
    .bind(row_id)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(affected > 0)
}

/// Mark the row failed with a truncated reason. Matched by key rather than
/// id because the failing worker may outlive a reset row.
pub async fn fail_row(
    pool: &DbPool,
    entity_type: EntityType,
    entity_id: &str,
    phase: Phase,
    reason: &str,
) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    sqlx::query(
        r#"
        UPDATE production_pipeline
        SET status = 'failed', blocked_reason = ?, updated_at = ?
        WHERE entity_type = ? AND entity_id = ? AND phase = ?
        "#,
    )
    .bind(reason)
    .bind(&now)
    .bind(entity_type.as_str())
    .bind(entity_id)
    .bind(phase.as_str())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn reset_row(pool: &DbPool, row_id: i64) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    sqlx::query(
        r#"
        UPDATE production_pipeline
        SET status = 'pending', started_at = NULL, completed_at = NULL,
            blocked_reason = NULL, gate_check_result = NULL, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&now)
    .bind(row_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn skip_row(pool: &DbPool, row_id: i64) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    sqlx::query("UPDATE production_pipeline SET status = 'skipped', updated_at = ? WHERE id = ?")
        .bind(&now)
        .bind(row_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Update progress counters on an open row for the given key.
pub async fn set_progress(
    pool: &DbPool,
    entity_type: EntityType,
    entity_id: &str,
    phase: Phase,
    current: i64,
    target: i64,
) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    sqlx::query(
        r#"
        UPDATE production_pipeline
        SET progress_current = ?, progress_target = ?, updated_at = ?
        WHERE entity_type = ? AND entity_id = ? AND phase = ?
          AND status NOT IN ('completed', 'skipped')
        "#,
    )
    .bind(current)
    .bind(target)
    .bind(&now)
    .bind(entity_type.as_str())
    .bind(entity_id)
    .bind(phase.as_str())
    .execute(pool)
    .await?;
    Ok(())
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
    async fn test_upsert_is_idempotent() {
        let pool = setup().await;
        upsert_row(&pool, EntityType::Character, "luigi", 1, Phase::TrainingData)
            .await
            .unwrap();
        upsert_row(&pool, EntityType::Character, "luigi", 1, Phase::TrainingData)
            .await
            .unwrap();

        let rows = open_rows(&pool).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_complete_row_second_call_is_noop() {
        let pool = setup().await;
        upsert_row(&pool, EntityType::Character, "luigi", 1, Phase::TrainingData)
            .await
            .unwrap();
        let row = get_row(&pool, EntityType::Character, "luigi", Phase::TrainingData)
            .await
            .unwrap()
            .unwrap();

        assert!(complete_row(&pool, row.id).await.unwrap());
        assert!(!complete_row(&pool, row.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_all_characters_ready_requires_ready_rows() {
        let pool = setup().await;
        assert!(!all_characters_ready(&pool, 1).await.unwrap());

        upsert_row(&pool, EntityType::Character, "luigi", 1, Phase::TrainingData)
            .await
            .unwrap();
        assert!(!all_characters_ready(&pool, 1).await.unwrap());

        let row = get_row(&pool, EntityType::Character, "luigi", Phase::TrainingData)
            .await
            .unwrap()
            .unwrap();
        complete_row(&pool, row.id).await.unwrap();
        upsert_row(&pool, EntityType::Character, "luigi", 1, Phase::LoraTraining)
            .await
            .unwrap();
        assert!(!all_characters_ready(&pool, 1).await.unwrap());

        let row = get_row(&pool, EntityType::Character, "luigi", Phase::LoraTraining)
            .await
            .unwrap()
            .unwrap();
        complete_row(&pool, row.id).await.unwrap();
        upsert_row(&pool, EntityType::Character, "luigi", 1, Phase::Ready)
            .await
            .unwrap();
        // A pending `ready` row counts: the character has reached the phase.
        assert!(all_characters_ready(&pool, 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_blocked_round_trip() {
        let pool = setup().await;
        upsert_row(&pool, EntityType::Project, "1", 1, Phase::ScenePlanning)
            .await
            .unwrap();
        let row = get_row(&pool, EntityType::Project, "1", Phase::ScenePlanning)
            .await
            .unwrap()
            .unwrap();

        set_blocked(&pool, row.id, "Waiting for all character LoRAs")
            .await
            .unwrap();
        let row = get_row(&pool, EntityType::Project, "1", Phase::ScenePlanning)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, "blocked");
        assert_eq!(
            row.blocked_reason.as_deref(),
            Some("Waiting for all character LoRAs")
        );

        clear_blocked(&pool, row.id).await.unwrap();
        let row = get_row(&pool, EntityType::Project, "1", Phase::ScenePlanning)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, "pending");
        assert!(row.blocked_reason.is_none());
    }
}
