//! Bootstrap migration.
//!
//! Runs at startup and is idempotent: every table is `CREATE ... IF NOT
//! EXISTS`, every later `ADD COLUMN` is guarded against the duplicate-column
//! error. Schema evolution is additive only.
//!
//! Migration failure must not prevent startup; the caller logs the error and
//! surfaces it through health reporting.

use tracing::{info, warn};

use crate::pool::DbPool;

/// All base tables, in dependency order.
const BOOTSTRAP: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS projects (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        genre TEXT,
        premise TEXT,
        content_rating TEXT,
        default_style TEXT,
        status TEXT NOT NULL DEFAULT 'active',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS characters (
        id INTEGER PRIMARY KEY,
        project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
        slug TEXT NOT NULL,
        name TEXT NOT NULL,
        design_prompt TEXT,
        appearance TEXT,
        voice_profile TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (project_id, slug)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS generation_styles (
        name TEXT PRIMARY KEY,
        checkpoint_model TEXT NOT NULL,
        cfg_scale REAL NOT NULL,
        steps INTEGER NOT NULL,
        sampler TEXT NOT NULL,
        scheduler TEXT NOT NULL,
        width INTEGER NOT NULL,
        height INTEGER NOT NULL,
        positive_template TEXT NOT NULL DEFAULT '',
        negative_template TEXT NOT NULL DEFAULT '',
        architecture TEXT NOT NULL DEFAULT 'sd15',
        prompt_format TEXT NOT NULL DEFAULT 'tags'
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS world_settings (
        id INTEGER PRIMARY KEY,
        project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
        category TEXT NOT NULL,
        name TEXT NOT NULL,
        description TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS storyline_versions (
        id INTEGER PRIMARY KEY,
        project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
        version INTEGER NOT NULL,
        content TEXT NOT NULL,
        author TEXT,
        created_at TEXT NOT NULL,
        UNIQUE (project_id, version)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS style_history (
        id INTEGER PRIMARY KEY,
        project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
        style_name TEXT NOT NULL,
        checkpoint_model TEXT,
        applied_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS scenes (
        id INTEGER PRIMARY KEY,
        project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
        scene_number INTEGER NOT NULL,
        title TEXT NOT NULL,
        description TEXT,
        location TEXT,
        time_of_day TEXT,
        mood TEXT,
        final_video_path TEXT,
        created_at TEXT NOT NULL,
        UNIQUE (project_id, scene_number)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS shots (
        id INTEGER PRIMARY KEY,
        scene_id INTEGER NOT NULL REFERENCES scenes(id) ON DELETE CASCADE,
        shot_number INTEGER NOT NULL,
        shot_type TEXT NOT NULL DEFAULT 'medium',
        camera_angle TEXT,
        characters_present TEXT,
        generation_prompt TEXT,
        motion_prompt TEXT,
        duration_seconds REAL NOT NULL DEFAULT 3.0,
        source_image_path TEXT,
        output_video_path TEXT,
        status TEXT NOT NULL DEFAULT 'pending',
        UNIQUE (scene_id, shot_number)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS episodes (
        id INTEGER PRIMARY KEY,
        project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
        episode_number INTEGER NOT NULL,
        title TEXT NOT NULL,
        final_video_path TEXT,
        thumbnail_path TEXT,
        status TEXT NOT NULL DEFAULT 'draft',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (project_id, episode_number)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS episode_scenes (
        episode_id INTEGER NOT NULL REFERENCES episodes(id) ON DELETE CASCADE,
        scene_id INTEGER NOT NULL REFERENCES scenes(id) ON DELETE CASCADE,
        position INTEGER NOT NULL,
        transition TEXT,
        PRIMARY KEY (episode_id, scene_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS generation_history (
        id INTEGER PRIMARY KEY,
        character_slug TEXT,
        project_name TEXT,
        kind TEXT NOT NULL DEFAULT 'image',
        backend_job_id TEXT,
        checkpoint_model TEXT,
        cfg_scale REAL,
        steps INTEGER,
        sampler TEXT,
        scheduler TEXT,
        width INTEGER,
        height INTEGER,
        seed INTEGER,
        output_path TEXT,
        quality_score REAL,
        character_match_score REAL,
        clarity_score REAL,
        training_value REAL,
        solo INTEGER NOT NULL DEFAULT 1,
        species_verified INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'pending',
        correction_of INTEGER REFERENCES generation_history(id),
        generation_time_ms INTEGER,
        generated_at TEXT NOT NULL,
        reviewed_at TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS rejections (
        id INTEGER PRIMARY KEY,
        generation_id INTEGER NOT NULL REFERENCES generation_history(id) ON DELETE CASCADE,
        character_slug TEXT NOT NULL,
        feedback TEXT,
        negative_additions TEXT,
        review_source TEXT NOT NULL DEFAULT 'vision',
        quality_score REAL,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS rejection_categories (
        rejection_id INTEGER NOT NULL REFERENCES rejections(id) ON DELETE CASCADE,
        category TEXT NOT NULL,
        PRIMARY KEY (rejection_id, category)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS approvals (
        id INTEGER PRIMARY KEY,
        generation_id INTEGER NOT NULL REFERENCES generation_history(id) ON DELETE CASCADE,
        character_slug TEXT NOT NULL,
        auto_approved INTEGER NOT NULL DEFAULT 0,
        vision_review TEXT,
        quality_score REAL,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS learned_patterns (
        id INTEGER PRIMARY KEY,
        character_slug TEXT NOT NULL,
        project_name TEXT,
        pattern_type TEXT NOT NULL,
        checkpoint_model TEXT NOT NULL DEFAULT '',
        quality_score_avg REAL,
        frequency INTEGER NOT NULL DEFAULT 1,
        cfg_range_min REAL,
        cfg_range_max REAL,
        steps_range_min INTEGER,
        steps_range_max INTEGER,
        updated_at TEXT NOT NULL,
        UNIQUE (character_slug, pattern_type, checkpoint_model)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS quality_gates (
        name TEXT PRIMARY KEY,
        gate_type TEXT NOT NULL,
        threshold REAL NOT NULL,
        active INTEGER NOT NULL DEFAULT 1
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS production_pipeline (
        id INTEGER PRIMARY KEY,
        entity_type TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        project_id INTEGER NOT NULL,
        phase TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        progress_current INTEGER,
        progress_target INTEGER,
        last_checked_at TEXT,
        started_at TEXT,
        completed_at TEXT,
        blocked_reason TEXT,
        gate_check_result TEXT,
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
        updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
        UNIQUE (entity_type, entity_id, phase)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS autonomy_decisions (
        id INTEGER PRIMARY KEY,
        decision_type TEXT NOT NULL,
        character_slug TEXT,
        project_name TEXT,
        input_context TEXT,
        decision_made TEXT NOT NULL,
        confidence_score REAL NOT NULL,
        reasoning TEXT NOT NULL,
        outcome TEXT NOT NULL DEFAULT 'pending',
        correlation_id TEXT,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_generation_history_slug
        ON generation_history(character_slug, status)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_generation_history_project
        ON generation_history(project_name, generated_at)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_pipeline_project
        ON production_pipeline(project_id, entity_type, phase)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_decisions_created
        ON autonomy_decisions(created_at)
    "#,
];

/// Columns added after the initial release. Guarded individually so the
/// migration stays idempotent on databases that already have them.
const ADDITIVE_COLUMNS: &[&str] = &[
    "ALTER TABLE generation_history ADD COLUMN correction_of INTEGER REFERENCES generation_history(id)",
    "ALTER TABLE generation_history ADD COLUMN generation_time_ms INTEGER",
    "ALTER TABLE shots ADD COLUMN output_video_path TEXT",
    "ALTER TABLE episodes ADD COLUMN thumbnail_path TEXT",
    "ALTER TABLE autonomy_decisions ADD COLUMN correlation_id TEXT",
];

/// Default quality gates, seeded once.
const GATE_SEEDS: &[&str] = &[
    "INSERT INTO quality_gates (name, gate_type, threshold, active)
     VALUES ('auto_reject', 'auto_reject', 0.4, 1)
     ON CONFLICT (name) DO NOTHING",
    "INSERT INTO quality_gates (name, gate_type, threshold, active)
     VALUES ('auto_approve', 'auto_approve', 0.8, 1)
     ON CONFLICT (name) DO NOTHING",
    "INSERT INTO quality_gates (name, gate_type, threshold, active)
     VALUES ('overall_consistency', 'overall_consistency', 0.75, 1)
     ON CONFLICT (name) DO NOTHING",
    "INSERT INTO quality_gates (name, gate_type, threshold, active)
     VALUES ('face_similarity', 'face_similarity', 0.7, 1)
     ON CONFLICT (name) DO NOTHING",
];

/// Run the idempotent bootstrap migration.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::Error> {
    for statement in BOOTSTRAP {
        sqlx::query(statement).execute(pool).await?;
    }

    for statement in ADDITIVE_COLUMNS {
        if let Err(e) = sqlx::query(statement).execute(pool).await {
            if is_duplicate_column(&e) {
                continue;
            }
            return Err(e);
        }
    }

    for statement in GATE_SEEDS {
        sqlx::query(statement).execute(pool).await?;
    }

    info!("Database bootstrap migration complete");
    Ok(())
}

/// Run migrations without letting failure propagate; returns the error
/// string for health reporting.
pub async fn run_migrations_non_fatal(pool: &DbPool) -> Option<String> {
    match run_migrations(pool).await {
        Ok(()) => None,
        Err(e) => {
            warn!("Bootstrap migration failed (continuing degraded): {}", e);
            Some(e.to_string())
        }
    }
}

fn is_duplicate_column(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => db.message().contains("duplicate column"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{create_pool, DbConfig};

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        run_migrations(&pool).await.unwrap();
        // Second run must not error on existing tables, columns or seeds.
        run_migrations(&pool).await.unwrap();

        let gates: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM quality_gates")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(gates, 4);
    }
}
