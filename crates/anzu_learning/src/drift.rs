//! Quality drift detection.
//!
//! Compares each character's last `window` generations against its
//! historical average and flags significant drops.

use anyhow::Result;
use serde::Serialize;
use tracing::warn;

use anzu_db::DbPool;
use anzu_protocol::defaults::{
    DRIFT_ALERT_THRESHOLD, DRIFT_DELTA, DRIFT_WINDOW, MIN_CONFIDENCE_SAMPLES,
};

use crate::learning::round3;

#[derive(Debug, Clone, Serialize)]
pub struct DriftRow {
    pub character_slug: String,
    pub recent_avg: f64,
    pub overall_avg: f64,
    pub drift: f64,
    pub recent_count: i64,
    pub total_count: i64,
    pub alert: bool,
}

/// Detect characters whose recent quality is declining, most negative
/// drift first. Never raises.
pub async fn detect_drift(
    pool: &DbPool,
    character_slug: Option<&str>,
    project_name: Option<&str>,
    window: i64,
) -> Vec<DriftRow> {
    match detect_drift_inner(pool, character_slug, project_name, window).await {
        Ok(rows) => rows,
        Err(e) => {
            warn!("Drift detection failed: {}", e);
            Vec::new()
        }
    }
}

async fn detect_drift_inner(
    pool: &DbPool,
    character_slug: Option<&str>,
    project_name: Option<&str>,
    window: i64,
) -> Result<Vec<DriftRow>> {
    let window = if window > 0 { window } else { DRIFT_WINDOW };

    let scope = match (character_slug, project_name) {
        (Some(_), _) => "AND gh.character_slug = ?",
        (None, Some(_)) => "AND gh.project_name = ?",
        (None, None) => "",
    };

    let query = format!(
        r#"
        WITH recent AS (
            SELECT character_slug,
                   quality_score,
                   ROW_NUMBER() OVER (
                       PARTITION BY character_slug
                       ORDER BY generated_at DESC, id DESC
                   ) as rn
            FROM generation_history gh
            WHERE gh.quality_score IS NOT NULL
              AND gh.character_slug IS NOT NULL
              {}
        ),
        stats AS (
            SELECT
                character_slug,
                AVG(quality_score) FILTER (WHERE rn <= ?) as recent_avg,
                AVG(quality_score) as overall_avg,
                COUNT(*) FILTER (WHERE rn <= ?) as recent_count,
                COUNT(*) as total_count
            FROM recent
            GROUP BY character_slug
            HAVING COUNT(*) >= ?
        )
        SELECT character_slug, recent_avg, overall_avg, recent_count, total_count
        FROM stats
        WHERE recent_avg < overall_avg - ?
           OR recent_avg < ?
        ORDER BY (recent_avg - overall_avg) ASC
        "#,
        scope
    );

    let mut q = sqlx::query_as::<_, (String, f64, f64, i64, i64)>(&query);
    if let Some(slug) = character_slug {
        q = q.bind(slug);
    } else if let Some(project) = project_name {
        q = q.bind(project);
    }
    let rows = q
        .bind(window)
        .bind(window)
        .bind(MIN_CONFIDENCE_SAMPLES)
        .bind(DRIFT_DELTA)
        .bind(DRIFT_ALERT_THRESHOLD)
        .fetch_all(pool)
        .await?;

    Ok(rows
        .into_iter()
        .map(
            |(character_slug, recent_avg, overall_avg, recent_count, total_count)| DriftRow {
                character_slug,
                recent_avg: round3(recent_avg),
                overall_avg: round3(overall_avg),
                drift: round3(recent_avg - overall_avg),
                recent_count,
                total_count,
                alert: recent_avg < DRIFT_ALERT_THRESHOLD,
            },
        )
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anzu_test_utils::{seed_project, test_pool, SeedGeneration};

    #[tokio::test]
    async fn test_declining_character_flagged() {
        let pool = test_pool().await;
        seed_project(&pool, "P1", "luigi").await.unwrap();

        // Strong history, then a bad recent run.
        for _ in 0..20 {
            SeedGeneration::approved("luigi", "P1", 0.9)
                .aged(5)
                .insert(&pool)
                .await
                .unwrap();
        }
        for _ in 0..10 {
            SeedGeneration::rejected("luigi", "P1", 0.4)
                .insert(&pool)
                .await
                .unwrap();
        }

        let rows = detect_drift(&pool, None, Some("P1"), 10).await;
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.character_slug, "luigi");
        assert!(row.recent_avg < row.overall_avg - 0.1);
        assert!(row.drift < 0.0);
        assert!(row.alert, "recent 0.4 is under the alert threshold");
    }

    #[tokio::test]
    async fn test_stable_character_not_flagged() {
        let pool = test_pool().await;
        seed_project(&pool, "P1", "luigi").await.unwrap();
        for _ in 0..30 {
            SeedGeneration::approved("luigi", "P1", 0.85)
                .insert(&pool)
                .await
                .unwrap();
        }
        assert!(detect_drift(&pool, Some("luigi"), None, 10).await.is_empty());
    }

    #[tokio::test]
    async fn test_thin_history_ignored() {
        let pool = test_pool().await;
        seed_project(&pool, "P1", "luigi").await.unwrap();
        for _ in 0..3 {
            SeedGeneration::rejected("luigi", "P1", 0.2)
                .insert(&pool)
                .await
                .unwrap();
        }
        // Under MIN_CONFIDENCE_SAMPLES total: no verdict.
        assert!(detect_drift(&pool, Some("luigi"), None, 10).await.is_empty());
    }
}
