//! Audit log: every autonomous decision, with reasoning and confidence.
//!
//! Writes never block the decision path. `record` spawns the insert and
//! drops failures after logging them; `record_now` awaits, for call sites
//! that need the row before acting (and for tests).

use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::models::AuditDecision;
use crate::pool::DbPool;

/// A decision about to be persisted.
#[derive(Debug, Clone)]
pub struct Decision {
    pub decision_type: String,
    pub character_slug: Option<String>,
    pub project_name: Option<String>,
    pub input_context: Value,
    pub decision_made: String,
    pub confidence_score: f64,
    pub reasoning: String,
}

impl Decision {
    pub fn new(decision_type: impl Into<String>) -> Self {
        Decision {
            decision_type: decision_type.into(),
            character_slug: None,
            project_name: None,
            input_context: Value::Null,
            decision_made: String::new(),
            confidence_score: 0.0,
            reasoning: String::new(),
        }
    }

    pub fn character(mut self, slug: impl Into<String>) -> Self {
        self.character_slug = Some(slug.into());
        self
    }

    pub fn project(mut self, name: impl Into<String>) -> Self {
        self.project_name = Some(name.into());
        self
    }

    pub fn context(mut self, context: Value) -> Self {
        self.input_context = context;
        self
    }

    pub fn made(mut self, verdict: impl Into<String>) -> Self {
        self.decision_made = verdict.into();
        self
    }

    pub fn confidence(mut self, score: f64) -> Self {
        self.confidence_score = score.clamp(0.0, 1.0);
        self
    }

    pub fn reason(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = reasoning.into();
        self
    }
}

/// Audit writer bound to the shared pool.
#[derive(Debug, Clone)]
pub struct AuditLog {
    pool: DbPool,
}

impl AuditLog {
    pub fn new(pool: DbPool) -> Self {
        AuditLog { pool }
    }

    /// Fire-and-forget write. Failures are logged and dropped.
    pub fn record(&self, decision: Decision) {
        let pool = self.pool.clone();
        tokio::spawn(async move {
            if let Err(e) = insert_decision(&pool, &decision).await {
                warn!(
                    "Failed to record audit decision '{}': {}",
                    decision.decision_type, e
                );
            }
        });
    }

    /// Awaited write, returning the correlation id.
    pub async fn record_now(&self, decision: Decision) -> Result<String> {
        insert_decision(&self.pool, &decision).await
    }

    /// Mark an earlier decision's outcome (`ok` / `failed`).
    pub async fn set_outcome(&self, correlation_id: &str, outcome: &str) -> Result<()> {
        sqlx::query("UPDATE autonomy_decisions SET outcome = ? WHERE correlation_id = ?")
            .bind(outcome)
            .bind(correlation_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn recent(&self, limit: i64) -> Result<Vec<AuditDecision>> {
        let decisions =
            sqlx::query_as("SELECT * FROM autonomy_decisions ORDER BY id DESC LIMIT ?")
                .bind(limit)
                .fetch_all(&self.pool)
                .await?;
        Ok(decisions)
    }
}

async fn insert_decision(pool: &DbPool, decision: &Decision) -> Result<String> {
    let correlation_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    sqlx::query(
        r#"
        INSERT INTO autonomy_decisions
            (decision_type, character_slug, project_name, input_context,
             decision_made, confidence_score, reasoning, outcome, correlation_id, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?)
        "#,
    )
    .bind(&decision.decision_type)
    .bind(&decision.character_slug)
    .bind(&decision.project_name)
    .bind(decision.input_context.to_string())
    .bind(&decision.decision_made)
    .bind(decision.confidence_score)
    .bind(&decision.reasoning)
    .bind(&correlation_id)
    .bind(&now)
    .execute(pool)
    .await?;
    Ok(correlation_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::run_migrations;
    use crate::pool::{create_pool, DbConfig};
    use serde_json::json;

    async fn setup() -> DbPool {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn test_record_now_and_outcome() {
        let pool = setup().await;
        let audit = AuditLog::new(pool);

        let correlation_id = audit
            .record_now(
                Decision::new("orchestrator_init")
                    .project("P1")
                    .context(json!({"characters": 2}))
                    .made("initialized_pipeline")
                    .confidence(1.0)
                    .reason("Bootstrapped 2 characters + 1 project phase"),
            )
            .await
            .unwrap();

        audit.set_outcome(&correlation_id, "ok").await.unwrap();

        let decisions = audit.recent(10).await.unwrap();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].decision_type, "orchestrator_init");
        assert_eq!(decisions[0].outcome, "ok");
        assert_eq!(decisions[0].confidence_score, 1.0);
    }

    #[tokio::test]
    async fn test_confidence_clamped() {
        let decision = Decision::new("auto_reject").confidence(3.0);
        assert_eq!(decision.confidence_score, 1.0);
    }
}
