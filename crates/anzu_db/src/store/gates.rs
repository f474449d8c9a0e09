//! Quality gate thresholds, mutable at runtime via the operator surface.

use anyhow::Result;

use anzu_protocol::defaults::{DEFAULT_AUTO_APPROVE_THRESHOLD, DEFAULT_AUTO_REJECT_THRESHOLD};
use anzu_protocol::types::GateType;

use crate::models::QualityGate;
use crate::pool::DbPool;

pub async fn list_gates(pool: &DbPool) -> Result<Vec<QualityGate>> {
    let gates = sqlx::query_as("SELECT * FROM quality_gates ORDER BY name")
        .fetch_all(pool)
        .await?;
    Ok(gates)
}

pub async fn get_gate(pool: &DbPool, name: &str) -> Result<Option<QualityGate>> {
    let gate = sqlx::query_as("SELECT * FROM quality_gates WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await?;
    Ok(gate)
}

pub async fn set_gate(pool: &DbPool, name: &str, threshold: f64, active: bool) -> Result<bool> {
    let affected = sqlx::query("UPDATE quality_gates SET threshold = ?, active = ? WHERE name = ?")
        .bind(threshold)
        .bind(active)
        .bind(name)
        .execute(pool)
        .await?
        .rows_affected();
    Ok(affected > 0)
}

/// Active threshold for a gate type, falling back to the built-in default
/// when the row is missing or deactivated.
pub async fn active_threshold(pool: &DbPool, gate_type: GateType) -> Result<f64> {
    let row: Option<(f64, bool)> =
        sqlx::query_as("SELECT threshold, active FROM quality_gates WHERE gate_type = ? LIMIT 1")
            .bind(gate_type.as_str())
            .fetch_optional(pool)
            .await?;

    let default = match gate_type {
        GateType::AutoReject => DEFAULT_AUTO_REJECT_THRESHOLD,
        GateType::AutoApprove => DEFAULT_AUTO_APPROVE_THRESHOLD,
        GateType::OverallConsistency => 0.75,
        GateType::FaceSimilarity => 0.7,
    };

    Ok(match row {
        Some((threshold, true)) => threshold,
        _ => default,
    })
}
