//! Control Plane API for the director.
//!
//! Provides a ZMQ-based API for UI/CLI to query and mutate director state
//! without direct database access. This enables concurrent access while
//! the daemon is running.
//!
//! # Protocol
//!
//! Uses a ZMQ REP socket with JSON request/response envelopes:
//! - Request: JSON-encoded `ControlEnvelope` (optional bearer token +
//!   `ControlRequest`)
//! - Response: JSON-encoded `ControlResponse`

use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};
use zeromq::{Socket, SocketRecv, SocketSend, ZmqMessage};

use anzu_learning as learning;
use anzu_protocol::types::{EntityType, OverrideAction, Phase};
use anzu_protocol::{ErrorEnvelope, ErrorKind};
use anzu_security::Gatekeeper;

use crate::context::Director;

/// Control API request envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlEnvelope {
    /// Bearer token; required when the daemon has a JWT secret configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(flatten)]
    pub request: ControlRequest,
}

/// Control API operations, one per operator-surface endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ControlRequest {
    /// Ping/health check
    Ping,
    Health,
    Toggle {
        enabled: bool,
    },
    Initialize {
        project_id: i64,
        training_target: Option<i64>,
    },
    Pipeline {
        project_id: i64,
    },
    Summary {
        project_id: i64,
    },
    Tick,
    Override {
        entity_type: String,
        entity_id: String,
        phase: String,
        action: String,
    },
    SetTrainingTarget {
        target: i64,
    },
    ReplenishmentStatus,
    ReplenishmentToggle {
        enabled: bool,
    },
    ReplenishmentTarget {
        target: i64,
        character: Option<String>,
    },
    ReplenishmentReadiness,
    LearningStats,
    SuggestParams {
        character_slug: String,
    },
    RecommendParams {
        character_slug: String,
        project_name: Option<String>,
        checkpoint_model: Option<String>,
    },
    RejectionPatterns {
        character_slug: String,
        limit: Option<i64>,
    },
    CheckpointRankings {
        project_name: String,
    },
    QualityTrend {
        character_slug: Option<String>,
        project_name: Option<String>,
        days: Option<i64>,
    },
    DriftReport {
        character_slug: Option<String>,
        project_name: Option<String>,
        window: Option<i64>,
    },
    CharacterQuality {
        project_name: String,
    },
    ListGates,
    SetGate {
        name: String,
        threshold: f64,
        active: bool,
    },
    CorrectionStats,
    CorrectionToggle {
        enabled: bool,
    },
    EventStats,
    GpuStatus,
    /// Drop the character->project cache after an operator mutation of
    /// projects, characters, styles or world settings.
    InvalidateCache,
}

/// Control API response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ControlResponse {
    Pong,
    Health {
        healthy: bool,
        migration_error: Option<String>,
        orchestrator_enabled: bool,
        replenishment_enabled: bool,
        correction_enabled: bool,
    },
    Json(Value),
    Summary(String),
    Error {
        error_kind: ErrorKind,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
    },
}

impl ControlResponse {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        ControlResponse::Error {
            error_kind: kind,
            message: message.into(),
            correlation_id: None,
        }
    }

    fn from_anyhow(e: anyhow::Error) -> Self {
        // Typed envelopes carry their own kind; everything else is
        // internal.
        match e.downcast_ref::<ErrorEnvelope>() {
            Some(envelope) => ControlResponse::Error {
                error_kind: envelope.error_kind,
                message: envelope.message.clone(),
                correlation_id: envelope.correlation_id.clone(),
            },
            None => ControlResponse::error(ErrorKind::Catastrophic, format!("{:#}", e)),
        }
    }
}

/// Execute one control request against the director.
pub async fn handle_control_request(
    director: &Arc<Director>,
    request: ControlRequest,
) -> ControlResponse {
    match request {
        ControlRequest::Ping => ControlResponse::Pong,
        ControlRequest::Health => ControlResponse::Health {
            healthy: director.migration_error.is_none(),
            migration_error: director.migration_error.clone(),
            orchestrator_enabled: director.is_enabled(),
            replenishment_enabled: director.replenishment_enabled(),
            correction_enabled: director.correction_enabled(),
        },
        ControlRequest::Toggle { enabled } => {
            director.enable(enabled);
            ControlResponse::Json(json!({ "enabled": enabled }))
        }
        ControlRequest::Initialize {
            project_id,
            training_target,
        } => match director.initialize_project(project_id, training_target).await {
            Ok(value) => ControlResponse::Json(value),
            Err(e) => ControlResponse::from_anyhow(e),
        },
        ControlRequest::Pipeline { project_id } => {
            match director.pipeline_status(project_id).await {
                Ok(value) => ControlResponse::Json(value),
                Err(e) => ControlResponse::from_anyhow(e),
            }
        }
        ControlRequest::Summary { project_id } => {
            match director.pipeline_summary(project_id).await {
                Ok(summary) => ControlResponse::Summary(summary),
                Err(e) => ControlResponse::from_anyhow(e),
            }
        }
        ControlRequest::Tick => match director.tick().await {
            Ok(value) => ControlResponse::Json(value),
            Err(e) => ControlResponse::from_anyhow(e),
        },
        ControlRequest::Override {
            entity_type,
            entity_id,
            phase,
            action,
        } => {
            let parsed: Result<(EntityType, Phase, OverrideAction), String> = (|| {
                Ok((
                    EntityType::from_str(&entity_type)?,
                    Phase::from_str(&phase)?,
                    OverrideAction::from_str(&action)?,
                ))
            })();
            match parsed {
                Ok((entity_type, phase, action)) => {
                    match director
                        .override_phase(entity_type, &entity_id, phase, action)
                        .await
                    {
                        Ok(value) => ControlResponse::Json(value),
                        Err(e) => ControlResponse::from_anyhow(e),
                    }
                }
                Err(message) => ControlResponse::error(ErrorKind::Validation, message),
            }
        }
        ControlRequest::SetTrainingTarget { target } => {
            director.set_training_target(target);
            ControlResponse::Json(json!({ "training_target": director.training_target() }))
        }
        ControlRequest::ReplenishmentStatus => {
            ControlResponse::Json(director.replenishment_status().await)
        }
        ControlRequest::ReplenishmentToggle { enabled } => {
            director.enable_replenishment(enabled);
            ControlResponse::Json(json!({ "enabled": enabled }))
        }
        ControlRequest::ReplenishmentTarget { target, character } => {
            director
                .set_replenishment_target(target, character.as_deref())
                .await;
            ControlResponse::Json(json!({ "target": target, "character": character }))
        }
        ControlRequest::ReplenishmentReadiness => {
            match director.replenishment_readiness().await {
                Ok(value) => ControlResponse::Json(value),
                Err(e) => ControlResponse::from_anyhow(e),
            }
        }
        ControlRequest::LearningStats => {
            ControlResponse::Json(learning::learning_stats(&director.pool).await)
        }
        ControlRequest::SuggestParams { character_slug } => match parse_slug(&character_slug) {
            Ok(slug) => ControlResponse::Json(
                learning::suggest_params(&director.pool, slug.as_str()).await,
            ),
            Err(response) => response,
        },
        ControlRequest::RecommendParams {
            character_slug,
            project_name,
            checkpoint_model,
        } => match parse_slug(&character_slug) {
            Ok(slug) => {
                // Callers may omit the project; the cached character map
                // resolves it so checkpoint rankings still apply.
                let project_name = match project_name {
                    Some(name) => Some(name),
                    None => director
                        .char_cache
                        .project_for(&director.pool, slug.as_str())
                        .await
                        .ok()
                        .flatten(),
                };
                let rec = learning::recommend_params(
                    &director.pool,
                    slug.as_str(),
                    project_name.as_deref(),
                    checkpoint_model.as_deref(),
                )
                .await;
                match serde_json::to_value(&rec) {
                    Ok(value) => ControlResponse::Json(value),
                    Err(e) => ControlResponse::error(ErrorKind::Catastrophic, e.to_string()),
                }
            }
            Err(response) => response,
        },
        ControlRequest::RejectionPatterns {
            character_slug,
            limit,
        } => match parse_slug(&character_slug) {
            Ok(slug) => ControlResponse::Json(Value::Array(
                learning::rejection_patterns(&director.pool, slug.as_str(), limit.unwrap_or(10))
                    .await,
            )),
            Err(response) => response,
        },
        ControlRequest::CheckpointRankings { project_name } => ControlResponse::Json(
            Value::Array(learning::checkpoint_rankings(&director.pool, &project_name).await),
        ),
        ControlRequest::QualityTrend {
            character_slug,
            project_name,
            days,
        } => ControlResponse::Json(Value::Array(
            learning::quality_trend(
                &director.pool,
                character_slug.as_deref(),
                project_name.as_deref(),
                days.unwrap_or(7),
            )
            .await,
        )),
        ControlRequest::DriftReport {
            character_slug,
            project_name,
            window,
        } => {
            let rows = learning::detect_drift(
                &director.pool,
                character_slug.as_deref(),
                project_name.as_deref(),
                window.unwrap_or(anzu_protocol::defaults::DRIFT_WINDOW),
            )
            .await;
            match serde_json::to_value(&rows) {
                Ok(value) => ControlResponse::Json(value),
                Err(e) => ControlResponse::error(ErrorKind::Catastrophic, e.to_string()),
            }
        }
        ControlRequest::CharacterQuality { project_name } => ControlResponse::Json(Value::Array(
            learning::character_quality_summary(&director.pool, &project_name).await,
        )),
        ControlRequest::ListGates => {
            match anzu_db::store::gates::list_gates(&director.pool).await {
                Ok(gates) => match serde_json::to_value(&gates) {
                    Ok(value) => ControlResponse::Json(value),
                    Err(e) => ControlResponse::error(ErrorKind::Catastrophic, e.to_string()),
                },
                Err(e) => ControlResponse::from_anyhow(e),
            }
        }
        ControlRequest::SetGate {
            name,
            threshold,
            active,
        } => match anzu_db::store::gates::set_gate(&director.pool, &name, threshold, active).await
        {
            Ok(true) => ControlResponse::Json(json!({
                "name": name, "threshold": threshold, "active": active
            })),
            Ok(false) => {
                ControlResponse::error(ErrorKind::Validation, format!("unknown gate: {}", name))
            }
            Err(e) => ControlResponse::from_anyhow(e),
        },
        ControlRequest::CorrectionStats => match director.correction_stats().await {
            Ok(value) => ControlResponse::Json(value),
            Err(e) => ControlResponse::from_anyhow(e),
        },
        ControlRequest::CorrectionToggle { enabled } => {
            director.enable_correction(enabled);
            ControlResponse::Json(json!({ "enabled": enabled }))
        }
        ControlRequest::EventStats => match serde_json::to_value(director.bus.stats()) {
            Ok(value) => ControlResponse::Json(value),
            Err(e) => ControlResponse::error(ErrorKind::Catastrophic, e.to_string()),
        },
        ControlRequest::GpuStatus => ControlResponse::Json(director.gpu.system_status().await),
        ControlRequest::InvalidateCache => {
            director.char_cache.invalidate().await;
            ControlResponse::Json(json!({ "invalidated": true }))
        }
    }
}

/// Serve the control API until shutdown. One REP socket, one request at a
/// time.
pub async fn run_control_server(director: Arc<Director>, addr: String) -> anyhow::Result<()> {
    let mut socket = zeromq::RepSocket::new();
    socket.bind(&addr).await?;
    info!("Control API listening on {}", addr);

    let gatekeeper = Gatekeeper::new(
        director
            .config
            .trusted_subnet
            .as_deref()
            .and_then(|s| s.parse().ok()),
        director.config.jwt_secret.as_deref(),
    );
    let auth_required = director.config.jwt_secret.is_some();
    let mut shutdown = director.shutdown_rx.clone();

    loop {
        let message = tokio::select! {
            received = socket.recv() => received?,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Control API exiting");
                    return Ok(());
                }
                continue;
            }
        };

        let response = match decode_envelope(message) {
            Ok(envelope) => {
                let authorized = if auth_required
                    && !matches!(envelope.request, ControlRequest::Ping)
                {
                    gatekeeper.check(None, envelope.token.as_deref())
                } else {
                    Ok(anzu_security::AuthVerdict::TrustedSubnet)
                };
                match authorized {
                    Ok(_) => handle_control_request(&director, envelope.request).await,
                    Err(e) => {
                        warn!("Control request refused: {}", e);
                        ControlResponse::error(ErrorKind::Validation, e.to_string())
                    }
                }
            }
            Err(e) => ControlResponse::error(ErrorKind::Validation, e),
        };

        let reply = serde_json::to_vec(&response).unwrap_or_else(|e| {
            error!("Response serialization failed: {}", e);
            b"{\"type\":\"Error\"}".to_vec()
        });
        if let Err(e) = socket.send(ZmqMessage::from(reply)).await {
            error!("Control reply send failed: {}", e);
        }
    }
}

fn parse_slug(raw: &str) -> Result<anzu_protocol::types::CharacterSlug, ControlResponse> {
    raw.parse()
        .map_err(|e: String| ControlResponse::error(ErrorKind::Validation, e))
}

fn decode_envelope(message: ZmqMessage) -> Result<ControlEnvelope, String> {
    let frames: Vec<Vec<u8>> = message.into_vec().into_iter().map(|b| b.to_vec()).collect();
    let frame = frames
        .first()
        .ok_or_else(|| "empty control message".to_string())?;
    serde_json::from_slice(frame).map_err(|e| format!("unparseable control request: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let envelope = ControlEnvelope {
            token: None,
            request: ControlRequest::Initialize {
                project_id: 7,
                training_target: Some(25),
            },
        };
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("Initialize"));
        assert!(json.contains("25"));

        let parsed: ControlEnvelope = serde_json::from_str(&json).unwrap();
        match parsed.request {
            ControlRequest::Initialize {
                project_id,
                training_target,
            } => {
                assert_eq!(project_id, 7);
                assert_eq!(training_target, Some(25));
            }
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_response_serialization() {
        let resp = ControlResponse::error(ErrorKind::Validation, "unknown gate: foo");
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("Error"));
        assert!(json.contains("validation"));

        let parsed: ControlResponse = serde_json::from_str(&json).unwrap();
        match parsed {
            ControlResponse::Error {
                error_kind,
                message,
                ..
            } => {
                assert_eq!(error_kind, ErrorKind::Validation);
                assert!(message.contains("foo"));
            }
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_envelope_token_optional() {
        let parsed: ControlEnvelope =
            serde_json::from_str(r#"{"type":"Ping"}"#).unwrap();
        assert!(parsed.token.is_none());
        assert!(matches!(parsed.request, ControlRequest::Ping));
    }
}
