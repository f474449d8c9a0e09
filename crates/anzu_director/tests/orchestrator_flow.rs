//! End-to-end orchestrator scenarios against an in-memory store.
//!
//! External backends are pointed at unreachable addresses, so GPU
//! admission denies and dispatched workers defer; everything asserted
//! here is driven by gates, stored state and the event bus.

use std::sync::Arc;
use std::time::Duration;

use anzu_db::store::pipeline;
use anzu_db::PipelineRow;
use anzu_director::Director;
use anzu_protocol::types::{EntityType, OverrideAction, Phase};
use anzu_protocol::AnzuConfig;
use anzu_test_utils::{seed_project, test_pool, SeedGeneration};

fn offline_config() -> AnzuConfig {
    AnzuConfig {
        image_backend_url: "http://127.0.0.1:9".to_string(),
        llm_url: "http://127.0.0.1:9".to_string(),
        inference_url: "http://127.0.0.1:9".to_string(),
        ..AnzuConfig::default()
    }
}

async fn director() -> Arc<Director> {
    let director = Director::with_pool(offline_config(), test_pool().await);
    director.enable(true);
    director
}

/// Pipeline-row prefix invariant: for each entity the rows form a prefix
/// of its phase sequence, every earlier row terminal, at most one open.
fn assert_prefix_invariant(rows: &[PipelineRow]) {
    use std::collections::HashMap;
    let mut by_entity: HashMap<(String, String), Vec<&PipelineRow>> = HashMap::new();
    for row in rows {
        by_entity
            .entry((row.entity_type.clone(), row.entity_id.clone()))
            .or_default()
            .push(row);
    }

    for ((entity_type, entity_id), mut entity_rows) in by_entity {
        let entity_type: EntityType = entity_type.parse().unwrap();
        let sequence = Phase::sequence(entity_type);
        entity_rows.sort_by_key(|r| {
            sequence
                .iter()
                .position(|p| p.as_str() == r.phase)
                .unwrap_or(usize::MAX)
        });

        // Rows must map onto a prefix of the sequence.
        for (i, row) in entity_rows.iter().enumerate() {
            assert_eq!(
                row.phase,
                sequence[i].as_str(),
                "{}:{} rows are not a sequence prefix",
                row.entity_type,
                entity_id
            );
        }

        let open: Vec<_> = entity_rows
            .iter()
            .filter(|r| !matches!(r.status.as_str(), "completed" | "skipped"))
            .collect();
        assert!(
            open.len() <= 1,
            "{} has more than one open row",
            entity_id
        );
        // Everything before the open row is terminal.
        if let Some(open_row) = open.first() {
            for row in &entity_rows {
                if row.phase == open_row.phase {
                    break;
                }
                assert!(
                    matches!(row.status.as_str(), "completed" | "skipped"),
                    "row before the open phase is not terminal"
                );
            }
        }
    }
}

async fn wait_for_audit(d: &Arc<Director>, decision_type: &str) -> bool {
    for _ in 0..100 {
        let decisions = d.audit.recent(50).await.unwrap();
        if decisions.iter().any(|dec| dec.decision_type == decision_type) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

// ── Scenario 1: cold-start happy path ──────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn cold_start_happy_path() {
    let d = director().await;
    d.register_orchestrator_handlers();
    let project_id = seed_project(&d.pool, "P1", "luigi").await.unwrap();

    d.initialize_project(project_id, Some(2)).await.unwrap();
    SeedGeneration::approved("luigi", "P1", 0.9)
        .insert(&d.pool)
        .await
        .unwrap();

    // First tick: gate sees approved=1, target=2 -> action needed.
    d.tick().await.unwrap();
    let row = pipeline::get_row(&d.pool, EntityType::Character, "luigi", Phase::TrainingData)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, "active");
    let gate: serde_json::Value =
        serde_json::from_str(row.gate_check_result.as_deref().unwrap()).unwrap();
    assert_eq!(gate["approved"], 1);
    assert_eq!(gate["target"], 2);
    assert_eq!(gate["action_needed"], true);

    // A second approval arrives (vision review path, simulated).
    SeedGeneration::approved("luigi", "P1", 0.85)
        .insert(&d.pool)
        .await
        .unwrap();

    // Next tick: gate passes, phase advances, lora_training row appears.
    d.tick().await.unwrap();
    let row = pipeline::get_row(&d.pool, EntityType::Character, "luigi", Phase::TrainingData)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, "completed");
    assert!(row.completed_at.is_some());

    let next = pipeline::get_row(&d.pool, EntityType::Character, "luigi", Phase::LoraTraining)
        .await
        .unwrap();
    assert!(next.is_some(), "advancement must create the next phase row");

    assert!(
        wait_for_audit(&d, "orchestrator_phase_advanced").await,
        "phase advancement must be audited"
    );

    let rows = pipeline::rows_for_project(&d.pool, project_id).await.unwrap();
    assert_prefix_invariant(&rows);
}

// ── Scenario 2: blocked project ────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn project_blocks_until_characters_ready() {
    let d = director().await;
    let project_id = seed_project(&d.pool, "P2", "luigi").await.unwrap();
    anzu_db::store::projects::create_character(
        &d.pool,
        project_id,
        "peach",
        "Peach",
        Some("pink dress, crown"),
        None,
        None,
    )
    .await
    .unwrap();

    d.initialize_project(project_id, Some(1)).await.unwrap();

    // Both characters still in training_data: the project row blocks.
    d.tick().await.unwrap();
    let project_row = pipeline::get_row(
        &d.pool,
        EntityType::Project,
        &project_id.to_string(),
        Phase::ScenePlanning,
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(project_row.status, "blocked");
    assert_eq!(
        project_row.blocked_reason.as_deref(),
        Some("Waiting for all character LoRAs")
    );

    // Drive both characters to their ready rows.
    for slug in ["luigi", "peach"] {
        for phase in [Phase::TrainingData, Phase::LoraTraining] {
            pipeline::upsert_row(&d.pool, EntityType::Character, slug, project_id, phase)
                .await
                .unwrap();
            let row = pipeline::get_row(&d.pool, EntityType::Character, slug, phase)
                .await
                .unwrap()
                .unwrap();
            pipeline::complete_row(&d.pool, row.id).await.unwrap();
        }
        pipeline::upsert_row(&d.pool, EntityType::Character, slug, project_id, Phase::Ready)
            .await
            .unwrap();
    }

    // The block clears on the next pass and scene planning proceeds.
    d.tick().await.unwrap();
    let project_row = pipeline::get_row(
        &d.pool,
        EntityType::Project,
        &project_id.to_string(),
        Phase::ScenePlanning,
    )
    .await
    .unwrap()
    .unwrap();
    assert_ne!(project_row.status, "blocked");
    assert!(project_row.blocked_reason.is_none() || project_row.status == "failed");
}

// ── Idempotence laws ───────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn initialize_project_is_idempotent() {
    let d = director().await;
    let project_id = seed_project(&d.pool, "P1", "luigi").await.unwrap();

    d.initialize_project(project_id, None).await.unwrap();
    let first = pipeline::rows_for_project(&d.pool, project_id).await.unwrap();
    d.initialize_project(project_id, None).await.unwrap();
    let second = pipeline::rows_for_project(&d.pool, project_id).await.unwrap();

    assert_eq!(first.len(), second.len());
    assert_eq!(first.len(), 2); // luigi training_data + project scene_planning
}

#[tokio::test(flavor = "multi_thread")]
async fn double_advance_is_noop() {
    let d = director().await;
    let project_id = seed_project(&d.pool, "P1", "luigi").await.unwrap();
    d.initialize_project(project_id, Some(0)).await.unwrap();

    let row = pipeline::get_row(&d.pool, EntityType::Character, "luigi", Phase::TrainingData)
        .await
        .unwrap()
        .unwrap();
    d.advance_phase(&row).await.unwrap();
    d.advance_phase(&row).await.unwrap();

    let rows = pipeline::rows_for_project(&d.pool, project_id).await.unwrap();
    let lora_rows: Vec<_> = rows
        .iter()
        .filter(|r| r.phase == "lora_training")
        .collect();
    assert_eq!(lora_rows.len(), 1, "no duplicate next-phase row");
    assert_prefix_invariant(&rows);
}

// ── Boundary: zero training target and zero characters ────────────────

#[tokio::test(flavor = "multi_thread")]
async fn zero_training_target_passes_immediately() {
    let d = director().await;
    let project_id = seed_project(&d.pool, "P1", "luigi").await.unwrap();
    d.initialize_project(project_id, Some(0)).await.unwrap();

    d.tick().await.unwrap();
    let row = pipeline::get_row(&d.pool, EntityType::Character, "luigi", Phase::TrainingData)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, "completed");
}

#[tokio::test(flavor = "multi_thread")]
async fn initialize_refuses_empty_project() {
    let d = director().await;
    let project_id =
        anzu_db::store::projects::create_project(&d.pool, "Empty", None, None, None, None)
            .await
            .unwrap();

    let err = d.initialize_project(project_id, None).await.unwrap_err();
    let envelope = err
        .downcast_ref::<anzu_protocol::ErrorEnvelope>()
        .expect("validation errors carry a typed envelope");
    assert_eq!(envelope.error_kind, anzu_protocol::ErrorKind::Validation);
}

// ── Manual override ────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn override_skip_reset_complete() {
    let d = director().await;
    let project_id = seed_project(&d.pool, "P1", "luigi").await.unwrap();
    d.initialize_project(project_id, Some(5)).await.unwrap();

    d.override_phase(
        EntityType::Character,
        "luigi",
        Phase::TrainingData,
        OverrideAction::Skip,
    )
    .await
    .unwrap();
    let row = pipeline::get_row(&d.pool, EntityType::Character, "luigi", Phase::TrainingData)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, "skipped");
    // Skip does not create the next phase.
    assert!(pipeline::get_row(&d.pool, EntityType::Character, "luigi", Phase::LoraTraining)
        .await
        .unwrap()
        .is_none());

    d.override_phase(
        EntityType::Character,
        "luigi",
        Phase::TrainingData,
        OverrideAction::Reset,
    )
    .await
    .unwrap();
    let row = pipeline::get_row(&d.pool, EntityType::Character, "luigi", Phase::TrainingData)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, "pending");
    assert!(row.started_at.is_none());

    d.override_phase(
        EntityType::Character,
        "luigi",
        Phase::TrainingData,
        OverrideAction::Complete,
    )
    .await
    .unwrap();
    assert!(pipeline::get_row(&d.pool, EntityType::Character, "luigi", Phase::LoraTraining)
        .await
        .unwrap()
        .is_some());

    // Unknown row is a validation error.
    let err = d
        .override_phase(
            EntityType::Character,
            "bowser",
            Phase::TrainingData,
            OverrideAction::Skip,
        )
        .await
        .unwrap_err();
    assert!(err.downcast_ref::<anzu_protocol::ErrorEnvelope>().is_some());
}

// ── Status & summary surfaces ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn pipeline_status_and_summary_shapes() {
    let d = director().await;
    let project_id = seed_project(&d.pool, "P1", "luigi").await.unwrap();
    d.initialize_project(project_id, Some(2)).await.unwrap();
    d.tick().await.unwrap();

    let status = d.pipeline_status(project_id).await.unwrap();
    assert_eq!(status["project_name"], "P1");
    assert!(status["characters"]["luigi"].is_array());
    assert!(status["project_phases"]["scene_planning"].is_object());
    assert!(status["progress"]["total_phases"].as_i64().unwrap() >= 2);

    let summary = d.pipeline_summary(project_id).await.unwrap();
    assert!(summary.contains("Production Pipeline: P1"));
    assert!(summary.contains("luigi"));
    assert!(summary.contains("scene_planning"));
    assert!(summary.contains("publishing: not started"));
}

// ── Disabled orchestrator does nothing ─────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn disabled_tick_skips() {
    let d = Director::with_pool(offline_config(), test_pool().await);
    let report = d.tick().await.unwrap();
    assert_eq!(report["skipped"], true);
}
