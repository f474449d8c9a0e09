//! Database models for the Anzu store.
//!
//! Uses derive macros for FromRow to map database rows to structs. Enum
//! columns are stored as their canonical strings and parsed through the
//! protocol enums on access, so there is exactly one definition of each
//! vocabulary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use anzu_protocol::types::{EntityType, Phase, PipelineStatus, ReviewStatus};

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub genre: Option<String>,
    pub premise: Option<String>,
    pub content_rating: Option<String>,
    pub default_style: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Character {
    pub id: i64,
    pub project_id: i64,
    pub slug: String,
    pub name: String,
    pub design_prompt: Option<String>,
    pub appearance: Option<String>,
    pub voice_profile: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct GenerationStyle {
    pub name: String,
    pub checkpoint_model: String,
    pub cfg_scale: f64,
    pub steps: i64,
    pub sampler: String,
    pub scheduler: String,
    pub width: i64,
    pub height: i64,
    pub positive_template: String,
    pub negative_template: String,
    pub architecture: String,
    pub prompt_format: String,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Scene {
    pub id: i64,
    pub project_id: i64,
    pub scene_number: i64,
    pub title: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub time_of_day: Option<String>,
    pub mood: Option<String>,
    pub final_video_path: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Shot {
    pub id: i64,
    pub scene_id: i64,
    pub shot_number: i64,
    pub shot_type: String,
    pub camera_angle: Option<String>,
    pub characters_present: Option<String>,
    pub generation_prompt: Option<String>,
    pub motion_prompt: Option<String>,
    pub duration_seconds: f64,
    pub source_image_path: Option<String>,
    pub output_video_path: Option<String>,
    pub status: String,
}

impl Shot {
    /// Characters present in the shot, parsed from the stored JSON array.
    /// A bare string is treated as a single-element list.
    pub fn characters(&self) -> Vec<String> {
        match self.characters_present.as_deref() {
            None | Some("") => Vec::new(),
            Some(raw) => match serde_json::from_str::<serde_json::Value>(raw) {
                Ok(serde_json::Value::Array(items)) => items
                    .into_iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
                Ok(serde_json::Value::String(s)) => vec![s],
                _ => vec![raw.to_string()],
            },
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Episode {
    pub id: i64,
    pub project_id: i64,
    pub episode_number: i64,
    pub title: String,
    pub final_video_path: Option<String>,
    pub thumbnail_path: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One image or video produced by the image backend.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct GenerationRecord {
    pub id: i64,
    pub character_slug: Option<String>,
    pub project_name: Option<String>,
    pub kind: String,
    pub backend_job_id: Option<String>,
    pub checkpoint_model: Option<String>,
    pub cfg_scale: Option<f64>,
    pub steps: Option<i64>,
    pub sampler: Option<String>,
    pub scheduler: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub seed: Option<i64>,
    pub output_path: Option<String>,
    pub quality_score: Option<f64>,
    pub character_match_score: Option<f64>,
    pub clarity_score: Option<f64>,
    pub training_value: Option<f64>,
    pub solo: bool,
    pub species_verified: bool,
    pub status: String,
    pub correction_of: Option<i64>,
    pub generation_time_ms: Option<i64>,
    pub generated_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
}

impl GenerationRecord {
    pub fn review_status(&self) -> Result<ReviewStatus, String> {
        self.status.parse()
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Rejection {
    pub id: i64,
    pub generation_id: i64,
    pub character_slug: String,
    pub feedback: Option<String>,
    pub negative_additions: Option<String>,
    pub review_source: String,
    pub quality_score: Option<f64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Approval {
    pub id: i64,
    pub generation_id: i64,
    pub character_slug: String,
    pub auto_approved: bool,
    pub vision_review: Option<String>,
    pub quality_score: Option<f64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct LearnedPattern {
    pub id: i64,
    pub character_slug: String,
    pub project_name: Option<String>,
    pub pattern_type: String,
    pub checkpoint_model: String,
    pub quality_score_avg: Option<f64>,
    pub frequency: i64,
    pub cfg_range_min: Option<f64>,
    pub cfg_range_max: Option<f64>,
    pub steps_range_min: Option<i64>,
    pub steps_range_max: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct QualityGate {
    pub name: String,
    pub gate_type: String,
    pub threshold: f64,
    pub active: bool,
}

/// The persistent record of an entity's status within one phase.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PipelineRow {
    pub id: i64,
    pub entity_type: String,
    pub entity_id: String,
    pub project_id: i64,
    pub phase: String,
    pub status: String,
    pub progress_current: Option<i64>,
    pub progress_target: Option<i64>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub blocked_reason: Option<String>,
    pub gate_check_result: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineRow {
    pub fn entity_type(&self) -> Result<EntityType, String> {
        self.entity_type.parse()
    }

    pub fn phase(&self) -> Result<Phase, String> {
        self.phase.parse()
    }

    pub fn status(&self) -> Result<PipelineStatus, String> {
        self.status.parse()
    }

    /// The in-memory work-task map key for this row.
    pub fn work_key(&self) -> String {
        format!("{}:{}:{}", self.entity_type, self.entity_id, self.phase)
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct AuditDecision {
    pub id: i64,
    pub decision_type: String,
    pub character_slug: Option<String>,
    pub project_name: Option<String>,
    pub input_context: Option<String>,
    pub decision_made: String,
    pub confidence_score: f64,
    pub reasoning: String,
    pub outcome: String,
    pub correlation_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shot_with(characters_present: Option<&str>) -> Shot {
        Shot {
            id: 1,
            scene_id: 1,
            shot_number: 1,
            shot_type: "medium".to_string(),
            camera_angle: None,
            characters_present: characters_present.map(str::to_string),
            generation_prompt: None,
            motion_prompt: None,
            duration_seconds: 3.0,
            source_image_path: None,
            output_video_path: None,
            status: "pending".to_string(),
        }
    }

    #[test]
    fn test_shot_characters_parses_json_array() {
        let shot = shot_with(Some(r#"["luigi","peach"]"#));
        assert_eq!(shot.characters(), vec!["luigi", "peach"]);
    }

    #[test]
    fn test_shot_characters_tolerates_bare_string() {
        let shot = shot_with(Some(r#""luigi""#));
        assert_eq!(shot.characters(), vec!["luigi"]);
        let shot = shot_with(None);
        assert!(shot.characters().is_empty());
    }

    #[test]
    fn test_work_key_format() {
        let row = PipelineRow {
            id: 1,
            entity_type: "character".to_string(),
            entity_id: "luigi".to_string(),
            project_id: 7,
            phase: "training_data".to_string(),
            status: "pending".to_string(),
            progress_current: None,
            progress_target: None,
            last_checked_at: None,
            started_at: None,
            completed_at: None,
            blocked_reason: None,
            gate_check_result: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(row.work_key(), "character:luigi:training_data");
    }
}
