//! Canonical domain enums and shared structs.
//!
//! These are the single definitions used across all crates. Database rows,
//! event payloads and control-plane envelopes all serialize the same
//! strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Canonical Enums (used across all crates)
// ============================================================================

/// What kind of entity a pipeline row tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Character,
    Project,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Character => "character",
            EntityType::Project => "project",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "character" => Ok(EntityType::Character),
            "project" => Ok(EntityType::Project),
            _ => Err(format!(
                "Invalid entity type: '{}'. Expected: character or project",
                s
            )),
        }
    }
}

/// One step in an entity's ordered progression.
///
/// Characters move `training_data -> lora_training -> ready`; projects move
/// `scene_planning -> ... -> publishing`. The two sequences never mix: a
/// character phase applied to a project row is a validation error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    // Character phases
    TrainingData,
    LoraTraining,
    Ready,
    // Project phases
    ScenePlanning,
    ShotPreparation,
    VideoGeneration,
    SceneAssembly,
    EpisodeAssembly,
    Publishing,
}

/// Ordered character phase sequence.
pub const CHARACTER_PHASES: [Phase; 3] = [Phase::TrainingData, Phase::LoraTraining, Phase::Ready];

/// Ordered project phase sequence.
pub const PROJECT_PHASES: [Phase; 6] = [
    Phase::ScenePlanning,
    Phase::ShotPreparation,
    Phase::VideoGeneration,
    Phase::SceneAssembly,
    Phase::EpisodeAssembly,
    Phase::Publishing,
];

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::TrainingData => "training_data",
            Phase::LoraTraining => "lora_training",
            Phase::Ready => "ready",
            Phase::ScenePlanning => "scene_planning",
            Phase::ShotPreparation => "shot_preparation",
            Phase::VideoGeneration => "video_generation",
            Phase::SceneAssembly => "scene_assembly",
            Phase::EpisodeAssembly => "episode_assembly",
            Phase::Publishing => "publishing",
        }
    }

    /// Which entity type this phase belongs to.
    pub fn entity_type(&self) -> EntityType {
        match self {
            Phase::TrainingData | Phase::LoraTraining | Phase::Ready => EntityType::Character,
            _ => EntityType::Project,
        }
    }

    /// First phase for an entity type.
    pub fn first(entity_type: EntityType) -> Phase {
        match entity_type {
            EntityType::Character => CHARACTER_PHASES[0],
            EntityType::Project => PROJECT_PHASES[0],
        }
    }

    /// The full ordered sequence this phase belongs to.
    pub fn sequence(entity_type: EntityType) -> &'static [Phase] {
        match entity_type {
            EntityType::Character => &CHARACTER_PHASES,
            EntityType::Project => &PROJECT_PHASES,
        }
    }

    /// Next phase in the sequence, or None if terminal.
    pub fn next(&self) -> Option<Phase> {
        let seq = Phase::sequence(self.entity_type());
        let idx = seq.iter().position(|p| p == self)?;
        seq.get(idx + 1).copied()
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "training_data" => Ok(Phase::TrainingData),
            "lora_training" => Ok(Phase::LoraTraining),
            "ready" => Ok(Phase::Ready),
            "scene_planning" => Ok(Phase::ScenePlanning),
            "shot_preparation" => Ok(Phase::ShotPreparation),
            "video_generation" => Ok(Phase::VideoGeneration),
            "scene_assembly" => Ok(Phase::SceneAssembly),
            "episode_assembly" => Ok(Phase::EpisodeAssembly),
            "publishing" => Ok(Phase::Publishing),
            _ => Err(format!("Invalid phase: '{}'", s)),
        }
    }
}

/// Status of a pipeline row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    #[default]
    Pending,
    Active,
    Blocked,
    Completed,
    Failed,
    Skipped,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Pending => "pending",
            PipelineStatus::Active => "active",
            PipelineStatus::Blocked => "blocked",
            PipelineStatus::Completed => "completed",
            PipelineStatus::Failed => "failed",
            PipelineStatus::Skipped => "skipped",
        }
    }

    /// Terminal rows are not re-evaluated by the tick loop.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineStatus::Completed | PipelineStatus::Skipped)
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PipelineStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PipelineStatus::Pending),
            "active" => Ok(PipelineStatus::Active),
            "blocked" => Ok(PipelineStatus::Blocked),
            "completed" => Ok(PipelineStatus::Completed),
            "failed" => Ok(PipelineStatus::Failed),
            "skipped" => Ok(PipelineStatus::Skipped),
            _ => Err(format!("Invalid pipeline status: '{}'", s)),
        }
    }
}

/// Review status of a generation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
    InReview,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Pending => "pending",
            ReviewStatus::Approved => "approved",
            ReviewStatus::Rejected => "rejected",
            ReviewStatus::InReview => "in_review",
        }
    }
}

impl fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ReviewStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ReviewStatus::Pending),
            "approved" => Ok(ReviewStatus::Approved),
            "rejected" => Ok(ReviewStatus::Rejected),
            "in_review" => Ok(ReviewStatus::InReview),
            _ => Err(format!("Invalid review status: '{}'", s)),
        }
    }
}

/// Image vs. video generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GenerationKind {
    #[default]
    Image,
    Video,
}

impl GenerationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationKind::Image => "image",
            GenerationKind::Video => "video",
        }
    }
}

impl fmt::Display for GenerationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Fixed rejection category set.
///
/// The vision reviewer is instructed to emit exactly these strings; anything
/// else is dropped at the parse boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionCategory {
    WrongAppearance,
    NotSolo,
    WrongPose,
    LowQuality,
    WrongSpecies,
    BadComposition,
}

/// All categories, in display order.
pub const REJECTION_CATEGORIES: [RejectionCategory; 6] = [
    RejectionCategory::WrongAppearance,
    RejectionCategory::NotSolo,
    RejectionCategory::WrongPose,
    RejectionCategory::LowQuality,
    RejectionCategory::WrongSpecies,
    RejectionCategory::BadComposition,
];

impl RejectionCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionCategory::WrongAppearance => "wrong_appearance",
            RejectionCategory::NotSolo => "not_solo",
            RejectionCategory::WrongPose => "wrong_pose",
            RejectionCategory::LowQuality => "low_quality",
            RejectionCategory::WrongSpecies => "wrong_species",
            RejectionCategory::BadComposition => "bad_composition",
        }
    }
}

impl fmt::Display for RejectionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RejectionCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wrong_appearance" => Ok(RejectionCategory::WrongAppearance),
            "not_solo" => Ok(RejectionCategory::NotSolo),
            "wrong_pose" => Ok(RejectionCategory::WrongPose),
            "low_quality" => Ok(RejectionCategory::LowQuality),
            "wrong_species" => Ok(RejectionCategory::WrongSpecies),
            "bad_composition" => Ok(RejectionCategory::BadComposition),
            _ => Err(format!("Invalid rejection category: '{}'", s)),
        }
    }
}

/// Who produced a review decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewSource {
    Vision,
    Human,
    Auto,
}

impl ReviewSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewSource::Vision => "vision",
            ReviewSource::Human => "human",
            ReviewSource::Auto => "auto",
        }
    }
}

impl fmt::Display for ReviewSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Learned-pattern key half: did the generation succeed or fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternType {
    Success,
    Failure,
}

impl PatternType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternType::Success => "success",
            PatternType::Failure => "failure",
        }
    }
}

impl fmt::Display for PatternType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Quality gate kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateType {
    AutoReject,
    AutoApprove,
    OverallConsistency,
    FaceSimilarity,
}

impl GateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateType::AutoReject => "auto_reject",
            GateType::AutoApprove => "auto_approve",
            GateType::OverallConsistency => "overall_consistency",
            GateType::FaceSimilarity => "face_similarity",
        }
    }
}

impl fmt::Display for GateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for GateType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto_reject" => Ok(GateType::AutoReject),
            "auto_approve" => Ok(GateType::AutoApprove),
            "overall_consistency" => Ok(GateType::OverallConsistency),
            "face_similarity" => Ok(GateType::FaceSimilarity),
            _ => Err(format!("Invalid gate type: '{}'", s)),
        }
    }
}

/// LLM model tier requested by a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Fast,
    #[default]
    Standard,
    Advanced,
}

impl ModelTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::Fast => "fast",
            ModelTier::Standard => "standard",
            ModelTier::Advanced => "advanced",
        }
    }
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Manual override action on a pipeline row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverrideAction {
    Skip,
    Reset,
    Complete,
}

impl OverrideAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverrideAction::Skip => "skip",
            OverrideAction::Reset => "reset",
            OverrideAction::Complete => "complete",
        }
    }
}

impl FromStr for OverrideAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "skip" => Ok(OverrideAction::Skip),
            "reset" => Ok(OverrideAction::Reset),
            "complete" => Ok(OverrideAction::Complete),
            _ => Err(format!(
                "Invalid override action: '{}'. Expected: skip, reset, or complete",
                s
            )),
        }
    }
}

/// Confidence level attached to a parameter recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    None,
    Low,
    Medium,
    High,
}

impl Confidence {
    /// Confidence ladder: none < 5 samples, low < 10, medium < 25, high >= 25.
    pub fn from_sample_count(n: i64, min_samples: i64) -> Confidence {
        if n < min_samples {
            Confidence::None
        } else if n < 10 {
            Confidence::Low
        } else if n < 25 {
            Confidence::Medium
        } else {
            Confidence::High
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::None => "none",
            Confidence::Low => "low",
            Confidence::Medium => "medium",
            Confidence::High => "high",
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// GPU routing
// ============================================================================

/// Physical accelerator a task is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuTarget {
    /// Generation accelerator (image backend, video, training, tagging).
    GpuA,
    /// Inference accelerator (LLM, embeddings, classification).
    GpuB,
}

/// Tasks the dual-GPU router knows about. The routing table is static.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuTask {
    ImageGeneration,
    VideoGeneration,
    LoraTraining,
    VisionTagging,
    LlmInference,
    Embeddings,
    ImageClassification,
}

impl GpuTask {
    /// Static task -> accelerator routing table.
    pub fn target(&self) -> GpuTarget {
        match self {
            GpuTask::ImageGeneration
            | GpuTask::VideoGeneration
            | GpuTask::LoraTraining
            | GpuTask::VisionTagging => GpuTarget::GpuA,
            GpuTask::LlmInference | GpuTask::Embeddings | GpuTask::ImageClassification => {
                GpuTarget::GpuB
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GpuTask::ImageGeneration => "image_generation",
            GpuTask::VideoGeneration => "video_generation",
            GpuTask::LoraTraining => "lora_training",
            GpuTask::VisionTagging => "vision_tagging",
            GpuTask::LlmInference => "llm_inference",
            GpuTask::Embeddings => "embeddings",
            GpuTask::ImageClassification => "image_classification",
        }
    }
}

impl fmt::Display for GpuTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Backend job polling
// ============================================================================

/// Status of a job on the image backend's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendJobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl BackendJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendJobStatus::Queued => "queued",
            BackendJobStatus::Running => "running",
            BackendJobStatus::Completed => "completed",
            BackendJobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for BackendJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Shared structs
// ============================================================================

/// Generation style: the reusable parameter tuple projects reference as
/// their `default_style`. This is the SSOT every generation request is
/// built from; per-request overrides are explicit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StyleParams {
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

/// Result of a pipeline gate predicate.
///
/// `passed` and `action_needed` drive the orchestrator; the remaining keys
/// are free-form metrics persisted into `gate_check_result` for operators.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GateCheck {
    pub passed: bool,
    pub action_needed: bool,
    #[serde(flatten)]
    pub metrics: serde_json::Map<String, serde_json::Value>,
}

impl GateCheck {
    pub fn passed() -> Self {
        GateCheck {
            passed: true,
            action_needed: false,
            metrics: serde_json::Map::new(),
        }
    }

    pub fn needs_action() -> Self {
        GateCheck {
            passed: false,
            action_needed: true,
            metrics: serde_json::Map::new(),
        }
    }

    pub fn waiting() -> Self {
        GateCheck {
            passed: false,
            action_needed: false,
            metrics: serde_json::Map::new(),
        }
    }

    pub fn with_metric(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metrics.insert(key.to_string(), value.into());
        self
    }
}

/// A validated character slug: lowercase alphanumeric plus `_` and `-`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CharacterSlug(String);

impl CharacterSlug {
    /// Derive a slug from a display name: lowercase, spaces to underscores,
    /// everything outside `[a-z0-9_-]` stripped.
    pub fn from_name(name: &str) -> Self {
        let slug: String = name
            .trim()
            .to_lowercase()
            .replace(' ', "_")
            .chars()
            .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_' || *c == '-')
            .collect();
        CharacterSlug(slug)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CharacterSlug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CharacterSlug {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err("character slug cannot be empty".to_string());
        }
        let valid = s
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
        if !valid {
            return Err(format!(
                "Invalid character slug: '{}'. Expected lowercase alphanumeric, '_' or '-'",
                s
            ));
        }
        Ok(CharacterSlug(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_sequences() {
        assert_eq!(Phase::TrainingData.next(), Some(Phase::LoraTraining));
        assert_eq!(Phase::LoraTraining.next(), Some(Phase::Ready));
        assert_eq!(Phase::Ready.next(), None);
        assert_eq!(Phase::Publishing.next(), None);
        assert_eq!(Phase::ScenePlanning.next(), Some(Phase::ShotPreparation));
        assert_eq!(Phase::first(EntityType::Project), Phase::ScenePlanning);
    }

    #[test]
    fn test_phase_entity_types() {
        assert_eq!(Phase::Ready.entity_type(), EntityType::Character);
        assert_eq!(Phase::SceneAssembly.entity_type(), EntityType::Project);
    }

    #[test]
    fn test_phase_round_trip() {
        for phase in CHARACTER_PHASES.iter().chain(PROJECT_PHASES.iter()) {
            assert_eq!(phase.as_str().parse::<Phase>().unwrap(), *phase);
        }
    }

    #[test]
    fn test_status_serde_strings() {
        let json = serde_json::to_string(&PipelineStatus::Blocked).unwrap();
        assert_eq!(json, "\"blocked\"");
        let json = serde_json::to_string(&ReviewStatus::InReview).unwrap();
        assert_eq!(json, "\"in_review\"");
    }

    #[test]
    fn test_rejection_category_round_trip() {
        for cat in REJECTION_CATEGORIES {
            assert_eq!(cat.as_str().parse::<RejectionCategory>().unwrap(), cat);
        }
        assert!("blurry".parse::<RejectionCategory>().is_err());
    }

    #[test]
    fn test_gpu_routing_table() {
        assert_eq!(GpuTask::ImageGeneration.target(), GpuTarget::GpuA);
        assert_eq!(GpuTask::LoraTraining.target(), GpuTarget::GpuA);
        assert_eq!(GpuTask::LlmInference.target(), GpuTarget::GpuB);
        assert_eq!(GpuTask::Embeddings.target(), GpuTarget::GpuB);
    }

    #[test]
    fn test_confidence_ladder() {
        assert_eq!(Confidence::from_sample_count(4, 5), Confidence::None);
        assert_eq!(Confidence::from_sample_count(5, 5), Confidence::Low);
        assert_eq!(Confidence::from_sample_count(11, 5), Confidence::Medium);
        assert_eq!(Confidence::from_sample_count(26, 5), Confidence::High);
    }

    #[test]
    fn test_slug_from_name() {
        assert_eq!(CharacterSlug::from_name("Luigi Verde").as_str(), "luigi_verde");
        assert_eq!(CharacterSlug::from_name("Mx. K-9!").as_str(), "mx_k-9");
        assert!("Luigi".parse::<CharacterSlug>().is_err());
        assert!("luigi_verde".parse::<CharacterSlug>().is_ok());
    }

    #[test]
    fn test_gate_check_flattens_metrics() {
        let gate = GateCheck::needs_action()
            .with_metric("approved", 1)
            .with_metric("target", 2);
        let json = serde_json::to_value(&gate).unwrap();
        assert_eq!(json["passed"], false);
        assert_eq!(json["action_needed"], true);
        assert_eq!(json["approved"], 1);
        assert_eq!(json["target"], 2);
    }
}
