//! Learning & quality engine.
//!
//! Turns generation history into per-character parameter recommendations,
//! per-project checkpoint rankings and drift alerts; quality gates turn
//! vision scores into auto-approve / auto-reject decisions. All analysis
//! is SQL aggregation over the store, never in-memory ML.

pub mod drift;
pub mod gates;
pub mod learning;
pub mod negatives;
pub mod selector;

pub use drift::{detect_drift, DriftRow};
pub use gates::{evaluate_review, ReviewOutcome};
pub use learning::{
    checkpoint_rankings, learning_stats, quality_trend, record_learned_pattern,
    register_learning_handlers, rejection_patterns, suggest_params, PatternSample,
};
pub use negatives::{join_negatives, negatives_for, REJECTION_NEGATIVE_MAP};
pub use selector::{
    character_quality_summary, learned_negatives, recommend_params, Recommendation,
};
