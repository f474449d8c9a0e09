//! Vision-review payload.
//!
//! The local inference service is prompted to return a JSON object with
//! exactly these keys. Models wrap the object in prose more often than
//! not, so parsing extracts the outermost brace pair before
//! deserializing. Unknown rejection-category strings are dropped.

use serde::{Deserialize, Serialize};

use crate::types::RejectionCategory;

/// Parsed vision review of a single generated image.
#[derive(Debug, Clone, Serialize, Default)]
pub struct VisionReview {
    pub quality_score: f64,
    pub character_match_score: Option<f64>,
    pub clarity_score: Option<f64>,
    pub training_value: Option<f64>,
    pub solo: Option<bool>,
    pub species_verified: Option<bool>,
    pub categories: Vec<RejectionCategory>,
    pub feedback: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawReview {
    #[serde(alias = "quality", alias = "overall_score")]
    quality_score: f64,
    character_match_score: Option<f64>,
    clarity_score: Option<f64>,
    training_value: Option<f64>,
    solo: Option<bool>,
    species_verified: Option<bool>,
    #[serde(default)]
    categories: Vec<String>,
    feedback: Option<String>,
}

impl VisionReview {
    /// Parse a review out of a model response. Returns None when no JSON
    /// object can be recovered.
    pub fn from_response_text(text: &str) -> Option<VisionReview> {
        let start = text.find('{')?;
        let end = text.rfind('}')?;
        if end <= start {
            return None;
        }
        let raw: RawReview = serde_json::from_str(&text[start..=end]).ok()?;

        let categories = raw
            .categories
            .iter()
            .filter_map(|c| c.parse::<RejectionCategory>().ok())
            .collect();

        Some(VisionReview {
            quality_score: raw.quality_score.clamp(0.0, 1.0),
            character_match_score: raw.character_match_score,
            clarity_score: raw.clarity_score,
            training_value: raw.training_value,
            solo: raw.solo,
            species_verified: raw.species_verified,
            categories,
            feedback: raw.feedback,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_embedded_json() {
        let text = r#"Here is my assessment:
            {"quality_score": 0.82, "solo": true, "species_verified": true,
             "categories": [], "feedback": "clean solo render"}
        Hope that helps!"#;
        let review = VisionReview::from_response_text(text).unwrap();
        assert_eq!(review.quality_score, 0.82);
        assert_eq!(review.solo, Some(true));
        assert!(review.categories.is_empty());
    }

    #[test]
    fn test_unknown_categories_dropped() {
        let text = r#"{"quality_score": 0.3, "categories": ["low_quality", "too_dark"]}"#;
        let review = VisionReview::from_response_text(text).unwrap();
        assert_eq!(review.categories, vec![RejectionCategory::LowQuality]);
    }

    #[test]
    fn test_score_clamped_and_garbage_rejected() {
        let review = VisionReview::from_response_text(r#"{"quality_score": 1.7}"#).unwrap();
        assert_eq!(review.quality_score, 1.0);
        assert!(VisionReview::from_response_text("no json here").is_none());
    }
}
