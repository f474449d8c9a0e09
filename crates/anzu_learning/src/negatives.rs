//! Negative-prompt library derived from rejection categories.

use anzu_protocol::types::RejectionCategory;

/// Fixed category -> negative-prompt-terms table. Categories a character
/// keeps tripping over feed these terms back into its generation
/// requests.
pub const REJECTION_NEGATIVE_MAP: [(RejectionCategory, &str); 6] = [
    (
        RejectionCategory::WrongAppearance,
        "wrong colors, off-model, inaccurate outfit",
    ),
    (
        RejectionCategory::NotSolo,
        "multiple characters, crowd, group shot",
    ),
    (
        RejectionCategory::WrongPose,
        "awkward pose, twisted limbs, broken anatomy",
    ),
    (
        RejectionCategory::LowQuality,
        "lowres, blurry, jpeg artifacts, worst quality",
    ),
    (
        RejectionCategory::WrongSpecies,
        "wrong species, human ears, missing tail",
    ),
    (
        RejectionCategory::BadComposition,
        "cropped, out of frame, watermark, text",
    ),
];

/// Negative-prompt terms for one category.
pub fn negatives_for(category: RejectionCategory) -> &'static str {
    REJECTION_NEGATIVE_MAP
        .iter()
        .find(|(c, _)| *c == category)
        .map(|(_, terms)| *terms)
        .unwrap_or("")
}

/// Join the terms for a set of categories with ", ".
pub fn join_negatives(categories: &[RejectionCategory]) -> String {
    let terms: Vec<&str> = categories.iter().map(|c| negatives_for(*c)).collect();
    terms.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_category_mapped() {
        for category in anzu_protocol::types::REJECTION_CATEGORIES {
            assert!(!negatives_for(category).is_empty());
        }
    }

    #[test]
    fn test_join_order_preserved() {
        let joined = join_negatives(&[
            RejectionCategory::LowQuality,
            RejectionCategory::NotSolo,
        ]);
        assert!(joined.starts_with("lowres"));
        assert!(joined.contains(", multiple characters"));
    }
}
