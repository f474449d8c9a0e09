//! Quality-gate evaluation of scored generations.
//!
//! Decides auto-reject / auto-approve / in-review for each new score,
//! writes the review outcome, and only then emits the bus event, so learning
//! subscribers never observe an inconsistent record.

use anyhow::{bail, Result};
use serde_json::json;
use tracing::info;

use anzu_db::store::gates::active_threshold;
use anzu_db::store::generations::{
    get_generation, insert_approval, insert_rejection, set_review, ReviewScores,
};
use anzu_db::{AuditLog, DbPool, Decision};
use anzu_events::{EventBus, IMAGE_APPROVED, IMAGE_REJECTED};
use anzu_protocol::review::VisionReview;
use anzu_protocol::types::{GateType, RejectionCategory, ReviewSource, ReviewStatus};

use crate::negatives::join_negatives;

/// What the gate decided for one generation.
#[derive(Debug, Clone)]
pub struct ReviewOutcome {
    pub status: ReviewStatus,
    pub categories: Vec<RejectionCategory>,
}

/// Evaluate one scored generation against the active quality gates.
///
/// - score below the auto-reject threshold: `rejected`, IMAGE_REJECTED.
/// - score at/above auto-approve AND solo AND species-verified:
///   `approved`, IMAGE_APPROVED.
/// - anything else: `in_review`, no event.
pub async fn evaluate_review(
    pool: &DbPool,
    bus: &EventBus,
    audit: &AuditLog,
    generation_id: i64,
    review: &VisionReview,
    source: ReviewSource,
) -> Result<ReviewOutcome> {
    let Some(record) = get_generation(pool, generation_id).await? else {
        bail!("unknown generation record: {}", generation_id);
    };

    let reject_below = active_threshold(pool, GateType::AutoReject).await?;
    let approve_from = active_threshold(pool, GateType::AutoApprove).await?;

    let quality = review.quality_score;
    let solo = review.solo.unwrap_or(record.solo);
    let species_verified = review.species_verified.unwrap_or(record.species_verified);

    let status = if quality < reject_below {
        ReviewStatus::Rejected
    } else if quality >= approve_from && solo && species_verified {
        ReviewStatus::Approved
    } else {
        ReviewStatus::InReview
    };

    let scores = ReviewScores {
        quality_score: quality,
        character_match_score: review.character_match_score,
        clarity_score: review.clarity_score,
        training_value: review.training_value,
        solo: Some(solo),
        species_verified: Some(species_verified),
    };
    set_review(pool, generation_id, status, &scores).await?;

    let categories = match status {
        ReviewStatus::Rejected => derive_categories(review, solo, species_verified),
        _ => Vec::new(),
    };

    // Records without a character attribution still get a status, but
    // there is nothing to learn from them.
    let Some(slug) = record.character_slug.clone() else {
        return Ok(ReviewOutcome { status, categories });
    };

    let payload = json!({
        "generation_id": generation_id,
        "character_slug": slug,
        "project_name": record.project_name,
        "checkpoint_model": record.checkpoint_model,
        "quality_score": quality,
        "cfg_scale": record.cfg_scale,
        "steps": record.steps,
        "categories": categories.iter().map(|c| c.as_str()).collect::<Vec<_>>(),
    });

    match status {
        ReviewStatus::Rejected => {
            let negatives = join_negatives(&categories);
            insert_rejection(
                pool,
                generation_id,
                &slug,
                &categories,
                review.feedback.as_deref(),
                Some(&negatives),
                source,
                Some(quality),
            )
            .await?;

            audit.record(
                Decision::new("auto_reject")
                    .character(&slug)
                    .context(payload.clone())
                    .made("rejected")
                    .confidence(1.0 - quality)
                    .reason(format!(
                        "Quality {:.2} under auto-reject threshold {:.2}",
                        quality, reject_below
                    )),
            );
            info!(
                "Generation {} auto-rejected (q={:.2}, categories={:?})",
                generation_id, quality, categories
            );
            bus.emit(IMAGE_REJECTED, payload);
        }
        ReviewStatus::Approved => {
            let vision_json = serde_json::to_string(review)?;
            insert_approval(
                pool,
                generation_id,
                &slug,
                source == ReviewSource::Auto || source == ReviewSource::Vision,
                Some(&vision_json),
                Some(quality),
            )
            .await?;

            audit.record(
                Decision::new("auto_approve")
                    .character(&slug)
                    .context(payload.clone())
                    .made("approved")
                    .confidence(quality)
                    .reason(format!(
                        "Quality {:.2} at/above auto-approve threshold {:.2}, solo, species verified",
                        quality, approve_from
                    )),
            );
            info!("Generation {} auto-approved (q={:.2})", generation_id, quality);
            bus.emit(IMAGE_APPROVED, payload);
        }
        _ => {
            info!(
                "Generation {} held for manual review (q={:.2}, solo={}, species_verified={})",
                generation_id, quality, solo, species_verified
            );
        }
    }

    Ok(ReviewOutcome { status, categories })
}

/// Categories for a rejection: the vision payload's when present,
/// heuristics otherwise.
fn derive_categories(
    review: &VisionReview,
    solo: bool,
    species_verified: bool,
) -> Vec<RejectionCategory> {
    if !review.categories.is_empty() {
        return review.categories.clone();
    }
    let mut categories = Vec::new();
    categories.push(RejectionCategory::LowQuality);
    if !solo {
        categories.push(RejectionCategory::NotSolo);
    }
    if !species_verified {
        categories.push(RejectionCategory::WrongSpecies);
    }
    categories
}
