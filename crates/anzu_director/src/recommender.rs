//! Source-image recommendation for shot preparation.
//!
//! Scores each approved image against each shot by pose affinity, quality
//! and diversity, so a scene does not reuse the same hero image for every
//! shot of the same type.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use anzu_db::{GenerationRecord, Shot};

/// Reuse penalty applied per prior assignment of the same image.
const REUSE_PENALTY: f64 = 0.35;
/// Extra penalty when the reuse is within the same shot type.
const SAME_TYPE_REUSE_PENALTY: f64 = 0.6;

/// One shot's chosen image, with the scoring rationale for the audit log.
#[derive(Debug, Clone, Serialize)]
pub struct Assignment {
    pub shot_id: i64,
    pub shot_number: i64,
    pub shot_type: String,
    pub image_path: String,
    pub character_slug: String,
    pub score: f64,
    pub reason: String,
}

/// Pose affinity: how well an image's aspect and framing suit a shot type.
///
/// Wide establishing shots favor landscape renders; close-ups favor
/// portrait crops with high clarity. Everything else sits in between.
fn pose_affinity(shot_type: &str, image: &GenerationRecord) -> f64 {
    let width = image.width.unwrap_or(768) as f64;
    let height = image.height.unwrap_or(1024) as f64;
    let landscape = width > height;

    match shot_type {
        "wide" | "establishing" | "full" => {
            if landscape {
                1.0
            } else {
                0.55
            }
        }
        "close" | "closeup" | "close_up" | "portrait" => {
            let clarity = image.clarity_score.unwrap_or(0.5);
            if landscape {
                0.4 + clarity * 0.2
            } else {
                0.8 + clarity * 0.2
            }
        }
        // medium and friends: neutral fit.
        _ => 0.75,
    }
}

/// Pick the best image for every shot.
///
/// `images_by_character` maps slug -> approved records. Shots naming
/// characters only consider those characters' images; shots naming none
/// consider the full pool. Returns one assignment per shot that had at
/// least one candidate.
pub fn recommend_for_shots(
    shots: &[Shot],
    images_by_character: &HashMap<String, Vec<GenerationRecord>>,
) -> Vec<Assignment> {
    let mut assignments = Vec::new();
    // Global reuse counts and per-shot-type reuse sets.
    let mut use_counts: HashMap<String, usize> = HashMap::new();
    let mut used_for_type: HashMap<String, HashSet<String>> = HashMap::new();

    for shot in shots {
        let wanted = shot.characters();
        let candidates = images_by_character
            .iter()
            .filter(|(slug, _)| wanted.is_empty() || wanted.iter().any(|w| w == *slug))
            .flat_map(|(slug, images)| images.iter().map(move |i| (slug.as_str(), i)))
            .filter(|(_, image)| image.output_path.is_some());

        let mut best: Option<(f64, &str, &GenerationRecord, String)> = None;
        for (slug, image) in candidates {
            let path = image.output_path.as_deref().unwrap_or_default();
            let pose = pose_affinity(&shot.shot_type, image);
            let quality = image.quality_score.unwrap_or(0.5);

            let reuse_count = use_counts.get(path).copied().unwrap_or(0);
            let mut diversity_penalty = reuse_count as f64 * REUSE_PENALTY;
            if used_for_type
                .get(&shot.shot_type)
                .map(|paths| paths.contains(path))
                .unwrap_or(false)
            {
                diversity_penalty += SAME_TYPE_REUSE_PENALTY;
            }
            let diversity = (1.0 - diversity_penalty).max(0.0);

            let score = pose * 0.4 + quality * 0.4 + diversity * 0.2;
            let better = best
                .as_ref()
                .map(|(best_score, _, _, _)| score > *best_score)
                .unwrap_or(true);
            if better {
                let reason = format!(
                    "pose {:.2}, quality {:.2}, diversity {:.2}",
                    pose, quality, diversity
                );
                best = Some((score, slug, image, reason));
            }
        }

        if let Some((score, slug, image, reason)) = best {
            let path = image.output_path.clone().unwrap_or_default();
            *use_counts.entry(path.clone()).or_insert(0) += 1;
            used_for_type
                .entry(shot.shot_type.clone())
                .or_default()
                .insert(path.clone());
            assignments.push(Assignment {
                shot_id: shot.id,
                shot_number: shot.shot_number,
                shot_type: shot.shot_type.clone(),
                image_path: path,
                character_slug: slug.to_string(),
                score,
                reason,
            });
        }
    }

    assignments
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn image(slug: &str, path: &str, quality: f64, width: i64, height: i64) -> GenerationRecord {
        GenerationRecord {
            id: 0,
            character_slug: Some(slug.to_string()),
            project_name: Some("P1".to_string()),
            kind: "image".to_string(),
            backend_job_id: None,
            checkpoint_model: None,
            cfg_scale: None,
            steps: None,
            sampler: None,
            scheduler: None,
            width: Some(width),
            height: Some(height),
            seed: None,
            output_path: Some(path.to_string()),
            quality_score: Some(quality),
            character_match_score: None,
            clarity_score: Some(0.8),
            training_value: None,
            solo: true,
            species_verified: true,
            status: "approved".to_string(),
            correction_of: None,
            generation_time_ms: None,
            generated_at: Utc::now(),
            reviewed_at: Some(Utc::now()),
        }
    }

    fn shot(id: i64, number: i64, shot_type: &str, characters: &str) -> Shot {
        Shot {
            id,
            scene_id: 1,
            shot_number: number,
            shot_type: shot_type.to_string(),
            camera_angle: None,
            characters_present: Some(characters.to_string()),
            generation_prompt: None,
            motion_prompt: None,
            duration_seconds: 3.0,
            source_image_path: None,
            output_video_path: None,
            status: "pending".to_string(),
        }
    }

    fn pool(images: Vec<GenerationRecord>) -> HashMap<String, Vec<GenerationRecord>> {
        let mut map: HashMap<String, Vec<GenerationRecord>> = HashMap::new();
        for image in images {
            let slug = image.character_slug.clone().unwrap_or_default();
            map.entry(slug).or_default().push(image);
        }
        map
    }

    #[test]
    fn test_character_filter_respected() {
        let images = pool(vec![
            image("luigi", "/m/luigi/a.png", 0.95, 768, 1024),
            image("peach", "/m/peach/a.png", 0.99, 768, 1024),
        ]);
        let shots = vec![shot(1, 1, "medium", r#"["luigi"]"#)];

        let assignments = recommend_for_shots(&shots, &images);
        assert_eq!(assignments.len(), 1);
        assert_eq!(assignments[0].character_slug, "luigi");
    }

    #[test]
    fn test_same_shot_type_avoids_identical_image() {
        let images = pool(vec![
            image("luigi", "/m/luigi/a.png", 0.9, 768, 1024),
            image("luigi", "/m/luigi/b.png", 0.85, 768, 1024),
        ]);
        let shots = vec![
            shot(1, 1, "medium", r#"["luigi"]"#),
            shot(2, 2, "medium", r#"["luigi"]"#),
        ];

        let assignments = recommend_for_shots(&shots, &images);
        assert_eq!(assignments.len(), 2);
        assert_ne!(
            assignments[0].image_path, assignments[1].image_path,
            "two same-type shots must not share an image when 2+ candidates exist"
        );
    }

    #[test]
    fn test_wide_shot_prefers_landscape() {
        let images = pool(vec![
            image("luigi", "/m/luigi/portrait.png", 0.85, 768, 1024),
            image("luigi", "/m/luigi/landscape.png", 0.8, 1024, 576),
        ]);
        let shots = vec![shot(1, 1, "wide", r#"["luigi"]"#)];

        let assignments = recommend_for_shots(&shots, &images);
        assert_eq!(assignments[0].image_path, "/m/luigi/landscape.png");
    }

    #[test]
    fn test_shot_without_characters_uses_full_pool() {
        let images = pool(vec![image("peach", "/m/peach/a.png", 0.9, 768, 1024)]);
        let shots = vec![shot(1, 1, "medium", "[]")];

        let assignments = recommend_for_shots(&shots, &images);
        assert_eq!(assignments.len(), 1);
        assert_eq!(assignments[0].character_slug, "peach");
    }

    #[test]
    fn test_no_candidates_no_assignment() {
        let images = pool(vec![image("peach", "/m/peach/a.png", 0.9, 768, 1024)]);
        let shots = vec![shot(1, 1, "medium", r#"["luigi"]"#)];
        assert!(recommend_for_shots(&shots, &images).is_empty());
    }
}
