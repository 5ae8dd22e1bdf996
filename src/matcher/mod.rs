//! Descriptor matching against the active reference templates

pub mod features;

pub use features::{
    hamming, Descriptor, ExtractorConfig, FeatureExtractor, FeatureSet, Keypoint, OrbExtractor,
};

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::capture::frame::GrayBuffer;
use crate::reference::ReferenceTable;

/// Matching knobs. Defaults follow the reference deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    /// Lowe ratio: nearest must beat `ratio_thresh * second_nearest`, strictly.
    pub ratio_thresh: f32,
    /// Good matches needed before a slot counts as detected.
    pub min_good_matches: usize,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            ratio_thresh: 0.67,
            min_good_matches: 20,
        }
    }
}

/// One accepted template-to-frame correspondence.
#[derive(Debug, Clone, Copy)]
pub struct MatchedPair {
    pub template: Keypoint,
    pub frame: Keypoint,
    pub distance: f32,
}

/// Per-slot outcome for one frame. Recomputed every processed frame.
#[derive(Default)]
pub struct MatchResult {
    pub good: Vec<MatchedPair>,
    pub detected: bool,
}

impl MatchResult {
    pub fn count(&self) -> usize {
        self.good.len()
    }
}

/// All slot results for one frame, in reference-table order.
#[derive(Default)]
pub struct FrameMatches {
    pub slots: Vec<(String, MatchResult)>,
    pub frame_keypoints: usize,
}

/// Stateless matching stage. Shares its extractor with the `ReferenceSet` so frame
/// and template features always come from the same capability.
pub struct Matcher {
    extractor: Arc<dyn FeatureExtractor>,
}

impl Matcher {
    pub fn new(extractor: Arc<dyn FeatureExtractor>) -> Self {
        Self { extractor }
    }

    /// Extract frame features once, then score every slot in the snapshot.
    #[instrument(skip_all, fields(slots = snapshot.slots().len()))]
    pub fn match_frame(
        &self,
        gray: &GrayBuffer,
        snapshot: &ReferenceTable,
        config: &MatchConfig,
    ) -> FrameMatches {
        let frame_features = self.extractor.extract(gray);

        let slots = snapshot
            .slots()
            .iter()
            .map(|template| {
                let result =
                    match_template(&template.features, &frame_features, config);
                (template.slot.clone(), result)
            })
            .collect();

        FrameMatches {
            slots,
            frame_keypoints: frame_features.len(),
        }
    }
}

/// Ratio-tested matching of one template against the frame.
///
/// For each template descriptor the two nearest frame descriptors are found by
/// Hamming distance; the pair is good iff `d1 < ratio * d2` (strict). Fewer than
/// two frame descriptors means no pair can be ranked, so the count is zero.
fn match_template(
    template: &FeatureSet,
    frame: &FeatureSet,
    config: &MatchConfig,
) -> MatchResult {
    if template.is_empty() || frame.len() < 2 {
        return MatchResult::default();
    }

    let mut good = Vec::new();
    for (ti, tdesc) in template.descriptors.iter().enumerate() {
        let (best_idx, best, second) = two_nearest(tdesc, &frame.descriptors);
        if (best as f32) < config.ratio_thresh * (second as f32) {
            good.push(MatchedPair {
                template: template.keypoints[ti],
                frame: frame.keypoints[best_idx],
                distance: best as f32,
            });
        }
    }

    let detected = good.len() >= config.min_good_matches;
    MatchResult { good, detected }
}

/// Linear scan for the two smallest distances. `descriptors` must hold >= 2 entries.
fn two_nearest(query: &Descriptor, descriptors: &[Descriptor]) -> (usize, u32, u32) {
    let mut best_idx = 0;
    let mut best = u32::MAX;
    let mut second = u32::MAX;
    for (i, d) in descriptors.iter().enumerate() {
        let dist = hamming(query, d);
        if dist < best {
            second = best;
            best = dist;
            best_idx = i;
        } else if dist < second {
            second = dist;
        }
    }
    (best_idx, best, second)
}
