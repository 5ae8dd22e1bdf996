//! Keypoint detection and binary descriptors
//!
//! FAST-9 corners with score-ranked non-maximum suppression, intensity-centroid
//! orientation, and 256 rotated BRIEF point pairs per keypoint. The extractor sits
//! behind a trait so the matching stage never depends on a particular algorithm.

use serde::{Deserialize, Serialize};

use crate::capture::frame::GrayBuffer;

/// Distinctive image location with orientation (radians) and corner response.
#[derive(Debug, Clone, Copy)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub angle: f32,
    pub response: f32,
}

/// 256-bit binary descriptor = 32 bytes
pub type Descriptor = [u8; 32];

/// Keypoints and their descriptors, index-aligned.
#[derive(Default)]
pub struct FeatureSet {
    pub keypoints: Vec<Keypoint>,
    pub descriptors: Vec<Descriptor>,
}

impl FeatureSet {
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

/// The invariant feature-extraction capability used for both templates and frames.
///
/// An image without usable structure yields an empty set, never an error.
pub trait FeatureExtractor: Send + Sync {
    fn extract(&self, image: &GrayBuffer) -> FeatureSet;
}

/// Extractor tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    /// FAST intensity threshold.
    pub threshold: u8,
    /// Cap on keypoints kept after suppression, strongest first.
    pub max_keypoints: usize,
    /// Suppression radius in pixels.
    pub nms_radius: f32,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            threshold: 20,
            max_keypoints: 500,
            nms_radius: 3.0,
        }
    }
}

/// Bresenham circle of radius 3 used by the FAST segment test.
const FAST_CIRCLE: [(i32, i32); 16] = [
    (0, -3),
    (1, -3),
    (2, -2),
    (3, -1),
    (3, 0),
    (3, 1),
    (2, 2),
    (1, 3),
    (0, 3),
    (-1, 3),
    (-2, 2),
    (-3, 1),
    (-3, 0),
    (-3, -1),
    (-2, -2),
    (-1, -3),
];

/// Minimum contiguous arc for a FAST-9 corner.
const FAST_ARC: u32 = 9;

/// Sampling patch radius for orientation and descriptors.
const PATCH_RADIUS: i32 = 13;

/// Keep-out border: rotated descriptor samples must stay inside the image.
const BORDER: i32 = 20;

/// FAST + rotated-BRIEF extractor. Deterministic: the sampling pattern is fixed at
/// construction from a constant seed.
pub struct OrbExtractor {
    config: ExtractorConfig,
    pairs: Vec<((f32, f32), (f32, f32))>,
}

impl OrbExtractor {
    pub fn new(config: ExtractorConfig) -> Self {
        Self {
            config,
            pairs: brief_pairs(),
        }
    }

    fn detect(&self, image: &GrayBuffer) -> Vec<Keypoint> {
        let threshold = self.config.threshold as i32;
        let mut scored = Vec::new();

        if image.width <= 2 * BORDER as usize || image.height <= 2 * BORDER as usize {
            return scored;
        }

        for y in BORDER as usize..image.height - BORDER as usize {
            for x in BORDER as usize..image.width - BORDER as usize {
                if let Some(response) = fast_response(image, x, y, threshold) {
                    scored.push(Keypoint {
                        x: x as f32,
                        y: y as f32,
                        angle: 0.0,
                        response,
                    });
                }
            }
        }

        // Strongest-first greedy suppression
        scored.sort_by(|a, b| b.response.total_cmp(&a.response));
        let radius_sq = self.config.nms_radius * self.config.nms_radius;
        let mut kept: Vec<Keypoint> = Vec::new();
        for cand in scored {
            if kept.len() >= self.config.max_keypoints {
                break;
            }
            let suppressed = kept.iter().any(|k| {
                let dx = k.x - cand.x;
                let dy = k.y - cand.y;
                dx * dx + dy * dy <= radius_sq
            });
            if !suppressed {
                kept.push(cand);
            }
        }

        for kp in &mut kept {
            kp.angle = orientation(image, kp.x as usize, kp.y as usize);
        }
        kept
    }

    fn describe(&self, image: &GrayBuffer, kp: &Keypoint) -> Descriptor {
        let (sin, cos) = kp.angle.sin_cos();
        let cx = kp.x;
        let cy = kp.y;
        let mut desc = [0u8; 32];
        for (i, ((ax, ay), (bx, by))) in self.pairs.iter().enumerate() {
            let pa = sample(image, cx + ax * cos - ay * sin, cy + ax * sin + ay * cos);
            let pb = sample(image, cx + bx * cos - by * sin, cy + bx * sin + by * cos);
            if pa < pb {
                desc[i / 8] |= 1 << (i % 8);
            }
        }
        desc
    }
}

impl Default for OrbExtractor {
    fn default() -> Self {
        Self::new(ExtractorConfig::default())
    }
}

impl FeatureExtractor for OrbExtractor {
    fn extract(&self, image: &GrayBuffer) -> FeatureSet {
        let keypoints = self.detect(image);
        let descriptors = keypoints
            .iter()
            .map(|kp| self.describe(image, kp))
            .collect();
        FeatureSet {
            keypoints,
            descriptors,
        }
    }
}

/// FAST segment test. Returns the corner response when at least `FAST_ARC`
/// contiguous circle pixels are all brighter or all darker than center ± threshold.
fn fast_response(image: &GrayBuffer, x: usize, y: usize, threshold: i32) -> Option<f32> {
    let center = image.at(x, y) as i32;
    let mut brighter: u16 = 0;
    let mut darker: u16 = 0;

    // Short-circuit on the four compass points: any 9-arc covers at least two
    let compass = [0usize, 4, 8, 12];
    let mut hint = 0;
    for &i in &compass {
        let (dx, dy) = FAST_CIRCLE[i];
        let v = image.at((x as i32 + dx) as usize, (y as i32 + dy) as usize) as i32;
        if v >= center + threshold || v <= center - threshold {
            hint += 1;
        }
    }
    if hint < 2 {
        return None;
    }

    let mut response = 0i32;
    for (i, (dx, dy)) in FAST_CIRCLE.iter().enumerate() {
        let v = image.at((x as i32 + dx) as usize, (y as i32 + dy) as usize) as i32;
        if v >= center + threshold {
            brighter |= 1 << i;
            response += v - center - threshold;
        } else if v <= center - threshold {
            darker |= 1 << i;
            response += center - v - threshold;
        }
    }

    if has_contiguous_arc(brighter) || has_contiguous_arc(darker) {
        Some(response as f32)
    } else {
        None
    }
}

/// Circular run test on a 16-bit mask.
fn has_contiguous_arc(mask: u16) -> bool {
    if mask == 0 {
        return false;
    }
    let wrapped = (mask as u32) | ((mask as u32) << 16);
    let mut run = 0u32;
    for i in 0..32 {
        if wrapped & (1 << i) != 0 {
            run += 1;
            if run >= FAST_ARC {
                return true;
            }
        } else {
            run = 0;
        }
    }
    false
}

/// Intensity-centroid orientation over the sampling patch.
fn orientation(image: &GrayBuffer, x: usize, y: usize) -> f32 {
    let mut m10 = 0i64;
    let mut m01 = 0i64;
    for dy in -PATCH_RADIUS..=PATCH_RADIUS {
        for dx in -PATCH_RADIUS..=PATCH_RADIUS {
            if dx * dx + dy * dy > PATCH_RADIUS * PATCH_RADIUS {
                continue;
            }
            let v = image.at((x as i32 + dx) as usize, (y as i32 + dy) as usize) as i64;
            m10 += dx as i64 * v;
            m01 += dy as i64 * v;
        }
    }
    (m01 as f32).atan2(m10 as f32)
}

#[inline]
fn sample(image: &GrayBuffer, x: f32, y: f32) -> u8 {
    let xi = (x.round() as i32).clamp(0, image.width as i32 - 1) as usize;
    let yi = (y.round() as i32).clamp(0, image.height as i32 - 1) as usize;
    image.at(xi, yi)
}

/// 256 sampling pairs inside the patch, from a fixed-seed LCG so extraction is
/// repeatable across runs and hosts.
fn brief_pairs() -> Vec<((f32, f32), (f32, f32))> {
    let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
    let mut next_coord = || {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let span = (2 * PATCH_RADIUS + 1) as u64;
        ((state >> 33) % span) as f32 - PATCH_RADIUS as f32
    };
    (0..256)
        .map(|_| ((next_coord(), next_coord()), (next_coord(), next_coord())))
        .collect()
}

/// Hamming distance between two descriptors.
#[inline]
pub fn hamming(a: &Descriptor, b: &Descriptor) -> u32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x ^ y).count_ones())
        .sum()
}
