//! Reference templates and the hot-swappable set that holds them

use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::{info, warn};

use crate::capture::decode::{decode_reference_bytes, decode_reference_path};
use crate::capture::frame::PixelBuffer;
use crate::error::ReferenceError;
use crate::matcher::{FeatureExtractor, FeatureSet};

/// A known target image plus its precomputed features. Immutable once built:
/// descriptors always correspond to the stored pixels because both are set in the
/// same construction.
pub struct ReferenceTemplate {
    pub slot: String,
    pub pixels: PixelBuffer,
    pub features: FeatureSet,
}

/// Consistent read-only view for one processing cycle.
pub struct ReferenceTable {
    slots: Vec<Arc<ReferenceTemplate>>,
}

impl ReferenceTable {
    pub fn slots(&self) -> &[Arc<ReferenceTemplate>] {
        &self.slots
    }

    pub fn get(&self, slot: &str) -> Option<&Arc<ReferenceTemplate>> {
        self.slots.iter().find(|t| t.slot == slot)
    }
}

/// Ordered slot -> template mapping with atomic whole-table replacement.
///
/// `load` swaps the table in one atomic store, so matchers holding an older
/// snapshot keep a consistent view and new snapshots see the new template.
pub struct ReferenceSet {
    table: ArcSwap<ReferenceTable>,
    extractor: Arc<dyn FeatureExtractor>,
}

impl ReferenceSet {
    pub fn new(extractor: Arc<dyn FeatureExtractor>) -> Self {
        Self {
            table: ArcSwap::from_pointee(ReferenceTable { slots: Vec::new() }),
            extractor,
        }
    }

    /// Extract features from `pixels` and, only on success, install the result as
    /// the slot's new template. Slot order is first-load order.
    pub fn load(&self, slot: &str, pixels: PixelBuffer) -> Result<usize, ReferenceError> {
        let features = self.extractor.extract(&pixels.to_gray());
        if features.is_empty() {
            return Err(ReferenceError::FeatureExtractionFailed);
        }
        let count = features.len();
        let template = Arc::new(ReferenceTemplate {
            slot: slot.to_string(),
            pixels,
            features,
        });

        self.table.rcu(|table| {
            let mut slots = table.slots.clone();
            match slots.iter_mut().find(|t| t.slot == slot) {
                Some(entry) => *entry = Arc::clone(&template),
                None => slots.push(Arc::clone(&template)),
            }
            ReferenceTable { slots }
        });

        info!(slot, descriptors = count, "reference template installed");
        Ok(count)
    }

    /// Current templates for one processing cycle.
    pub fn snapshot(&self) -> Arc<ReferenceTable> {
        self.table.load_full()
    }
}

/// Where a reload gets its image from.
pub enum ReloadSource {
    Bytes(Vec<u8>),
    Path(PathBuf),
}

/// Per-slot reload result; partial success across slots is expected.
pub struct SlotOutcome {
    pub slot: String,
    pub result: Result<usize, ReferenceError>,
}

/// Decode and install each request, reporting per-slot outcomes. A failed slot
/// leaves its previous template active.
pub fn reload_slots(
    set: &ReferenceSet,
    requests: Vec<(String, ReloadSource)>,
) -> Vec<SlotOutcome> {
    requests
        .into_iter()
        .map(|(slot, source)| {
            let result = decode(source).and_then(|pixels| set.load(&slot, pixels));
            if let Err(e) = &result {
                warn!(slot, error = %e, "reference reload failed");
            }
            SlotOutcome { slot, result }
        })
        .collect()
}

fn decode(source: ReloadSource) -> Result<PixelBuffer, ReferenceError> {
    match source {
        ReloadSource::Bytes(bytes) => decode_reference_bytes(&bytes),
        ReloadSource::Path(path) => decode_reference_path(&path),
    }
}
