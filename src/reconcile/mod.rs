use std::collections::HashSet;

use thiserror::Error;
use tracing::{info, warn};

use crate::model::{BoxRecord, ImageId, LabelMode, ReconcileCounts};

mod accumulate;
mod matcher;
mod split;

use accumulate::accumulate;
use matcher::label;
use split::split_uncertain_and_noisy;

pub use matcher::MatchConfig;

#[derive(Debug, Error, PartialEq)]
pub enum ReconcileError {
    #[error(
        "corrected store already holds images {image_ids:?}; they must have been excluded from uncertainty splitting"
    )]
    ImageCorrectedTwice { image_ids: Vec<ImageId> },

    #[error("box of image {image_id} is already tagged {existing}, cannot re-tag as {requested}")]
    ModeReassigned {
        image_id: ImageId,
        existing: LabelMode,
        requested: LabelMode,
    },

    #[error("invalid reconciliation config: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconcileConfig {
    pub score_threshold: f64,
    pub matching: MatchConfig,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            score_threshold: 0.5,
            matching: MatchConfig::default(),
        }
    }
}

impl ReconcileConfig {
    pub fn validated(self) -> Result<Self, ReconcileError> {
        if !(0.0..=1.0).contains(&self.score_threshold) {
            return Err(ReconcileError::InvalidConfig(format!(
                "score threshold {} is outside [0, 1]",
                self.score_threshold
            )));
        }
        if !self.matching.max_distance.is_finite() || self.matching.max_distance <= 0.0 {
            return Err(ReconcileError::InvalidConfig(format!(
                "max match distance {} must be a positive number",
                self.matching.max_distance
            )));
        }
        if !self.matching.angle_weight.is_finite() || self.matching.angle_weight < 0.0 {
            return Err(ReconcileError::InvalidConfig(format!(
                "angle weight {} must be a non-negative number",
                self.matching.angle_weight
            )));
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Reconciliation {
    pub corrected_store: Vec<BoxRecord>,
    pub active: Vec<BoxRecord>,
    pub counts: ReconcileCounts,
}

pub fn excluded_names(corrected_store: &[BoxRecord]) -> HashSet<ImageId> {
    corrected_store.iter().map(|record| record.image_id).collect()
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Stage {
    Splitting,
    Matching,
    Accumulating,
}

pub fn reconcile(
    detections: Vec<BoxRecord>,
    oracle: &[BoxRecord],
    corrected_store: Vec<BoxRecord>,
    config: &ReconcileConfig,
) -> Result<Reconciliation, ReconcileError> {
    reconcile_with(detections, oracle, corrected_store, config, |_| {})
}

pub fn reconcile_with<F>(
    detections: Vec<BoxRecord>,
    oracle: &[BoxRecord],
    corrected_store: Vec<BoxRecord>,
    config: &ReconcileConfig,
    mut on_stage: F,
) -> Result<Reconciliation, ReconcileError>
where
    F: FnMut(Stage),
{
    let detection_count = detections.len();
    let previous_store_size = corrected_store.len();
    let excluded = excluded_names(&corrected_store);

    on_stage(Stage::Splitting);
    let split = split_uncertain_and_noisy(detections, &excluded, config.score_threshold);
    info!(
        detections = detection_count,
        uncertain = split.uncertain.len(),
        noisy = split.noisy.len(),
        excluded_images = excluded.len(),
        "split detections"
    );

    on_stage(Stage::Matching);
    let matched = label(oracle, &split.uncertain, &config.matching);
    if matched.dropped > 0 {
        warn!(
            dropped = matched.dropped,
            images_without_oracle = matched.images_without_oracle,
            "uncertain detections without an oracle match were dropped"
        );
    }
    info!(
        corrected = matched.corrected.len(),
        dropped = matched.dropped,
        "matched uncertain detections against oracle"
    );

    let counts_before_accumulate = ReconcileCounts {
        detections: detection_count,
        uncertain: split.uncertain.len(),
        noisy: split.noisy.len(),
        noisy_excluded: split.noisy_excluded,
        noisy_confident: split.noisy_confident,
        corrected: matched.corrected.len(),
        dropped: matched.dropped,
        uncertain_images_without_oracle: matched.images_without_oracle,
        previous_store_size,
        ..ReconcileCounts::default()
    };

    on_stage(Stage::Accumulating);
    let accumulated = accumulate(matched.corrected, split.noisy, corrected_store)?;
    let counts = ReconcileCounts {
        store_size: accumulated.corrected_store.len(),
        active_size: accumulated.active.len(),
        ..counts_before_accumulate
    };
    info!(
        store = counts.store_size,
        active = counts.active_size,
        "accumulated active training set"
    );

    Ok(Reconciliation {
        corrected_store: accumulated.corrected_store,
        active: accumulated.active,
        counts,
    })
}
