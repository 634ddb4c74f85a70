use std::collections::BTreeMap;

use tracing::debug;

use crate::model::{BoxRecord, ImageId};

const FULL_TURN_DEGREES: f64 = 360.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchConfig {
    pub max_distance: f64,
    pub angle_weight: f64,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            max_distance: 20.0,
            angle_weight: 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Assignment {
    pub detection: usize,
    pub oracle: usize,
    pub distance: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchOutcome {
    pub corrected: Vec<BoxRecord>,
    pub assignments: Vec<Assignment>,
    pub dropped: usize,
    pub images_without_oracle: usize,
}

pub fn wrapped_angle_difference(a: f64, b: f64) -> f64 {
    let diff = (a - b).rem_euclid(FULL_TURN_DEGREES);
    diff.min(FULL_TURN_DEGREES - diff)
}

pub fn match_distance(detection: &BoxRecord, oracle: &BoxRecord, config: &MatchConfig) -> f64 {
    let center = (detection.x - oracle.x).hypot(detection.y - oracle.y);
    center + config.angle_weight * wrapped_angle_difference(detection.angle, oracle.angle)
}

pub fn label(
    oracle_boxes: &[BoxRecord],
    uncertain_boxes: &[BoxRecord],
    config: &MatchConfig,
) -> MatchOutcome {
    let oracle_by_image = group_indices(oracle_boxes);
    let uncertain_by_image = group_indices(uncertain_boxes);

    let mut outcome = MatchOutcome::default();

    for (image_id, detection_indices) in uncertain_by_image {
        let Some(oracle_indices) = oracle_by_image.get(&image_id) else {
            debug!(
                image_id,
                detections = detection_indices.len(),
                "no oracle boxes for image"
            );
            outcome.images_without_oracle += 1;
            outcome.dropped += detection_indices.len();
            continue;
        };

        let mut consumed = vec![false; oracle_indices.len()];
        for detection_index in detection_indices {
            let detection = &uncertain_boxes[detection_index];
            let best = closest_unconsumed(detection, oracle_boxes, oracle_indices, &consumed, config);

            match best {
                Some((slot, distance)) => {
                    consumed[slot] = true;
                    let oracle_index = oracle_indices[slot];
                    let truth = &oracle_boxes[oracle_index];
                    outcome.corrected.push(BoxRecord::annotation(
                        truth.image_id,
                        truth.x,
                        truth.y,
                        truth.angle,
                        truth.label,
                    ));
                    outcome.assignments.push(Assignment {
                        detection: detection_index,
                        oracle: oracle_index,
                        distance,
                    });
                }
                None => {
                    debug!(
                        image_id,
                        x = detection.x,
                        y = detection.y,
                        "detection has no oracle box within cutoff"
                    );
                    outcome.dropped += 1;
                }
            }
        }
    }

    outcome
}

fn closest_unconsumed(
    detection: &BoxRecord,
    oracle_boxes: &[BoxRecord],
    oracle_indices: &[usize],
    consumed: &[bool],
    config: &MatchConfig,
) -> Option<(usize, f64)> {
    let mut best: Option<(usize, f64)> = None;

    for (slot, &oracle_index) in oracle_indices.iter().enumerate() {
        if consumed[slot] {
            continue;
        }
        let distance = match_distance(detection, &oracle_boxes[oracle_index], config);
        if distance.is_nan() || distance > config.max_distance {
            continue;
        }
        if best.is_none_or(|(_, current)| distance < current) {
            best = Some((slot, distance));
        }
    }

    best
}

fn group_indices(boxes: &[BoxRecord]) -> BTreeMap<ImageId, Vec<usize>> {
    let mut grouped = BTreeMap::<ImageId, Vec<usize>>::new();
    for (index, record) in boxes.iter().enumerate() {
        grouped.entry(record.image_id).or_default().push(index);
    }
    grouped
}
