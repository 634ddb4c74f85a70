use std::collections::HashSet;

use crate::model::{BoxRecord, ImageId};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Split {
    pub uncertain: Vec<BoxRecord>,
    pub noisy: Vec<BoxRecord>,
    pub noisy_excluded: usize,
    pub noisy_confident: usize,
}

pub fn split_uncertain_and_noisy(
    detections: Vec<BoxRecord>,
    excluded_names: &HashSet<ImageId>,
    score_threshold: f64,
) -> Split {
    let mut split = Split::default();

    for detection in detections {
        if excluded_names.contains(&detection.image_id) {
            split.noisy_excluded += 1;
            split.noisy.push(detection);
        } else if detection.score.is_some_and(|score| score > score_threshold) {
            split.noisy_confident += 1;
            split.noisy.push(detection);
        } else {
            split.uncertain.push(detection);
        }
    }

    split
}
