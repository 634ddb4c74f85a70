use std::collections::{BTreeSet, HashSet};

use crate::model::{BoxRecord, ImageId, LabelMode};

use super::ReconcileError;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Accumulated {
    pub corrected_store: Vec<BoxRecord>,
    pub active: Vec<BoxRecord>,
}

pub fn accumulate(
    corrected_this_cycle: Vec<BoxRecord>,
    noisy_this_cycle: Vec<BoxRecord>,
    corrected_store: Vec<BoxRecord>,
) -> Result<Accumulated, ReconcileError> {
    let stored: HashSet<ImageId> = corrected_store.iter().map(|record| record.image_id).collect();
    let repeated: BTreeSet<ImageId> = corrected_this_cycle
        .iter()
        .map(|record| record.image_id)
        .filter(|image_id| stored.contains(image_id))
        .collect();
    if !repeated.is_empty() {
        return Err(ReconcileError::ImageCorrectedTwice {
            image_ids: repeated.into_iter().collect(),
        });
    }

    let mut new_store = corrected_store;
    new_store.extend(corrected_this_cycle);

    let mut active = Vec::with_capacity(new_store.len() + noisy_this_cycle.len());
    for record in &new_store {
        active.push(record.clone().tagged(LabelMode::Corrected)?);
    }
    for record in noisy_this_cycle {
        active.push(record.tagged(LabelMode::Noisy)?);
    }
    active.sort_by_key(|record| record.image_id);

    Ok(Accumulated {
        corrected_store: new_store,
        active,
    })
}
