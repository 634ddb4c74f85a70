use std::fmt;

use serde::{Deserialize, Serialize};

use crate::reconcile::ReconcileError;

pub type ImageId = u64;
pub type ClassId = u32;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelMode {
    Corrected,
    Noisy,
}

impl LabelMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Corrected => "corrected",
            Self::Noisy => "noisy",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "corrected" => Some(Self::Corrected),
            "noisy" => Some(Self::Noisy),
            _ => None,
        }
    }
}

impl fmt::Display for LabelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoxRecord {
    pub image_id: ImageId,
    pub x: f64,
    pub y: f64,
    pub angle: f64,
    pub label: ClassId,
    pub score: Option<f64>,
    pub mode: Option<LabelMode>,
}

impl BoxRecord {
    pub fn annotation(image_id: ImageId, x: f64, y: f64, angle: f64, label: ClassId) -> Self {
        Self {
            image_id,
            x,
            y,
            angle,
            label,
            score: None,
            mode: None,
        }
    }

    #[cfg(test)]
    pub fn detection(
        image_id: ImageId,
        x: f64,
        y: f64,
        angle: f64,
        label: ClassId,
        score: f64,
    ) -> Self {
        Self {
            score: Some(score),
            ..Self::annotation(image_id, x, y, angle, label)
        }
    }

    pub fn tagged(mut self, mode: LabelMode) -> Result<Self, ReconcileError> {
        match self.mode {
            Some(existing) if existing != mode => Err(ReconcileError::ModeReassigned {
                image_id: self.image_id,
                existing,
                requested: mode,
            }),
            _ => {
                self.mode = Some(mode);
                Ok(self)
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconcileCounts {
    pub detections: usize,
    pub uncertain: usize,
    pub noisy: usize,
    pub noisy_excluded: usize,
    pub noisy_confident: usize,
    pub corrected: usize,
    pub dropped: usize,
    pub uncertain_images_without_oracle: usize,
    pub previous_store_size: usize,
    pub store_size: usize,
    pub active_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedFile {
    pub path: String,
    pub sha256: String,
    pub rows: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TrainingSummary {
    pub epochs: usize,
    pub completed_batches: usize,
    pub skipped_batches: usize,
    pub best_map: Option<f64>,
    pub final_mean_loss: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CyclePaths {
    pub input_model: String,
    pub input_state_dict: String,
    pub output_model: String,
    pub output_state_dict: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub cycle: u32,
    pub status: String,
    pub started_at: String,
    pub updated_at: String,
    pub paths: CyclePaths,
    pub counts: ReconcileCounts,
    pub active_file: PersistedFile,
    pub corrected_file: PersistedFile,
    pub training: Option<TrainingSummary>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub generated_at: String,
    pub detections_path: String,
    pub oracle_path: String,
    pub counts: ReconcileCounts,
    pub active_file: PersistedFile,
    pub corrected_file: PersistedFile,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionInventoryEntry {
    pub partition: String,
    pub listed: usize,
    pub present: usize,
    pub missing: Vec<String>,
    pub non_numeric: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageInventoryManifest {
    pub manifest_version: u32,
    pub generated_at: String,
    pub images_dir: String,
    pub extension: String,
    pub partitions: Vec<PartitionInventoryEntry>,
}
