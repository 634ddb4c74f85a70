use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::classes::ClassTable;
use crate::model::TrainingSummary;
use crate::store::{AnnotationSchema, AnnotationStore, LoadedAnnotations};
use crate::util::{ensure_directory, write_atomic};

use super::cycle::Cycle;

pub trait Detector {
    fn detect(&mut self, cycle: &Cycle, classes: &ClassTable) -> Result<LoadedAnnotations>;
}

pub trait Trainer {
    fn train(&mut self, cycle: &Cycle, train_file: &Path) -> Result<TrainingReport>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchOutcome {
    Completed {
        loss: f64,
    },
    Skipped {
        #[serde(default)]
        iteration: Option<u64>,
        reason: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EpochReport {
    pub epoch: u32,
    #[serde(default)]
    pub mean_loss: Option<f64>,
    #[serde(default)]
    pub map: Option<f64>,
    #[serde(default)]
    pub batches: Vec<BatchOutcome>,
}

impl EpochReport {
    pub fn skipped(&self) -> impl Iterator<Item = (Option<u64>, &str)> {
        self.batches.iter().filter_map(|batch| match batch {
            BatchOutcome::Skipped { iteration, reason } => Some((*iteration, reason.as_str())),
            BatchOutcome::Completed { .. } => None,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    #[serde(default)]
    pub epochs: Vec<EpochReport>,
}

impl TrainingReport {
    pub fn summary(&self) -> TrainingSummary {
        let mut summary = TrainingSummary {
            epochs: self.epochs.len(),
            ..TrainingSummary::default()
        };

        for epoch in &self.epochs {
            for batch in &epoch.batches {
                match batch {
                    BatchOutcome::Completed { .. } => summary.completed_batches += 1,
                    BatchOutcome::Skipped { .. } => summary.skipped_batches += 1,
                }
            }
            if let Some(map) = epoch.map {
                summary.best_map = Some(summary.best_map.map_or(map, |best| best.max(map)));
            }
        }
        summary.final_mean_loss = self.epochs.last().and_then(|epoch| epoch.mean_loss);

        summary
    }
}

#[derive(Debug, Clone)]
pub struct ExternalDetector {
    pub program: PathBuf,
    pub image_paths: Vec<PathBuf>,
    pub work_dir: PathBuf,
}

impl Detector for ExternalDetector {
    fn detect(&mut self, cycle: &Cycle, classes: &ClassTable) -> Result<LoadedAnnotations> {
        ensure_directory(&self.work_dir)?;
        let image_list_path = self.work_dir.join(format!("cycle_{}_images.txt", cycle.index));
        let output_path = self.work_dir.join(format!("cycle_{}_detections.csv", cycle.index));

        write_atomic(&image_list_path, |writer| {
            for path in &self.image_paths {
                writeln!(writer, "{}", path.display())?;
            }
            Ok(())
        })?;
        if output_path.exists() {
            fs::remove_file(&output_path).with_context(|| {
                format!("failed to clear stale detections {}", output_path.display())
            })?;
        }

        info!(
            cycle = cycle.index,
            program = %self.program.display(),
            images = self.image_paths.len(),
            "running detector"
        );

        let mut command = Command::new(&self.program);
        command
            .arg("--model")
            .arg(&cycle.input_model)
            .arg("--image-list")
            .arg(&image_list_path)
            .arg("--output")
            .arg(&output_path);
        run_to_completion(&mut command, &self.program)?;

        if !output_path.is_file() {
            bail!(
                "detector did not produce expected output {}",
                output_path.display()
            );
        }

        AnnotationStore::new(&output_path, AnnotationSchema::Detections).load(classes)
    }
}

#[derive(Debug, Clone)]
pub struct ExternalTrainer {
    pub program: PathBuf,
    pub class_list: PathBuf,
    pub validation_file: PathBuf,
    pub images_dir: PathBuf,
    pub extension: String,
    pub depth: u32,
    pub epochs: u32,
    pub report_dir: PathBuf,
}

impl Trainer for ExternalTrainer {
    fn train(&mut self, cycle: &Cycle, train_file: &Path) -> Result<TrainingReport> {
        ensure_directory(&self.report_dir)?;
        let report_path = self.report_dir.join(format!("cycle_{}_training.json", cycle.index));

        info!(
            cycle = cycle.index,
            program = %self.program.display(),
            depth = self.depth,
            epochs = self.epochs,
            "running trainer"
        );

        let mut command = Command::new(&self.program);
        command
            .arg("--train-file")
            .arg(train_file)
            .arg("--class-list")
            .arg(&self.class_list)
            .arg("--validation-file")
            .arg(&self.validation_file)
            .arg("--images-dir")
            .arg(&self.images_dir)
            .arg("--extension")
            .arg(&self.extension)
            .arg("--depth")
            .arg(self.depth.to_string())
            .arg("--epochs")
            .arg(self.epochs.to_string())
            .arg("--checkpoint")
            .arg(&cycle.input_state_dict)
            .arg("--model-out")
            .arg(&cycle.output_model)
            .arg("--state-dict-out")
            .arg(&cycle.output_state_dict)
            .arg("--report")
            .arg(&report_path);
        run_to_completion(&mut command, &self.program)?;

        let raw = fs::read(&report_path)
            .with_context(|| format!("failed to read training report {}", report_path.display()))?;
        serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse training report {}", report_path.display()))
    }
}

fn run_to_completion(command: &mut Command, program: &Path) -> Result<()> {
    let status = command
        .status()
        .with_context(|| format!("failed to execute {}", program.display()))?;

    if !status.success() {
        bail!(
            "{} returned non-zero exit status: {}",
            program.display(),
            status
        );
    }

    Ok(())
}
