use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};

use crate::classes::ClassTable;
use crate::commands::{ActivePaths, persist_reconciliation};
use crate::model::{BoxRecord, CycleRunManifest, TrainingSummary};
use crate::reconcile::{ReconcileConfig, reconcile_with};
use crate::store::RowPolicy;
use crate::util::{ensure_file, now_utc_string, utc_compact_string, write_json_pretty};

use super::cycle::{CheckpointLayout, Cycle, CycleState};
use super::external::{Detector, Trainer, TrainingReport};

pub struct CycleSettings<'a> {
    pub classes: &'a ClassTable,
    pub paths: &'a ActivePaths,
    pub oracle: Vec<BoxRecord>,
    pub config: ReconcileConfig,
    pub row_policy: RowPolicy,
    pub layout: CheckpointLayout,
    pub manifest_dir: PathBuf,
}

pub struct Orchestrator<'a, D, T> {
    settings: CycleSettings<'a>,
    detector: D,
    trainer: T,
    state: CycleState,
    run_id: String,
}

impl<'a, D: Detector, T: Trainer> Orchestrator<'a, D, T> {
    pub fn new(settings: CycleSettings<'a>, detector: D, trainer: T) -> Self {
        Self {
            settings,
            detector,
            trainer,
            state: CycleState::Idle,
            run_id: format!("run-{}", utc_compact_string(Utc::now())),
        }
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn run(&mut self, first: Cycle, last_index: u32) -> Result<Vec<CycleRunManifest>> {
        let mut manifests = Vec::new();
        let mut cycle = first;

        while cycle.index <= last_index {
            let manifest = self
                .run_cycle(&cycle)
                .with_context(|| format!("cycle {} aborted", cycle.index))?;
            manifests.push(manifest);
            cycle = cycle.next(&self.settings.layout);
        }

        advance(&mut self.state, cycle.index.saturating_sub(1), CycleState::Done);
        Ok(manifests)
    }

    fn run_cycle(&mut self, cycle: &Cycle) -> Result<CycleRunManifest> {
        let started_at = now_utc_string();
        info!(cycle = cycle.index, run_id = %self.run_id, "starting cycle");

        advance(&mut self.state, cycle.index, CycleState::Detecting);
        ensure_file(&cycle.input_model, "model")?;
        ensure_file(&cycle.input_state_dict, "state dict")?;
        let detections = self
            .detector
            .detect(cycle, self.settings.classes)?
            .into_boxes(self.settings.row_policy)?;

        let corrected_store = self
            .settings
            .paths
            .corrected_store()
            .load_or_empty(self.settings.classes)?
            .into_boxes(RowPolicy::Strict)?;

        let state = &mut self.state;
        let reconciliation = reconcile_with(
            detections,
            &self.settings.oracle,
            corrected_store,
            &self.settings.config,
            |stage| advance(state, cycle.index, stage.into()),
        )?;

        advance(&mut self.state, cycle.index, CycleState::Persisting);
        let (active_file, corrected_file) =
            persist_reconciliation(self.settings.paths, self.settings.classes, &reconciliation)?;

        let mut manifest = CycleRunManifest {
            manifest_version: 1,
            run_id: self.run_id.clone(),
            cycle: cycle.index,
            status: "persisted".to_string(),
            started_at,
            updated_at: now_utc_string(),
            paths: cycle.manifest_paths(),
            counts: reconciliation.counts,
            active_file,
            corrected_file,
            training: None,
            warnings: Vec::new(),
        };
        let manifest_path = self
            .settings
            .manifest_dir
            .join(format!("cycle_{}.json", cycle.index));
        write_json_pretty(&manifest_path, &manifest)?;

        advance(&mut self.state, cycle.index, CycleState::Training);
        let report = self.trainer.train(cycle, &self.settings.paths.train)?;
        let summary = report_training(cycle.index, &report, &mut manifest.warnings);

        ensure_file(&cycle.output_model, "trained model")?;
        ensure_file(&cycle.output_state_dict, "trained state dict")?;

        manifest.status = "trained".to_string();
        manifest.updated_at = now_utc_string();
        manifest.training = Some(summary);
        write_json_pretty(&manifest_path, &manifest)?;

        info!(
            cycle = cycle.index,
            path = %manifest_path.display(),
            "cycle completed"
        );

        Ok(manifest)
    }
}

fn advance(state: &mut CycleState, cycle: u32, next: CycleState) {
    debug_assert!(
        state.allows(next),
        "illegal cycle transition {state} -> {next}"
    );
    info!(cycle, from = %state, to = %next, "cycle state");
    *state = next;
}

fn report_training(cycle: u32, report: &TrainingReport, warnings: &mut Vec<String>) -> TrainingSummary {
    for epoch in &report.epochs {
        for (iteration, reason) in epoch.skipped() {
            warn!(cycle, epoch = epoch.epoch, ?iteration, reason, "training batch skipped");
        }
    }

    let summary = report.summary();
    if summary.skipped_batches > 0 {
        warnings.push(format!(
            "{} of {} training batches were skipped",
            summary.skipped_batches,
            summary.skipped_batches + summary.completed_batches
        ));
    }
    info!(
        cycle,
        epochs = summary.epochs,
        completed_batches = summary.completed_batches,
        skipped_batches = summary.skipped_batches,
        best_map = ?summary.best_map,
        "training finished"
    );

    summary
}
