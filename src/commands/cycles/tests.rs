use std::fs;
use std::path::Path;

use anyhow::{Result, bail};
use clap::Parser;
use tempfile::TempDir;

use super::cycle::CycleState;
use super::external::{Detector, Trainer, TrainingReport};
use super::*;
use crate::cli::{AnnotationPathArgs, Cli, Commands, CyclesArgs};
use crate::model::{BoxRecord, ImageId, LabelMode};
use crate::reconcile::ReconcileConfig;
use crate::store::{AnnotationSchema, AnnotationStore, LoadedAnnotations, RowError, RowPolicy};

struct FakeDetector {
    per_cycle: Vec<Vec<BoxRecord>>,
    fail_on: Option<u32>,
    rejected: Vec<RowError>,
}

impl FakeDetector {
    fn new(per_cycle: Vec<Vec<BoxRecord>>) -> Self {
        Self {
            per_cycle,
            fail_on: None,
            rejected: Vec::new(),
        }
    }
}

impl Detector for FakeDetector {
    fn detect(&mut self, cycle: &Cycle, _classes: &ClassTable) -> Result<LoadedAnnotations> {
        if self.fail_on == Some(cycle.index) {
            bail!("detector crashed");
        }
        let boxes = self
            .per_cycle
            .get(cycle.index as usize - 1)
            .cloned()
            .unwrap_or_default();
        Ok(LoadedAnnotations {
            source: "fake-detections.csv".into(),
            boxes,
            rejected: self.rejected.clone(),
        })
    }
}

struct FakeTrainer {
    classes: ClassTable,
    report: TrainingReport,
    write_checkpoints: bool,
    active_snapshots: Vec<Vec<BoxRecord>>,
}

impl FakeTrainer {
    fn new(classes: &ClassTable) -> Self {
        Self {
            classes: classes.clone(),
            report: TrainingReport::default(),
            write_checkpoints: true,
            active_snapshots: Vec::new(),
        }
    }
}

impl Trainer for &mut FakeTrainer {
    fn train(&mut self, cycle: &Cycle, train_file: &Path) -> Result<TrainingReport> {
        let active = AnnotationStore::new(train_file, AnnotationSchema::Active)
            .load_with_policy(&self.classes, RowPolicy::Strict)?;
        self.active_snapshots.push(active);
        if self.write_checkpoints {
            fs::write(&cycle.output_model, b"model")?;
            fs::write(&cycle.output_state_dict, b"state")?;
        }
        Ok(self.report.clone())
    }
}

struct Workspace {
    dir: TempDir,
    classes: ClassTable,
    paths: ActivePaths,
    layout: CheckpointLayout,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = ActivePaths::from_args(&AnnotationPathArgs {
            annotations_dir: dir.path().join("annotations"),
            active_dir: dir.path().join("active_annotations"),
            class_list: None,
            oracle_path: None,
        });
        let layout = CheckpointLayout::new(&dir.path().join("out"));
        layout.create_dirs().expect("checkpoint dirs");
        fs::create_dir_all(dir.path().join("seed")).expect("seed dir");
        fs::write(dir.path().join("seed").join("model.pt"), b"m").expect("seed model");
        fs::write(dir.path().join("seed").join("state.pt"), b"s").expect("seed state");

        Self {
            dir,
            classes: ClassTable::from_pairs([("stigma", 0)]).expect("classes"),
            paths,
            layout,
        }
    }

    fn first_cycle(&self) -> Cycle {
        Cycle::first(
            &self.dir.path().join("seed").join("model.pt"),
            &self.dir.path().join("seed").join("state.pt"),
            &self.layout,
        )
    }

    fn settings(&self, oracle: Vec<BoxRecord>) -> CycleSettings<'_> {
        CycleSettings {
            classes: &self.classes,
            paths: &self.paths,
            oracle,
            config: ReconcileConfig::default(),
            row_policy: RowPolicy::Strict,
            layout: self.layout.clone(),
            manifest_dir: self.dir.path().join("out").join("manifests"),
        }
    }

    fn stored_ids(&self) -> Vec<ImageId> {
        self.paths
            .corrected_store()
            .load_with_policy(&self.classes, RowPolicy::Strict)
            .expect("corrected store")
            .iter()
            .map(|record| record.image_id)
            .collect()
    }
}

fn det(image_id: ImageId, x: f64, y: f64, angle: f64, score: f64) -> BoxRecord {
    BoxRecord::detection(image_id, x, y, angle, 0, score)
}

fn oracle() -> Vec<BoxRecord> {
    vec![
        BoxRecord::annotation(1, 10.0, 10.0, 0.0, 0),
        BoxRecord::annotation(2, 50.0, 50.0, 90.0, 0),
        BoxRecord::annotation(3, 100.0, 100.0, 180.0, 0),
    ]
}

#[test]
fn images_are_corrected_once_across_cycles() {
    let workspace = Workspace::new();
    let detector = FakeDetector::new(vec![
        vec![
            det(1, 10.5, 10.0, 0.0, 0.2),
            det(2, 50.0, 50.0, 90.0, 0.9),
            det(3, 300.0, 300.0, 0.0, 0.1),
        ],
        vec![
            det(1, 10.0, 10.0, 0.0, 0.1),
            det(2, 50.2, 50.0, 90.0, 0.3),
            det(3, 100.0, 100.0, 180.0, 0.95),
        ],
        vec![
            det(1, 10.0, 10.0, 0.0, 0.1),
            det(2, 50.0, 50.0, 90.0, 0.1),
            det(3, 100.1, 100.0, 180.0, 0.2),
        ],
    ]);
    let mut trainer = FakeTrainer::new(&workspace.classes);

    let mut orchestrator =
        Orchestrator::new(workspace.settings(oracle()), detector, &mut trainer);
    let manifests = orchestrator
        .run(workspace.first_cycle(), 3)
        .expect("three cycles");

    assert_eq!(orchestrator.state(), CycleState::Done);
    assert_eq!(manifests.len(), 3);
    assert_eq!(manifests[0].counts.corrected, 1);
    assert_eq!(manifests[0].counts.dropped, 1);
    assert_eq!(manifests[1].counts.noisy_excluded, 1);
    assert_eq!(manifests[1].counts.corrected, 1);
    assert_eq!(manifests[2].counts.noisy_excluded, 2);
    assert_eq!(manifests[2].counts.corrected, 1);
    assert!(manifests.iter().all(|manifest| manifest.status == "trained"));

    assert_eq!(workspace.stored_ids(), vec![1, 2, 3]);

    let last_active = trainer.active_snapshots.last().expect("three snapshots");
    let ids: Vec<ImageId> = last_active.iter().map(|record| record.image_id).collect();
    assert_eq!(ids, vec![1, 1, 2, 2, 3]);
    let corrected = last_active
        .iter()
        .filter(|record| record.mode == Some(LabelMode::Corrected))
        .count();
    assert_eq!(corrected, 3);

    for index in 1..=3 {
        assert!(workspace.layout.model_path(index).is_file());
    }
    assert!(
        workspace
            .dir
            .path()
            .join("out")
            .join("manifests")
            .join("cycle_3.json")
            .is_file()
    );
}

#[test]
fn failed_cycle_leaves_previous_store_in_place() {
    let workspace = Workspace::new();
    let mut detector = FakeDetector::new(vec![vec![det(1, 10.0, 10.0, 0.0, 0.2)]]);
    detector.fail_on = Some(2);
    let mut trainer = FakeTrainer::new(&workspace.classes);

    let mut orchestrator =
        Orchestrator::new(workspace.settings(oracle()), detector, &mut trainer);
    let err = orchestrator
        .run(workspace.first_cycle(), 2)
        .expect_err("second cycle fails");

    assert!(format!("{err:#}").contains("cycle 2 aborted"));
    assert_eq!(workspace.stored_ids(), vec![1]);
    assert_eq!(orchestrator.state(), CycleState::Detecting);
}

#[test]
fn malformed_detections_abort_before_persisting() {
    let workspace = Workspace::new();
    let mut detector = FakeDetector::new(vec![vec![det(1, 10.0, 10.0, 0.0, 0.2)]]);
    detector.rejected = vec![RowError {
        line: 4,
        message: "unknown class name 'petal'".to_string(),
    }];
    let mut trainer = FakeTrainer::new(&workspace.classes);

    let mut orchestrator =
        Orchestrator::new(workspace.settings(oracle()), detector, &mut trainer);
    let err = orchestrator
        .run(workspace.first_cycle(), 1)
        .expect_err("strict rows");

    assert!(format!("{err:#}").contains("line 4"));
    assert!(!workspace.paths.corrected.exists());
    assert!(!workspace.paths.train.exists());
    assert!(trainer.active_snapshots.is_empty());
}

#[test]
fn skipped_training_batches_are_reported_not_fatal() {
    let workspace = Workspace::new();
    let detector = FakeDetector::new(vec![vec![det(2, 50.0, 50.0, 90.0, 0.2)]]);
    let mut trainer = FakeTrainer::new(&workspace.classes);
    trainer.report = serde_json::from_str(
        r#"{"epochs": [{"epoch": 0, "mean_loss": 0.7, "map": 0.5,
            "batches": [{"status": "completed", "loss": 0.7},
                        {"status": "skipped", "iteration": 1, "reason": "nan loss"}]}]}"#,
    )
    .expect("valid report");

    let mut orchestrator =
        Orchestrator::new(workspace.settings(oracle()), detector, &mut trainer);
    let manifests = orchestrator
        .run(workspace.first_cycle(), 1)
        .expect("skipped batches do not abort");

    let training = manifests[0].training.as_ref().expect("training summary");
    assert_eq!(training.completed_batches, 1);
    assert_eq!(training.skipped_batches, 1);
    assert_eq!(manifests[0].warnings.len(), 1);
}

#[test]
fn missing_checkpoints_after_training_fail_the_cycle() {
    let workspace = Workspace::new();
    let detector = FakeDetector::new(Vec::new());
    let mut trainer = FakeTrainer::new(&workspace.classes);
    trainer.write_checkpoints = false;

    let mut orchestrator =
        Orchestrator::new(workspace.settings(oracle()), detector, &mut trainer);
    let err = orchestrator
        .run(workspace.first_cycle(), 1)
        .expect_err("no checkpoints");

    assert!(format!("{err:#}").contains("trained model"));
}

#[test]
fn empty_detections_still_complete_a_cycle() {
    let workspace = Workspace::new();
    let detector = FakeDetector::new(vec![Vec::new()]);
    let mut trainer = FakeTrainer::new(&workspace.classes);

    let mut orchestrator =
        Orchestrator::new(workspace.settings(oracle()), detector, &mut trainer);
    let manifests = orchestrator
        .run(workspace.first_cycle(), 1)
        .expect("empty cycle");

    assert_eq!(manifests[0].counts.detections, 0);
    assert_eq!(manifests[0].counts.active_size, 0);
    assert!(workspace.paths.corrected.is_file());
    assert!(workspace.stored_ids().is_empty());
}

fn cycles_args(root: &Path, extra: &[&str]) -> CyclesArgs {
    let root = root.display().to_string();
    let mut argv = vec![
        "saffron-active".to_string(),
        "cycles".to_string(),
        "-i".to_string(),
        format!("{root}/images"),
        "-m".to_string(),
        format!("{root}/seed/model.pt"),
        "-s".to_string(),
        format!("{root}/seed/state.pt"),
        "-o".to_string(),
        format!("{root}/out"),
        "-c".to_string(),
        "1".to_string(),
        "-d".to_string(),
        "18".to_string(),
        "--annotations-dir".to_string(),
        format!("{root}/annotations"),
        "--active-dir".to_string(),
        format!("{root}/active_annotations"),
    ];
    argv.extend(extra.iter().map(|arg| arg.to_string()));

    let cli = Cli::try_parse_from(argv).expect("valid invocation");
    let Commands::Cycles(args) = cli.command else {
        panic!("expected cycles command");
    };
    args
}

fn write_annotation_inputs(root: &Path) {
    fs::create_dir_all(root.join("images")).expect("images dir");
    fs::create_dir_all(root.join("annotations")).expect("annotations dir");
    fs::write(root.join("annotations").join("labels.csv"), "stigma,0\n").expect("class list");
    fs::write(root.join("annotations").join("unsupervised.csv"), "1,10,10,0,stigma\n")
        .expect("oracle");
    fs::write(root.join("annotations").join("validation.csv"), "").expect("validation");
    fs::write(root.join("annotations").join("filenames.json"), "{}").expect("filenames");
}

#[test]
fn run_fails_without_class_list() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_annotation_inputs(dir.path());
    fs::remove_file(dir.path().join("annotations").join("labels.csv")).expect("remove labels");

    let err = run(cycles_args(dir.path(), &[])).expect_err("class list is required");

    assert!(format!("{err:#}").contains("class list does not exist"));
    assert!(!dir.path().join("out").exists());
}

#[test]
fn run_fails_without_image_dir_or_seed_model() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_annotation_inputs(dir.path());
    fs::remove_dir(dir.path().join("images")).expect("remove images");

    let err = run(cycles_args(dir.path(), &[])).expect_err("image dir is required");
    assert!(format!("{err:#}").contains("image directory does not exist"));

    fs::create_dir_all(dir.path().join("images")).expect("images dir");
    let err = run(cycles_args(dir.path(), &[])).expect_err("seed model is required");
    assert!(format!("{err:#}").contains("seed model does not exist"));
}

#[test]
fn run_rejects_invalid_reconcile_config() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_annotation_inputs(dir.path());

    let err = run(cycles_args(dir.path(), &["--score-threshold", "1.5"]))
        .expect_err("threshold above one");

    assert!(format!("{err:#}").contains("score threshold 1.5 is outside [0, 1]"));
}
