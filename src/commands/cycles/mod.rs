use anyhow::{Result, bail};
use tracing::{info, warn};

use crate::classes::ClassTable;
use crate::cli::CyclesArgs;
use crate::commands::ActivePaths;
use crate::partition::{FilenamePartitions, Partition};
use crate::util::ensure_file;

mod cycle;
mod external;
mod orchestrator;
#[cfg(test)]
mod tests;

pub use cycle::{CheckpointLayout, Cycle};
pub use external::{ExternalDetector, ExternalTrainer};
pub use orchestrator::{CycleSettings, Orchestrator};

pub fn run(args: CyclesArgs) -> Result<()> {
    let paths = ActivePaths::from_args(&args.paths);

    if !args.image_dir.is_dir() {
        bail!("image directory does not exist: {}", args.image_dir.display());
    }
    ensure_file(&paths.class_list, "class list")?;
    ensure_file(&paths.oracle, "oracle annotations")?;
    ensure_file(&paths.validation, "validation annotations")?;
    ensure_file(&paths.filenames, "filename partition file")?;

    let classes = ClassTable::load(&paths.class_list)?;
    let config = args.reconcile.config().validated()?;
    let row_policy = args.reconcile.row_policy();

    let partitions = FilenamePartitions::load(&paths.filenames)?;
    let image_paths = partitions.image_paths(
        Partition::Unsupervised,
        &args.image_dir,
        args.extension.as_str(),
    );
    let oracle = paths
        .oracle_store()
        .load_with_policy(&classes, row_policy)?;

    info!(
        classes = classes.len(),
        unlabeled_images = image_paths.len(),
        oracle_boxes = oracle.len(),
        cycles = args.num_cycles,
        "loaded active-learning inputs"
    );

    let layout = CheckpointLayout::new(&args.save_dir);
    layout.create_dirs()?;
    let completed = layout.completed_cycles()?;

    let first = match (args.resume, completed.last()) {
        (true, Some(&last)) => {
            info!(last_completed = last, "resuming after completed cycle");
            Cycle::resumed(last, &layout)
        }
        _ => {
            if !completed.is_empty() {
                warn!(
                    completed = completed.len(),
                    "existing checkpoints will be overwritten; pass --resume to continue instead"
                );
            }
            ensure_file(&args.model, "seed model")?;
            ensure_file(&args.state_dict, "seed state dict")?;
            Cycle::first(&args.model, &args.state_dict, &layout)
        }
    };

    let detector = ExternalDetector {
        program: args.detector.clone(),
        image_paths,
        work_dir: args.save_dir.join("detections"),
    };
    let trainer = ExternalTrainer {
        program: args.trainer.clone(),
        class_list: paths.class_list.clone(),
        validation_file: paths.validation.clone(),
        images_dir: args.image_dir.clone(),
        extension: args.extension.as_str().to_string(),
        depth: args.depth,
        epochs: args.epochs,
        report_dir: args.save_dir.join("training"),
    };
    let settings = CycleSettings {
        classes: &classes,
        paths: &paths,
        oracle,
        config,
        row_policy,
        layout,
        manifest_dir: args.save_dir.join("manifests"),
    };

    let mut orchestrator = Orchestrator::new(settings, detector, trainer);
    let manifests = orchestrator.run(first, args.num_cycles)?;

    info!(
        cycles_run = manifests.len(),
        state = %orchestrator.state(),
        "active learning completed"
    );

    Ok(())
}
