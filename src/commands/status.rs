use std::collections::HashSet;
use std::fs;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::classes::ClassTable;
use crate::cli::StatusArgs;
use crate::commands::ActivePaths;
use crate::commands::cycles::CheckpointLayout;
use crate::model::{CycleRunManifest, LabelMode};

pub fn run(args: StatusArgs) -> Result<()> {
    let paths = ActivePaths::from_args(&args.paths);

    info!(active_dir = %args.paths.active_dir.display(), "status requested");

    if paths.class_list.exists() {
        let classes = ClassTable::load(&paths.class_list)?;
        info!(path = %paths.class_list.display(), classes = classes.len(), "loaded class list");

        report_stores(&paths, &classes)?;
    } else {
        warn!(path = %paths.class_list.display(), "class list missing");
    }

    if let Some(save_dir) = &args.save_dir {
        let layout = CheckpointLayout::new(save_dir);
        let completed = layout.completed_cycles()?;
        info!(
            save_dir = %save_dir.display(),
            completed_cycles = completed.len(),
            last_cycle = completed.last().copied().unwrap_or_default(),
            "checkpoint status"
        );

        if let Some(&last) = completed.last() {
            let manifest_path = save_dir.join("manifests").join(format!("cycle_{last}.json"));
            if manifest_path.exists() {
                let raw = fs::read(&manifest_path)
                    .with_context(|| format!("failed to read {}", manifest_path.display()))?;
                let manifest: CycleRunManifest = serde_json::from_slice(&raw)
                    .with_context(|| format!("failed to parse {}", manifest_path.display()))?;
                info!(
                    cycle = manifest.cycle,
                    status = %manifest.status,
                    updated_at = %manifest.updated_at,
                    corrected = manifest.counts.corrected,
                    store = manifest.counts.store_size,
                    active = manifest.counts.active_size,
                    skipped_batches = manifest.training.as_ref().map(|t| t.skipped_batches).unwrap_or_default(),
                    "loaded last cycle manifest"
                );
            } else {
                warn!(path = %manifest_path.display(), "cycle manifest missing");
            }
        }
    }

    Ok(())
}

fn report_stores(paths: &ActivePaths, classes: &ClassTable) -> Result<()> {
    let corrected_store = paths.corrected_store();
    if corrected_store.exists() {
        let loaded = corrected_store.load(classes)?;
        let images: HashSet<_> = loaded.boxes.iter().map(|record| record.image_id).collect();
        info!(
            path = %corrected_store.path().display(),
            boxes = loaded.boxes.len(),
            images = images.len(),
            malformed_rows = loaded.rejected.len(),
            "corrected store"
        );
    } else {
        warn!(path = %corrected_store.path().display(), "corrected store missing");
    }

    let active_store = paths.active_store();
    if active_store.exists() {
        let loaded = active_store.load(classes)?;
        let corrected = loaded
            .boxes
            .iter()
            .filter(|record| record.mode == Some(LabelMode::Corrected))
            .count();
        info!(
            path = %active_store.path().display(),
            boxes = loaded.boxes.len(),
            corrected,
            noisy = loaded.boxes.len() - corrected,
            malformed_rows = loaded.rejected.len(),
            "active training file"
        );
    } else {
        warn!(path = %active_store.path().display(), "active training file missing");
    }

    Ok(())
}
