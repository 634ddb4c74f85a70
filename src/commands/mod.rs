use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::info;

use crate::classes::ClassTable;
use crate::cli::AnnotationPathArgs;
use crate::model::{BoxRecord, PersistedFile};
use crate::reconcile::Reconciliation;
use crate::store::{AnnotationSchema, AnnotationStore};
use crate::util::sha256_file;

pub mod cycles;
pub mod inventory;
pub mod reconcile;
pub mod status;

#[derive(Debug, Clone)]
pub struct ActivePaths {
    pub class_list: PathBuf,
    pub oracle: PathBuf,
    pub validation: PathBuf,
    pub filenames: PathBuf,
    pub corrected: PathBuf,
    pub train: PathBuf,
}

impl ActivePaths {
    pub fn from_args(args: &AnnotationPathArgs) -> Self {
        let annotations = &args.annotations_dir;
        Self {
            class_list: args
                .class_list
                .clone()
                .unwrap_or_else(|| annotations.join("labels.csv")),
            oracle: args
                .oracle_path
                .clone()
                .unwrap_or_else(|| annotations.join("unsupervised.csv")),
            validation: annotations.join("validation.csv"),
            filenames: annotations.join("filenames.json"),
            corrected: args.active_dir.join("corrected.csv"),
            train: args.active_dir.join("train.csv"),
        }
    }

    pub fn corrected_store(&self) -> AnnotationStore {
        AnnotationStore::new(&self.corrected, AnnotationSchema::Annotations)
    }

    pub fn active_store(&self) -> AnnotationStore {
        AnnotationStore::new(&self.train, AnnotationSchema::Active)
    }

    pub fn oracle_store(&self) -> AnnotationStore {
        AnnotationStore::new(&self.oracle, AnnotationSchema::Annotations)
    }
}

pub fn persist_reconciliation(
    paths: &ActivePaths,
    classes: &ClassTable,
    reconciliation: &Reconciliation,
) -> Result<(PersistedFile, PersistedFile)> {
    let active = save_store(&paths.active_store(), &reconciliation.active, classes)?;
    let corrected = save_store(
        &paths.corrected_store(),
        &reconciliation.corrected_store,
        classes,
    )?;
    Ok((active, corrected))
}

fn save_store(
    store: &AnnotationStore,
    boxes: &[BoxRecord],
    classes: &ClassTable,
) -> Result<PersistedFile> {
    store.atomic_save(boxes, classes)?;
    let persisted = persisted_file(store.path(), boxes.len())?;
    info!(path = %persisted.path, rows = persisted.rows, "persisted annotations");
    Ok(persisted)
}

fn persisted_file(path: &Path, rows: usize) -> Result<PersistedFile> {
    Ok(PersistedFile {
        path: path.display().to_string(),
        sha256: sha256_file(path)?,
        rows,
    })
}
