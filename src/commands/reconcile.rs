use std::path::Path;

use anyhow::Result;
use chrono::Utc;
use tracing::info;

use crate::classes::ClassTable;
use crate::cli::ReconcileArgs;
use crate::commands::{ActivePaths, persist_reconciliation};
use crate::model::ReconcileRunManifest;
use crate::reconcile::{ReconcileConfig, Reconciliation, reconcile};
use crate::store::{AnnotationSchema, AnnotationStore, RowPolicy};
use crate::util::{ensure_file, now_utc_string, utc_compact_string, write_json_pretty};

pub fn run(args: ReconcileArgs) -> Result<()> {
    let started_ts = Utc::now();
    let paths = ActivePaths::from_args(&args.paths);

    ensure_file(&paths.class_list, "class list")?;
    ensure_file(&paths.oracle, "oracle annotations")?;
    ensure_file(&args.detections, "detections file")?;

    let classes = ClassTable::load(&paths.class_list)?;
    let config = args.reconcile.config().validated()?;
    let row_policy = args.reconcile.row_policy();

    let reconciliation = reconcile_files(
        &classes,
        &paths,
        &args.detections,
        &config,
        row_policy,
    )?;

    if args.dry_run {
        info!(
            detections = reconciliation.counts.detections,
            corrected = reconciliation.counts.corrected,
            active = reconciliation.counts.active_size,
            "reconcile dry-run complete"
        );
        return Ok(());
    }

    let (active_file, corrected_file) = persist_reconciliation(&paths, &classes, &reconciliation)?;

    let manifest_dir = args
        .manifest_dir
        .clone()
        .unwrap_or_else(|| args.paths.active_dir.join("manifests"));
    let manifest_path = manifest_dir.join(format!(
        "reconcile_{}.json",
        utc_compact_string(started_ts)
    ));
    let manifest = ReconcileRunManifest {
        manifest_version: 1,
        run_id: format!("run-{}", utc_compact_string(started_ts)),
        generated_at: now_utc_string(),
        detections_path: args.detections.display().to_string(),
        oracle_path: paths.oracle.display().to_string(),
        counts: reconciliation.counts,
        active_file,
        corrected_file,
        warnings: Vec::new(),
    };
    write_json_pretty(&manifest_path, &manifest)?;

    info!(path = %manifest_path.display(), "wrote reconcile manifest");
    Ok(())
}

pub fn reconcile_files(
    classes: &ClassTable,
    paths: &ActivePaths,
    detections_path: &Path,
    config: &ReconcileConfig,
    row_policy: RowPolicy,
) -> Result<Reconciliation> {
    let detections = AnnotationStore::new(detections_path, AnnotationSchema::Detections)
        .load_with_policy(classes, row_policy)?;
    let oracle = paths.oracle_store().load_with_policy(classes, row_policy)?;
    let corrected_store = paths
        .corrected_store()
        .load_or_empty(classes)?
        .into_boxes(RowPolicy::Strict)?;

    info!(
        detections = detections.len(),
        oracle = oracle.len(),
        corrected_store = corrected_store.len(),
        "loaded reconciliation inputs"
    );

    Ok(reconcile(detections, &oracle, corrected_store, config)?)
}
