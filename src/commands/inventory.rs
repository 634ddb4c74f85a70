use std::path::Path;

use anyhow::{Result, bail};
use tracing::{info, warn};

use crate::cli::InventoryArgs;
use crate::model::{ImageInventoryManifest, PartitionInventoryEntry};
use crate::partition::{FilenamePartitions, Partition, image_id_from_name, image_path};
use crate::util::{ensure_file, now_utc_string, write_json_pretty};

pub fn run(args: InventoryArgs) -> Result<()> {
    if !args.image_dir.is_dir() {
        bail!("image directory does not exist: {}", args.image_dir.display());
    }
    ensure_file(&args.filenames_path, "filename partition file")?;

    let partitions = FilenamePartitions::load(&args.filenames_path)?;
    let selected = if args.partitions.is_empty() {
        Partition::ALL.to_vec()
    } else {
        args.partitions.clone()
    };

    let manifest = build_manifest(
        &partitions,
        &selected,
        &args.image_dir,
        args.extension.as_str(),
    );

    for entry in &manifest.partitions {
        info!(
            partition = %entry.partition,
            listed = entry.listed,
            present = entry.present,
            missing = entry.missing.len(),
            non_numeric = entry.non_numeric.len(),
            "partition inventory"
        );
        if !entry.non_numeric.is_empty() {
            warn!(
                partition = %entry.partition,
                examples = ?entry.non_numeric.iter().take(5).collect::<Vec<_>>(),
                "image names that are not numeric ids cannot be matched against annotations"
            );
        }
    }

    let manifest_path = args.manifest_path.clone().unwrap_or_else(|| {
        args.filenames_path
            .with_file_name("image_inventory.json")
    });
    write_json_pretty(&manifest_path, &manifest)?;
    info!(path = %manifest_path.display(), "wrote image inventory manifest");

    Ok(())
}

pub fn build_manifest(
    partitions: &FilenamePartitions,
    selected: &[Partition],
    images_dir: &Path,
    extension: &str,
) -> ImageInventoryManifest {
    let entries = selected
        .iter()
        .map(|partition| {
            let names = partitions.names(*partition);
            let mut entry = PartitionInventoryEntry {
                partition: partition.as_str().to_string(),
                listed: names.len(),
                present: 0,
                missing: Vec::new(),
                non_numeric: Vec::new(),
            };

            for name in names {
                if image_id_from_name(name).is_none() {
                    entry.non_numeric.push(name.clone());
                }
                if image_path(images_dir, name, extension).is_file() {
                    entry.present += 1;
                } else {
                    entry.missing.push(name.clone());
                }
            }

            entry
        })
        .collect();

    ImageInventoryManifest {
        manifest_version: 1,
        generated_at: now_utc_string(),
        images_dir: images_dir.display().to_string(),
        extension: extension.to_string(),
        partitions: entries,
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn manifest_counts_present_missing_and_non_numeric_images() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("1.jpg"), b"img").expect("image");
        fs::write(dir.path().join("scan_b.jpg"), b"img").expect("image");
        let partitions: FilenamePartitions = serde_json::from_str(
            r#"{"unsupervised": ["1", "2", "scan_b"], "test": ["9"]}"#,
        )
        .expect("valid json");

        let manifest = build_manifest(
            &partitions,
            &[Partition::Unsupervised],
            dir.path(),
            ".jpg",
        );

        assert_eq!(manifest.partitions.len(), 1);
        let entry = &manifest.partitions[0];
        assert_eq!(entry.partition, "unsupervised");
        assert_eq!(entry.listed, 3);
        assert_eq!(entry.present, 2);
        assert_eq!(entry.missing, vec!["2".to_string()]);
        assert_eq!(entry.non_numeric, vec!["scan_b".to_string()]);
    }
}
