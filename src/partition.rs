use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::Deserialize;

use crate::model::ImageId;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum Partition {
    Supervised,
    Unsupervised,
    Validation,
    Test,
}

impl Partition {
    pub const ALL: [Partition; 4] = [
        Self::Supervised,
        Self::Unsupervised,
        Self::Validation,
        Self::Test,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Supervised => "supervised",
            Self::Unsupervised => "unsupervised",
            Self::Validation => "validation",
            Self::Test => "test",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilenamePartitions {
    #[serde(default)]
    pub supervised: Vec<String>,
    #[serde(default)]
    pub unsupervised: Vec<String>,
    #[serde(default)]
    pub validation: Vec<String>,
    #[serde(default)]
    pub test: Vec<String>,
}

impl FilenamePartitions {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_slice(&raw).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn names(&self, partition: Partition) -> &[String] {
        match partition {
            Partition::Supervised => &self.supervised,
            Partition::Unsupervised => &self.unsupervised,
            Partition::Validation => &self.validation,
            Partition::Test => &self.test,
        }
    }

    pub fn image_paths(&self, partition: Partition, images_dir: &Path, extension: &str) -> Vec<PathBuf> {
        self.names(partition)
            .iter()
            .map(|name| image_path(images_dir, name, extension))
            .collect()
    }
}

pub fn image_path(images_dir: &Path, name: &str, extension: &str) -> PathBuf {
    images_dir.join(format!("{name}{extension}"))
}

pub fn image_id_from_name(name: &str) -> Option<ImageId> {
    if let Ok(id) = name.parse::<ImageId>() {
        return Some(id);
    }
    let value = name.parse::<f64>().ok()?;
    (value.is_finite() && value >= 0.0 && value.fract() == 0.0).then_some(value as ImageId)
}
