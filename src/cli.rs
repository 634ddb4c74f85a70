use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::partition::Partition;
use crate::reconcile::{MatchConfig, ReconcileConfig};
use crate::store::RowPolicy;

pub const SUPPORTED_DEPTHS: [u32; 5] = [18, 34, 50, 101, 152];

#[derive(Parser, Debug)]
#[command(
    name = "saffron-active",
    version,
    about = "Active-learning annotation reconciliation for oriented-object detectors"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run detect, reconcile, persist and retrain for a number of cycles.
    Cycles(CyclesArgs),
    /// Reconcile an existing detections file once and persist the result.
    Reconcile(ReconcileArgs),
    /// Check the filename partition file against the image directory.
    Inventory(InventoryArgs),
    Status(StatusArgs),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum ImageExtension {
    #[value(name = ".jpg")]
    Jpg,
    #[value(name = ".png")]
    Png,
}

impl ImageExtension {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Jpg => ".jpg",
            Self::Png => ".png",
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct AnnotationPathArgs {
    /// Directory holding labels.csv, unsupervised.csv, validation.csv and filenames.json.
    #[arg(long, default_value = "annotations")]
    pub annotations_dir: PathBuf,

    /// Directory holding the corrected store and the active training file.
    #[arg(long, default_value = "active_annotations")]
    pub active_dir: PathBuf,

    #[arg(long)]
    pub class_list: Option<PathBuf>,

    #[arg(long)]
    pub oracle_path: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct ReconcileOptions {
    #[arg(long, default_value_t = 0.5)]
    pub score_threshold: f64,

    #[arg(long, default_value_t = 20.0)]
    pub max_match_distance: f64,

    #[arg(long, default_value_t = 0.1)]
    pub angle_weight: f64,

    #[arg(long, default_value_t = false)]
    pub skip_malformed_rows: bool,
}

impl ReconcileOptions {
    pub fn config(&self) -> ReconcileConfig {
        ReconcileConfig {
            score_threshold: self.score_threshold,
            matching: MatchConfig {
                max_distance: self.max_match_distance,
                angle_weight: self.angle_weight,
            },
        }
    }

    pub fn row_policy(&self) -> RowPolicy {
        if self.skip_malformed_rows {
            RowPolicy::SkipMalformed
        } else {
            RowPolicy::Strict
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct CyclesArgs {
    #[arg(short = 'i', long)]
    pub image_dir: PathBuf,

    #[arg(short = 'e', long, value_enum, default_value_t = ImageExtension::Jpg)]
    pub extension: ImageExtension,

    /// Seed model used by the first cycle.
    #[arg(short = 'm', long)]
    pub model: PathBuf,

    /// Seed state dict used by the first cycle.
    #[arg(short = 's', long)]
    pub state_dict: PathBuf,

    #[arg(short = 'o', long)]
    pub save_dir: PathBuf,

    #[arg(short = 'c', long, value_parser = clap::value_parser!(u32).range(1..))]
    pub num_cycles: u32,

    #[arg(short = 'd', long, value_parser = parse_depth)]
    pub depth: u32,

    #[arg(short = 'p', long, default_value_t = 20)]
    pub epochs: u32,

    #[arg(long, default_value = "saffron-detect")]
    pub detector: PathBuf,

    #[arg(long, default_value = "saffron-train")]
    pub trainer: PathBuf,

    /// Continue after the last cycle whose checkpoints exist under the save dir.
    #[arg(long, default_value_t = false)]
    pub resume: bool,

    #[command(flatten)]
    pub paths: AnnotationPathArgs,

    #[command(flatten)]
    pub reconcile: ReconcileOptions,
}

#[derive(Args, Debug, Clone)]
pub struct ReconcileArgs {
    /// Detector output: image_id,x,y,angle,label,score rows.
    #[arg(long)]
    pub detections: PathBuf,

    #[arg(long)]
    pub manifest_dir: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    pub dry_run: bool,

    #[command(flatten)]
    pub paths: AnnotationPathArgs,

    #[command(flatten)]
    pub reconcile: ReconcileOptions,
}

#[derive(Args, Debug, Clone)]
pub struct InventoryArgs {
    #[arg(short = 'i', long)]
    pub image_dir: PathBuf,

    #[arg(short = 'e', long, value_enum, default_value_t = ImageExtension::Jpg)]
    pub extension: ImageExtension,

    #[arg(long, default_value = "annotations/filenames.json")]
    pub filenames_path: PathBuf,

    #[arg(long = "partition", value_enum)]
    pub partitions: Vec<Partition>,

    #[arg(long)]
    pub manifest_path: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(short = 'o', long)]
    pub save_dir: Option<PathBuf>,

    #[command(flatten)]
    pub paths: AnnotationPathArgs,
}

fn parse_depth(raw: &str) -> Result<u32, String> {
    let depth = raw
        .parse::<u32>()
        .map_err(|_| format!("'{raw}' is not a network depth"))?;
    if SUPPORTED_DEPTHS.contains(&depth) {
        Ok(depth)
    } else {
        Err(format!(
            "unsupported depth {depth}, must be one of 18, 34, 50, 101, 152"
        ))
    }
}
