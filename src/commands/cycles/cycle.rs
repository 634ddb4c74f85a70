use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;
use tracing::warn;

use crate::model::CyclePaths;
use crate::reconcile::Stage;
use crate::util::ensure_directory;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CycleState {
    Idle,
    Detecting,
    Splitting,
    Matching,
    Accumulating,
    Persisting,
    Training,
    Done,
}

impl CycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Detecting => "detecting",
            Self::Splitting => "splitting",
            Self::Matching => "matching",
            Self::Accumulating => "accumulating",
            Self::Persisting => "persisting",
            Self::Training => "training",
            Self::Done => "done",
        }
    }

    pub fn allows(self, next: CycleState) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Detecting)
                | (Self::Detecting, Self::Splitting)
                | (Self::Splitting, Self::Matching)
                | (Self::Matching, Self::Accumulating)
                | (Self::Accumulating, Self::Persisting)
                | (Self::Persisting, Self::Training)
                | (Self::Training, Self::Detecting)
                | (Self::Training, Self::Done)
                | (Self::Idle, Self::Done)
        )
    }
}

impl From<Stage> for CycleState {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Splitting => Self::Splitting,
            Stage::Matching => Self::Matching,
            Stage::Accumulating => Self::Accumulating,
        }
    }
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointLayout {
    model_dir: PathBuf,
    state_dict_dir: PathBuf,
}

impl CheckpointLayout {
    pub fn new(root: &Path) -> Self {
        Self {
            model_dir: root.join("model"),
            state_dict_dir: root.join("state_dict"),
        }
    }

    pub fn create_dirs(&self) -> Result<()> {
        ensure_directory(&self.model_dir)?;
        ensure_directory(&self.state_dict_dir)
    }

    pub fn model_path(&self, index: u32) -> PathBuf {
        self.model_dir.join(format!("{index}.pt"))
    }

    pub fn state_dict_path(&self, index: u32) -> PathBuf {
        self.state_dict_dir.join(format!("{index}.pt"))
    }

    pub fn completed_cycles(&self) -> Result<Vec<u32>> {
        let pattern = Regex::new(r"^(\d+)\.pt$").context("failed to compile checkpoint regex")?;

        let mut indices = checkpoint_indices(&self.model_dir, &pattern)?;
        indices.retain(|index| self.state_dict_path(*index).is_file());
        indices.sort_unstable();
        Ok(indices)
    }
}

fn checkpoint_indices(dir: &Path, pattern: &Regex) -> Result<Vec<u32>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut indices = Vec::new();
    let entries = fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read entry in {}", dir.display()))?;
        let Some(filename) = entry.file_name().to_str().map(ToOwned::to_owned) else {
            continue;
        };
        let Some(captures) = pattern.captures(&filename) else {
            continue;
        };
        match captures[1].parse::<u32>() {
            Ok(index) if index >= 1 && index.checked_add(1).is_some() => indices.push(index),
            _ => warn!(path = %entry.path().display(), "ignoring checkpoint with unusable cycle index"),
        }
    }

    Ok(indices)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cycle {
    pub index: u32,
    pub input_model: PathBuf,
    pub input_state_dict: PathBuf,
    pub output_model: PathBuf,
    pub output_state_dict: PathBuf,
}

impl Cycle {
    pub fn first(seed_model: &Path, seed_state_dict: &Path, layout: &CheckpointLayout) -> Self {
        Self::starting_after(0, seed_model, seed_state_dict, layout)
    }

    pub fn resumed(index: u32, layout: &CheckpointLayout) -> Self {
        Self::starting_after(
            index,
            &layout.model_path(index),
            &layout.state_dict_path(index),
            layout,
        )
    }

    fn starting_after(
        previous: u32,
        input_model: &Path,
        input_state_dict: &Path,
        layout: &CheckpointLayout,
    ) -> Self {
        let index = previous + 1;
        Self {
            index,
            input_model: input_model.to_path_buf(),
            input_state_dict: input_state_dict.to_path_buf(),
            output_model: layout.model_path(index),
            output_state_dict: layout.state_dict_path(index),
        }
    }

    pub fn next(&self, layout: &CheckpointLayout) -> Self {
        Self::starting_after(self.index, &self.output_model, &self.output_state_dict, layout)
    }

    pub fn manifest_paths(&self) -> CyclePaths {
        CyclePaths {
            input_model: self.input_model.display().to_string(),
            input_state_dict: self.input_state_dict.display().to_string(),
            output_model: self.output_model.display().to_string(),
            output_state_dict: self.output_state_dict.display().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_cycle_starts_from_previous_outputs() {
        let layout = CheckpointLayout::new(Path::new("/out"));
        let first = Cycle::first(Path::new("/seed/m.pt"), Path::new("/seed/s.pt"), &layout);

        assert_eq!(first.index, 1);
        assert_eq!(first.input_model, PathBuf::from("/seed/m.pt"));
        assert_eq!(first.output_model, PathBuf::from("/out/model/1.pt"));

        let second = first.next(&layout);
        assert_eq!(second.index, 2);
        assert_eq!(second.input_model, PathBuf::from("/out/model/1.pt"));
        assert_eq!(second.input_state_dict, PathBuf::from("/out/state_dict/1.pt"));
        assert_eq!(second.output_state_dict, PathBuf::from("/out/state_dict/2.pt"));
    }

    #[test]
    fn completed_cycles_require_both_artifacts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = CheckpointLayout::new(dir.path());
        layout.create_dirs().expect("dirs");
        for index in [1, 2, 3] {
            fs::write(layout.model_path(index), b"m").expect("model");
        }
        fs::write(layout.state_dict_path(1), b"s").expect("state");
        fs::write(layout.state_dict_path(3), b"s").expect("state");
        fs::write(dir.path().join("model").join("final.pt"), b"m").expect("other");

        assert_eq!(layout.completed_cycles().expect("scan"), vec![1, 3]);
        assert_eq!(Cycle::resumed(3, &layout).index, 4);
    }

    #[test]
    fn checkpoint_scan_skips_indices_that_cannot_be_resumed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = CheckpointLayout::new(dir.path());
        layout.create_dirs().expect("dirs");
        for index in [2, u32::MAX] {
            fs::write(layout.model_path(index), b"m").expect("model");
            fs::write(layout.state_dict_path(index), b"s").expect("state");
        }
        fs::write(dir.path().join("model").join("0.pt"), b"m").expect("zero");
        fs::write(dir.path().join("model").join("99999999999.pt"), b"m").expect("too large");

        let completed = layout.completed_cycles().expect("scan");
        assert_eq!(completed, vec![2]);
        assert_eq!(Cycle::resumed(completed[0], &layout).index, 3);
    }

    #[test]
    fn state_machine_follows_pipeline_order() {
        assert!(CycleState::Idle.allows(CycleState::Detecting));
        assert!(CycleState::Persisting.allows(CycleState::Training));
        assert!(CycleState::Training.allows(CycleState::Detecting));
        assert!(!CycleState::Splitting.allows(CycleState::Accumulating));
        assert!(!CycleState::Detecting.allows(CycleState::Persisting));
    }
}
