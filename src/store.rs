use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::warn;

use crate::classes::ClassTable;
use crate::model::{BoxRecord, ImageId, LabelMode};
use crate::util::write_atomic;

const MAX_EXACT_IMAGE_ID: f64 = 9_007_199_254_740_992.0;
const MAX_REPORTED_ROW_ERRORS: usize = 5;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AnnotationSchema {
    Annotations,
    Active,
    Detections,
}

impl AnnotationSchema {
    pub fn columns(self) -> usize {
        match self {
            Self::Annotations => 5,
            Self::Active | Self::Detections => 6,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Annotations => "annotations",
            Self::Active => "active",
            Self::Detections => "detections",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum RowPolicy {
    #[default]
    Strict,
    SkipMalformed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowError {
    pub line: u64,
    pub message: String,
}

impl fmt::Display for RowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoadedAnnotations {
    pub source: PathBuf,
    pub boxes: Vec<BoxRecord>,
    pub rejected: Vec<RowError>,
}

impl LoadedAnnotations {
    pub fn into_boxes(self, policy: RowPolicy) -> Result<Vec<BoxRecord>> {
        let path = self.source.as_path();
        if self.rejected.is_empty() {
            return Ok(self.boxes);
        }

        match policy {
            RowPolicy::Strict => {
                let shown = self
                    .rejected
                    .iter()
                    .take(MAX_REPORTED_ROW_ERRORS)
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; ");
                bail!(
                    "{} malformed row(s) in {}: {}",
                    self.rejected.len(),
                    path.display(),
                    shown
                );
            }
            RowPolicy::SkipMalformed => {
                for error in &self.rejected {
                    warn!(path = %path.display(), line = error.line, reason = %error.message, "skipped malformed row");
                }
                Ok(self.boxes)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnnotationStore {
    path: PathBuf,
    schema: AnnotationSchema,
}

impl AnnotationStore {
    pub fn new(path: impl Into<PathBuf>, schema: AnnotationSchema) -> Self {
        Self {
            path: path.into(),
            schema,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn load(&self, classes: &ClassTable) -> Result<LoadedAnnotations> {
        let file = File::open(&self.path).with_context(|| {
            format!(
                "failed to open {} file {}",
                self.schema.as_str(),
                self.path.display()
            )
        })?;
        let mut loaded = read_annotations(file, self.schema, classes)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        loaded.source = self.path.clone();
        Ok(loaded)
    }

    pub fn load_or_empty(&self, classes: &ClassTable) -> Result<LoadedAnnotations> {
        if !self.path.exists() {
            return Ok(LoadedAnnotations {
                source: self.path.clone(),
                ..LoadedAnnotations::default()
            });
        }
        self.load(classes)
    }

    pub fn load_with_policy(&self, classes: &ClassTable, policy: RowPolicy) -> Result<Vec<BoxRecord>> {
        self.load(classes)?.into_boxes(policy)
    }

    pub fn atomic_save(&self, boxes: &[BoxRecord], classes: &ClassTable) -> Result<()> {
        let rows = boxes
            .iter()
            .map(|record| encode_row(record, self.schema, classes))
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("failed to encode rows for {}", self.path.display()))?;

        write_atomic(&self.path, |writer| {
            let mut csv_writer = csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(&mut *writer);
            for row in &rows {
                csv_writer.write_record(row)?;
            }
            csv_writer.flush()?;
            Ok(())
        })
    }
}

pub fn read_annotations<R: Read>(
    reader: R,
    schema: AnnotationSchema,
    classes: &ClassTable,
) -> Result<LoadedAnnotations> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut loaded = LoadedAnnotations::default();
    for record in csv_reader.records() {
        let record = match record {
            Ok(record) => record,
            Err(err) => match err.position().map(|pos| pos.line()) {
                Some(line) => {
                    loaded.rejected.push(RowError {
                        line,
                        message: err.to_string(),
                    });
                    continue;
                }
                None => return Err(err).context("failed to read csv"),
            },
        };

        let line = record.position().map(|pos| pos.line()).unwrap_or_default();
        match decode_row(&record, schema, classes) {
            Ok(Some(decoded)) => loaded.boxes.push(decoded),
            Ok(None) => {}
            Err(message) => loaded.rejected.push(RowError { line, message }),
        }
    }

    Ok(loaded)
}

fn is_sentinel_row(record: &csv::StringRecord) -> bool {
    record.len() >= 5 && (1..=4).all(|index| record[index].is_empty())
}

fn decode_row(
    record: &csv::StringRecord,
    schema: AnnotationSchema,
    classes: &ClassTable,
) -> std::result::Result<Option<BoxRecord>, String> {
    if is_sentinel_row(record) {
        return Ok(None);
    }
    if record.len() != schema.columns() {
        return Err(format!(
            "expected {} columns for {} rows, found {}",
            schema.columns(),
            schema.as_str(),
            record.len()
        ));
    }

    let image_id = parse_image_id(&record[0])?;
    let x = parse_coordinate("x", &record[1])?;
    let y = parse_coordinate("y", &record[2])?;
    let angle = parse_coordinate("angle", &record[3])?;
    let label = classes
        .id_of(&record[4])
        .ok_or_else(|| format!("unknown class name '{}'", &record[4]))?;

    let mut decoded = BoxRecord::annotation(image_id, x, y, angle, label);
    match schema {
        AnnotationSchema::Annotations => {}
        AnnotationSchema::Active => {
            let mode = LabelMode::parse(&record[5])
                .ok_or_else(|| format!("unknown mode '{}'", &record[5]))?;
            decoded.mode = Some(mode);
        }
        AnnotationSchema::Detections => {
            let score = record[5]
                .parse::<f64>()
                .map_err(|_| format!("malformed score '{}'", &record[5]))?;
            if !(0.0..=1.0).contains(&score) {
                return Err(format!("score {score} is outside [0, 1]"));
            }
            decoded.score = Some(score);
        }
    }

    Ok(Some(decoded))
}

fn parse_image_id(raw: &str) -> std::result::Result<ImageId, String> {
    if let Ok(id) = raw.parse::<ImageId>() {
        return Ok(id);
    }
    let value = raw
        .parse::<f64>()
        .map_err(|_| format!("malformed image id '{raw}'"))?;
    if !value.is_finite() || value < 0.0 || value.fract() != 0.0 || value > MAX_EXACT_IMAGE_ID {
        return Err(format!("image id '{raw}' is not a non-negative integer"));
    }
    Ok(value as ImageId)
}

fn parse_coordinate(name: &str, raw: &str) -> std::result::Result<f64, String> {
    let value = raw
        .parse::<f64>()
        .map_err(|_| format!("malformed {name} '{raw}'"))?;
    if !value.is_finite() {
        return Err(format!("{name} '{raw}' is not finite"));
    }
    Ok(value)
}

fn encode_row(
    record: &BoxRecord,
    schema: AnnotationSchema,
    classes: &ClassTable,
) -> Result<Vec<String>> {
    let label = classes.name_of(record.label).with_context(|| {
        format!(
            "class id {} of image {} is not in the class table",
            record.label, record.image_id
        )
    })?;

    let mut row = vec![
        record.image_id.to_string(),
        record.x.to_string(),
        record.y.to_string(),
        record.angle.to_string(),
        label.to_string(),
    ];

    match schema {
        AnnotationSchema::Annotations => {}
        AnnotationSchema::Active => {
            let mode = record
                .mode
                .with_context(|| format!("untagged box of image {} in active set", record.image_id))?;
            row.push(mode.as_str().to_string());
        }
        AnnotationSchema::Detections => {
            let score = record
                .score
                .with_context(|| format!("detection of image {} has no score", record.image_id))?;
            row.push(score.to_string());
        }
    }

    Ok(row)
}
