//! Persistence of completed card records
//!
//! A completed [`CardRecord`] is projected into a [`PersistedRow`] (column
//! renames, ISO-8601 timestamp, duration adjusted and formatted) and appended
//! to a [`RecordSink`]. The production sink is an append-only CSV file whose
//! header row is written lazily on the first append into an empty file.
//!
//! Writes are best effort: a failed append loses the row and the caller only
//! logs the error.

use crate::record_store::CardRecord;
use chrono::{DateTime, SecondsFormat, Utc};
use log::{info, warn};
use serde_json::Value;
use shared::CSV_HEADER;
use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

pub const DEFAULT_ALTERNATE_CONDITION: &str = "Carl condition";
pub const DEFAULT_CONDITION_OFFSET_SECS: f64 = 2.0;

/// Legacy column names that indicate a log written by an older layout.
const LEGACY_COLUMNS: [&str; 3] = ["answer", "side_choice", "reveal_to_drop_duration_s"];

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Fixed timing offset removed from durations recorded under one robot
/// condition.
#[derive(Debug, Clone, PartialEq)]
pub struct DurationAdjustment {
    /// `Robot` label that triggers the adjustment
    pub condition: String,
    /// Seconds subtracted from the measured duration
    pub offset_secs: f64,
}

impl Default for DurationAdjustment {
    fn default() -> Self {
        Self {
            condition: DEFAULT_ALTERNATE_CONDITION.to_string(),
            offset_secs: DEFAULT_CONDITION_OFFSET_SECS,
        }
    }
}

impl DurationAdjustment {
    /// Returns the duration to persist for a record with the given robot label.
    pub fn apply(&self, card_id: &str, robot: Option<&Value>, duration: Option<f64>) -> Option<f64> {
        if robot.and_then(Value::as_str) != Some(self.condition.as_str()) {
            return duration;
        }

        match duration {
            Some(original) => {
                let adjusted = original - self.offset_secs;
                info!(
                    "Adjusting duration for {} (card {}): {:.3} -> {:.3}",
                    self.condition, card_id, original, adjusted
                );
                Some(adjusted)
            }
            None => {
                warn!(
                    "Cannot adjust duration for {} (card {}): no measured duration",
                    self.condition, card_id
                );
                None
            }
        }
    }
}

/// One output row, in column order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedRow {
    pub timestamp: String,
    pub participant: String,
    pub card_id: String,
    pub question: String,
    pub difficulty: String,
    pub correct_answer: String,
    pub correct_side: String,
    pub participants_side_choice: String,
    pub robot: String,
    pub gaze_decision: String,
    pub move_duration: String,
}

impl PersistedRow {
    pub fn from_record(record: &CardRecord, adjustment: &DurationAdjustment) -> Self {
        let card_id = cell(record.field("cardId"));
        let timestamp = iso_timestamp(record.event_arrival_timestamp.unwrap_or_else(Utc::now));
        let duration = adjustment.apply(&card_id, record.field("Robot"), record.move_duration);

        Self {
            timestamp,
            participant: cell(record.field("participant")),
            card_id,
            question: cell(record.field("question")),
            difficulty: cell(record.field("difficulty")),
            correct_answer: cell(record.field("answer")),
            correct_side: cell(record.field("side")),
            participants_side_choice: cell(record.field("side_choice_raw")),
            robot: cell(record.field("Robot")),
            gaze_decision: cell(record.field("gazeDecision")),
            move_duration: duration.map(|d| format!("{:.3}", d)).unwrap_or_default(),
        }
    }

    /// Cells in [`CSV_HEADER`] order.
    pub fn to_record(&self) -> [&str; 11] {
        [
            self.timestamp.as_str(),
            self.participant.as_str(),
            self.card_id.as_str(),
            self.question.as_str(),
            self.difficulty.as_str(),
            self.correct_answer.as_str(),
            self.correct_side.as_str(),
            self.participants_side_choice.as_str(),
            self.robot.as_str(),
            self.gaze_decision.as_str(),
            self.move_duration.as_str(),
        ]
    }
}

/// ISO-8601 with a `+00:00` offset; the fraction is six digits, or left
/// out when the sub-second part is zero.
fn iso_timestamp(at: DateTime<Utc>) -> String {
    let precision = if at.timestamp_subsec_micros() == 0 {
        SecondsFormat::Secs
    } else {
        SecondsFormat::Micros
    };
    at.to_rfc3339_opts(precision, false)
}

fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

pub trait RecordSink {
    fn append(&mut self, row: &PersistedRow) -> Result<(), SinkError>;
}

impl<S: RecordSink + ?Sized> RecordSink for Box<S> {
    fn append(&mut self, row: &PersistedRow) -> Result<(), SinkError> {
        (**self).append(row)
    }
}

/// What [`CsvSink::ensure_header`] found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderStatus {
    Created,
    Matches,
    Mismatch(String),
    Unreadable(String),
}

/// Append-only CSV file sink
#[derive(Debug, Clone)]
pub struct CsvSink {
    path: PathBuf,
}

impl CsvSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn is_empty_or_missing(&self) -> bool {
        fs::metadata(&self.path)
            .map(|meta| meta.len() == 0)
            .unwrap_or(true)
    }

    /// Startup check: creates the file with a header if absent or empty,
    /// otherwise compares the existing header and warns on mismatch.
    ///
    /// Only failure to create the file is an error.
    pub fn ensure_header(&self) -> Result<HeaderStatus, SinkError> {
        if self.is_empty_or_missing() {
            let mut writer = csv::WriterBuilder::new()
                .terminator(csv::Terminator::CRLF)
                .from_path(&self.path)?;
            writer.write_record(CSV_HEADER)?;
            writer.flush()?;
            info!(
                "CSV file {} created with headers: {:?}",
                self.path.display(),
                CSV_HEADER
            );
            return Ok(HeaderStatus::Created);
        }

        let status = match self.read_header() {
            Ok(existing) => check_header(&existing),
            Err(e) => HeaderStatus::Unreadable(e.to_string()),
        };

        match &status {
            HeaderStatus::Matches => info!(
                "CSV file {} already exists with correct headers.",
                self.path.display()
            ),
            HeaderStatus::Mismatch(reason) => {
                warn!("CSV file {}: {}", self.path.display(), reason)
            }
            HeaderStatus::Unreadable(reason) => warn!(
                "Could not read existing CSV header of {}: {}",
                self.path.display(),
                reason
            ),
            HeaderStatus::Created => {}
        }

        Ok(status)
    }

    fn read_header(&self) -> Result<Vec<String>, SinkError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(&self.path)?;
        let mut record = csv::StringRecord::new();
        reader.read_record(&mut record)?;
        Ok(record.iter().map(str::to_string).collect())
    }
}

fn check_header(existing: &[String]) -> HeaderStatus {
    let has = |name: &str| existing.iter().any(|column| column == name);

    if !has("move_duration") {
        return HeaderStatus::Mismatch(
            "existing header is missing the 'move_duration' column; new rows will have it"
                .to_string(),
        );
    }

    if LEGACY_COLUMNS.iter().any(|legacy| has(legacy)) {
        return HeaderStatus::Mismatch(format!(
            "existing header uses old column names; new data will use {:?}",
            CSV_HEADER
        ));
    }

    let same_set = existing.len() == CSV_HEADER.len() && CSV_HEADER.iter().all(|name| has(name));
    if !same_set {
        return HeaderStatus::Mismatch(format!(
            "header mismatch, expected {:?}, found {:?}; consider backing up the file",
            CSV_HEADER, existing
        ));
    }

    HeaderStatus::Matches
}

impl RecordSink for CsvSink {
    fn append(&mut self, row: &PersistedRow) -> Result<(), SinkError> {
        let needs_header = self.is_empty_or_missing();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .terminator(csv::Terminator::CRLF)
            .from_writer(file);

        if needs_header {
            writer.write_record(CSV_HEADER)?;
        }
        writer.write_record(row.to_record())?;
        writer.flush()?;

        info!("Logged combined record for cardId {}", row.card_id);
        Ok(())
    }
}

/// In-memory sink; clones share the same rows.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    rows: Arc<Mutex<Vec<PersistedRow>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<PersistedRow> {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl RecordSink for MemorySink {
    fn append(&mut self, row: &PersistedRow) -> Result<(), SinkError> {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(row.clone());
        Ok(())
    }
}
