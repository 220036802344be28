//! Encoding and decoding helpers between domain types and the plain-text
//! representations stored in SQLite columns.
//!
//! Timestamps are stored as fixed-width RFC 3339 strings (microseconds, `Z`)
//! so that string order matches time order. Counters are `INTEGER` columns
//! read as `i64` and checked on the way out.

use chrono::{DateTime, SecondsFormat, Utc};
use sluice_core::{
  checkpoint::Checkpoint,
  record::NormalizedRecord,
  run::{RunRecord, RunStatus},
  source::Source,
};

use crate::{Error, Result};

// ─── DateTime<Utc> ───────────────────────────────────────────────────────────

pub fn encode_dt(dt: DateTime<Utc>) -> String { dt.to_rfc3339_opts(SecondsFormat::Micros, true) }

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(format!("{s:?}: {e}")))
}

pub fn decode_opt_dt(s: Option<&str>) -> Result<Option<DateTime<Utc>>> {
  s.map(decode_dt).transpose()
}

// ─── Enums and counters ──────────────────────────────────────────────────────

pub fn decode_source(s: &str) -> Result<Source> { Ok(s.parse()?) }

pub fn decode_status(s: &str) -> Result<RunStatus> { Ok(s.parse()?) }

pub fn encode_count(n: u64) -> i64 { i64::try_from(n).unwrap_or(i64::MAX) }

pub fn decode_count(column: &'static str, n: i64) -> Result<u64> {
  u64::try_from(n).map_err(|_| Error::Corrupt { column, detail: format!("negative count {n}") })
}

/// SQL name of the scalar function that applies [`fold_case`] in queries.
pub const FOLD_FUNCTION: &str = "sluice_fold";

/// Unicode lowercase, applied to both the search needle and the searched
/// columns. SQLite's own `lower()` only folds ASCII.
pub fn fold_case(s: &str) -> String { s.to_lowercase() }

/// Escape `%`, `_` and `\` for a `LIKE ... ESCAPE '\'` pattern and wrap the
/// result as a case-folded substring match.
pub fn like_pattern(needle: &str) -> String {
  let mut out = String::with_capacity(needle.len() + 2);
  out.push('%');
  for c in fold_case(needle).chars() {
    if matches!(c, '%' | '_' | '\\') {
      out.push('\\');
    }
    out.push(c);
  }
  out.push('%');
  out
}

// ─── Row types ───────────────────────────────────────────────────────────────

/// Columns selected for a `normalized_data` row, in this order.
pub const RECORD_COLUMNS: &str = "id, source, source_id, canonical_id, name, numeric_value, \
                                  description, created_at, updated_at";

/// Raw values read from a `normalized_data` row.
pub struct RawNormalized {
  pub id:            i64,
  pub source:        String,
  pub source_id:     String,
  pub canonical_id:  String,
  pub name:          String,
  pub numeric_value: Option<f64>,
  pub description:   String,
  pub created_at:    String,
  pub updated_at:    String,
}

impl RawNormalized {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id:            row.get(0)?,
      source:        row.get(1)?,
      source_id:     row.get(2)?,
      canonical_id:  row.get(3)?,
      name:          row.get(4)?,
      numeric_value: row.get(5)?,
      description:   row.get(6)?,
      created_at:    row.get(7)?,
      updated_at:    row.get(8)?,
    })
  }

  pub fn into_record(self) -> Result<NormalizedRecord> {
    Ok(NormalizedRecord {
      id:            Some(self.id),
      source:        decode_source(&self.source)?,
      source_id:     self.source_id,
      canonical_id:  self.canonical_id,
      name:          self.name,
      numeric_value: self.numeric_value,
      description:   self.description,
      created_at:    decode_dt(&self.created_at)?,
      updated_at:    decode_dt(&self.updated_at)?,
    })
  }
}

pub const CHECKPOINT_COLUMNS: &str =
  "source, last_processed_id, last_processed_at, total_processed, updated_at";

/// Raw values read from an `etl_checkpoint` row.
pub struct RawCheckpoint {
  pub source:            String,
  pub last_processed_id: String,
  pub last_processed_at: String,
  pub total_processed:   i64,
  pub updated_at:        String,
}

impl RawCheckpoint {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      source:            row.get(0)?,
      last_processed_id: row.get(1)?,
      last_processed_at: row.get(2)?,
      total_processed:   row.get(3)?,
      updated_at:        row.get(4)?,
    })
  }

  pub fn into_checkpoint(self) -> Result<Checkpoint> {
    Ok(Checkpoint {
      source:            decode_source(&self.source)?,
      last_processed_id: self.last_processed_id,
      last_processed_at: decode_dt(&self.last_processed_at)?,
      total_processed:   decode_count("total_processed", self.total_processed)?,
      updated_at:        decode_dt(&self.updated_at)?,
    })
  }
}

pub const RUN_COLUMNS: &str = "id, started_at, ended_at, duration_seconds, records_processed, \
                               records_skipped, status, error_message, created_at";

/// Raw values read from an `etl_runs` row.
pub struct RawRun {
  pub id:                i64,
  pub started_at:        String,
  pub ended_at:          String,
  pub duration_seconds:  f64,
  pub records_processed: i64,
  pub records_skipped:   i64,
  pub status:            String,
  pub error_message:     Option<String>,
  pub created_at:        String,
}

impl RawRun {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id:                row.get(0)?,
      started_at:        row.get(1)?,
      ended_at:          row.get(2)?,
      duration_seconds:  row.get(3)?,
      records_processed: row.get(4)?,
      records_skipped:   row.get(5)?,
      status:            row.get(6)?,
      error_message:     row.get(7)?,
      created_at:        row.get(8)?,
    })
  }

  pub fn into_run(self) -> Result<RunRecord> {
    Ok(RunRecord {
      id:                self.id,
      started_at:        decode_dt(&self.started_at)?,
      ended_at:          decode_dt(&self.ended_at)?,
      duration_seconds:  self.duration_seconds,
      records_processed: decode_count("records_processed", self.records_processed)?,
      records_skipped:   decode_count("records_skipped", self.records_skipped)?,
      status:            decode_status(&self.status)?,
      error_message:     self.error_message,
      created_at:        decode_dt(&self.created_at)?,
    })
  }
}
