//! Pipeline run history.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;

/// Aggregate outcome of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
  Success,
  Failed,
  /// At least one source committed and at least one did not.
  Partial,
}

impl RunStatus {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Success => "success",
      Self::Failed => "failed",
      Self::Partial => "partial",
    }
  }

  /// Derive the run status from how many sources succeeded and failed.
  pub fn from_counts(succeeded: usize, failed: usize) -> Self {
    match (succeeded, failed) {
      (_, 0) => Self::Success,
      (0, _) => Self::Failed,
      _ => Self::Partial,
    }
  }
}

impl fmt::Display for RunStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for RunStatus {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "success" => Ok(Self::Success),
      "failed" => Ok(Self::Failed),
      "partial" => Ok(Self::Partial),
      other => Err(Error::UnknownRunStatus(other.to_owned())),
    }
  }
}

/// Input to [`crate::store::EtlStore::record_run`]. Rows are written once
/// and never updated.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRunRecord {
  pub started_at:        DateTime<Utc>,
  pub ended_at:          DateTime<Utc>,
  pub duration_seconds:  f64,
  pub records_processed: u64,
  pub records_skipped:   u64,
  pub status:            RunStatus,
  pub error_message:     Option<String>,
}

/// A stored row of `etl_runs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
  pub id:                i64,
  pub started_at:        DateTime<Utc>,
  pub ended_at:          DateTime<Utc>,
  pub duration_seconds:  f64,
  pub records_processed: u64,
  pub records_skipped:   u64,
  pub status:            RunStatus,
  pub error_message:     Option<String>,
  pub created_at:        DateTime<Utc>,
}

/// Aggregates over `etl_runs`, served by `/stats`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
  pub run_count:               u64,
  /// Sum over runs that committed anything (`success` and `partial`).
  pub total_records_processed: u64,
  pub total_duration_seconds:  f64,
  pub last_success:            Option<DateTime<Utc>>,
  /// Latest `failed` or `partial` run.
  pub last_failure:            Option<DateTime<Utc>>,
  pub last_failure_reason:     Option<String>,
}
