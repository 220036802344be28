//! Error type for `sluice-pipeline`.
//!
//! Source-level and record-level failures never surface here; they are
//! folded into the run's outcome. Only setup failures and a run whose record
//! could not be written reach the caller.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error(transparent)]
  Core(#[from] sluice_core::Error),

  #[error("http client error: {0}")]
  HttpClient(#[from] reqwest::Error),

  /// The run finished but its `etl_runs` row could not be stored.
  #[error("failed to record run: {0}")]
  RecordRun(#[source] Box<dyn std::error::Error + Send + Sync>),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
