//! Run bookkeeping: one immutable `etl_runs` row per pipeline execution.

use std::time::Instant;

use chrono::{DateTime, Utc};
use sluice_core::{
  run::{NewRunRecord, RunRecord, RunStatus},
  store::EtlStore,
};

use crate::{Error, Result};

/// Start marker of a run in progress.
#[derive(Debug, Clone, Copy)]
pub struct RunHandle {
  started_at: DateTime<Utc>,
  started:    Instant,
}

impl RunHandle {
  pub fn started_at(&self) -> DateTime<Utc> { self.started_at }
}

/// Writes run records through a store.
pub struct RunRecorder<'a, S> {
  store: &'a S,
}

impl<'a, S: EtlStore> RunRecorder<'a, S> {
  pub fn new(store: &'a S) -> Self { Self { store } }

  /// Capture the wall-clock start and a monotonic instant for the duration.
  pub fn begin(&self) -> RunHandle {
    RunHandle { started_at: Utc::now(), started: Instant::now() }
  }

  /// Insert the run's row. Called exactly once per handle.
  pub async fn complete(
    &self,
    handle: RunHandle,
    records_processed: u64,
    records_skipped: u64,
    status: RunStatus,
    error_message: Option<String>,
  ) -> Result<RunRecord> {
    let elapsed = handle.started.elapsed();
    let record = NewRunRecord {
      started_at: handle.started_at,
      ended_at: Utc::now(),
      duration_seconds: elapsed.as_secs_f64(),
      records_processed,
      records_skipped,
      status,
      error_message,
    };
    self
      .store
      .record_run(record)
      .await
      .map_err(|e| Error::RecordRun(Box::new(e)))
  }
}
