//! The orchestrator: fetch, normalize, commit, advance, record.
//!
//! Fetches for every adapter run concurrently. The write stages then run one
//! source at a time, so a source's checkpoint only ever moves after its own
//! batch is committed and the run row is written last, exactly once.

use std::{
  any::Any,
  fmt,
  panic::AssertUnwindSafe,
  str::FromStr,
  sync::Arc,
};

use futures::FutureExt as _;
use serde::{Deserialize, Serialize};
use sluice_core::{
  Error as CoreError,
  checkpoint::{Checkpoint, StagedBatch},
  identity::{DuplicateGroup, IdentityIndex},
  normalize::normalize,
  run::{RunRecord, RunStatus},
  source::Source,
  store::EtlStore,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
  Result,
  adapter::{FetchedBatch, Origin, SourceAdapter},
  recorder::RunRecorder,
};

// ─── Configuration ───────────────────────────────────────────────────────────

/// Whether adapters see the stored checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestMode {
  /// Only records past each source's checkpoint.
  #[default]
  Incremental,
  /// Everything the source serves; upserts absorb the overlap.
  Full,
}

impl IngestMode {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Incremental => "incremental",
      Self::Full => "full",
    }
  }
}

impl fmt::Display for IngestMode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for IngestMode {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str() {
      "incremental" => Ok(Self::Incremental),
      "full" => Ok(Self::Full),
      other => Err(format!("unknown ingest mode {other:?}")),
    }
  }
}

// ─── Reports ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum SourceOutcome {
  /// The batch (possibly empty) was committed and the checkpoint advanced.
  Succeeded,
  Failed(String),
  /// The run stopped before this source's write stage.
  NotRun,
}

/// What happened to one source during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceReport {
  pub source:    Source,
  pub outcome:   SourceOutcome,
  /// Normalized records committed.
  pub committed: u64,
  /// Format and normalization rejects.
  pub skipped:   u64,
  pub fallback:  bool,
}

impl SourceReport {
  fn pending(source: Source) -> Self {
    Self { source, outcome: SourceOutcome::NotRun, committed: 0, skipped: 0, fallback: false }
  }
}

/// The result of [`Pipeline::run`].
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
  pub run:        RunRecord,
  pub sources:    Vec<SourceReport>,
  /// Canonical ids observed under keys from more than one source.
  pub duplicates: Vec<DuplicateGroup>,
}

impl RunSummary {
  pub fn status(&self) -> RunStatus { self.run.status }
}

/// Counters accumulated while a run executes. Lives outside the run future
/// so it survives a panic inside it.
struct Tally {
  reports: Vec<SourceReport>,
  errors:  Vec<String>,
  fatal:   bool,
}

impl Tally {
  fn processed(&self) -> u64 { self.reports.iter().map(|r| r.committed).sum() }

  fn skipped(&self) -> u64 { self.reports.iter().map(|r| r.skipped).sum() }

  fn status(&self) -> RunStatus {
    let succeeded = self
      .reports
      .iter()
      .filter(|r| r.outcome == SourceOutcome::Succeeded)
      .count();
    if self.fatal {
      return if succeeded > 0 { RunStatus::Partial } else { RunStatus::Failed };
    }
    RunStatus::from_counts(succeeded, self.reports.len() - succeeded)
  }

  fn error_message(&self) -> Option<String> {
    (!self.errors.is_empty()).then(|| self.errors.join("; "))
  }
}

// ─── Pipeline ────────────────────────────────────────────────────────────────

/// Drives one ETL run over a set of adapters against a store.
pub struct Pipeline<S> {
  store:    Arc<S>,
  adapters: Vec<Box<dyn SourceAdapter>>,
  mode:     IngestMode,
}

impl<S: EtlStore> Pipeline<S> {
  pub fn new(store: Arc<S>, mode: IngestMode) -> Self {
    Self { store, adapters: Vec::new(), mode }
  }

  pub fn with_adapter(mut self, adapter: impl SourceAdapter + 'static) -> Self {
    self.adapters.push(Box::new(adapter));
    self
  }

  pub fn mode(&self) -> IngestMode { self.mode }

  pub fn store(&self) -> &Arc<S> { &self.store }

  /// Run once with a fresh identity index.
  pub async fn run(&self, cancel: &CancellationToken) -> Result<RunSummary> {
    self.run_with_index(&mut IdentityIndex::new(), cancel).await
  }

  /// Run once, accumulating canonical ids into `index`.
  ///
  /// Source and record failures are folded into the returned summary. The
  /// only error is failing to write the run row itself.
  pub async fn run_with_index(
    &self,
    index: &mut IdentityIndex,
    cancel: &CancellationToken,
  ) -> Result<RunSummary> {
    let recorder = RunRecorder::new(self.store.as_ref());
    let handle = recorder.begin();
    info!(mode = %self.mode, sources = self.adapters.len(), "etl run started");

    let mut tally = Tally {
      reports: self.adapters.iter().map(|a| SourceReport::pending(a.source())).collect(),
      errors:  Vec::new(),
      fatal:   false,
    };

    let outcome = AssertUnwindSafe(self.execute(&mut tally, index, cancel))
      .catch_unwind()
      .await;
    match outcome {
      Ok(Ok(())) => {}
      Ok(Err(e)) => {
        error!(error = %e, "etl run aborted");
        tally.fatal = true;
        tally.errors.push(e.to_string());
      }
      Err(panic) => {
        let msg = format!("pipeline panicked: {}", panic_message(panic.as_ref()));
        error!(error = %msg, "etl run aborted");
        tally.fatal = true;
        tally.errors.push(msg);
      }
    }

    let status = tally.status();
    let run = recorder
      .complete(handle, tally.processed(), tally.skipped(), status, tally.error_message())
      .await?;

    let duplicates: Vec<DuplicateGroup> = index
      .duplicates()
      .into_iter()
      .filter(DuplicateGroup::is_cross_source)
      .collect();
    info!(
      run_id = run.id,
      %status,
      processed = run.records_processed,
      skipped = run.records_skipped,
      duration_seconds = run.duration_seconds,
      cross_source_duplicates = duplicates.len(),
      "etl run finished"
    );

    Ok(RunSummary { run, sources: tally.reports, duplicates })
  }

  /// Every stage of a run. An `Err` is fatal to the rest of the run.
  async fn execute(
    &self,
    tally: &mut Tally,
    index: &mut IdentityIndex,
    cancel: &CancellationToken,
  ) -> sluice_core::Result<()> {
    if cancel.is_cancelled() {
      return Err(CoreError::Cancelled);
    }

    let mut checkpoints: Vec<Option<Checkpoint>> = Vec::with_capacity(self.adapters.len());
    for adapter in &self.adapters {
      let cp = match self.mode {
        IngestMode::Incremental => self
          .store
          .get_checkpoint(adapter.source())
          .await
          .map_err(CoreError::persistence)?,
        IngestMode::Full => None,
      };
      checkpoints.push(cp);
    }

    let fetches = self
      .adapters
      .iter()
      .zip(&checkpoints)
      .map(|(adapter, cp)| adapter.fetch(cp.as_ref()));
    let fetched = futures::future::join_all(fetches).await;

    for (slot, result) in fetched.into_iter().enumerate() {
      if cancel.is_cancelled() {
        return Err(CoreError::Cancelled);
      }
      let source = self.adapters[slot].source();
      match result {
        Ok(batch) => {
          if let Err(e) = self.ingest(&mut tally.reports[slot], batch, index).await {
            tally.reports[slot].outcome = SourceOutcome::Failed(e.to_string());
            return Err(e);
          }
        }
        Err(e) => {
          warn!(%source, error = %e, "source failed");
          tally.reports[slot].outcome = SourceOutcome::Failed(e.to_string());
          tally.errors.push(e.to_string());
        }
      }
    }
    Ok(())
  }

  /// Normalize, commit and advance one source's batch.
  async fn ingest(
    &self,
    report: &mut SourceReport,
    fetched: FetchedBatch,
    index: &mut IdentityIndex,
  ) -> sluice_core::Result<()> {
    let source = report.source;
    report.fallback = fetched.origin == Origin::Fallback;

    for reject in &fetched.rejects {
      warn!(%source, error = %reject, "record rejected");
    }
    let mut skipped = fetched.rejects.len() as u64;

    let mut batch = StagedBatch::new(source);
    for raw in &fetched.records {
      match normalize(source, raw) {
        Ok(record) => {
          index.observe(&record.canonical_id, source, &record.source_id);
          batch.normalized.push(record);
        }
        Err(e) => {
          warn!(%source, source_id = %raw.source_id, error = %e, "record skipped");
          skipped += 1;
        }
      }
    }
    batch.raw = fetched.records;
    report.skipped = skipped;

    let receipt = self
      .store
      .commit_batch(batch)
      .await
      .map_err(CoreError::persistence)?;
    match receipt {
      Some(receipt) => {
        report.committed = receipt.count();
        let cp = self
          .store
          .advance_checkpoint(receipt)
          .await
          .map_err(CoreError::persistence)?;
        debug!(
          %source,
          last_processed_id = %cp.last_processed_id,
          total_processed = cp.total_processed,
          "checkpoint advanced"
        );
      }
      None => debug!(%source, "nothing new to commit"),
    }

    info!(%source, committed = report.committed, skipped, "source ingested");
    report.outcome = SourceOutcome::Succeeded;
    Ok(())
  }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
  if let Some(s) = panic.downcast_ref::<&str>() {
    (*s).to_owned()
  } else if let Some(s) = panic.downcast_ref::<String>() {
    s.clone()
  } else {
    "unknown panic".to_owned()
  }
}
