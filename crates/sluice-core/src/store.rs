//! The `EtlStore` trait and supporting query types.
//!
//! The trait is implemented by storage backends (e.g. `sluice-store-sqlite`).
//! The pipeline and the HTTP API depend on this abstraction, not on any
//! concrete backend.

use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::{
  checkpoint::{BatchReceipt, Checkpoint, StagedBatch},
  identity::IdentityIndex,
  record::{NormalizedRecord, RawRecord},
  run::{NewRunRecord, RunRecord, RunStats},
  source::Source,
};

pub const DEFAULT_PAGE_SIZE: u32 = 10;
pub const MAX_PAGE_SIZE: u32 = 100;

// ─── Query types ─────────────────────────────────────────────────────────────

/// Parameters for [`EtlStore::query_page`]. Pages are 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordQuery {
  pub source:    Option<Source>,
  /// Case-insensitive substring match over `name` and `description`.
  pub search:    Option<String>,
  pub page:      u32,
  pub page_size: u32,
}

impl Default for RecordQuery {
  fn default() -> Self {
    Self { source: None, search: None, page: 1, page_size: DEFAULT_PAGE_SIZE }
  }
}

impl RecordQuery {
  /// Row offset of the first record on this page.
  pub fn offset(&self) -> u64 {
    u64::from(self.page.saturating_sub(1)) * u64::from(self.page_size)
  }
}

/// One page of results plus the unpaginated total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
  pub data:      Vec<T>,
  pub total:     u64,
  pub page:      u32,
  pub page_size: u32,
  pub has_more:  bool,
}

impl<T> Page<T> {
  pub fn new(data: Vec<T>, total: u64, query: &RecordQuery) -> Self {
    let has_more = u64::from(query.page) * u64::from(query.page_size) < total;
    Self { data, total, page: query.page, page_size: query.page_size, has_more }
  }
}

/// Number of normalized records stored per source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCount {
  pub source: Source,
  pub count:  u64,
}

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Abstraction over the ETL storage backend.
///
/// The backend exclusively owns writes to all durable tables. Writes must be
/// safe under concurrent writers: every record write is an upsert keyed on
/// `(source, source_id)`, never a delete-then-insert.
///
/// All methods return `Send` futures so the trait can be used from a
/// multi-threaded runtime.
pub trait EtlStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  // ── Records ───────────────────────────────────────────────────────────

  /// Store one raw payload. Re-storing the same `(source, source_id)`
  /// overwrites the stored copy.
  fn store_raw(
    &self,
    raw: RawRecord,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Insert-or-update on `(source, source_id)`. On conflict the mutable
  /// fields and `updated_at` change; `created_at` is preserved. Returns the
  /// stored row.
  fn upsert_normalized(
    &self,
    record: NormalizedRecord,
  ) -> impl Future<Output = Result<NormalizedRecord, Self::Error>> + Send + '_;

  /// Store every raw payload and upsert every normalized record of `batch`
  /// in one transaction. Either all of it is visible afterwards or none.
  fn commit_batch(
    &self,
    batch: StagedBatch,
  ) -> impl Future<Output = Result<Option<BatchReceipt>, Self::Error>> + Send + '_;

  // ── Checkpoints ───────────────────────────────────────────────────────

  /// The checkpoint for `source`, or `None` before its first commit.
  fn get_checkpoint(
    &self,
    source: Source,
  ) -> impl Future<Output = Result<Option<Checkpoint>, Self::Error>> + Send + '_;

  /// Advance the checkpoint of the receipt's source. The stored position
  /// never moves backward; `total_processed` grows by the receipt count.
  fn advance_checkpoint(
    &self,
    receipt: BatchReceipt,
  ) -> impl Future<Output = Result<Checkpoint, Self::Error>> + Send + '_;

  fn list_checkpoints(
    &self,
  ) -> impl Future<Output = Result<Vec<Checkpoint>, Self::Error>> + Send + '_;

  // ── Runs ──────────────────────────────────────────────────────────────

  /// Insert one immutable `etl_runs` row.
  fn record_run(
    &self,
    run: NewRunRecord,
  ) -> impl Future<Output = Result<RunRecord, Self::Error>> + Send + '_;

  fn last_run(
    &self,
  ) -> impl Future<Output = Result<Option<RunRecord>, Self::Error>> + Send + '_;

  fn run_stats(
    &self,
  ) -> impl Future<Output = Result<RunStats, Self::Error>> + Send + '_;

  // ── Reads ─────────────────────────────────────────────────────────────

  /// Fully committed records only, newest `updated_at` first.
  fn query_page<'a>(
    &'a self,
    query: &'a RecordQuery,
  ) -> impl Future<Output = Result<Page<NormalizedRecord>, Self::Error>> + Send + 'a;

  fn get_record(
    &self,
    source: Source,
    source_id: String,
  ) -> impl Future<Output = Result<Option<NormalizedRecord>, Self::Error>> + Send + '_;

  fn source_counts(
    &self,
  ) -> impl Future<Output = Result<Vec<SourceCount>, Self::Error>> + Send + '_;

  /// Rebuild the identity index from stored records.
  fn identity_index(
    &self,
  ) -> impl Future<Output = Result<IdentityIndex, Self::Error>> + Send + '_;

  // ── Maintenance ───────────────────────────────────────────────────────

  /// Cheap connectivity probe.
  fn ping(&self) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Drop and recreate every table.
  fn reset(&self) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;
}
