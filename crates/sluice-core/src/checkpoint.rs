//! Per-source ingestion progress and the batch-commit handshake.
//!
//! A checkpoint may only advance past records that are durably stored. The
//! ordering is carried in the types: [`BatchReceipt`] is produced by a
//! successful batch commit and is the only input that advances a checkpoint.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
  record::{NormalizedRecord, RawRecord},
  source::{Source, compare_source_ids, max_source_id, same_id_kind},
};

/// Durable progress marker for one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
  pub source:            Source,
  pub last_processed_id: String,
  pub last_processed_at: DateTime<Utc>,
  /// Monotonically increasing across runs.
  pub total_processed:   u64,
  pub updated_at:        DateTime<Utc>,
}

impl Checkpoint {
  /// `true` if `source_id` has to be processed: it orders strictly after
  /// the cursor, or it is of a different id kind than the cursor and so
  /// cannot be placed relative to it. The latter are re-processed on every
  /// incremental run, which upserts make harmless.
  pub fn admits(&self, source_id: &str) -> bool {
    !same_id_kind(source_id, &self.last_processed_id)
      || compare_source_ids(source_id, &self.last_processed_id) == Ordering::Greater
  }

  /// The checkpoint after applying `receipt`. The cursor never moves back.
  pub fn advanced_by(&self, receipt: &BatchReceipt, now: DateTime<Utc>) -> Checkpoint {
    Checkpoint {
      source:            self.source,
      last_processed_id: max_source_id(&self.last_processed_id, &receipt.last_id).to_owned(),
      last_processed_at: receipt.committed_at.max(self.last_processed_at),
      total_processed:   self.total_processed + receipt.count,
      updated_at:        now,
    }
  }
}

/// Filter a fetched batch against an optional checkpoint.
/// No checkpoint means everything is admitted.
pub fn admits(since: Option<&Checkpoint>, source_id: &str) -> bool {
  since.is_none_or(|cp| cp.admits(source_id))
}

// ─── Batches ─────────────────────────────────────────────────────────────────

/// One source's raw payloads and their normalized forms, ready to commit
/// together.
#[derive(Debug, Clone)]
pub struct StagedBatch {
  pub source:     Source,
  pub raw:        Vec<RawRecord>,
  pub normalized: Vec<NormalizedRecord>,
}

impl StagedBatch {
  pub fn new(source: Source) -> Self {
    Self { source, raw: Vec::new(), normalized: Vec::new() }
  }

  pub fn is_empty(&self) -> bool { self.raw.is_empty() && self.normalized.is_empty() }

  /// Highest source id across the raw payloads, under the id ordering.
  pub fn last_id(&self) -> Option<&str> {
    self
      .raw
      .iter()
      .map(|r| r.source_id.as_str())
      .reduce(|a, b| max_source_id(a, b))
  }
}

/// Proof that a [`StagedBatch`] was committed.
///
/// Only storage backends build one, through [`backend::receipt_for`], at the
/// end of a successful commit transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchReceipt {
  source:       Source,
  last_id:      String,
  count:        u64,
  committed_at: DateTime<Utc>,
}

impl BatchReceipt {
  fn new(source: Source, last_id: String, count: u64, committed_at: DateTime<Utc>) -> Self {
    Self { source, last_id, count, committed_at }
  }

  pub fn source(&self) -> Source { self.source }

  pub fn last_id(&self) -> &str { &self.last_id }

  /// Normalized records written by the batch.
  pub fn count(&self) -> u64 { self.count }

  pub fn committed_at(&self) -> DateTime<Utc> { self.committed_at }

  /// The checkpoint to write when the source has none yet.
  pub fn first_checkpoint(&self, now: DateTime<Utc>) -> Checkpoint {
    Checkpoint {
      source:            self.source,
      last_processed_id: self.last_id.clone(),
      last_processed_at: self.committed_at,
      total_processed:   self.count,
      updated_at:        now,
    }
  }
}

/// Receipt construction for [`EtlStore`](crate::store::EtlStore)
/// implementations. Not for use outside a storage backend.
#[doc(hidden)]
pub mod backend {
  use chrono::{DateTime, Utc};

  use super::{BatchReceipt, StagedBatch};
  use crate::source::max_source_id;

  /// The receipt for `batch`, to be called once its transaction committed at
  /// `committed_at`. `None` for an empty batch.
  ///
  /// The cursor is the highest raw id, or the highest normalized id when the
  /// batch carries no raw payloads.
  pub fn receipt_for(batch: &StagedBatch, committed_at: DateTime<Utc>) -> Option<BatchReceipt> {
    let last_id = batch.last_id().or_else(|| {
      batch
        .normalized
        .iter()
        .map(|r| r.source_id.as_str())
        .reduce(max_source_id)
    })?;
    Some(BatchReceipt::new(
      batch.source,
      last_id.to_owned(),
      batch.normalized.len() as u64,
      committed_at,
    ))
  }
}
