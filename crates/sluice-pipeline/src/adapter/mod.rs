//! Source adapters: one per upstream, each turning whatever the upstream
//! serves into [`RawRecord`]s.
//!
//! Adapters never touch storage. They receive the source's checkpoint (or
//! `None` for a full re-ingest) and return only the records past it.

mod api;
mod file;

use futures::future::BoxFuture;
use sluice_core::{
  checkpoint::{Checkpoint, admits},
  record::{RawField, RawPayload, RawRecord},
  source::Source,
};

pub use self::{
  api::ApiAdapter,
  file::{FALLBACK_CSV, FileAdapter},
};

/// Where a fetched batch came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
  /// The configured upstream answered.
  Upstream,
  /// The configured file was missing and the compiled-in dataset was used.
  Fallback,
}

/// The result of one successful fetch.
#[derive(Debug)]
pub struct FetchedBatch {
  pub records:           Vec<RawRecord>,
  /// Per-record failures; the rest of the batch is still usable.
  pub rejects:           Vec<sluice_core::Error>,
  /// Records at or before the checkpoint, dropped without error.
  pub behind_checkpoint: usize,
  pub origin:            Origin,
}

impl FetchedBatch {
  fn new(origin: Origin) -> Self {
    Self { records: Vec::new(), rejects: Vec::new(), behind_checkpoint: 0, origin }
  }

  /// Admit `payload` as a record if it carries an id past `since`.
  fn push(
    &mut self,
    payload: RawPayload,
    since: Option<&Checkpoint>,
    now: chrono::DateTime<chrono::Utc>,
    position: usize,
  ) {
    let source = payload.source();
    let Some(source_id) = source_id(&payload) else {
      self.rejects.push(sluice_core::Error::SourceFormat(
        source,
        Some(format!("#{position}")),
        "record has no identifier".into(),
      ));
      return;
    };
    if !admits(since, &source_id) {
      self.behind_checkpoint += 1;
      return;
    }
    self.records.push(RawRecord { source_id, payload, ingested_at: now });
  }
}

/// A fetchable upstream.
///
/// Object-safe so the orchestrator can hold a heterogeneous list of them.
pub trait SourceAdapter: Send + Sync {
  fn source(&self) -> Source;

  fn fetch<'a>(
    &'a self,
    since: Option<&'a Checkpoint>,
  ) -> BoxFuture<'a, sluice_core::Result<FetchedBatch>>;
}

/// The source-local identifier of `payload`, trimmed. Integral JSON numbers
/// render without a fractional part.
pub fn source_id(payload: &RawPayload) -> Option<String> {
  let id = match payload.field(payload.field_map().id) {
    RawField::Missing => return None,
    RawField::Text(s) => s.trim().to_owned(),
    RawField::Json(serde_json::Value::Number(n)) => {
      if let Some(i) = n.as_i64() {
        i.to_string()
      } else if let Some(u) = n.as_u64() {
        u.to_string()
      } else {
        match n.as_f64() {
          Some(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{f:.0}"),
          _ => n.to_string(),
        }
      }
    }
    RawField::Json(_) => return None,
  };
  (!id.is_empty()).then_some(id)
}
