//! Error types for `sluice-core`.
//!
//! The variants mirror how far a failure reaches: a single record
//! (`SourceFormat`, `Normalization`), a whole source (`SourceUnavailable`, or
//! `SourceFormat` without a record id), or the whole run (`Persistence`).

use thiserror::Error;

use crate::source::Source;

#[derive(Debug, Error)]
pub enum Error {
  /// Network or file-access failure. Isolated to one source.
  #[error("{0} source unavailable: {1}")]
  SourceUnavailable(Source, String),

  /// Malformed raw payload. `Some(id)` scopes it to one record.
  #[error(
    "{0} source format error{record}: {2}",
    record = .1.as_deref().map(|id| format!(" (record {id})")).unwrap_or_default()
  )]
  SourceFormat(Source, Option<String>, String),

  /// A raw record whose shape cannot be mapped onto the unified schema.
  #[error("cannot normalize {0} record {1}: {2}")]
  Normalization(Source, String, String),

  /// Database write or read failure.
  #[error("persistence error: {0}")]
  Persistence(#[source] Box<dyn std::error::Error + Send + Sync>),

  #[error("unknown source: {0:?}")]
  UnknownSource(String),

  #[error("unknown run status: {0:?}")]
  UnknownRunStatus(String),

  #[error("run cancelled")]
  Cancelled,

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl Error {
  /// Wrap any storage backend error.
  pub fn persistence<E>(err: E) -> Self
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    Self::Persistence(Box::new(err))
  }

  /// `true` for errors that only invalidate a single record.
  pub fn is_record_level(&self) -> bool {
    matches!(self, Self::SourceFormat(_, Some(_), _) | Self::Normalization(..))
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
