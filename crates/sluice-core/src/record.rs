//! Raw and normalized record types.
//!
//! A [`RawRecord`] is a payload exactly as one source delivered it. Each source
//! has its own [`RawPayload`] variant and a static [`FieldMap`] describing
//! where the unified fields live in that shape.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Result, source::Source};

// ─── Field mapping ───────────────────────────────────────────────────────────

/// Field names to try, in priority order, for each unified field.
#[derive(Debug)]
pub struct FieldMap {
  pub id:          &'static [&'static str],
  pub name:        &'static [&'static str],
  pub value:       &'static [&'static str],
  pub description: &'static [&'static str],
}

/// JSON objects from the HTTP source. `title`/`body` cover post-shaped feeds.
pub static API_FIELDS: FieldMap = FieldMap {
  id:          &["id", "ID"],
  name:        &["name", "NAME", "title"],
  value:       &["value", "VALUE"],
  description: &["description", "body"],
};

/// Delimited-file rows. Headers are lowercased on read.
pub static FILE_FIELDS: FieldMap = FieldMap {
  id:          &["id"],
  name:        &["name"],
  value:       &["value"],
  description: &["description"],
};

// ─── Raw payload ─────────────────────────────────────────────────────────────

/// A field pulled out of a raw payload, before any coercion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawField<'a> {
  /// Absent from the payload, or JSON `null`.
  Missing,
  Text(&'a str),
  Json(&'a serde_json::Value),
}

/// The verbatim payload of one record, one variant per adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", content = "payload", rename_all = "lowercase")]
pub enum RawPayload {
  Api(serde_json::Map<String, serde_json::Value>),
  File(BTreeMap<String, String>),
}

impl RawPayload {
  pub fn source(&self) -> Source {
    match self {
      Self::Api(_) => Source::Api,
      Self::File(_) => Source::File,
    }
  }

  pub fn field_map(&self) -> &'static FieldMap {
    match self {
      Self::Api(_) => &API_FIELDS,
      Self::File(_) => &FILE_FIELDS,
    }
  }

  /// First present, non-null field among `names`.
  pub fn field(&self, names: &[&str]) -> RawField<'_> {
    for name in names {
      match self {
        Self::Api(obj) => match obj.get(*name) {
          None | Some(serde_json::Value::Null) => {}
          Some(serde_json::Value::String(s)) => return RawField::Text(s),
          Some(other) => return RawField::Json(other),
        },
        Self::File(row) => {
          if let Some(cell) = row.get(*name) {
            return RawField::Text(cell);
          }
        }
      }
    }
    RawField::Missing
  }

  /// The payload as stored in the raw tables.
  pub fn to_json(&self) -> Result<String> {
    Ok(match self {
      Self::Api(obj) => serde_json::to_string(obj)?,
      Self::File(row) => serde_json::to_string(row)?,
    })
  }
}

// ─── Records ─────────────────────────────────────────────────────────────────

/// One record as received. Immutable; re-ingesting the same `source_id`
/// supersedes the stored copy rather than adding a second one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
  pub source_id:   String,
  pub payload:     RawPayload,
  pub ingested_at: DateTime<Utc>,
}

impl RawRecord {
  pub fn source(&self) -> Source { self.payload.source() }
}

/// The unified entity stored in `normalized_data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
  /// Storage row id; `None` until persisted.
  pub id:            Option<i64>,
  pub source:        Source,
  pub source_id:     String,
  /// Content fingerprint shared by equivalent records across sources.
  pub canonical_id:  String,
  /// Never null; missing names become `""`.
  pub name:          String,
  pub numeric_value: Option<f64>,
  /// Never null; missing descriptions become `""`.
  pub description:   String,
  pub created_at:    DateTime<Utc>,
  pub updated_at:    DateTime<Utc>,
}
