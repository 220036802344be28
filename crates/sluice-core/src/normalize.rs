//! Mapping raw payloads onto the unified record schema.
//!
//! Numerics are parse-or-null: a value that does not parse becomes `None` and
//! the record is kept. Missing text fields become `""`. Only a structurally
//! unusable field (an array or object where text was expected) rejects the
//! record.

use chrono::{DateTime, Utc};

use crate::{
  Error, Result,
  identity::canonicalize,
  record::{NormalizedRecord, RawField, RawPayload, RawRecord},
  source::Source,
};

/// Normalize `raw` as a record from `source`, stamped with the current time.
pub fn normalize(source: Source, raw: &RawRecord) -> Result<NormalizedRecord> {
  normalize_at(source, raw, Utc::now())
}

/// Normalize `raw`, using `now` for both `created_at` and `updated_at`.
///
/// The store keeps the original `created_at` when the key already exists.
pub fn normalize_at(
  source: Source,
  raw: &RawRecord,
  now: DateTime<Utc>,
) -> Result<NormalizedRecord> {
  if raw.source() != source {
    return Err(Error::Normalization(
      source,
      raw.source_id.clone(),
      format!("payload was produced by the {} adapter", raw.source()),
    ));
  }

  let fields = raw.payload.field_map();
  let name = coerce_text(&raw.payload, fields.name, source, &raw.source_id, "name")?;
  let description = coerce_text(
    &raw.payload,
    fields.description,
    source,
    &raw.source_id,
    "description",
  )?;
  let numeric_value = coerce_number(raw.payload.field(fields.value));

  Ok(NormalizedRecord {
    id: None,
    source,
    source_id: raw.source_id.clone(),
    canonical_id: canonicalize(&name, &description),
    name,
    numeric_value,
    description,
    created_at: now,
    updated_at: now,
  })
}

fn coerce_text(
  payload: &RawPayload,
  names: &[&str],
  source: Source,
  source_id: &str,
  label: &str,
) -> Result<String> {
  match payload.field(names) {
    RawField::Missing => Ok(String::new()),
    RawField::Text(s) => Ok(s.to_owned()),
    RawField::Json(serde_json::Value::Number(n)) => Ok(n.to_string()),
    RawField::Json(serde_json::Value::Bool(b)) => Ok(b.to_string()),
    RawField::Json(other) => Err(Error::Normalization(
      source,
      source_id.to_owned(),
      format!("{label} must be a scalar, got {}", json_kind(other)),
    )),
  }
}

/// Parse-or-null. Non-finite results are treated as unparseable.
pub fn coerce_number(field: RawField<'_>) -> Option<f64> {
  let parsed = match field {
    RawField::Missing => None,
    RawField::Text(s) => {
      let s = s.trim();
      if s.is_empty() { None } else { s.parse::<f64>().ok() }
    }
    RawField::Json(serde_json::Value::Number(n)) => n.as_f64(),
    RawField::Json(_) => None,
  };
  parsed.filter(|v| v.is_finite())
}

fn json_kind(value: &serde_json::Value) -> &'static str {
  match value {
    serde_json::Value::Null => "null",
    serde_json::Value::Bool(_) => "boolean",
    serde_json::Value::Number(_) => "number",
    serde_json::Value::String(_) => "string",
    serde_json::Value::Array(_) => "array",
    serde_json::Value::Object(_) => "object",
  }
}
