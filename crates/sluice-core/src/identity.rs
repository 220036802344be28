//! Content-derived identity.
//!
//! A canonical id is a SHA-256 fingerprint over the case-folded, trimmed name
//! and the first [`DESCRIPTION_PREFIX_CHARS`] characters of the description,
//! truncated to [`CANONICAL_ID_LEN`] hex characters. It never looks at
//! `source` or `source_id`, which is what lets an API record and a file record
//! describing the same entity collapse together.
//!
//! Truncation to 64 bits admits collisions; they are not detected.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::source::Source;

pub const DESCRIPTION_PREFIX_CHARS: usize = 50;
pub const CANONICAL_ID_LEN: usize = 16;

const SEPARATOR: char = '|';

/// Compute the canonical id for a normalized `(name, description)` pair.
pub fn canonicalize(name: &str, description: &str) -> String {
  let name = name.trim().to_lowercase();
  let prefix: String = description
    .trim()
    .chars()
    .take(DESCRIPTION_PREFIX_CHARS)
    .collect();
  let prefix = prefix.trim_end().to_lowercase();

  let mut hasher = Sha256::new();
  hasher.update(name.as_bytes());
  hasher.update(SEPARATOR.to_string().as_bytes());
  hasher.update(prefix.as_bytes());
  let mut digest = hex::encode(hasher.finalize());
  digest.truncate(CANONICAL_ID_LEN);
  digest
}

// ─── Identity index ──────────────────────────────────────────────────────────

/// One `(source, source_id)` key observed under a canonical id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceKey {
  pub source:    Source,
  pub source_id: String,
}

/// A canonical id claimed by more than one source key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateGroup {
  pub canonical_id: String,
  pub keys:         Vec<SourceKey>,
}

impl DuplicateGroup {
  /// `true` when the keys span at least two different sources.
  pub fn is_cross_source(&self) -> bool {
    self
      .keys
      .first()
      .is_some_and(|first| self.keys.iter().any(|k| k.source != first.source))
  }
}

/// Maps canonical ids to the source keys seen under them.
///
/// Owned by whoever drives a run and passed through it explicitly. It is a
/// reporting aid only; the database stays authoritative and the index can be
/// rebuilt from it at any time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdentityIndex {
  entries: BTreeMap<String, Vec<SourceKey>>,
}

impl IdentityIndex {
  pub fn new() -> Self { Self::default() }

  /// Rebuild from stored `(canonical_id, source, source_id)` rows.
  pub fn from_rows<I>(rows: I) -> Self
  where
    I: IntoIterator<Item = (String, Source, String)>,
  {
    let mut index = Self::new();
    for (canonical_id, source, source_id) in rows {
      index.observe(&canonical_id, source, &source_id);
    }
    index
  }

  /// Record that `(source, source_id)` resolved to `canonical_id`.
  /// Observing the same key twice is a no-op.
  pub fn observe(&mut self, canonical_id: &str, source: Source, source_id: &str) {
    let keys = self.entries.entry(canonical_id.to_owned()).or_default();
    if !keys
      .iter()
      .any(|k| k.source == source && k.source_id == source_id)
    {
      keys.push(SourceKey { source, source_id: source_id.to_owned() });
    }
  }

  pub fn keys_for(&self, canonical_id: &str) -> &[SourceKey] {
    self
      .entries
      .get(canonical_id)
      .map(Vec::as_slice)
      .unwrap_or_default()
  }

  /// Number of distinct canonical ids.
  pub fn len(&self) -> usize { self.entries.len() }

  pub fn is_empty(&self) -> bool { self.entries.is_empty() }

  /// Every canonical id with more than one key, keys sorted.
  pub fn duplicates(&self) -> Vec<DuplicateGroup> {
    self
      .entries
      .iter()
      .filter(|(_, keys)| keys.len() > 1)
      .map(|(canonical_id, keys)| {
        let mut keys = keys.clone();
        keys.sort();
        DuplicateGroup { canonical_id: canonical_id.clone(), keys }
      })
      .collect()
  }
}
