//! Source identifiers and the ordering of source-local record ids.

use std::{cmp::Ordering, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::Error;

/// Where a record was ingested from.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum Source {
  /// JSON array served over HTTP.
  Api,
  /// Local header-aware delimited text file.
  #[serde(alias = "csv")]
  File,
}

impl Source {
  pub const ALL: [Source; 2] = [Source::Api, Source::File];

  /// The value stored in the `source` columns.
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Api => "api",
      Self::File => "file",
    }
  }
}

impl fmt::Display for Source {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Source {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str() {
      "api" => Ok(Self::Api),
      // The file source used to be called `csv`.
      "file" | "csv" => Ok(Self::File),
      other => Err(Error::UnknownSource(other.to_owned())),
    }
  }
}

/// Compare two source-local ids.
///
/// Integer ids compare numerically (`"9" < "10"`) and two non-integer ids
/// compare as plain strings. Across the two kinds every non-integer id sorts
/// before every integer id, which keeps the order total.
pub fn compare_source_ids(a: &str, b: &str) -> Ordering {
  match (parse_integer(a), parse_integer(b)) {
    (Some(x), Some(y)) => x.cmp(&y),
    (Some(_), None) => Ordering::Greater,
    (None, Some(_)) => Ordering::Less,
    (None, None) => a.cmp(b),
  }
}

/// `true` when both ids are integers or both are not.
pub fn same_id_kind(a: &str, b: &str) -> bool {
  parse_integer(a).is_some() == parse_integer(b).is_some()
}

fn parse_integer(id: &str) -> Option<i128> { id.trim().parse().ok() }

/// The later of two source-local ids under [`compare_source_ids`].
pub fn max_source_id<'a>(a: &'a str, b: &'a str) -> &'a str {
  if compare_source_ids(a, b) == Ordering::Less { b } else { a }
}
