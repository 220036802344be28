//! Local delimited-text source.

use std::{
  collections::BTreeMap,
  io::{self, Read},
  path::{Path, PathBuf},
};

use chrono::Utc;
use futures::{FutureExt as _, future::BoxFuture};
use sluice_core::{Error as CoreError, checkpoint::Checkpoint, record::RawPayload, source::Source};
use tracing::{info, warn};

use super::{FetchedBatch, Origin, SourceAdapter};

/// Served in place of the configured file when that file does not exist.
/// Row 3 carries an unparseable value and row 4 an empty one.
pub const FALLBACK_CSV: &str = "\
id,name,value,description
1,Sample Item 1,100.5,First sample record
2,Sample Item 2,200.75,Second sample record
3,Sample Item 3,not-a-number,Third sample record
4,Sample Item 4,,Fourth sample record
";

/// Reads a header-aware CSV file from local disk.
#[derive(Debug, Clone)]
pub struct FileAdapter {
  path: PathBuf,
}

impl FileAdapter {
  pub fn new(path: impl Into<PathBuf>) -> Self { Self { path: path.into() } }

  pub fn path(&self) -> &Path { &self.path }

  async fn fetch_records(
    &self,
    since: Option<&Checkpoint>,
  ) -> sluice_core::Result<FetchedBatch> {
    let path = self.path.clone();
    let since = since.cloned();

    let batch = tokio::task::spawn_blocking(move || read_source(&path, since.as_ref()))
      .await
      .map_err(|e| CoreError::SourceUnavailable(Source::File, format!("reader task failed: {e}")))??;

    match batch.origin {
      Origin::Fallback => warn!(
        path = %self.path.display(),
        fallback = true,
        records = batch.records.len(),
        "file not found, using built-in fallback dataset"
      ),
      Origin::Upstream if batch.records.is_empty() && batch.rejects.is_empty() => info!(
        path = %self.path.display(),
        fallback = false,
        behind_checkpoint = batch.behind_checkpoint,
        "file source yielded no new records"
      ),
      Origin::Upstream => info!(
        path = %self.path.display(),
        records = batch.records.len(),
        rejects = batch.rejects.len(),
        "file source read"
      ),
    }
    Ok(batch)
  }
}

impl SourceAdapter for FileAdapter {
  fn source(&self) -> Source { Source::File }

  fn fetch<'a>(
    &'a self,
    since: Option<&'a Checkpoint>,
  ) -> BoxFuture<'a, sluice_core::Result<FetchedBatch>> {
    self.fetch_records(since).boxed()
  }
}

fn read_source(path: &Path, since: Option<&Checkpoint>) -> sluice_core::Result<FetchedBatch> {
  match std::fs::File::open(path) {
    Ok(file) => parse_csv(file, since, Origin::Upstream),
    Err(e) if e.kind() == io::ErrorKind::NotFound => {
      parse_csv(FALLBACK_CSV.as_bytes(), since, Origin::Fallback)
    }
    Err(e) => Err(CoreError::SourceUnavailable(
      Source::File,
      format!("{}: {e}", path.display()),
    )),
  }
}

/// Parse CSV text into a batch. Headers are lowercased and must include `id`.
fn parse_csv<R: Read>(
  reader: R,
  since: Option<&Checkpoint>,
  origin: Origin,
) -> sluice_core::Result<FetchedBatch> {
  let mut rdr = csv::ReaderBuilder::new()
    .has_headers(true)
    .flexible(true)
    .trim(csv::Trim::Headers)
    .from_reader(reader);

  let headers: Vec<String> = rdr
    .headers()
    .map_err(|e| read_error(&e))?
    .iter()
    .map(str::to_lowercase)
    .collect();
  if !headers.iter().any(|h| h == "id") {
    return Err(CoreError::SourceFormat(
      Source::File,
      None,
      format!("header has no id column (found: {})", headers.join(",")),
    ));
  }

  let now = Utc::now();
  let mut batch = FetchedBatch::new(origin);
  for (position, row) in rdr.records().enumerate() {
    let row = match row {
      Ok(row) => row,
      Err(e) if e.is_io_error() => return Err(read_error(&e)),
      Err(e) => {
        batch.rejects.push(CoreError::SourceFormat(
          Source::File,
          Some(format!("row {}", position + 1)),
          e.to_string(),
        ));
        continue;
      }
    };

    if row.len() < headers.len() {
      batch.rejects.push(CoreError::SourceFormat(
        Source::File,
        Some(format!("row {}", position + 1)),
        format!("expected {} columns, found {}", headers.len(), row.len()),
      ));
      continue;
    }

    let cells: BTreeMap<String, String> = headers
      .iter()
      .cloned()
      .zip(row.iter().map(str::to_owned))
      .collect();
    batch.push(RawPayload::File(cells), since, now, position + 1);
  }
  Ok(batch)
}

fn read_error(e: &csv::Error) -> CoreError {
  if e.is_io_error() {
    CoreError::SourceUnavailable(Source::File, e.to_string())
  } else {
    CoreError::SourceFormat(Source::File, None, e.to_string())
  }
}
