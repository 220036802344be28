//! [`SqliteStore`], the SQLite implementation of [`EtlStore`].

use std::{path::Path, time::Duration};

use chrono::Utc;
use rusqlite::{OptionalExtension as _, TransactionBehavior, functions::FunctionFlags};
use sluice_core::{
  checkpoint::{BatchReceipt, Checkpoint, StagedBatch, backend},
  identity::IdentityIndex,
  record::{NormalizedRecord, RawRecord},
  run::{NewRunRecord, RunRecord, RunStats, RunStatus},
  source::Source,
  store::{EtlStore, Page, RecordQuery, SourceCount},
};
use tracing::debug;

use crate::{
  Error, Result,
  encode::{
    CHECKPOINT_COLUMNS, FOLD_FUNCTION, RECORD_COLUMNS, RUN_COLUMNS, RawCheckpoint, RawNormalized,
    RawRun, decode_count, decode_opt_dt, decode_source, encode_count, encode_dt, fold_case,
    like_pattern,
  },
  schema::{SCHEMA, drop_all, raw_schema, raw_table},
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// ─── Encoded rows ────────────────────────────────────────────────────────────

/// A raw payload with every column already rendered to text.
struct EncodedRaw {
  source_id:   String,
  data:        String,
  ingested_at: String,
}

impl EncodedRaw {
  fn new(raw: &RawRecord) -> Result<Self> {
    Ok(Self {
      source_id:   raw.source_id.clone(),
      data:        raw.payload.to_json()?,
      ingested_at: encode_dt(raw.ingested_at),
    })
  }
}

/// A normalized record with every column already rendered.
struct EncodedRecord {
  source:        &'static str,
  source_id:     String,
  canonical_id:  String,
  name:          String,
  numeric_value: Option<f64>,
  description:   String,
  created_at:    String,
  updated_at:    String,
}

impl EncodedRecord {
  fn new(r: &NormalizedRecord) -> Self {
    Self {
      source:        r.source.as_str(),
      source_id:     r.source_id.clone(),
      canonical_id:  r.canonical_id.clone(),
      name:          r.name.clone(),
      numeric_value: r.numeric_value,
      description:   r.description.clone(),
      created_at:    encode_dt(r.created_at),
      updated_at:    encode_dt(r.updated_at),
    }
  }
}

fn upsert_raw_row(conn: &rusqlite::Connection, table: &str, raw: &EncodedRaw) -> rusqlite::Result<()> {
  conn
    .prepare_cached(&format!(
      "INSERT INTO {table} (source_id, data, ingested_at) VALUES (?1, ?2, ?3)
       ON CONFLICT(source_id) DO UPDATE SET
         data        = excluded.data,
         ingested_at = excluded.ingested_at"
    ))?
    .execute(rusqlite::params![raw.source_id, raw.data, raw.ingested_at])?;
  Ok(())
}

/// Insert-or-update keyed on `(source, source_id)`; `created_at` is only
/// written on insert.
fn upsert_record_row(
  conn: &rusqlite::Connection,
  rec: &EncodedRecord,
) -> rusqlite::Result<RawNormalized> {
  conn
    .prepare_cached(&format!(
      "INSERT INTO normalized_data (
         source, source_id, canonical_id, name, numeric_value, description,
         created_at, updated_at
       ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
       ON CONFLICT(source, source_id) DO UPDATE SET
         canonical_id  = excluded.canonical_id,
         name          = excluded.name,
         numeric_value = excluded.numeric_value,
         description   = excluded.description,
         updated_at    = excluded.updated_at
       RETURNING {RECORD_COLUMNS}"
    ))?
    .query_row(
      rusqlite::params![
        rec.source,
        rec.source_id,
        rec.canonical_id,
        rec.name,
        rec.numeric_value,
        rec.description,
        rec.created_at,
        rec.updated_at,
      ],
      RawNormalized::from_row,
    )
}

fn select_checkpoint(
  conn: &rusqlite::Connection,
  source: &str,
) -> rusqlite::Result<Option<RawCheckpoint>> {
  conn
    .query_row(
      &format!("SELECT {CHECKPOINT_COLUMNS} FROM etl_checkpoint WHERE source = ?1"),
      rusqlite::params![source],
      RawCheckpoint::from_row,
    )
    .optional()
}

// ─── Store ───────────────────────────────────────────────────────────────────

/// An ETL store backed by a single SQLite file.
///
/// Cloning is cheap; the inner connection is reference-counted.
#[derive(Clone)]
pub struct SqliteStore {
  conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory store, for tests.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.create_scalar_function(
          FOLD_FUNCTION,
          1,
          FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
          |ctx| Ok(ctx.get::<Option<String>>(0)?.map(|s| fold_case(&s))),
        )?;
        conn.execute_batch(SCHEMA)?;
        conn.execute_batch(&raw_schema())?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// Verbatim JSON payload stored for `(source, source_id)`, if any.
  pub async fn raw_payload(&self, source: Source, source_id: &str) -> Result<Option<String>> {
    let table = raw_table(source);
    let id = source_id.to_owned();
    let data = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              &format!("SELECT data FROM {table} WHERE source_id = ?1"),
              rusqlite::params![id],
              |row| row.get(0),
            )
            .optional()?,
        )
      })
      .await?;
    Ok(data)
  }

  /// Number of rows in the raw table for `source`.
  pub async fn raw_count(&self, source: Source) -> Result<u64> {
    let table = raw_table(source);
    let n: i64 = self
      .conn
      .call(move |conn| {
        Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?)
      })
      .await?;
    decode_count("count", n)
  }
}

// ─── EtlStore impl ───────────────────────────────────────────────────────────

impl EtlStore for SqliteStore {
  type Error = Error;

  // ── Records ───────────────────────────────────────────────────────────────

  async fn store_raw(&self, raw: RawRecord) -> Result<()> {
    let table = raw_table(raw.source());
    let encoded = EncodedRaw::new(&raw)?;

    self
      .conn
      .call(move |conn| {
        upsert_raw_row(conn, &table, &encoded)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn upsert_normalized(&self, record: NormalizedRecord) -> Result<NormalizedRecord> {
    let encoded = EncodedRecord::new(&record);

    let row = self
      .conn
      .call(move |conn| Ok(upsert_record_row(conn, &encoded)?))
      .await?;
    row.into_record()
  }

  async fn commit_batch(&self, batch: StagedBatch) -> Result<Option<BatchReceipt>> {
    if batch.is_empty() {
      return Ok(None);
    }
    let source = batch.source;
    if batch.raw.iter().any(|r| r.source() != source)
      || batch.normalized.iter().any(|r| r.source != source)
    {
      return Err(Error::Corrupt {
        column: "source",
        detail: format!("batch for {source} contains records from another source"),
      });
    }

    let raws = batch
      .raw
      .iter()
      .map(EncodedRaw::new)
      .collect::<Result<Vec<_>>>()?;
    let records: Vec<EncodedRecord> = batch.normalized.iter().map(EncodedRecord::new).collect();
    let count = records.len() as u64;
    let table = raw_table(source);

    let committed_at = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        for raw in &raws {
          upsert_raw_row(&tx, &table, raw)?;
        }
        for rec in &records {
          upsert_record_row(&tx, rec)?;
        }
        tx.commit()?;
        Ok(Utc::now())
      })
      .await?;

    debug!(%source, raw = batch.raw.len(), normalized = count, "batch committed");
    Ok(backend::receipt_for(&batch, committed_at))
  }

  // ── Checkpoints ───────────────────────────────────────────────────────────

  async fn get_checkpoint(&self, source: Source) -> Result<Option<Checkpoint>> {
    let raw = self
      .conn
      .call(move |conn| Ok(select_checkpoint(conn, source.as_str())?))
      .await?;
    raw.map(RawCheckpoint::into_checkpoint).transpose()
  }

  async fn advance_checkpoint(&self, receipt: BatchReceipt) -> Result<Checkpoint> {
    let source = receipt.source().as_str();

    let raw = self
      .conn
      .call(move |conn| {
        // IMMEDIATE takes the write lock up front, so a concurrent writer
        // cannot slip in between the read and the write.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now();
        let next = match select_checkpoint(&tx, source)? {
          Some(current) => current.into_checkpoint()?.advanced_by(&receipt, now),
          None => receipt.first_checkpoint(now),
        };

        tx.execute(
          "INSERT INTO etl_checkpoint (
             source, last_processed_id, last_processed_at, total_processed, updated_at
           ) VALUES (?1, ?2, ?3, ?4, ?5)
           ON CONFLICT(source) DO UPDATE SET
             last_processed_id = excluded.last_processed_id,
             last_processed_at = excluded.last_processed_at,
             total_processed   = excluded.total_processed,
             updated_at        = excluded.updated_at",
          rusqlite::params![
            source,
            next.last_processed_id,
            encode_dt(next.last_processed_at),
            encode_count(next.total_processed),
            encode_dt(next.updated_at),
          ],
        )?;
        let stored = select_checkpoint(&tx, source)?;
        tx.commit()?;
        Ok(stored)
      })
      .await?;

    raw
      .ok_or_else(|| Error::Corrupt {
        column: "etl_checkpoint",
        detail: format!("checkpoint for {source} vanished after write"),
      })?
      .into_checkpoint()
  }

  async fn list_checkpoints(&self) -> Result<Vec<Checkpoint>> {
    let raws: Vec<RawCheckpoint> = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {CHECKPOINT_COLUMNS} FROM etl_checkpoint ORDER BY source"
        ))?;
        let rows = stmt
          .query_map([], RawCheckpoint::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawCheckpoint::into_checkpoint).collect()
  }

  // ── Runs ──────────────────────────────────────────────────────────────────

  async fn record_run(&self, run: NewRunRecord) -> Result<RunRecord> {
    let started_at = encode_dt(run.started_at);
    let ended_at   = encode_dt(run.ended_at);
    let processed  = encode_count(run.records_processed);
    let skipped    = encode_count(run.records_skipped);
    let status     = run.status.as_str();
    let created_at = encode_dt(Utc::now());

    let raw = self
      .conn
      .call(move |conn| {
        Ok(conn.query_row(
          &format!(
            "INSERT INTO etl_runs (
               started_at, ended_at, duration_seconds, records_processed,
               records_skipped, status, error_message, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             RETURNING {RUN_COLUMNS}"
          ),
          rusqlite::params![
            started_at,
            ended_at,
            run.duration_seconds,
            processed,
            skipped,
            status,
            run.error_message,
            created_at,
          ],
          RawRun::from_row,
        )?)
      })
      .await?;

    raw.into_run()
  }

  async fn last_run(&self) -> Result<Option<RunRecord>> {
    let raw = self
      .conn
      .call(|conn| {
        Ok(
          conn
            .query_row(
              &format!("SELECT {RUN_COLUMNS} FROM etl_runs ORDER BY id DESC LIMIT 1"),
              [],
              RawRun::from_row,
            )
            .optional()?,
        )
      })
      .await?;

    raw.map(RawRun::into_run).transpose()
  }

  async fn run_stats(&self) -> Result<RunStats> {
    let success = RunStatus::Success.as_str();
    let partial = RunStatus::Partial.as_str();
    let failed  = RunStatus::Failed.as_str();

    let (count, processed, duration, last_success, last_failure) = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let (count, processed, duration): (i64, i64, f64) = tx.query_row(
          "SELECT COUNT(*),
                  COALESCE(SUM(CASE WHEN status IN (?1, ?2) THEN records_processed ELSE 0 END), 0),
                  COALESCE(SUM(duration_seconds), 0.0)
           FROM etl_runs",
          rusqlite::params![success, partial],
          |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        let last_success: Option<String> = tx
          .query_row(
            "SELECT ended_at FROM etl_runs WHERE status = ?1 ORDER BY id DESC LIMIT 1",
            rusqlite::params![success],
            |row| row.get(0),
          )
          .optional()?;
        let last_failure: Option<(String, Option<String>)> = tx
          .query_row(
            "SELECT ended_at, error_message FROM etl_runs
             WHERE status IN (?1, ?2) ORDER BY id DESC LIMIT 1",
            rusqlite::params![failed, partial],
            |row| Ok((row.get(0)?, row.get(1)?)),
          )
          .optional()?;
        tx.commit()?;
        Ok((count, processed, duration, last_success, last_failure))
      })
      .await?;

    let (last_failure_at, last_failure_reason) = match last_failure {
      Some((at, reason)) => (Some(at), reason),
      None => (None, None),
    };

    Ok(RunStats {
      run_count:               decode_count("run_count", count)?,
      total_records_processed: decode_count("records_processed", processed)?,
      total_duration_seconds:  duration,
      last_success:            decode_opt_dt(last_success.as_deref())?,
      last_failure:            decode_opt_dt(last_failure_at.as_deref())?,
      last_failure_reason,
    })
  }

  // ── Reads ─────────────────────────────────────────────────────────────────

  async fn query_page(&self, query: &RecordQuery) -> Result<Page<NormalizedRecord>> {
    let source  = query.source.map(Source::as_str);
    let pattern = query
      .search
      .as_deref()
      .map(str::trim)
      .filter(|s| !s.is_empty())
      .map(like_pattern);
    let limit  = i64::from(query.page_size);
    let offset = i64::try_from(query.offset()).unwrap_or(i64::MAX);

    let (total, raws) = self
      .conn
      .call(move |conn| {
        let filter = format!(
          "WHERE (?1 IS NULL OR source = ?1)
             AND (?2 IS NULL
                  OR {FOLD_FUNCTION}(name) LIKE ?2 ESCAPE '\\'
                  OR {FOLD_FUNCTION}(description) LIKE ?2 ESCAPE '\\')"
        );

        // One read transaction so the count and the page agree.
        let tx = conn.transaction()?;
        let total: i64 = tx.query_row(
          &format!("SELECT COUNT(*) FROM normalized_data {filter}"),
          rusqlite::params![source, pattern],
          |row| row.get(0),
        )?;
        let rows = {
          let mut stmt = tx.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM normalized_data {filter}
             ORDER BY updated_at DESC, id DESC
             LIMIT ?3 OFFSET ?4"
          ))?;
          stmt
            .query_map(
              rusqlite::params![source, pattern, limit, offset],
              RawNormalized::from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?
        };
        tx.commit()?;
        Ok((total, rows))
      })
      .await?;

    let data = raws
      .into_iter()
      .map(RawNormalized::into_record)
      .collect::<Result<Vec<_>>>()?;
    Ok(Page::new(data, decode_count("total", total)?, query))
  }

  async fn get_record(
    &self,
    source: Source,
    source_id: String,
  ) -> Result<Option<NormalizedRecord>> {
    let raw = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              &format!(
                "SELECT {RECORD_COLUMNS} FROM normalized_data
                 WHERE source = ?1 AND source_id = ?2"
              ),
              rusqlite::params![source.as_str(), source_id],
              RawNormalized::from_row,
            )
            .optional()?,
        )
      })
      .await?;

    raw.map(RawNormalized::into_record).transpose()
  }

  async fn source_counts(&self) -> Result<Vec<SourceCount>> {
    let rows: Vec<(String, i64)> = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare(
          "SELECT source, COUNT(*) FROM normalized_data GROUP BY source ORDER BY source",
        )?;
        let rows = stmt
          .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    rows
      .into_iter()
      .map(|(source, count)| {
        Ok(SourceCount { source: decode_source(&source)?, count: decode_count("count", count)? })
      })
      .collect()
  }

  async fn identity_index(&self) -> Result<IdentityIndex> {
    let rows: Vec<(String, String, String)> = self
      .conn
      .call(|conn| {
        let mut stmt =
          conn.prepare("SELECT canonical_id, source, source_id FROM normalized_data ORDER BY id")?;
        let rows = stmt
          .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    let decoded = rows
      .into_iter()
      .map(|(canonical_id, source, source_id)| Ok((canonical_id, decode_source(&source)?, source_id)))
      .collect::<Result<Vec<_>>>()?;
    Ok(IdentityIndex::from_rows(decoded))
  }

  // ── Maintenance ───────────────────────────────────────────────────────────

  async fn ping(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn reset(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(&drop_all())?;
        conn.execute_batch(SCHEMA)?;
        conn.execute_batch(&raw_schema())?;
        Ok(())
      })
      .await?;
    Ok(())
  }
}

