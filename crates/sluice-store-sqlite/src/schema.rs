//! SQL schema for the Sluice SQLite store.
//!
//! Executed at connection startup. Column names are a contract with readers
//! of the database, so they only ever change additively.

use sluice_core::source::Source;

/// Shared tables; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;

-- Unified records. (source, source_id) is the upsert key.
CREATE TABLE IF NOT EXISTS normalized_data (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    source        TEXT NOT NULL,   -- 'api' | 'file'
    source_id     TEXT NOT NULL,
    canonical_id  TEXT NOT NULL,   -- 16 hex chars, content fingerprint
    name          TEXT NOT NULL DEFAULT '',
    numeric_value REAL,
    description   TEXT NOT NULL DEFAULT '',
    created_at    TEXT NOT NULL,   -- RFC 3339 UTC, preserved across upserts
    updated_at    TEXT NOT NULL,
    UNIQUE (source, source_id)
);

-- One row per source; only moves forward.
CREATE TABLE IF NOT EXISTS etl_checkpoint (
    source            TEXT PRIMARY KEY,
    last_processed_id TEXT NOT NULL,
    last_processed_at TEXT NOT NULL,
    total_processed   INTEGER NOT NULL DEFAULT 0,
    updated_at        TEXT NOT NULL
);

-- Run history. Rows are inserted once and never updated.
CREATE TABLE IF NOT EXISTS etl_runs (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    started_at        TEXT NOT NULL,
    ended_at          TEXT NOT NULL,
    duration_seconds  REAL NOT NULL,
    records_processed INTEGER NOT NULL,
    status            TEXT NOT NULL,   -- 'success' | 'failed' | 'partial'
    error_message     TEXT,
    created_at        TEXT NOT NULL,
    records_skipped   INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS normalized_canonical_idx ON normalized_data(canonical_id);
CREATE INDEX IF NOT EXISTS normalized_updated_idx   ON normalized_data(updated_at);
CREATE INDEX IF NOT EXISTS runs_status_idx          ON etl_runs(status);

PRAGMA user_version = 1;
";

/// Raw payloads verbatim, one table per source.
const RAW_TABLE: &str = "
CREATE TABLE IF NOT EXISTS {table} (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id   TEXT NOT NULL UNIQUE,
    data        TEXT NOT NULL,   -- JSON payload exactly as received
    ingested_at TEXT NOT NULL
);
";

/// Name of the raw table for `source`, e.g. `raw_api_data`.
pub fn raw_table(source: Source) -> String { format!("raw_{}_data", source.as_str()) }

/// DDL for every raw table.
pub fn raw_schema() -> String {
  Source::ALL
    .iter()
    .map(|s| RAW_TABLE.replace("{table}", &raw_table(*s)))
    .collect()
}

/// Drop statements for every table, used by `reset`.
pub fn drop_all() -> String {
  let mut sql = String::from(
    "DROP TABLE IF EXISTS etl_runs;
     DROP TABLE IF EXISTS etl_checkpoint;
     DROP TABLE IF EXISTS normalized_data;\n",
  );
  for source in Source::ALL {
    sql.push_str(&format!("DROP TABLE IF EXISTS {};\n", raw_table(source)));
  }
  sql
}
