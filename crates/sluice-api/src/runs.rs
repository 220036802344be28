//! Handlers for run status, statistics and manual triggers.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `GET`  | `/` | Service index |
//! | `GET`  | `/health` | DB connectivity and the latest run |
//! | `GET`  | `/stats` | Aggregates over `etl_runs` plus per-source counts |
//! | `GET`  | `/checkpoints` | Per-source ingestion progress |
//! | `POST` | `/etl/run` | 202 with a run id; 409 while one is already queued |

use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use sluice_core::{
  checkpoint::Checkpoint,
  run::{RunStats, RunStatus},
  store::{EtlStore, SourceCount},
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{AppState, error::ApiError};

// ─── Index ────────────────────────────────────────────────────────────────────

/// `GET /`
pub async fn index() -> Json<Value> {
  Json(json!({
    "message": "Sluice ETL API",
    "version": env!("CARGO_PKG_VERSION"),
    "endpoints": {
      "GET /health": "Health check",
      "GET /data": "Paginated normalized records",
      "POST /data": "Upsert one record",
      "GET /data/{source}/{source_id}": "One record by source key",
      "GET /stats": "ETL run statistics",
      "GET /checkpoints": "Per-source ingestion progress",
      "POST /etl/run": "Queue a manual ETL run",
    }
  }))
}

// ─── Health ───────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct Health {
  pub status:       &'static str,
  pub db_connected: bool,
  pub last_etl_run: Option<DateTime<Utc>>,
  /// Status of the latest run, or `"unknown"` before the first one.
  pub etl_status:   String,
  pub last_error:   Option<String>,
}

/// `GET /health`: always 200; an unreachable database shows as
/// `"unhealthy"` in the body, an unreadable run history as `"degraded"`.
pub async fn health<S: EtlStore>(State(state): State<AppState<S>>) -> Json<Health> {
  if let Err(e) = state.store.ping().await {
    warn!(error = %e, "health check could not reach the database");
    return Json(Health {
      status:       "unhealthy",
      db_connected: false,
      last_etl_run: None,
      etl_status:   "unknown".into(),
      last_error:   Some(e.to_string()),
    });
  }

  let last = match state.store.last_run().await {
    Ok(last) => last,
    Err(e) => {
      warn!(error = %e, "health check could not read run history");
      return Json(Health {
        status:       "degraded",
        db_connected: true,
        last_etl_run: None,
        etl_status:   "unknown".into(),
        last_error:   Some(format!("could not read run history: {e}")),
      });
    }
  };
  let status = match last.as_ref().map(|r| r.status) {
    Some(RunStatus::Failed) | Some(RunStatus::Partial) => "degraded",
    _ => "healthy",
  };

  Json(Health {
    status,
    db_connected: true,
    last_etl_run: last.as_ref().map(|r| r.ended_at),
    etl_status: last
      .as_ref()
      .map_or_else(|| "unknown".to_owned(), |r| r.status.to_string()),
    last_error: last.and_then(|r| r.error_message),
  })
}

// ─── Stats ────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct Stats {
  #[serde(flatten)]
  pub runs:              RunStats,
  pub records_by_source: Vec<SourceCount>,
}

/// `GET /stats`
pub async fn stats<S: EtlStore>(State(state): State<AppState<S>>) -> Result<Json<Stats>, ApiError> {
  let runs = state.store.run_stats().await.map_err(ApiError::store)?;
  let records_by_source = state
    .store
    .source_counts()
    .await
    .map_err(ApiError::store)?;
  Ok(Json(Stats { runs, records_by_source }))
}

/// `GET /checkpoints`
pub async fn checkpoints<S: EtlStore>(
  State(state): State<AppState<S>>,
) -> Result<Json<Vec<Checkpoint>>, ApiError> {
  let all = state
    .store
    .list_checkpoints()
    .await
    .map_err(ApiError::store)?;
  Ok(Json(all))
}

// ─── Trigger ──────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct Triggered {
  pub run_id: Uuid,
  pub status: &'static str,
}

/// `POST /etl/run`
pub async fn trigger<S: EtlStore>(
  State(state): State<AppState<S>>,
) -> Result<impl IntoResponse, ApiError> {
  let request = state.trigger.request()?;
  info!(run_id = %request.run_id, "manual etl run queued");
  Ok((StatusCode::ACCEPTED, Json(Triggered { run_id: request.run_id, status: "started" })))
}
