//! Handlers for `/data` endpoints.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `GET`  | `/data` | `?page=&page_size=&source=&search=`; 400 on out-of-range paging |
//! | `POST` | `/data` | Upsert one record on `(source, source_id)` |
//! | `GET`  | `/data/{source}/{source_id}` | One record; 404 if absent |

use axum::{
  Json,
  extract::{Path, Query, State},
};
use chrono::Utc;
use serde::Deserialize;
use sluice_core::{
  identity::canonicalize,
  record::NormalizedRecord,
  source::Source,
  store::{DEFAULT_PAGE_SIZE, EtlStore, MAX_PAGE_SIZE, Page, RecordQuery},
};
use tracing::info;

use crate::{AppState, error::ApiError};

fn parse_source(raw: &str) -> Result<Source, ApiError> {
  raw.parse().map_err(|e: sluice_core::Error| ApiError::BadRequest(e.to_string()))
}

// ─── List ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ListParams {
  pub page:      Option<i64>,
  pub page_size: Option<i64>,
  pub source:    Option<String>,
  pub search:    Option<String>,
}

impl ListParams {
  fn into_query(self) -> Result<RecordQuery, ApiError> {
    let page = self.page.unwrap_or(1);
    if page < 1 {
      return Err(ApiError::BadRequest(format!("page must be >= 1, got {page}")));
    }
    let page_size = self.page_size.unwrap_or(i64::from(DEFAULT_PAGE_SIZE));
    if !(1..=i64::from(MAX_PAGE_SIZE)).contains(&page_size) {
      return Err(ApiError::BadRequest(format!(
        "page_size must be between 1 and {MAX_PAGE_SIZE}, got {page_size}"
      )));
    }
    let source = self
      .source
      .as_deref()
      .filter(|s| !s.trim().is_empty())
      .map(parse_source)
      .transpose()?;

    Ok(RecordQuery {
      source,
      search: self.search,
      page: u32::try_from(page)
        .map_err(|_| ApiError::BadRequest(format!("page {page} is too large")))?,
      // Checked against MAX_PAGE_SIZE above.
      page_size: page_size as u32,
    })
  }
}

/// `GET /data`
pub async fn list<S: EtlStore>(
  State(state): State<AppState<S>>,
  Query(params): Query<ListParams>,
) -> Result<Json<Page<NormalizedRecord>>, ApiError> {
  let query = params.into_query()?;
  let page = state
    .store
    .query_page(&query)
    .await
    .map_err(ApiError::store)?;
  info!(
    page = page.page,
    page_size = page.page_size,
    returned = page.data.len(),
    total = page.total,
    "records listed"
  );
  Ok(Json(page))
}

// ─── Get ──────────────────────────────────────────────────────────────────────

/// `GET /data/{source}/{source_id}`
pub async fn get<S: EtlStore>(
  State(state): State<AppState<S>>,
  Path((source, source_id)): Path<(String, String)>,
) -> Result<Json<NormalizedRecord>, ApiError> {
  let source = parse_source(&source)?;
  state
    .store
    .get_record(source, source_id.clone())
    .await
    .map_err(ApiError::store)?
    .map(Json)
    .ok_or_else(|| ApiError::NotFound(format!("no {source} record {source_id:?}")))
}

// ─── Upsert ───────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct UpsertBody {
  pub source:      String,
  pub source_id:   String,
  #[serde(default)]
  pub name:        String,
  pub value:       Option<f64>,
  #[serde(default)]
  pub description: Option<String>,
}

/// `POST /data`: the canonical id is computed here, never taken from the
/// client.
pub async fn upsert<S: EtlStore>(
  State(state): State<AppState<S>>,
  Json(body): Json<UpsertBody>,
) -> Result<Json<NormalizedRecord>, ApiError> {
  let source = parse_source(&body.source)?;
  let source_id = body.source_id.trim().to_owned();
  if source_id.is_empty() {
    return Err(ApiError::BadRequest("source_id must not be empty".into()));
  }
  let description = body.description.unwrap_or_default();
  let now = Utc::now();

  let record = NormalizedRecord {
    id: None,
    source,
    source_id,
    canonical_id: canonicalize(&body.name, &description),
    name: body.name,
    numeric_value: body.value.filter(|v| v.is_finite()),
    description,
    created_at: now,
    updated_at: now,
  };
  let stored = state
    .store
    .upsert_normalized(record)
    .await
    .map_err(ApiError::store)?;
  info!(%source, source_id = %stored.source_id, "record upserted via api");
  Ok(Json(stored))
}
