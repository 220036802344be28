//! JSON REST API for Sluice.
//!
//! Exposes an axum [`Router`] backed by any [`sluice_core::store::EtlStore`].
//! The API never runs the pipeline itself: `POST /etl/run` only queues a
//! request on a [`RunTrigger`] that the serving process drains.

pub mod error;
pub mod records;
pub mod runs;
pub mod trigger;

use std::sync::Arc;

use axum::{
  Router,
  routing::{get, post},
};
use sluice_core::store::EtlStore;
use tower_http::trace::TraceLayer;

pub use error::ApiError;
pub use trigger::{RunRequest, RunTrigger, run_channel};

// ─── Application state ────────────────────────────────────────────────────────

/// Shared state threaded through all handlers.
pub struct AppState<S> {
  pub store:   Arc<S>,
  pub trigger: RunTrigger,
}

impl<S> Clone for AppState<S> {
  fn clone(&self) -> Self {
    Self { store: Arc::clone(&self.store), trigger: self.trigger.clone() }
  }
}

impl<S> AppState<S> {
  pub fn new(store: Arc<S>, trigger: RunTrigger) -> Self { Self { store, trigger } }
}

// ─── Router ───────────────────────────────────────────────────────────────────

/// Build the API router for `state`.
pub fn api_router<S>(state: AppState<S>) -> Router<()>
where
  S: EtlStore + 'static,
{
  Router::new()
    .route("/", get(runs::index))
    .route("/health", get(runs::health::<S>))
    // Records
    .route("/data", get(records::list::<S>).post(records::upsert::<S>))
    .route("/data/{source}/{source_id}", get(records::get::<S>))
    // Runs
    .route("/stats", get(runs::stats::<S>))
    .route("/checkpoints", get(runs::checkpoints::<S>))
    .route("/etl/run", post(runs::trigger::<S>))
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}
