//! Background task that runs the pipeline on an interval and on demand.
//!
//! Runs never overlap: the task executes one run at a time and only then
//! looks at the next tick or queued request.

use std::{sync::Arc, time::Duration};

use sluice_api::RunRequest;
use sluice_core::store::EtlStore;
use sluice_pipeline::Pipeline;
use tokio::{
  sync::mpsc,
  time::{Instant, Interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument as _, error, info, info_span};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
  Startup,
  Interval,
  Manual,
}

impl Trigger {
  fn as_str(self) -> &'static str {
    match self {
      Self::Startup => "startup",
      Self::Interval => "interval",
      Self::Manual => "manual",
    }
  }
}

pub struct Scheduler<S> {
  pipeline:       Arc<Pipeline<S>>,
  interval:       Option<Duration>,
  run_on_startup: bool,
  requests:       mpsc::Receiver<RunRequest>,
  cancel:         CancellationToken,
}

impl<S: EtlStore + 'static> Scheduler<S> {
  pub fn new(
    pipeline: Arc<Pipeline<S>>,
    requests: mpsc::Receiver<RunRequest>,
    cancel: CancellationToken,
  ) -> Self {
    Self { pipeline, interval: None, run_on_startup: false, requests, cancel }
  }

  /// Run every `interval`; `None` leaves only manual triggers.
  pub fn with_interval(mut self, interval: Option<Duration>) -> Self {
    self.interval = interval;
    self
  }

  pub fn run_on_startup(mut self, yes: bool) -> Self {
    self.run_on_startup = yes;
    self
  }

  /// Drive runs until the token is cancelled. Returns the number of runs.
  pub async fn run(mut self) -> u64 {
    let mut ticker = self.interval.map(|period| {
      let mut t = tokio::time::interval_at(Instant::now() + period, period);
      t.set_missed_tick_behavior(MissedTickBehavior::Delay);
      t
    });
    let mut runs = 0;
    let mut manual_open = true;

    if self.run_on_startup && !self.cancel.is_cancelled() {
      self.run_once(Trigger::Startup, Uuid::new_v4()).await;
      runs += 1;
    }

    loop {
      let (trigger, run_id) = tokio::select! {
        _ = self.cancel.cancelled() => break,
        request = self.requests.recv(), if manual_open => match request {
          Some(request) => (Trigger::Manual, request.run_id),
          None => {
            manual_open = false;
            continue;
          }
        },
        _ = next_tick(&mut ticker) => (Trigger::Interval, Uuid::new_v4()),
      };
      self.run_once(trigger, run_id).await;
      runs += 1;
    }

    info!(runs, "scheduler stopped");
    runs
  }

  async fn run_once(&self, trigger: Trigger, run_id: Uuid) {
    let span = info_span!("etl_run", %run_id, trigger = trigger.as_str());
    match self.pipeline.run(&self.cancel).instrument(span).await {
      Ok(summary) => info!(
        %run_id,
        status = %summary.status(),
        processed = summary.run.records_processed,
        "scheduled run complete"
      ),
      Err(e) => error!(%run_id, error = %e, "run could not be recorded"),
    }
  }
}

async fn next_tick(ticker: &mut Option<Interval>) {
  match ticker {
    Some(t) => {
      t.tick().await;
    }
    None => std::future::pending().await,
  }
}

#[cfg(test)]
mod tests {
  use sluice_api::run_channel;
  use sluice_core::run::RunStatus;
  use sluice_pipeline::{IngestMode, adapter::FileAdapter};
  use sluice_store_sqlite::SqliteStore;

  use super::*;

  async fn pipeline() -> (Arc<SqliteStore>, Arc<Pipeline<SqliteStore>>, tempfile::TempDir) {
    let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
    let dir = tempfile::tempdir().unwrap();
    let pipeline = Pipeline::new(store.clone(), IngestMode::Incremental)
      .with_adapter(FileAdapter::new(dir.path().join("missing.csv")));
    (store, Arc::new(pipeline), dir)
  }

  #[tokio::test]
  async fn startup_and_manual_runs_then_shutdown() {
    let (store, pipeline, _dir) = pipeline().await;
    let (trigger, rx) = run_channel();
    let cancel = CancellationToken::new();

    let task = tokio::spawn(
      Scheduler::new(pipeline, rx, cancel.clone())
        .run_on_startup(true)
        .run(),
    );

    trigger.request().unwrap();
    // Wait until both runs are recorded.
    for _ in 0..200 {
      if store.run_stats().await.unwrap().run_count >= 2 {
        break;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cancel.cancel();

    assert_eq!(task.await.unwrap(), 2);
    let stats = store.run_stats().await.unwrap();
    assert_eq!(stats.run_count, 2);
    assert_eq!(store.last_run().await.unwrap().unwrap().status, RunStatus::Success);
  }

  #[tokio::test]
  async fn interval_triggers_runs() {
    let (store, pipeline, _dir) = pipeline().await;
    let (_trigger, rx) = run_channel();
    let cancel = CancellationToken::new();

    let task = tokio::spawn(
      Scheduler::new(pipeline, rx, cancel.clone())
        .with_interval(Some(Duration::from_millis(50)))
        .run(),
    );

    for _ in 0..500 {
      if store.run_stats().await.unwrap().run_count >= 2 {
        break;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cancel.cancel();

    assert!(task.await.unwrap() >= 2);
  }

  #[tokio::test]
  async fn cancelled_before_start_runs_nothing() {
    let (store, pipeline, _dir) = pipeline().await;
    let (_trigger, rx) = run_channel();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let runs = Scheduler::new(pipeline, rx, cancel).run_on_startup(true).run().await;
    assert_eq!(runs, 0);
    assert!(store.last_run().await.unwrap().is_none());
  }
}
