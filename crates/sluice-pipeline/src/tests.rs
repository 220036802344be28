//! End-to-end runs of the pipeline against an in-memory SQLite store, a
//! mocked HTTP upstream and temporary CSV files.

use std::{io::Write as _, sync::Arc, time::Duration};

use chrono::Utc;
use futures::{FutureExt as _, future::BoxFuture};
use serde_json::json;
use sluice_core::{
  checkpoint::{BatchReceipt, Checkpoint, StagedBatch},
  identity::IdentityIndex,
  normalize::normalize,
  record::{NormalizedRecord, RawPayload, RawRecord},
  run::{NewRunRecord, RunRecord, RunStats, RunStatus},
  source::Source,
  store::{EtlStore, Page, RecordQuery, SourceCount},
};
use sluice_store_sqlite::SqliteStore;
use tokio_util::sync::CancellationToken;
use wiremock::{
  Mock, MockServer, ResponseTemplate,
  matchers::{method, path},
};

use crate::{
  IngestMode, Pipeline, SourceOutcome,
  adapter::{ApiAdapter, FetchedBatch, FileAdapter, SourceAdapter},
};

// ─── Fixtures ────────────────────────────────────────────────────────────────

async fn store() -> Arc<SqliteStore> {
  Arc::new(SqliteStore::open_in_memory().await.expect("in-memory store"))
}

async fn api_server(body: serde_json::Value) -> MockServer {
  let server = MockServer::start().await;
  mount(&server, body).await;
  server
}

async fn mount(server: &MockServer, body: serde_json::Value) {
  Mock::given(method("GET"))
    .and(path("/posts"))
    .respond_with(ResponseTemplate::new(200).set_body_json(body))
    .mount(server)
    .await;
}

fn api(server: &MockServer) -> ApiAdapter {
  ApiAdapter::new(format!("{}/posts", server.uri()), None, Duration::from_secs(5)).unwrap()
}

fn csv_file(contents: &str) -> tempfile::NamedTempFile {
  let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
  file.write_all(contents.as_bytes()).unwrap();
  file
}

async fn all_records<S: EtlStore>(store: &S) -> Vec<NormalizedRecord> {
  let query = RecordQuery { page_size: 100, ..Default::default() };
  store.query_page(&query).await.unwrap().data
}

// ─── Happy paths ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn end_to_end_unifies_identity_across_sources() {
  let server =
    api_server(json!([{"id": 1, "name": "A", "value": "10", "description": "d1"}])).await;
  let file = csv_file("id,name,value,description\n1,A,bad,d1\n");
  let store = store().await;

  let pipeline = Pipeline::new(store.clone(), IngestMode::Incremental)
    .with_adapter(api(&server))
    .with_adapter(FileAdapter::new(file.path()));
  let summary = pipeline.run(&CancellationToken::new()).await.unwrap();

  assert_eq!(summary.status(), RunStatus::Success);
  assert_eq!(summary.run.records_processed, 2);
  assert_eq!(summary.run.records_skipped, 0);
  assert!(summary.run.error_message.is_none());

  let records = all_records(store.as_ref()).await;
  assert_eq!(records.len(), 2);
  let from_api = store.get_record(Source::Api, "1".into()).await.unwrap().unwrap();
  let from_file = store.get_record(Source::File, "1".into()).await.unwrap().unwrap();
  assert_eq!(from_api.canonical_id, from_file.canonical_id);
  assert_eq!(from_api.numeric_value, Some(10.0));
  assert_eq!(from_file.numeric_value, None);

  assert_eq!(summary.duplicates.len(), 1);
  assert_eq!(summary.duplicates[0].canonical_id, from_api.canonical_id);

  let last = store.last_run().await.unwrap().unwrap();
  assert_eq!(last.status, RunStatus::Success);
  assert_eq!(last.records_processed, 2);
}

#[tokio::test]
async fn missing_file_ingests_fallback_dataset() {
  let dir = tempfile::tempdir().unwrap();
  let store = store().await;

  let pipeline = Pipeline::new(store.clone(), IngestMode::Incremental)
    .with_adapter(FileAdapter::new(dir.path().join("missing.csv")));
  let summary = pipeline.run(&CancellationToken::new()).await.unwrap();

  assert_eq!(summary.status(), RunStatus::Success);
  assert!(summary.sources[0].fallback);
  assert_eq!(summary.run.records_processed, 4);

  let records = all_records(store.as_ref()).await;
  assert_eq!(records.len(), 4);
  assert_eq!(records.iter().filter(|r| r.numeric_value.is_none()).count(), 2);
}

#[tokio::test]
async fn unusable_records_are_skipped_not_fatal() {
  let server = api_server(json!([
    {"id": 1, "name": {"first": "nested"}},
    {"id": 2, "name": "fine", "value": "not-a-number"},
    {"title": "no id"},
  ]))
  .await;
  let store = store().await;

  let pipeline = Pipeline::new(store.clone(), IngestMode::Incremental).with_adapter(api(&server));
  let summary = pipeline.run(&CancellationToken::new()).await.unwrap();

  assert_eq!(summary.status(), RunStatus::Success);
  assert_eq!(summary.run.records_processed, 1);
  assert_eq!(summary.run.records_skipped, 2);

  let kept = store.get_record(Source::Api, "2".into()).await.unwrap().unwrap();
  assert_eq!(kept.numeric_value, None);
  // The raw payload of the rejected record is still kept for audit.
  assert_eq!(store.raw_count(Source::Api).await.unwrap(), 2);
  // The cursor moves past it, so it is not retried forever.
  let cp = store.get_checkpoint(Source::Api).await.unwrap().unwrap();
  assert_eq!(cp.last_processed_id, "2");
}

// ─── Checkpoints ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn incremental_run_resumes_after_checkpoint() {
  let server = api_server(json!([{"id": 1, "name": "a"}, {"id": 2, "name": "b"}])).await;
  let store = store().await;
  let pipeline = Pipeline::new(store.clone(), IngestMode::Incremental).with_adapter(api(&server));
  let cancel = CancellationToken::new();

  let first = pipeline.run(&cancel).await.unwrap();
  assert_eq!(first.run.records_processed, 2);

  let second = pipeline.run(&cancel).await.unwrap();
  assert_eq!(second.status(), RunStatus::Success);
  assert_eq!(second.run.records_processed, 0);
  let cp = store.get_checkpoint(Source::Api).await.unwrap().unwrap();
  assert_eq!((cp.last_processed_id.as_str(), cp.total_processed), ("2", 2));

  server.reset().await;
  mount(&server, json!([{"id": 2, "name": "b"}, {"id": 10, "name": "c"}])).await;
  let third = pipeline.run(&cancel).await.unwrap();
  assert_eq!(third.run.records_processed, 1);

  let cp = store.get_checkpoint(Source::Api).await.unwrap().unwrap();
  assert_eq!((cp.last_processed_id.as_str(), cp.total_processed), ("10", 3));
  assert_eq!(all_records(store.as_ref()).await.len(), 3);
}

#[tokio::test]
async fn full_mode_reingests_without_duplicating() {
  let server = api_server(json!([{"id": 1, "name": "a"}, {"id": 2, "name": "b"}])).await;
  let store = store().await;
  let pipeline = Pipeline::new(store.clone(), IngestMode::Full).with_adapter(api(&server));
  let cancel = CancellationToken::new();

  pipeline.run(&cancel).await.unwrap();
  let again = pipeline.run(&cancel).await.unwrap();

  assert_eq!(again.run.records_processed, 2);
  assert_eq!(all_records(store.as_ref()).await.len(), 2);
  let cp = store.get_checkpoint(Source::Api).await.unwrap().unwrap();
  assert_eq!(cp.total_processed, 4);
}

#[tokio::test]
async fn identity_index_accumulates_across_runs() {
  let server = api_server(json!([{"id": 1, "name": "John", "description": "Accountant"}])).await;
  let file = csv_file("ID,NAME,VALUE,DESCRIPTION\n7,  john ,1,ACCOUNTANT\n");
  let store = store().await;
  let mut index = IdentityIndex::new();
  let cancel = CancellationToken::new();

  Pipeline::new(store.clone(), IngestMode::Incremental)
    .with_adapter(api(&server))
    .run_with_index(&mut index, &cancel)
    .await
    .unwrap();
  let summary = Pipeline::new(store.clone(), IngestMode::Incremental)
    .with_adapter(FileAdapter::new(file.path()))
    .run_with_index(&mut index, &cancel)
    .await
    .unwrap();

  assert_eq!(summary.duplicates.len(), 1);
  assert!(summary.duplicates[0].is_cross_source());
  assert_eq!(store.identity_index().await.unwrap(), index);
}

// ─── Failure isolation ───────────────────────────────────────────────────────

#[tokio::test]
async fn unavailable_file_makes_run_partial() {
  let server = api_server(json!([{"id": 1, "name": "a", "value": 5}])).await;
  let dir = tempfile::tempdir().unwrap();
  let store = store().await;

  let pipeline = Pipeline::new(store.clone(), IngestMode::Incremental)
    .with_adapter(api(&server))
    .with_adapter(FileAdapter::new(dir.path()));
  let summary = pipeline.run(&CancellationToken::new()).await.unwrap();

  assert_eq!(summary.status(), RunStatus::Partial);
  assert_eq!(summary.sources[0].outcome, SourceOutcome::Succeeded);
  assert!(matches!(summary.sources[1].outcome, SourceOutcome::Failed(_)));
  assert!(summary.run.error_message.as_deref().unwrap().contains("file source unavailable"));

  assert!(store.get_record(Source::Api, "1".into()).await.unwrap().is_some());
  assert!(store.get_checkpoint(Source::File).await.unwrap().is_none());

  let stats = store.run_stats().await.unwrap();
  assert!(stats.last_failure.is_some());
  assert_eq!(stats.total_records_processed, 1);
}

#[tokio::test]
async fn every_source_down_fails_the_run() {
  let server = MockServer::start().await;
  Mock::given(method("GET"))
    .respond_with(ResponseTemplate::new(500))
    .mount(&server)
    .await;
  let dir = tempfile::tempdir().unwrap();
  let store = store().await;

  let pipeline = Pipeline::new(store.clone(), IngestMode::Incremental)
    .with_adapter(api(&server))
    .with_adapter(FileAdapter::new(dir.path()));
  let summary = pipeline.run(&CancellationToken::new()).await.unwrap();

  assert_eq!(summary.status(), RunStatus::Failed);
  let message = summary.run.error_message.unwrap();
  assert!(message.contains("api source unavailable"), "{message}");
  assert!(message.contains("file source unavailable"), "{message}");
  assert!(store.list_checkpoints().await.unwrap().is_empty());
}

#[tokio::test]
async fn persistence_failure_stops_run_and_keeps_checkpoint() {
  let server = api_server(json!([{"id": 1, "name": "a"}])).await;
  let file = csv_file("id,name,value,description\n1,b,2,d\n2,c,3,e\n");
  let store = Arc::new(FlakyStore::new(Source::File).await);

  let seed = RawRecord {
    source_id:   "1".into(),
    payload:     RawPayload::File([("id".to_owned(), "1".to_owned())].into()),
    ingested_at: Utc::now(),
  };
  let staged = StagedBatch {
    source:     Source::File,
    normalized: vec![normalize(Source::File, &seed).unwrap()],
    raw:        vec![seed],
  };
  let receipt = store.inner.commit_batch(staged).await.unwrap().unwrap();
  let seeded = store.inner.advance_checkpoint(receipt).await.unwrap();

  let pipeline = Pipeline::new(store.clone(), IngestMode::Incremental)
    .with_adapter(api(&server))
    .with_adapter(FileAdapter::new(file.path()));
  let summary = pipeline.run(&CancellationToken::new()).await.unwrap();

  assert_eq!(summary.status(), RunStatus::Partial);
  assert!(matches!(summary.sources[1].outcome, SourceOutcome::Failed(_)));
  assert!(summary.run.error_message.as_deref().unwrap().contains("disk full"));
  assert!(store.inner.get_checkpoint(Source::Api).await.unwrap().is_some());

  let after = store.inner.get_checkpoint(Source::File).await.unwrap();
  assert_eq!(after, Some(seeded), "failed commit leaves the checkpoint alone");
  assert_eq!(store.inner.raw_count(Source::File).await.unwrap(), 1);
  assert!(store.inner.get_record(Source::File, "2".into()).await.unwrap().is_none());
}

#[tokio::test]
async fn persistence_failure_on_first_source_fails_run() {
  let server = api_server(json!([{"id": 1, "name": "a"}])).await;
  let file = csv_file("id,name,value,description\n1,b,2,d\n");
  let store = Arc::new(FlakyStore::new(Source::Api).await);

  let pipeline = Pipeline::new(store.clone(), IngestMode::Incremental)
    .with_adapter(api(&server))
    .with_adapter(FileAdapter::new(file.path()));
  let summary = pipeline.run(&CancellationToken::new()).await.unwrap();

  assert_eq!(summary.status(), RunStatus::Failed);
  assert_eq!(summary.sources[1].outcome, SourceOutcome::NotRun);
  assert!(store.inner.list_checkpoints().await.unwrap().is_empty());
  assert!(all_records(&store.inner).await.is_empty());
}

#[tokio::test]
async fn panic_inside_a_stage_still_records_a_failed_run() {
  let store = store().await;
  let pipeline = Pipeline::new(store.clone(), IngestMode::Incremental).with_adapter(Exploding);

  let summary = pipeline.run(&CancellationToken::new()).await.unwrap();

  assert_eq!(summary.status(), RunStatus::Failed);
  let message = summary.run.error_message.unwrap();
  assert!(message.contains("adapter exploded"), "{message}");
  assert_eq!(store.last_run().await.unwrap().unwrap().status, RunStatus::Failed);
}

#[tokio::test]
async fn cancelled_run_is_recorded_as_failed() {
  let server = api_server(json!([{"id": 1}])).await;
  let store = store().await;
  let pipeline = Pipeline::new(store.clone(), IngestMode::Incremental).with_adapter(api(&server));

  let cancel = CancellationToken::new();
  cancel.cancel();
  let summary = pipeline.run(&cancel).await.unwrap();

  assert_eq!(summary.status(), RunStatus::Failed);
  assert_eq!(summary.run.error_message.as_deref(), Some("run cancelled"));
  assert_eq!(summary.sources[0].outcome, SourceOutcome::NotRun);
  assert!(all_records(store.as_ref()).await.is_empty());
}

// ─── Test doubles ────────────────────────────────────────────────────────────

/// An adapter whose fetch panics.
struct Exploding;

fn explode() -> sluice_core::Result<FetchedBatch> { panic!("adapter exploded") }

impl SourceAdapter for Exploding {
  fn source(&self) -> Source { Source::File }

  fn fetch<'a>(
    &'a self,
    _since: Option<&'a Checkpoint>,
  ) -> BoxFuture<'a, sluice_core::Result<FetchedBatch>> {
    async { explode() }.boxed()
  }
}

/// Delegates to a real store but fails every batch commit for one source.
struct FlakyStore {
  inner:     SqliteStore,
  fail_from: Source,
}

impl FlakyStore {
  async fn new(fail_from: Source) -> Self {
    Self { inner: SqliteStore::open_in_memory().await.unwrap(), fail_from }
  }
}

type StoreResult<T> = Result<T, sluice_store_sqlite::Error>;

impl EtlStore for FlakyStore {
  type Error = sluice_store_sqlite::Error;

  async fn store_raw(&self, raw: RawRecord) -> StoreResult<()> { self.inner.store_raw(raw).await }

  async fn upsert_normalized(&self, record: NormalizedRecord) -> StoreResult<NormalizedRecord> {
    self.inner.upsert_normalized(record).await
  }

  async fn commit_batch(&self, batch: StagedBatch) -> StoreResult<Option<BatchReceipt>> {
    if batch.source == self.fail_from {
      return Err(sluice_store_sqlite::Error::Corrupt {
        column: "normalized_data",
        detail: "disk full".into(),
      });
    }
    self.inner.commit_batch(batch).await
  }

  async fn get_checkpoint(&self, source: Source) -> StoreResult<Option<Checkpoint>> {
    self.inner.get_checkpoint(source).await
  }

  async fn advance_checkpoint(&self, receipt: BatchReceipt) -> StoreResult<Checkpoint> {
    self.inner.advance_checkpoint(receipt).await
  }

  async fn list_checkpoints(&self) -> StoreResult<Vec<Checkpoint>> {
    self.inner.list_checkpoints().await
  }

  async fn record_run(&self, run: NewRunRecord) -> StoreResult<RunRecord> {
    self.inner.record_run(run).await
  }

  async fn last_run(&self) -> StoreResult<Option<RunRecord>> { self.inner.last_run().await }

  async fn run_stats(&self) -> StoreResult<RunStats> { self.inner.run_stats().await }

  async fn query_page(&self, query: &RecordQuery) -> StoreResult<Page<NormalizedRecord>> {
    self.inner.query_page(query).await
  }

  async fn get_record(
    &self,
    source: Source,
    source_id: String,
  ) -> StoreResult<Option<NormalizedRecord>> {
    self.inner.get_record(source, source_id).await
  }

  async fn source_counts(&self) -> StoreResult<Vec<SourceCount>> {
    self.inner.source_counts().await
  }

  async fn identity_index(&self) -> StoreResult<IdentityIndex> {
    self.inner.identity_index().await
  }

  async fn ping(&self) -> StoreResult<()> { self.inner.ping().await }

  async fn reset(&self) -> StoreResult<()> { self.inner.reset().await }
}
