//! HTTP JSON source.

use std::time::Duration;

use chrono::Utc;
use futures::{FutureExt as _, future::BoxFuture};
use serde_json::Value;
use sluice_core::{Error as CoreError, checkpoint::Checkpoint, record::RawPayload, source::Source};
use tracing::{debug, info};

use super::{FetchedBatch, Origin, SourceAdapter};
use crate::Result;

/// Fetches a JSON document from one endpoint with a bounded timeout.
#[derive(Debug, Clone)]
pub struct ApiAdapter {
  client: reqwest::Client,
  url:    String,
  token:  Option<String>,
}

impl ApiAdapter {
  pub fn new(url: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    Ok(Self { client, url: url.into(), token })
  }

  pub fn url(&self) -> &str { &self.url }

  async fn fetch_records(
    &self,
    since: Option<&Checkpoint>,
  ) -> sluice_core::Result<FetchedBatch> {
    info!(url = %self.url, "fetching api source");

    let mut req = self.client.get(&self.url);
    if let Some(token) = &self.token {
      req = req.bearer_auth(token);
    }

    let resp = req.send().await.map_err(fetch_error)?;
    let status = resp.status();
    if !status.is_success() {
      return Err(CoreError::SourceUnavailable(Source::Api, format!("HTTP {status}")));
    }
    let doc: Value = resp.json().await.map_err(fetch_error)?;

    let batch = parse_document(doc, since)?;
    debug!(
      records = batch.records.len(),
      rejects = batch.rejects.len(),
      behind_checkpoint = batch.behind_checkpoint,
      "api source parsed"
    );
    Ok(batch)
  }
}

impl SourceAdapter for ApiAdapter {
  fn source(&self) -> Source { Source::Api }

  fn fetch<'a>(
    &'a self,
    since: Option<&'a Checkpoint>,
  ) -> BoxFuture<'a, sluice_core::Result<FetchedBatch>> {
    self.fetch_records(since).boxed()
  }
}

/// Map a transport error. A body that arrived but is not JSON is a format
/// error, not an outage.
fn fetch_error(e: reqwest::Error) -> CoreError {
  if e.is_decode() {
    let detail = std::error::Error::source(&e).map_or_else(|| e.to_string(), ToString::to_string);
    return CoreError::SourceFormat(Source::Api, None, format!("invalid JSON: {detail}"));
  }
  let reason = if e.is_timeout() { format!("request timed out: {e}") } else { e.to_string() };
  CoreError::SourceUnavailable(Source::Api, reason)
}

/// Split a response document into records.
///
/// Accepts a bare array, an object with a `data` array, or a single object.
fn parse_document(doc: Value, since: Option<&Checkpoint>) -> sluice_core::Result<FetchedBatch> {
  let items = match doc {
    Value::Array(items) => items,
    Value::Object(mut obj) => match obj.remove("data") {
      Some(Value::Array(items)) => items,
      Some(other) => {
        obj.insert("data".to_owned(), other);
        vec![Value::Object(obj)]
      }
      None => vec![Value::Object(obj)],
    },
    other => {
      return Err(CoreError::SourceFormat(
        Source::Api,
        None,
        format!("expected a JSON array or object, got {other}"),
      ));
    }
  };

  let now = Utc::now();
  let mut batch = FetchedBatch::new(Origin::Upstream);
  for (position, item) in items.into_iter().enumerate() {
    match item {
      Value::Object(obj) => batch.push(RawPayload::Api(obj), since, now, position),
      _ => batch.rejects.push(CoreError::SourceFormat(
        Source::Api,
        Some(format!("#{position}")),
        "array element is not an object".into(),
      )),
    }
  }
  Ok(batch)
}

#[cfg(test)]
mod tests {
  use serde_json::json;
  use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{header, method, path},
  };

  use super::*;

  fn checkpoint(last: &str) -> Checkpoint {
    Checkpoint {
      source:            Source::Api,
      last_processed_id: last.into(),
      last_processed_at: Utc::now(),
      total_processed:   0,
      updated_at:        Utc::now(),
    }
  }

  fn adapter(server: &MockServer, token: Option<&str>) -> ApiAdapter {
    ApiAdapter::new(
      format!("{}/posts", server.uri()),
      token.map(str::to_owned),
      Duration::from_secs(5),
    )
    .unwrap()
  }

  #[tokio::test]
  async fn fetches_a_json_array() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/posts"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!([
        {"id": 1, "title": "Test Post", "body": "Test body", "userId": 1},
        {"id": 2, "title": "Second", "body": "More"},
      ])))
      .mount(&server)
      .await;

    let batch = adapter(&server, None).fetch(None).await.unwrap();
    assert_eq!(batch.origin, Origin::Upstream);
    assert_eq!(batch.records.len(), 2);
    assert_eq!(batch.records[0].source_id, "1");
    assert!(batch.rejects.is_empty());
  }

  #[tokio::test]
  async fn sends_bearer_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/posts"))
      .and(header("authorization", "Bearer s3cret"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 1}])))
      .expect(1)
      .mount(&server)
      .await;

    let batch = adapter(&server, Some("s3cret")).fetch(None).await.unwrap();
    assert_eq!(batch.records.len(), 1);
  }

  #[tokio::test]
  async fn non_2xx_is_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .respond_with(ResponseTemplate::new(503))
      .mount(&server)
      .await;

    let err = adapter(&server, None).fetch(None).await.unwrap_err();
    assert!(matches!(err, CoreError::SourceUnavailable(Source::Api, _)), "{err}");
  }

  #[tokio::test]
  async fn slow_upstream_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .respond_with(
        ResponseTemplate::new(200)
          .set_body_json(json!([]))
          .set_delay(Duration::from_secs(2)),
      )
      .mount(&server)
      .await;

    let adapter =
      ApiAdapter::new(server.uri(), None, Duration::from_millis(200)).unwrap();
    let err = adapter.fetch(None).await.unwrap_err();
    assert!(matches!(err, CoreError::SourceUnavailable(Source::Api, _)), "{err}");
  }

  #[tokio::test]
  async fn invalid_json_is_a_source_format_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
      .mount(&server)
      .await;

    let err = adapter(&server, None).fetch(None).await.unwrap_err();
    assert!(matches!(err, CoreError::SourceFormat(Source::Api, None, _)), "{err}");
    assert!(!err.is_record_level());
  }

  #[test]
  fn envelope_and_single_object_are_accepted() {
    let batch = parse_document(json!({"data": [{"id": 1}, {"id": 2}]}), None).unwrap();
    assert_eq!(batch.records.len(), 2);

    let batch = parse_document(json!({"id": 9, "name": "solo"}), None).unwrap();
    assert_eq!(batch.records.len(), 1);
    assert_eq!(batch.records[0].source_id, "9");

    assert!(parse_document(json!("nope"), None).is_err());
  }

  #[test]
  fn bad_elements_are_rejected_individually() {
    let batch = parse_document(json!([{"id": 1}, 42, {"name": "no id"}]), None).unwrap();
    assert_eq!(batch.records.len(), 1);
    assert_eq!(batch.rejects.len(), 2);
    assert!(batch.rejects.iter().all(CoreError::is_record_level));
  }

  #[test]
  fn checkpoint_filters_processed_ids() {
    let cp = checkpoint("2");
    let batch =
      parse_document(json!([{"id": 1}, {"id": 2}, {"id": 3}, {"id": 10}]), Some(&cp)).unwrap();
    let ids: Vec<_> = batch.records.iter().map(|r| r.source_id.as_str()).collect();
    assert_eq!(ids, ["3", "10"]);
    assert_eq!(batch.behind_checkpoint, 2);
  }
}
