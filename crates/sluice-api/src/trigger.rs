//! Manual run requests, handed from the HTTP layer to whoever runs the
//! pipeline.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::ApiError;

/// One queued request for a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunRequest {
  pub run_id:       Uuid,
  pub requested_at: DateTime<Utc>,
}

/// Sending half of the run queue. At most one request waits at a time.
#[derive(Debug, Clone)]
pub struct RunTrigger {
  tx: mpsc::Sender<RunRequest>,
}

/// Create a trigger and the receiver the scheduler drains.
pub fn run_channel() -> (RunTrigger, mpsc::Receiver<RunRequest>) {
  let (tx, rx) = mpsc::channel(1);
  (RunTrigger { tx }, rx)
}

impl RunTrigger {
  /// Queue a run without waiting. Fails with `Conflict` while another
  /// request is still waiting to be picked up.
  pub fn request(&self) -> Result<RunRequest, ApiError> {
    let request = RunRequest { run_id: Uuid::new_v4(), requested_at: Utc::now() };
    match self.tx.try_send(request) {
      Ok(()) => Ok(request),
      Err(mpsc::error::TrySendError::Full(_)) => {
        Err(ApiError::Conflict("an ETL run is already queued".into()))
      }
      Err(mpsc::error::TrySendError::Closed(_)) => {
        Err(ApiError::Unavailable("the ETL scheduler is not running".into()))
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn second_request_conflicts_until_drained() {
    let (trigger, mut rx) = run_channel();

    let first = trigger.request().unwrap();
    assert!(matches!(trigger.request(), Err(ApiError::Conflict(_))));

    assert_eq!(rx.try_recv().unwrap(), first);
    assert!(trigger.request().is_ok());
  }

  #[test]
  fn closed_queue_is_unavailable() {
    let (trigger, rx) = run_channel();
    drop(rx);
    assert!(matches!(trigger.request(), Err(ApiError::Unavailable(_))));
  }
}
