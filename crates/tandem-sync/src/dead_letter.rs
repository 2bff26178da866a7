use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::{error, info, warn};

use crate::models::{ChangeJob, DeadLetterEntry};
use crate::pipeline::JobStage;

/// Terminal store for jobs that exhausted their retries. Recording is
/// best-effort: a small bounded retry, then a structured log line carrying
/// the full entry so nothing is lost even when the sink itself is down.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
  async fn record(&self, job: &ChangeJob, stage: JobStage, reason: &str);
}

/// Appends dead-lettered jobs to a Redis stream for offline inspection and
/// replay.
pub struct RedisDeadLetterSink {
  conn: ConnectionManager,
  stream: String,
}

const RECORD_ATTEMPTS: u32 = 3;

impl RedisDeadLetterSink {
  pub async fn connect(url: &str, stream: &str) -> Result<Self, redis::RedisError> {
    let client = redis::Client::open(url)?;
    let conn = ConnectionManager::new(client).await?;
    Ok(Self {
      conn,
      stream: stream.to_string(),
    })
  }
}

#[async_trait]
impl DeadLetterSink for RedisDeadLetterSink {
  async fn record(&self, job: &ChangeJob, stage: JobStage, reason: &str) {
    let entry = DeadLetterEntry {
      job: job.clone(),
      stage,
      reason: reason.to_string(),
      failed_at: Utc::now(),
    };

    let encoded = match serde_json::to_string(&entry) {
      Ok(encoded) => encoded,
      Err(e) => {
        error!(error = %e, "failed to serialize dead-letter entry");
        return;
      }
    };

    let mut conn = self.conn.clone();
    for attempt in 1..=RECORD_ATTEMPTS {
      let added: Result<String, redis::RedisError> = conn
        .xadd(
          self.stream.as_str(),
          "*",
          &[("value", encoded.as_str())],
        )
        .await;

      match added {
        Ok(_) => {
          info!(
            table = %job.source_table,
            row_id = job.row_id,
            stage = %stage,
            reason,
            "job dead-lettered"
          );
          return;
        }
        Err(e) if attempt < RECORD_ATTEMPTS => {
          warn!(error = %e, attempt, "dead-letter append failed, retrying");
          tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
        }
        Err(e) => {
          // Last resort: the log line is the record.
          error!(
            error = %e,
            entry = %encoded,
            "dead-letter sink unavailable; entry preserved in log only"
          );
        }
      }
    }
  }
}

/// In-memory sink for tests.
#[cfg(any(test, feature = "testing"))]
#[derive(Default)]
pub struct MemoryDeadLetterSink {
  entries: std::sync::Mutex<Vec<DeadLetterEntry>>,
}

#[cfg(any(test, feature = "testing"))]
impl MemoryDeadLetterSink {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn entries(&self) -> Vec<DeadLetterEntry> {
    self.entries.lock().unwrap().clone()
  }

  pub fn len(&self) -> usize {
    self.entries.lock().unwrap().len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.lock().unwrap().is_empty()
  }
}

#[cfg(any(test, feature = "testing"))]
#[async_trait]
impl DeadLetterSink for MemoryDeadLetterSink {
  async fn record(&self, job: &ChangeJob, stage: JobStage, reason: &str) {
    self.entries.lock().unwrap().push(DeadLetterEntry {
      job: job.clone(),
      stage,
      reason: reason.to_string(),
      failed_at: Utc::now(),
    });
  }
}
