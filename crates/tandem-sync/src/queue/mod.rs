use async_trait::async_trait;

#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod redis_stream;

use crate::models::ChangeJob;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
  #[error("queue connection failed: {0}")]
  Connection(String),

  #[error("malformed job payload: {0}")]
  Decode(String),

  #[error("queue command failed: {0}")]
  Backend(String),
}

/// One dequeued message. The broker keeps it pending until it is
/// acknowledged; dropping a delivery without acking leads to redelivery
/// after the visibility timeout.
#[derive(Debug, Clone)]
pub struct Delivery {
  pub stream: String,
  pub delivery_id: String,
  pub job: ChangeJob,
}

/// FIFO-per-partition delivery channel with at-least-once semantics and
/// explicit acknowledgment. Implementations are concurrency-safe and
/// restartable after disconnect.
#[async_trait]
pub trait JobQueue: Send + Sync {
  /// Pull up to `max` jobs, blocking up to the configured block duration
  /// when none are available. An empty result is a normal poll timeout.
  async fn receive(&self, max: usize) -> Result<Vec<Delivery>, QueueError>;

  /// Acknowledge a processed delivery so the broker stops redelivering it.
  async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

  /// Liveness probe used at startup and by operator tooling.
  async fn ping(&self) -> Result<(), QueueError>;
}
