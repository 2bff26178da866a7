use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use super::{Delivery, JobQueue, QueueError};
use crate::models::ChangeJob;

/// In-memory queue for tests. Jobs pushed before the consumer starts are
/// delivered in order; receive() returns an empty batch once drained.
#[derive(Default)]
pub struct MemoryQueue {
  pending: Mutex<VecDeque<Delivery>>,
  acked: Mutex<Vec<String>>,
  next_id: AtomicU64,
}

impl MemoryQueue {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn push(&self, job: ChangeJob) -> String {
    let delivery_id = format!("{}-0", self.next_id.fetch_add(1, Ordering::SeqCst));
    self.pending.lock().unwrap().push_back(Delivery {
      stream: "memory".to_string(),
      delivery_id: delivery_id.clone(),
      job,
    });
    delivery_id
  }

  pub fn acked_ids(&self) -> Vec<String> {
    self.acked.lock().unwrap().clone()
  }

  pub fn pending_len(&self) -> usize {
    self.pending.lock().unwrap().len()
  }
}

#[async_trait]
impl JobQueue for MemoryQueue {
  async fn receive(&self, max: usize) -> Result<Vec<Delivery>, QueueError> {
    let drained: Vec<Delivery> = {
      let mut pending = self.pending.lock().unwrap();
      let take = max.min(pending.len());
      pending.drain(..take).collect()
    };

    // Emulate the broker's blocking read when nothing is queued.
    if drained.is_empty() {
      tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    Ok(drained)
  }

  async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
    self
      .acked
      .lock()
      .unwrap()
      .push(delivery.delivery_id.clone());
    Ok(())
  }

  async fn ping(&self) -> Result<(), QueueError> {
    Ok(())
  }
}
