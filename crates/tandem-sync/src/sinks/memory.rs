use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{IndexError, VectorSink};
use crate::config::CollectionSchema;
use crate::models::EmbeddedDocument;

/// Operations observed by the in-memory sink, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkOp {
  Upsert { collection: String, id: String },
  Delete { collection: String, id: String },
}

/// In-memory vector sink for tests. Stores the latest document per
/// (collection, id), records the operation order, and can be scripted to
/// fail or to hold each write for a fixed delay.
#[derive(Default)]
pub struct MemorySink {
  state: Mutex<BTreeMap<(String, String), EmbeddedDocument>>,
  ops: Mutex<Vec<SinkOp>>,
  scripted_failures: Mutex<VecDeque<IndexError>>,
  write_delay: Option<Duration>,
}

impl MemorySink {
  pub fn new() -> Self {
    Self::default()
  }

  /// Sink that holds every write for `delay`, to widen race windows in
  /// ordering tests.
  pub fn with_write_delay(delay: Duration) -> Self {
    Self {
      write_delay: Some(delay),
      ..Self::default()
    }
  }

  /// Queue an error for the next write call(s), in order.
  pub fn fail_next(&self, error: IndexError) {
    self.scripted_failures.lock().unwrap().push_back(error);
  }

  pub fn get(&self, collection: &str, id: &str) -> Option<EmbeddedDocument> {
    self
      .state
      .lock()
      .unwrap()
      .get(&(collection.to_string(), id.to_string()))
      .cloned()
  }

  pub fn len(&self) -> usize {
    self.state.lock().unwrap().len()
  }

  pub fn is_empty(&self) -> bool {
    self.state.lock().unwrap().is_empty()
  }

  pub fn ops(&self) -> Vec<SinkOp> {
    self.ops.lock().unwrap().clone()
  }

  pub fn write_count(&self) -> usize {
    self.ops.lock().unwrap().len()
  }

  async fn maybe_delay(&self) {
    if let Some(delay) = self.write_delay {
      tokio::time::sleep(delay).await;
    }
  }

  fn take_scripted_failure(&self) -> Option<IndexError> {
    self.scripted_failures.lock().unwrap().pop_front()
  }
}

#[async_trait]
impl VectorSink for MemorySink {
  async fn upsert(&self, document: &EmbeddedDocument) -> Result<(), IndexError> {
    self.maybe_delay().await;

    self.ops.lock().unwrap().push(SinkOp::Upsert {
      collection: document.document.collection.clone(),
      id: document.document.id.clone(),
    });

    if let Some(error) = self.take_scripted_failure() {
      return Err(error);
    }

    self.state.lock().unwrap().insert(
      (
        document.document.collection.clone(),
        document.document.id.clone(),
      ),
      document.clone(),
    );
    Ok(())
  }

  async fn delete(&self, collection: &str, id: &str) -> Result<(), IndexError> {
    self.maybe_delay().await;

    self.ops.lock().unwrap().push(SinkOp::Delete {
      collection: collection.to_string(),
      id: id.to_string(),
    });

    if let Some(error) = self.take_scripted_failure() {
      return Err(error);
    }

    // Absent ids are a successful no-op.
    self
      .state
      .lock()
      .unwrap()
      .remove(&(collection.to_string(), id.to_string()));
    Ok(())
  }

  async fn ensure_collections(
    &self,
    _schemas: &BTreeMap<String, CollectionSchema>,
  ) -> Result<(), IndexError> {
    Ok(())
  }

  async fn health(&self) -> Result<(), IndexError> {
    Ok(())
  }
}
