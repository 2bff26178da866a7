use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::config::{CollectionSchema, Config};
use crate::embeddings::{Embedder, EmbeddingError, EmbeddingRequest};
use crate::mapper::{DocumentMapper, MapError};
use crate::models::{ChangeJob, EmbeddedDocument, Operation};
use crate::retry::RetryPolicy;
use crate::sinks::{IndexError, VectorSink};

/// Lifecycle stages of a job. Upserts move Received → Mapped → Embedded →
/// Written → Acknowledged; deletes skip Embedded. DeadLettered is terminal
/// and reachable from any stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStage {
  Received,
  Mapped,
  Embedded,
  Written,
  Acknowledged,
  DeadLettered,
}

impl std::fmt::Display for JobStage {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      JobStage::Received => "received",
      JobStage::Mapped => "mapped",
      JobStage::Embedded => "embedded",
      JobStage::Written => "written",
      JobStage::Acknowledged => "acknowledged",
      JobStage::DeadLettered => "dead-lettered",
    };
    write!(f, "{}", name)
  }
}

/// Failure taxonomy for a single job, spanning all stages.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
  #[error("schema mismatch: {0}")]
  SchemaMismatch(#[from] MapError),

  #[error(transparent)]
  Embedding(#[from] EmbeddingError),

  #[error(transparent)]
  Index(#[from] IndexError),

  #[error("stage deadline of {0:?} exceeded")]
  DeadlineExceeded(Duration),
}

impl SyncError {
  pub fn is_retryable(&self) -> bool {
    match self {
      SyncError::SchemaMismatch(_) => false,
      SyncError::Embedding(e) => e.is_retryable(),
      SyncError::Index(e) => e.is_retryable(),
      SyncError::DeadlineExceeded(_) => true,
    }
  }
}

/// A job that could not be completed: the stage it died in and why.
#[derive(Debug)]
pub struct StageFailure {
  pub stage: JobStage,
  pub error: SyncError,
}

/// Runs one job end-to-end: map, embed (upserts only), write. Retryable
/// stage failures re-enter the same stage after a jittered backoff until the
/// per-stage budget runs out; everything else is returned to the caller for
/// dead-lettering. Holds only shared read-only clients, so one instance
/// serves all workers.
pub struct UpsertPipeline {
  mapper: DocumentMapper,
  embedder: Arc<dyn Embedder>,
  sink: Arc<dyn VectorSink>,
  collections: BTreeMap<String, CollectionSchema>,
  retry: RetryPolicy,
  stage_deadline: Duration,
}

impl UpsertPipeline {
  pub fn new(config: &Config, embedder: Arc<dyn Embedder>, sink: Arc<dyn VectorSink>) -> Self {
    Self {
      mapper: DocumentMapper::new(config),
      embedder,
      sink,
      collections: config.collections.clone(),
      retry: RetryPolicy::from_config(&config.workers.retry),
      stage_deadline: config.workers.job_deadline.inner(),
    }
  }

  /// Process a single job. `Ok(())` means the index write succeeded and the
  /// delivery can be acknowledged; `Err` means the job belongs in the
  /// dead-letter sink (and must then also be acknowledged).
  pub async fn process(&self, job: &ChangeJob) -> Result<(), StageFailure> {
    // Mapping is deterministic; a failure here can never succeed on retry.
    let document = self.mapper.map(job).map_err(|e| StageFailure {
      stage: JobStage::Mapped,
      error: SyncError::from(e),
    })?;

    debug!(
      table = %job.source_table,
      row_id = job.row_id,
      collection = %document.collection,
      operation = %job.operation,
      "mapped change job"
    );

    if job.operation == Operation::Delete {
      let collection = document.collection.as_str();
      let id = document.id.as_str();
      return self
        .run_stage(JobStage::Written, job, || async move {
          self.sink.delete(collection, id).await.map_err(SyncError::from)
        })
        .await;
    }

    // Validated at startup; a miss here is a config bug, not bad data.
    let schema = self.collections.get(&document.collection).ok_or_else(|| {
      StageFailure {
        stage: JobStage::Mapped,
        error: SyncError::Index(IndexError::Permanent(format!(
          "no schema for collection {}",
          document.collection
        ))),
      }
    })?;

    let fields = {
      let primary = document.primary_text();
      // A declared sparse field with no mapped text still gets an empty
      // vector, so the field set always matches the schema.
      let sparse_texts: Vec<(&str, &str)> = schema
        .sparse_fields
        .iter()
        .map(|field| (field.as_str(), document.text_field(field).unwrap_or("")))
        .collect();

      self
        .run_stage(JobStage::Embedded, job, || {
          let request = EmbeddingRequest {
            primary: &primary,
            sparse_fields: sparse_texts.clone(),
          };
          async move { self.embedder.embed(request).await.map_err(SyncError::from) }
        })
        .await?
    };

    let embedded = EmbeddedDocument {
      document,
      dense_vector: fields.dense,
      sparse_vectors: fields.sparse,
    };

    // Reject vectors that do not match the declared schema before any index
    // call is attempted.
    if let Err(reason) = embedded.validate_against(schema) {
      return Err(StageFailure {
        stage: JobStage::Embedded,
        error: SyncError::Index(IndexError::Permanent(reason)),
      });
    }

    let doc_ref = &embedded;
    self
      .run_stage(JobStage::Written, job, || async move {
        self.sink.upsert(doc_ref).await.map_err(SyncError::from)
      })
      .await
  }

  /// Run one stage under the per-stage deadline and retry budget. Retry
  /// state lives entirely on this stack frame.
  async fn run_stage<T, F, Fut>(
    &self,
    stage: JobStage,
    job: &ChangeJob,
    mut op: F,
  ) -> Result<T, StageFailure>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
  {
    let mut attempt = 0u32;
    loop {
      attempt += 1;

      let result = match timeout(self.stage_deadline, op()).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::DeadlineExceeded(self.stage_deadline)),
      };

      match result {
        Ok(value) => return Ok(value),
        Err(error) if error.is_retryable() && self.retry.allows_retry(attempt) => {
          let delay = self.retry.delay_for(attempt);
          warn!(
            table = %job.source_table,
            row_id = job.row_id,
            stage = %stage,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "stage failed, retrying"
          );
          sleep(delay).await;
        }
        Err(error) => return Err(StageFailure { stage, error }),
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::Config;
  use crate::duration::HumanDuration;
  use crate::embeddings::fake::StubEmbedder;
  use crate::sinks::memory::{MemorySink, SinkOp};
  use chrono::Utc;
  use serde_json::json;

  fn post_job(operation: Operation) -> ChangeJob {
    let payload = json!({
      "title": "Phòng trọ",
      "description": "Phòng mới xây, có gác",
      "address": "12 Nguyễn Trãi, P5, Q5, HCM",
      "price": 3_000_000,
      "city": "HCM",
    });
    let map = match payload {
      serde_json::Value::Object(m) => m.into_iter().collect(),
      _ => unreachable!(),
    };
    ChangeJob {
      source_table: "posts".to_string(),
      operation,
      row_id: 42,
      payload: map,
      enqueued_at: Utc::now(),
      delivery_attempt: 1,
    }
  }

  struct Fixture {
    pipeline: UpsertPipeline,
    embedder: Arc<StubEmbedder>,
    sink: Arc<MemorySink>,
  }

  fn fixture() -> Fixture {
    fixture_with(Config::test(), MemorySink::new(), 128)
  }

  fn fixture_with(config: Config, sink: MemorySink, dense_dim: usize) -> Fixture {
    let embedder = Arc::new(StubEmbedder::new(dense_dim));
    let sink = Arc::new(sink);
    let pipeline = UpsertPipeline::new(&config, embedder.clone(), sink.clone());
    Fixture {
      pipeline,
      embedder,
      sink,
    }
  }

  #[tokio::test]
  async fn test_end_to_end_upsert() {
    let f = fixture();
    f.pipeline.process(&post_job(Operation::Upsert)).await.unwrap();

    let stored = f.sink.get("posts_hybrid", "posts:42").unwrap();
    assert_eq!(stored.dense_vector.len(), 128);
    assert_eq!(stored.sparse_vectors.len(), 3);
    assert!(stored.sparse_vectors.contains_key("title"));
    assert!(stored.sparse_vectors.contains_key("description"));
    assert!(stored.sparse_vectors.contains_key("address"));
    assert_eq!(f.embedder.call_count(), 1);
  }

  #[tokio::test]
  async fn test_repeated_upsert_is_idempotent() {
    let f = fixture();
    let job = post_job(Operation::Upsert);

    f.pipeline.process(&job).await.unwrap();
    let after_one = f.sink.get("posts_hybrid", "posts:42").unwrap();

    for _ in 0..3 {
      f.pipeline.process(&job).await.unwrap();
    }
    let after_four = f.sink.get("posts_hybrid", "posts:42").unwrap();

    assert_eq!(f.sink.len(), 1);
    assert_eq!(after_one, after_four);
  }

  #[tokio::test]
  async fn test_delete_skips_embedding() {
    let f = fixture();
    f.pipeline.process(&post_job(Operation::Delete)).await.unwrap();

    assert_eq!(f.embedder.call_count(), 0);
    assert_eq!(
      f.sink.ops(),
      vec![SinkOp::Delete {
        collection: "posts_hybrid".to_string(),
        id: "posts:42".to_string(),
      }]
    );
  }

  #[tokio::test]
  async fn test_delete_of_absent_id_succeeds() {
    let f = fixture();
    let mut job = post_job(Operation::Delete);
    job.row_id = 404;

    f.pipeline.process(&job).await.unwrap();
    assert!(f.sink.is_empty());
  }

  #[tokio::test]
  async fn test_schema_mismatch_is_not_retried() {
    let f = fixture();
    let mut job = post_job(Operation::Upsert);
    job.payload.remove("title");

    let failure = f.pipeline.process(&job).await.unwrap_err();
    assert_eq!(failure.stage, JobStage::Mapped);
    assert!(!failure.error.is_retryable());
    assert_eq!(f.embedder.call_count(), 0);
    assert_eq!(f.sink.write_count(), 0);
  }

  #[tokio::test]
  async fn test_wrong_dense_dim_is_rejected_before_write() {
    let f = fixture_with(Config::test(), MemorySink::new(), 64);

    let failure = f
      .pipeline
      .process(&post_job(Operation::Upsert))
      .await
      .unwrap_err();

    assert_eq!(failure.stage, JobStage::Embedded);
    assert!(!failure.error.is_retryable());
    // The index was never called.
    assert_eq!(f.sink.write_count(), 0);
  }

  #[tokio::test]
  async fn test_transient_index_failure_is_retried() {
    let f = fixture();
    f.sink
      .fail_next(IndexError::Transient("rate limited".to_string()));

    f.pipeline.process(&post_job(Operation::Upsert)).await.unwrap();
    assert_eq!(f.sink.write_count(), 2);
    assert_eq!(f.sink.len(), 1);
  }

  #[tokio::test]
  async fn test_retry_budget_is_exhausted_after_configured_attempts() {
    let f = fixture();
    // Config::test allows 3 attempts per stage.
    for _ in 0..5 {
      f.sink
        .fail_next(IndexError::Transient("unavailable".to_string()));
    }

    let failure = f
      .pipeline
      .process(&post_job(Operation::Upsert))
      .await
      .unwrap_err();

    assert_eq!(failure.stage, JobStage::Written);
    assert_eq!(f.sink.write_count(), 3);
  }

  #[tokio::test]
  async fn test_permanent_index_failure_is_not_retried() {
    let f = fixture();
    f.sink
      .fail_next(IndexError::Permanent("dimension mismatch".to_string()));

    let failure = f
      .pipeline
      .process(&post_job(Operation::Upsert))
      .await
      .unwrap_err();

    assert_eq!(failure.stage, JobStage::Written);
    assert_eq!(f.sink.write_count(), 1);
  }

  #[tokio::test]
  async fn test_embedding_outage_is_retried_until_success() {
    let f = fixture();
    f.embedder
      .fail_next(EmbeddingError::Unavailable("loading".to_string()));
    f.embedder
      .fail_next(EmbeddingError::Unavailable("loading".to_string()));

    f.pipeline.process(&post_job(Operation::Upsert)).await.unwrap();
    assert_eq!(f.embedder.call_count(), 3);
    assert_eq!(f.sink.len(), 1);
  }

  #[tokio::test]
  async fn test_stage_deadline_counts_as_transient() {
    let mut config = Config::test();
    config.workers.job_deadline = HumanDuration::new(Duration::from_millis(20));
    config.workers.retry.max_attempts = 2;

    let f = fixture_with(
      config,
      MemorySink::with_write_delay(Duration::from_millis(100)),
      128,
    );

    let failure = f
      .pipeline
      .process(&post_job(Operation::Upsert))
      .await
      .unwrap_err();

    assert_eq!(failure.stage, JobStage::Written);
    assert!(matches!(failure.error, SyncError::DeadlineExceeded(_)));
    assert!(failure.error.is_retryable());
  }
}
