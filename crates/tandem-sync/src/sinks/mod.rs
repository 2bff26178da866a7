use std::collections::BTreeMap;

use async_trait::async_trait;

#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod qdrant;

use crate::config::CollectionSchema;
use crate::models::EmbeddedDocument;

/// Index write failures, split by whether a retry can ever help. The split
/// comes from the index service's response: timeouts, rate limits, and
/// temporary unavailability are transient; schema violations and malformed
/// vectors are permanent.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
  #[error("transient index failure: {0}")]
  Transient(String),

  #[error("permanent index failure: {0}")]
  Permanent(String),
}

impl IndexError {
  pub fn is_retryable(&self) -> bool {
    matches!(self, IndexError::Transient(_))
  }
}

/// Write-side interface to the vector index. Implementations are stateless,
/// concurrency-safe clients shared read-only across all workers.
#[async_trait]
pub trait VectorSink: Send + Sync {
  /// Idempotent upsert keyed by the document's stable id: applying the same
  /// document twice leaves the index in the same state as applying it once.
  async fn upsert(&self, document: &EmbeddedDocument) -> Result<(), IndexError>;

  /// Delete keyed by (collection, id). Deleting an absent id succeeds.
  async fn delete(&self, collection: &str, id: &str) -> Result<(), IndexError>;

  /// Create any missing collections with their declared schema. Existing
  /// collections are left untouched.
  async fn ensure_collections(
    &self,
    schemas: &BTreeMap<String, CollectionSchema>,
  ) -> Result<(), IndexError>;

  /// Readiness probe for startup checks and operator tooling.
  async fn health(&self) -> Result<(), IndexError>;
}
