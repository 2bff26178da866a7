use std::collections::BTreeMap;

use async_trait::async_trait;

pub mod error;
#[cfg(any(test, feature = "testing"))]
pub mod fake;
pub mod remote;

pub use error::{EmbeddingError, EmbeddingResult};

use crate::models::SparseVector;

/// Input for embedding a single document (borrows text to avoid cloning)
#[derive(Debug)]
pub struct EmbeddingRequest<'a> {
  /// Text the dense vector is computed from.
  pub primary: &'a str,

  /// Fields that each get their own sparse token-weight vector, so relevance
  /// on title, description, and address stay independent signals.
  pub sparse_fields: Vec<(&'a str, &'a str)>,
}

/// Vectors produced for a single document.
#[derive(Debug, Clone)]
pub struct EmbeddedFields {
  pub dense: Vec<f32>,
  pub sparse: BTreeMap<String, SparseVector>,
}

/// Main trait for embedding providers. Implementations are stateless,
/// concurrency-safe handles shared read-only across all workers.
#[async_trait]
pub trait Embedder: Send + Sync {
  /// Embed one document's fields. May be long-running (model inference);
  /// callers bound it with the per-job deadline.
  async fn embed(&self, request: EmbeddingRequest<'_>) -> EmbeddingResult<EmbeddedFields>;

  /// The fixed dense dimension this provider's model produces.
  fn dense_dim(&self) -> usize;
}
