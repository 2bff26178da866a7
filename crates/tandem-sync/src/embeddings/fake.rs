use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use super::{EmbeddedFields, Embedder, EmbeddingError, EmbeddingRequest, EmbeddingResult};
use crate::models::SparseVector;

/// Deterministic in-process embedder for tests: dense values are derived
/// from a hash of the primary text, sparse vectors from whitespace tokens.
/// Failures can be scripted to exercise the retry paths.
pub struct StubEmbedder {
  dense_dim: usize,
  calls: AtomicUsize,
  scripted_failures: Mutex<VecDeque<EmbeddingError>>,
}

impl StubEmbedder {
  pub fn new(dense_dim: usize) -> Self {
    Self {
      dense_dim,
      calls: AtomicUsize::new(0),
      scripted_failures: Mutex::new(VecDeque::new()),
    }
  }

  /// Queue an error to be returned by the next call(s), in order.
  pub fn fail_next(&self, error: EmbeddingError) {
    self
      .scripted_failures
      .lock()
      .unwrap()
      .push_back(error);
  }

  pub fn call_count(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

fn hash_of(text: &str) -> u64 {
  let mut hasher = DefaultHasher::new();
  text.hash(&mut hasher);
  hasher.finish()
}

#[async_trait]
impl Embedder for StubEmbedder {
  async fn embed(&self, request: EmbeddingRequest<'_>) -> EmbeddingResult<EmbeddedFields> {
    self.calls.fetch_add(1, Ordering::SeqCst);

    if let Some(error) = self.scripted_failures.lock().unwrap().pop_front() {
      return Err(error);
    }

    let seed = hash_of(request.primary);
    let dense = (0..self.dense_dim)
      .map(|i| ((seed.wrapping_add(i as u64) % 1000) as f32) / 1000.0)
      .collect();

    let mut sparse = BTreeMap::new();
    for (field, text) in &request.sparse_fields {
      let mut indices = Vec::new();
      let mut weights = Vec::new();
      for token in text.split_whitespace() {
        indices.push((hash_of(token) % 30_000) as u32);
        weights.push(1.0 / (1.0 + token.len() as f32));
      }
      sparse.insert(
        field.to_string(),
        SparseVector { indices, weights },
      );
    }

    Ok(EmbeddedFields { dense, sparse })
  }

  fn dense_dim(&self) -> usize {
    self.dense_dim
  }
}
