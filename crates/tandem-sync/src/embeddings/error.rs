#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
  #[error("embedding runtime unavailable: {0}")]
  Unavailable(String),

  #[error("embedding input rejected: {0}")]
  MalformedInput(String),

  #[error("invalid embedding configuration: {0}")]
  InvalidConfig(String),
}

impl EmbeddingError {
  /// Only runtime unavailability is worth retrying; rejected input and
  /// configuration mistakes will fail the same way every time.
  pub fn is_retryable(&self) -> bool {
    matches!(self, EmbeddingError::Unavailable(_))
  }
}

pub type EmbeddingResult<T> = Result<T, EmbeddingError>;
