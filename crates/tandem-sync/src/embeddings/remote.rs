use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{EmbeddedFields, Embedder, EmbeddingError, EmbeddingRequest, EmbeddingResult};
use crate::config::EmbeddingConfig;
use crate::models::SparseVector;
use crate::reqwestx::{ApiClient, ApiClientConfig, ApiError};

#[derive(Debug, Serialize)]
struct EmbedRequestBody<'a> {
  model: &'a str,
  input: EmbedInput<'a>,
}

#[derive(Debug, Serialize)]
struct EmbedInput<'a> {
  primary: &'a str,
  #[serde(skip_serializing_if = "BTreeMap::is_empty")]
  fields: BTreeMap<&'a str, &'a str>,
}

#[derive(Debug, Deserialize)]
struct EmbedResponseBody {
  dense: Vec<f32>,
  #[serde(default)]
  sparse: BTreeMap<String, SparseVector>,
}

/// Client for a hybrid embedding server (a BGE-M3-style runtime exposed over
/// HTTP). One request per document: the primary text yields the dense
/// vector, and each named field yields its own token-weight sparse vector.
#[derive(Debug)]
pub struct RemoteEmbedder {
  client: ApiClient,
  model: String,
  dense_dim: usize,
}

impl RemoteEmbedder {
  pub fn new(config: &EmbeddingConfig) -> EmbeddingResult<Self> {
    if config.dense_dim == 0 {
      return Err(EmbeddingError::InvalidConfig(
        "embedding dense_dim must be non-zero".to_string(),
      ));
    }

    let client = ApiClient::new(ApiClientConfig {
      base_url: config.api_base.clone(),
      api_key: config.api_key.clone(),
      max_concurrent_requests: config.max_concurrent_requests,
      max_requests_per_minute: config.requests_per_minute,
      timeout: config.timeout.inner(),
    })
    .map_err(|e| EmbeddingError::InvalidConfig(e.to_string()))?;

    Ok(Self {
      client,
      model: config.model.clone(),
      dense_dim: config.dense_dim,
    })
  }
}

#[async_trait::async_trait]
impl Embedder for RemoteEmbedder {
  async fn embed(&self, request: EmbeddingRequest<'_>) -> EmbeddingResult<EmbeddedFields> {
    let body = EmbedRequestBody {
      model: &self.model,
      input: EmbedInput {
        primary: request.primary,
        fields: request.sparse_fields.iter().copied().collect(),
      },
    };

    let response: EmbedResponseBody =
      self
        .client
        .post_json("/embed", &body)
        .await
        .map_err(|e| match e {
          ApiError::Status { status, body } if status.is_client_error() => {
            EmbeddingError::MalformedInput(format!("{}: {}", status, body))
          }
          other => EmbeddingError::Unavailable(other.to_string()),
        })?;

    debug!(
      dense_len = response.dense.len(),
      sparse_fields = response.sparse.len(),
      "embedding runtime call completed"
    );

    Ok(EmbeddedFields {
      dense: response.dense,
      sparse: response.sparse,
    })
  }

  fn dense_dim(&self) -> usize {
    self.dense_dim
  }
}
