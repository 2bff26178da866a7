use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use super::{IndexError, VectorSink};
use crate::config::{CollectionSchema, IndexConfig};
use crate::models::EmbeddedDocument;
use crate::reqwestx::{ApiClient, ApiClientConfig, ApiError};

/// Vector sink backed by a Qdrant-compatible HTTP API. Upserts use named
/// vectors: one dense vector plus one named sparse vector per declared text
/// field. Point ids are v5 UUIDs derived from the stable document id, so the
/// same document always maps to the same point; the raw id is kept in the
/// payload under `_id` for inspection and replay.
pub struct QdrantSink {
  client: ApiClient,
}

#[derive(Debug, Serialize)]
struct SparseVectorBody<'a> {
  indices: &'a [u32],
  values: &'a [f32],
}

impl QdrantSink {
  pub fn new(config: &IndexConfig) -> Result<Self, IndexError> {
    let client = ApiClient::new(ApiClientConfig {
      base_url: config.api_base.clone(),
      api_key: config.api_key.clone(),
      max_concurrent_requests: config.max_concurrent_requests,
      max_requests_per_minute: config.requests_per_minute,
      timeout: config.timeout.inner(),
    })
    .map_err(|e| IndexError::Permanent(format!("failed to build index client: {}", e)))?;

    Ok(Self { client })
  }

  /// Deterministic point id for a stable document id.
  pub fn point_id(document_id: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, document_id.as_bytes()).to_string()
  }
}

fn classify(err: ApiError) -> IndexError {
  if err.is_transient() {
    IndexError::Transient(err.to_string())
  } else {
    IndexError::Permanent(err.to_string())
  }
}

#[async_trait]
impl VectorSink for QdrantSink {
  async fn upsert(&self, document: &EmbeddedDocument) -> Result<(), IndexError> {
    let doc = &document.document;

    let mut vector = serde_json::Map::new();
    vector.insert("dense".to_string(), json!(document.dense_vector));
    for (field, sparse) in &document.sparse_vectors {
      vector.insert(
        field.clone(),
        serde_json::to_value(SparseVectorBody {
          indices: &sparse.indices,
          values: &sparse.weights,
        })
        .map_err(|e| IndexError::Permanent(e.to_string()))?,
      );
    }

    let mut payload = serde_json::Map::new();
    payload.insert("_id".to_string(), json!(doc.id));
    for (name, value) in &doc.scalar_fields {
      payload.insert(name.clone(), value.as_json());
    }
    for (name, text) in &doc.text_fields {
      payload.insert(name.clone(), json!(text));
    }

    let body = json!({
      "points": [{
        "id": Self::point_id(&doc.id),
        "vector": vector,
        "payload": payload,
      }]
    });

    let path = format!("/collections/{}/points?wait=true", doc.collection);
    let _: serde_json::Value = self
      .client
      .put_json(&path, &body)
      .await
      .map_err(classify)?;

    debug!(collection = %doc.collection, id = %doc.id, "upserted point");
    Ok(())
  }

  async fn delete(&self, collection: &str, id: &str) -> Result<(), IndexError> {
    let body = json!({ "points": [Self::point_id(id)] });
    let path = format!("/collections/{}/points/delete?wait=true", collection);

    // The index treats deletion of an absent point as a successful no-op.
    let _: serde_json::Value = self
      .client
      .post_json(&path, &body)
      .await
      .map_err(classify)?;

    debug!(collection, id, "deleted point");
    Ok(())
  }

  async fn ensure_collections(
    &self,
    schemas: &BTreeMap<String, CollectionSchema>,
  ) -> Result<(), IndexError> {
    for (name, schema) in schemas {
      let exists = match self
        .client
        .get_json::<serde_json::Value>(&format!("/collections/{}", name))
        .await
      {
        Ok(_) => true,
        Err(ApiError::Status { status, .. }) if status.as_u16() == 404 => false,
        Err(e) => return Err(classify(e)),
      };

      if exists {
        debug!(collection = %name, "collection already exists");
        continue;
      }

      let sparse_vectors: serde_json::Map<String, serde_json::Value> = schema
        .sparse_fields
        .iter()
        .map(|field| (field.clone(), json!({})))
        .collect();

      let mut body = serde_json::Map::new();
      body.insert(
        "vectors".to_string(),
        json!({
          "dense": { "size": schema.dense_dim, "distance": "Cosine" }
        }),
      );
      if !sparse_vectors.is_empty() {
        body.insert("sparse_vectors".to_string(), json!(sparse_vectors));
      }

      let _: serde_json::Value = self
        .client
        .put_json(&format!("/collections/{}", name), &body)
        .await
        .map_err(classify)?;

      info!(
        collection = %name,
        dense_dim = schema.dense_dim,
        sparse_fields = schema.sparse_fields.len(),
        "created collection"
      );
    }

    Ok(())
  }

  async fn health(&self) -> Result<(), IndexError> {
    self.client.get_ok("/readyz").await.map_err(classify)
  }
}
