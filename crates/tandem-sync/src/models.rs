use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::CollectionSchema;

/// The kind of change carried by a job. The producer tags every job with an
/// explicit operation; the consumer never inspects soft-delete flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
  Upsert,
  Delete,
}

impl std::fmt::Display for Operation {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Operation::Upsert => write!(f, "upsert"),
      Operation::Delete => write!(f, "delete"),
    }
  }
}

/// A change notification pulled from the queue. Owned by the consumer for the
/// duration of a single processing attempt; terminates at acknowledgment or
/// in the dead-letter sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeJob {
  pub source_table: String,
  pub operation: Operation,
  pub row_id: i64,
  #[serde(default)]
  pub payload: BTreeMap<String, serde_json::Value>,
  pub enqueued_at: DateTime<Utc>,
  #[serde(default)]
  pub delivery_attempt: u32,
}

impl ChangeJob {
  /// Grouping key for per-entity ordering. All jobs with the same key are
  /// routed to the same sequential lane.
  pub fn partition_key(&self) -> (&str, i64) {
    (&self.source_table, self.row_id)
  }

  /// Stable document id, derived deterministically so repeated deliveries of
  /// the same change produce the same upsert key.
  pub fn document_id(&self) -> String {
    format!("{}:{}", self.source_table, self.row_id)
  }
}

/// A typed scalar filter value produced by mapper coercion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
  Bool(bool),
  Int(i64),
  Float(f64),
  Text(String),
}

impl ScalarValue {
  pub fn as_json(&self) -> serde_json::Value {
    match self {
      ScalarValue::Bool(b) => serde_json::Value::from(*b),
      ScalarValue::Int(i) => serde_json::Value::from(*i),
      ScalarValue::Float(f) => serde_json::Value::from(*f),
      ScalarValue::Text(s) => serde_json::Value::from(s.clone()),
    }
  }
}

/// Token-weight vector scoped to a single text field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SparseVector {
  pub indices: Vec<u32>,
  pub weights: Vec<f32>,
}

impl SparseVector {
  pub fn len(&self) -> usize {
    self.indices.len()
  }

  pub fn is_empty(&self) -> bool {
    self.indices.is_empty()
  }
}

/// A normalized record ready for embedding and writing. Transient; never
/// persisted by this crate.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
  pub collection: String,
  pub id: String,
  pub scalar_fields: BTreeMap<String, ScalarValue>,
  /// Text fields ordered by the table mapping's declared order.
  pub text_fields: Vec<(String, String)>,
}

impl Document {
  /// A delete-only document: id and collection, nothing to embed.
  pub fn delete_marker(collection: impl Into<String>, id: impl Into<String>) -> Self {
    Self {
      collection: collection.into(),
      id: id.into(),
      scalar_fields: BTreeMap::new(),
      text_fields: Vec::new(),
    }
  }

  /// The text the dense vector is computed from: all text fields joined in
  /// declared order.
  pub fn primary_text(&self) -> String {
    self
      .text_fields
      .iter()
      .map(|(_, text)| text.as_str())
      .collect::<Vec<_>>()
      .join("\n")
  }

  pub fn text_field(&self, name: &str) -> Option<&str> {
    self
      .text_fields
      .iter()
      .find(|(field, _)| field == name)
      .map(|(_, text)| text.as_str())
  }
}

/// A document plus its vector representations.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedDocument {
  pub document: Document,
  pub dense_vector: Vec<f32>,
  pub sparse_vectors: BTreeMap<String, SparseVector>,
}

impl EmbeddedDocument {
  /// Check the vectors against the collection schema. Writes are rejected
  /// before they reach the index when the dense length or the sparse field
  /// set does not match exactly.
  pub fn validate_against(&self, schema: &CollectionSchema) -> Result<(), String> {
    if self.dense_vector.len() != schema.dense_dim {
      return Err(format!(
        "dense vector length {} does not match collection dimension {}",
        self.dense_vector.len(),
        schema.dense_dim
      ));
    }

    let declared: std::collections::BTreeSet<&str> =
      schema.sparse_fields.iter().map(String::as_str).collect();
    let actual: std::collections::BTreeSet<&str> =
      self.sparse_vectors.keys().map(String::as_str).collect();
    if declared != actual {
      return Err(format!(
        "sparse vector fields [{}] do not match declared fields [{}]",
        actual.into_iter().collect::<Vec<_>>().join(", "),
        declared.into_iter().collect::<Vec<_>>().join(", ")
      ));
    }

    Ok(())
  }
}

/// Append-only record of a job that exhausted its retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
  pub job: ChangeJob,
  pub stage: crate::pipeline::JobStage,
  pub reason: String,
  pub failed_at: DateTime<Utc>,
}
