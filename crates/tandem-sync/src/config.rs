use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::HumanDuration;

/// Scalar filter field types supported by the collection schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
  Int,
  Float,
  Text,
  Bool,
  /// Stored as epoch seconds; the mapper coerces ISO-8601 strings.
  Timestamp,
}

/// Per-collection schema. Loaded at startup, immutable at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSchema {
  /// Dense vector dimension for this collection.
  pub dense_dim: usize,

  /// Text fields that each get their own sparse token-weight vector.
  #[serde(default)]
  pub sparse_fields: Vec<String>,

  /// Scalar filter fields and their types.
  #[serde(default)]
  pub scalar_fields: BTreeMap<String, FieldType>,
}

/// One text field extracted from the row payload for embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextFieldMapping {
  /// Field name in the target collection.
  pub field: String,

  /// Column name in the source row payload.
  pub column: String,

  #[serde(default = "default_required")]
  pub required: bool,
}

/// One scalar field copied (with coercion) from the row payload. The field's
/// type comes from the target collection schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarFieldMapping {
  pub field: String,
  pub column: String,

  #[serde(default = "default_required")]
  pub required: bool,
}

/// Routes one source table to a target collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMapping {
  pub collection: String,

  /// Ordered; the dense vector is computed from the concatenation in this
  /// order.
  #[serde(default)]
  pub text_fields: Vec<TextFieldMapping>,

  #[serde(default)]
  pub scalar_fields: Vec<ScalarFieldMapping>,
}

/// Queue (Redis Streams) settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
  /// Redis connection URL.
  #[serde(default = "default_queue_url")]
  pub url: String,

  /// Streams carrying change notifications. One consumer group spans all of
  /// them.
  #[serde(default = "default_streams")]
  pub streams: Vec<String>,

  #[serde(default = "default_group")]
  pub group: String,

  #[serde(default = "default_consumer")]
  pub consumer: String,

  /// Max messages pulled per read.
  #[serde(default = "default_batch_size")]
  pub batch_size: usize,

  /// How long a read blocks waiting for new messages.
  #[serde(default = "default_block")]
  pub block: HumanDuration,

  /// Stream that receives dead-lettered jobs.
  #[serde(default = "default_dead_letter_stream")]
  pub dead_letter_stream: String,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      url: default_queue_url(),
      streams: default_streams(),
      group: default_group(),
      consumer: default_consumer(),
      batch_size: default_batch_size(),
      block: default_block(),
      dead_letter_stream: default_dead_letter_stream(),
    }
  }
}

/// Remote embedding runtime settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingConfig {
  /// Base URL of the hybrid embedding server.
  #[serde(default = "default_embedding_api_base")]
  pub api_base: String,

  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub api_key: Option<String>,

  /// Model name requested from the runtime.
  #[serde(default = "default_embedding_model")]
  pub model: String,

  /// Dense dimension the runtime produces.
  #[serde(default = "default_dense_dim")]
  pub dense_dim: usize,

  #[serde(default = "default_request_timeout")]
  pub timeout: HumanDuration,

  #[serde(default = "default_max_concurrent_requests")]
  pub max_concurrent_requests: usize,

  #[serde(default = "default_requests_per_minute")]
  pub requests_per_minute: usize,
}

impl Default for EmbeddingConfig {
  fn default() -> Self {
    Self {
      api_base: default_embedding_api_base(),
      api_key: None,
      model: default_embedding_model(),
      dense_dim: default_dense_dim(),
      timeout: default_request_timeout(),
      max_concurrent_requests: default_max_concurrent_requests(),
      requests_per_minute: default_requests_per_minute(),
    }
  }
}

/// Vector index service settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
  /// Base URL of the Qdrant-compatible HTTP API.
  #[serde(default = "default_index_api_base")]
  pub api_base: String,

  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub api_key: Option<String>,

  #[serde(default = "default_request_timeout")]
  pub timeout: HumanDuration,

  #[serde(default = "default_max_concurrent_requests")]
  pub max_concurrent_requests: usize,

  #[serde(default = "default_requests_per_minute")]
  pub requests_per_minute: usize,
}

impl Default for IndexConfig {
  fn default() -> Self {
    Self {
      api_base: default_index_api_base(),
      api_key: None,
      timeout: default_request_timeout(),
      max_concurrent_requests: default_max_concurrent_requests(),
      requests_per_minute: default_requests_per_minute(),
    }
  }
}

/// Per-stage retry budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
  /// Total attempts per stage, including the first.
  #[serde(default = "default_max_attempts")]
  pub max_attempts: u32,

  #[serde(default = "default_retry_base")]
  pub base: HumanDuration,

  #[serde(default = "default_retry_cap")]
  pub cap: HumanDuration,

  /// Fraction of the computed delay randomly shaved off to spread retries.
  #[serde(default = "default_jitter")]
  pub jitter: f64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_attempts: default_max_attempts(),
      base: default_retry_base(),
      cap: default_retry_cap(),
      jitter: default_jitter(),
    }
  }
}

/// Worker pool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
  /// Number of sequential lanes. Jobs for the same (table, row) key always
  /// land on the same lane; distinct keys fan out.
  #[serde(default = "default_worker_count")]
  pub count: usize,

  /// Bounded per-lane buffer; once full, dequeuing pauses (backpressure).
  #[serde(default = "default_lane_capacity")]
  pub lane_capacity: usize,

  /// Deadline applied to each blocking stage attempt (embed, write).
  #[serde(default = "default_job_deadline")]
  pub job_deadline: HumanDuration,

  /// How long in-flight jobs may drain after a shutdown signal.
  #[serde(default = "default_shutdown_grace")]
  pub shutdown_grace: HumanDuration,

  #[serde(default)]
  pub retry: RetryConfig,
}

impl Default for WorkerConfig {
  fn default() -> Self {
    Self {
      count: default_worker_count(),
      lane_capacity: default_lane_capacity(),
      job_deadline: default_job_deadline(),
      shutdown_grace: default_shutdown_grace(),
      retry: RetryConfig::default(),
    }
  }
}

/// Top-level configuration for the sync service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub queue: QueueConfig,

  #[serde(default)]
  pub embedding: EmbeddingConfig,

  #[serde(default)]
  pub index: IndexConfig,

  #[serde(default)]
  pub workers: WorkerConfig,

  /// Collection schemas, keyed by collection name.
  #[serde(default = "default_collections")]
  pub collections: BTreeMap<String, CollectionSchema>,

  /// Source-table routing, keyed by table name.
  #[serde(default = "default_tables")]
  pub tables: BTreeMap<String, TableMapping>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      queue: QueueConfig::default(),
      embedding: EmbeddingConfig::default(),
      index: IndexConfig::default(),
      workers: WorkerConfig::default(),
      collections: default_collections(),
      tables: default_tables(),
    }
  }
}

impl Config {
  /// Cross-check the static schema wiring. Mistakes here are config bugs and
  /// are surfaced before any job is consumed.
  pub fn validate(&self) -> Result<(), String> {
    if self.workers.count == 0 {
      return Err("workers.count must be at least 1".to_string());
    }
    if self.workers.retry.max_attempts == 0 {
      return Err("workers.retry.max_attempts must be at least 1".to_string());
    }
    if !(0.0..=1.0).contains(&self.workers.retry.jitter) {
      return Err("workers.retry.jitter must be within 0.0..=1.0".to_string());
    }
    if self.queue.streams.is_empty() {
      return Err("queue.streams must name at least one stream".to_string());
    }

    for (table, mapping) in &self.tables {
      let schema = self.collections.get(&mapping.collection).ok_or_else(|| {
        format!(
          "table {} routes to unknown collection {}",
          table, mapping.collection
        )
      })?;

      if schema.dense_dim != self.embedding.dense_dim {
        return Err(format!(
          "collection {} declares dense_dim {} but the embedding runtime produces {}",
          mapping.collection, schema.dense_dim, self.embedding.dense_dim
        ));
      }

      for sparse in &schema.sparse_fields {
        if !mapping.text_fields.iter().any(|t| &t.field == sparse) {
          return Err(format!(
            "collection {} declares sparse field {} but table {} maps no such text field",
            mapping.collection, sparse, table
          ));
        }
      }

      for scalar in &mapping.scalar_fields {
        if !schema.scalar_fields.contains_key(&scalar.field) {
          return Err(format!(
            "table {} maps scalar {} which collection {} does not declare",
            table, scalar.field, mapping.collection
          ));
        }
      }
    }

    Ok(())
  }

  /// Test configuration with a small worker pool and fast retries.
  #[cfg(any(test, feature = "testing"))]
  pub fn test() -> Self {
    let mut config = Self::default();
    config.workers.count = 2;
    config.workers.lane_capacity = 4;
    config.workers.job_deadline = HumanDuration::new(Duration::from_secs(2));
    config.workers.shutdown_grace = HumanDuration::new(Duration::from_millis(500));
    config.workers.retry = RetryConfig {
      max_attempts: 3,
      base: HumanDuration::new(Duration::from_millis(10)),
      cap: HumanDuration::new(Duration::from_millis(40)),
      jitter: 0.2,
    };
    config
  }
}

fn default_required() -> bool {
  true
}

fn default_queue_url() -> String {
  "redis://localhost:6379".to_string()
}

fn default_streams() -> Vec<String> {
  vec![
    "tandem.changes.posts".to_string(),
    "tandem.changes.customers".to_string(),
  ]
}

fn default_group() -> String {
  "tandem-sync".to_string()
}

fn default_consumer() -> String {
  "tandem-worker".to_string()
}

fn default_batch_size() -> usize {
  16
}

fn default_block() -> HumanDuration {
  HumanDuration::new(Duration::from_secs(5))
}

fn default_dead_letter_stream() -> String {
  "tandem.dead-letter".to_string()
}

fn default_embedding_api_base() -> String {
  "http://localhost:8090".to_string()
}

fn default_embedding_model() -> String {
  "bge-m3-rental".to_string()
}

fn default_dense_dim() -> usize {
  128
}

fn default_index_api_base() -> String {
  "http://localhost:6333".to_string()
}

fn default_request_timeout() -> HumanDuration {
  HumanDuration::new(Duration::from_secs(30))
}

fn default_max_concurrent_requests() -> usize {
  16
}

fn default_requests_per_minute() -> usize {
  600
}

fn default_max_attempts() -> u32 {
  5
}

fn default_retry_base() -> HumanDuration {
  HumanDuration::new(Duration::from_millis(250))
}

fn default_retry_cap() -> HumanDuration {
  HumanDuration::new(Duration::from_secs(30))
}

fn default_jitter() -> f64 {
  0.3
}

fn default_worker_count() -> usize {
  5
}

fn default_lane_capacity() -> usize {
  8
}

fn default_job_deadline() -> HumanDuration {
  HumanDuration::new(Duration::from_secs(60))
}

fn default_shutdown_grace() -> HumanDuration {
  HumanDuration::new(Duration::from_secs(30))
}

fn default_collections() -> BTreeMap<String, CollectionSchema> {
  let mut collections = BTreeMap::new();

  let mut post_scalars = BTreeMap::new();
  post_scalars.insert("price".to_string(), FieldType::Int);
  post_scalars.insert("acreage".to_string(), FieldType::Int);
  post_scalars.insert("city".to_string(), FieldType::Text);
  post_scalars.insert("district".to_string(), FieldType::Text);
  post_scalars.insert("ward".to_string(), FieldType::Text);
  post_scalars.insert("street".to_string(), FieldType::Text);
  post_scalars.insert("interior_condition".to_string(), FieldType::Text);
  post_scalars.insert("owner_id".to_string(), FieldType::Int);
  post_scalars.insert("created_at".to_string(), FieldType::Timestamp);
  post_scalars.insert("extended_at".to_string(), FieldType::Timestamp);

  collections.insert(
    "posts_hybrid".to_string(),
    CollectionSchema {
      dense_dim: 128,
      sparse_fields: vec![
        "title".to_string(),
        "description".to_string(),
        "address".to_string(),
      ],
      scalar_fields: post_scalars,
    },
  );

  let mut user_scalars = BTreeMap::new();
  user_scalars.insert("name".to_string(), FieldType::Text);
  user_scalars.insert("gender".to_string(), FieldType::Text);
  user_scalars.insert("city".to_string(), FieldType::Text);

  collections.insert(
    "users".to_string(),
    CollectionSchema {
      dense_dim: 128,
      sparse_fields: Vec::new(),
      scalar_fields: user_scalars,
    },
  );

  collections
}

fn default_tables() -> BTreeMap<String, TableMapping> {
  let mut tables = BTreeMap::new();

  tables.insert(
    "posts".to_string(),
    TableMapping {
      collection: "posts_hybrid".to_string(),
      text_fields: vec![
        TextFieldMapping {
          field: "title".to_string(),
          column: "title".to_string(),
          required: true,
        },
        TextFieldMapping {
          field: "description".to_string(),
          column: "description".to_string(),
          required: true,
        },
        TextFieldMapping {
          field: "address".to_string(),
          column: "address".to_string(),
          required: true,
        },
      ],
      scalar_fields: vec![
        ScalarFieldMapping {
          field: "price".to_string(),
          column: "price".to_string(),
          required: true,
        },
        ScalarFieldMapping {
          field: "acreage".to_string(),
          column: "acreage".to_string(),
          required: false,
        },
        ScalarFieldMapping {
          field: "city".to_string(),
          column: "city".to_string(),
          required: true,
        },
        ScalarFieldMapping {
          field: "district".to_string(),
          column: "district".to_string(),
          required: false,
        },
        ScalarFieldMapping {
          field: "ward".to_string(),
          column: "ward".to_string(),
          required: false,
        },
        ScalarFieldMapping {
          field: "street".to_string(),
          column: "street".to_string(),
          required: false,
        },
        ScalarFieldMapping {
          field: "interior_condition".to_string(),
          column: "interiorCondition".to_string(),
          required: false,
        },
        ScalarFieldMapping {
          field: "owner_id".to_string(),
          column: "ownerId".to_string(),
          required: false,
        },
        ScalarFieldMapping {
          field: "created_at".to_string(),
          column: "createdAt".to_string(),
          required: false,
        },
        ScalarFieldMapping {
          field: "extended_at".to_string(),
          column: "extendedAt".to_string(),
          required: false,
        },
      ],
    },
  );

  tables.insert(
    "customers".to_string(),
    TableMapping {
      collection: "users".to_string(),
      text_fields: vec![
        TextFieldMapping {
          field: "name".to_string(),
          column: "name".to_string(),
          required: true,
        },
        TextFieldMapping {
          field: "bio".to_string(),
          column: "bio".to_string(),
          required: false,
        },
      ],
      scalar_fields: vec![
        ScalarFieldMapping {
          field: "name".to_string(),
          column: "name".to_string(),
          required: true,
        },
        ScalarFieldMapping {
          field: "gender".to_string(),
          column: "gender".to_string(),
          required: false,
        },
        ScalarFieldMapping {
          field: "city".to_string(),
          column: "city".to_string(),
          required: false,
        },
      ],
    },
  );

  tables
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_default_config_is_valid() {
    let config = Config::default();
    config.validate().unwrap();
    assert_eq!(config.collections["posts_hybrid"].dense_dim, 128);
    assert_eq!(config.collections["posts_hybrid"].sparse_fields.len(), 3);
    assert!(config.collections["users"].sparse_fields.is_empty());
  }

  #[test]
  fn test_config_serialization_round_trip() {
    let config = Config::test();
    let toml_str = toml::to_string(&config).unwrap();
    let parsed: Config = toml::from_str(&toml_str).unwrap();

    assert_eq!(config, parsed);
  }

  #[test]
  fn test_validate_rejects_unknown_collection() {
    let mut config = Config::test();
    config
      .tables
      .get_mut("posts")
      .unwrap()
      .collection = "missing".to_string();
    let err = config.validate().unwrap_err();
    assert!(err.contains("unknown collection"));
  }

  #[test]
  fn test_validate_rejects_dense_dim_mismatch() {
    let mut config = Config::test();
    config.embedding.dense_dim = 64;
    let err = config.validate().unwrap_err();
    assert!(err.contains("dense_dim"));
  }

  #[test]
  fn test_validate_rejects_sparse_field_without_text_mapping() {
    let mut config = Config::test();
    config
      .collections
      .get_mut("posts_hybrid")
      .unwrap()
      .sparse_fields
      .push("missing_field".to_string());
    let err = config.validate().unwrap_err();
    assert!(err.contains("sparse field"));
  }

  #[test]
  fn test_validate_rejects_undeclared_scalar() {
    let mut config = Config::test();
    config
      .tables
      .get_mut("posts")
      .unwrap()
      .scalar_fields
      .push(ScalarFieldMapping {
        field: "unknown".to_string(),
        column: "unknown".to_string(),
        required: false,
      });
    let err = config.validate().unwrap_err();
    assert!(err.contains("does not declare"));
  }

  #[test]
  fn test_partial_toml_uses_defaults() {
    let parsed: Config = toml::from_str(
      r#"
        [queue]
        url = "redis://queue:6379"

        [workers]
        count = 3
      "#,
    )
    .unwrap();
    assert_eq!(parsed.queue.url, "redis://queue:6379");
    assert_eq!(parsed.workers.count, 3);
    assert_eq!(parsed.queue.group, "tandem-sync");
    assert!(parsed.collections.contains_key("posts_hybrid"));
    parsed.validate().unwrap();
  }
}
