use std::collections::BTreeMap;

use chrono::DateTime;
use serde_json::Value;

use crate::config::{CollectionSchema, Config, FieldType, TableMapping};
use crate::models::{ChangeJob, Document, Operation, ScalarValue};

/// Errors raised while normalizing a change record. All of these mean the
/// payload can never satisfy the target schema, so none are retried.
#[derive(Debug, thiserror::Error)]
pub enum MapError {
  #[error("no mapping for source table: {0}")]
  UnmappedTable(String),

  #[error("table {table} routes to unknown collection {collection}")]
  UnknownCollection { table: String, collection: String },

  #[error("missing required column {column} in payload for table {table}")]
  MissingColumn { table: String, column: String },

  #[error("column {column} has invalid value for {field_type:?} field: {reason}")]
  InvalidValue {
    column: String,
    field_type: FieldType,
    reason: String,
  },
}

/// Deterministic, side-effect-free translation of change jobs into
/// normalized documents. Built once at startup from the static config and
/// shared read-only across workers.
#[derive(Debug, Clone)]
pub struct DocumentMapper {
  tables: BTreeMap<String, TableMapping>,
  collections: BTreeMap<String, CollectionSchema>,
}

impl DocumentMapper {
  pub fn new(config: &Config) -> Self {
    Self {
      tables: config.tables.clone(),
      collections: config.collections.clone(),
    }
  }

  pub fn map(&self, job: &ChangeJob) -> Result<Document, MapError> {
    let mapping = self
      .tables
      .get(&job.source_table)
      .ok_or_else(|| MapError::UnmappedTable(job.source_table.clone()))?;

    let schema = self.collections.get(&mapping.collection).ok_or_else(|| {
      MapError::UnknownCollection {
        table: job.source_table.clone(),
        collection: mapping.collection.clone(),
      }
    })?;

    let id = job.document_id();

    // Deletes carry no fields; the index only needs the key.
    if job.operation == Operation::Delete {
      return Ok(Document::delete_marker(mapping.collection.clone(), id));
    }

    let mut text_fields = Vec::with_capacity(mapping.text_fields.len());
    for text in &mapping.text_fields {
      match job.payload.get(&text.column) {
        Some(Value::String(s)) => text_fields.push((text.field.clone(), s.clone())),
        Some(Value::Null) | None if !text.required => {}
        Some(Value::Null) | None => {
          return Err(MapError::MissingColumn {
            table: job.source_table.clone(),
            column: text.column.clone(),
          });
        }
        Some(other) => {
          return Err(MapError::InvalidValue {
            column: text.column.clone(),
            field_type: FieldType::Text,
            reason: format!("expected a string, got {}", json_kind(other)),
          });
        }
      }
    }

    let mut scalar_fields = BTreeMap::new();
    for scalar in &mapping.scalar_fields {
      // Validated at startup, so the type is always declared.
      let field_type = match schema.scalar_fields.get(&scalar.field) {
        Some(t) => *t,
        None => {
          return Err(MapError::UnknownCollection {
            table: job.source_table.clone(),
            collection: mapping.collection.clone(),
          });
        }
      };

      match job.payload.get(&scalar.column) {
        Some(Value::Null) | None if !scalar.required => {}
        Some(Value::Null) | None => {
          return Err(MapError::MissingColumn {
            table: job.source_table.clone(),
            column: scalar.column.clone(),
          });
        }
        Some(value) => {
          let coerced =
            coerce_scalar(value, field_type).map_err(|reason| MapError::InvalidValue {
              column: scalar.column.clone(),
              field_type,
              reason,
            })?;
          scalar_fields.insert(scalar.field.clone(), coerced);
        }
      }
    }

    Ok(Document {
      collection: mapping.collection.clone(),
      id,
      scalar_fields,
      text_fields,
    })
  }
}

/// Coerce a raw payload value into the declared scalar type. Numeric strings
/// become numbers, ISO-8601 datetime strings become epoch seconds.
fn coerce_scalar(value: &Value, field_type: FieldType) -> Result<ScalarValue, String> {
  match field_type {
    FieldType::Int => match value {
      Value::Number(n) => n
        .as_i64()
        .map(ScalarValue::Int)
        .ok_or_else(|| format!("{} is not an integer", n)),
      Value::String(s) => s
        .trim()
        .parse::<i64>()
        .map(ScalarValue::Int)
        .map_err(|e| format!("cannot parse {:?} as integer: {}", s, e)),
      other => Err(format!("expected an integer, got {}", json_kind(other))),
    },
    FieldType::Float => match value {
      Value::Number(n) => n
        .as_f64()
        .map(ScalarValue::Float)
        .ok_or_else(|| format!("{} is not a float", n)),
      Value::String(s) => s
        .trim()
        .parse::<f64>()
        .map(ScalarValue::Float)
        .map_err(|e| format!("cannot parse {:?} as float: {}", s, e)),
      other => Err(format!("expected a float, got {}", json_kind(other))),
    },
    FieldType::Text => match value {
      Value::String(s) => Ok(ScalarValue::Text(s.clone())),
      Value::Number(n) => Ok(ScalarValue::Text(n.to_string())),
      other => Err(format!("expected text, got {}", json_kind(other))),
    },
    FieldType::Bool => match value {
      Value::Bool(b) => Ok(ScalarValue::Bool(*b)),
      Value::String(s) => match s.trim() {
        "true" => Ok(ScalarValue::Bool(true)),
        "false" => Ok(ScalarValue::Bool(false)),
        other => Err(format!("cannot parse {:?} as bool", other)),
      },
      other => Err(format!("expected a bool, got {}", json_kind(other))),
    },
    FieldType::Timestamp => match value {
      // Already epoch seconds.
      Value::Number(n) => n
        .as_i64()
        .map(ScalarValue::Int)
        .ok_or_else(|| format!("{} is not an epoch timestamp", n)),
      Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
        .map(|dt| ScalarValue::Int(dt.timestamp()))
        .map_err(|e| format!("cannot parse {:?} as ISO-8601 datetime: {}", s, e)),
      other => Err(format!("expected a timestamp, got {}", json_kind(other))),
    },
  }
}

fn json_kind(value: &Value) -> &'static str {
  match value {
    Value::Null => "null",
    Value::Bool(_) => "a bool",
    Value::Number(_) => "a number",
    Value::String(_) => "a string",
    Value::Array(_) => "an array",
    Value::Object(_) => "an object",
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Utc;
  use serde_json::json;

  fn mapper() -> DocumentMapper {
    DocumentMapper::new(&Config::test())
  }

  fn post_job(payload: serde_json::Value) -> ChangeJob {
    let map = match payload {
      Value::Object(m) => m.into_iter().collect(),
      _ => panic!("payload must be an object"),
    };
    ChangeJob {
      source_table: "posts".to_string(),
      operation: Operation::Upsert,
      row_id: 42,
      payload: map,
      enqueued_at: Utc::now(),
      delivery_attempt: 1,
    }
  }

  fn full_post_payload() -> serde_json::Value {
    json!({
      "title": "Phòng trọ giá rẻ",
      "description": "Phòng mới, gần chợ",
      "address": "12 Nguyễn Trãi, P5, Q5, HCM",
      "price": 3_000_000,
      "acreage": "25",
      "city": "HCM",
      "district": "Q5",
      "ward": "P5",
      "street": "Nguyễn Trãi",
      "interiorCondition": "full",
      "ownerId": 7,
      "createdAt": "2025-11-03T08:30:00Z",
    })
  }

  #[test]
  fn test_maps_post_to_hybrid_collection() {
    let doc = mapper().map(&post_job(full_post_payload())).unwrap();

    assert_eq!(doc.collection, "posts_hybrid");
    assert_eq!(doc.id, "posts:42");
    assert_eq!(
      doc.text_fields.iter().map(|(f, _)| f.as_str()).collect::<Vec<_>>(),
      vec!["title", "description", "address"]
    );
    assert_eq!(
      doc.scalar_fields["price"],
      ScalarValue::Int(3_000_000),
    );
    assert_eq!(doc.scalar_fields["city"], ScalarValue::Text("HCM".into()));
  }

  #[test]
  fn test_numeric_string_is_coerced() {
    let doc = mapper().map(&post_job(full_post_payload())).unwrap();
    assert_eq!(doc.scalar_fields["acreage"], ScalarValue::Int(25));
  }

  #[test]
  fn test_iso_datetime_becomes_epoch_seconds() {
    let doc = mapper().map(&post_job(full_post_payload())).unwrap();
    assert_eq!(
      doc.scalar_fields["created_at"],
      ScalarValue::Int(1_762_158_600),
    );
  }

  #[test]
  fn test_missing_required_column_is_schema_mismatch() {
    let mut payload = full_post_payload();
    payload.as_object_mut().unwrap().remove("title");

    let err = mapper().map(&post_job(payload)).unwrap_err();
    assert!(matches!(err, MapError::MissingColumn { ref column, .. } if column == "title"));
  }

  #[test]
  fn test_missing_optional_column_is_skipped() {
    let mut payload = full_post_payload();
    payload.as_object_mut().unwrap().remove("ward");

    let doc = mapper().map(&post_job(payload)).unwrap();
    assert!(!doc.scalar_fields.contains_key("ward"));
  }

  #[test]
  fn test_unparsable_number_is_invalid_value() {
    let mut payload = full_post_payload();
    payload["price"] = json!("three million");

    let err = mapper().map(&post_job(payload)).unwrap_err();
    assert!(matches!(err, MapError::InvalidValue { ref column, .. } if column == "price"));
  }

  #[test]
  fn test_unmapped_table_is_rejected() {
    let mut job = post_job(full_post_payload());
    job.source_table = "comments".to_string();

    let err = mapper().map(&job).unwrap_err();
    assert!(matches!(err, MapError::UnmappedTable(ref t) if t == "comments"));
  }

  #[test]
  fn test_delete_produces_marker_only() {
    let mut job = post_job(json!({}));
    job.operation = Operation::Delete;

    let doc = mapper().map(&job).unwrap();
    assert_eq!(doc.id, "posts:42");
    assert_eq!(doc.collection, "posts_hybrid");
    assert!(doc.text_fields.is_empty());
    assert!(doc.scalar_fields.is_empty());
  }

  #[test]
  fn test_customer_maps_to_users_collection() {
    let mut job = post_job(json!({
      "name": "Trần Văn A",
      "gender": "male",
      "city": "HCM",
    }));
    job.source_table = "customers".to_string();
    job.row_id = 9;

    let doc = mapper().map(&job).unwrap();
    assert_eq!(doc.collection, "users");
    assert_eq!(doc.id, "customers:9");
    assert_eq!(doc.text_field("name"), Some("Trần Văn A"));
    assert!(doc.text_field("bio").is_none());
  }

  #[test]
  fn test_mapping_is_deterministic() {
    let job = post_job(full_post_payload());
    let m = mapper();
    assert_eq!(m.map(&job).unwrap(), m.map(&job).unwrap());
  }
}
