use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use tracing::{error, info, warn};

use super::{Delivery, JobQueue, QueueError};
use crate::config::QueueConfig;
use crate::models::ChangeJob;

/// Change-notification queue backed by Redis Streams with a consumer group.
/// Messages carry the JSON-encoded job in their `value` entry field (the
/// shape the CDC sink writes). Unacknowledged messages are redelivered by
/// the broker, so nothing here needs a negative acknowledgment.
pub struct RedisStreamQueue {
  conn: ConnectionManager,
  streams: Vec<String>,
  group: String,
  consumer: String,
  block_ms: usize,
}

impl RedisStreamQueue {
  /// Connect, verify the server responds, and create the consumer group on
  /// every stream (tolerating groups that already exist).
  pub async fn connect(config: &QueueConfig) -> Result<Self, QueueError> {
    let client = redis::Client::open(config.url.as_str())
      .map_err(|e| QueueError::Connection(e.to_string()))?;
    let conn = ConnectionManager::new(client)
      .await
      .map_err(|e| QueueError::Connection(e.to_string()))?;

    let queue = Self {
      conn,
      streams: config.streams.clone(),
      group: config.group.clone(),
      consumer: config.consumer.clone(),
      block_ms: config.block.inner().as_millis() as usize,
    };

    queue.ping().await?;
    queue.create_groups().await?;

    info!(
      streams = ?queue.streams,
      group = %queue.group,
      consumer = %queue.consumer,
      "connected to change stream"
    );
    Ok(queue)
  }

  async fn create_groups(&self) -> Result<(), QueueError> {
    let mut conn = self.conn.clone();
    for stream in &self.streams {
      let created: Result<(), redis::RedisError> = conn
        .xgroup_create_mkstream(stream.as_str(), self.group.as_str(), "0")
        .await;

      match created {
        Ok(()) => info!(stream = %stream, group = %self.group, "created consumer group"),
        Err(e) if e.to_string().contains("BUSYGROUP") => {
          info!(stream = %stream, group = %self.group, "consumer group already exists");
        }
        Err(e) => return Err(QueueError::Backend(e.to_string())),
      }
    }
    Ok(())
  }

  fn decode_entry(
    stream: &str,
    delivery_id: &str,
    entry: &redis::streams::StreamId,
  ) -> Result<ChangeJob, QueueError> {
    let raw: String = entry.get("value").ok_or_else(|| {
      QueueError::Decode(format!(
        "stream {} entry {} has no value field",
        stream, delivery_id
      ))
    })?;

    serde_json::from_str(&raw).map_err(|e| {
      QueueError::Decode(format!(
        "stream {} entry {}: {} (payload: {})",
        stream, delivery_id, e, raw
      ))
    })
  }
}

#[async_trait::async_trait]
impl JobQueue for RedisStreamQueue {
  async fn receive(&self, max: usize) -> Result<Vec<Delivery>, QueueError> {
    let mut conn = self.conn.clone();

    let options = StreamReadOptions::default()
      .group(&self.group, &self.consumer)
      .count(max)
      .block(self.block_ms);

    let keys: Vec<&str> = self.streams.iter().map(String::as_str).collect();
    let ids = vec![">"; keys.len()];

    let reply: StreamReadReply = conn
      .xread_options(&keys, &ids, &options)
      .await
      .map_err(|e| QueueError::Backend(e.to_string()))?;

    let mut deliveries = Vec::new();
    for stream_key in reply.keys {
      for entry in stream_key.ids {
        match Self::decode_entry(&stream_key.key, &entry.id, &entry) {
          Ok(job) => deliveries.push(Delivery {
            stream: stream_key.key.clone(),
            delivery_id: entry.id.clone(),
            job,
          }),
          Err(e) => {
            // A payload that cannot be decoded can never be processed;
            // redelivering it would poison the consumer forever. Log the
            // raw entry and acknowledge it to take it out of rotation.
            error!(error = %e, "dropping undecodable change event");
            let acked: Result<i64, redis::RedisError> = conn
              .xack(
                stream_key.key.as_str(),
                self.group.as_str(),
                &[entry.id.as_str()],
              )
              .await;
            if let Err(ack_err) = acked {
              warn!(error = %ack_err, "failed to ack undecodable change event");
            }
          }
        }
      }
    }

    Ok(deliveries)
  }

  async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
    let mut conn = self.conn.clone();
    let _: i64 = conn
      .xack(
        delivery.stream.as_str(),
        self.group.as_str(),
        &[delivery.delivery_id.as_str()],
      )
      .await
      .map_err(|e| QueueError::Backend(e.to_string()))?;
    Ok(())
  }

  async fn ping(&self) -> Result<(), QueueError> {
    let mut conn = self.conn.clone();
    let pong: String = redis::cmd("PING")
      .query_async(&mut conn)
      .await
      .map_err(|e| QueueError::Connection(e.to_string()))?;
    if pong == "PONG" {
      Ok(())
    } else {
      Err(QueueError::Connection(format!(
        "unexpected ping response: {}",
        pong
      )))
    }
  }
}
