use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::consumer::SyncConsumer;
use crate::dead_letter::RedisDeadLetterSink;
use crate::embeddings::remote::RemoteEmbedder;
use crate::embeddings::EmbeddingError;
use crate::pipeline::UpsertPipeline;
use crate::queue::redis_stream::RedisStreamQueue;
use crate::queue::{JobQueue, QueueError};
use crate::sinks::qdrant::QdrantSink;
use crate::sinks::{IndexError, VectorSink};

/// Error type for public API
#[derive(Debug, thiserror::Error)]
pub enum SyncerError {
  #[error("configuration error: {0}")]
  Config(String),

  #[error("queue error: {0}")]
  Queue(#[from] QueueError),

  #[error("index error: {0}")]
  Index(#[from] IndexError),

  #[error("embedding error: {0}")]
  Embedding(#[from] EmbeddingError),
}

/// Main public interface: wires the queue, the embedding runtime, and the
/// vector index together and runs the consumer until shutdown. All clients
/// are constructed once here and shared read-only with the workers; no
/// ambient globals.
pub struct Syncer {
  config: Arc<Config>,
  queue: Arc<dyn JobQueue>,
  sink: Arc<dyn VectorSink>,
  consumer: SyncConsumer,
  shutdown_token: CancellationToken,
}

impl Syncer {
  /// Construct and verify the external collaborators. Both the queue and
  /// the index must be reachable; without them no useful work can proceed,
  /// so failures here are fatal and surfaced to the operator.
  pub async fn new(config: Config, shutdown_token: CancellationToken) -> Result<Self, SyncerError> {
    config.validate().map_err(SyncerError::Config)?;

    let embedder = Arc::new(RemoteEmbedder::new(&config.embedding)?);
    let sink: Arc<dyn VectorSink> = Arc::new(QdrantSink::new(&config.index)?);

    sink.health().await?;
    info!("vector index reachable");

    sink.ensure_collections(&config.collections).await?;

    let queue: Arc<dyn JobQueue> = Arc::new(RedisStreamQueue::connect(&config.queue).await?);

    let dead_letter = Arc::new(
      RedisDeadLetterSink::connect(&config.queue.url, &config.queue.dead_letter_stream)
        .await
        .map_err(|e| QueueError::Connection(e.to_string()))?,
    );

    let config = Arc::new(config);
    let pipeline = Arc::new(UpsertPipeline::new(&config, embedder, sink.clone()));
    let consumer = SyncConsumer::new(&config, queue.clone(), pipeline, dead_letter);

    Ok(Self {
      config,
      queue,
      sink,
      consumer,
      shutdown_token,
    })
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  /// Consume change jobs until the shutdown token fires.
  pub async fn run(&self) -> Result<(), SyncerError> {
    info!(
      tables = self.config.tables.len(),
      collections = self.config.collections.len(),
      "starting sync service"
    );
    self.consumer.run(self.shutdown_token.clone()).await?;
    Ok(())
  }

  /// Create any missing collections and return. Used by the `init`
  /// subcommand.
  pub async fn init_collections(&self) -> Result<(), SyncerError> {
    self.sink.ensure_collections(&self.config.collections).await?;
    Ok(())
  }

  /// Probe the queue and the index. Used by the `check` subcommand and for
  /// readiness reporting.
  pub async fn check(&self) -> Result<(), SyncerError> {
    self.queue.ping().await?;
    self.sink.health().await?;
    Ok(())
  }
}
