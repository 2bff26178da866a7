use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::dead_letter::DeadLetterSink;
use crate::pipeline::UpsertPipeline;
use crate::queue::{Delivery, JobQueue, QueueError};

/// Pause after a failed stream read before trying again.
const RECEIVE_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Pulls change jobs from the queue and dispatches them across a bounded
/// pool of sequential lanes. Jobs sharing a (table, row) partition key
/// always land on the same lane, so last-write-wins ordering holds per
/// entity while distinct entities process in parallel. Lane channels are
/// bounded; when every lane buffer is full the dispatch loop blocks, which
/// stops dequeuing instead of buffering unboundedly.
pub struct SyncConsumer {
  queue: Arc<dyn JobQueue>,
  pipeline: Arc<UpsertPipeline>,
  dead_letter: Arc<dyn DeadLetterSink>,
  lane_count: usize,
  lane_capacity: usize,
  batch_size: usize,
  shutdown_grace: Duration,
}

impl SyncConsumer {
  pub fn new(
    config: &Config,
    queue: Arc<dyn JobQueue>,
    pipeline: Arc<UpsertPipeline>,
    dead_letter: Arc<dyn DeadLetterSink>,
  ) -> Self {
    Self {
      queue,
      pipeline,
      dead_letter,
      lane_count: config.workers.count.max(1),
      lane_capacity: config.workers.lane_capacity.max(1),
      batch_size: config.queue.batch_size.max(1),
      shutdown_grace: config.workers.shutdown_grace.inner(),
    }
  }

  /// Stable lane assignment for a partition key.
  fn lane_for(key: (&str, i64), lanes: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % lanes as u64) as usize
  }

  /// Consume until the shutdown token fires. On shutdown, dequeuing stops
  /// immediately, in-flight jobs drain up to the grace period, and whatever
  /// remains is cancelled; unacknowledged messages are redelivered by the
  /// broker.
  pub async fn run(&self, shutdown: CancellationToken) -> Result<(), QueueError> {
    info!(
      lanes = self.lane_count,
      lane_capacity = self.lane_capacity,
      "starting sync consumer"
    );

    let mut lanes: Vec<mpsc::Sender<Delivery>> = Vec::with_capacity(self.lane_count);
    let mut workers = JoinSet::new();
    for lane in 0..self.lane_count {
      let (tx, rx) = mpsc::channel::<Delivery>(self.lane_capacity);
      workers.spawn(lane_worker(
        lane,
        rx,
        self.pipeline.clone(),
        self.queue.clone(),
        self.dead_letter.clone(),
      ));
      lanes.push(tx);
    }

    'dispatch: loop {
      let batch = tokio::select! {
        _ = shutdown.cancelled() => break 'dispatch,
        batch = self.queue.receive(self.batch_size) => batch,
      };

      match batch {
        Ok(deliveries) => {
          for delivery in deliveries {
            let lane = Self::lane_for(delivery.job.partition_key(), self.lane_count);
            tokio::select! {
              // Undispatched deliveries are never acked, so the broker
              // redelivers them after the visibility timeout.
              _ = shutdown.cancelled() => break 'dispatch,
              sent = lanes[lane].send(delivery) => {
                if sent.is_err() {
                  error!(lane, "lane worker exited unexpectedly; stopping consumer");
                  break 'dispatch;
                }
              }
            }
          }
        }
        Err(e) => {
          error!(error = %e, "failed to read from change stream");
          tokio::select! {
            _ = shutdown.cancelled() => break 'dispatch,
            _ = tokio::time::sleep(RECEIVE_RETRY_DELAY) => {}
          }
        }
      }
    }

    info!("dispatch stopped; draining in-flight jobs");
    drop(lanes);

    if timeout(self.shutdown_grace, async {
      while workers.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
      warn!("shutdown grace period elapsed; cancelling remaining jobs for redelivery");
      workers.shutdown().await;
    }

    info!("sync consumer stopped");
    Ok(())
  }
}

async fn lane_worker(
  lane: usize,
  mut rx: mpsc::Receiver<Delivery>,
  pipeline: Arc<UpsertPipeline>,
  queue: Arc<dyn JobQueue>,
  dead_letter: Arc<dyn DeadLetterSink>,
) {
  debug!(lane, "lane worker started");

  while let Some(delivery) = rx.recv().await {
    let job = &delivery.job;

    match pipeline.process(job).await {
      Ok(()) => {
        debug!(
          lane,
          table = %job.source_table,
          row_id = job.row_id,
          operation = %job.operation,
          "job synced"
        );
        ack(&queue, &delivery).await;
      }
      Err(failure) => {
        // A poisoned job must never halt unrelated work: record it and move
        // on. Acknowledging hands responsibility to the dead-letter sink.
        error!(
          lane,
          table = %job.source_table,
          row_id = job.row_id,
          stage = %failure.stage,
          error = %failure.error,
          "job failed permanently, dead-lettering"
        );
        dead_letter
          .record(job, failure.stage, &failure.error.to_string())
          .await;
        ack(&queue, &delivery).await;
      }
    }
  }

  debug!(lane, "lane worker stopped");
}

async fn ack(queue: &Arc<dyn JobQueue>, delivery: &Delivery) {
  if let Err(e) = queue.ack(delivery).await {
    // The broker will redeliver; the idempotent upsert key absorbs the
    // duplicate effect.
    warn!(
      delivery_id = %delivery.delivery_id,
      error = %e,
      "failed to acknowledge delivery"
    );
  }
}
