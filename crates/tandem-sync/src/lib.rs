// Internal modules (not exported)
mod consumer;
mod dead_letter;
mod mapper;
mod reqwestx;
mod retry;

// Public modules
mod config;
pub mod duration;
pub mod embeddings;
mod models;
mod pipeline;
pub mod queue;
pub mod sinks;
mod syncer;

// Re-export only what's needed for the public API
pub use config::*;
pub use consumer::SyncConsumer;
pub use dead_letter::{DeadLetterSink, RedisDeadLetterSink};
pub use mapper::{DocumentMapper, MapError};
pub use models::{
  ChangeJob, DeadLetterEntry, Document, EmbeddedDocument, Operation, ScalarValue, SparseVector,
};
pub use pipeline::{JobStage, StageFailure, SyncError, UpsertPipeline};
pub use retry::RetryPolicy;
pub use syncer::{Syncer, SyncerError};

#[cfg(any(test, feature = "testing"))]
pub use dead_letter::MemoryDeadLetterSink;
