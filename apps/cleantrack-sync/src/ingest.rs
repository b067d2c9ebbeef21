mod backoff;
mod subscription;


use crate::error::SourceError;
use crate::model::Category;
use crate::records::RecordBatch;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use std::time::Duration;

pub use backoff::{Backoff, BackoffPolicy};
pub use subscription::{spawn_subscription, SubscriptionHandle};

/// Full-snapshot pushes for one category. The stream ending counts as a dropped connection.
pub type SnapshotStream = BoxStream<'static, Result<RecordBatch, SourceError>>;

pub trait SnapshotSource: Send + Sync + 'static {
    fn subscribe(&self, category: Category) -> BoxFuture<'static, Result<SnapshotStream, SourceError>>;
}

/// What subscription tasks report back to the session. `generation` identifies the
/// subscription so the session can ignore anything from one it already cancelled.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestEvent {
    Connected {
        category: Category,
        generation: u64,
    },
    Snapshot {
        category: Category,
        generation: u64,
        records: RecordBatch,
    },
    Failed {
        category: Category,
        generation: u64,
        attempt: u32,
        retry_in: Duration,
        error: SourceError,
    },
}

impl IngestEvent {
    pub fn category(&self) -> Category {
        match self {
            IngestEvent::Connected { category, .. }
            | IngestEvent::Snapshot { category, .. }
            | IngestEvent::Failed { category, .. } => *category,
        }
    }

    pub fn generation(&self) -> u64 {
        match self {
            IngestEvent::Connected { generation, .. }
            | IngestEvent::Snapshot { generation, .. }
            | IngestEvent::Failed { generation, .. } => *generation,
        }
    }
}
