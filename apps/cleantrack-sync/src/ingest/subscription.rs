use super::{BackoffPolicy, IngestEvent, SnapshotSource};
use crate::error::SourceError;
use crate::model::Category;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct SubscriptionHandle {
    category: Category,
    generation: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn category(&self) -> Category {
        self.category
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Stops the task. Events it already queued carry the old generation and are ignored
    /// by the session.
    pub fn cancel(self) {
        self.cancel.cancel();
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

pub fn spawn_subscription(
    source: Arc<dyn SnapshotSource>,
    category: Category,
    generation: u64,
    policy: BackoffPolicy,
    events: mpsc::UnboundedSender<IngestEvent>,
) -> SubscriptionHandle {
    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();
    let task = tokio::spawn(async move {
        run_subscription(source, category, generation, policy, events, task_cancel).await;
        tracing::debug!(category = %category, generation, "subscription task finished");
    });
    SubscriptionHandle {
        category,
        generation,
        cancel,
        task,
    }
}

async fn run_subscription(
    source: Arc<dyn SnapshotSource>,
    category: Category,
    generation: u64,
    policy: BackoffPolicy,
    events: mpsc::UnboundedSender<IngestEvent>,
    cancel: CancellationToken,
) {
    let mut backoff = policy.start();

    loop {
        let opened = tokio::select! {
            _ = cancel.cancelled() => return,
            opened = source.subscribe(category) => opened,
        };

        let failure = match opened {
            Ok(mut stream) => {
                tracing::info!(category = %category, generation, "subscribed to change stream");
                if events
                    .send(IngestEvent::Connected {
                        category,
                        generation,
                    })
                    .is_err()
                {
                    return;
                }

                loop {
                    let next = tokio::select! {
                        _ = cancel.cancelled() => return,
                        next = stream.next() => next,
                    };
                    match next {
                        Some(Ok(records)) => {
                            // Only a delivered snapshot proves the connection is healthy.
                            backoff.reset();
                            tracing::trace!(category = %category, records = records.len(), "snapshot pushed");
                            if events
                                .send(IngestEvent::Snapshot {
                                    category,
                                    generation,
                                    records,
                                })
                                .is_err()
                            {
                                return;
                            }
                        }
                        Some(Err(err)) => break err,
                        None => break SourceError::Closed,
                    }
                }
            }
            Err(err) => err,
        };

        let retry_in = backoff.next_delay();
        let attempt = backoff.attempt();
        tracing::warn!(
            category = %category,
            error = %failure,
            attempt,
            retry_in_ms = retry_in.as_millis() as u64,
            "change stream dropped; resubscribing"
        );
        if events
            .send(IngestEvent::Failed {
                category,
                generation,
                attempt,
                retry_in,
                error: failure,
            })
            .is_err()
        {
            return;
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(retry_in) => {}
        }
    }
}
