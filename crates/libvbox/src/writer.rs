//! Ordered write-through queue from a box's cache to object storage.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use vbox_protocol::{BoxId, FileId};

use crate::error::VboxError;
use crate::store::ObjectStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreWrite {
    Put { key: FileId, body: String },
    Delete { key: FileId },
}

impl StoreWrite {
    pub fn key(&self) -> &str {
        match self {
            StoreWrite::Put { key, .. } | StoreWrite::Delete { key } => key,
        }
    }
}

type Ack = oneshot::Sender<Result<(), VboxError>>;

struct Job {
    write: StoreWrite,
    ack: Option<Ack>,
}

/// Applies one box's writes in submission order on a dedicated task.
///
/// The task drains everything already queued before exiting once the last
/// handle is dropped, so fire-and-forget saves survive session release.
pub struct StoreWriter {
    tx: mpsc::UnboundedSender<Job>,
}

impl StoreWriter {
    pub fn spawn(box_id: BoxId, store: Arc<dyn ObjectStore>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(box_id, store, rx));
        Self { tx }
    }

    /// Queue a write whose outcome is only logged.
    pub fn enqueue(&self, write: StoreWrite) {
        if self.tx.send(Job { write, ack: None }).is_err() {
            warn!("store writer stopped, dropping write");
        }
    }

    /// Queue a write and get a receiver for its outcome.
    pub fn submit(&self, write: StoreWrite) -> oneshot::Receiver<Result<(), VboxError>> {
        let (ack, rx) = oneshot::channel();
        if let Err(mpsc::error::SendError(job)) = self.tx.send(Job {
            write,
            ack: Some(ack),
        }) && let Some(ack) = job.ack
        {
            let _ = ack.send(Err(VboxError::UpstreamUnavailable(
                "store writer stopped".into(),
            )));
        }
        rx
    }

    /// Queue a write and wait until storage has applied it.
    pub async fn write(&self, write: StoreWrite) -> Result<(), VboxError> {
        settle(self.submit(write)).await
    }
}

/// Outcome of a submitted write.
pub async fn settle(rx: oneshot::Receiver<Result<(), VboxError>>) -> Result<(), VboxError> {
    rx.await
        .unwrap_or_else(|_| Err(VboxError::UpstreamUnavailable("store writer stopped".into())))
}

async fn run_writer(box_id: BoxId, store: Arc<dyn ObjectStore>, mut rx: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = rx.recv().await {
        let result = match &job.write {
            StoreWrite::Put { key, body } => store.put(key, body).await,
            StoreWrite::Delete { key } => store.delete(key).await,
        };
        match &result {
            Ok(()) => debug!(box_id = %box_id, key = job.write.key(), "store write applied"),
            Err(e) => warn!(box_id = %box_id, key = job.write.key(), "store write failed: {e}"),
        }
        if let Some(ack) = job.ack {
            let _ = ack.send(result);
        }
    }
    debug!(box_id = %box_id, "store writer drained");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryObjectStore;

    #[tokio::test]
    async fn writes_apply_in_order() {
        let store = Arc::new(MemoryObjectStore::new());
        let writer = StoreWriter::spawn("b1".into(), store.clone());
        writer.enqueue(StoreWrite::Put {
            key: "projects/b1/a.ts".into(),
            body: "one".into(),
        });
        writer.enqueue(StoreWrite::Put {
            key: "projects/b1/a.ts".into(),
            body: "two".into(),
        });
        writer
            .write(StoreWrite::Delete {
                key: "projects/b1/b.ts".into(),
            })
            .await
            .unwrap();
        assert_eq!(store.body("projects/b1/a.ts").as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn failures_reach_the_submitter() {
        let store = Arc::new(MemoryObjectStore::new());
        store.fail_deletes_of("projects/b1/a.ts");
        let writer = StoreWriter::spawn("b1".into(), store.clone());
        let err = writer
            .write(StoreWrite::Delete {
                key: "projects/b1/a.ts".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, VboxError::UpstreamUnavailable(_)));
    }

    #[tokio::test]
    async fn queued_saves_flush_after_drop() {
        let store = Arc::new(MemoryObjectStore::new());
        let writer = StoreWriter::spawn("b1".into(), store.clone());
        let last = writer.submit(StoreWrite::Put {
            key: "projects/b1/a.ts".into(),
            body: "late".into(),
        });
        drop(writer);
        settle(last).await.unwrap();
        assert_eq!(store.body("projects/b1/a.ts").as_deref(), Some("late"));
    }
}
