use std::collections::HashSet;
use std::time::Duration;

use futures::stream::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// A queue of resource keys awaiting reconciliation.
///
/// A key is held at most once while waiting. Retries are delayed & bypass deduplication.
pub struct ReconcileQueue {
    tx: mpsc::Sender<String>,
    rx: ReceiverStream<String>,
    /// Keys currently waiting in the queue.
    queued: HashSet<String>,
    /// The delay before a failed key is reconciled again.
    retry_delay: Duration,
}

impl ReconcileQueue {
    /// Create a new instance.
    pub fn new(retry_delay: Duration) -> Self {
        let (tx, rx) = mpsc::channel(100);
        Self {
            tx,
            rx: ReceiverStream::new(rx),
            queued: Default::default(),
            retry_delay,
        }
    }

    /// Enqueue the given key, unless it is already waiting to be reconciled.
    pub fn enqueue(&mut self, key: String) {
        if !self.queued.insert(key.clone()) {
            return;
        }
        self.spawn_send(key, None);
    }

    /// Enqueue the given key again once the retry delay has passed.
    pub fn retry(&self, key: String) {
        self.spawn_send(key, Some(self.retry_delay));
    }

    /// Wait for the next key to reconcile.
    pub async fn next(&mut self) -> Option<String> {
        let key = self.rx.next().await?;
        self.queued.remove(&key);
        Some(key)
    }

    /// Spawn a task which sends the given key to the queue.
    ///
    /// This keeps the owner's loop from dead-locking on its own bounded queue.
    fn spawn_send(&self, key: String, delay: Option<Duration>) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let _res = tx.send(key).await;
        });
    }
}
