use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::db::BatchStore;
use crate::error::{AppError, AppResult};

/// Totals reported by a finished writer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub committed: usize,
    pub batches: usize,
}

/// The single consumer of the persistence queue
///
/// Records are committed in dequeue order, `batch_size` at a time. The loop
/// ends once every sender is dropped and the queue is drained, and the partial
/// buffer is committed then. A failed commit stops the writer: the queue is
/// closed, records still queued behind the batch are drained and dropped, and
/// both counts come back in [`AppError::BatchCommit`].
pub struct PersistenceWriter<T, S> {
    store: S,
    batch_size: usize,
    rx: mpsc::Receiver<T>,
}

impl<T, S> PersistenceWriter<T, S>
where
    T: Send + Sync + 'static,
    S: BatchStore<T> + 'static,
{
    pub fn new(store: S, batch_size: usize, rx: mpsc::Receiver<T>) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            rx,
        }
    }

    /// Creates the bounded queue and starts the writer on it
    ///
    /// Pushing to the returned sender waits while `capacity` records are
    /// already queued.
    pub fn spawn(
        store: S,
        batch_size: usize,
        capacity: usize,
    ) -> (mpsc::Sender<T>, JoinHandle<AppResult<WriterStats>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let writer = Self::new(store, batch_size, rx);
        (tx, tokio::spawn(writer.run()))
    }

    pub async fn run(mut self) -> AppResult<WriterStats> {
        let mut stats = WriterStats::default();
        let mut buffer: Vec<T> = Vec::with_capacity(self.batch_size);

        tracing::info!(batch_size = self.batch_size, "Persistence writer started");

        while let Some(record) = self.rx.recv().await {
            buffer.push(record);
            if buffer.len() >= self.batch_size {
                self.commit(&mut buffer, &mut stats).await?;
            }
        }

        if !buffer.is_empty() {
            self.commit(&mut buffer, &mut stats).await?;
        }

        tracing::info!(
            committed = stats.committed,
            batches = stats.batches,
            "Persistence writer drained"
        );

        Ok(stats)
    }

    async fn commit(&mut self, buffer: &mut Vec<T>, stats: &mut WriterStats) -> AppResult<()> {
        let count = buffer.len();
        if let Err(e) = self.store.upsert_batch(buffer).await {
            self.rx.close();
            let mut dropped = 0;
            while self.rx.try_recv().is_ok() {
                dropped += 1;
            }
            tracing::error!(
                error = %e,
                lost = count,
                dropped,
                "Batch commit failed, stopping writer"
            );
            return Err(AppError::BatchCommit {
                lost: count,
                dropped,
                source: Box::new(e),
            });
        }

        buffer.clear();
        stats.committed += count;
        stats.batches += 1;
        tracing::info!(records = count, total = stats.committed, "Committed batch");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio_test::{assert_pending, assert_ready};

    #[derive(Clone, Default)]
    struct RecordingStore {
        batches: Arc<Mutex<Vec<Vec<u32>>>>,
        fail_on: Option<usize>,
    }

    #[async_trait::async_trait]
    impl BatchStore<u32> for RecordingStore {
        async fn upsert_batch(&self, batch: &[u32]) -> AppResult<()> {
            let mut batches = self.batches.lock().unwrap();
            if self.fail_on == Some(batches.len()) {
                return Err(AppError::Internal("disk full".to_string()));
            }
            batches.push(batch.to_vec());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_batches_in_dequeue_order_with_partial_tail() {
        let store = RecordingStore::default();
        let (tx, handle) = PersistenceWriter::<u32, _>::spawn(store.clone(), 3, 10);

        for i in 0..7 {
            tx.send(i).await.unwrap();
        }
        drop(tx);

        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats, WriterStats { committed: 7, batches: 3 });
        assert_eq!(
            *store.batches.lock().unwrap(),
            vec![vec![0, 1, 2], vec![3, 4, 5], vec![6]]
        );
    }

    #[tokio::test]
    async fn test_commit_failure_is_fatal() {
        let store = RecordingStore {
            fail_on: Some(1),
            ..Default::default()
        };
        let (tx, handle) = PersistenceWriter::<u32, _>::spawn(store.clone(), 2, 10);

        for i in 0..4 {
            tx.send(i).await.unwrap();
        }

        let result = handle.await.unwrap();
        assert!(matches!(
            result,
            Err(AppError::BatchCommit { lost: 2, dropped: 0, .. })
        ));
        assert!(tx.send(99).await.is_err());
        assert_eq!(store.batches.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_commit_drops_and_counts_queued_records() {
        let store = RecordingStore {
            fail_on: Some(0),
            ..Default::default()
        };
        let (tx, rx) = mpsc::channel::<u32>(10);
        for i in 0..6 {
            tx.send(i).await.unwrap();
        }

        let result = PersistenceWriter::new(store.clone(), 2, rx).run().await;

        match result {
            Err(AppError::BatchCommit { lost, dropped, .. }) => {
                assert_eq!(lost, 2);
                assert_eq!(dropped, 4);
            }
            other => panic!("expected a batch commit error, got {:?}", other),
        }
        assert!(store.batches.lock().unwrap().is_empty());
        assert!(tx.send(6).await.is_err());
    }

    #[tokio::test]
    async fn test_full_queue_blocks_producer_until_drained() {
        let (tx, rx) = mpsc::channel::<u32>(5);
        let writer = PersistenceWriter::new(RecordingStore::default(), 100, rx);

        for i in 0..5 {
            tx.send(i).await.unwrap();
        }

        let mut sixth = tokio_test::task::spawn(tx.send(5));
        assert_pending!(sixth.poll());

        let mut rx = writer.rx;
        assert_eq!(rx.recv().await, Some(0));

        assert!(sixth.is_woken());
        assert_ready!(sixth.poll()).unwrap();
    }
}
