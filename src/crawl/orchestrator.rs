use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::Instrument;
use uuid::Uuid;

use crate::{
    config::Config,
    crawl::{
        sampler::PageSampler,
        worker::{CrawlStats, FetchWorker, WorkQueue},
        writer::PersistenceWriter,
    },
    db::BatchStore,
    error::{AppError, AppResult},
    models::{DiaryEntry, UserId},
    services::LetterboxdClient,
};

/// Summary of one review crawl
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlReport {
    pub users: usize,
    pub pages_fetched: usize,
    pub pages_failed: usize,
    pub entries_queued: usize,
    pub entries_skipped: usize,
    pub reviews_missing: usize,
    pub committed: usize,
    pub batches: usize,
}

/// Runs the review crawl: N fetch workers feeding one persistence writer
pub struct CrawlOrchestrator {
    site: LetterboxdClient,
    sampler: Arc<PageSampler>,
    workers: usize,
    queue_capacity: usize,
    batch_size: usize,
}

impl CrawlOrchestrator {
    pub fn new(
        site: LetterboxdClient,
        sampler: PageSampler,
        workers: usize,
        queue_capacity: usize,
        batch_size: usize,
    ) -> Self {
        Self {
            site,
            sampler: Arc::new(sampler),
            workers: workers.max(1),
            queue_capacity,
            batch_size,
        }
    }

    pub fn from_config(site: LetterboxdClient, config: &Config) -> Self {
        Self::new(
            site,
            PageSampler::new(config.sample_zones.clone(), config.max_diary_pages),
            config.crawl_workers,
            config.queue_capacity,
            config.write_batch_size,
        )
    }

    /// Crawls every user and returns once all queued entries are committed
    ///
    /// Fetch failures only cost the page they hit. A failed commit ends the
    /// run with an error after the workers have stopped.
    pub async fn run<S>(&self, users: Vec<UserId>, store: S) -> AppResult<CrawlReport>
    where
        S: BatchStore<DiaryEntry> + 'static,
    {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("crawl_reviews", run_id = %run_id);

        async move {
            tracing::info!(
                users = users.len(),
                workers = self.workers,
                permits = self.site.fetcher().limiter().max(),
                "Starting review crawl"
            );

            let queue = Arc::new(WorkQueue::new(users));
            let stats = Arc::new(CrawlStats::default());
            let (tx, writer) =
                PersistenceWriter::spawn(store, self.batch_size, self.queue_capacity);

            let handles: Vec<_> = (0..self.workers)
                .map(|id| {
                    let worker = FetchWorker::new(
                        id,
                        self.site.clone(),
                        self.sampler.clone(),
                        queue.clone(),
                        tx.clone(),
                        stats.clone(),
                    );
                    tokio::spawn(worker.run().in_current_span())
                })
                .collect();

            // The writer stops once the last worker drops its sender
            drop(tx);

            for handle in handles {
                if let Err(e) = handle.await {
                    tracing::error!(error = %e, "Fetch worker aborted");
                }
            }

            let written = writer
                .await
                .map_err(|e| AppError::Internal(format!("persistence writer aborted: {}", e)))??;

            let report = CrawlReport {
                users: stats.users.load(Ordering::Relaxed),
                pages_fetched: stats.pages_fetched.load(Ordering::Relaxed),
                pages_failed: stats.pages_failed.load(Ordering::Relaxed),
                entries_queued: stats.entries_queued.load(Ordering::Relaxed),
                entries_skipped: stats.entries_skipped.load(Ordering::Relaxed),
                reviews_missing: stats.reviews_missing.load(Ordering::Relaxed),
                committed: written.committed,
                batches: written.batches,
            };

            tracing::info!(
                users = report.users,
                pages_fetched = report.pages_fetched,
                pages_failed = report.pages_failed,
                committed = report.committed,
                "Review crawl finished"
            );

            Ok(report)
        }
        .instrument(span)
        .await
    }
}
