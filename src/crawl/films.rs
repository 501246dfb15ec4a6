use futures::future::join_all;
use tracing::Instrument;
use uuid::Uuid;

use crate::{
    config::Config,
    crawl::writer::PersistenceWriter,
    db::BatchStore,
    error::{AppError, AppResult},
    models::{FilmId, FilmRecord},
    services::LetterboxdClient,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilmCrawlReport {
    pub requested: usize,
    pub fetched: usize,
    pub failed: usize,
    pub committed: usize,
}

/// Fills the films table from the film pages of reviewed films
///
/// Pages are fetched in small concurrent groups through the shared limiter
/// and persisted by the same batched writer the review crawl uses.
pub struct FilmCrawl {
    site: LetterboxdClient,
    fetch_batch: usize,
    write_batch: usize,
    queue_capacity: usize,
}

impl FilmCrawl {
    pub fn new(
        site: LetterboxdClient,
        fetch_batch: usize,
        write_batch: usize,
        queue_capacity: usize,
    ) -> Self {
        Self {
            site,
            fetch_batch: fetch_batch.max(1),
            write_batch,
            queue_capacity,
        }
    }

    pub fn from_config(site: LetterboxdClient, config: &Config) -> Self {
        Self::new(
            site,
            config.film_fetch_batch,
            config.film_write_batch_size,
            config.queue_capacity,
        )
    }

    pub async fn run<S>(&self, film_ids: Vec<FilmId>, store: S) -> AppResult<FilmCrawlReport>
    where
        S: BatchStore<FilmRecord> + 'static,
    {
        let span = tracing::info_span!("crawl_films", run_id = %Uuid::new_v4());

        async move {
            let mut report = FilmCrawlReport {
                requested: film_ids.len(),
                ..Default::default()
            };
            tracing::info!(films = report.requested, "Starting film detail crawl");

            let (tx, writer) =
                PersistenceWriter::spawn(store, self.write_batch, self.queue_capacity);

            'groups: for group in film_ids.chunks(self.fetch_batch) {
                let results = join_all(group.iter().map(|id| self.site.fetch_film(id))).await;

                for (film_id, result) in group.iter().zip(results) {
                    match result {
                        Ok(film) => {
                            report.fetched += 1;
                            if tx.send(film).await.is_err() {
                                tracing::error!("Persistence queue closed, stopping film crawl");
                                break 'groups;
                            }
                        }
                        Err(e) => {
                            report.failed += 1;
                            tracing::warn!(film_id = %film_id, error = %e, "Skipping film");
                        }
                    }
                }
            }

            drop(tx);
            let written = writer
                .await
                .map_err(|e| AppError::Internal(format!("persistence writer aborted: {}", e)))??;
            report.committed = written.committed;

            tracing::info!(
                fetched = report.fetched,
                failed = report.failed,
                committed = report.committed,
                "Film detail crawl finished"
            );

            Ok(report)
        }
        .instrument(span)
        .await
    }
}
