use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use tokio::sync::mpsc;

use crate::{
    crawl::sampler::PageSampler,
    error::{AppError, AppResult},
    models::{DiaryEntry, UserId},
    services::LetterboxdClient,
};

/// User ids waiting to be crawled
///
/// Workers pop without waiting; an empty queue means the run is over for
/// that worker.
#[derive(Debug, Default)]
pub struct WorkQueue {
    users: Mutex<VecDeque<UserId>>,
}

impl WorkQueue {
    pub fn new(users: impl IntoIterator<Item = UserId>) -> Self {
        Self {
            users: Mutex::new(users.into_iter().collect()),
        }
    }

    pub fn pop(&self) -> Option<UserId> {
        match self.users.lock() {
            Ok(mut users) => users.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        }
    }

    pub fn len(&self) -> usize {
        match self.users.lock() {
            Ok(users) => users.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Counters shared by every worker of one run
#[derive(Debug, Default)]
pub struct CrawlStats {
    pub users: AtomicUsize,
    pub pages_fetched: AtomicUsize,
    pub pages_failed: AtomicUsize,
    pub entries_queued: AtomicUsize,
    pub entries_skipped: AtomicUsize,
    pub reviews_missing: AtomicUsize,
}

impl CrawlStats {
    fn bump(counter: &AtomicUsize, by: usize) {
        counter.fetch_add(by, Ordering::Relaxed);
    }
}

/// One of the N concurrent crawl tasks
pub struct FetchWorker {
    id: usize,
    site: LetterboxdClient,
    sampler: Arc<PageSampler>,
    queue: Arc<WorkQueue>,
    tx: mpsc::Sender<DiaryEntry>,
    stats: Arc<CrawlStats>,
}

impl FetchWorker {
    pub fn new(
        id: usize,
        site: LetterboxdClient,
        sampler: Arc<PageSampler>,
        queue: Arc<WorkQueue>,
        tx: mpsc::Sender<DiaryEntry>,
        stats: Arc<CrawlStats>,
    ) -> Self {
        Self {
            id,
            site,
            sampler,
            queue,
            tx,
            stats,
        }
    }

    /// Crawls users until the queue is empty or the writer is gone
    pub async fn run(self) {
        while let Some(user_id) = self.queue.pop() {
            CrawlStats::bump(&self.stats.users, 1);
            if let Err(e) = self.crawl_user(&user_id).await {
                tracing::error!(worker = self.id, error = %e, "Stopping fetch worker");
                break;
            }
        }

        tracing::debug!(worker = self.id, "Fetch worker finished");
    }

    async fn crawl_user(&self, user_id: &UserId) -> AppResult<()> {
        let pages = self.sampler.sample();
        tracing::debug!(worker = self.id, user_id = %user_id, pages = ?pages, "Crawling user");

        for page in pages {
            let Some(rows) = self.site.diary_page(user_id, page).await else {
                CrawlStats::bump(&self.stats.pages_failed, 1);
                tracing::warn!(user_id = %user_id, page, "Skipping diary page");
                continue;
            };
            CrawlStats::bump(&self.stats.pages_fetched, 1);

            let reviews = join_all(rows.iter().map(|row| async move {
                if row.reviewed {
                    self.site.review(&row.film_href).await
                } else {
                    None
                }
            }))
            .await;

            for (row, review) in rows.iter().zip(reviews) {
                if row.reviewed && review.is_none() {
                    CrawlStats::bump(&self.stats.reviews_missing, 1);
                }

                let Some(entry) = DiaryEntry::from_row(user_id, row, review) else {
                    CrawlStats::bump(&self.stats.entries_skipped, 1);
                    tracing::debug!(user_id = %user_id, href = %row.film_href, "Skipping row without film link");
                    continue;
                };

                self.tx
                    .send(entry)
                    .await
                    .map_err(|_| AppError::Internal("persistence queue closed".to_string()))?;
                CrawlStats::bump(&self.stats.entries_queued, 1);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawl::sampler::SampleZone;
    use crate::db::Cache;
    use crate::services::fetcher::{FetchLimiter, LimitedFetcher, MockPageFetcher};
    use crate::services::HtmlExtractor;

    fn diary(rows: &[(&str, &str, bool)]) -> String {
        let body: String = rows
            .iter()
            .map(|(href, stars, reviewed)| {
                format!(
                    r#"<tr class="diary-entry-row"><td><h3 class="name"><a href="{}">x</a></h3></td>
                       <td><span class="rating">{}</span></td>{}</tr>"#,
                    href,
                    stars,
                    if *reviewed { r#"<td><span class="icon-review"></span></td>"# } else { "" }
                )
            })
            .collect();
        format!("<table>{}</table>", body)
    }

    fn site(mock: MockPageFetcher) -> LetterboxdClient {
        let (cache, _handle) = Cache::in_memory(60, 600);
        LetterboxdClient::new(
            "https://lb.test",
            LimitedFetcher::new(Arc::new(mock), FetchLimiter::new(2)),
            Arc::new(HtmlExtractor::new()),
            cache,
        )
    }

    #[test]
    fn test_work_queue_pops_in_order() {
        let queue = WorkQueue::new(["a", "b"].iter().filter_map(|u| UserId::new(u)));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().unwrap().name(), "a");
        assert_eq!(queue.pop().unwrap().name(), "b");
        assert!(queue.pop().is_none());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_worker_fetches_reviews_and_skips_unlinked_rows() {
        let mut mock = MockPageFetcher::new();
        mock.expect_fetch().returning(|url| match url {
            "https://lb.test/dave/diary/films/page/1/" => Ok(diary(&[
                ("/dave/film/alien/", "★★★★", true),
                ("/dave/list/not-a-film/", "★", false),
                ("/dave/film/heat/", "★★½", false),
            ])),
            "https://lb.test/dave/film/alien/" => {
                Ok(r#"<div class="js-review-body"><p>  Perfect.</p></div>"#.to_string())
            }
            other => Err(AppError::FetchStatus {
                url: other.to_string(),
                status: 500,
            }),
        });

        let sampler = Arc::new(PageSampler::new(vec![SampleZone::new(1, Some(1), 1)], 1));
        let queue = Arc::new(WorkQueue::new(UserId::new("dave")));
        let stats = Arc::new(CrawlStats::default());
        let (tx, mut rx) = mpsc::channel(16);

        FetchWorker::new(0, site(mock), sampler, queue, tx, stats.clone())
            .run()
            .await;

        let first = rx.recv().await.unwrap();
        assert_eq!(first.film_id.as_str(), "/film/alien/");
        assert_eq!(first.rating, Some(4.0));
        assert_eq!(first.review.as_deref(), Some("Perfect."));

        let second = rx.recv().await.unwrap();
        assert_eq!(second.film_id.as_str(), "/film/heat/");
        assert_eq!(second.rating, Some(2.5));
        assert!(second.review.is_none());

        assert!(rx.recv().await.is_none());
        assert_eq!(stats.entries_queued.load(Ordering::Relaxed), 2);
        assert_eq!(stats.entries_skipped.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_worker_stops_when_queue_closed() {
        let mut mock = MockPageFetcher::new();
        mock.expect_fetch()
            .returning(|_| Ok(diary(&[("/film/alien/", "★", false)])));

        let sampler = Arc::new(PageSampler::new(vec![SampleZone::new(1, Some(1), 1)], 1));
        let users = ["a", "b", "c"].iter().filter_map(|u| UserId::new(u));
        let queue = Arc::new(WorkQueue::new(users));
        let stats = Arc::new(CrawlStats::default());
        let (tx, rx) = mpsc::channel(4);
        drop(rx);

        FetchWorker::new(0, site(mock), sampler, queue.clone(), tx, stats.clone())
            .run()
            .await;

        assert_eq!(stats.users.load(Ordering::Relaxed), 1);
        assert_eq!(queue.len(), 2);
    }
}
