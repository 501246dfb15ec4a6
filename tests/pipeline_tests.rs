use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use reelrank::{
    crawl::{CrawlOrchestrator, FilmCrawl, PageSampler, SampleZone},
    db::{create_pool, Cache, FilmStore, ReviewStore},
    models::{FilmId, RankingRequest, UserId},
    ranking::{FactorModel, RankingEngine},
    services::{FetchLimiter, HtmlExtractor, LetterboxdClient, LimitedFetcher, PageFetcher},
    AppError, AppResult, Config,
};

const BASE: &str = "https://lb.test";

/// Serves canned pages; anything else is a 404
#[derive(Default)]
struct FakeSite {
    pages: HashMap<String, String>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeSite {
    fn page(mut self, path: &str, html: impl Into<String>) -> Self {
        self.pages.insert(format!("{}{}", BASE, path), html.into());
        self
    }
}

#[async_trait]
impl PageFetcher for FakeSite {
    async fn fetch(&self, url: &str) -> AppResult<String> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::task::yield_now().await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.pages.get(url).cloned().ok_or_else(|| AppError::FetchStatus {
            url: url.to_string(),
            status: 404,
        })
    }
}

fn diary(rows: &[(&str, &str)]) -> String {
    let rows: String = rows
        .iter()
        .map(|(href, stars)| {
            format!(
                r#"<tr class="diary-entry-row"><td class="name"><a href="{}">x</a></td><td><span class="rating">{}</span></td></tr>"#,
                href, stars
            )
        })
        .collect();
    format!("<table>{}</table>", rows)
}

fn film_page(name: &str) -> String {
    format!(r#"<section class="details"><h1>{}</h1></section>"#, name)
}

fn client(fetcher: Arc<FakeSite>, permits: usize, cache: Cache) -> LetterboxdClient {
    LetterboxdClient::new(
        BASE,
        LimitedFetcher::new(fetcher, FetchLimiter::new(permits)),
        Arc::new(HtmlExtractor::new()),
        cache,
    )
}

fn film(slug: &str) -> FilmId {
    FilmId::from_href(&format!("/film/{}/", slug)).unwrap()
}

#[tokio::test]
async fn test_crawl_then_film_details() {
    let fetcher = Arc::new(
        FakeSite::default()
            .page(
                "/dave/diary/films/page/1/",
                diary(&[("/dave/film/alien/", "★★★★"), ("/dave/film/heat/", "★★")]),
            )
            .page("/dave/diary/films/page/3/", diary(&[("/dave/film/alien/2/", "★★★★★")]))
            .page("/kim/diary/films/page/2/", diary(&[("/kim/film/heat/", "★★★½")]))
            .page("/film/alien/", film_page("Alien"))
            .page("/film/heat/", film_page("Heat")),
    );
    let (cache, cache_handle) = Cache::in_memory(60, 600);
    let site = client(fetcher.clone(), 2, cache);

    let pool = create_pool("sqlite::memory:", 1).await.unwrap();
    let reviews = ReviewStore::new(pool.clone());
    let users = vec![UserId::new("/dave/").unwrap(), UserId::new("kim").unwrap()];
    let sampler = PageSampler::new(vec![SampleZone::new(1, Some(3), 3)], 3);

    let report = CrawlOrchestrator::new(site.clone(), sampler, 3, 5, 2)
        .run(users, reviews.clone())
        .await
        .unwrap();

    assert_eq!(report.users, 2);
    assert_eq!(report.pages_fetched, 3);
    assert_eq!(report.pages_failed, 3);
    assert_eq!(report.committed, 4);
    assert!(fetcher.peak.load(Ordering::SeqCst) <= 2);

    // alien was logged twice by dave; one row remains
    assert_eq!(reviews.count().await.unwrap(), 3);
    let dave = reviews.reviews_for_user("/dave/").await.unwrap();
    assert_eq!(dave.len(), 2);

    let film_ids = reviews.distinct_film_ids().await.unwrap();
    assert_eq!(film_ids, vec![film("alien"), film("heat")]);

    let film_report = FilmCrawl::new(site, 5, 25, 10)
        .run(film_ids, FilmStore::new(pool.clone()))
        .await
        .unwrap();
    assert_eq!(film_report.committed, 2);
    let heat: Option<String> = sqlx::query_scalar("SELECT name FROM films WHERE id = ?")
        .bind("/film/heat/")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(heat.as_deref(), Some("Heat"));

    cache_handle.shutdown().await;
}

#[tokio::test]
async fn test_seed_ranking_is_stable_across_cache_hits() {
    let model = FactorModel::from_json(
        r#"{
            "regularization": 0.1,
            "items": ["/film/a/", "/film/b/", "/film/c/", "/film/d/", "/film/e/"],
            "item_factors": [[1.0, 0.0], [0.8, 0.2], [0.0, 1.0], [0.3, 0.7], [0.6, 0.4]]
        }"#,
    )
    .unwrap();

    let (cache, cache_handle) = Cache::in_memory(60, 600);
    let site = client(Arc::new(FakeSite::default()), 4, cache.clone());
    let engine = RankingEngine::new(
        Arc::new(model),
        site,
        cache.clone(),
        &Config::defaults().unwrap(),
    );

    let mut request = RankingRequest::for_seeds(vec![film("a"), film("b")], 1);
    request.k = Some(5);

    let first = engine.get_ranked(&request).await;
    cache.flush().await.unwrap();
    let second = engine.get_ranked(&request).await;

    assert_eq!(first, second);
    assert_eq!(first.len(), 3);
    assert_eq!(first[0], film("e"));
    assert!(!first.contains(&film("a")) && !first.contains(&film("b")));

    cache_handle.shutdown().await;
}
