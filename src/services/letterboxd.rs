//! Letterboxd site client
//!
//! Every page goes through the shared fetch limiter, so crawl workers, the
//! ranking engine and lookups all count against the same in-flight cap.
//! Film details and search results are cached in the long-TTL tier.
use std::sync::Arc;

use futures::future::join_all;

use crate::{
    cached,
    db::{Cache, CacheKey},
    error::{AppError, AppResult},
    models::{DiaryRow, FilmId, FilmRecord, ListEntry, SearchHit, UserId},
    services::{
        extractor::{upscale_poster, DiaryLayout, Extractor},
        fetcher::LimitedFetcher,
    },
};

/// Periods of the popular-members directory
pub const POPULAR_PERIODS: [&str; 4] = ["/this/week/", "/this/month/", "/this/year/", "/"];

#[derive(Clone)]
pub struct LetterboxdClient {
    base_url: String,
    fetcher: LimitedFetcher,
    extractor: Arc<dyn Extractor>,
    cache: Cache,
}

impl LetterboxdClient {
    pub fn new(
        base_url: impl Into<String>,
        fetcher: LimitedFetcher,
        extractor: Arc<dyn Extractor>,
        cache: Cache,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            fetcher,
            extractor,
            cache,
        }
    }

    pub fn fetcher(&self) -> &LimitedFetcher {
        &self.fetcher
    }

    pub fn diary_url(&self, user_id: &UserId, page: u32) -> String {
        format!("{}{}diary/films/page/{}/", self.base_url, user_id.path(), page)
    }

    pub fn films_url(&self, user_id: &UserId, page: u32) -> String {
        format!("{}{}films/page/{}/", self.base_url, user_id.path(), page)
    }

    fn absolute(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Rows of one diary page, or `None` when the fetch failed
    pub async fn diary_page(&self, user_id: &UserId, page: u32) -> Option<Vec<DiaryRow>> {
        let html = self.fetcher.get(&self.diary_url(user_id, page)).await?;
        Some(self.extractor.diary_rows(&html, DiaryLayout::Table))
    }

    /// Rows of one page of the user's watched-films grid, or `None` when the
    /// fetch failed
    pub async fn films_page(&self, user_id: &UserId, page: u32) -> Option<Vec<DiaryRow>> {
        let html = self.fetcher.get(&self.films_url(user_id, page)).await?;
        Some(self.extractor.diary_rows(&html, DiaryLayout::Grid))
    }

    /// Full review text behind a diary entry link
    pub async fn review(&self, entry_href: &str) -> Option<String> {
        let html = self.fetcher.get(&self.absolute(entry_href)).await?;
        self.extractor.review_body(&html)
    }

    /// Fetches and extracts one film page, bypassing the cache
    pub async fn fetch_film(&self, film_id: &FilmId) -> AppResult<FilmRecord> {
        let html = self
            .fetcher
            .get(&self.absolute(film_id.as_str()))
            .await
            .ok_or_else(|| AppError::NotFound(format!("film page {}", film_id)))?;

        self.extractor
            .film_details(film_id, &html)
            .ok_or_else(|| AppError::NotFound(format!("film details for {}", film_id)))
    }

    /// Film details through the long-TTL tier
    pub async fn film_details(&self, film_id: &FilmId) -> AppResult<FilmRecord> {
        cached!(
            self.cache,
            CacheKey::Film(film_id.to_string()),
            self.fetch_film(film_id)
        )
    }

    /// Searches films by title and attaches each hit's poster
    ///
    /// Hits whose detail lookup fails are left out.
    pub async fn search(&self, query: &str) -> AppResult<Vec<SearchHit>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(AppError::InvalidInput(
                "Search query cannot be empty".to_string(),
            ));
        }

        cached!(self.cache, CacheKey::Search(query.to_string()), async move {
            let url = format!(
                "{}/s/search/films/{}/",
                self.base_url,
                query.replace(' ', "+")
            );
            let html = self
                .fetcher
                .get(&url)
                .await
                .ok_or_else(|| AppError::NotFound(format!("search results for {}", query)))?;

            let found = self.extractor.search_hits(&html);
            let details = join_all(found.iter().map(|(_, id)| self.film_details(id))).await;

            let hits: Vec<SearchHit> = found
                .into_iter()
                .zip(details)
                .filter_map(|((title, film_id), detail)| match detail {
                    Ok(film) => Some(SearchHit {
                        title,
                        film_id,
                        poster: film.poster.as_deref().map(upscale_poster),
                    }),
                    Err(e) => {
                        tracing::debug!(error = %e, film_id = %film_id, "Dropping search hit");
                        None
                    }
                })
                .collect();

            tracing::info!(query = %query, results = hits.len(), "Film search completed");

            Ok::<_, AppError>(hits)
        })
    }

    /// Entries of a user list
    ///
    /// With `page` set only that page is read; otherwise pages are read until
    /// one comes back empty or `limit` entries are collected.
    pub async fn list(
        &self,
        list_id: &str,
        page: Option<u32>,
        limit: Option<usize>,
    ) -> Vec<ListEntry> {
        let list_path = format!("/{}/", list_id.trim_matches('/'));

        let mut entries = match page {
            Some(page) => self.list_page(&list_path, page).await,
            None => {
                let mut all = Vec::new();
                let mut current = 1;
                loop {
                    if limit.is_some_and(|l| all.len() >= l) {
                        break;
                    }
                    let found = self.list_page(&list_path, current).await;
                    if found.is_empty() {
                        break;
                    }
                    all.extend(found);
                    current += 1;
                }
                all
            }
        };

        if let Some(limit) = limit {
            entries.truncate(limit);
        }
        entries
    }

    async fn list_page(&self, list_path: &str, page: u32) -> Vec<ListEntry> {
        let url = format!("{}{}page/{}/", self.base_url, list_path, page);
        match self.fetcher.get(&url).await {
            Some(html) => self.extractor.list_entries(&html),
            None => Vec::new(),
        }
    }

    /// Members on one page of a popular-members period, or `None` when the
    /// fetch failed
    pub async fn popular_members(&self, period: &str, page: u32) -> Option<Vec<UserId>> {
        let url = format!("{}/members/popular{}page/{}/", self.base_url, period, page);
        let html = self.fetcher.get(&url).await?;
        Some(self.extractor.members(&html))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::extractor::HtmlExtractor;
    use crate::services::fetcher::{FetchLimiter, MockPageFetcher};
    use mockall::predicate::eq;

    fn client(mock: MockPageFetcher, cache: Cache) -> LetterboxdClient {
        LetterboxdClient::new(
            "https://lb.test/",
            LimitedFetcher::new(Arc::new(mock), FetchLimiter::new(4)),
            Arc::new(HtmlExtractor::new()),
            cache,
        )
    }

    fn film_page(name: &str) -> String {
        format!(r#"<section class="details"><h1>{}</h1></section>"#, name)
    }

    #[tokio::test]
    async fn test_urls() {
        let (cache, _handle) = Cache::in_memory(60, 600);
        let site = client(MockPageFetcher::new(), cache);
        let user = UserId::new("dave").unwrap();

        assert_eq!(site.diary_url(&user, 3), "https://lb.test/dave/diary/films/page/3/");
        assert_eq!(site.films_url(&user, 1), "https://lb.test/dave/films/page/1/");
    }

    #[tokio::test]
    async fn test_film_details_cached_after_first_fetch() {
        let mut mock = MockPageFetcher::new();
        mock.expect_fetch()
            .with(eq("https://lb.test/film/alien/"))
            .times(1)
            .returning(|_| Ok(film_page("Alien")));

        let (cache, _handle) = Cache::in_memory(60, 600);
        let site = client(mock, cache.clone());
        let id = FilmId::from_href("/film/alien/").unwrap();

        let first = site.film_details(&id).await.unwrap();
        cache.flush().await.unwrap();
        let second = site.film_details(&id).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(second.name.as_deref(), Some("Alien"));
    }

    #[tokio::test]
    async fn test_failed_film_fetch_is_not_cached() {
        let mut mock = MockPageFetcher::new();
        mock.expect_fetch().times(2).returning(|url| {
            Err(AppError::FetchStatus {
                url: url.to_string(),
                status: 404,
            })
        });

        let (cache, _handle) = Cache::in_memory(60, 600);
        let site = client(mock, cache.clone());
        let id = FilmId::from_href("/film/missing/").unwrap();

        assert!(site.film_details(&id).await.is_err());
        cache.flush().await.unwrap();
        assert!(site.film_details(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_search_enriches_and_drops_failed_hits() {
        let mut mock = MockPageFetcher::new();
        mock.expect_fetch().returning(|url| match url {
            "https://lb.test/s/search/films/the+thing/" => Ok(r#"
                <li class="search-result"><article><div data-item-name="The Thing" data-item-link="/film/the-thing/"></div></article></li>
                <li class="search-result"><article><div data-item-name="The Thing 2011" data-item-link="/film/the-thing-2011/"></div></article></li>
            "#
            .to_string()),
            "https://lb.test/film/the-thing/" => Ok(r#"
                <section class="details"><h1>The Thing</h1></section>
                <ul class="poster-list"><li data-item-slug="the-thing"><div class="film-poster"><img src="https://img/t-0-70-0-105-crop.jpg"></div></li></ul>
            "#
            .to_string()),
            other => Err(AppError::FetchStatus {
                url: other.to_string(),
                status: 503,
            }),
        });

        let (cache, _handle) = Cache::in_memory(60, 600);
        let site = client(mock, cache);

        let hits = site.search(" the thing ").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].film_id.as_str(), "/film/the-thing/");
        assert_eq!(hits[0].poster.as_deref(), Some("https://img/t-0-230-0-345-crop.jpg"));
    }

    #[tokio::test]
    async fn test_empty_search_rejected() {
        let (cache, _handle) = Cache::in_memory(60, 600);
        let site = client(MockPageFetcher::new(), cache);
        assert!(matches!(site.search("  ").await, Err(AppError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_list_reads_until_empty_page() {
        let mut mock = MockPageFetcher::new();
        mock.expect_fetch().returning(|url| {
            let entry = |slug: &str| {
                format!(
                    r#"<li class="posteritem"><div class="react-component" data-item-link="/film/{0}/" data-item-name="{0}"></div></li>"#,
                    slug
                )
            };
            let body = match url {
                "https://lb.test/kim/list/best/page/1/" => entry("a") + &entry("b"),
                "https://lb.test/kim/list/best/page/2/" => entry("c"),
                _ => String::new(),
            };
            Ok(format!(r#"<ul class="js-list-entries">{}</ul>"#, body))
        });

        let (cache, _handle) = Cache::in_memory(60, 600);
        let site = client(mock, cache);

        let all = site.list("kim/list/best", None, None).await;
        assert_eq!(all.len(), 3);

        let limited = site.list("/kim/list/best/", None, Some(2)).await;
        assert_eq!(limited.len(), 2);

        let second = site.list("/kim/list/best/", Some(2), None).await;
        assert_eq!(second[0].title, "c");
    }
}
