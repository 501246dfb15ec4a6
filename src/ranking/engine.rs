use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;

use crate::{
    config::Config,
    db::{Cache, CacheKey},
    models::{FilmId, RankedList, RankingRequest, RankingTarget, UserId},
    ranking::model::FactorModel,
    services::LetterboxdClient,
};

const MEAN_EPSILON: f32 = 1e-9;

/// Constants of the confidence weighting
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoringParams {
    pub alpha: f32,
    pub history_default_mean: f32,
    pub seed_default_mean: f32,
    pub unrated_proxy_factor: f32,
    pub liked_weight: f32,
    pub seed_rating: f32,
}

impl ScoringParams {
    pub fn from_config(config: &Config) -> Self {
        Self {
            alpha: config.confidence_alpha,
            history_default_mean: config.history_default_mean,
            seed_default_mean: config.seed_default_mean,
            unrated_proxy_factor: config.unrated_proxy_factor,
            liked_weight: config.liked_weight,
            seed_rating: config.seed_rating,
        }
    }
}

/// One known film as scoring input
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Interaction {
    pub index: usize,
    /// 0 when unrated
    pub rating: f32,
    pub liked: bool,
}

/// Mean of the positive ratings, or `default` when there are none
pub fn positive_mean(interactions: &[Interaction], default: f32) -> f32 {
    let rated: Vec<f32> = interactions
        .iter()
        .map(|i| i.rating)
        .filter(|r| *r > 0.0)
        .collect();
    if rated.is_empty() {
        default
    } else {
        rated.iter().sum::<f32>() / rated.len() as f32
    }
}

/// Turns ratings and likes into per-item confidences around `mean`
///
/// Unrated items stand in at `mean * unrated_proxy_factor`.
pub fn confidence_weights(
    interactions: &[Interaction],
    mean: f32,
    params: &ScoringParams,
) -> Vec<(usize, f32)> {
    let proxy = mean * params.unrated_proxy_factor;

    interactions
        .iter()
        .map(|i| {
            let rating = if i.rating > 0.0 { i.rating } else { proxy };
            let ratio = rating / (mean + MEAN_EPSILON);
            let liked = if i.liked { 1.0 } else { 0.0 };
            let raw = 1.0 + ratio + params.liked_weight * liked;
            (i.index, 1.0 + params.alpha * raw)
        })
        .collect()
}

/// Ranks unseen films for a user's diary or a seed list
pub struct RankingEngine {
    model: Arc<FactorModel>,
    site: LetterboxdClient,
    cache: Cache,
    params: ScoringParams,
    rank_limit: usize,
    page_size: usize,
    history_window: u32,
}

impl RankingEngine {
    pub fn new(
        model: Arc<FactorModel>,
        site: LetterboxdClient,
        cache: Cache,
        config: &Config,
    ) -> Self {
        Self {
            model,
            site,
            cache,
            params: ScoringParams::from_config(config),
            rank_limit: config.rank_limit,
            page_size: config.ranked_page_size.max(1),
            history_window: config.history_window.max(1),
        }
    }

    /// Every film on the user's watched pages, first sighting wins
    ///
    /// Pages are read a window at a time until a window brings nothing new.
    pub async fn gather_history(&self, user_id: &UserId) -> Vec<(FilmId, f32, bool)> {
        let mut seen = HashSet::new();
        let mut history = Vec::new();
        let mut first_page = 1;

        loop {
            let window = first_page..first_page + self.history_window;
            let pages = join_all(window.map(|page| self.site.films_page(user_id, page))).await;

            let mut added = 0;
            for row in pages.into_iter().flatten().flatten() {
                let Some(film_id) = FilmId::from_href(&row.film_href) else {
                    continue;
                };
                if seen.insert(film_id.clone()) {
                    history.push((film_id, row.rating.unwrap_or(0.0).max(0.0), row.liked));
                    added += 1;
                }
            }

            if added == 0 {
                break;
            }
            first_page += self.history_window;
        }

        tracing::debug!(user_id = %user_id, films = history.len(), "Gathered history");
        history
    }

    fn known_interactions(&self, films: &[(FilmId, f32, bool)]) -> Vec<Interaction> {
        films
            .iter()
            .filter_map(|(film_id, rating, liked)| {
                self.model.index_of(film_id).map(|index| Interaction {
                    index,
                    rating: *rating,
                    liked: *liked,
                })
            })
            .collect()
    }

    fn score(&self, interactions: &[Interaction], mean: f32) -> Vec<FilmId> {
        let weights = confidence_weights(interactions, mean, &self.params);
        self.model
            .recommend(&weights, self.rank_limit)
            .into_iter()
            .filter_map(|(index, _)| self.model.film_at(index).cloned())
            .collect()
    }

    /// Ranking from the user's own history; empty with fewer than two known films
    pub async fn rank_user(&self, user_id: &UserId) -> Vec<FilmId> {
        let history = self.gather_history(user_id).await;
        let known = self.known_interactions(&history);

        if known.len() < 2 {
            tracing::info!(
                user_id = %user_id,
                films = history.len(),
                known = known.len(),
                "Not enough history to rank"
            );
            return Vec::new();
        }

        let mean = positive_mean(&known, self.params.history_default_mean);
        self.score(&known, mean)
    }

    /// Ranking from seed films treated as top-rated and liked
    pub fn rank_seeds(&self, seeds: &[FilmId]) -> Vec<FilmId> {
        let films: Vec<(FilmId, f32, bool)> = dedup_seeds(seeds)
            .into_iter()
            .map(|film_id| (film_id, self.params.seed_rating, true))
            .collect();
        let known = self.known_interactions(&films);

        if known.is_empty() {
            tracing::info!(seeds = seeds.len(), "No known seed films to rank from");
            return Vec::new();
        }

        self.score(&known, self.params.seed_default_mean)
    }

    /// The full ranked list for a target, through the short-TTL tier
    ///
    /// Empty rankings are returned but not cached.
    pub async fn ranked_list(&self, target: &RankingTarget) -> RankedList {
        let key = match target {
            RankingTarget::User(user_id) => CacheKey::RankedByUser(user_id.name().to_string()),
            RankingTarget::Seeds(seeds) => CacheKey::RankedBySeeds(dedup_seeds(seeds)),
        };

        if let Some(cached) = self.cache.get_from_cache::<RankedList>(&key).await {
            tracing::debug!(
                key = %key,
                computed_at = %cached.computed_at,
                "Ranking served from cache"
            );
            return cached;
        }

        let films = match target {
            RankingTarget::User(user_id) => self.rank_user(user_id).await,
            RankingTarget::Seeds(seeds) => self.rank_seeds(seeds),
        };
        let list = RankedList::new(films);

        if !list.films.is_empty() {
            self.cache.set_in_background(&key, &list);
        }
        tracing::info!(key = %key, films = list.films.len(), "Computed ranking");

        list
    }

    /// One page of the ranking, cut to `k` when given
    pub async fn get_ranked(&self, request: &RankingRequest) -> Vec<FilmId> {
        let list = self.ranked_list(&request.target).await;
        let mut page = list.page(request.page, self.page_size);
        if let Some(k) = request.k {
            page.truncate(k);
        }
        page
    }
}

fn dedup_seeds(seeds: &[FilmId]) -> Vec<FilmId> {
    let mut seen = HashSet::new();
    seeds
        .iter()
        .filter(|id| seen.insert((*id).clone()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::services::fetcher::{FetchLimiter, LimitedFetcher, MockPageFetcher};
    use crate::services::HtmlExtractor;
    use ndarray::array;

    fn film(slug: &str) -> FilmId {
        FilmId::from_href(&format!("/film/{}/", slug)).unwrap()
    }

    fn params() -> ScoringParams {
        ScoringParams::from_config(&Config::defaults().unwrap())
    }

    fn model() -> Arc<FactorModel> {
        let items = ["a", "b", "c", "d", "e", "f"].iter().map(|s| film(s)).collect();
        let factors = array![
            [1.0, 0.0, 0.1],
            [0.9, 0.1, 0.0],
            [0.0, 1.0, 0.2],
            [0.1, 0.9, 0.1],
            [0.2, 0.2, 1.0],
            [0.5, 0.4, 0.3]
        ];
        Arc::new(FactorModel::new(items, factors, 0.1).unwrap())
    }

    fn grid(films: &[(&str, &str)]) -> String {
        let items: String = films
            .iter()
            .map(|(slug, stars)| {
                format!(
                    r#"<li class="griditem"><div class="react-component" data-item-link="/film/{}/"></div>
                       <p class="poster-viewingdata"><span class="rating">{}</span></p></li>"#,
                    slug, stars
                )
            })
            .collect();
        format!(r#"<ul class="grid">{}</ul>"#, items)
    }

    fn engine(mock: MockPageFetcher) -> (RankingEngine, Cache) {
        let (cache, _handle) = Cache::in_memory(60, 600);
        let site = LetterboxdClient::new(
            "https://lb.test",
            LimitedFetcher::new(Arc::new(mock), FetchLimiter::new(4)),
            Arc::new(HtmlExtractor::new()),
            cache.clone(),
        );
        let mut config = Config::defaults().unwrap();
        config.history_window = 2;
        (RankingEngine::new(model(), site, cache.clone(), &config), cache)
    }

    fn no_pages() -> MockPageFetcher {
        let mut mock = MockPageFetcher::new();
        mock.expect_fetch().returning(|url| {
            Err(AppError::FetchStatus {
                url: url.to_string(),
                status: 404,
            })
        });
        mock
    }

    #[test]
    fn test_confidence_weights() {
        let params = params();
        let interactions = [
            Interaction { index: 0, rating: 4.0, liked: true },
            Interaction { index: 1, rating: 2.0, liked: false },
            Interaction { index: 2, rating: 0.0, liked: false },
        ];
        let mean = positive_mean(&interactions, params.history_default_mean);
        assert!((mean - 3.0).abs() < 1e-6);

        let weights = confidence_weights(&interactions, mean, &params);
        let expected = [
            1.0 + 40.0 * (1.0 + 4.0 / 3.0 + 1.5),
            1.0 + 40.0 * (1.0 + 2.0 / 3.0),
            1.0 + 40.0 * (1.0 + 0.9),
        ];
        for ((index, weight), (i, want)) in weights.iter().zip(expected.iter().enumerate()) {
            assert_eq!(*index, i);
            assert!((weight - want).abs() < 1e-3, "{} vs {}", weight, want);
        }
    }

    #[test]
    fn test_positive_mean_defaults_without_ratings() {
        let unrated = [Interaction { index: 0, rating: 0.0, liked: true }];
        assert_eq!(positive_mean(&unrated, 3.0), 3.0);
    }

    #[tokio::test]
    async fn test_seed_ranking_excludes_seeds_and_unknown_films() {
        let (engine, _cache) = engine(no_pages());
        let seeds = vec![film("a"), film("unknown"), film("c"), film("a")];

        let ranked = engine.rank_seeds(&seeds);
        assert_eq!(ranked.len(), 4);
        assert!(!ranked.contains(&film("a")));
        assert!(!ranked.contains(&film("c")));
    }

    #[tokio::test]
    async fn test_seed_ranking_repeat_is_identical() {
        let (engine, cache) = engine(no_pages());
        let request = RankingRequest {
            target: RankingTarget::Seeds(vec![film("a"), film("b")]),
            k: Some(5),
            page: 1,
        };

        let first = engine.get_ranked(&request).await;
        cache.flush().await.unwrap();
        let key = CacheKey::RankedBySeeds(vec![film("a"), film("b")]);
        let cached: RankedList = cache.get_from_cache(&key).await.unwrap();
        let second = engine.get_ranked(&request).await;

        assert_eq!(first, second);
        assert_eq!(first, cached.films);
        assert!(first.len() <= 5);
        assert!(!first.contains(&film("a")) && !first.contains(&film("b")));
    }

    #[tokio::test]
    async fn test_seed_cache_key_uses_first_occurrence_order_without_repeats() {
        let (engine, cache) = engine(no_pages());
        let request = RankingRequest::for_seeds(vec![film("a"), film("b"), film("a")], 1);

        let ranked = engine.get_ranked(&request).await;
        cache.flush().await.unwrap();

        let key = CacheKey::RankedBySeeds(vec![film("a"), film("b")]);
        assert_eq!(key.to_string(), "ranked_seeds:/film/a/-/film/b/");
        let cached: RankedList = cache.get_from_cache(&key).await.unwrap();
        assert_eq!(cached.films, ranked);

        let repeated = CacheKey::RankedBySeeds(vec![film("a"), film("b"), film("a")]);
        assert!(cache.get_from_cache::<RankedList>(&repeated).await.is_none());
    }

    #[tokio::test]
    async fn test_cache_hit_keeps_original_computed_at() {
        let (engine, cache) = engine(no_pages());
        let target = RankingTarget::Seeds(vec![film("c"), film("d")]);

        let computed = engine.ranked_list(&target).await;
        cache.flush().await.unwrap();
        let served = engine.ranked_list(&target).await;

        assert_eq!(served.computed_at, computed.computed_at);
        assert_eq!(served.films, computed.films);
    }

    #[tokio::test]
    async fn test_no_known_seeds_gives_empty_uncached_ranking() {
        let (engine, cache) = engine(no_pages());
        let request = RankingRequest::for_seeds(vec![film("nope")], 1);

        assert!(engine.get_ranked(&request).await.is_empty());
        cache.flush().await.unwrap();
        let key = CacheKey::RankedBySeeds(vec![film("nope")]);
        assert!(cache.get_from_cache::<RankedList>(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_user_ranking_from_history_windows() {
        let mut mock = MockPageFetcher::new();
        mock.expect_fetch().returning(|url| match url {
            "https://lb.test/dave/films/page/1/" => Ok(grid(&[("a", "★★★★★"), ("zzz", "★")])),
            "https://lb.test/dave/films/page/2/" => Ok(grid(&[("b", "★★★★")])),
            "https://lb.test/dave/films/page/3/" => Ok(grid(&[("a", "★★★★★")])),
            _ => Ok(grid(&[])),
        });
        let (engine, _cache) = engine(mock);
        let dave = UserId::new("dave").unwrap();

        let history = engine.gather_history(&dave).await;
        let films: Vec<&str> = history.iter().map(|(f, _, _)| f.as_str()).collect();
        assert_eq!(films, vec!["/film/a/", "/film/zzz/", "/film/b/"]);

        let ranked = engine.get_ranked(&RankingRequest::for_user(dave, 1)).await;
        assert_eq!(ranked.len(), 4);
        assert!(!ranked.contains(&film("a")) && !ranked.contains(&film("b")));
        assert_eq!(ranked[0], film("f"));
    }

    #[tokio::test]
    async fn test_user_with_one_known_film_gets_nothing() {
        let mut mock = MockPageFetcher::new();
        mock.expect_fetch().returning(|url| match url {
            "https://lb.test/kim/films/page/1/" => Ok(grid(&[("a", "★★★"), ("zzz", "★★")])),
            _ => Ok(grid(&[])),
        });
        let (engine, _cache) = engine(mock);

        let ranked = engine
            .get_ranked(&RankingRequest::for_user(UserId::new("kim").unwrap(), 1))
            .await;
        assert!(ranked.is_empty());
    }

    #[tokio::test]
    async fn test_pages_past_the_end_are_empty() {
        let (engine, _cache) = engine(no_pages());
        let request = RankingRequest::for_seeds(vec![film("a")], 2);
        assert!(engine.get_ranked(&request).await.is_empty());
    }
}
