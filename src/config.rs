use serde::{Deserialize, Deserializer};

use crate::crawl::sampler::SampleZone;

/// Application configuration loaded from environment variables
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// SQLite database connection URL
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// File holding the user ids to crawl, one per line
    #[serde(default = "default_users_path")]
    pub users_path: String,

    /// Pre-trained factor model artifact
    #[serde(default = "default_model_path")]
    pub model_path: String,

    /// Redis connection URL for the short-TTL tier. Falls back to an
    /// in-process store when unset.
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Redis connection URL for the long-TTL tier
    #[serde(default)]
    pub redis_slow_url: Option<String>,

    /// Site base URL
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Per-request timeout, after which the fetch counts as failed
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Global cap on in-flight fetches across every worker
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,

    #[serde(default = "default_crawl_workers")]
    pub crawl_workers: usize,

    /// Bound of the persistence queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_write_batch_size")]
    pub write_batch_size: usize,

    #[serde(default = "default_max_diary_pages")]
    pub max_diary_pages: u32,

    /// Page sampling zones, e.g. `1-5:2,6-30:3,31-:1`
    #[serde(
        default = "default_sample_zones",
        deserialize_with = "deserialize_zones"
    )]
    pub sample_zones: Vec<SampleZone>,

    #[serde(default = "default_film_write_batch_size")]
    pub film_write_batch_size: usize,

    /// Film pages fetched concurrently per group during the detail crawl
    #[serde(default = "default_film_fetch_batch")]
    pub film_fetch_batch: usize,

    /// Popular member pages walked per period during user discovery
    #[serde(default = "default_popular_pages")]
    pub popular_pages: u32,

    /// Diary pages fetched concurrently per window in history mode
    #[serde(default = "default_history_window")]
    pub history_window: u32,

    #[serde(default = "default_confidence_alpha")]
    pub confidence_alpha: f32,

    #[serde(default = "default_history_default_mean")]
    pub history_default_mean: f32,

    #[serde(default = "default_seed_default_mean")]
    pub seed_default_mean: f32,

    #[serde(default = "default_unrated_proxy_factor")]
    pub unrated_proxy_factor: f32,

    #[serde(default = "default_liked_weight")]
    pub liked_weight: f32,

    #[serde(default = "default_seed_rating")]
    pub seed_rating: f32,

    /// Items computed per ranking before pagination
    #[serde(default = "default_rank_limit")]
    pub rank_limit: usize,

    #[serde(default = "default_ranked_page_size")]
    pub ranked_page_size: usize,

    /// TTL of the ranking tier, in seconds
    #[serde(default = "default_short_cache_ttl_secs")]
    pub short_cache_ttl_secs: u64,

    /// TTL of the film detail and search tier, in seconds
    #[serde(default = "default_long_cache_ttl_secs")]
    pub long_cache_ttl_secs: u64,
}

fn default_database_url() -> String {
    "sqlite://data/reviews.db?mode=rwc".to_string()
}

fn default_users_path() -> String {
    "data/users.txt".to_string()
}

fn default_model_path() -> String {
    "model/model.json".to_string()
}

fn default_base_url() -> String {
    "https://letterboxd.com".to_string()
}

fn default_user_agent() -> String {
    "Mozilla/5.0".to_string()
}

fn default_request_timeout_secs() -> u64 {
    15
}

fn default_fetch_concurrency() -> usize {
    20
}

fn default_crawl_workers() -> usize {
    5
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_write_batch_size() -> usize {
    100
}

fn default_max_diary_pages() -> u32 {
    100
}

fn default_sample_zones() -> Vec<SampleZone> {
    SampleZone::defaults()
}

fn default_film_write_batch_size() -> usize {
    25
}

fn default_film_fetch_batch() -> usize {
    5
}

fn default_popular_pages() -> u32 {
    256
}

fn default_history_window() -> u32 {
    10
}

fn default_confidence_alpha() -> f32 {
    40.0
}

fn default_history_default_mean() -> f32 {
    3.0
}

fn default_seed_default_mean() -> f32 {
    2.5
}

fn default_unrated_proxy_factor() -> f32 {
    0.9
}

fn default_liked_weight() -> f32 {
    1.5
}

fn default_seed_rating() -> f32 {
    5.0
}

fn default_rank_limit() -> usize {
    1000
}

fn default_ranked_page_size() -> usize {
    1000
}

fn default_short_cache_ttl_secs() -> u64 {
    360
}

fn default_long_cache_ttl_secs() -> u64 {
    604800 // 1 week
}

fn deserialize_zones<'de, D>(deserializer: D) -> Result<Vec<SampleZone>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    SampleZone::parse_list(&raw).map_err(serde::de::Error::custom)
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let config = envy::from_env::<Config>()
            .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Builds a config from defaults only, ignoring the environment
    pub fn defaults() -> anyhow::Result<Self> {
        envy::from_iter::<_, Config>(std::iter::empty::<(String, String)>())
            .map_err(|e| anyhow::anyhow!("Failed to build default config: {}", e))
    }

    fn validate(&self) -> anyhow::Result<()> {
        let positive = [
            ("FETCH_CONCURRENCY", self.fetch_concurrency),
            ("CRAWL_WORKERS", self.crawl_workers),
            ("QUEUE_CAPACITY", self.queue_capacity),
            ("WRITE_BATCH_SIZE", self.write_batch_size),
            ("FILM_WRITE_BATCH_SIZE", self.film_write_batch_size),
            ("FILM_FETCH_BATCH", self.film_fetch_batch),
            ("RANKED_PAGE_SIZE", self.ranked_page_size),
        ];
        for (name, value) in positive {
            if value == 0 {
                anyhow::bail!("{} must be greater than zero", name);
            }
        }
        if self.history_window == 0 {
            anyhow::bail!("HISTORY_WINDOW must be greater than zero");
        }
        Ok(())
    }

    /// URL of the long-TTL tier, which shares the short tier's server unless
    /// configured separately
    pub fn slow_redis_url(&self) -> Option<&str> {
        self.redis_slow_url.as_deref().or(self.redis_url.as_deref())
    }
}
