use redis::AsyncCommands;
use redis::Client;
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

use crate::config::Config;
use crate::error::AppError;
use crate::error::AppResult;
use crate::models::FilmId;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    RankedByUser(String),
    /// Seeds without repeats, in first-occurrence order
    RankedBySeeds(Vec<FilmId>),
    Film(String),
    Search(String),
}

/// Which store a key lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    /// Ranking results, minutes to hours
    Short,
    /// Film details and search results, about a week
    Long,
}

impl CacheKey {
    pub fn tier(&self) -> CacheTier {
        match self {
            CacheKey::RankedByUser(_) | CacheKey::RankedBySeeds(_) => CacheTier::Short,
            CacheKey::Film(_) | CacheKey::Search(_) => CacheTier::Long,
        }
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheKey::RankedByUser(user_id) => write!(f, "ranked:{}", user_id),
            CacheKey::RankedBySeeds(seeds) => {
                let joined: Vec<&str> = seeds.iter().map(FilmId::as_str).collect();
                write!(f, "ranked_seeds:{}", joined.join("-"))
            }
            CacheKey::Film(film_id) => write!(f, "film:{}", film_id),
            CacheKey::Search(query) => write!(f, "search:{}", query),
        }
    }
}

/// Opens a Redis client for one cache tier
///
/// Connections are multiplexed and opened per call, so an unreachable server
/// only turns lookups into misses.
pub fn create_redis_client(redis_url: &str) -> anyhow::Result<Client> {
    let client = Client::open(redis_url)?;
    Ok(client)
}

/// A TTL-keyed string store
#[async_trait::async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> AppResult<Option<String>>;

    async fn set(&self, key: &str, value: String, ttl_secs: u64) -> AppResult<()>;
}

/// Redis-backed tier; expiry is delegated to `SET EX`
pub struct RedisBackend {
    client: Client,
}

impl RedisBackend {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl CacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let cached: Option<String> = conn.get(key).await?;
        Ok(cached)
    }

    async fn set(&self, key: &str, value: String, ttl_secs: u64) -> AppResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = conn.set_ex(key, value, ttl_secs).await?;
        Ok(())
    }
}

/// In-process tier used when no Redis URL is configured
///
/// Expired entries are never returned and are evicted on read.
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl_secs: u64) -> AppResult<()> {
        let expires_at = Instant::now() + Duration::from_secs(ttl_secs);
        self.entries
            .lock()
            .await
            .insert(key.to_string(), (value, expires_at));
        Ok(())
    }
}

/// Message for asynchronous cache writes
enum CacheWriteMessage {
    Write {
        tier: CacheTier,
        key: String,
        value: String,
        ttl: u64,
    },
    /// Acknowledged once every earlier write has been applied
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
struct Tier {
    backend: Arc<dyn CacheBackend>,
    ttl: u64,
}

#[derive(Clone)]
struct Tiers {
    short: Tier,
    long: Tier,
}

impl Tiers {
    fn get(&self, tier: CacheTier) -> &Tier {
        match tier {
            CacheTier::Short => &self.short,
            CacheTier::Long => &self.long,
        }
    }
}

/// Two-tier lookaside cache
#[derive(Clone)]
pub struct Cache {
    tiers: Tiers,
    write_tx: mpsc::UnboundedSender<CacheWriteMessage>,
}

/// Handle for gracefully shutting down the cache writer
///
/// Dropping it without `shutdown` leaves the writer running until every
/// `Cache` clone is gone.
pub struct CacheWriterHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl CacheWriterHandle {
    /// Initiates a graceful shutdown of the cache writer
    ///
    /// Sends a shutdown signal to the writer task and waits for it to flush
    /// all pending writes.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        tracing::info!("Cache writer shutdown signal sent");
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Cache writer task panicked");
        }
    }
}

impl Cache {
    /// Creates a new Cache over the given tiers with an async write background task
    ///
    /// This spawns a background task that processes cache writes asynchronously,
    /// so lookaside stores never block the caller.
    pub fn new(
        short: Arc<dyn CacheBackend>,
        short_ttl: u64,
        long: Arc<dyn CacheBackend>,
        long_ttl: u64,
    ) -> (Self, CacheWriterHandle) {
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let tiers = Tiers {
            short: Tier {
                backend: short,
                ttl: short_ttl,
            },
            long: Tier {
                backend: long,
                ttl: long_ttl,
            },
        };

        let writer_tiers = tiers.clone();
        let task = tokio::spawn(async move {
            Self::cache_writer_task(writer_tiers, write_rx, shutdown_rx).await;
        });

        let cache = Self { tiers, write_tx };
        let handle = CacheWriterHandle { shutdown_tx, task };

        (cache, handle)
    }

    /// Both tiers in process memory
    pub fn in_memory(short_ttl: u64, long_ttl: u64) -> (Self, CacheWriterHandle) {
        Self::new(
            Arc::new(MemoryBackend::new()),
            short_ttl,
            Arc::new(MemoryBackend::new()),
            long_ttl,
        )
    }

    /// Redis tiers when URLs are configured, memory otherwise
    pub fn from_config(config: &Config) -> anyhow::Result<(Self, CacheWriterHandle)> {
        let short: Arc<dyn CacheBackend> = match config.redis_url.as_deref() {
            Some(url) => Arc::new(RedisBackend::new(create_redis_client(url)?)),
            None => Arc::new(MemoryBackend::new()),
        };
        let long: Arc<dyn CacheBackend> = match config.slow_redis_url() {
            Some(url) => Arc::new(RedisBackend::new(create_redis_client(url)?)),
            None => Arc::new(MemoryBackend::new()),
        };

        tracing::info!(
            redis = config.redis_url.is_some(),
            short_ttl = config.short_cache_ttl_secs,
            long_ttl = config.long_cache_ttl_secs,
            "Cache tiers configured"
        );

        Ok(Self::new(
            short,
            config.short_cache_ttl_secs,
            long,
            config.long_cache_ttl_secs,
        ))
    }

    /// Background task that processes cache write messages
    ///
    /// Continuously receives cache write requests from the channel and applies
    /// them. On shutdown signal, flushes all remaining messages before exiting.
    async fn cache_writer_task(
        tiers: Tiers,
        mut write_rx: mpsc::UnboundedReceiver<CacheWriteMessage>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        tracing::info!("Cache writer task started");

        loop {
            tokio::select! {
                Some(msg) = write_rx.recv() => {
                    Self::apply(&tiers, msg).await;
                }
                Some(()) = shutdown_rx.recv() => {
                    tracing::info!("Cache writer shutting down, flushing remaining writes");

                    write_rx.close();
                    while let Some(msg) = write_rx.recv().await {
                        Self::apply(&tiers, msg).await;
                    }

                    tracing::info!("Cache writer task stopped");
                    break;
                }
                else => break,
            }
        }
    }

    async fn apply(tiers: &Tiers, msg: CacheWriteMessage) {
        match msg {
            CacheWriteMessage::Write {
                tier,
                key,
                value,
                ttl,
            } => {
                if let Err(e) = tiers.get(tier).backend.set(&key, value, ttl).await {
                    tracing::error!(error = %e, key = %key, "Failed to write to cache");
                }
            }
            CacheWriteMessage::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }

    /// Retrieves a value from the cache by key
    ///
    /// Backend or decode failures are logged and reported as a miss, so the
    /// caller falls through to computing the value.
    pub async fn get_from_cache<T: serde::de::DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let tier = self.tiers.get(key.tier());
        let cached = match tier.backend.get(&key.to_string()).await {
            Ok(cached) => cached,
            Err(e) => {
                tracing::warn!(error = %e, key = %key, "Cache read failed, treating as miss");
                return None;
            }
        };

        let json = cached?;
        match serde_json::from_str(&json) {
            Ok(data) => {
                tracing::debug!(key = %key, "Cache hit");
                Some(data)
            }
            Err(e) => {
                tracing::warn!(error = %e, key = %key, "Cache deserialization error");
                None
            }
        }
    }

    /// Stores a value in the cache asynchronously without blocking
    ///
    /// This function serializes the value and sends it to a background worker
    /// via a channel. The TTL is the one configured for the key's tier.
    pub fn set_in_background<T: serde::Serialize>(&self, key: &CacheKey, value: &T) {
        let json = match serde_json::to_string(value) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!(error = %e, "Cache serialization error");
                return;
            }
        };

        let tier = key.tier();
        let msg = CacheWriteMessage::Write {
            tier,
            key: key.to_string(),
            value: json,
            ttl: self.tiers.get(tier).ttl,
        };

        if self.write_tx.send(msg).is_err() {
            tracing::error!(key = %key, "Failed to send cache write message");
        }
    }

    /// Waits until every write queued before this call has been applied
    pub async fn flush(&self) -> AppResult<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.write_tx
            .send(CacheWriteMessage::Flush(ack_tx))
            .map_err(|_| AppError::Internal("Cache writer stopped".to_string()))?;
        ack_rx
            .await
            .map_err(|_| AppError::Internal("Cache writer stopped".to_string()))
    }
}
