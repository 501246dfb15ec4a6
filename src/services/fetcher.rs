use std::sync::Arc;
use std::time::Duration;

use reqwest::Client as HttpClient;
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::error::{AppError, AppResult};

/// Retrieves raw page content
///
/// Implementations return an error for network failures, timeouts and
/// non-success statuses alike; callers treat all of them as transient.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> AppResult<String>;
}

/// reqwest-backed fetcher with a fixed per-request timeout
#[derive(Clone)]
pub struct HttpFetcher {
    http_client: HttpClient,
}

impl HttpFetcher {
    pub fn new(user_agent: &str, timeout_secs: u64) -> AppResult<Self> {
        let http_client = HttpClient::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;

        Ok(Self { http_client })
    }
}

#[async_trait::async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> AppResult<String> {
        let response = self.http_client.get(url).send().await?;

        if !response.status().is_success() {
            return Err(AppError::FetchStatus {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        Ok(response.text().await?)
    }
}

/// Global counting permit shared by every fetching task
#[derive(Clone)]
pub struct FetchLimiter {
    permits: Arc<Semaphore>,
    max: usize,
}

impl FetchLimiter {
    pub fn new(max: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max)),
            max,
        }
    }

    pub async fn acquire(&self) -> AppResult<SemaphorePermit<'_>> {
        self.permits
            .acquire()
            .await
            .map_err(|e| AppError::Internal(format!("Fetch limiter closed: {}", e)))
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

/// A fetcher whose every request holds one limiter permit for its duration
#[derive(Clone)]
pub struct LimitedFetcher {
    inner: Arc<dyn PageFetcher>,
    limiter: FetchLimiter,
}

impl LimitedFetcher {
    pub fn new(inner: Arc<dyn PageFetcher>, limiter: FetchLimiter) -> Self {
        Self { inner, limiter }
    }

    pub fn limiter(&self) -> &FetchLimiter {
        &self.limiter
    }

    /// Fetches one page, or `None` if it failed
    ///
    /// Failures are logged and never retried. The permit is released before
    /// returning, so extraction runs outside the limiter.
    pub async fn get(&self, url: &str) -> Option<String> {
        tracing::trace!(url = %url, free = self.limiter.available(), "Waiting for fetch permit");
        let result = {
            let _permit = match self.limiter.acquire().await {
                Ok(permit) => permit,
                Err(e) => {
                    tracing::error!(error = %e, url = %url, "Could not acquire fetch permit");
                    return None;
                }
            };
            self.inner.fetch(url).await
        };

        match result {
            Ok(body) => Some(body),
            Err(e) if e.is_transient_fetch() => {
                tracing::warn!(error = %e, url = %url, "Fetch failed, skipping");
                None
            }
            Err(e) => {
                tracing::error!(error = %e, url = %url, "Fetch failed unexpectedly, skipping");
                None
            }
        }
    }
}
