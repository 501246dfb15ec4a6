/// Application-level errors
#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Cache error: {0}")]
    Cache(#[from] redis::RedisError),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Fetch of {url} returned status {status}")]
    FetchStatus { url: String, status: u16 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Batch commit failed ({lost} in batch, {dropped} queued records dropped): {source}")]
    BatchCommit {
        lost: usize,
        dropped: usize,
        #[source]
        source: Box<AppError>,
    },
}

impl AppError {
    /// Transient fetch failures are skipped by the crawl, never retried
    pub fn is_transient_fetch(&self) -> bool {
        matches!(self, AppError::HttpClient(_) | AppError::FetchStatus { .. })
    }
}

pub type AppResult<T> = Result<T, AppError>;
