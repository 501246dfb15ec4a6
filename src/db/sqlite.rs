use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::{
    error::AppResult,
    models::{DiaryEntry, FilmId, FilmRecord},
};

/// Creates a SQLite connection pool and makes sure the schema exists
///
/// In-memory databases are private to one connection, so callers pass
/// `max_connections = 1` for `sqlite::memory:`.
pub async fn create_pool(database_url: &str, max_connections: u32) -> anyhow::Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;

    init_schema(&pool).await?;

    Ok(pool)
}

/// Creates the review and film tables if missing
pub async fn init_schema(pool: &SqlitePool) -> AppResult<()> {
    sqlx::query("PRAGMA journal_mode=WAL;").execute(pool).await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS user_reviews (
            user_id TEXT NOT NULL,
            film_id TEXT NOT NULL,
            rating REAL,
            liked INTEGER,
            review TEXT,
            PRIMARY KEY (user_id, film_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS films (
            id TEXT PRIMARY KEY,
            name TEXT,
            year TEXT,
            director TEXT,
            tagline TEXT,
            synopsis TEXT,
            poster TEXT,
            casts TEXT,
            genres TEXT,
            themes TEXT,
            studio TEXT,
            countries TEXT,
            language TEXT,
            views TEXT,
            lists TEXT,
            likes TEXT,
            fans TEXT,
            ratings TEXT,
            duration TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Durable destination for one record type, written in batches
///
/// Each call commits the whole batch in one transaction or fails as a unit.
#[async_trait::async_trait]
pub trait BatchStore<T: Send + Sync + 'static>: Send + Sync {
    async fn upsert_batch(&self, batch: &[T]) -> AppResult<()>;
}

/// Writes diary entries into `user_reviews`, one row per (user, film)
#[derive(Clone)]
pub struct ReviewStore {
    pool: SqlitePool,
}

/// Stored shape of a review row
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ReviewRow {
    pub user_id: String,
    pub film_id: String,
    pub rating: Option<f64>,
    pub liked: i64,
    pub review: Option<String>,
}

impl ReviewStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn reviews_for_user(&self, user_path: &str) -> AppResult<Vec<ReviewRow>> {
        let rows = sqlx::query_as::<_, ReviewRow>(
            r#"
            SELECT user_id, film_id, rating, liked, review
            FROM user_reviews
            WHERE user_id = ?
            ORDER BY film_id
            "#,
        )
        .bind(user_path)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn count(&self) -> AppResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM user_reviews")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Distinct films referenced by any review, normalized
    pub async fn distinct_film_ids(&self) -> AppResult<Vec<FilmId>> {
        let raw: Vec<String> = sqlx::query_scalar("SELECT DISTINCT film_id FROM user_reviews")
            .fetch_all(&self.pool)
            .await?;

        let mut ids: Vec<FilmId> = raw.iter().filter_map(|r| FilmId::from_href(r)).collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}

#[async_trait::async_trait]
impl BatchStore<DiaryEntry> for ReviewStore {
    async fn upsert_batch(&self, batch: &[DiaryEntry]) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;

        for entry in batch {
            sqlx::query(
                r#"
                INSERT INTO user_reviews (user_id, film_id, rating, liked, review)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(user_id, film_id) DO UPDATE SET
                    rating = excluded.rating,
                    liked = excluded.liked,
                    review = excluded.review
                "#,
            )
            .bind(entry.user_id.path())
            .bind(entry.film_id.as_str())
            .bind(entry.rating.map(f64::from))
            .bind(i64::from(entry.liked))
            .bind(entry.review.as_deref())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

/// Writes film metadata into `films`, replacing any previous row
#[derive(Clone)]
pub struct FilmStore {
    pool: SqlitePool,
}

impl FilmStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[cfg(test)]
    pub async fn get(&self, film_id: &str) -> AppResult<Option<(String, Option<String>)>> {
        let row: Option<(String, Option<String>)> =
            sqlx::query_as("SELECT id, name FROM films WHERE id = ?")
                .bind(film_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row)
    }
}

#[async_trait::async_trait]
impl BatchStore<FilmRecord> for FilmStore {
    async fn upsert_batch(&self, batch: &[FilmRecord]) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;

        for film in batch {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO films (
                    id, name, year, director, tagline, synopsis, poster,
                    casts, genres, themes, studio, countries, language,
                    views, lists, likes, fans, ratings, duration
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&film.id)
            .bind(&film.name)
            .bind(&film.year)
            .bind(&film.director)
            .bind(&film.tagline)
            .bind(&film.synopsis)
            .bind(&film.poster)
            .bind(&film.casts)
            .bind(&film.genres)
            .bind(&film.themes)
            .bind(&film.studio)
            .bind(&film.countries)
            .bind(&film.language)
            .bind(&film.views)
            .bind(&film.lists)
            .bind(&film.likes)
            .bind(&film.fans)
            .bind(&film.ratings)
            .bind(&film.duration)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}
