pub mod redis;
pub mod sqlite;

pub use self::redis::{Cache, CacheKey};
pub use self::sqlite::{create_pool, BatchStore, FilmStore, ReviewStore};
