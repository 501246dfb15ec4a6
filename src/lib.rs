pub mod config;
pub mod crawl;
pub mod db;
pub mod error;
pub mod models;
pub mod ranking;
pub mod services;

pub use config::Config;
pub use error::{AppError, AppResult};
