pub mod extractor;
pub mod fetcher;
pub mod letterboxd;

pub use extractor::{DiaryLayout, Extractor, HtmlExtractor};
pub use fetcher::{FetchLimiter, HttpFetcher, LimitedFetcher, PageFetcher};
pub use letterboxd::LetterboxdClient;
