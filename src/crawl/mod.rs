pub mod films;
pub mod members;
pub mod orchestrator;
pub mod sampler;
pub mod worker;
pub mod writer;

pub use films::{FilmCrawl, FilmCrawlReport};
pub use members::{load_user_ids, MemberDiscovery};
pub use orchestrator::{CrawlOrchestrator, CrawlReport};
pub use sampler::{PageSampler, SampleZone};
pub use worker::{CrawlStats, FetchWorker, WorkQueue};
pub use writer::{PersistenceWriter, WriterStats};
