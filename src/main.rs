use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use reelrank::{
    crawl::{load_user_ids, CrawlOrchestrator, FilmCrawl, MemberDiscovery},
    db::{create_pool, Cache, FilmStore, ReviewStore},
    models::{FilmId, RankingRequest, RankingTarget, UserId},
    ranking::{FactorModel, RankingEngine},
    services::{FetchLimiter, HtmlExtractor, HttpFetcher, LetterboxdClient, LimitedFetcher},
    Config,
};

/// Letterboxd review crawler and film recommender
#[derive(Parser)]
#[command(name = "reelrank")]
#[command(about = "Crawl Letterboxd diaries and rank unseen films", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl sampled diary pages of every user in the users file
    CrawlReviews,

    /// Fetch details of every reviewed film into the films table
    CrawlFilms,

    /// Add popular members to the users file
    DiscoverUsers,

    /// Rank unseen films for a user, a seed list or a list's films
    Rank {
        /// Rank from this user's watched films
        #[arg(long, conflicts_with_all = ["seeds", "list"])]
        user: Option<String>,

        /// Comma-separated film ids, e.g. /film/alien/,/film/heat/
        #[arg(long, value_delimiter = ',', conflicts_with = "list")]
        seeds: Vec<String>,

        /// Use the films of this list as seeds, e.g. dave/list/favourites
        #[arg(long)]
        list: Option<String>,

        /// 1-based page of the ranking
        #[arg(long, default_value = "1")]
        page: usize,

        /// Print at most this many films
        #[arg(long)]
        k: Option<usize>,
    },

    /// Show one film's details
    Film {
        /// Film id or slug, e.g. /film/alien/ or alien
        film: String,
    },

    /// Search films by title
    Search { query: String },

    /// Print the films of a list
    List {
        /// List path, e.g. dave/list/favourites
        list: String,

        /// Read only this page
        #[arg(long)]
        page: Option<u32>,

        /// Stop after this many entries
        #[arg(long)]
        limit: Option<usize>,
    },
}

fn parse_film_id(raw: &str) -> Option<FilmId> {
    let raw = raw.trim();
    FilmId::from_href(raw).or_else(|| FilmId::from_href(&format!("/film/{}/", raw.trim_matches('/'))))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().context("Failed to load configuration")?;

    let (cache, cache_handle) = Cache::from_config(&config).context("Failed to set up cache")?;
    let fetcher = HttpFetcher::new(&config.user_agent, config.request_timeout_secs)
        .context("Failed to build HTTP client")?;
    let site = LetterboxdClient::new(
        config.base_url.clone(),
        LimitedFetcher::new(Arc::new(fetcher), FetchLimiter::new(config.fetch_concurrency)),
        Arc::new(HtmlExtractor::new()),
        cache.clone(),
    );

    let result = run(cli.command, &config, site, cache).await;
    cache_handle.shutdown().await;
    result
}

async fn run(command: Commands, config: &Config, site: LetterboxdClient, cache: Cache) -> Result<()> {
    match command {
        Commands::CrawlReviews => {
            let users = load_user_ids(Path::new(&config.users_path))
                .await
                .with_context(|| format!("Failed to read users from {}", config.users_path))?;
            let pool = create_pool(&config.database_url, 1).await?;

            let reviews = ReviewStore::new(pool);

            let report = CrawlOrchestrator::from_config(site, config)
                .run(users, reviews.clone())
                .await
                .context("Review crawl stopped")?;
            println!(
                "crawled {} users: {} pages, {} failed, {} entries committed, {} reviews stored",
                report.users,
                report.pages_fetched,
                report.pages_failed,
                report.committed,
                reviews.count().await?
            );
        }

        Commands::CrawlFilms => {
            let pool = create_pool(&config.database_url, 1).await?;
            let film_ids = ReviewStore::new(pool.clone()).distinct_film_ids().await?;

            let report = FilmCrawl::from_config(site, config)
                .run(film_ids, FilmStore::new(pool))
                .await
                .context("Film crawl stopped")?;
            println!(
                "fetched {} of {} films, {} committed",
                report.fetched, report.requested, report.committed
            );
        }

        Commands::DiscoverUsers => {
            let added = MemberDiscovery::new(site, config.popular_pages)
                .run(Path::new(&config.users_path))
                .await?;
            println!("added {} users to {}", added, config.users_path);
        }

        Commands::Rank {
            user,
            seeds,
            list,
            page,
            k,
        } => {
            let target = if let Some(user) = user {
                let Some(user_id) = UserId::new(&user) else {
                    bail!("'{}' is not a user id", user);
                };
                RankingTarget::User(user_id)
            } else if let Some(list) = list {
                let entries = site.list(&list, None, None).await;
                RankingTarget::Seeds(entries.into_iter().map(|e| e.film_id).collect())
            } else if !seeds.is_empty() {
                let film_ids = seeds
                    .iter()
                    .map(|s| parse_film_id(s).with_context(|| format!("'{}' is not a film id", s)))
                    .collect::<Result<Vec<_>>>()?;
                RankingTarget::Seeds(film_ids)
            } else {
                bail!("rank needs --user, --seeds or --list");
            };

            let model = FactorModel::load(Path::new(&config.model_path))
                .await
                .with_context(|| format!("Failed to load model from {}", config.model_path))?;
            let engine = RankingEngine::new(Arc::new(model), site, cache, config);

            let request = RankingRequest { target, k, page };
            for film_id in engine.get_ranked(&request).await {
                println!("{}", film_id);
            }
        }

        Commands::Film { film } => {
            let Some(film_id) = parse_film_id(&film) else {
                bail!("'{}' is not a film id", film);
            };
            let details = site.film_details(&film_id).await?;
            println!("{}", serde_json::to_string_pretty(&details)?);
        }

        Commands::Search { query } => {
            for hit in site.search(&query).await? {
                println!(
                    "{}\t{}\t{}",
                    hit.film_id,
                    hit.title.unwrap_or_default(),
                    hit.poster.unwrap_or_default()
                );
            }
        }

        Commands::List { list, page, limit } => {
            for entry in site.list(&list, page, limit).await {
                println!("{}\t{}", entry.film_id, entry.title);
            }
        }
    }

    Ok(())
}
