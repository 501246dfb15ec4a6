use std::collections::HashSet;
use std::path::Path;

use futures::{stream, StreamExt};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::{
    error::AppResult,
    models::UserId,
    services::{letterboxd::POPULAR_PERIODS, LetterboxdClient},
};

/// First line of the users file
pub const USERS_HEADER: &str = "user_id";

/// Reads crawl targets from a users file, one id per line
///
/// The header and blank lines are ignored; repeated ids keep their first
/// position.
pub async fn load_user_ids(path: &Path) -> AppResult<Vec<UserId>> {
    let contents = fs::read_to_string(path).await?;
    Ok(parse_user_ids(&contents))
}

fn parse_user_ids(contents: &str) -> Vec<UserId> {
    let mut seen = HashSet::new();
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && *line != USERS_HEADER)
        .filter_map(UserId::new)
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

/// Grows the users file from the popular-members directory
pub struct MemberDiscovery {
    site: LetterboxdClient,
    pages: u32,
    concurrency: usize,
}

impl MemberDiscovery {
    pub fn new(site: LetterboxdClient, pages: u32) -> Self {
        let concurrency = site.fetcher().limiter().max();
        Self {
            site,
            pages,
            concurrency,
        }
    }

    /// Appends members not yet in the file and returns how many were added
    pub async fn run(&self, path: &Path) -> AppResult<usize> {
        let existing = match fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        let mut known: HashSet<UserId> = parse_user_ids(&existing).into_iter().collect();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        if existing.trim().is_empty() {
            file.write_all(format!("{}\n", USERS_HEADER).as_bytes()).await?;
        }

        let mut added = 0;
        for period in POPULAR_PERIODS {
            let mut pages = stream::iter(1..=self.pages)
                .map(|page| async move { (page, self.site.popular_members(period, page).await) })
                .buffered(self.concurrency.max(1));

            let mut found_in_period = 0;
            while let Some((page, members)) = pages.next().await {
                let Some(members) = members else {
                    tracing::warn!(period, page, "Skipping members page");
                    continue;
                };

                let mut lines = String::new();
                for member in members {
                    if known.insert(member.clone()) {
                        lines.push_str(&member.path());
                        lines.push('\n');
                        found_in_period += 1;
                    }
                }
                if !lines.is_empty() {
                    file.write_all(lines.as_bytes()).await?;
                }
            }

            tracing::info!(period, new_members = found_in_period, "Finished members period");
            added += found_in_period;
        }

        file.flush().await?;
        tracing::info!(added, total = known.len(), "Member discovery finished");
        Ok(added)
    }
}
