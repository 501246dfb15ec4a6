use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Display;

pub mod film;

pub use film::{FilmRecord, ListEntry, SearchHit};

/// A site member, stored without surrounding slashes (e.g. "dave")
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// Accepts both `name` and `/name/` forms
    pub fn new(raw: &str) -> Option<Self> {
        let name = raw.trim().trim_matches('/');
        if name.is_empty() || name.contains('/') {
            return None;
        }
        Some(Self(name.to_string()))
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    /// Path segment form used in site URLs and in the review table
    pub fn path(&self) -> String {
        format!("/{}/", self.0)
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Normalized film key of the form `/film/<slug>/`
///
/// Diary links carry a user prefix and sometimes a viewing counter
/// (`/dave/film/alien/2/`); both are stripped so the same film compares
/// equal across pages and crawl runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilmId(String);

impl FilmId {
    pub fn from_href(href: &str) -> Option<Self> {
        let start = href.find("/film/")?;
        let slug = href[start + "/film/".len()..]
            .split('/')
            .next()
            .filter(|s| !s.is_empty())?;
        Some(Self(format!("/film/{}/", slug)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn slug(&self) -> &str {
        self.0.trim_start_matches("/film/").trim_end_matches('/')
    }
}

impl Display for FilmId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One row of a diary or films page, as extracted
#[derive(Debug, Clone, PartialEq)]
pub struct DiaryRow {
    /// Raw link of the entry; review pages live under it
    pub film_href: String,
    pub rating: Option<f32>,
    pub liked: bool,
    /// The entry has a written review behind a second fetch
    pub reviewed: bool,
}

/// One user's logged viewing of one film
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiaryEntry {
    pub user_id: UserId,
    pub film_id: FilmId,
    /// Star rating in [0, 5], half-star steps
    pub rating: Option<f32>,
    pub liked: bool,
    pub review: Option<String>,
}

impl DiaryEntry {
    pub fn from_row(user_id: &UserId, row: &DiaryRow, review: Option<String>) -> Option<Self> {
        Some(Self {
            user_id: user_id.clone(),
            film_id: FilmId::from_href(&row.film_href)?,
            rating: row.rating,
            liked: row.liked,
            review,
        })
    }
}

/// What a ranking is computed from
#[derive(Debug, Clone, PartialEq)]
pub enum RankingTarget {
    /// The user's own diary
    User(UserId),
    /// An explicit film list with no rating history
    Seeds(Vec<FilmId>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankingRequest {
    pub target: RankingTarget,
    /// Upper bound on the number of ranked items
    pub k: Option<usize>,
    /// 1-based page into the ranked list
    pub page: usize,
}

impl RankingRequest {
    pub fn for_user(user_id: UserId, page: usize) -> Self {
        Self {
            target: RankingTarget::User(user_id),
            k: None,
            page,
        }
    }

    pub fn for_seeds(seeds: Vec<FilmId>, page: usize) -> Self {
        Self {
            target: RankingTarget::Seeds(seeds),
            k: None,
            page,
        }
    }
}

/// Full ranked list as stored in the short-TTL cache tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedList {
    pub films: Vec<FilmId>,
    pub computed_at: DateTime<Utc>,
}

impl RankedList {
    pub fn new(films: Vec<FilmId>) -> Self {
        Self {
            films,
            computed_at: Utc::now(),
        }
    }

    /// Slice out a 1-based page; page 0 is treated as the first page
    pub fn page(&self, page: usize, per_page: usize) -> Vec<FilmId> {
        let start = page.saturating_sub(1).saturating_mul(per_page);
        self.films
            .iter()
            .skip(start)
            .take(per_page)
            .cloned()
            .collect()
    }
}
