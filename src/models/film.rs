use serde::{Deserialize, Serialize};

use super::FilmId;

/// Descriptive metadata for one film, one row of the `films` table
///
/// Statistics are kept as the site renders them ("1.2M", "3.91").
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilmRecord {
    pub id: String,
    pub name: Option<String>,
    pub year: Option<String>,
    pub director: Option<String>,
    pub tagline: Option<String>,
    pub synopsis: Option<String>,
    pub poster: Option<String>,
    pub casts: Option<String>,
    pub genres: Option<String>,
    pub themes: Option<String>,
    pub studio: Option<String>,
    pub countries: Option<String>,
    pub language: Option<String>,
    pub views: Option<String>,
    pub lists: Option<String>,
    pub likes: Option<String>,
    pub fans: Option<String>,
    pub ratings: Option<String>,
    pub duration: Option<String>,
}

impl FilmRecord {
    pub fn new(film_id: &FilmId) -> Self {
        Self {
            id: film_id.to_string(),
            ..Default::default()
        }
    }
}

/// One film in a search result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: Option<String>,
    pub film_id: FilmId,
    pub poster: Option<String>,
}

/// One film in a user list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListEntry {
    pub title: String,
    pub film_id: FilmId,
}
