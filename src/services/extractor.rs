//! Page-to-record extraction
//!
//! Every extractor method is total: malformed or unexpected markup yields an
//! empty list or `None`, never a partially filled structure that claims to be
//! complete.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};

use crate::models::{DiaryRow, FilmId, FilmRecord, ListEntry, UserId};

static DURATION_MINS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+)\s+mins").expect("Invalid duration pattern"));

static POSTER_CROP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"-0-(\d+)-0-(\d+)-crop").expect("Invalid poster crop pattern"));

/// Markup variants of a member's viewing history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiaryLayout {
    /// `/<user>/diary/films/`: one table row per logged viewing, with
    /// review markers
    Table,
    /// `/<user>/films/`: poster grid of every watched film, no review markers
    Grid,
}

/// Turns raw page content into typed records
pub trait Extractor: Send + Sync {
    fn diary_rows(&self, html: &str, layout: DiaryLayout) -> Vec<DiaryRow>;

    fn review_body(&self, html: &str) -> Option<String>;

    fn film_details(&self, film_id: &FilmId, html: &str) -> Option<FilmRecord>;

    /// Title and film of every search result, in page order
    fn search_hits(&self, html: &str) -> Vec<(Option<String>, FilmId)>;

    fn list_entries(&self, html: &str) -> Vec<ListEntry>;

    fn members(&self, html: &str) -> Vec<UserId>;
}

/// CSS-selector extractor over the raw HTML
#[derive(Debug, Clone, Default)]
pub struct HtmlExtractor;

impl HtmlExtractor {
    pub fn new() -> Self {
        Self
    }

    fn table_rows(doc: &Html) -> Vec<DiaryRow> {
        let (Some(row_sel), Some(link_sel), Some(rating_sel), Some(liked_sel), Some(review_sel)) = (
            selector(".diary-entry-row"),
            selector(".name a"),
            selector(".rating"),
            selector(".icon-liked"),
            selector(".icon-review"),
        ) else {
            return Vec::new();
        };

        doc.select(&row_sel)
            .filter_map(|row| {
                let film_href = row
                    .select(&link_sel)
                    .next()
                    .and_then(|a| a.value().attr("href"))?;

                Some(DiaryRow {
                    film_href: film_href.to_string(),
                    rating: row
                        .select(&rating_sel)
                        .next()
                        .and_then(|el| stars_to_rating(&text_of(&el))),
                    liked: row.select(&liked_sel).next().is_some(),
                    reviewed: row.select(&review_sel).next().is_some(),
                })
            })
            .collect()
    }

    fn grid_rows(doc: &Html) -> Vec<DiaryRow> {
        let (Some(item_sel), Some(component_sel), Some(viewing_sel), Some(rating_sel), Some(liked_sel)) = (
            selector(".griditem"),
            selector(".react-component"),
            selector(".poster-viewingdata"),
            selector(".rating"),
            selector(".icon-liked"),
        ) else {
            return Vec::new();
        };

        doc.select(&item_sel)
            .filter_map(|item| {
                let component = item.select(&component_sel).next()?;
                let viewing = item.select(&viewing_sel).next()?;
                let film_href = component.value().attr("data-item-link")?;

                Some(DiaryRow {
                    film_href: film_href.to_string(),
                    rating: viewing
                        .select(&rating_sel)
                        .next()
                        .and_then(|el| stars_to_rating(&text_of(&el))),
                    liked: viewing.select(&liked_sel).next().is_some(),
                    reviewed: false,
                })
            })
            .collect()
    }

    /// Value under a labelled heading of the details tab
    fn detail_value(doc: &Html, label: &str) -> Option<String> {
        let heading_sel = selector("#tab-details h3")?;
        let link_sel = selector("a")?;

        let heading = doc
            .select(&heading_sel)
            .find(|h| text_of(h).contains(label))?;
        let value = heading
            .next_siblings()
            .filter_map(ElementRef::wrap)
            .find(|el| el.value().name() == "div")?;

        let links: Vec<String> = value.select(&link_sel).map(|a| text_of(&a)).collect();
        if links.is_empty() {
            non_empty(text_of(&value))
        } else {
            Some(links.join(", "))
        }
    }
}

impl Extractor for HtmlExtractor {
    fn diary_rows(&self, html: &str, layout: DiaryLayout) -> Vec<DiaryRow> {
        let doc = Html::parse_document(html);
        match layout {
            DiaryLayout::Table => Self::table_rows(&doc),
            DiaryLayout::Grid => Self::grid_rows(&doc),
        }
    }

    fn review_body(&self, html: &str) -> Option<String> {
        let doc = Html::parse_document(html);
        let body_sel = selector(".js-review-body")?;
        let body = doc.select(&body_sel).next()?;
        let text: String = body.text().collect();
        non_empty(text.trim_start().to_string())
    }

    fn film_details(&self, film_id: &FilmId, html: &str) -> Option<FilmRecord> {
        let doc = Html::parse_document(html);
        let mut film = FilmRecord::new(film_id);

        film.name = first_text(&doc, ".details h1");
        // A page without a title is not a film page
        film.name.as_ref()?;

        film.year = first_text(&doc, ".releasedate");
        film.director = first_text(&doc, ".contributor");
        film.tagline = first_text(&doc, ".tagline");
        film.synopsis = first_text(&doc, ".truncate");
        film.casts = joined_text(&doc, ".cast-list .text-slug");

        if let (Some(list_sel), Some(link_sel)) =
            (selector("#tab-genres .text-sluglist"), selector("a"))
        {
            let lists: Vec<ElementRef> = doc.select(&list_sel).collect();
            let join_links = |el: &ElementRef| {
                let texts: Vec<String> = el.select(&link_sel).map(|a| text_of(&a)).collect();
                non_empty(texts.join(", "))
            };
            film.genres = lists.first().and_then(join_links);
            film.themes = lists.get(1).and_then(join_links);
        }

        if let Some(stat_sel) = selector(".production-statistic-list > div") {
            let stats: Vec<String> = doc.select(&stat_sel).map(|s| text_of(&s)).collect();
            if stats.len() >= 3 {
                let first_token = |s: &String| s.split_whitespace().next().map(str::to_string);
                film.views = first_token(&stats[0]);
                film.lists = first_token(&stats[1]);
                film.likes = first_token(&stats[2]);
            }
        }

        film.fans = first_text(&doc, ".ratings-histogram-chart > a");
        film.ratings = first_text(&doc, ".average-rating > a");

        let poster_css = format!(
            ".poster-list [data-item-slug=\"{}\"] .film-poster img",
            film_id.slug()
        );
        film.poster = selector(&poster_css)
            .and_then(|sel| doc.select(&sel).next())
            .and_then(|img| img.value().attr("src"))
            .map(str::to_string);

        film.duration = first_text(&doc, ".text-footer").and_then(|t| parse_duration(&t));

        film.studio = Self::detail_value(&doc, "Studios");
        film.countries = Self::detail_value(&doc, "Country");
        film.language = Self::detail_value(&doc, "Language");

        Some(film)
    }

    fn search_hits(&self, html: &str) -> Vec<(Option<String>, FilmId)> {
        let doc = Html::parse_document(html);
        let (Some(result_sel), Some(data_sel)) =
            (selector(".search-result"), selector("article > div"))
        else {
            return Vec::new();
        };

        doc.select(&result_sel)
            .filter_map(|result| {
                let data = result.select(&data_sel).next()?;
                let film_id = FilmId::from_href(data.value().attr("data-item-link")?)?;
                let title = data
                    .value()
                    .attr("data-item-name")
                    .map(|t| t.trim().to_string());
                Some((title, film_id))
            })
            .collect()
    }

    fn list_entries(&self, html: &str) -> Vec<ListEntry> {
        let doc = Html::parse_document(html);
        let (Some(numbered_sel), Some(grid_sel), Some(component_sel)) = (
            selector("ul.js-list-entries > li.posteritem"),
            selector("ul.grid > li.griditem"),
            selector("div.react-component"),
        ) else {
            return Vec::new();
        };

        let mut entries: Vec<ElementRef> = doc.select(&numbered_sel).collect();
        if entries.is_empty() {
            entries = doc.select(&grid_sel).collect();
        }

        entries
            .iter()
            .filter_map(|entry| {
                let component = entry.select(&component_sel).next()?;
                let film_id = FilmId::from_href(component.value().attr("data-item-link")?)?;
                let title = component.value().attr("data-item-name")?;
                Some(ListEntry {
                    title: title.trim().to_string(),
                    film_id,
                })
            })
            .collect()
    }

    fn members(&self, html: &str) -> Vec<UserId> {
        let doc = Html::parse_document(html);
        let Some(name_sel) = selector(".name") else {
            return Vec::new();
        };

        doc.select(&name_sel)
            .filter_map(|el| el.value().attr("href"))
            .filter_map(UserId::new)
            .collect()
    }
}

fn selector(css: &str) -> Option<Selector> {
    match Selector::parse(css) {
        Ok(sel) => Some(sel),
        Err(e) => {
            tracing::error!(css = %css, error = ?e, "Invalid selector");
            None
        }
    }
}

fn text_of(el: &ElementRef) -> String {
    el.text().collect::<String>().trim().to_string()
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn first_text(doc: &Html, css: &str) -> Option<String> {
    let sel = selector(css)?;
    doc.select(&sel).next().and_then(|el| non_empty(text_of(&el)))
}

fn joined_text(doc: &Html, css: &str) -> Option<String> {
    let sel = selector(css)?;
    let texts: Vec<String> = doc.select(&sel).map(|el| text_of(&el)).collect();
    non_empty(texts.join(", "))
}

/// "★★★½" is 3.5; text without stars carries no rating
pub fn stars_to_rating(stars: &str) -> Option<f32> {
    let full = stars.matches('★').count() as f32;
    let half = stars.matches('½').count() as f32;
    let rating = full + half * 0.5;
    if rating > 0.0 {
        Some(rating.min(5.0))
    } else {
        None
    }
}

/// Minutes from a footer like "118 mins   More at IMDb"
fn parse_duration(text: &str) -> Option<String> {
    if let Some(caps) = DURATION_MINS.captures(text) {
        return Some(caps[1].to_string());
    }
    text.split_whitespace()
        .find(|t| !t.is_empty() && t.chars().all(|c| c.is_ascii_digit()))
        .map(str::to_string)
}

/// Rewrites a poster thumbnail URL to the 230x345 rendition
pub fn upscale_poster(url: &str) -> String {
    POSTER_CROP.replace_all(url, "-0-230-0-345-crop").into_owned()
}
