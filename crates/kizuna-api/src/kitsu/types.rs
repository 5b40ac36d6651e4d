use chrono::{Datelike, Utc};
use kizuna_core::models::{AiringStatus, AnimeSeason, LibraryEntry, MediaEntry, SeasonInfo, WatchStatus};
use serde::Deserialize;

use crate::document::{parse_date, parse_timestamp};

// ── JSON:API response types ──────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct JsonApiListResponse {
    pub data: Vec<JsonApiResource>,
    pub links: Option<Links>,
}

#[derive(Debug, Deserialize)]
pub struct JsonApiSingleResourceResponse {
    pub data: JsonApiResource,
    #[serde(default)]
    pub included: Vec<JsonApiResource>,
}

#[derive(Debug, Deserialize)]
pub struct JsonApiResource {
    pub id: String,
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub attributes: serde_json::Value,
    pub relationships: Option<serde_json::Value>,
}

impl JsonApiResource {
    /// Id of a to-one relationship, e.g. `relationships.anime.data.id`.
    pub fn related_id(&self, name: &str) -> Option<&str> {
        self.relationships
            .as_ref()?
            .get(name)?
            .get("data")?
            .get("id")?
            .as_str()
    }
}

#[derive(Debug, Deserialize)]
pub struct Links {
    pub next: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct JsonApiErrors {
    pub errors: Vec<JsonApiError>,
}

#[derive(Debug, Deserialize)]
pub struct JsonApiError {
    pub title: Option<String>,
    pub detail: Option<String>,
    pub status: Option<String>,
}

impl JsonApiError {
    pub fn message(&self) -> String {
        self.detail
            .clone()
            .or_else(|| self.title.clone())
            .unwrap_or_else(|| "unknown error".to_string())
    }

    pub fn status_code(&self) -> Option<u16> {
        self.status.as_deref().and_then(|s| s.parse().ok())
    }
}

// ── Kitsu-specific types ─────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KitsuAnimeAttributes {
    pub canonical_title: Option<String>,
    pub titles: Option<KitsuTitles>,
    #[serde(default)]
    pub abbreviated_titles: Option<Vec<String>>,
    pub episode_count: Option<u32>,
    pub poster_image: Option<KitsuImage>,
    pub average_rating: Option<String>,
    pub synopsis: Option<String>,
    pub status: Option<String>,
    pub start_date: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct KitsuTitles {
    pub en: Option<String>,
    pub en_jp: Option<String>,
    pub ja_jp: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct KitsuImage {
    pub medium: Option<String>,
    pub large: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KitsuLibraryAttributes {
    pub progress: Option<u32>,
    pub rating_twenty: Option<u32>,
    pub status: Option<String>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub updated_at: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct KitsuCategoryAttributes {
    pub title: Option<String>,
}

// ── Status mapping ──────────────────────────────────────────────

pub fn status_to_kitsu(status: WatchStatus) -> &'static str {
    match status {
        WatchStatus::Watching => "current",
        WatchStatus::Completed => "completed",
        WatchStatus::OnHold => "on_hold",
        WatchStatus::Dropped => "dropped",
        WatchStatus::PlanToWatch => "planned",
    }
}

pub fn status_from_kitsu(s: &str) -> Option<WatchStatus> {
    match s {
        "current" => Some(WatchStatus::Watching),
        "completed" => Some(WatchStatus::Completed),
        "on_hold" => Some(WatchStatus::OnHold),
        "dropped" => Some(WatchStatus::Dropped),
        "planned" => Some(WatchStatus::PlanToWatch),
        _ => None,
    }
}

fn airing_from_kitsu(s: &str) -> Option<AiringStatus> {
    match s {
        "current" => Some(AiringStatus::Airing),
        "finished" => Some(AiringStatus::Finished),
        "tba" | "unreleased" | "upcoming" => Some(AiringStatus::NotYetAired),
        _ => None,
    }
}

// ── Conversions ──────────────────────────────────────────────────

impl KitsuAnimeAttributes {
    pub fn into_media_entry(self, id: u64, genres: Vec<String>) -> MediaEntry {
        let titles = self.titles;
        let title = self
            .canonical_title
            .clone()
            .or_else(|| titles.as_ref().and_then(|t| t.en_jp.clone()))
            .unwrap_or_default();

        let mut synonyms: Vec<String> = titles
            .into_iter()
            .flat_map(|t| [t.en, t.en_jp, t.ja_jp])
            .flatten()
            .chain(self.abbreviated_titles.unwrap_or_default())
            .filter(|t| !t.is_empty() && *t != title)
            .collect();
        synonyms.dedup();

        // Kitsu has no season field; derive it from the start date.
        let season = self.start_date.as_deref().and_then(parse_date).map(|d| SeasonInfo {
            season: AnimeSeason::from_month(d.month()),
            year: d.year() as u32,
        });

        MediaEntry {
            id,
            title,
            synonyms,
            episode_count: self.episode_count,
            synopsis: self.synopsis.filter(|s| !s.is_empty()),
            genres,
            season,
            aggregate_score: self
                .average_rating
                .as_deref()
                .and_then(|s| s.parse::<f32>().ok())
                .map(|r| r / 10.0),
            status: self.status.as_deref().and_then(airing_from_kitsu),
            cover_url: self.poster_image.and_then(|p| p.large.or(p.medium)),
        }
    }
}

impl KitsuLibraryAttributes {
    /// `ratingTwenty` is on a 2-20 scale.
    pub fn into_library_entry(self, media_id: u64, library_id: String) -> Result<LibraryEntry, String> {
        let raw = self.status.as_deref().unwrap_or("current");
        let status = status_from_kitsu(raw).ok_or_else(|| format!("unknown library status `{raw}`"))?;
        Ok(LibraryEntry {
            media_id,
            library_id: Some(library_id),
            status,
            watched_episodes: self.progress.unwrap_or(0),
            score: self.rating_twenty.filter(|&r| r > 0).map(|r| r as f32 / 2.0),
            start_date: self.started_at.as_deref().and_then(parse_date),
            finish_date: self.finished_at.as_deref().and_then(parse_date),
            last_updated: self
                .updated_at
                .as_deref()
                .and_then(parse_timestamp)
                .unwrap_or_else(Utc::now),
        })
    }
}
