use chrono::Utc;
use kizuna_core::models::{AiringStatus, AnimeSeason, LibraryEntry, MediaEntry, SeasonInfo, WatchStatus};
use serde::Deserialize;

use crate::document::{parse_date, parse_timestamp};

// ── Anime responses ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct MalPageResponse<T> {
    pub data: Vec<T>,
    #[serde(default)]
    pub paging: MalPaging,
}

#[derive(Debug, Deserialize)]
pub struct MalSearchNode {
    pub node: MalAnimeNode,
}

#[derive(Debug, Deserialize)]
pub struct MalAnimeNode {
    pub id: u64,
    pub title: String,
    pub main_picture: Option<MalPicture>,
    pub alternative_titles: Option<MalAlternativeTitles>,
    pub num_episodes: Option<u32>,
    pub status: Option<String>,
    pub synopsis: Option<String>,
    pub genres: Option<Vec<MalGenre>>,
    pub mean: Option<f32>,
    pub start_season: Option<MalSeason>,
}

#[derive(Debug, Deserialize)]
pub struct MalPicture {
    pub medium: Option<String>,
    pub large: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MalAlternativeTitles {
    pub en: Option<String>,
    pub ja: Option<String>,
    pub synonyms: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct MalGenre {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct MalSeason {
    pub year: u32,
    pub season: String,
}

// ── User anime list responses ───────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct MalAnimeListItem {
    pub node: MalAnimeNode,
    pub list_status: MalListStatus,
}

/// `list_status` object, also returned by `PUT /anime/{id}/my_list_status`.
#[derive(Debug, Deserialize)]
pub struct MalListStatus {
    pub status: Option<String>,
    pub num_episodes_watched: Option<u32>,
    pub score: Option<u32>,
    pub start_date: Option<String>,
    pub finish_date: Option<String>,
    pub updated_at: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MalPaging {
    pub next: Option<String>,
}

// ── Status mapping ──────────────────────────────────────────────

pub fn status_to_mal(status: WatchStatus) -> &'static str {
    match status {
        WatchStatus::Watching => "watching",
        WatchStatus::Completed => "completed",
        WatchStatus::OnHold => "on_hold",
        WatchStatus::Dropped => "dropped",
        WatchStatus::PlanToWatch => "plan_to_watch",
    }
}

pub fn status_from_mal(s: &str) -> Option<WatchStatus> {
    match s {
        "watching" => Some(WatchStatus::Watching),
        "completed" => Some(WatchStatus::Completed),
        "on_hold" => Some(WatchStatus::OnHold),
        "dropped" => Some(WatchStatus::Dropped),
        "plan_to_watch" => Some(WatchStatus::PlanToWatch),
        _ => None,
    }
}

fn airing_from_mal(s: &str) -> Option<AiringStatus> {
    match s {
        "currently_airing" => Some(AiringStatus::Airing),
        "finished_airing" => Some(AiringStatus::Finished),
        "not_yet_aired" => Some(AiringStatus::NotYetAired),
        _ => None,
    }
}

// ── Conversions ─────────────────────────────────────────────────

impl MalAnimeNode {
    pub fn into_media_entry(self) -> MediaEntry {
        let mut synonyms = Vec::new();
        if let Some(alt) = self.alternative_titles {
            synonyms.extend(alt.en.filter(|t| !t.is_empty() && *t != self.title));
            synonyms.extend(alt.ja.filter(|t| !t.is_empty()));
            synonyms.extend(alt.synonyms.unwrap_or_default());
        }

        MediaEntry {
            id: self.id,
            title: self.title,
            synonyms,
            episode_count: self.num_episodes.filter(|&n| n > 0),
            synopsis: self.synopsis.filter(|s| !s.is_empty()),
            genres: self
                .genres
                .map(|g| g.into_iter().map(|x| x.name).collect())
                .unwrap_or_default(),
            season: self.start_season.and_then(|s| {
                AnimeSeason::from_key(&s.season).map(|season| SeasonInfo {
                    season,
                    year: s.year,
                })
            }),
            aggregate_score: self.mean,
            status: self.status.as_deref().and_then(airing_from_mal),
            cover_url: self.main_picture.and_then(|pic| pic.large.or(pic.medium)),
        }
    }
}

impl MalListStatus {
    /// MAL reports an unscored entry as 0.
    pub fn into_library_entry(self, media_id: u64) -> Result<LibraryEntry, String> {
        let status = self.status.as_deref().unwrap_or("watching");
        let status = status_from_mal(status).ok_or_else(|| format!("unknown list status `{status}`"))?;
        Ok(LibraryEntry {
            media_id,
            library_id: None,
            status,
            watched_episodes: self.num_episodes_watched.unwrap_or(0),
            score: self.score.filter(|&s| s > 0).map(|s| s as f32),
            start_date: self.start_date.as_deref().and_then(parse_date),
            finish_date: self.finish_date.as_deref().and_then(parse_date),
            last_updated: self
                .updated_at
                .as_deref()
                .and_then(parse_timestamp)
                .unwrap_or_else(Utc::now),
        })
    }
}
