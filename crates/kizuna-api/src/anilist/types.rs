use chrono::{DateTime, NaiveDate, Utc};
use kizuna_core::models::{AiringStatus, AnimeSeason, LibraryEntry, MediaEntry, SeasonInfo, WatchStatus};
use serde::Deserialize;
use serde_json::{json, Value};

// ── GraphQL envelope ────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct GraphQLResponse {
    pub data: Option<Value>,
    #[serde(default)]
    pub errors: Vec<GraphQLError>,
}

#[derive(Debug, Deserialize)]
pub struct GraphQLError {
    pub message: String,
    pub status: Option<u16>,
}

// ── Query results ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct Viewer {
    pub id: u64,
}

#[derive(Debug, Deserialize)]
pub struct MediaListCollection {
    #[serde(default)]
    pub lists: Vec<MediaListGroup>,
}

#[derive(Debug, Deserialize)]
pub struct MediaListGroup {
    #[serde(default)]
    pub entries: Vec<MediaListEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaListEntry {
    pub id: u64,
    pub media_id: u64,
    pub status: Option<String>,
    pub progress: Option<u32>,
    pub score: Option<f32>,
    pub started_at: Option<FuzzyDate>,
    pub completed_at: Option<FuzzyDate>,
    pub updated_at: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct MediaListId {
    pub id: u64,
}

#[derive(Debug, Deserialize)]
pub struct Deleted {
    pub deleted: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct MediaPage {
    #[serde(rename = "pageInfo")]
    pub page_info: Option<PageInfo>,
    #[serde(default)]
    pub media: Vec<AniListMedia>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub has_next_page: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AniListMedia {
    pub id: u64,
    pub title: MediaTitle,
    #[serde(default)]
    pub synonyms: Vec<String>,
    pub episodes: Option<u32>,
    pub description: Option<String>,
    #[serde(default)]
    pub genres: Vec<String>,
    pub season: Option<String>,
    pub season_year: Option<u32>,
    pub average_score: Option<u32>,
    pub status: Option<String>,
    pub cover_image: Option<CoverImage>,
}

#[derive(Debug, Deserialize)]
pub struct MediaTitle {
    pub romaji: Option<String>,
    pub english: Option<String>,
    pub native: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CoverImage {
    pub large: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FuzzyDate {
    pub year: Option<i32>,
    pub month: Option<u32>,
    pub day: Option<u32>,
}

impl FuzzyDate {
    pub fn to_date(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year?, self.month.unwrap_or(1), self.day.unwrap_or(1))
    }
}

/// `FuzzyDateInput` variable value.
pub fn fuzzy_date_input(date: NaiveDate) -> Value {
    use chrono::Datelike;
    json!({ "year": date.year(), "month": date.month(), "day": date.day() })
}

// ── Status mapping ──────────────────────────────────────────────

pub fn status_to_anilist(status: WatchStatus) -> &'static str {
    match status {
        WatchStatus::Watching => "CURRENT",
        WatchStatus::Completed => "COMPLETED",
        WatchStatus::OnHold => "PAUSED",
        WatchStatus::Dropped => "DROPPED",
        WatchStatus::PlanToWatch => "PLANNING",
    }
}

/// REPEATING has no canonical counterpart; a rewatch is still watching.
pub fn status_from_anilist(s: &str) -> Option<WatchStatus> {
    match s {
        "CURRENT" | "REPEATING" => Some(WatchStatus::Watching),
        "COMPLETED" => Some(WatchStatus::Completed),
        "PAUSED" => Some(WatchStatus::OnHold),
        "DROPPED" => Some(WatchStatus::Dropped),
        "PLANNING" => Some(WatchStatus::PlanToWatch),
        _ => None,
    }
}

fn airing_from_anilist(s: &str) -> Option<AiringStatus> {
    match s {
        "RELEASING" | "HIATUS" => Some(AiringStatus::Airing),
        "FINISHED" => Some(AiringStatus::Finished),
        "NOT_YET_RELEASED" => Some(AiringStatus::NotYetAired),
        _ => None,
    }
}

// ── Conversions ─────────────────────────────────────────────────

impl AniListMedia {
    pub fn into_media_entry(self) -> MediaEntry {
        let MediaTitle {
            romaji,
            english,
            native,
        } = self.title;
        let title = romaji
            .clone()
            .or_else(|| english.clone())
            .or_else(|| native.clone())
            .unwrap_or_default();

        let mut synonyms: Vec<String> = [romaji, english, native]
            .into_iter()
            .flatten()
            .filter(|t| !t.is_empty() && *t != title)
            .collect();
        for synonym in self.synonyms {
            if !synonyms.contains(&synonym) {
                synonyms.push(synonym);
            }
        }

        MediaEntry {
            id: self.id,
            title,
            synonyms,
            episode_count: self.episodes,
            synopsis: self.description.filter(|d| !d.is_empty()),
            genres: self.genres,
            season: match (self.season.as_deref().and_then(AnimeSeason::from_key), self.season_year) {
                (Some(season), Some(year)) => Some(SeasonInfo { season, year }),
                _ => None,
            },
            aggregate_score: self.average_score.map(|s| s as f32 / 10.0),
            status: self.status.as_deref().and_then(airing_from_anilist),
            cover_url: self.cover_image.and_then(|c| c.large),
        }
    }
}

impl MediaListEntry {
    /// Scores are requested as POINT_100; 0 means unscored.
    pub fn into_library_entry(self) -> Result<LibraryEntry, String> {
        let raw = self.status.as_deref().unwrap_or("CURRENT");
        let status = status_from_anilist(raw).ok_or_else(|| format!("unknown list status `{raw}`"))?;
        Ok(LibraryEntry {
            media_id: self.media_id,
            library_id: Some(self.id.to_string()),
            status,
            watched_episodes: self.progress.unwrap_or(0),
            score: self.score.filter(|&s| s > 0.0).map(|s| s / 10.0),
            start_date: self.started_at.as_ref().and_then(FuzzyDate::to_date),
            finish_date: self.completed_at.as_ref().and_then(FuzzyDate::to_date),
            last_updated: self
                .updated_at
                .filter(|&t| t > 0)
                .and_then(|t| DateTime::from_timestamp(t, 0))
                .unwrap_or_else(Utc::now),
        })
    }
}
