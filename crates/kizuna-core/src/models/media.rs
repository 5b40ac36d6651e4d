use chrono::Datelike;
use serde::{Deserialize, Serialize};

/// Airing state of a title as reported by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiringStatus {
    Airing,
    Finished,
    NotYetAired,
}

impl AiringStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Airing => "Airing",
            Self::Finished => "Finished",
            Self::NotYetAired => "Not yet aired",
        }
    }
}

/// Anime season (quarter of the year).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnimeSeason {
    Winter,
    Spring,
    Summer,
    Fall,
}

impl AnimeSeason {
    pub const ALL: &[AnimeSeason] = &[Self::Winter, Self::Spring, Self::Summer, Self::Fall];

    /// Lowercase key, as used in request parameters and by MAL and Kitsu.
    pub fn as_key(self) -> &'static str {
        match self {
            Self::Winter => "winter",
            Self::Spring => "spring",
            Self::Summer => "summer",
            Self::Fall => "fall",
        }
    }

    /// Parse a season name case-insensitively. "autumn" is accepted for fall.
    pub fn from_key(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "winter" => Some(Self::Winter),
            "spring" => Some(Self::Spring),
            "summer" => Some(Self::Summer),
            "fall" | "autumn" => Some(Self::Fall),
            _ => None,
        }
    }

    pub fn from_month(month: u32) -> Self {
        match month {
            1..=3 => Self::Winter,
            4..=6 => Self::Spring,
            7..=9 => Self::Summer,
            _ => Self::Fall,
        }
    }

    /// Determine the current anime season from the current month.
    pub fn current() -> Self {
        Self::from_month(chrono::Utc::now().month())
    }
}

impl std::fmt::Display for AnimeSeason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Winter => write!(f, "Winter"),
            Self::Spring => write!(f, "Spring"),
            Self::Summer => write!(f, "Summer"),
            Self::Fall => write!(f, "Fall"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeasonInfo {
    pub season: AnimeSeason,
    pub year: u32,
}

/// Snapshot of a title's remote metadata at fetch time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaEntry {
    pub id: u64,
    pub title: String,
    pub synonyms: Vec<String>,
    pub episode_count: Option<u32>,
    pub synopsis: Option<String>,
    pub genres: Vec<String>,
    pub season: Option<SeasonInfo>,
    /// Aggregate community score on a 0-10 scale.
    pub aggregate_score: Option<f32>,
    pub status: Option<AiringStatus>,
    pub cover_url: Option<String>,
}

impl MediaEntry {
    pub fn new(id: u64, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            synonyms: Vec::new(),
            episode_count: None,
            synopsis: None,
            genres: Vec::new(),
            season: None,
            aggregate_score: None,
            status: None,
            cover_url: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_season_from_month() {
        assert_eq!(AnimeSeason::from_month(1), AnimeSeason::Winter);
        assert_eq!(AnimeSeason::from_month(6), AnimeSeason::Spring);
        assert_eq!(AnimeSeason::from_month(9), AnimeSeason::Summer);
        assert_eq!(AnimeSeason::from_month(12), AnimeSeason::Fall);
    }

    #[test]
    fn test_season_keys() {
        for season in AnimeSeason::ALL {
            assert_eq!(AnimeSeason::from_key(season.as_key()), Some(*season));
        }
        assert_eq!(AnimeSeason::from_key("Autumn"), Some(AnimeSeason::Fall));
        assert_eq!(AnimeSeason::from_key("monsoon"), None);
    }
}
