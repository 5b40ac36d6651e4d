use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// User's watch status for a library entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchStatus {
    Watching,
    Completed,
    OnHold,
    Dropped,
    PlanToWatch,
}

impl WatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Watching => "Watching",
            Self::Completed => "Completed",
            Self::OnHold => "On Hold",
            Self::Dropped => "Dropped",
            Self::PlanToWatch => "Plan to Watch",
        }
    }

    /// Database string representation (lowercase, no spaces).
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Watching => "watching",
            Self::Completed => "completed",
            Self::OnHold => "on_hold",
            Self::Dropped => "dropped",
            Self::PlanToWatch => "plan_to_watch",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "watching" => Some(Self::Watching),
            "completed" => Some(Self::Completed),
            "on_hold" | "on-hold" => Some(Self::OnHold),
            "dropped" => Some(Self::Dropped),
            "plan_to_watch" | "plan-to-watch" => Some(Self::PlanToWatch),
            _ => None,
        }
    }

    pub const ALL: &[WatchStatus] = &[
        Self::Watching,
        Self::Completed,
        Self::OnHold,
        Self::Dropped,
        Self::PlanToWatch,
    ];
}

impl std::fmt::Display for WatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user's library entry on one service, keyed by the service's media id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LibraryEntry {
    pub media_id: u64,
    /// The service's own id for the list entry, when it differs from the media id.
    pub library_id: Option<String>,
    pub status: WatchStatus,
    pub watched_episodes: u32,
    /// Score on a 0-10 scale.
    pub score: Option<f32>,
    pub start_date: Option<NaiveDate>,
    pub finish_date: Option<NaiveDate>,
    pub last_updated: DateTime<Utc>,
}

impl LibraryEntry {
    pub fn new(media_id: u64, status: WatchStatus) -> Self {
        Self {
            media_id,
            library_id: None,
            status,
            watched_episodes: 0,
            score: None,
            start_date: None,
            finish_date: None,
            last_updated: Utc::now(),
        }
    }

    /// True when both entries carry the same user-editable values.
    pub fn same_values(&self, other: &LibraryEntry) -> bool {
        self.media_id == other.media_id
            && self.status == other.status
            && self.watched_episodes == other.watched_episodes
            && self.score == other.score
            && self.start_date == other.start_date
            && self.finish_date == other.finish_date
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_str_roundtrip() {
        for status in WatchStatus::ALL {
            assert_eq!(WatchStatus::from_db_str(status.as_db_str()), Some(*status));
        }
        assert_eq!(WatchStatus::from_db_str("plan-to-watch"), Some(WatchStatus::PlanToWatch));
        assert_eq!(WatchStatus::from_db_str("rewatching"), None);
    }

    #[test]
    fn test_same_values_ignores_timestamps() {
        let a = LibraryEntry::new(1, WatchStatus::Watching);
        let mut b = a.clone();
        b.last_updated = a.last_updated + chrono::Duration::hours(1);
        b.library_id = Some("42".into());
        assert!(a.same_values(&b));

        b.watched_episodes = 3;
        assert!(!a.same_values(&b));
    }
}
