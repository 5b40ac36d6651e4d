use serde::{Deserialize, Serialize};

/// A remote tracking service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceKind {
    #[serde(rename = "anilist")]
    AniList,
    #[serde(rename = "kitsu")]
    Kitsu,
    #[serde(rename = "mal")]
    MyAnimeList,
}

impl ServiceKind {
    pub const ALL: &[ServiceKind] = &[Self::AniList, Self::Kitsu, Self::MyAnimeList];

    /// Stable key used in config files and storage.
    pub fn as_key(self) -> &'static str {
        match self {
            Self::AniList => "anilist",
            Self::Kitsu => "kitsu",
            Self::MyAnimeList => "mal",
        }
    }

    pub fn from_key(s: &str) -> Option<Self> {
        match s {
            "anilist" => Some(Self::AniList),
            "kitsu" => Some(Self::Kitsu),
            "mal" | "myanimelist" => Some(Self::MyAnimeList),
            _ => None,
        }
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AniList => write!(f, "AniList"),
            Self::Kitsu => write!(f, "Kitsu"),
            Self::MyAnimeList => write!(f, "MyAnimeList"),
        }
    }
}
