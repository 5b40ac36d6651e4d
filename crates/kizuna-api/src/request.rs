use std::collections::BTreeMap;

use chrono::NaiveDate;
use kizuna_core::models::{AnimeSeason, Credential, LibraryEntry, MediaEntry, WatchStatus};

use crate::error::{BuildError, ErrorClass, ErrorInfo};

/// The closed set of operations every service adapter understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RequestType {
    AddLibraryEntry,
    AuthenticateUser,
    DeleteLibraryEntry,
    GetLibraryEntries,
    GetMetadataById,
    GetSeason,
    SearchTitle,
    UpdateLibraryEntry,
}

impl RequestType {
    pub const ALL: &[RequestType] = &[
        Self::AddLibraryEntry,
        Self::AuthenticateUser,
        Self::DeleteLibraryEntry,
        Self::GetLibraryEntries,
        Self::GetMetadataById,
        Self::GetSeason,
        Self::SearchTitle,
        Self::UpdateLibraryEntry,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AddLibraryEntry => "AddLibraryEntry",
            Self::AuthenticateUser => "AuthenticateUser",
            Self::DeleteLibraryEntry => "DeleteLibraryEntry",
            Self::GetLibraryEntries => "GetLibraryEntries",
            Self::GetMetadataById => "GetMetadataById",
            Self::GetSeason => "GetSeason",
            Self::SearchTitle => "SearchTitle",
            Self::UpdateLibraryEntry => "UpdateLibraryEntry",
        }
    }

    /// Operations that change the user's remote library.
    pub fn is_mutation(self) -> bool {
        matches!(
            self,
            Self::AddLibraryEntry | Self::UpdateLibraryEntry | Self::DeleteLibraryEntry
        )
    }
}

impl std::fmt::Display for RequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameter names understood by the adapters.
pub mod param {
    pub const MEDIA_ID: &str = "media_id";
    pub const LIBRARY_ID: &str = "library_id";
    pub const USER_ID: &str = "user_id";
    pub const STATUS: &str = "status";
    pub const WATCHED_EPISODES: &str = "watched_episodes";
    pub const SCORE: &str = "score";
    pub const START_DATE: &str = "start_date";
    pub const FINISH_DATE: &str = "finish_date";
    pub const QUERY: &str = "query";
    pub const SEASON: &str = "season";
    pub const YEAR: &str = "year";
    pub const PAGE: &str = "page";
    pub const OFFSET: &str = "offset";
    pub const CODE: &str = "code";
    pub const CODE_VERIFIER: &str = "code_verifier";
    pub const USERNAME: &str = "username";
    pub const PASSWORD: &str = "password";
    pub const REFRESH_TOKEN: &str = "refresh_token";
    pub const CLIENT_ID: &str = "client_id";
    pub const CLIENT_SECRET: &str = "client_secret";

    /// Values that must never show up in logs.
    pub(crate) const SECRET: &[&str] = &[PASSWORD, REFRESH_TOKEN, CODE, CODE_VERIFIER, CLIENT_SECRET];
}

/// Named request parameters.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Parameters(BTreeMap<String, String>);

impl Parameters {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl ToString) {
        self.0.insert(key.into(), value.to_string());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl std::fmt::Debug for Parameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.0.iter().map(|(k, v)| {
                let v = if param::SECRET.contains(&k.as_str()) {
                    "<redacted>"
                } else {
                    v.as_str()
                };
                (k, v)
            }))
            .finish()
    }
}

/// A canonical, service-independent request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    request_type: RequestType,
    parameters: Parameters,
}

impl Request {
    pub fn new(request_type: RequestType) -> Self {
        Self {
            request_type,
            parameters: Parameters::default(),
        }
    }

    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.parameters.insert(key, value);
        self
    }

    pub fn with_opt<V: ToString>(self, key: &str, value: Option<V>) -> Self {
        match value {
            Some(v) => self.with(key, v),
            None => self,
        }
    }

    /// A copy of this request with one more parameter, used by adapters to
    /// continue a multi-step exchange.
    pub fn continued(&self, key: &str, value: impl ToString) -> Self {
        self.clone().with(key, value)
    }

    pub fn request_type(&self) -> RequestType {
        self.request_type
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).filter(|v| !v.is_empty())
    }

    // ── Canonical constructors ──────────────────────────────────

    pub fn add_entry(entry: &LibraryEntry) -> Self {
        Self::with_entry(RequestType::AddLibraryEntry, entry)
    }

    pub fn update_entry(entry: &LibraryEntry) -> Self {
        Self::with_entry(RequestType::UpdateLibraryEntry, entry)
    }

    pub fn delete_entry(media_id: u64, library_id: Option<&str>) -> Self {
        Self::new(RequestType::DeleteLibraryEntry)
            .with(param::MEDIA_ID, media_id)
            .with_opt(param::LIBRARY_ID, library_id)
    }

    pub fn library() -> Self {
        Self::new(RequestType::GetLibraryEntries)
    }

    pub fn metadata(media_id: u64) -> Self {
        Self::new(RequestType::GetMetadataById).with(param::MEDIA_ID, media_id)
    }

    pub fn search(query: &str) -> Self {
        Self::new(RequestType::SearchTitle).with(param::QUERY, query)
    }

    pub fn season(season: AnimeSeason, year: u32) -> Self {
        Self::new(RequestType::GetSeason)
            .with(param::SEASON, season.as_key())
            .with(param::YEAR, year)
    }

    /// Authorization-code exchange (AniList, and MAL when `code_verifier` is set).
    pub fn authorization_code(code: &str, code_verifier: Option<&str>) -> Self {
        Self::new(RequestType::AuthenticateUser)
            .with(param::CODE, code)
            .with_opt(param::CODE_VERIFIER, code_verifier)
    }

    /// Resource-owner password grant (Kitsu).
    pub fn password(username: &str, password: &str) -> Self {
        Self::new(RequestType::AuthenticateUser)
            .with(param::USERNAME, username)
            .with(param::PASSWORD, password)
    }

    pub fn refresh(refresh_token: &str) -> Self {
        Self::new(RequestType::AuthenticateUser).with(param::REFRESH_TOKEN, refresh_token)
    }

    fn with_entry(request_type: RequestType, entry: &LibraryEntry) -> Self {
        Self::new(request_type)
            .with(param::MEDIA_ID, entry.media_id)
            .with_opt(param::LIBRARY_ID, entry.library_id.as_deref())
            .with(param::STATUS, entry.status.as_db_str())
            .with(param::WATCHED_EPISODES, entry.watched_episodes)
            .with_opt(param::SCORE, entry.score)
            .with_opt(param::START_DATE, entry.start_date)
            .with_opt(param::FINISH_DATE, entry.finish_date)
    }

    // ── Typed accessors used by adapters ────────────────────────

    pub fn require(&self, key: &'static str) -> Result<&str, BuildError> {
        self.get(key).ok_or(BuildError::MissingParameter {
            request_type: self.request_type,
            name: key,
        })
    }

    pub fn require_id(&self, key: &'static str) -> Result<u64, BuildError> {
        let raw = self.require(key)?;
        raw.parse().map_err(|_| self.invalid(key, format!("`{raw}` is not a numeric id")))
    }

    pub fn media_id(&self) -> Option<u64> {
        self.get(param::MEDIA_ID).and_then(|v| v.parse().ok())
    }

    pub fn optional_u32(&self, key: &'static str) -> Result<Option<u32>, BuildError> {
        self.get(key)
            .map(|raw| {
                raw.parse()
                    .map_err(|_| self.invalid(key, format!("`{raw}` is not a count")))
            })
            .transpose()
    }

    /// Score on the canonical 0-10 scale.
    pub fn optional_score(&self) -> Result<Option<f32>, BuildError> {
        self.get(param::SCORE)
            .map(|raw| match raw.parse::<f32>() {
                Ok(score) if (0.0..=10.0).contains(&score) => Ok(score),
                _ => Err(self.invalid(param::SCORE, format!("`{raw}` is not a score between 0 and 10"))),
            })
            .transpose()
    }

    pub fn optional_date(&self, key: &'static str) -> Result<Option<NaiveDate>, BuildError> {
        self.get(key)
            .map(|raw| {
                NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                    .map_err(|_| self.invalid(key, format!("`{raw}` is not a YYYY-MM-DD date")))
            })
            .transpose()
    }

    pub fn optional_status(&self) -> Result<Option<WatchStatus>, BuildError> {
        self.get(param::STATUS)
            .map(|raw| {
                WatchStatus::from_db_str(raw)
                    .ok_or_else(|| self.invalid(param::STATUS, format!("unknown status `{raw}`")))
            })
            .transpose()
    }

    pub fn require_status(&self) -> Result<WatchStatus, BuildError> {
        self.optional_status()?.ok_or(BuildError::MissingParameter {
            request_type: self.request_type,
            name: param::STATUS,
        })
    }

    pub fn require_season(&self) -> Result<(AnimeSeason, u32), BuildError> {
        let raw = self.require(param::SEASON)?;
        let season = AnimeSeason::from_key(raw)
            .ok_or_else(|| self.invalid(param::SEASON, format!("unknown season `{raw}`")))?;
        let year = self
            .optional_u32(param::YEAR)?
            .ok_or(BuildError::MissingParameter {
                request_type: self.request_type,
                name: param::YEAR,
            })?;
        Ok((season, year))
    }

    pub fn invalid(&self, name: &'static str, reason: impl Into<String>) -> BuildError {
        BuildError::InvalidParameter {
            request_type: self.request_type,
            name,
            reason: reason.into(),
        }
    }
}

/// Canonical result data carried by a [`Response`].
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Empty,
    /// Media records in the order the service returned them.
    Media(Vec<MediaEntry>),
    MediaEntry(MediaEntry),
    Library(Vec<LibraryEntry>),
    LibraryEntry(LibraryEntry),
    /// Produced by `AuthenticateUser`; consumed by the client and never
    /// handed to callers.
    Credential(Credential),
}

impl Payload {
    /// Combine the payloads of two consecutive pages.
    pub(crate) fn merge(self, next: Payload) -> Payload {
        match (self, next) {
            (Payload::Media(mut a), Payload::Media(b)) => {
                a.extend(b);
                Payload::Media(a)
            }
            (Payload::Library(mut a), Payload::Library(b)) => {
                a.extend(b);
                Payload::Library(a)
            }
            (prev, Payload::Empty) => prev,
            (_, next) => next,
        }
    }
}

/// Canonical outcome of one request.
///
/// The response type always equals the type of the request that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    request_type: RequestType,
    pub payload: Payload,
    pub error: Option<ErrorInfo>,
    /// Another request of the same type needed to finish this exchange.
    pub follow_up: Option<Request>,
}

impl Response {
    pub fn success(request: &Request, payload: Payload) -> Self {
        Self {
            request_type: request.request_type,
            payload,
            error: None,
            follow_up: None,
        }
    }

    pub fn failure(request: &Request, error: ErrorInfo) -> Self {
        Self {
            request_type: request.request_type,
            payload: Payload::Empty,
            error: Some(error),
            follow_up: None,
        }
    }

    pub fn continue_with(request: &Request, payload: Payload, next: Request) -> Self {
        debug_assert_eq!(request.request_type, next.request_type);
        Self {
            request_type: request.request_type,
            payload,
            error: None,
            follow_up: Some(next),
        }
    }

    pub fn request_type(&self) -> RequestType {
        self.request_type
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn error_class(&self) -> Option<ErrorClass> {
        self.error.as_ref().map(|e| e.class)
    }

    pub fn into_result(self) -> Result<Payload, ErrorInfo> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.payload),
        }
    }
}
