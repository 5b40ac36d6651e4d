use kizuna_core::models::{Credential, ServiceKind, WatchStatus};
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};

use super::queries;
use super::types::{
    fuzzy_date_input, status_from_anilist, status_to_anilist, AniListMedia, Deleted, GraphQLResponse,
    MediaListCollection, MediaListEntry, MediaListId, MediaPage, Viewer,
};
use crate::adapter::{absolute, scale_score, status_error, token_response, ServiceAdapter, REDIRECT_URI};
use crate::document::{decode, json_body, parse};
use crate::error::{BuildError, ErrorClass, ErrorInfo};
use crate::request::{param, Payload, Request, RequestType, Response};
use crate::transport::{HttpRequest, HttpResponse, Method};

const TOKEN_URL: &str = "https://anilist.co/api/v2/oauth/token";
const JSON: &str = "application/json";

/// Which GraphQL document a request maps to, given the ids resolved so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Viewer,
    Library { user_id: u64 },
    Save,
    FindEntry { media_id: u64, user_id: u64 },
    Delete { library_id: u64 },
    Media,
    Search,
    Season { page: u32 },
}

/// AniList GraphQL adapter.
///
/// Library listing and deletion first resolve the viewer's user id, and
/// deletion then resolves the list entry id, through follow-up requests.
pub struct AniListAdapter {
    api_url: String,
    client_id: Option<String>,
    client_secret: Option<String>,
}

impl AniListAdapter {
    pub fn new(api_url: &str, client_id: Option<String>, client_secret: Option<String>) -> Self {
        Self {
            api_url: api_url.to_string(),
            client_id: client_id.filter(|c| !c.is_empty()),
            client_secret: client_secret.filter(|c| !c.is_empty()),
        }
    }

    fn step(&self, request: &Request) -> Result<Step, BuildError> {
        let user_id = request.get(param::USER_ID).is_some();
        Ok(match request.request_type() {
            RequestType::GetLibraryEntries if user_id => Step::Library {
                user_id: request.require_id(param::USER_ID)?,
            },
            RequestType::GetLibraryEntries => Step::Viewer,
            RequestType::AddLibraryEntry | RequestType::UpdateLibraryEntry => Step::Save,
            RequestType::DeleteLibraryEntry => {
                let media_id = request.require_id(param::MEDIA_ID)?;
                if request.get(param::LIBRARY_ID).is_some() {
                    Step::Delete {
                        library_id: request.require_id(param::LIBRARY_ID)?,
                    }
                } else if user_id {
                    Step::FindEntry {
                        media_id,
                        user_id: request.require_id(param::USER_ID)?,
                    }
                } else {
                    Step::Viewer
                }
            }
            RequestType::GetMetadataById => Step::Media,
            RequestType::SearchTitle => Step::Search,
            RequestType::GetSeason => Step::Season {
                page: request.optional_u32(param::PAGE)?.unwrap_or(1),
            },
            RequestType::AuthenticateUser => {
                return Err(request.invalid(param::CODE, "not a GraphQL request"))
            }
        })
    }

    fn graphql(&self, request: &Request, step: Step) -> Result<(&'static str, Value), BuildError> {
        Ok(match step {
            Step::Viewer => (queries::VIEWER, json!({})),
            Step::Library { user_id } => (queries::LIBRARY, json!({ "userId": user_id })),
            Step::Save => (queries::SAVE_ENTRY, self.save_variables(request)?),
            Step::FindEntry { media_id, user_id } => (
                queries::FIND_ENTRY,
                json!({ "mediaId": media_id, "userId": user_id }),
            ),
            Step::Delete { library_id } => (queries::DELETE_ENTRY, json!({ "id": library_id })),
            Step::Media => (
                queries::MEDIA,
                json!({ "id": request.require_id(param::MEDIA_ID)? }),
            ),
            Step::Search => (
                queries::SEARCH,
                json!({ "search": request.require(param::QUERY)? }),
            ),
            Step::Season { page } => {
                let (season, year) = request.require_season()?;
                (
                    queries::SEASON,
                    json!({
                        "season": season.as_key().to_uppercase(),
                        "seasonYear": year,
                        "page": page,
                    }),
                )
            }
        })
    }

    fn save_variables(&self, request: &Request) -> Result<Value, BuildError> {
        let mut vars = Map::new();
        vars.insert("mediaId".into(), json!(request.require_id(param::MEDIA_ID)?));

        let status = match request.request_type() {
            RequestType::AddLibraryEntry => Some(request.require_status()?),
            _ => request.optional_status()?,
        };
        if let Some(status) = status {
            vars.insert("status".into(), json!(status_to_anilist(status)));
        }
        if let Some(progress) = request.optional_u32(param::WATCHED_EPISODES)? {
            vars.insert("progress".into(), json!(progress));
        }
        if let Some(score) = request.optional_score()? {
            vars.insert("scoreRaw".into(), json!(scale_score(score, 100)));
        }
        if let Some(date) = request.optional_date(param::START_DATE)? {
            vars.insert("startedAt".into(), fuzzy_date_input(date));
        }
        if let Some(date) = request.optional_date(param::FINISH_DATE)? {
            vars.insert("completedAt".into(), fuzzy_date_input(date));
        }
        if vars.len() == 1 {
            return Err(request.invalid(param::STATUS, "nothing to update"));
        }
        Ok(Value::Object(vars))
    }

    fn build_token_request(&self, request: &Request) -> Result<HttpRequest, BuildError> {
        let missing = |name| BuildError::MissingParameter {
            request_type: request.request_type(),
            name,
        };
        let client_id = request
            .get(param::CLIENT_ID)
            .or(self.client_id.as_deref())
            .ok_or_else(|| missing(param::CLIENT_ID))?;
        let client_secret = request
            .get(param::CLIENT_SECRET)
            .or(self.client_secret.as_deref())
            .ok_or_else(|| missing(param::CLIENT_SECRET))?;
        let body = json!({
            "grant_type": "authorization_code",
            "client_id": client_id,
            "client_secret": client_secret,
            "redirect_uri": REDIRECT_URI,
            "code": request.require(param::CODE)?,
        });
        Ok(HttpRequest::new(Method::POST, absolute(TOKEN_URL, request)?)
            .header("Accept", JSON)
            .body(JSON, json_body(&body)))
    }

    fn handle_graphql(&self, request: &Request, response: &HttpResponse) -> Result<Response, ErrorInfo> {
        if !response.is_success() {
            let envelope = serde_json::from_slice::<GraphQLResponse>(&response.body).ok();
            return Err(match envelope.as_ref().and_then(|e| e.errors.first()) {
                Some(error) => classify_graphql_error(response, error.status, &error.message),
                None => status_error(response),
            });
        }

        let envelope: GraphQLResponse = parse(&response.body)?;
        if let Some(error) = envelope.errors.first() {
            return Err(classify_graphql_error(response, error.status, &error.message));
        }
        let mut data = envelope
            .data
            .ok_or_else(|| ErrorInfo::malformed("GraphQL response without data"))?;

        let step = self
            .step(request)
            .map_err(|e| ErrorInfo::malformed(e.to_string()))?;
        Ok(match step {
            Step::Viewer => {
                let viewer: Viewer = field(&mut data, "Viewer")?;
                Response::continue_with(
                    request,
                    Payload::Empty,
                    request.continued(param::USER_ID, viewer.id),
                )
            }
            Step::Library { .. } => {
                let collection: MediaListCollection = field(&mut data, "MediaListCollection")?;
                let entries = collection
                    .lists
                    .into_iter()
                    .flat_map(|list| list.entries)
                    .map(MediaListEntry::into_library_entry)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(ErrorInfo::malformed)?;
                Response::success(request, Payload::Library(dedup_by_media(entries)))
            }
            Step::Save => {
                let entry: MediaListEntry = field(&mut data, "SaveMediaListEntry")?;
                let entry = entry.into_library_entry().map_err(ErrorInfo::malformed)?;
                Response::success(request, Payload::LibraryEntry(entry))
            }
            Step::FindEntry { media_id, .. } => {
                let found: Option<MediaListId> = field(&mut data, "MediaList")?;
                let Some(found) = found else {
                    return Err(ErrorInfo::not_found(format!("media {media_id} is not in the list")));
                };
                Response::continue_with(
                    request,
                    Payload::Empty,
                    request.continued(param::LIBRARY_ID, found.id),
                )
            }
            Step::Delete { library_id } => {
                let deleted: Deleted = field(&mut data, "DeleteMediaListEntry")?;
                if deleted.deleted != Some(true) {
                    return Err(ErrorInfo::not_found(format!("list entry {library_id} was not deleted")));
                }
                Response::success(request, Payload::Empty)
            }
            Step::Media => {
                let media: Option<AniListMedia> = field(&mut data, "Media")?;
                let media = media.ok_or_else(|| ErrorInfo::not_found("no such media"))?;
                Response::success(request, Payload::MediaEntry(media.into_media_entry()))
            }
            Step::Search => {
                let page: MediaPage = field(&mut data, "Page")?;
                let media = page.media.into_iter().map(AniListMedia::into_media_entry).collect();
                Response::success(request, Payload::Media(media))
            }
            Step::Season { page } => {
                let result: MediaPage = field(&mut data, "Page")?;
                let has_next = result
                    .page_info
                    .and_then(|p| p.has_next_page)
                    .unwrap_or(false);
                let media = Payload::Media(
                    result.media.into_iter().map(AniListMedia::into_media_entry).collect(),
                );
                if has_next {
                    Response::continue_with(request, media, request.continued(param::PAGE, page + 1))
                } else {
                    Response::success(request, media)
                }
            }
        })
    }
}

impl ServiceAdapter for AniListAdapter {
    fn kind(&self) -> ServiceKind {
        ServiceKind::AniList
    }

    fn request_needs_authentication(&self, request_type: RequestType) -> bool {
        !matches!(
            request_type,
            RequestType::AuthenticateUser
                | RequestType::GetMetadataById
                | RequestType::SearchTitle
                | RequestType::GetSeason
        )
    }

    fn build_request(
        &self,
        request: &Request,
        credential: Option<&Credential>,
    ) -> Result<HttpRequest, BuildError> {
        if request.request_type() == RequestType::AuthenticateUser {
            return self.build_token_request(request);
        }

        let step = self.step(request)?;
        let (query, variables) = self.graphql(request, step)?;
        let body = json!({ "query": query, "variables": variables });
        let mut http = HttpRequest::new(Method::POST, absolute(&self.api_url, request)?)
            .header("Accept", JSON)
            .body(JSON, json_body(&body));
        if let Some(cred) = credential {
            http = http.header("Authorization", cred.bearer());
        }
        Ok(http)
    }

    fn handle_response(&self, request: &Request, response: HttpResponse) -> Response {
        let result = match request.request_type() {
            RequestType::AuthenticateUser => Ok(token_response(request, &response)),
            _ => self.handle_graphql(request, &response),
        };
        result.unwrap_or_else(|error| Response::failure(request, error))
    }

    fn encode_status(&self, status: WatchStatus) -> &'static str {
        status_to_anilist(status)
    }

    fn decode_status(&self, value: &str) -> Option<WatchStatus> {
        status_from_anilist(value)
    }
}

fn field<T: DeserializeOwned>(data: &mut Value, key: &str) -> Result<T, ErrorInfo> {
    let value = data.get_mut(key).map(Value::take).unwrap_or(Value::Null);
    decode(value)
}

/// AniList reports most failures as `errors` entries, often with HTTP 200.
fn classify_graphql_error(response: &HttpResponse, status: Option<u16>, message: &str) -> ErrorInfo {
    let lower = message.to_ascii_lowercase();
    if lower.contains("invalid token") || lower.contains("unauthorized") {
        return ErrorInfo::authentication(message);
    }
    let status = status
        .filter(|s| !(200..300).contains(s))
        .unwrap_or(response.status);
    match ErrorClass::from_status(status) {
        Some(_) => ErrorInfo::from_status(status, message, response.retry_after()),
        None => ErrorInfo::rejected(message),
    }
}

/// A title can appear in several custom lists; keep the first occurrence.
fn dedup_by_media(entries: Vec<kizuna_core::models::LibraryEntry>) -> Vec<kizuna_core::models::LibraryEntry> {
    let mut seen = std::collections::HashSet::new();
    entries
        .into_iter()
        .filter(|e| seen.insert(e.media_id))
        .collect()
}
