use chrono::NaiveDate;
use kizuna_core::models::{Credential, ServiceKind, WatchStatus};
use serde_json::{json, Map, Value};
use url::Url;

use super::types::{
    status_from_kitsu, status_to_kitsu, JsonApiErrors, JsonApiListResponse, JsonApiResource,
    JsonApiSingleResourceResponse, KitsuAnimeAttributes, KitsuCategoryAttributes,
    KitsuLibraryAttributes,
};
use crate::adapter::{absolute, endpoint, scale_score, status_error, token_response, ServiceAdapter};
use crate::document::{decode, form_body, json_body, parse};
use crate::error::{BuildError, ErrorInfo};
use crate::request::{param, Payload, Request, RequestType, Response};
use crate::transport::{HttpRequest, HttpResponse, Method};

const TOKEN_URL: &str = "https://kitsu.app/api/oauth/token";
const JSON_API: &str = "application/vnd.api+json";
const FORM: &str = "application/x-www-form-urlencoded";

const ANIME_FIELDS: &str = "canonicalTitle,titles,abbreviatedTitles,episodeCount,posterImage,\
                            averageRating,synopsis,status,startDate";
const LIBRARY_FIELDS: &str = "progress,ratingTwenty,status,startedAt,finishedAt,updatedAt,anime";
const LIBRARY_PAGE_SIZE: u32 = 500;
const SEASON_PAGE_SIZE: u32 = 20;

/// Where a request stands in Kitsu's id-resolution chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// Look up the id of the authenticated user.
    SelfUser,
    Library { user_id: u64, offset: u32 },
    Create { user_id: u64 },
    /// Look up the library entry id for a title.
    FindEntry { user_id: u64, media_id: u64 },
    Patch { library_id: u64 },
    Remove { library_id: u64 },
    Media { media_id: u64 },
    Search,
    Season { offset: u32 },
}

/// Kitsu JSON:API adapter.
///
/// Library entries have their own ids; the user id and entry id are resolved
/// with follow-up requests when the caller does not supply them.
pub struct KitsuAdapter {
    base_url: String,
}

impl KitsuAdapter {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
        }
    }

    fn url(&self, path: &str, request: &Request) -> Result<Url, BuildError> {
        endpoint(&self.base_url, path, request)
    }

    fn step(&self, request: &Request) -> Result<Step, BuildError> {
        let has = |key| request.get(key).is_some();
        let user_id = || request.require_id(param::USER_ID);
        let library_id = || request.require_id(param::LIBRARY_ID);
        Ok(match request.request_type() {
            RequestType::GetLibraryEntries if has(param::USER_ID) => Step::Library {
                user_id: user_id()?,
                offset: request.optional_u32(param::OFFSET)?.unwrap_or(0),
            },
            RequestType::AddLibraryEntry if has(param::USER_ID) => Step::Create { user_id: user_id()? },
            RequestType::UpdateLibraryEntry if has(param::LIBRARY_ID) => Step::Patch {
                library_id: library_id()?,
            },
            RequestType::DeleteLibraryEntry if has(param::LIBRARY_ID) => Step::Remove {
                library_id: library_id()?,
            },
            RequestType::UpdateLibraryEntry | RequestType::DeleteLibraryEntry
                if has(param::USER_ID) =>
            {
                Step::FindEntry {
                    user_id: user_id()?,
                    media_id: request.require_id(param::MEDIA_ID)?,
                }
            }
            RequestType::GetLibraryEntries => Step::SelfUser,
            RequestType::AddLibraryEntry
            | RequestType::UpdateLibraryEntry
            | RequestType::DeleteLibraryEntry => {
                // Reject a bad media id before spending a round trip on the user lookup.
                request.require_id(param::MEDIA_ID)?;
                Step::SelfUser
            }
            RequestType::GetMetadataById => Step::Media {
                media_id: request.require_id(param::MEDIA_ID)?,
            },
            RequestType::SearchTitle => Step::Search,
            RequestType::GetSeason => Step::Season {
                offset: request.optional_u32(param::OFFSET)?.unwrap_or(0),
            },
            RequestType::AuthenticateUser => {
                return Err(request.invalid(param::USERNAME, "not an API request"))
            }
        })
    }

    fn build_token_request(&self, request: &Request) -> Result<HttpRequest, BuildError> {
        let body = if let Some(refresh_token) = request.get(param::REFRESH_TOKEN) {
            form_body(&[("grant_type", "refresh_token"), ("refresh_token", refresh_token)])
        } else {
            form_body(&[
                ("grant_type", "password"),
                ("username", request.require(param::USERNAME)?),
                ("password", request.require(param::PASSWORD)?),
            ])
        };
        Ok(HttpRequest::new(Method::POST, absolute(TOKEN_URL, request)?).body(FORM, body))
    }

    /// `attributes` object for creating or patching a library entry.
    fn entry_attributes(&self, request: &Request) -> Result<Map<String, Value>, BuildError> {
        let mut attrs = Map::new();
        let status = match request.request_type() {
            RequestType::AddLibraryEntry => Some(request.require_status()?),
            _ => request.optional_status()?,
        };
        if let Some(status) = status {
            attrs.insert("status".into(), json!(status_to_kitsu(status)));
        }
        if let Some(progress) = request.optional_u32(param::WATCHED_EPISODES)? {
            attrs.insert("progress".into(), json!(progress));
        }
        if let Some(score) = request.optional_score()? {
            // Kitsu rejects 0; clear the rating instead.
            let rating = scale_score(score, 20);
            let rating = if rating >= 2 { json!(rating) } else { Value::Null };
            attrs.insert("ratingTwenty".into(), rating);
        }
        if let Some(date) = request.optional_date(param::START_DATE)? {
            attrs.insert("startedAt".into(), json!(timestamp(date)));
        }
        if let Some(date) = request.optional_date(param::FINISH_DATE)? {
            attrs.insert("finishedAt".into(), json!(timestamp(date)));
        }
        if attrs.is_empty() {
            return Err(request.invalid(param::STATUS, "nothing to update"));
        }
        Ok(attrs)
    }

    fn build_step(&self, request: &Request, step: Step) -> Result<HttpRequest, BuildError> {
        Ok(match step {
            Step::SelfUser => {
                let mut url = self.url("users", request)?;
                url.query_pairs_mut().append_pair("filter[self]", "true");
                HttpRequest::new(Method::GET, url)
            }
            Step::Library { user_id, offset } => {
                let mut url = self.url("library-entries", request)?;
                url.query_pairs_mut()
                    .append_pair("filter[userId]", &user_id.to_string())
                    .append_pair("filter[kind]", "anime")
                    .append_pair("include", "anime")
                    .append_pair("fields[libraryEntries]", LIBRARY_FIELDS)
                    .append_pair("fields[anime]", "canonicalTitle")
                    .append_pair("page[limit]", &LIBRARY_PAGE_SIZE.to_string())
                    .append_pair("page[offset]", &offset.to_string());
                HttpRequest::new(Method::GET, url)
            }
            Step::Create { user_id } => {
                let media_id = request.require_id(param::MEDIA_ID)?;
                let body = json!({
                    "data": {
                        "type": "libraryEntries",
                        "attributes": self.entry_attributes(request)?,
                        "relationships": {
                            "user": { "data": { "type": "users", "id": user_id.to_string() } },
                            "anime": { "data": { "type": "anime", "id": media_id.to_string() } }
                        }
                    }
                });
                HttpRequest::new(Method::POST, self.url("library-entries", request)?)
                    .body(JSON_API, json_body(&body))
            }
            Step::FindEntry { user_id, media_id } => {
                let mut url = self.url("library-entries", request)?;
                url.query_pairs_mut()
                    .append_pair("filter[userId]", &user_id.to_string())
                    .append_pair("filter[animeId]", &media_id.to_string())
                    .append_pair("page[limit]", "1");
                HttpRequest::new(Method::GET, url)
            }
            Step::Patch { library_id } => {
                let body = json!({
                    "data": {
                        "type": "libraryEntries",
                        "id": library_id.to_string(),
                        "attributes": self.entry_attributes(request)?
                    }
                });
                let url = self.url(&format!("library-entries/{library_id}"), request)?;
                HttpRequest::new(Method::PATCH, url).body(JSON_API, json_body(&body))
            }
            Step::Remove { library_id } => {
                let url = self.url(&format!("library-entries/{library_id}"), request)?;
                HttpRequest::new(Method::DELETE, url)
            }
            Step::Media { media_id } => {
                let mut url = self.url(&format!("anime/{media_id}"), request)?;
                url.query_pairs_mut()
                    .append_pair("fields[anime]", &format!("{ANIME_FIELDS},categories"))
                    .append_pair("include", "categories")
                    .append_pair("fields[categories]", "title");
                HttpRequest::new(Method::GET, url)
            }
            Step::Search => {
                let mut url = self.url("anime", request)?;
                url.query_pairs_mut()
                    .append_pair("filter[text]", request.require(param::QUERY)?)
                    .append_pair("page[limit]", "10")
                    .append_pair("fields[anime]", ANIME_FIELDS);
                HttpRequest::new(Method::GET, url)
            }
            Step::Season { offset } => {
                let (season, year) = request.require_season()?;
                let mut url = self.url("anime", request)?;
                url.query_pairs_mut()
                    .append_pair("filter[season]", season.as_key())
                    .append_pair("filter[seasonYear]", &year.to_string())
                    .append_pair("sort", "-userCount")
                    .append_pair("page[limit]", &SEASON_PAGE_SIZE.to_string())
                    .append_pair("page[offset]", &offset.to_string())
                    .append_pair("fields[anime]", ANIME_FIELDS);
                HttpRequest::new(Method::GET, url)
            }
        })
    }

    fn handle_success(&self, request: &Request, response: &HttpResponse) -> Result<Response, ErrorInfo> {
        let step = self
            .step(request)
            .map_err(|e| ErrorInfo::malformed(e.to_string()))?;
        Ok(match step {
            Step::SelfUser => {
                let users: JsonApiListResponse = parse(&response.body)?;
                let user = users
                    .data
                    .first()
                    .ok_or_else(|| ErrorInfo::authentication("could not resolve the logged-in user"))?;
                let user_id: u64 = parse_id(&user.id)?;
                Response::continue_with(request, Payload::Empty, request.continued(param::USER_ID, user_id))
            }
            Step::Library { offset, .. } => {
                let page: JsonApiListResponse = parse(&response.body)?;
                let count = page.data.len() as u32;
                let entries = page
                    .data
                    .into_iter()
                    .filter_map(|resource| {
                        let media_id = resource.related_id("anime")?.parse::<u64>().ok()?;
                        Some(library_entry(resource, media_id))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let payload = Payload::Library(entries);
                match page.links.and_then(|l| l.next) {
                    Some(_) if count > 0 => Response::continue_with(
                        request,
                        payload,
                        request.continued(param::OFFSET, offset + count),
                    ),
                    _ => Response::success(request, payload),
                }
            }
            Step::Create { .. } | Step::Patch { .. } => {
                let created: JsonApiSingleResourceResponse = parse(&response.body)?;
                let media_id = request.media_id().unwrap_or_default();
                let entry = library_entry(created.data, media_id)?;
                Response::success(request, Payload::LibraryEntry(entry))
            }
            Step::FindEntry { media_id, .. } => {
                let found: JsonApiListResponse = parse(&response.body)?;
                let entry = found
                    .data
                    .first()
                    .ok_or_else(|| ErrorInfo::not_found(format!("anime {media_id} is not in the library")))?;
                let library_id: u64 = parse_id(&entry.id)?;
                Response::continue_with(
                    request,
                    Payload::Empty,
                    request.continued(param::LIBRARY_ID, library_id),
                )
            }
            Step::Remove { .. } => Response::success(request, Payload::Empty),
            Step::Media { media_id } => {
                let resp: JsonApiSingleResourceResponse = parse(&response.body)?;
                let genres = resp
                    .included
                    .into_iter()
                    .filter(|r| r.type_ == "categories")
                    .filter_map(|r| decode::<KitsuCategoryAttributes>(r.attributes).ok()?.title)
                    .collect();
                let attrs: KitsuAnimeAttributes = decode(resp.data.attributes)?;
                Response::success(request, Payload::MediaEntry(attrs.into_media_entry(media_id, genres)))
            }
            Step::Search | Step::Season { .. } => {
                let page: JsonApiListResponse = parse(&response.body)?;
                let count = page.data.len() as u32;
                let media = page
                    .data
                    .into_iter()
                    .map(|r| {
                        let id = parse_id(&r.id)?;
                        let attrs: KitsuAnimeAttributes = decode(r.attributes)?;
                        Ok(attrs.into_media_entry(id, Vec::new()))
                    })
                    .collect::<Result<Vec<_>, ErrorInfo>>()?;
                let payload = Payload::Media(media);
                let next = page.links.and_then(|l| l.next).is_some() && count > 0;
                match step {
                    Step::Season { offset } if next => Response::continue_with(
                        request,
                        payload,
                        request.continued(param::OFFSET, offset + count),
                    ),
                    _ => Response::success(request, payload),
                }
            }
        })
    }
}

impl ServiceAdapter for KitsuAdapter {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Kitsu
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
        let mut http = self.build_step(request, step)?.header("Accept", JSON_API);
        if let Some(cred) = credential {
            http = http.header("Authorization", cred.bearer());
        }
        Ok(http)
    }

    fn handle_response(&self, request: &Request, response: HttpResponse) -> Response {
        if request.request_type() == RequestType::AuthenticateUser {
            return token_response(request, &response);
        }
        if !response.is_success() {
            return Response::failure(request, kitsu_error(&response));
        }
        self.handle_success(request, &response)
            .unwrap_or_else(|error| Response::failure(request, error))
    }

    fn refresh_request(&self, credential: &Credential) -> Option<Request> {
        credential.refresh_token().map(Request::refresh)
    }

    fn encode_status(&self, status: WatchStatus) -> &'static str {
        status_to_kitsu(status)
    }

    fn decode_status(&self, value: &str) -> Option<WatchStatus> {
        status_from_kitsu(value)
    }
}

fn parse_id(raw: &str) -> Result<u64, ErrorInfo> {
    raw.parse()
        .map_err(|_| ErrorInfo::malformed(format!("non-numeric id `{raw}`")))
}

fn library_entry(resource: JsonApiResource, media_id: u64) -> Result<kizuna_core::models::LibraryEntry, ErrorInfo> {
    let attrs: KitsuLibraryAttributes = decode(resource.attributes)?;
    attrs
        .into_library_entry(media_id, resource.id)
        .map_err(ErrorInfo::malformed)
}

fn timestamp(date: NaiveDate) -> String {
    format!("{date}T00:00:00.000Z")
}

/// JSON:API `errors` first, then OAuth-style bodies.
fn kitsu_error(response: &HttpResponse) -> ErrorInfo {
    match serde_json::from_slice::<JsonApiErrors>(&response.body) {
        Ok(body) if !body.errors.is_empty() => {
            let first = &body.errors[0];
            let status = first
                .status_code()
                .filter(|s| *s >= 400)
                .unwrap_or(response.status);
            ErrorInfo::from_status(status, first.message(), response.retry_after())
        }
        _ => status_error(response),
    }
}
