use kizuna_core::models::{Credential, ServiceKind, WatchStatus};
use url::Url;

use super::types::{
    status_from_mal, status_to_mal, MalAnimeListItem, MalAnimeNode, MalListStatus,
    MalPageResponse, MalSearchNode,
};
use crate::adapter::{absolute, endpoint, scale_score, status_error, token_response, ServiceAdapter, REDIRECT_URI};
use crate::document::{form_body, parse};
use crate::error::{BuildError, ErrorInfo};
use crate::request::{param, Payload, Request, RequestType, Response};
use crate::transport::{HttpRequest, HttpResponse, Method};

const TOKEN_URL: &str = "https://myanimelist.net/v1/oauth2/token";

/// Shared fields parameter for MAL anime queries.
const ANIME_FIELDS: &str = "id,title,alternative_titles,num_episodes,main_picture,\
                            status,synopsis,genres,mean,start_season";

const LIST_FIELDS: &str = "list_status{status,score,num_episodes_watched,start_date,finish_date,updated_at}";

const LIST_PAGE_SIZE: u32 = 1000;
const SEASON_PAGE_SIZE: u32 = 100;
const FORM: &str = "application/x-www-form-urlencoded";

/// MyAnimeList API v2 adapter.
///
/// Library entries are addressed by anime id; MAL has no separate list-entry id.
pub struct MalAdapter {
    base_url: String,
    client_id: Option<String>,
}

impl MalAdapter {
    pub fn new(base_url: &str, client_id: Option<String>) -> Self {
        Self {
            base_url: base_url.to_string(),
            client_id: client_id.filter(|c| !c.is_empty()),
        }
    }

    fn client_id<'a>(&'a self, request: &'a Request) -> Result<&'a str, BuildError> {
        request
            .get(param::CLIENT_ID)
            .or(self.client_id.as_deref())
            .ok_or(BuildError::MissingParameter {
                request_type: request.request_type(),
                name: param::CLIENT_ID,
            })
    }

    fn url(&self, path: &str, request: &Request) -> Result<Url, BuildError> {
        endpoint(&self.base_url, path, request)
    }

    /// Bearer token when logged in, otherwise the public client id header.
    fn authorize(&self, http: HttpRequest, credential: Option<&Credential>) -> HttpRequest {
        match (credential, &self.client_id) {
            (Some(cred), _) => http.header("Authorization", cred.bearer()),
            (None, Some(client_id)) => http.header("X-MAL-CLIENT-ID", client_id.clone()),
            (None, None) => http,
        }
    }

    fn build_token_request(&self, request: &Request) -> Result<HttpRequest, BuildError> {
        let client_id = self.client_id(request)?;
        let body = if let Some(refresh_token) = request.get(param::REFRESH_TOKEN) {
            form_body(&[
                ("client_id", client_id),
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
        } else {
            form_body(&[
                ("client_id", client_id),
                ("grant_type", "authorization_code"),
                ("code", request.require(param::CODE)?),
                ("code_verifier", request.require(param::CODE_VERIFIER)?),
                ("redirect_uri", REDIRECT_URI),
            ])
        };
        Ok(HttpRequest::new(Method::POST, absolute(TOKEN_URL, request)?).body(FORM, body))
    }

    fn build_list_status(&self, request: &Request) -> Result<HttpRequest, BuildError> {
        let media_id = request.require_id(param::MEDIA_ID)?;
        let status = match request.request_type() {
            RequestType::AddLibraryEntry => Some(request.require_status()?),
            _ => request.optional_status()?,
        };
        let watched = request.optional_u32(param::WATCHED_EPISODES)?;
        let score = request.optional_score()?;
        let start = request.optional_date(param::START_DATE)?;
        let finish = request.optional_date(param::FINISH_DATE)?;

        let mut fields: Vec<(&str, String)> = Vec::new();
        if let Some(status) = status {
            fields.push(("status", status_to_mal(status).to_string()));
        }
        if let Some(watched) = watched {
            fields.push(("num_watched_episodes", watched.to_string()));
        }
        if let Some(score) = score {
            fields.push(("score", scale_score(score, 10).to_string()));
        }
        if let Some(start) = start {
            fields.push(("start_date", start.to_string()));
        }
        if let Some(finish) = finish {
            fields.push(("finish_date", finish.to_string()));
        }
        if fields.is_empty() {
            return Err(request.invalid(param::STATUS, "nothing to update"));
        }

        let pairs: Vec<(&str, &str)> = fields.iter().map(|(k, v)| (*k, v.as_str())).collect();
        let url = self.url(&format!("anime/{media_id}/my_list_status"), request)?;
        Ok(HttpRequest::new(Method::PUT, url).body(FORM, form_body(&pairs)))
    }

    fn next_page(&self, request: &Request, next: Option<&str>) -> Option<Request> {
        let next = Url::parse(next?).ok()?;
        let offset = next
            .query_pairs()
            .find(|(k, _)| k == "offset")
            .and_then(|(_, v)| v.parse::<u32>().ok())?;
        Some(request.continued(param::OFFSET, offset))
    }

    fn handle_success(&self, request: &Request, response: &HttpResponse) -> Result<Response, ErrorInfo> {
        Ok(match request.request_type() {
            RequestType::AuthenticateUser => token_response(request, response),
            RequestType::AddLibraryEntry | RequestType::UpdateLibraryEntry => {
                let status: MalListStatus = parse(&response.body)?;
                let media_id = request.media_id().unwrap_or_default();
                let entry = status
                    .into_library_entry(media_id)
                    .map_err(ErrorInfo::malformed)?;
                Response::success(request, Payload::LibraryEntry(entry))
            }
            RequestType::DeleteLibraryEntry => Response::success(request, Payload::Empty),
            RequestType::GetLibraryEntries => {
                let page: MalPageResponse<MalAnimeListItem> = parse(&response.body)?;
                let entries = page
                    .data
                    .into_iter()
                    .map(|item| item.list_status.into_library_entry(item.node.id))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(ErrorInfo::malformed)?;
                let payload = Payload::Library(entries);
                match self.next_page(request, page.paging.next.as_deref()) {
                    Some(next) => Response::continue_with(request, payload, next),
                    None => Response::success(request, payload),
                }
            }
            RequestType::GetMetadataById => {
                let node: MalAnimeNode = parse(&response.body)?;
                Response::success(request, Payload::MediaEntry(node.into_media_entry()))
            }
            RequestType::SearchTitle | RequestType::GetSeason => {
                let page: MalPageResponse<MalSearchNode> = parse(&response.body)?;
                let media = page.data.into_iter().map(|n| n.node.into_media_entry()).collect();
                let payload = Payload::Media(media);
                let next = (request.request_type() == RequestType::GetSeason)
                    .then(|| self.next_page(request, page.paging.next.as_deref()))
                    .flatten();
                match next {
                    Some(next) => Response::continue_with(request, payload, next),
                    None => Response::success(request, payload),
                }
            }
        })
    }
}

impl ServiceAdapter for MalAdapter {
    fn kind(&self) -> ServiceKind {
        ServiceKind::MyAnimeList
    }

    fn request_needs_authentication(&self, request_type: RequestType) -> bool {
        match request_type {
            RequestType::AuthenticateUser => false,
            // Public catalog reads work with just the client id header.
            RequestType::GetMetadataById | RequestType::SearchTitle | RequestType::GetSeason => {
                self.client_id.is_none()
            }
            _ => true,
        }
    }

    fn build_request(
        &self,
        request: &Request,
        credential: Option<&Credential>,
    ) -> Result<HttpRequest, BuildError> {
        let http = match request.request_type() {
            RequestType::AuthenticateUser => return self.build_token_request(request),
            RequestType::AddLibraryEntry | RequestType::UpdateLibraryEntry => {
                self.build_list_status(request)?
            }
            RequestType::DeleteLibraryEntry => {
                let media_id = request.require_id(param::MEDIA_ID)?;
                let url = self.url(&format!("anime/{media_id}/my_list_status"), request)?;
                HttpRequest::new(Method::DELETE, url)
            }
            RequestType::GetLibraryEntries => {
                let offset = request.optional_u32(param::OFFSET)?.unwrap_or(0);
                let mut url = self.url("users/@me/animelist", request)?;
                url.query_pairs_mut()
                    .append_pair("fields", LIST_FIELDS)
                    .append_pair("limit", &LIST_PAGE_SIZE.to_string())
                    .append_pair("offset", &offset.to_string())
                    .append_pair("nsfw", "true");
                HttpRequest::new(Method::GET, url)
            }
            RequestType::GetMetadataById => {
                let media_id = request.require_id(param::MEDIA_ID)?;
                let mut url = self.url(&format!("anime/{media_id}"), request)?;
                url.query_pairs_mut().append_pair("fields", ANIME_FIELDS);
                HttpRequest::new(Method::GET, url)
            }
            RequestType::SearchTitle => {
                let query = request.require(param::QUERY)?;
                let mut url = self.url("anime", request)?;
                url.query_pairs_mut()
                    .append_pair("q", query)
                    .append_pair("limit", "10")
                    .append_pair("fields", ANIME_FIELDS);
                HttpRequest::new(Method::GET, url)
            }
            RequestType::GetSeason => {
                let (season, year) = request.require_season()?;
                let offset = request.optional_u32(param::OFFSET)?.unwrap_or(0);
                let mut url = self.url(&format!("anime/season/{year}/{}", season.as_key()), request)?;
                url.query_pairs_mut()
                    .append_pair("sort", "anime_num_list_users")
                    .append_pair("limit", &SEASON_PAGE_SIZE.to_string())
                    .append_pair("offset", &offset.to_string())
                    .append_pair("fields", ANIME_FIELDS)
                    .append_pair("nsfw", "true");
                HttpRequest::new(Method::GET, url)
            }
        };
        Ok(self.authorize(http, credential))
    }

    fn handle_response(&self, request: &Request, response: HttpResponse) -> Response {
        if !response.is_success() {
            return Response::failure(request, status_error(&response));
        }
        self.handle_success(request, &response)
            .unwrap_or_else(|error| Response::failure(request, error))
    }

    fn refresh_request(&self, credential: &Credential) -> Option<Request> {
        credential.refresh_token().map(Request::refresh)
    }

    fn encode_status(&self, status: WatchStatus) -> &'static str {
        status_to_mal(status)
    }

    fn decode_status(&self, value: &str) -> Option<WatchStatus> {
        status_from_mal(value)
    }
}
