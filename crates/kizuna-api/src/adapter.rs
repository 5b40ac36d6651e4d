use kizuna_core::config::ServicesConfig;
use kizuna_core::models::{Credential, ServiceKind, WatchStatus};
use serde::Deserialize;
use url::Url;

use crate::anilist::AniListAdapter;
use crate::error::{BuildError, ErrorClass, ErrorInfo};
use crate::kitsu::KitsuAdapter;
use crate::mal::MalAdapter;
use crate::request::{Request, RequestType, Response};
use crate::transport::{HttpRequest, HttpResponse};

/// Local redirect target registered with the OAuth applications.
pub const REDIRECT_URI: &str = "http://localhost:19742";

/// Translation layer between canonical requests and one service's wire protocol.
///
/// Adapters are pure: they never perform I/O, never hold credentials and
/// never retry. `handle_response` must return a response whose type equals
/// the request's type; multi-step exchanges hand back a `follow_up` request
/// of the same type.
pub trait ServiceAdapter: Send + Sync {
    fn kind(&self) -> ServiceKind;

    /// Whether a request of this type may only be sent with a credential.
    fn request_needs_authentication(&self, request_type: RequestType) -> bool;

    fn build_request(
        &self,
        request: &Request,
        credential: Option<&Credential>,
    ) -> Result<HttpRequest, BuildError>;

    fn handle_response(&self, request: &Request, response: HttpResponse) -> Response;

    /// Request that exchanges the credential's refresh token for a new one.
    fn refresh_request(&self, credential: &Credential) -> Option<Request> {
        let _ = credential;
        None
    }

    fn encode_status(&self, status: WatchStatus) -> &'static str;

    fn decode_status(&self, value: &str) -> Option<WatchStatus>;
}

/// Create the adapter for a service from its configuration.
pub fn build_adapter(kind: ServiceKind, config: &ServicesConfig) -> Box<dyn ServiceAdapter> {
    match kind {
        ServiceKind::AniList => Box::new(AniListAdapter::new(
            &config.anilist.base_url,
            config.anilist.client_id.clone(),
            config.anilist.client_secret.clone(),
        )),
        ServiceKind::Kitsu => Box::new(KitsuAdapter::new(&config.kitsu.base_url)),
        ServiceKind::MyAnimeList => Box::new(MalAdapter::new(
            &config.mal.base_url,
            config.mal.client_id.clone(),
        )),
    }
}

// ── Shared helpers for adapters ─────────────────────────────────

/// Join a path onto a configured base URL.
pub(crate) fn endpoint(base: &str, path: &str, request: &Request) -> Result<Url, BuildError> {
    let joined = format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'));
    Url::parse(&joined).map_err(|e| request.invalid("base_url", e.to_string()))
}

pub(crate) fn absolute(url: &str, request: &Request) -> Result<Url, BuildError> {
    Url::parse(url).map_err(|e| request.invalid("base_url", e.to_string()))
}

/// Error body shapes shared by OAuth token endpoints and REST APIs.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct OAuthErrorBody {
    pub error: Option<String>,
    pub error_description: Option<String>,
    pub message: Option<String>,
    pub hint: Option<String>,
}

impl OAuthErrorBody {
    fn describe(&self) -> Option<String> {
        self.error_description
            .clone()
            .or_else(|| self.message.clone())
            .or_else(|| self.hint.clone())
            .or_else(|| self.error.clone())
    }

    fn is_credential_error(&self) -> bool {
        matches!(
            self.error.as_deref(),
            Some("invalid_grant" | "invalid_token" | "invalid_client" | "unauthorized_client")
        )
    }
}

/// Classify a non-success HTTP response from its status and an OAuth-style body.
pub(crate) fn status_error(response: &HttpResponse) -> ErrorInfo {
    let body: OAuthErrorBody = serde_json::from_slice(&response.body).unwrap_or_default();
    let message = body.describe().unwrap_or_else(|| {
        let text = response.text();
        if text.is_empty() {
            "no details".to_string()
        } else {
            text.chars().take(200).collect()
        }
    });

    let mut error = ErrorInfo::from_status(response.status, message, response.retry_after());
    if body.is_credential_error() && error.class == ErrorClass::ServiceRejected {
        error = ErrorInfo::authentication(error.message);
    }
    error
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
}

impl TokenResponse {
    pub fn into_credential(self) -> Credential {
        Credential::new(self.access_token)
            .with_refresh_token(self.refresh_token)
            .expiring_in(self.expires_in)
    }
}

/// Decode a token endpoint response into a credential payload.
pub(crate) fn token_response(request: &Request, response: &HttpResponse) -> Response {
    if !response.is_success() {
        return Response::failure(request, status_error(response));
    }
    match crate::document::parse::<TokenResponse>(&response.body) {
        Ok(token) if !token.access_token.is_empty() => Response::success(
            request,
            crate::request::Payload::Credential(token.into_credential()),
        ),
        Ok(_) => Response::failure(request, ErrorInfo::malformed("token response without access token")),
        Err(e) => Response::failure(request, e),
    }
}

/// Convert a canonical 0-10 score to a whole-number scale of `max` points.
pub(crate) fn scale_score(score: f32, max: u32) -> u32 {
    ((score / 10.0) * max as f32).round().clamp(0.0, max as f32) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use kizuna_core::config::AppConfig;

    #[test]
    fn test_build_adapter_kinds() {
        let config = AppConfig::default();
        for kind in ServiceKind::ALL {
            assert_eq!(build_adapter(*kind, &config.services).kind(), *kind);
        }
    }

    #[test]
    fn test_status_mapping_roundtrips_for_every_adapter() {
        let config = AppConfig::default();
        for kind in ServiceKind::ALL {
            let adapter = build_adapter(*kind, &config.services);
            for status in WatchStatus::ALL {
                let encoded = adapter.encode_status(*status);
                assert_eq!(adapter.decode_status(encoded), Some(*status), "{kind} {status}");
            }
            assert_eq!(adapter.decode_status("definitely-not-a-status"), None);
        }
    }

    #[test]
    fn test_status_error_oauth_body() {
        let resp = HttpResponse::new(
            400,
            r#"{"error":"invalid_grant","error_description":"The provided authorization grant is invalid"}"#,
        );
        let err = status_error(&resp);
        assert_eq!(err.class, ErrorClass::Authentication);
        assert!(err.message.contains("authorization grant is invalid"));

        let resp = HttpResponse::new(400, r#"{"error":"invalid_request","message":"bad field"}"#);
        let err = status_error(&resp);
        assert_eq!(err.class, ErrorClass::ServiceRejected);
        assert!(err.message.contains("bad field"));
    }

    #[test]
    fn test_status_error_plain_text() {
        let resp = HttpResponse::new(502, "Bad Gateway");
        let err = status_error(&resp);
        assert_eq!(err.class, ErrorClass::Transport);
        assert!(err.retriable);
        assert!(err.message.contains("Bad Gateway"));
    }

    #[test]
    fn test_scale_score() {
        assert_eq!(scale_score(8.5, 100), 85);
        assert_eq!(scale_score(8.5, 20), 17);
        assert_eq!(scale_score(7.4, 10), 7);
        assert_eq!(scale_score(10.0, 10), 10);
    }
}
