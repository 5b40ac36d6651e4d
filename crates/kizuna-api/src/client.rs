use std::sync::Arc;

use chrono::Utc;
use kizuna_core::models::{Credential, ServiceKind};
use tracing::{debug, info, warn};

use crate::adapter::ServiceAdapter;
use crate::auth::{AuthController, AuthState, CredentialSink};
use crate::error::{BuildError, ErrorClass, ErrorInfo};
use crate::request::{Payload, Request, RequestType, Response};
use crate::transport::Transport;

/// Upper bound on chained continuation requests for one exchange.
const MAX_FOLLOW_UPS: usize = 100;

/// Binds an adapter to its authentication state and a transport.
///
/// `execute` runs exactly one canonical request: it enforces the
/// authentication gate, follows adapter continuations, and keeps the
/// credential lifecycle up to date. It never retries.
pub struct ServiceClient<T> {
    adapter: Box<dyn ServiceAdapter>,
    auth: AuthController,
    transport: Arc<T>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl<T: Transport> ServiceClient<T> {
    pub fn new(adapter: Box<dyn ServiceAdapter>, transport: Arc<T>) -> Self {
        let auth = AuthController::new(adapter.kind());
        Self {
            adapter,
            auth,
            transport,
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_credential_sink(mut self, sink: Arc<dyn CredentialSink>) -> Self {
        self.auth = self.auth.with_sink(sink);
        self
    }

    pub fn kind(&self) -> ServiceKind {
        self.adapter.kind()
    }

    pub fn adapter(&self) -> &dyn ServiceAdapter {
        self.adapter.as_ref()
    }

    pub fn auth_state(&self) -> AuthState {
        self.auth.state()
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth.is_authenticated()
    }

    pub fn restore_credential(&self, credential: Credential) {
        self.auth.restore(credential);
    }

    pub fn logout(&self) {
        self.auth.logout();
    }

    /// Run one canonical request to completion.
    ///
    /// Remote failures are reported inside the `Response`; only a request the
    /// adapter cannot build is an `Err`.
    pub async fn execute(&self, request: Request) -> Result<Response, BuildError> {
        let request_type = request.request_type();
        if request_type == RequestType::AuthenticateUser {
            let _guard = self.refresh_lock.lock().await;
            return self.authenticate(request).await;
        }

        if self.adapter.request_needs_authentication(request_type) {
            if let Err(error) = self.ensure_authenticated().await {
                debug!(service = %self.kind(), %request_type, "blocked: not authenticated");
                return Ok(Response::failure(&request, error));
            }
        }

        let response = self.run(request).await?;
        if response.error_class() == Some(ErrorClass::Authentication) {
            self.auth.expire();
        }
        Ok(response)
    }

    async fn authenticate(&self, request: Request) -> Result<Response, BuildError> {
        self.auth.begin();
        let mut response = match self.run(request).await {
            Ok(response) => response,
            Err(e) => {
                self.auth.fail();
                return Err(e);
            }
        };

        match std::mem::replace(&mut response.payload, Payload::Empty) {
            Payload::Credential(credential) if response.error.is_none() => {
                self.auth.complete(credential);
            }
            _ => {
                self.auth.fail();
                if response.error.is_none() {
                    response.error = Some(ErrorInfo::malformed(
                        "authentication response carried no credential",
                    ));
                }
            }
        }
        Ok(response)
    }

    async fn ensure_authenticated(&self) -> Result<(), ErrorInfo> {
        match self.auth.check_expiry(Utc::now()) {
            AuthState::Authenticated => Ok(()),
            // A login or refresh is running: wait for it under the lock.
            AuthState::Expired | AuthState::Authenticating => self.refresh().await,
            AuthState::Unauthenticated => Err(self.not_logged_in()),
        }
    }

    fn not_logged_in(&self) -> ErrorInfo {
        ErrorInfo::authentication(format!("not logged in to {}", self.kind()))
    }

    /// Bring an expired credential back to life.
    ///
    /// Transient failures keep the credential and surface the retriable
    /// error; only a refresh the service refuses discards it.
    async fn refresh(&self) -> Result<(), ErrorInfo> {
        let _guard = self.refresh_lock.lock().await;
        // Another caller may have refreshed or logged in while we waited.
        match self.auth.check_expiry(Utc::now()) {
            AuthState::Authenticated => return Ok(()),
            // Authenticating while holding the lock means an earlier attempt
            // was dropped mid-flight.
            AuthState::Expired | AuthState::Authenticating => {}
            AuthState::Unauthenticated => return Err(self.not_logged_in()),
        }

        let request = self
            .auth
            .credential()
            .and_then(|c| self.adapter.refresh_request(&c));
        let Some(request) = request else {
            return Err(ErrorInfo::authentication(format!(
                "{} session expired, log in again",
                self.kind()
            )));
        };

        info!(service = %self.kind(), "refreshing access token");
        self.auth.begin();
        let mut response = match self.run(request).await {
            Ok(response) => response,
            Err(e) => {
                self.auth.refresh_failed();
                return Err(ErrorInfo::authentication(format!("token refresh failed: {e}")));
            }
        };

        match (response.error.take(), std::mem::replace(&mut response.payload, Payload::Empty)) {
            (None, Payload::Credential(credential)) => {
                self.auth.complete(credential);
                Ok(())
            }
            (Some(error), _) if error.class == ErrorClass::Authentication => {
                self.auth.fail();
                Err(ErrorInfo::authentication(format!(
                    "token refresh refused, log in again: {}",
                    error.message
                )))
            }
            (Some(error), _) if error.retriable => {
                self.auth.refresh_failed();
                Err(error)
            }
            (Some(error), _) => {
                self.auth.refresh_failed();
                Err(ErrorInfo::authentication(format!(
                    "token refresh failed: {}",
                    error.message
                )))
            }
            (None, _) => {
                self.auth.refresh_failed();
                Err(ErrorInfo::malformed("refresh response carried no credential"))
            }
        }
    }

    /// Build, send and decode, following continuations and merging pages.
    async fn run(&self, request: Request) -> Result<Response, BuildError> {
        let mut current = request;
        let mut collected = Payload::Empty;

        for hop in 0..=MAX_FOLLOW_UPS {
            let credential = self.auth.credential();
            let http = self.adapter.build_request(&current, credential.as_deref())?;
            debug!(
                service = %self.kind(),
                request_type = %current.request_type(),
                method = %http.method,
                path = http.url.path(),
                hop,
                "sending request"
            );

            let mut response = match self.transport.execute(http).await {
                Ok(raw) => self.adapter.handle_response(&current, raw),
                Err(e) => {
                    warn!(service = %self.kind(), error = %e, "transport failure");
                    Response::failure(&current, e.into())
                }
            };

            if let Some(error) = &response.error {
                debug!(service = %self.kind(), class = %error.class, "request failed");
                return Ok(response);
            }

            let payload = std::mem::replace(&mut response.payload, Payload::Empty);
            collected = collected.merge(payload);
            match response.follow_up.take() {
                Some(next) => current = next,
                None => {
                    response.payload = collected;
                    return Ok(response);
                }
            }
        }

        warn!(service = %self.kind(), "continuation limit reached");
        Ok(Response::failure(
            &current,
            ErrorInfo::malformed("too many continuation requests"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use kizuna_core::config::AppConfig;

    use super::*;
    use crate::adapter::build_adapter;
    use crate::error::TransportError;
    use crate::request::param;
    use crate::transport::{HttpRequest, HttpResponse};

    /// Replays canned responses and records what was sent.
    #[derive(Default)]
    struct ScriptedTransport {
        responses: Mutex<VecDeque<HttpResponse>>,
        sent: Mutex<Vec<HttpRequest>>,
        /// Time every exchange takes, so concurrent callers interleave.
        latency: Option<std::time::Duration>,
    }

    impl ScriptedTransport {
        fn with(responses: Vec<HttpResponse>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                ..Self::default()
            })
        }

        fn slow(responses: Vec<HttpResponse>, latency: std::time::Duration) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                latency: Some(latency),
                ..Self::default()
            })
        }

        fn refreshes(&self) -> usize {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.body_text().contains("grant_type=refresh_token"))
                .count()
        }

        fn sent(&self) -> Vec<HttpRequest> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl Transport for ScriptedTransport {
        async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
            self.sent.lock().unwrap().push(request);
            let next = self.responses.lock().unwrap().pop_front();
            if let Some(latency) = self.latency {
                tokio::time::sleep(latency).await;
            }
            next.ok_or_else(|| TransportError::Connect("no scripted response".into()))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<String>>,
    }

    impl CredentialSink for RecordingSink {
        fn credential_saved(&self, service: ServiceKind, credential: &Credential) {
            self.events
                .lock()
                .unwrap()
                .push(format!("save {} {}", service.as_key(), credential.access_token()));
        }

        fn credential_cleared(&self, service: ServiceKind) {
            self.events
                .lock()
                .unwrap()
                .push(format!("clear {}", service.as_key()));
        }
    }

    fn expired_credential() -> Credential {
        Credential::new("old")
            .with_refresh_token(Some("ref".into()))
            .with_expiry(Some(Utc::now() - chrono::Duration::minutes(1)))
    }

    fn client(kind: ServiceKind, transport: Arc<ScriptedTransport>) -> ServiceClient<ScriptedTransport> {
        let mut config = AppConfig::default();
        config.services.anilist.client_id = Some("cid".into());
        config.services.anilist.client_secret = Some("secret".into());
        config.services.mal.client_id = Some("cid".into());
        ServiceClient::new(build_adapter(kind, &config.services), transport)
    }

    const TOKEN: &str = r#"{"access_token":"tok","refresh_token":"ref","expires_in":3600,"token_type":"Bearer"}"#;

    /// A request of every type, with enough parameters for a single exchange.
    fn sample_request(ty: RequestType) -> Request {
        let req = Request::new(ty);
        match ty {
            RequestType::AddLibraryEntry | RequestType::UpdateLibraryEntry => req
                .with(param::MEDIA_ID, 1)
                .with(param::LIBRARY_ID, 5)
                .with(param::USER_ID, 9)
                .with(param::STATUS, "watching")
                .with(param::WATCHED_EPISODES, 1),
            RequestType::AuthenticateUser => req
                .with(param::CODE, "code")
                .with(param::CODE_VERIFIER, "verifier")
                .with(param::USERNAME, "user")
                .with(param::PASSWORD, "pass"),
            RequestType::DeleteLibraryEntry => req
                .with(param::MEDIA_ID, 1)
                .with(param::LIBRARY_ID, 5)
                .with(param::USER_ID, 9),
            RequestType::GetLibraryEntries => req.with(param::USER_ID, 9),
            RequestType::GetMetadataById => req.with(param::MEDIA_ID, 1),
            RequestType::GetSeason => req.with(param::SEASON, "fall").with(param::YEAR, 2023),
            RequestType::SearchTitle => req.with(param::QUERY, "frieren"),
        }
    }

    /// A successful body for `ty` on `kind`.
    fn sample_body(kind: ServiceKind, ty: RequestType) -> HttpResponse {
        use RequestType::*;
        let body = match (kind, ty) {
            (_, AuthenticateUser) => TOKEN,
            (ServiceKind::MyAnimeList, AddLibraryEntry | UpdateLibraryEntry) => {
                r#"{"status":"watching","num_episodes_watched":1,"score":0,"updated_at":"2024-01-15T10:00:00+00:00"}"#
            }
            (ServiceKind::MyAnimeList, DeleteLibraryEntry) => "",
            (ServiceKind::MyAnimeList, GetLibraryEntries | SearchTitle | GetSeason) => {
                r#"{"data":[],"paging":{}}"#
            }
            (ServiceKind::MyAnimeList, GetMetadataById) => r#"{"id":1,"title":"T"}"#,
            (ServiceKind::AniList, AddLibraryEntry | UpdateLibraryEntry) => {
                r#"{"data":{"SaveMediaListEntry":{"id":5,"mediaId":1,"status":"CURRENT","progress":1}}}"#
            }
            (ServiceKind::AniList, DeleteLibraryEntry) => {
                r#"{"data":{"DeleteMediaListEntry":{"deleted":true}}}"#
            }
            (ServiceKind::AniList, GetLibraryEntries) => {
                r#"{"data":{"MediaListCollection":{"lists":[]}}}"#
            }
            (ServiceKind::AniList, GetMetadataById) => {
                r#"{"data":{"Media":{"id":1,"title":{"romaji":"T"}}}}"#
            }
            (ServiceKind::AniList, SearchTitle | GetSeason) => {
                r#"{"data":{"Page":{"pageInfo":{"hasNextPage":false},"media":[]}}}"#
            }
            (ServiceKind::Kitsu, AddLibraryEntry | UpdateLibraryEntry) => {
                r#"{"data":{"id":"5","type":"libraryEntries","attributes":{"status":"current","progress":1}}}"#
            }
            (ServiceKind::Kitsu, DeleteLibraryEntry) => "",
            (ServiceKind::Kitsu, GetLibraryEntries | SearchTitle | GetSeason) => {
                r#"{"data":[],"links":{}}"#
            }
            (ServiceKind::Kitsu, GetMetadataById) => {
                r#"{"data":{"id":"1","type":"anime","attributes":{"canonicalTitle":"T"}}}"#
            }
        };
        let status = if body.is_empty() { 204 } else { 200 };
        HttpResponse::new(status, body)
    }

    #[tokio::test]
    async fn test_response_type_matches_request_type_for_every_adapter() {
        for kind in ServiceKind::ALL {
            for ty in RequestType::ALL {
                let transport = ScriptedTransport::with(vec![sample_body(*kind, *ty)]);
                let client = client(*kind, transport.clone());
                client.restore_credential(Credential::new("tok"));

                let response = client.execute(sample_request(*ty)).await.unwrap();
                assert_eq!(response.request_type(), *ty, "{kind} {ty}");
                assert!(response.is_success(), "{kind} {ty}: {:?}", response.error);
                assert_eq!(transport.sent().len(), 1, "{kind} {ty}");
            }
        }
    }

    #[tokio::test]
    async fn test_unauthenticated_mutation_makes_no_transport_call() {
        for kind in ServiceKind::ALL {
            let transport = ScriptedTransport::with(vec![]);
            let client = client(*kind, transport.clone());
            for ty in [
                RequestType::AddLibraryEntry,
                RequestType::UpdateLibraryEntry,
                RequestType::DeleteLibraryEntry,
                RequestType::GetLibraryEntries,
            ] {
                let response = client.execute(sample_request(ty)).await.unwrap();
                assert_eq!(response.request_type(), ty);
                assert_eq!(response.error_class(), Some(ErrorClass::Authentication));
            }
            assert!(transport.sent().is_empty(), "{kind}");
        }
    }

    #[tokio::test]
    async fn test_authenticate_commits_credential_and_hides_it() {
        let transport = ScriptedTransport::with(vec![HttpResponse::new(200, TOKEN)]);
        let client = client(ServiceKind::Kitsu, transport.clone());

        let response = client
            .execute(Request::password("user", "pass"))
            .await
            .unwrap();
        assert!(response.is_success());
        assert_eq!(response.payload, Payload::Empty);
        assert_eq!(client.auth_state(), AuthState::Authenticated);
    }

    #[tokio::test]
    async fn test_failed_authentication_returns_to_unauthenticated() {
        let transport = ScriptedTransport::with(vec![HttpResponse::new(
            400,
            r#"{"error":"invalid_grant","error_description":"bad password"}"#,
        )]);
        let client = client(ServiceKind::Kitsu, transport);

        let response = client
            .execute(Request::password("user", "wrong"))
            .await
            .unwrap();
        assert_eq!(response.error_class(), Some(ErrorClass::Authentication));
        assert_eq!(client.auth_state(), AuthState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_rejected_token_marks_expired() {
        let transport = ScriptedTransport::with(vec![HttpResponse::new(401, r#"{"error":"invalid_token"}"#)]);
        let client = client(ServiceKind::MyAnimeList, transport);
        client.restore_credential(Credential::new("stale"));

        let response = client.execute(Request::library()).await.unwrap();
        assert_eq!(response.error_class(), Some(ErrorClass::Authentication));
        assert_eq!(client.auth_state(), AuthState::Expired);
    }

    #[tokio::test]
    async fn test_expired_credential_is_refreshed_before_dispatch() {
        let transport = ScriptedTransport::with(vec![
            HttpResponse::new(200, TOKEN),
            HttpResponse::new(200, r#"{"data":[],"paging":{}}"#),
        ]);
        let client = client(ServiceKind::MyAnimeList, transport.clone());
        let past = Utc::now() - chrono::Duration::minutes(1);
        client.restore_credential(
            Credential::new("old")
                .with_refresh_token(Some("ref".into()))
                .with_expiry(Some(past)),
        );
        assert_eq!(client.auth_state(), AuthState::Expired);

        let response = client.execute(Request::library()).await.unwrap();
        assert!(response.is_success());
        assert_eq!(client.auth_state(), AuthState::Authenticated);

        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].body_text().contains("grant_type=refresh_token"));
        assert_eq!(sent[1].header_value("Authorization"), Some("Bearer tok"));
    }

    #[tokio::test]
    async fn test_transient_refresh_failure_keeps_credential() {
        let transport = ScriptedTransport::with(vec![
            HttpResponse::new(503, "Service Unavailable"),
            HttpResponse::new(200, TOKEN),
            HttpResponse::new(200, r#"{"data":[],"paging":{}}"#),
        ]);
        let sink = Arc::new(RecordingSink::default());
        let client = client(ServiceKind::MyAnimeList, transport.clone()).with_credential_sink(sink.clone());
        client.restore_credential(expired_credential());

        let response = client.execute(Request::library()).await.unwrap();
        let error = response.error.unwrap();
        assert_eq!(error.class, ErrorClass::Transport);
        assert!(error.retriable);
        assert_eq!(client.auth_state(), AuthState::Expired);
        assert!(sink.events.lock().unwrap().is_empty());

        // Service is back: the kept refresh token still works.
        let response = client.execute(Request::library()).await.unwrap();
        assert!(response.is_success(), "{:?}", response.error);
        assert_eq!(client.auth_state(), AuthState::Authenticated);
        assert_eq!(transport.refreshes(), 2);
        assert_eq!(transport.sent().len(), 3);
        assert_eq!(*sink.events.lock().unwrap(), vec!["save mal tok"]);
    }

    #[tokio::test]
    async fn test_refused_refresh_discards_credential() {
        let transport = ScriptedTransport::with(vec![HttpResponse::new(
            400,
            r#"{"error":"invalid_grant","error_description":"refresh token revoked"}"#,
        )]);
        let sink = Arc::new(RecordingSink::default());
        let client = client(ServiceKind::MyAnimeList, transport.clone()).with_credential_sink(sink.clone());
        client.restore_credential(expired_credential());

        let response = client.execute(Request::library()).await.unwrap();
        let error = response.error.unwrap();
        assert_eq!(error.class, ErrorClass::Authentication);
        assert!(!error.retriable);
        assert_eq!(client.auth_state(), AuthState::Unauthenticated);
        assert_eq!(*sink.events.lock().unwrap(), vec!["clear mal"]);

        // Nothing left to refresh with.
        let response = client.execute(Request::library()).await.unwrap();
        assert_eq!(response.error_class(), Some(ErrorClass::Authentication));
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_refresh() {
        let list = r#"{"data":[],"paging":{}}"#;
        let transport = ScriptedTransport::slow(
            vec![
                HttpResponse::new(200, TOKEN),
                HttpResponse::new(200, list),
                HttpResponse::new(200, list),
            ],
            std::time::Duration::from_millis(200),
        );
        let client = client(ServiceKind::MyAnimeList, transport.clone());
        client.restore_credential(expired_credential());

        let (first, second) = tokio::join!(
            client.execute(Request::library()),
            client.execute(Request::library())
        );
        let (first, second) = (first.unwrap(), second.unwrap());
        assert!(first.is_success(), "{:?}", first.error);
        assert!(second.is_success(), "{:?}", second.error);
        assert_eq!(client.auth_state(), AuthState::Authenticated);
        assert_eq!(transport.refreshes(), 1);
        assert_eq!(transport.sent().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_refresh_does_not_block_later_calls() {
        let transport = ScriptedTransport::slow(
            vec![
                HttpResponse::new(200, TOKEN),
                HttpResponse::new(200, TOKEN),
                HttpResponse::new(200, r#"{"data":[],"paging":{}}"#),
            ],
            std::time::Duration::from_millis(200),
        );
        let client = client(ServiceKind::MyAnimeList, transport.clone());
        client.restore_credential(expired_credential());

        let dropped = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            client.execute(Request::library()),
        )
        .await;
        assert!(dropped.is_err());
        assert_eq!(client.auth_state(), AuthState::Authenticating);

        let response = client.execute(Request::library()).await.unwrap();
        assert!(response.is_success(), "{:?}", response.error);
        assert_eq!(client.auth_state(), AuthState::Authenticated);
        assert_eq!(transport.refreshes(), 2);
    }

    #[tokio::test]
    async fn test_expired_without_refresh_token_fails_without_io() {
        let transport = ScriptedTransport::with(vec![]);
        let client = client(ServiceKind::AniList, transport.clone());
        client.restore_credential(
            Credential::new("old").with_expiry(Some(Utc::now() - chrono::Duration::minutes(1))),
        );

        let response = client.execute(Request::library()).await.unwrap();
        assert_eq!(response.error_class(), Some(ErrorClass::Authentication));
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_continuations_are_followed_and_pages_merged() {
        let page1 = r#"{"data":[{"node":{"id":1,"title":"A"},"list_status":{"status":"watching","num_episodes_watched":1}}],
                        "paging":{"next":"https://api.myanimelist.net/v2/users/@me/animelist?offset=1&limit=1000"}}"#;
        let page2 = r#"{"data":[{"node":{"id":2,"title":"B"},"list_status":{"status":"completed","num_episodes_watched":12}}],
                        "paging":{}}"#;
        let transport = ScriptedTransport::with(vec![
            HttpResponse::new(200, page1),
            HttpResponse::new(200, page2),
        ]);
        let client = client(ServiceKind::MyAnimeList, transport.clone());
        client.restore_credential(Credential::new("tok"));

        let response = client.execute(Request::library()).await.unwrap();
        match response.payload {
            Payload::Library(entries) => {
                assert_eq!(entries.iter().map(|e| e.media_id).collect::<Vec<_>>(), vec![1, 2]);
            }
            other => panic!("unexpected payload {other:?}"),
        }
        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent[1].url.query().unwrap_or_default().contains("offset=1"));
    }

    #[tokio::test]
    async fn test_build_error_is_returned_without_io() {
        let transport = ScriptedTransport::with(vec![]);
        let client = client(ServiceKind::MyAnimeList, transport.clone());
        client.restore_credential(Credential::new("tok"));

        let err = client
            .execute(Request::new(RequestType::UpdateLibraryEntry))
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::MissingParameter { name: "media_id", .. }));
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_transport_failure_is_retriable_transport_error() {
        let transport = ScriptedTransport::with(vec![]);
        let client = client(ServiceKind::AniList, transport);
        let response = client.execute(Request::search("frieren")).await.unwrap();
        let error = response.error.unwrap();
        assert_eq!(error.class, ErrorClass::Transport);
        assert!(error.retriable);
    }
}
