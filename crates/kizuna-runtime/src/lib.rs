mod db;
mod library;
mod sync;

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use kizuna_api::{build_adapter, ReqwestTransport, ServiceClient, Transport, TransportError};
use kizuna_core::config::AppConfig;
use kizuna_core::error::KizunaError;
use kizuna_core::models::ServiceKind;

pub use db::DbHandle;
pub use library::{LibrarySink, LocalLibrary, ReconcileReport, Repush, TrackedEntry};
pub use sync::{MutationHandle, RetryPolicy, SyncError, SyncOrchestrator, SyncReport};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Core(#[from] KizunaError),
    #[error("failed to set up HTTP client: {0}")]
    Transport(#[from] TransportError),
    #[error("{0} is disabled in the configuration")]
    ServiceDisabled(ServiceKind),
}

/// Composition root: configuration, storage and the orchestrator for the
/// active service.
///
/// Exactly one service is authoritative at a time. Switching cancels
/// everything in flight on the old one before the new one takes over.
pub struct Runtime<T = ReqwestTransport> {
    config: AppConfig,
    db: DbHandle,
    transport: Arc<T>,
    active: RwLock<SyncOrchestrator<T>>,
}

impl Runtime {
    /// Load the user config, open the database and activate the primary service.
    pub async fn new() -> Result<Self, RuntimeError> {
        let config = AppConfig::load()?;
        let db_path = AppConfig::ensure_db_path()?;
        let db = DbHandle::open(&db_path)?;
        let transport = Arc::new(ReqwestTransport::new(config.sync.request_timeout())?);
        Self::with_parts(config, db, transport).await
    }
}

impl<T: Transport + 'static> Runtime<T> {
    pub async fn with_parts(
        config: AppConfig,
        db: DbHandle,
        transport: Arc<T>,
    ) -> Result<Self, RuntimeError> {
        let primary = config.services.primary;
        if !config.services.is_enabled(primary) {
            return Err(RuntimeError::ServiceDisabled(primary));
        }
        let orchestrator = activate(&config, &db, &transport, primary).await?;
        Ok(Self {
            config,
            db,
            transport,
            active: RwLock::new(orchestrator),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// The orchestrator of the active service.
    pub async fn orchestrator(&self) -> SyncOrchestrator<T> {
        self.active.read().await.clone()
    }

    pub async fn active_service(&self) -> ServiceKind {
        self.active.read().await.service()
    }

    /// Make `kind` the authoritative service.
    pub async fn switch_service(&self, kind: ServiceKind) -> Result<(), RuntimeError> {
        if !self.config.services.is_enabled(kind) {
            return Err(RuntimeError::ServiceDisabled(kind));
        }
        let mut active = self.active.write().await;
        if active.service() == kind {
            return Ok(());
        }
        active.cancel_all();
        let previous = active.service();
        *active = activate(&self.config, &self.db, &self.transport, kind).await?;
        info!(from = %previous, to = %kind, "switched service");
        Ok(())
    }

    /// Cancel outstanding work and wait for pending writes to reach disk.
    pub async fn shutdown(&self) {
        self.active.read().await.cancel_all();
        self.db.flush().await;
    }
}

/// Build an orchestrator for `kind` with its stored credential and library.
async fn activate<T: Transport + 'static>(
    config: &AppConfig,
    db: &DbHandle,
    transport: &Arc<T>,
    kind: ServiceKind,
) -> Result<SyncOrchestrator<T>, RuntimeError> {
    let client = ServiceClient::new(build_adapter(kind, &config.services), Arc::clone(transport))
        .with_credential_sink(Arc::new(db.clone()));
    if let Some(credential) = db.load_credential(kind).await? {
        client.restore_credential(credential);
    }
    let library = LocalLibrary::from_stored(db.load_library(kind).await?);
    info!(service = %kind, entries = library.len(), auth = %client.auth_state(), "service activated");

    Ok(SyncOrchestrator::new(
        client,
        RetryPolicy::from_config(&config.sync),
        library,
        Some(Arc::new(db.clone())),
    ))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use kizuna_api::{AuthState, CredentialSink, HttpRequest, HttpResponse};
    use kizuna_core::models::{Credential, LibraryEntry, WatchStatus};

    use super::*;

    /// Accepts every MyAnimeList list write and records the paths.
    #[derive(Default)]
    struct EchoTransport {
        paths: Mutex<Vec<String>>,
    }

    impl Transport for EchoTransport {
        async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
            self.paths.lock().unwrap().push(request.url.path().to_string());
            Ok(HttpResponse::new(
                200,
                r#"{"status":"watching","num_episodes_watched":2,"score":0,"updated_at":"2024-01-15T10:00:00+00:00"}"#,
            ))
        }
    }

    fn config(primary: ServiceKind) -> AppConfig {
        let mut config = AppConfig::default();
        config.services.primary = primary;
        config.services.mal.client_id = Some("cid".into());
        config
    }

    #[tokio::test]
    async fn test_activation_restores_credential_and_library() {
        let db = DbHandle::open_memory().unwrap();
        let entry = LibraryEntry::new(42, WatchStatus::Completed);
        db.save_entry(ServiceKind::MyAnimeList, entry, true).await.unwrap();
        db.credential_saved(ServiceKind::MyAnimeList, &Credential::new("tok"));

        let runtime = Runtime::with_parts(
            config(ServiceKind::MyAnimeList),
            db,
            Arc::new(EchoTransport::default()),
        )
        .await
        .unwrap();

        let sync = runtime.orchestrator().await;
        assert_eq!(sync.service(), ServiceKind::MyAnimeList);
        assert_eq!(sync.auth_state(), AuthState::Authenticated);
        let entries = sync.entries();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].needs_resync);
    }

    #[tokio::test]
    async fn test_confirmed_mutation_is_persisted() {
        let db = DbHandle::open_memory().unwrap();
        db.credential_saved(ServiceKind::MyAnimeList, &Credential::new("tok"));
        let transport = Arc::new(EchoTransport::default());
        let runtime = Runtime::with_parts(config(ServiceKind::MyAnimeList), db.clone(), transport.clone())
            .await
            .unwrap();

        let mut entry = LibraryEntry::new(7, WatchStatus::Watching);
        entry.watched_episodes = 2;
        runtime.orchestrator().await.add(entry).outcome().await.unwrap();

        let rows = db.load_library(ServiceKind::MyAnimeList).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].entry.watched_episodes, 2);
        assert!(!rows[0].needs_resync);
        assert_eq!(
            transport.paths.lock().unwrap().as_slice(),
            ["/v2/anime/7/my_list_status"]
        );
    }

    #[tokio::test]
    async fn test_switch_service_loads_that_services_state() {
        let db = DbHandle::open_memory().unwrap();
        db.save_entry(ServiceKind::Kitsu, LibraryEntry::new(1, WatchStatus::Watching), false)
            .await
            .unwrap();
        let runtime = Runtime::with_parts(
            config(ServiceKind::AniList),
            db,
            Arc::new(EchoTransport::default()),
        )
        .await
        .unwrap();
        assert_eq!(runtime.active_service().await, ServiceKind::AniList);
        assert!(runtime.orchestrator().await.entries().is_empty());

        runtime.switch_service(ServiceKind::Kitsu).await.unwrap();
        let sync = runtime.orchestrator().await;
        assert_eq!(sync.service(), ServiceKind::Kitsu);
        assert_eq!(sync.auth_state(), AuthState::Unauthenticated);
        assert_eq!(sync.entries().len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_service_is_refused() {
        let mut config = config(ServiceKind::AniList);
        config.services.kitsu.enabled = false;
        let runtime = Runtime::with_parts(
            config,
            DbHandle::open_memory().unwrap(),
            Arc::new(EchoTransport::default()),
        )
        .await
        .unwrap();

        let err = runtime.switch_service(ServiceKind::Kitsu).await.unwrap_err();
        assert!(matches!(err, RuntimeError::ServiceDisabled(ServiceKind::Kitsu)));
        assert_eq!(runtime.active_service().await, ServiceKind::AniList);
    }
}
