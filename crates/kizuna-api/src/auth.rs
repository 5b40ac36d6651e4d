use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use kizuna_core::models::{Credential, ServiceKind};
use tracing::{debug, info, warn};

/// Authentication lifecycle of one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Authenticating,
    Authenticated,
    Expired,
}

impl AuthState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Authenticating => "authenticating",
            Self::Authenticated => "authenticated",
            Self::Expired => "expired",
        }
    }
}

impl std::fmt::Display for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persistence hooks for credentials.
///
/// Called synchronously from inside the controller; implementations should
/// hand the work off rather than block.
pub trait CredentialSink: Send + Sync {
    fn credential_saved(&self, service: ServiceKind, credential: &Credential);
    fn credential_cleared(&self, service: ServiceKind);
}

struct AuthInner {
    state: AuthState,
    credential: Option<Arc<Credential>>,
}

/// Owns the credential for one service and tracks its state.
///
/// The credential is replaced as a whole, so a reader sees either the old or
/// the new one.
pub struct AuthController {
    service: ServiceKind,
    inner: RwLock<AuthInner>,
    sink: Option<Arc<dyn CredentialSink>>,
}

impl AuthController {
    pub fn new(service: ServiceKind) -> Self {
        Self {
            service,
            inner: RwLock::new(AuthInner {
                state: AuthState::Unauthenticated,
                credential: None,
            }),
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn CredentialSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn service(&self) -> ServiceKind {
        self.service
    }

    pub fn state(&self) -> AuthState {
        self.read().state
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == AuthState::Authenticated
    }

    /// Load a previously persisted credential.
    pub fn restore(&self, credential: Credential) {
        let state = if credential.is_expired_at(Utc::now()) {
            AuthState::Expired
        } else {
            AuthState::Authenticated
        };
        let mut inner = self.write();
        inner.credential = Some(Arc::new(credential));
        inner.state = state;
        info!(service = %self.service, %state, "restored credential");
    }

    /// Drop the credential and forget it in storage.
    pub fn logout(&self) {
        let had_credential = {
            let mut inner = self.write();
            inner.state = AuthState::Unauthenticated;
            inner.credential.take().is_some()
        };
        info!(service = %self.service, "logged out");
        if had_credential {
            if let Some(sink) = &self.sink {
                sink.credential_cleared(self.service);
            }
        }
    }

    pub(crate) fn credential(&self) -> Option<Arc<Credential>> {
        self.read().credential.clone()
    }

    pub(crate) fn begin(&self) {
        self.write().state = AuthState::Authenticating;
        debug!(service = %self.service, "authentication started");
    }

    pub(crate) fn complete(&self, credential: Credential) {
        if let Some(sink) = &self.sink {
            sink.credential_saved(self.service, &credential);
        }
        let mut inner = self.write();
        inner.credential = Some(Arc::new(credential));
        inner.state = AuthState::Authenticated;
        info!(service = %self.service, "authenticated");
    }

    /// A login or refresh attempt failed: the old credential is discarded.
    pub(crate) fn fail(&self) {
        let had_credential = {
            let mut inner = self.write();
            inner.state = AuthState::Unauthenticated;
            inner.credential.take().is_some()
        };
        warn!(service = %self.service, "authentication failed");
        if had_credential {
            if let Some(sink) = &self.sink {
                sink.credential_cleared(self.service);
            }
        }
    }

    /// A refresh could not complete for a reason unrelated to the
    /// credential: keep it and stay expired so a later call can retry.
    pub(crate) fn refresh_failed(&self) {
        let mut inner = self.write();
        if inner.state == AuthState::Authenticating {
            inner.state = AuthState::Expired;
        }
        warn!(service = %self.service, "token refresh failed, credential kept");
    }

    /// The service rejected the current credential.
    pub(crate) fn expire(&self) {
        let mut inner = self.write();
        if inner.state == AuthState::Authenticated {
            inner.state = AuthState::Expired;
            warn!(service = %self.service, "credential rejected by service");
        }
    }

    /// Move to `Expired` if the credential's lifetime has passed.
    pub(crate) fn check_expiry(&self, now: DateTime<Utc>) -> AuthState {
        let mut inner = self.write();
        let lapsed = inner
            .credential
            .as_ref()
            .is_some_and(|c| c.is_expired_at(now));
        if inner.state == AuthState::Authenticated && lapsed {
            inner.state = AuthState::Expired;
            info!(service = %self.service, "credential expired");
        }
        inner.state
    }

    fn read(&self) -> RwLockReadGuard<'_, AuthInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, AuthInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}
