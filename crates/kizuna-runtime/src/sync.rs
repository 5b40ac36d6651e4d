use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kizuna_api::{
    AuthState, BuildError, ErrorClass, ErrorInfo, Payload, Request, RequestType, Response,
    ServiceClient, Transport,
};
use kizuna_core::config::SyncConfig;
use kizuna_core::models::{AnimeSeason, LibraryEntry, MediaEntry, ServiceKind};

use crate::library::{LibrarySink, LocalLibrary, TrackedEntry};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Service(#[from] ErrorInfo),
    #[error("operation cancelled")]
    Cancelled,
    #[error("{0} returned an unexpected payload")]
    UnexpectedPayload(RequestType),
}

impl SyncError {
    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            Self::Service(error) => Some(error.class),
            _ => None,
        }
    }
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Wait after a rate limit that came without `Retry-After`.
    pub rate_limit_cooldown: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_backoff: config.base_backoff(),
            max_backoff: config.max_backoff(),
            rate_limit_cooldown: config.rate_limit_cooldown(),
        }
    }

    /// Wait before the attempt following failed attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32, error: &ErrorInfo) -> Duration {
        if error.class == ErrorClass::RateLimited {
            return error.retry_after.unwrap_or(self.rate_limit_cooldown);
        }
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

/// Summary of one library fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub remote: usize,
    pub added: usize,
    pub replaced: usize,
    pub kept_local: usize,
    pub removed: usize,
    pub repushed: usize,
}

/// Completion of one submitted mutation.
#[derive(Debug)]
pub struct MutationHandle {
    media_id: u64,
    rx: oneshot::Receiver<Result<Response, SyncError>>,
}

impl MutationHandle {
    pub fn media_id(&self) -> u64 {
        self.media_id
    }

    pub async fn outcome(self) -> Result<Response, SyncError> {
        self.rx.await.unwrap_or(Err(SyncError::Cancelled))
    }
}

#[derive(Debug)]
enum Mutation {
    Add(LibraryEntry),
    Update(LibraryEntry),
    Delete(u64),
}

impl Mutation {
    fn media_id(&self) -> u64 {
        match self {
            Self::Add(entry) | Self::Update(entry) => entry.media_id,
            Self::Delete(media_id) => *media_id,
        }
    }
}

struct Job {
    mutation: Mutation,
    token: CancellationToken,
    reply: oneshot::Sender<Result<Response, SyncError>>,
}

#[derive(Default)]
struct Lanes {
    senders: HashMap<u64, mpsc::UnboundedSender<Job>>,
    /// Queued plus running mutations per media id.
    pending: HashMap<u64, usize>,
}

struct Shared<T> {
    client: ServiceClient<T>,
    library: Mutex<LocalLibrary>,
    lanes: Mutex<Lanes>,
    policy: RetryPolicy,
    cancel: Mutex<CancellationToken>,
    sink: Option<Arc<dyn LibrarySink>>,
    /// Signalled whenever the last pending mutation finishes.
    idle: Notify,
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drives one service: reads run concurrently, mutations for the same
/// media id run one at a time in submission order, and every result is
/// folded into the local library.
///
/// Submitting mutations spawns tasks, so it must happen inside a Tokio
/// runtime.
pub struct SyncOrchestrator<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for SyncOrchestrator<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Transport + 'static> SyncOrchestrator<T> {
    pub fn new(
        client: ServiceClient<T>,
        policy: RetryPolicy,
        library: LocalLibrary,
        sink: Option<Arc<dyn LibrarySink>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                client,
                library: Mutex::new(library),
                lanes: Mutex::default(),
                policy,
                cancel: Mutex::new(CancellationToken::new()),
                sink,
                idle: Notify::new(),
            }),
        }
    }

    pub fn service(&self) -> ServiceKind {
        self.shared.client.kind()
    }

    pub fn auth_state(&self) -> AuthState {
        self.shared.client.auth_state()
    }

    pub fn entries(&self) -> Vec<TrackedEntry> {
        lock(&self.shared.library).entries()
    }

    pub fn entry(&self, media_id: u64) -> Option<TrackedEntry> {
        lock(&self.shared.library).get(media_id).cloned()
    }

    /// Run an `AuthenticateUser` request built by the caller.
    pub async fn authenticate(&self, request: Request) -> Result<(), SyncError> {
        let token = self.shared.token();
        self.shared.dispatch(request, &token).await?;
        info!(service = %self.service(), "logged in");
        Ok(())
    }

    pub fn logout(&self) {
        self.shared.client.logout();
        info!(service = %self.service(), "logged out");
    }

    /// Cancel every queued and running exchange. Later calls start fresh.
    pub fn cancel_all(&self) {
        let mut root = lock(&self.shared.cancel);
        root.cancel();
        *root = CancellationToken::new();
        info!(service = %self.service(), "cancelled in-flight requests");
    }

    /// Wait until no mutation is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if lock(&self.shared.lanes).pending.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Fetch the remote library and reconcile it into the local one.
    pub async fn fetch_library(&self) -> Result<SyncReport, SyncError> {
        let token = self.shared.token();
        let since = lock(&self.shared.library).generation();
        let mut in_flight = self.shared.in_flight();

        let response = self.shared.dispatch(Request::library(), &token).await?;
        let remote = match response.payload {
            Payload::Library(entries) => entries,
            Payload::Empty => Vec::new(),
            _ => return Err(SyncError::UnexpectedPayload(RequestType::GetLibraryEntries)),
        };
        if token.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let remote_count = remote.len();
        in_flight.extend(self.shared.in_flight());
        let report = lock(&self.shared.library).reconcile(remote, &in_flight, since);

        for tracked in &report.changed {
            self.shared.saved(tracked);
        }
        for media_id in &report.removed {
            self.shared.removed(*media_id);
        }
        for repush in &report.repush {
            let mutation = if repush.exists_remotely {
                Mutation::Update(repush.entry.clone())
            } else {
                Mutation::Add(repush.entry.clone())
            };
            drop(self.submit(mutation));
        }

        let summary = SyncReport {
            remote: remote_count,
            added: report.added,
            replaced: report.replaced,
            kept_local: report.kept_local,
            removed: report.removed.len(),
            repushed: report.repush.len(),
        };
        info!(
            service = %self.service(),
            remote = summary.remote,
            added = summary.added,
            replaced = summary.replaced,
            kept_local = summary.kept_local,
            removed = summary.removed,
            repushed = summary.repushed,
            "library synced"
        );
        Ok(summary)
    }

    pub async fn search(&self, query: &str) -> Result<Vec<MediaEntry>, SyncError> {
        self.fetch_media(Request::search(query)).await
    }

    pub async fn season(&self, season: AnimeSeason, year: u32) -> Result<Vec<MediaEntry>, SyncError> {
        self.fetch_media(Request::season(season, year)).await
    }

    pub async fn metadata(&self, media_id: u64) -> Result<MediaEntry, SyncError> {
        let token = self.shared.token();
        let response = self.shared.dispatch(Request::metadata(media_id), &token).await?;
        match response.payload {
            Payload::MediaEntry(media) => {
                lock(&self.shared.library).remember_media(media.id);
                Ok(media)
            }
            _ => Err(SyncError::UnexpectedPayload(RequestType::GetMetadataById)),
        }
    }

    async fn fetch_media(&self, request: Request) -> Result<Vec<MediaEntry>, SyncError> {
        let request_type = request.request_type();
        let token = self.shared.token();
        let response = self.shared.dispatch(request, &token).await?;
        let media = match response.payload {
            Payload::Media(media) => media,
            Payload::Empty => Vec::new(),
            _ => return Err(SyncError::UnexpectedPayload(request_type)),
        };
        let mut library = lock(&self.shared.library);
        for item in &media {
            library.remember_media(item.id);
        }
        Ok(media)
    }

    pub fn add(&self, entry: LibraryEntry) -> MutationHandle {
        self.submit(Mutation::Add(entry))
    }

    pub fn update(&self, entry: LibraryEntry) -> MutationHandle {
        self.submit(Mutation::Update(entry))
    }

    pub fn delete(&self, media_id: u64) -> MutationHandle {
        self.submit(Mutation::Delete(media_id))
    }

    /// Push every entry whose last change was never confirmed.
    pub fn resync(&self) -> Vec<MutationHandle> {
        let pending = lock(&self.shared.library).pending_resync();
        debug!(service = %self.service(), count = pending.len(), "resyncing pending entries");
        pending
            .into_iter()
            .map(|tracked| {
                let mutation = match tracked.entry.library_id {
                    Some(_) => Mutation::Update(tracked.entry),
                    None => Mutation::Add(tracked.entry),
                };
                self.submit(mutation)
            })
            .collect()
    }

    fn submit(&self, mutation: Mutation) -> MutationHandle {
        let media_id = mutation.media_id();
        let (reply, rx) = oneshot::channel();
        let job = Job {
            mutation,
            token: self.shared.token(),
            reply,
        };

        let mut lanes = lock(&self.shared.lanes);
        *lanes.pending.entry(media_id).or_default() += 1;
        let unsent = match lanes.senders.get(&media_id) {
            Some(tx) => tx.send(job).err().map(|e| e.0),
            None => Some(job),
        };
        if let Some(job) = unsent {
            let (tx, lane_rx) = mpsc::unbounded_channel();
            // The receiver is alive, so this cannot fail.
            let _ = tx.send(job);
            lanes.senders.insert(media_id, tx);
            tokio::spawn(run_lane(Arc::clone(&self.shared), media_id, lane_rx));
        }

        MutationHandle { media_id, rx }
    }
}

/// Executes the mutations of one media id in order, then exits.
async fn run_lane<T: Transport + 'static>(
    shared: Arc<Shared<T>>,
    media_id: u64,
    mut rx: mpsc::UnboundedReceiver<Job>,
) {
    loop {
        // Checked under the lanes lock so a concurrent submit either lands
        // in this queue or finds the lane gone and starts a new one.
        let job = {
            let mut lanes = lock(&shared.lanes);
            match rx.try_recv() {
                Ok(job) => job,
                Err(_) => {
                    lanes.senders.remove(&media_id);
                    return;
                }
            }
        };

        let result = if job.token.is_cancelled() {
            Err(SyncError::Cancelled)
        } else {
            match job.mutation {
                Mutation::Add(entry) => {
                    shared
                        .save_entry(RequestType::AddLibraryEntry, entry, &job.token)
                        .await
                }
                Mutation::Update(entry) => {
                    shared
                        .save_entry(RequestType::UpdateLibraryEntry, entry, &job.token)
                        .await
                }
                Mutation::Delete(media_id) => shared.delete_entry(media_id, &job.token).await,
            }
        };

        let now_idle = {
            let mut lanes = lock(&shared.lanes);
            if let Some(count) = lanes.pending.get_mut(&media_id) {
                *count -= 1;
                if *count == 0 {
                    lanes.pending.remove(&media_id);
                }
            }
            lanes.pending.is_empty()
        };
        if now_idle {
            shared.idle.notify_waiters();
        }
        if let Err(e) = &result {
            debug!(media_id, error = %e, "mutation failed");
        }
        let _ = job.reply.send(result);
    }
}

impl<T: Transport> Shared<T> {
    fn token(&self) -> CancellationToken {
        lock(&self.cancel).child_token()
    }

    fn in_flight(&self) -> HashSet<u64> {
        lock(&self.lanes).pending.keys().copied().collect()
    }

    fn saved(&self, tracked: &TrackedEntry) {
        if let Some(sink) = &self.sink {
            sink.entry_saved(self.client.kind(), tracked);
        }
    }

    fn removed(&self, media_id: u64) {
        if let Some(sink) = &self.sink {
            sink.entry_removed(self.client.kind(), media_id);
        }
    }

    /// Execute a request, retrying transient failures, until it succeeds,
    /// fails for good or `token` is cancelled.
    async fn dispatch(&self, request: Request, token: &CancellationToken) -> Result<Response, SyncError> {
        let request_type = request.request_type();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let response = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(SyncError::Cancelled),
                response = self.client.execute(request.clone()) => response?,
            };

            let error = match response.error {
                Some(error) => error,
                None => return Ok(response),
            };
            if !error.retriable || attempt >= self.policy.max_attempts {
                warn!(
                    service = %self.client.kind(),
                    %request_type,
                    attempt,
                    class = %error.class,
                    "request failed: {}",
                    error.message
                );
                return Err(SyncError::Service(error));
            }

            let delay = self.policy.delay(attempt, &error);
            debug!(
                service = %self.client.kind(),
                %request_type,
                attempt,
                class = %error.class,
                delay_ms = delay.as_millis() as u64,
                "retrying"
            );
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(SyncError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn save_entry(
        &self,
        request_type: RequestType,
        mut entry: LibraryEntry,
        token: &CancellationToken,
    ) -> Result<Response, SyncError> {
        let media_id = entry.media_id;
        if entry.library_id.is_none() {
            entry.library_id = lock(&self.library)
                .get(media_id)
                .and_then(|t| t.entry.library_id.clone());
        }
        let request = match request_type {
            RequestType::AddLibraryEntry => Request::add_entry(&entry),
            _ => Request::update_entry(&entry),
        };

        match self.dispatch(request, token).await {
            Ok(_) if token.is_cancelled() => Err(SyncError::Cancelled),
            Ok(mut response) => {
                let confirmed = match std::mem::replace(&mut response.payload, Payload::Empty) {
                    Payload::LibraryEntry(mut confirmed) => {
                        if confirmed.library_id.is_none() {
                            confirmed.library_id = entry.library_id;
                        }
                        confirmed
                    }
                    _ => entry,
                };
                let tracked = lock(&self.library).apply_confirmed(confirmed.clone());
                self.saved(&tracked);
                debug!(media_id, %request_type, "entry confirmed");
                response.payload = Payload::LibraryEntry(confirmed);
                Ok(response)
            }
            Err(SyncError::Service(error)) => {
                let tracked = {
                    let mut library = lock(&self.library);
                    library
                        .knows_media(media_id)
                        .then(|| library.apply_unconfirmed(entry))
                };
                match &tracked {
                    Some(tracked) => self.saved(tracked),
                    None => warn!(media_id, "not keeping an entry for unknown media"),
                }
                Err(SyncError::Service(error))
            }
            Err(e) => Err(e),
        }
    }

    /// Removes the entry up front and puts it back unless the service
    /// confirmed the delete or reported the entry gone.
    async fn delete_entry(&self, media_id: u64, token: &CancellationToken) -> Result<Response, SyncError> {
        let removed = lock(&self.library).remove(media_id);
        if removed.is_some() {
            self.removed(media_id);
        }
        let library_id = removed.as_ref().and_then(|t| t.entry.library_id.clone());

        let result = self
            .dispatch(Request::delete_entry(media_id, library_id.as_deref()), token)
            .await;
        match &result {
            Ok(_) => debug!(media_id, "entry deleted"),
            Err(SyncError::Service(error)) if error.is(ErrorClass::NotFound) => {
                debug!(media_id, "entry already absent remotely");
            }
            Err(_) => {
                if let Some(tracked) = removed {
                    let tracked = lock(&self.library).restore(tracked);
                    self.saved(&tracked);
                    debug!(media_id, "delete rolled back");
                }
            }
        }
        result
    }
}
