use std::path::Path;

use tokio::sync::{mpsc, oneshot};

use kizuna_api::CredentialSink;
use kizuna_core::error::KizunaError;
use kizuna_core::models::{Credential, LibraryEntry, ServiceKind};
use kizuna_core::storage::{Storage, StoredEntry};

use crate::library::{LibrarySink, TrackedEntry};

type Reply<T> = oneshot::Sender<Result<T, KizunaError>>;

/// Handle to the database thread. Cheap to clone.
///
/// SQLite access is blocking, so all storage calls run on one dedicated
/// thread and are fed through a channel. Writes coming from the sink
/// traits are fire-and-forget; the actor logs their failures.
#[derive(Clone)]
pub struct DbHandle {
    tx: mpsc::UnboundedSender<DbCommand>,
}

enum DbCommand {
    LoadLibrary {
        service: ServiceKind,
        reply: Reply<Vec<StoredEntry>>,
    },
    SaveEntry {
        service: ServiceKind,
        entry: LibraryEntry,
        needs_resync: bool,
        reply: Option<Reply<()>>,
    },
    RemoveEntry {
        service: ServiceKind,
        media_id: u64,
        reply: Option<Reply<()>>,
    },
    LoadCredential {
        service: ServiceKind,
        reply: Reply<Option<Credential>>,
    },
    SaveCredential {
        service: ServiceKind,
        credential: Credential,
        reply: Option<Reply<()>>,
    },
    ClearCredential {
        service: ServiceKind,
        reply: Option<Reply<()>>,
    },
    Flush {
        reply: oneshot::Sender<()>,
    },
}

impl DbHandle {
    pub fn open(path: &Path) -> Result<Self, KizunaError> {
        let storage = Storage::open(path)?;
        Self::spawn(storage)
    }

    /// Actor over an in-memory database.
    pub fn open_memory() -> Result<Self, KizunaError> {
        Self::spawn(Storage::open_memory()?)
    }

    fn spawn(storage: Storage) -> Result<Self, KizunaError> {
        let (tx, rx) = mpsc::unbounded_channel();
        std::thread::Builder::new()
            .name("db-actor".into())
            .spawn(move || actor_loop(storage, rx))?;
        Ok(Self { tx })
    }

    pub async fn load_library(&self, service: ServiceKind) -> Result<Vec<StoredEntry>, KizunaError> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(DbCommand::LoadLibrary { service, reply });
        rx.await.unwrap_or_else(|_| Err(actor_closed()))
    }

    pub async fn save_entry(
        &self,
        service: ServiceKind,
        entry: LibraryEntry,
        needs_resync: bool,
    ) -> Result<(), KizunaError> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(DbCommand::SaveEntry {
            service,
            entry,
            needs_resync,
            reply: Some(reply),
        });
        rx.await.unwrap_or_else(|_| Err(actor_closed()))
    }

    pub async fn remove_entry(&self, service: ServiceKind, media_id: u64) -> Result<(), KizunaError> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(DbCommand::RemoveEntry {
            service,
            media_id,
            reply: Some(reply),
        });
        rx.await.unwrap_or_else(|_| Err(actor_closed()))
    }

    pub async fn load_credential(&self, service: ServiceKind) -> Result<Option<Credential>, KizunaError> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(DbCommand::LoadCredential { service, reply });
        rx.await.unwrap_or_else(|_| Err(actor_closed()))
    }

    pub async fn clear_credential(&self, service: ServiceKind) -> Result<(), KizunaError> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(DbCommand::ClearCredential {
            service,
            reply: Some(reply),
        });
        rx.await.unwrap_or_else(|_| Err(actor_closed()))
    }

    /// Wait until every command sent before this one has been applied.
    pub async fn flush(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(DbCommand::Flush { reply }).is_ok() {
            let _ = rx.await;
        }
    }
}

impl CredentialSink for DbHandle {
    fn credential_saved(&self, service: ServiceKind, credential: &Credential) {
        let _ = self.tx.send(DbCommand::SaveCredential {
            service,
            credential: credential.clone(),
            reply: None,
        });
    }

    fn credential_cleared(&self, service: ServiceKind) {
        let _ = self.tx.send(DbCommand::ClearCredential {
            service,
            reply: None,
        });
    }
}

impl LibrarySink for DbHandle {
    fn entry_saved(&self, service: ServiceKind, entry: &TrackedEntry) {
        let _ = self.tx.send(DbCommand::SaveEntry {
            service,
            entry: entry.entry.clone(),
            needs_resync: entry.needs_resync,
            reply: None,
        });
    }

    fn entry_removed(&self, service: ServiceKind, media_id: u64) {
        let _ = self.tx.send(DbCommand::RemoveEntry {
            service,
            media_id,
            reply: None,
        });
    }
}

fn actor_closed() -> KizunaError {
    KizunaError::Config("DB actor closed".into())
}

/// Deliver a write result, or log it when nobody is waiting.
fn finish(what: &str, result: Result<(), KizunaError>, reply: Option<Reply<()>>) {
    match reply {
        Some(reply) => {
            let _ = reply.send(result);
        }
        None => {
            if let Err(e) = result {
                tracing::warn!("Failed to {what}: {e}");
            }
        }
    }
}

fn actor_loop(storage: Storage, mut rx: mpsc::UnboundedReceiver<DbCommand>) {
    while let Some(cmd) = rx.blocking_recv() {
        match cmd {
            DbCommand::LoadLibrary { service, reply } => {
                let _ = reply.send(storage.load_library(service));
            }
            DbCommand::SaveEntry {
                service,
                entry,
                needs_resync,
                reply,
            } => {
                let result = storage.upsert_library_entry(service, &entry, needs_resync);
                finish("save library entry", result, reply);
            }
            DbCommand::RemoveEntry {
                service,
                media_id,
                reply,
            } => {
                let result = storage.delete_library_entry(service, media_id);
                finish("remove library entry", result, reply);
            }
            DbCommand::LoadCredential { service, reply } => {
                let _ = reply.send(storage.load_credential(service));
            }
            DbCommand::SaveCredential {
                service,
                credential,
                reply,
            } => {
                let result = storage.save_credential(service, &credential);
                finish("save credential", result, reply);
            }
            DbCommand::ClearCredential { service, reply } => {
                let result = storage.clear_credential(service);
                finish("clear credential", result, reply);
            }
            DbCommand::Flush { reply } => {
                let _ = reply.send(());
            }
        }
    }
    tracing::debug!("DB actor stopped");
}

#[cfg(test)]
mod tests {
    use kizuna_core::models::WatchStatus;

    use super::*;

    #[tokio::test]
    async fn test_sink_writes_are_visible_to_later_reads() {
        let db = DbHandle::open_memory().unwrap();
        let mut entry = LibraryEntry::new(5114, WatchStatus::Watching);
        entry.watched_episodes = 1;

        db.entry_saved(
            ServiceKind::MyAnimeList,
            &TrackedEntry {
                entry: entry.clone(),
                needs_resync: true,
            },
        );
        let rows = db.load_library(ServiceKind::MyAnimeList).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].entry.watched_episodes, 1);
        assert!(rows[0].needs_resync);

        db.entry_removed(ServiceKind::MyAnimeList, 5114);
        db.flush().await;
        assert!(db
            .load_library(ServiceKind::MyAnimeList)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_credential_roundtrip() {
        let db = DbHandle::open_memory().unwrap();
        db.credential_saved(ServiceKind::AniList, &Credential::new("tok"));
        let loaded = db.load_credential(ServiceKind::AniList).await.unwrap();
        assert_eq!(loaded.unwrap().access_token(), "tok");

        db.clear_credential(ServiceKind::AniList).await.unwrap();
        assert!(db.load_credential(ServiceKind::AniList).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_awaited_writes() {
        let db = DbHandle::open_memory().unwrap();
        let entry = LibraryEntry::new(1, WatchStatus::PlanToWatch);
        db.save_entry(ServiceKind::Kitsu, entry, false).await.unwrap();
        assert_eq!(db.load_library(ServiceKind::Kitsu).await.unwrap().len(), 1);
        db.remove_entry(ServiceKind::Kitsu, 1).await.unwrap();
        assert!(db.load_library(ServiceKind::Kitsu).await.unwrap().is_empty());
    }
}
