use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::KizunaError;
use crate::models::{Credential, LibraryEntry, ServiceKind, WatchStatus};

const SCHEMA_V1: &str = include_str!("../../../migrations/001_initial.sql");

const DATE_FORMAT: &str = "%Y-%m-%d";

/// SQLite-backed storage for library entries and service credentials.
pub struct Storage {
    conn: Connection,
}

/// A persisted library entry with its sync flag.
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub entry: LibraryEntry,
    pub needs_resync: bool,
}

impl Storage {
    /// Open (or create) the database at the given path and run migrations.
    pub fn open(path: &Path) -> Result<Self, KizunaError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        run_migrations(&conn)?;
        Ok(Self { conn })
    }

    /// Open an in-memory database (for tests).
    pub fn open_memory() -> Result<Self, KizunaError> {
        let conn = Connection::open_in_memory()?;
        run_migrations(&conn)?;
        Ok(Self { conn })
    }

    // ── Library entries ─────────────────────────────────────────

    /// All library entries stored for a service, ordered by media id.
    pub fn load_library(&self, service: ServiceKind) -> Result<Vec<StoredEntry>, KizunaError> {
        let mut stmt = self.conn.prepare(
            "SELECT media_id, library_id, status, watched_episodes, score,
             start_date, finish_date, last_updated, needs_resync
             FROM library_entries WHERE service = ?1 ORDER BY media_id",
        )?;
        let rows = stmt
            .query_map(params![service.as_key()], row_to_stored_entry)?
            .filter_map(|row| match row {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::warn!(service = %service, "Skipping unreadable library row: {e}");
                    None
                }
            })
            .collect();
        Ok(rows)
    }

    pub fn get_library_entry(
        &self,
        service: ServiceKind,
        media_id: u64,
    ) -> Result<Option<StoredEntry>, KizunaError> {
        self.conn
            .query_row(
                "SELECT media_id, library_id, status, watched_episodes, score,
                 start_date, finish_date, last_updated, needs_resync
                 FROM library_entries WHERE service = ?1 AND media_id = ?2",
                params![service.as_key(), media_id as i64],
                row_to_stored_entry,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Insert or replace the entry for `(service, media_id)`.
    pub fn upsert_library_entry(
        &self,
        service: ServiceKind,
        entry: &LibraryEntry,
        needs_resync: bool,
    ) -> Result<(), KizunaError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO library_entries
             (service, media_id, library_id, status, watched_episodes, score,
              start_date, finish_date, last_updated, needs_resync)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                service.as_key(),
                entry.media_id as i64,
                entry.library_id,
                entry.status.as_db_str(),
                entry.watched_episodes,
                entry.score,
                entry.start_date.map(|d| d.format(DATE_FORMAT).to_string()),
                entry.finish_date.map(|d| d.format(DATE_FORMAT).to_string()),
                entry.last_updated.to_rfc3339(),
                needs_resync as i32,
            ],
        )?;
        Ok(())
    }

    pub fn delete_library_entry(
        &self,
        service: ServiceKind,
        media_id: u64,
    ) -> Result<(), KizunaError> {
        self.conn.execute(
            "DELETE FROM library_entries WHERE service = ?1 AND media_id = ?2",
            params![service.as_key(), media_id as i64],
        )?;
        Ok(())
    }

    // ── Credentials ─────────────────────────────────────────────

    /// Store the credential for a service, replacing any previous one.
    pub fn save_credential(
        &self,
        service: ServiceKind,
        credential: &Credential,
    ) -> Result<(), KizunaError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO auth_tokens (service, token, refresh, expires_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                service.as_key(),
                credential.access_token(),
                credential.refresh_token(),
                credential.expires_at().map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn load_credential(&self, service: ServiceKind) -> Result<Option<Credential>, KizunaError> {
        self.conn
            .query_row(
                "SELECT token, refresh, expires_at FROM auth_tokens WHERE service = ?1",
                params![service.as_key()],
                |row| {
                    let token: String = row.get(0)?;
                    let refresh: Option<String> = row.get(1)?;
                    let expires_at: Option<String> = row.get(2)?;
                    Ok(Credential::new(token)
                        .with_refresh_token(refresh)
                        .with_expiry(expires_at.as_deref().and_then(parse_datetime)))
                },
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn clear_credential(&self, service: ServiceKind) -> Result<(), KizunaError> {
        self.conn.execute(
            "DELETE FROM auth_tokens WHERE service = ?1",
            params![service.as_key()],
        )?;
        Ok(())
    }
}

fn run_migrations(conn: &Connection) -> Result<(), KizunaError> {
    let version: i32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .unwrap_or(0);

    if version < 1 {
        tracing::info!("Applying database migration 1");
        conn.execute_batch(SCHEMA_V1)?;
        conn.pragma_update(None, "user_version", 1)?;
    }
    Ok(())
}

// ── Helpers ─────────────────────────────────────────────────────

/// Parse a datetime string from SQLite (either RFC 3339 or SQLite's `datetime('now')` format).
fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, message.into())
}

fn parse_date(s: Option<String>) -> Option<NaiveDate> {
    s.and_then(|s| NaiveDate::parse_from_str(&s, DATE_FORMAT).ok())
}

fn row_to_stored_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredEntry> {
    let status_str: String = row.get(2)?;
    let status = WatchStatus::from_db_str(&status_str)
        .ok_or_else(|| conversion_error(2, format!("unknown status '{status_str}'")))?;
    let updated_str: String = row.get(7)?;
    let last_updated = parse_datetime(&updated_str)
        .ok_or_else(|| conversion_error(7, format!("bad timestamp '{updated_str}'")))?;

    Ok(StoredEntry {
        entry: LibraryEntry {
            media_id: row.get::<_, i64>(0)? as u64,
            library_id: row.get(1)?,
            status,
            watched_episodes: row.get(3)?,
            score: row.get(4)?,
            start_date: parse_date(row.get(5)?),
            finish_date: parse_date(row.get(6)?),
            last_updated,
        },
        needs_resync: row.get::<_, i32>(8)? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_entry() -> LibraryEntry {
        LibraryEntry {
            media_id: 154587,
            library_id: Some("9001".into()),
            status: WatchStatus::Watching,
            watched_episodes: 5,
            score: Some(8.5),
            start_date: NaiveDate::from_ymd_opt(2023, 9, 29),
            finish_date: None,
            last_updated: Utc::now(),
        }
    }

    #[test]
    fn test_library_entry_crud() {
        let db = Storage::open_memory().unwrap();
        let entry = test_entry();
        db.upsert_library_entry(ServiceKind::AniList, &entry, false)
            .unwrap();

        let rows = db.load_library(ServiceKind::AniList).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].entry.media_id, 154587);
        assert_eq!(rows[0].entry.library_id.as_deref(), Some("9001"));
        assert_eq!(rows[0].entry.score, Some(8.5));
        assert_eq!(rows[0].entry.start_date, NaiveDate::from_ymd_opt(2023, 9, 29));
        assert!(!rows[0].needs_resync);

        // Other services do not see it.
        assert!(db.load_library(ServiceKind::Kitsu).unwrap().is_empty());

        let mut updated = entry.clone();
        updated.watched_episodes = 10;
        db.upsert_library_entry(ServiceKind::AniList, &updated, true)
            .unwrap();
        let stored = db
            .get_library_entry(ServiceKind::AniList, 154587)
            .unwrap()
            .unwrap();
        assert_eq!(stored.entry.watched_episodes, 10);
        assert!(stored.needs_resync);

        db.delete_library_entry(ServiceKind::AniList, 154587)
            .unwrap();
        assert!(db
            .get_library_entry(ServiceKind::AniList, 154587)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_last_updated_survives_roundtrip() {
        let db = Storage::open_memory().unwrap();
        let entry = test_entry();
        db.upsert_library_entry(ServiceKind::MyAnimeList, &entry, false)
            .unwrap();
        let stored = db
            .get_library_entry(ServiceKind::MyAnimeList, entry.media_id)
            .unwrap()
            .unwrap();
        assert_eq!(
            stored.entry.last_updated.timestamp(),
            entry.last_updated.timestamp()
        );
    }

    #[test]
    fn test_credentials() {
        let db = Storage::open_memory().unwrap();
        assert!(db.load_credential(ServiceKind::Kitsu).unwrap().is_none());

        db.save_credential(ServiceKind::Kitsu, &Credential::new("abc123"))
            .unwrap();
        let cred = db.load_credential(ServiceKind::Kitsu).unwrap().unwrap();
        assert_eq!(cred.access_token(), "abc123");
        assert!(cred.refresh_token().is_none());

        // Overwrite.
        let expires = Utc::now() + chrono::Duration::days(30);
        let cred = Credential::new("xyz789")
            .with_refresh_token(Some("refresh_tok".into()))
            .with_expiry(Some(expires));
        db.save_credential(ServiceKind::Kitsu, &cred).unwrap();
        let loaded = db.load_credential(ServiceKind::Kitsu).unwrap().unwrap();
        assert_eq!(loaded.access_token(), "xyz789");
        assert_eq!(loaded.refresh_token(), Some("refresh_tok"));
        assert_eq!(
            loaded.expires_at().map(|t| t.timestamp()),
            Some(expires.timestamp())
        );

        db.clear_credential(ServiceKind::Kitsu).unwrap();
        assert!(db.load_credential(ServiceKind::Kitsu).unwrap().is_none());
    }

    #[test]
    fn test_unreadable_rows_are_skipped() {
        let db = Storage::open_memory().unwrap();
        db.upsert_library_entry(ServiceKind::MyAnimeList, &test_entry(), false)
            .unwrap();
        db.conn
            .execute(
                "INSERT INTO library_entries (service, media_id, status, last_updated)
                 VALUES ('mal', 7, 'binging', '2024-01-01T00:00:00+00:00'),
                        ('mal', 8, 'watching', 'yesterday')",
                [],
            )
            .unwrap();

        let rows = db.load_library(ServiceKind::MyAnimeList).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].entry.media_id, 154587);
        assert!(db.get_library_entry(ServiceKind::MyAnimeList, 7).is_err());
    }

    #[test]
    fn test_reopen_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kizuna.db");
        {
            let db = Storage::open(&path).unwrap();
            db.upsert_library_entry(ServiceKind::AniList, &test_entry(), true)
                .unwrap();
        }
        let db = Storage::open(&path).unwrap();
        let rows = db.load_library(ServiceKind::AniList).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].needs_resync);
    }
}
