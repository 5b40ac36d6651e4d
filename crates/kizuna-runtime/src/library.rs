use std::collections::{HashMap, HashSet};

use serde::Serialize;

use kizuna_core::models::{LibraryEntry, ServiceKind};
use kizuna_core::storage::StoredEntry;

/// A local library entry together with its sync flag.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackedEntry {
    #[serde(flatten)]
    pub entry: LibraryEntry,
    /// The latest local change has not been confirmed by the service.
    pub needs_resync: bool,
}

impl From<StoredEntry> for TrackedEntry {
    fn from(stored: StoredEntry) -> Self {
        Self {
            entry: stored.entry,
            needs_resync: stored.needs_resync,
        }
    }
}

/// Receives every change made to the local library.
pub trait LibrarySink: Send + Sync {
    fn entry_saved(&self, service: ServiceKind, entry: &TrackedEntry);
    fn entry_removed(&self, service: ServiceKind, media_id: u64);
}

/// A local entry that reconciliation kept and that must be pushed again.
#[derive(Debug, Clone, PartialEq)]
pub struct Repush {
    pub entry: LibraryEntry,
    /// Whether the remote listing still contains the media id.
    pub exists_remotely: bool,
}

/// What a reconciliation pass changed.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub added: usize,
    pub replaced: usize,
    pub kept_local: usize,
    /// Entries written by the pass, to be persisted.
    pub changed: Vec<TrackedEntry>,
    pub removed: Vec<u64>,
    pub repush: Vec<Repush>,
}

/// The local copy of one account's library on one service.
///
/// Every mutation applied by the orchestrator bumps a generation counter
/// and stamps the touched media id, so a reconciliation can tell which
/// entries changed locally while its remote snapshot was in transit.
#[derive(Debug, Default)]
pub struct LocalLibrary {
    entries: HashMap<u64, TrackedEntry>,
    known_media: HashSet<u64>,
    generation: u64,
    touched: HashMap<u64, u64>,
}

impl LocalLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_stored(stored: Vec<StoredEntry>) -> Self {
        let mut library = Self::new();
        for entry in stored {
            let tracked = TrackedEntry::from(entry);
            library.known_media.insert(tracked.entry.media_id);
            library.entries.insert(tracked.entry.media_id, tracked);
        }
        library
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, media_id: u64) -> Option<&TrackedEntry> {
        self.entries.get(&media_id)
    }

    /// All entries ordered by media id.
    pub fn entries(&self) -> Vec<TrackedEntry> {
        let mut entries: Vec<TrackedEntry> = self.entries.values().cloned().collect();
        entries.sort_by_key(|t| t.entry.media_id);
        entries
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Record a media id seen in a catalog fetch.
    pub fn remember_media(&mut self, media_id: u64) {
        self.known_media.insert(media_id);
    }

    pub fn knows_media(&self, media_id: u64) -> bool {
        self.known_media.contains(&media_id) || self.entries.contains_key(&media_id)
    }

    /// Store an entry the service has confirmed.
    pub fn apply_confirmed(&mut self, entry: LibraryEntry) -> TrackedEntry {
        self.put(TrackedEntry {
            entry,
            needs_resync: false,
        })
    }

    /// Store intended values the service has not confirmed.
    pub fn apply_unconfirmed(&mut self, entry: LibraryEntry) -> TrackedEntry {
        self.put(TrackedEntry {
            entry,
            needs_resync: true,
        })
    }

    /// Put back an entry removed earlier, as it was.
    pub fn restore(&mut self, tracked: TrackedEntry) -> TrackedEntry {
        self.put(tracked)
    }

    pub fn remove(&mut self, media_id: u64) -> Option<TrackedEntry> {
        self.touch(media_id);
        self.entries.remove(&media_id)
    }

    pub fn pending_resync(&self) -> Vec<TrackedEntry> {
        self.entries()
            .into_iter()
            .filter(|t| t.needs_resync)
            .collect()
    }

    /// Merge a full remote listing into the local library.
    ///
    /// `in_flight` holds media ids with queued or running mutations; entries
    /// for those, and entries touched after generation `since`, keep their
    /// local state untouched. A pending or newer local entry wins over the
    /// remote one and is returned for re-push.
    pub fn reconcile(
        &mut self,
        remote: Vec<LibraryEntry>,
        in_flight: &HashSet<u64>,
        since: u64,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let busy = |library: &Self, media_id: u64| {
            in_flight.contains(&media_id)
                || library.touched.get(&media_id).is_some_and(|&gen| gen > since)
        };

        let mut remote_ids = HashSet::with_capacity(remote.len());
        for remote_entry in remote {
            let media_id = remote_entry.media_id;
            remote_ids.insert(media_id);
            self.known_media.insert(media_id);

            if busy(self, media_id) {
                report.kept_local += 1;
                continue;
            }

            let Some(local) = self.entries.get_mut(&media_id) else {
                let tracked = TrackedEntry {
                    entry: remote_entry,
                    needs_resync: false,
                };
                self.entries.insert(media_id, tracked.clone());
                report.added += 1;
                report.changed.push(tracked);
                continue;
            };

            let local_wins = !local.entry.same_values(&remote_entry)
                && (local.needs_resync || local.entry.last_updated > remote_entry.last_updated);

            if local_wins {
                report.kept_local += 1;
                if local.entry.library_id.is_none() && remote_entry.library_id.is_some() {
                    local.entry.library_id = remote_entry.library_id;
                    report.changed.push(local.clone());
                }
                report.repush.push(Repush {
                    entry: local.entry.clone(),
                    exists_remotely: true,
                });
            } else if *local
                != (TrackedEntry {
                    entry: remote_entry.clone(),
                    needs_resync: false,
                })
            {
                local.entry = remote_entry;
                local.needs_resync = false;
                report.replaced += 1;
                report.changed.push(local.clone());
            }
        }

        let local_only: Vec<u64> = self
            .entries
            .keys()
            .copied()
            .filter(|id| !remote_ids.contains(id))
            .collect();
        for media_id in local_only {
            if busy(self, media_id) {
                report.kept_local += 1;
                continue;
            }
            let pending = self.entries.get(&media_id).filter(|t| t.needs_resync);
            match pending {
                Some(tracked) => {
                    report.kept_local += 1;
                    report.repush.push(Repush {
                        entry: tracked.entry.clone(),
                        exists_remotely: false,
                    });
                }
                None => {
                    self.entries.remove(&media_id);
                    report.removed.push(media_id);
                }
            }
        }

        report.changed.sort_by_key(|t| t.entry.media_id);
        report.removed.sort_unstable();
        report.repush.sort_by_key(|r| r.entry.media_id);
        report
    }

    fn put(&mut self, tracked: TrackedEntry) -> TrackedEntry {
        let media_id = tracked.entry.media_id;
        self.touch(media_id);
        self.known_media.insert(media_id);
        self.entries.insert(media_id, tracked.clone());
        tracked
    }

    fn touch(&mut self, media_id: u64) {
        self.generation += 1;
        self.touched.insert(media_id, self.generation);
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use kizuna_core::models::WatchStatus;

    use super::*;

    fn entry_at(media_id: u64, episodes: u32, hour: u32) -> LibraryEntry {
        let mut entry = LibraryEntry::new(media_id, WatchStatus::Watching);
        entry.watched_episodes = episodes;
        entry.last_updated = Utc.with_ymd_and_hms(2024, 1, 15, hour, 0, 0).unwrap();
        entry
    }

    fn library_with(entries: &[(LibraryEntry, bool)]) -> LocalLibrary {
        let stored = entries
            .iter()
            .map(|(entry, needs_resync)| StoredEntry {
                entry: entry.clone(),
                needs_resync: *needs_resync,
            })
            .collect();
        LocalLibrary::from_stored(stored)
    }

    #[test]
    fn test_newer_local_entry_is_kept_and_repushed() {
        // local written at T2, remote at T1 < T2
        let mut library = library_with(&[(entry_at(1, 5, 12), false)]);
        let since = library.generation();
        let report = library.reconcile(vec![entry_at(1, 3, 10)], &HashSet::new(), since);

        assert_eq!(library.get(1).unwrap().entry.watched_episodes, 5);
        assert_eq!(report.kept_local, 1);
        assert_eq!(report.repush.len(), 1);
        assert!(report.repush[0].exists_remotely);
    }

    #[test]
    fn test_newer_remote_entry_replaces_local() {
        // remote at T3 > T2
        let mut library = library_with(&[(entry_at(1, 5, 12), false)]);
        let since = library.generation();
        let report = library.reconcile(vec![entry_at(1, 7, 14)], &HashSet::new(), since);

        assert_eq!(library.get(1).unwrap().entry.watched_episodes, 7);
        assert_eq!(report.replaced, 1);
        assert!(report.repush.is_empty());
        assert_eq!(report.changed.len(), 1);
    }

    #[test]
    fn test_pending_entry_wins_over_fresher_remote() {
        let mut library = library_with(&[(entry_at(1, 5, 12), true)]);
        let since = library.generation();
        let report = library.reconcile(vec![entry_at(1, 7, 14)], &HashSet::new(), since);

        let local = library.get(1).unwrap();
        assert_eq!(local.entry.watched_episodes, 5);
        assert!(local.needs_resync);
        assert_eq!(report.repush.len(), 1);
    }

    #[test]
    fn test_pending_entry_matching_remote_is_settled() {
        let mut library = library_with(&[(entry_at(1, 5, 12), true)]);
        let since = library.generation();
        let report = library.reconcile(vec![entry_at(1, 5, 9)], &HashSet::new(), since);

        assert!(!library.get(1).unwrap().needs_resync);
        assert!(report.repush.is_empty());
    }

    #[test]
    fn test_remote_only_entries_are_added() {
        let mut library = LocalLibrary::new();
        let report = library.reconcile(
            vec![entry_at(1, 1, 10), entry_at(2, 2, 10)],
            &HashSet::new(),
            0,
        );
        assert_eq!(report.added, 2);
        assert_eq!(library.len(), 2);
        assert!(library.knows_media(2));
    }

    #[test]
    fn test_local_only_entries() {
        let mut library = library_with(&[
            (entry_at(1, 1, 10), false),
            (entry_at(2, 2, 10), true),
            (entry_at(3, 3, 10), false),
        ]);
        let since = library.generation();
        let in_flight = HashSet::from([3]);
        let report = library.reconcile(vec![], &in_flight, since);

        // Confirmed and absent remotely: gone.
        assert!(library.get(1).is_none());
        assert_eq!(report.removed, vec![1]);
        // Pending: kept and pushed again as a new entry.
        assert!(library.get(2).is_some());
        assert_eq!(
            report.repush,
            vec![Repush {
                entry: entry_at(2, 2, 10),
                exists_remotely: false
            }]
        );
        // In flight: left alone.
        assert!(library.get(3).is_some());
    }

    #[test]
    fn test_entries_touched_during_fetch_are_left_alone() {
        let mut library = library_with(&[(entry_at(1, 1, 10), false)]);
        let since = library.generation();

        // A mutation lands while the listing is in transit.
        library.apply_confirmed(entry_at(1, 4, 9));
        library.remove(2);

        let report = library.reconcile(
            vec![entry_at(1, 1, 11), entry_at(2, 2, 11)],
            &HashSet::new(),
            since,
        );
        assert_eq!(library.get(1).unwrap().entry.watched_episodes, 4);
        assert!(library.get(2).is_none());
        assert_eq!(report.kept_local, 2);
    }

    #[test]
    fn test_kept_local_entry_adopts_remote_library_id() {
        let mut library = library_with(&[(entry_at(1, 5, 12), true)]);
        let mut remote = entry_at(1, 3, 10);
        remote.library_id = Some("900".into());
        let report = library.reconcile(vec![remote], &HashSet::new(), library.generation());

        assert_eq!(library.get(1).unwrap().entry.library_id.as_deref(), Some("900"));
        assert_eq!(report.repush[0].entry.library_id.as_deref(), Some("900"));
    }

    #[test]
    fn test_identical_remote_entry_is_not_reported() {
        let mut library = library_with(&[(entry_at(1, 5, 12), false)]);
        let report = library.reconcile(vec![entry_at(1, 5, 12)], &HashSet::new(), library.generation());
        assert!(report.changed.is_empty());
        assert_eq!(report.replaced, 0);
    }

    #[test]
    fn test_restore_and_pending() {
        let mut library = LocalLibrary::new();
        let tracked = library.apply_unconfirmed(entry_at(1, 1, 10));
        assert_eq!(library.pending_resync(), vec![tracked.clone()]);

        let removed = library.remove(1).unwrap();
        assert!(library.is_empty());
        library.restore(removed);
        assert_eq!(library.get(1), Some(&tracked));

        let mut later = tracked.entry.clone();
        later.last_updated += Duration::minutes(1);
        library.apply_confirmed(later);
        assert!(library.pending_resync().is_empty());
    }
}
