use super::*;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use resilience_core::{
    ActiveTab, CopingCatalog, MetricsConfig, Mood, MoodEntry, MoodEntryPatch, NewMoodEntry, Trend,
    User, ValidationError,
};
use crate::repository::{ENTRIES_KEY, FAVORITES_KEY, USER_KEY};
use std::collections::{BTreeSet, HashSet};
use std::io;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use uuid::Uuid;

// ============================================================================
// Fixtures
// ============================================================================

/// Keys whose reads or writes currently fail.
#[derive(Default)]
struct Faults {
    reads: Mutex<HashSet<&'static str>>,
    writes: Mutex<HashSet<&'static str>>,
}

impl Faults {
    fn fail_reads(&self, keys: &[&'static str]) {
        self.reads.lock().unwrap().extend(keys.iter().copied());
    }

    fn fail_writes(&self, keys: &[&'static str]) {
        self.writes.lock().unwrap().extend(keys.iter().copied());
    }

    fn heal(&self) {
        self.reads.lock().unwrap().clear();
        self.writes.lock().unwrap().clear();
    }

    fn check(set: &Mutex<HashSet<&'static str>>, key: &str) -> io::Result<()> {
        if set.lock().unwrap().contains(key) {
            return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
        }
        Ok(())
    }
}

/// Memory backend with per-key failure injection.
#[derive(Default)]
struct FlakyBackend {
    inner: MemoryBackend,
    faults: Arc<Faults>,
}

impl KvBackend for FlakyBackend {
    fn get(&self, key: &str) -> io::Result<Option<String>> {
        Faults::check(&self.faults.reads, key)?;
        self.inner.get(key)
    }

    fn put(&self, key: &str, value: &str) -> io::Result<()> {
        Faults::check(&self.faults.writes, key)?;
        self.inner.put(key, value)
    }

    fn remove(&self, key: &str) -> io::Result<()> {
        Faults::check(&self.faults.writes, key)?;
        self.inner.remove(key)
    }
}

const ALL_KEYS: [&str; 3] = [USER_KEY, ENTRIES_KEY, FAVORITES_KEY];

/// Durable view: active user, both users' journals, both users' favorites.
type Durable = (
    Option<User>,
    Vec<MoodEntry>,
    Vec<MoodEntry>,
    BTreeSet<String>,
    BTreeSet<String>,
);

/// State captured before a mutation that is expected to abort.
struct Checkpoint {
    snapshot: Arc<AppState>,
    durable: Durable,
    rx: watch::Receiver<Arc<AppState>>,
}

/// Store for u1 with one entry and one favorite, over a [`FlakyBackend`].
struct FlakyStore {
    store: ResilienceStore,
    repo: Arc<KvEntryRepository<FlakyBackend>>,
    faults: Arc<Faults>,
    seeded: MoodEntry,
}

impl FlakyStore {
    async fn new() -> Self {
        let backend = FlakyBackend::default();
        let faults = Arc::clone(&backend.faults);
        let repo = Arc::new(KvEntryRepository::new(backend));
        let store = ResilienceStore::open(
            repo.clone(),
            Arc::new(CopingCatalog::builtin()),
            MetricsConfig::default(),
        )
        .unwrap();
        store.set_user(User::new("u1")).await.unwrap();
        let seeded = store
            .add_entry(NewMoodEntry::new(Mood::Happy, 8).with_coping(["1"]))
            .await
            .unwrap();
        store.toggle_favorite("2").await.unwrap();
        Self {
            store,
            repo,
            faults,
            seeded,
        }
    }

    fn durable(&self) -> Durable {
        (
            self.repo.get_user().unwrap(),
            self.repo.list_mood_entries("u1").unwrap(),
            self.repo.list_mood_entries("u2").unwrap(),
            self.repo.get_favorites("u1").unwrap(),
            self.repo.get_favorites("u2").unwrap(),
        )
    }

    fn checkpoint(&self) -> Checkpoint {
        let mut rx = self.store.subscribe();
        rx.borrow_and_update();
        Checkpoint {
            snapshot: self.store.snapshot(),
            durable: self.durable(),
            rx,
        }
    }

    /// Memory, observers and disk all still match `checkpoint`.
    fn assert_unchanged(&self, checkpoint: &Checkpoint) {
        self.faults.heal();
        assert_eq!(self.store.snapshot(), checkpoint.snapshot);
        assert!(!checkpoint.rx.has_changed().unwrap());
        assert_eq!(self.durable(), checkpoint.durable);
    }
}

fn is_storage_error<T: std::fmt::Debug>(result: Result<T, StoreError>) -> bool {
    matches!(result, Err(StoreError::Storage(_)))
}

#[derive(Default)]
struct RecordingMirror {
    ops: Mutex<Vec<MirrorOp>>,
    remote: Mutex<Vec<MoodEntry>>,
}

#[async_trait]
impl RemoteMirror for RecordingMirror {
    fn name(&self) -> &str {
        "recording"
    }

    async fn apply(&self, op: &MirrorOp) -> Result<(), MirrorError> {
        self.ops.lock().unwrap().push(op.clone());
        Ok(())
    }

    async fn fetch_mood_entries(&self, user_id: &str) -> Result<Vec<MoodEntry>, MirrorError> {
        Ok(self
            .remote
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect())
    }
}

async fn store_with_user() -> ResilienceStore {
    let repo = Arc::new(MemoryRepository::in_memory());
    let store =
        ResilienceStore::open(repo, Arc::new(CopingCatalog::builtin()), MetricsConfig::default())
            .unwrap();
    store.set_user(User::new("u1")).await.unwrap();
    store
}

async fn mirrored_store() -> (ResilienceStore, MirrorHandle, Arc<RecordingMirror>) {
    let remote = Arc::new(RecordingMirror::default());
    let (handle, _join) = MirrorHandle::spawn(remote.clone(), RetryConfig::default());
    let repo = Arc::new(MemoryRepository::in_memory());
    let store =
        ResilienceStore::open(repo, Arc::new(CopingCatalog::builtin()), MetricsConfig::default())
            .unwrap()
            .with_mirror(handle.clone());
    store.set_user(User::new("u1")).await.unwrap();
    (store, handle, remote)
}

// ============================================================================
// Journal mutations
// ============================================================================

#[tokio::test]
async fn test_end_to_end_three_day_streak() {
    let store = store_with_user().await;
    let now = Utc::now();
    for (mood, intensity, days_ago) in [(Mood::Happy, 8, 0), (Mood::Sad, 3, 1), (Mood::Calm, 6, 2)] {
        store
            .add_entry(NewMoodEntry::new(mood, intensity).at(now - Duration::days(days_ago)))
            .await
            .unwrap();
    }

    let metrics = store.metrics();
    assert_eq!(metrics.streak_days, 3);
    assert_eq!(metrics.mood_stability, 58);
    assert_eq!(metrics.coping_usage, 0);
    assert_eq!(metrics.improvement_trend, Trend::Stable);
    assert_eq!(metrics.overall_score, 36);
}

#[tokio::test]
async fn test_mutations_require_user() {
    let repo = Arc::new(MemoryRepository::in_memory());
    let store =
        ResilienceStore::open(repo, Arc::new(CopingCatalog::builtin()), MetricsConfig::default())
            .unwrap();
    let err = store
        .add_entry(NewMoodEntry::new(Mood::Calm, 5))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Validation(ValidationError::NoActiveUser)));
}

#[tokio::test]
async fn test_invalid_intensity_changes_nothing() {
    let store = store_with_user().await;
    let before = store.snapshot();

    let err = store
        .add_entry(NewMoodEntry::new(Mood::Happy, 0))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::Validation(ValidationError::InvalidIntensity(0))
    ));
    assert_eq!(store.snapshot(), before);
}

#[tokio::test]
async fn test_update_entry_keeps_identity_and_recomputes() {
    let store = store_with_user().await;
    let entry = store
        .add_entry(NewMoodEntry::new(Mood::Anxious, 7).with_notes("exam"))
        .await
        .unwrap();
    assert_eq!(store.metrics().coping_usage, 0);

    let updated = store
        .update_entry(entry.id, MoodEntryPatch::coping(["1"]))
        .await
        .unwrap();
    assert_eq!(updated.id, entry.id);
    assert_eq!(updated.timestamp, entry.timestamp);
    assert_eq!(updated.notes, "exam");
    assert_eq!(store.metrics().coping_usage, 100);
    assert_eq!(store.entries(), vec![updated]);
}

#[tokio::test]
async fn test_unknown_ids_are_not_found() {
    let store = store_with_user().await;
    store
        .add_entry(NewMoodEntry::new(Mood::Calm, 5))
        .await
        .unwrap();
    let before = store.snapshot();
    let missing = Uuid::new_v4();

    assert!(matches!(
        store.delete_entry(missing).await,
        Err(StoreError::NotFound(id)) if id == missing
    ));
    assert!(matches!(
        store.update_entry(missing, MoodEntryPatch::notes("x")).await,
        Err(StoreError::NotFound(_))
    ));
    assert_eq!(store.snapshot(), before);
}

// ============================================================================
// Storage failures
// ============================================================================

#[tokio::test]
async fn test_failed_writes_leave_state_untouched() {
    let f = FlakyStore::new().await;
    let checkpoint = f.checkpoint();

    f.faults.fail_writes(&ALL_KEYS);
    let err = f
        .store
        .add_entry(NewMoodEntry::new(Mood::Sad, 2))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Storage(RepositoryError::Backend { .. })));
    assert!(is_storage_error(f.store.delete_entry(f.seeded.id).await));
    assert!(is_storage_error(f.store.toggle_favorite("1").await));
    f.assert_unchanged(&checkpoint);

    f.store
        .add_entry(NewMoodEntry::new(Mood::Sad, 2))
        .await
        .unwrap();
    assert_eq!(f.store.entries().len(), 2);
}

#[tokio::test]
async fn test_failed_update_rolls_back() {
    let f = FlakyStore::new().await;
    let checkpoint = f.checkpoint();

    f.faults.fail_writes(&[ENTRIES_KEY]);
    let result = f
        .store
        .update_entry(f.seeded.id, MoodEntryPatch::notes("rewritten"))
        .await;
    assert!(is_storage_error(result));
    f.assert_unchanged(&checkpoint);
    assert_eq!(f.store.entries()[0].notes, "");
}

#[tokio::test]
async fn test_failed_set_entries_rolls_back() {
    let f = FlakyStore::new().await;
    let checkpoint = f.checkpoint();
    let replacement =
        MoodEntry::create("u1", NewMoodEntry::new(Mood::Calm, 4), f.store.catalog()).unwrap();

    f.faults.fail_writes(&[ENTRIES_KEY]);
    assert!(is_storage_error(f.store.set_entries(vec![replacement]).await));
    f.assert_unchanged(&checkpoint);
}

#[tokio::test]
async fn test_failed_set_favorites_rolls_back() {
    let f = FlakyStore::new().await;
    let checkpoint = f.checkpoint();

    f.faults.fail_writes(&[FAVORITES_KEY]);
    let favorites = ["1".to_string(), "4".to_string()].into_iter().collect();
    assert!(is_storage_error(f.store.set_favorites(favorites).await));
    f.assert_unchanged(&checkpoint);
}

#[tokio::test]
async fn test_failed_user_switch_keeps_previous_user() {
    let f = FlakyStore::new().await;
    let checkpoint = f.checkpoint();

    // Loading the new user's journal fails before the user key is written.
    f.faults.fail_reads(&[ENTRIES_KEY]);
    assert!(is_storage_error(f.store.set_user(User::new("u2")).await));
    f.assert_unchanged(&checkpoint);

    f.faults.fail_writes(&[USER_KEY]);
    assert!(is_storage_error(f.store.set_user(User::new("u2")).await));
    f.assert_unchanged(&checkpoint);
    assert_eq!(f.durable().0.map(|u| u.id).as_deref(), Some("u1"));
}

#[tokio::test]
async fn test_failed_reset_keeps_journal_and_favorites() {
    let f = FlakyStore::new().await;
    let checkpoint = f.checkpoint();

    // Entries are written first; the favorites write then fails.
    f.faults.fail_writes(&[FAVORITES_KEY]);
    assert!(is_storage_error(f.store.reset_user_data().await));
    f.assert_unchanged(&checkpoint);
    assert_eq!(f.durable().1, vec![f.seeded.clone()]);
}

#[tokio::test]
async fn test_failed_clear_keeps_user() {
    let f = FlakyStore::new().await;
    let checkpoint = f.checkpoint();

    // The user key goes first; removing the journal then fails.
    f.faults.fail_writes(&[ENTRIES_KEY]);
    assert!(is_storage_error(f.store.clear_all_data().await));
    f.assert_unchanged(&checkpoint);
    assert!(f.durable().0.is_some());
}

#[tokio::test]
async fn test_failed_reconcile_rolls_back() {
    let f = FlakyStore::new().await;
    let checkpoint = f.checkpoint();
    let remote = MoodEntry::create(
        "u1",
        NewMoodEntry::new(Mood::Excited, 9).at(Utc::now() - Duration::hours(2)),
        f.store.catalog(),
    )
    .unwrap();

    f.faults.fail_writes(&[ENTRIES_KEY]);
    assert!(is_storage_error(f.store.reconcile_remote(vec![remote]).await));
    f.assert_unchanged(&checkpoint);
    assert!(f.store.snapshot().last_sync.is_none());
}

#[tokio::test]
async fn test_set_entries_validates_whole_batch() {
    let store = store_with_user().await;
    let catalog = CopingCatalog::builtin();
    let mine = MoodEntry::create("u1", NewMoodEntry::new(Mood::Calm, 4), &catalog).unwrap();
    let theirs = MoodEntry::create("u2", NewMoodEntry::new(Mood::Calm, 4), &catalog).unwrap();

    let err = store
        .set_entries(vec![mine.clone(), theirs])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::Validation(ValidationError::ForeignEntry { .. })
    ));

    let err = store
        .set_entries(vec![mine.clone(), mine.clone()])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::Validation(ValidationError::DuplicateEntry(id)) if id == mine.id
    ));
    assert!(store.entries().is_empty());

    store.set_entries(vec![mine.clone()]).await.unwrap();
    assert_eq!(store.entries(), vec![mine]);
}

// ============================================================================
// Favorites
// ============================================================================

#[tokio::test]
async fn test_toggle_favorite_roundtrip() {
    let store = store_with_user().await;
    store.toggle_favorite("3").await.unwrap();
    let before = store.snapshot().favorites.clone();

    assert!(store.toggle_favorite("5").await.unwrap());
    assert!(!store.toggle_favorite("5").await.unwrap());
    assert_eq!(store.snapshot().favorites, before);
}

#[tokio::test]
async fn test_unknown_favorite_rejected() {
    let store = store_with_user().await;
    let err = store.toggle_favorite("999").await.unwrap_err();
    assert!(matches!(
        err,
        StoreError::Validation(ValidationError::UnknownCopingMechanism(_))
    ));
    let err = store
        .set_favorites(["1".to_string(), "999".to_string()].into_iter().collect())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Validation(_)));
    assert!(store.snapshot().favorites.is_empty());
}

#[tokio::test]
async fn test_premium_techniques_need_unlock() {
    let store = store_with_user().await;
    let locked = |r: Result<_, StoreError>| {
        matches!(r, Err(StoreError::Validation(ValidationError::PremiumLocked(id))) if id == "6")
    };

    assert!(locked(store.toggle_favorite("6").await.map(|_| ())));
    assert!(locked(
        store
            .add_entry(NewMoodEntry::new(Mood::Frustrated, 4).with_coping(["1", "6"]))
            .await
            .map(|_| ())
    ));
    let entry = store
        .add_entry(NewMoodEntry::new(Mood::Frustrated, 4))
        .await
        .unwrap();
    assert!(locked(
        store
            .update_entry(entry.id, MoodEntryPatch::coping(["6"]))
            .await
            .map(|_| ())
    ));
    assert!(locked(
        store
            .set_favorites(["6".to_string()].into_iter().collect())
            .await
    ));
    assert!(store.snapshot().favorites.is_empty());

    let store = store.with_premium(true);
    assert!(store.toggle_favorite("6").await.unwrap());
    store
        .update_entry(entry.id, MoodEntryPatch::coping(["6"]))
        .await
        .unwrap();

    // Choices made while unlocked stay usable after locking again.
    let store = store.with_premium(false);
    store
        .update_entry(entry.id, MoodEntryPatch::notes("still fine"))
        .await
        .unwrap();
    assert!(!store.toggle_favorite("6").await.unwrap());
}

#[tokio::test]
async fn test_favorite_mechanisms_in_catalog_order() {
    let store = store_with_user().await;
    store
        .set_favorites(["4".to_string(), "1".to_string()].into_iter().collect())
        .await
        .unwrap();
    let ids: Vec<String> = store
        .favorite_mechanisms()
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(ids, vec!["1".to_string(), "4".to_string()]);
}

// ============================================================================
// Queries and UI state
// ============================================================================

#[tokio::test]
async fn test_entry_queries_are_newest_first() {
    let store = store_with_user().await;
    let now = Utc::now();
    for days_ago in [3, 0, 10] {
        store
            .add_entry(NewMoodEntry::new(Mood::Content, 5).at(now - Duration::days(days_ago)))
            .await
            .unwrap();
    }

    let all = store.entries();
    assert!(all.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));
    assert_eq!(store.recent_entries(7).len(), 2);
    let between = store.entries_between(now - Duration::days(10), now - Duration::days(3));
    assert_eq!(between.len(), 2);
}

#[tokio::test]
async fn test_metrics_follow_the_clock() {
    let store = store_with_user().await;
    let now = Utc::now();
    for days_ago in 0..3 {
        store
            .add_entry(NewMoodEntry::new(Mood::Calm, 5).at(now - Duration::days(days_ago)))
            .await
            .unwrap();
    }
    assert_eq!(store.metrics().streak_days, 3);

    // Two days on with nothing logged: the streak is broken even though
    // the last published snapshot still carries 3.
    let later = store.metrics_at(now + Duration::days(2));
    assert_eq!(later.streak_days, 0);
    assert_eq!(store.snapshot().metrics.streak_days, 3);
}

#[tokio::test]
async fn test_ui_state_publishes_snapshots() {
    let store = store_with_user().await;
    let mut rx = store.subscribe();
    rx.borrow_and_update();

    store.set_active_tab(ActiveTab::Dashboard).await;
    assert!(rx.has_changed().unwrap());
    assert_eq!(rx.borrow_and_update().active_tab, ActiveTab::Dashboard);

    store.set_online(false).await;
    store.mark_synced().await;
    let snapshot = store.snapshot();
    assert!(!snapshot.is_online);
    assert!(snapshot.last_sync.is_some());
}

#[tokio::test]
async fn test_reset_and_clear() {
    let store = store_with_user().await;
    store
        .add_entry(NewMoodEntry::new(Mood::Grateful, 9))
        .await
        .unwrap();
    store.toggle_favorite("2").await.unwrap();

    store.reset_user_data().await.unwrap();
    let snapshot = store.snapshot();
    assert!(snapshot.user.is_some());
    assert!(snapshot.entries.is_empty());
    assert!(snapshot.favorites.is_empty());
    assert_eq!(snapshot.metrics, Default::default());

    store.clear_all_data().await.unwrap();
    assert!(store.snapshot().user.is_none());
}

#[tokio::test]
async fn test_switching_user_loads_their_journal() {
    let store = store_with_user().await;
    store
        .add_entry(NewMoodEntry::new(Mood::Happy, 6))
        .await
        .unwrap();

    store.set_user(User::new("u2")).await.unwrap();
    assert!(store.entries().is_empty());

    store.set_user(User::new("u1")).await.unwrap();
    assert_eq!(store.entries().len(), 1);
}

// ============================================================================
// Mirror wiring
// ============================================================================

#[tokio::test]
async fn test_mutations_enqueue_mirror_ops() {
    let (store, handle, remote) = mirrored_store().await;
    let entry = store
        .add_entry(NewMoodEntry::new(Mood::Calm, 5))
        .await
        .unwrap();
    store.toggle_favorite("1").await.unwrap();
    store.delete_entry(entry.id).await.unwrap();
    handle.idle().await;

    let kinds: Vec<&str> = remote.ops.lock().unwrap().iter().map(|op| op.kind()).collect();
    assert_eq!(
        kinds,
        vec!["upsert_user", "insert_entry", "add_favorite", "delete_entry"]
    );
}

#[tokio::test]
async fn test_pull_from_mirror_reconciles() {
    let (store, handle, remote) = mirrored_store().await;
    let local = store
        .add_entry(NewMoodEntry::new(Mood::Calm, 5))
        .await
        .unwrap();

    let catalog = CopingCatalog::builtin();
    let from_phone = MoodEntry::create(
        "u1",
        NewMoodEntry::new(Mood::Excited, 9).at(Utc::now() - Duration::hours(1)),
        &catalog,
    )
    .unwrap();
    remote.remote.lock().unwrap().push(from_phone.clone());
    handle.idle().await;

    let report = store.pull_from_mirror().await.unwrap();
    assert_eq!(report.pulled, 1);
    assert_eq!(report.pushed, 1);
    assert_eq!(report.total, 2);

    let ids: Vec<Uuid> = store.entries().iter().map(|e| e.id).collect();
    assert!(ids.contains(&local.id));
    assert!(ids.contains(&from_phone.id));
    assert!(store.snapshot().last_sync.is_some());
}

#[tokio::test]
async fn test_pull_without_mirror_is_disabled() {
    let store = store_with_user().await;
    assert!(matches!(
        store.pull_from_mirror().await,
        Err(StoreError::MirrorDisabled)
    ));
}
