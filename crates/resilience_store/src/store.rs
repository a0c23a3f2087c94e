//! Application State Store - the single owner of in-memory journal state.
//!
//! Lock ordering (to prevent deadlocks):
//!   mutation_lock → state
//!
//! Every journal mutation runs the same pipeline while holding
//! `mutation_lock`: validate, write the repository, apply to memory,
//! recompute metrics, publish a snapshot, enqueue mirror ops. A repository
//! failure aborts before memory is touched.

use chrono::{DateTime, Duration, Utc};
use resilience_core::metrics::{self, ResilienceMetrics};
use resilience_core::{
    ActiveTab, CopingCatalog, CopingMechanism, MetricsConfig, MoodEntry, MoodEntryPatch,
    NewMoodEntry, User, ValidationError,
};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Mutex, RwLock};
use uuid::Uuid;

use crate::error::StoreError;
use crate::mirror::{MirrorHandle, MirrorOp, MirrorStatus};
use crate::reconcile::merge_last_write_wins;
use crate::repository::EntryRepository;

type Result<T> = std::result::Result<T, StoreError>;

/// Everything observers can see. Published as an immutable `Arc` after
/// every mutation, so a snapshot is never torn. `metrics` is as of that
/// mutation; [`ResilienceStore::metrics`] recomputes against the clock.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppState {
    pub user: Option<User>,
    /// Active user's entries, in storage order.
    pub entries: Vec<MoodEntry>,
    pub favorites: BTreeSet<String>,
    pub active_tab: ActiveTab,
    pub is_online: bool,
    pub last_sync: Option<DateTime<Utc>>,
    pub metrics: ResilienceMetrics,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            user: None,
            entries: Vec::new(),
            favorites: BTreeSet::new(),
            active_tab: ActiveTab::default(),
            is_online: true,
            last_sync: None,
            metrics: ResilienceMetrics::default(),
        }
    }
}

/// Result of a reconcile pass against the remote journal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Entries taken from the remote (new or newer there).
    pub pulled: usize,
    /// Entries queued for upload because the remote lacks them or is stale.
    pub pushed: usize,
    /// Journal size after the merge.
    pub total: usize,
}

// ============================================================================
// Mutation tracing
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MutationPhase {
    Idle,
    Applying,
    Recomputing,
    Published,
}

/// Logs phase transitions of one mutation. Dropping it returns to `Idle`,
/// which is how an aborted mutation shows up in the trace.
struct MutationTrace {
    name: &'static str,
    phase: MutationPhase,
    started: Instant,
}

impl MutationTrace {
    fn begin(name: &'static str) -> Self {
        tracing::debug!(mutation = name, "Idle -> Applying");
        Self {
            name,
            phase: MutationPhase::Applying,
            started: Instant::now(),
        }
    }

    fn advance(&mut self, next: MutationPhase) {
        tracing::debug!(mutation = self.name, "{:?} -> {:?}", self.phase, next);
        self.phase = next;
    }
}

impl Drop for MutationTrace {
    fn drop(&mut self) {
        let elapsed_us = self.started.elapsed().as_micros() as u64;
        if self.phase == MutationPhase::Published {
            tracing::debug!(mutation = self.name, elapsed_us, "Published -> Idle");
        } else {
            tracing::debug!(
                mutation = self.name,
                elapsed_us,
                "{:?} -> {:?} (aborted)",
                self.phase,
                MutationPhase::Idle
            );
        }
    }
}

// ============================================================================
// Store
// ============================================================================

pub struct ResilienceStore {
    repo: Arc<dyn EntryRepository>,
    catalog: Arc<CopingCatalog>,
    metrics_config: MetricsConfig,
    /// Whether premium techniques may be newly picked.
    premium_unlocked: bool,
    state: RwLock<AppState>,
    snapshot_tx: watch::Sender<Arc<AppState>>,
    /// Serializes mutations; waiters are served in FIFO order.
    mutation_lock: Mutex<()>,
    mirror: Option<MirrorHandle>,
}

impl ResilienceStore {
    /// Load the persisted user, journal and favorites and compute the
    /// initial metrics.
    pub fn open(
        repo: Arc<dyn EntryRepository>,
        catalog: Arc<CopingCatalog>,
        metrics_config: MetricsConfig,
    ) -> Result<Self> {
        let mut state = AppState {
            user: repo.get_user()?,
            ..AppState::default()
        };
        if let Some(user) = &state.user {
            state.entries = repo.list_mood_entries(&user.id)?;
            state.favorites = repo.get_favorites(&user.id)?;
            tracing::info!(
                "Loaded {} mood entries and {} favorites for {}",
                state.entries.len(),
                state.favorites.len(),
                user.id
            );
        } else {
            tracing::info!("No persisted user, starting empty");
        }
        state.metrics = metrics::compute(&state.entries, &metrics_config);

        let (snapshot_tx, _) = watch::channel(Arc::new(state.clone()));
        Ok(Self {
            repo,
            catalog,
            metrics_config,
            premium_unlocked: false,
            state: RwLock::new(state),
            snapshot_tx,
            mutation_lock: Mutex::new(()),
            mirror: None,
        })
    }

    /// Replicate subsequent mutations through `handle`.
    pub fn with_mirror(mut self, handle: MirrorHandle) -> Self {
        handle.set_online(self.snapshot_tx.borrow().is_online);
        self.mirror = Some(handle);
        self
    }

    /// Unlock premium techniques for favorites and new coping usage.
    pub fn with_premium(mut self, unlocked: bool) -> Self {
        self.premium_unlocked = unlocked;
        self
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn snapshot(&self) -> Arc<AppState> {
        self.snapshot_tx.borrow().clone()
    }

    /// Receives a new snapshot after every successful mutation.
    pub fn subscribe(&self) -> watch::Receiver<Arc<AppState>> {
        self.snapshot_tx.subscribe()
    }

    /// Metrics as of now. Streak and trend depend on the current day, so
    /// this does not reuse the value cached in the snapshot.
    pub fn metrics(&self) -> ResilienceMetrics {
        self.metrics_at(Utc::now())
    }

    pub fn metrics_at(&self, now: DateTime<Utc>) -> ResilienceMetrics {
        metrics::compute_at(&self.snapshot().entries, now, &self.metrics_config)
    }

    pub fn catalog(&self) -> &CopingCatalog {
        &self.catalog
    }

    pub fn mirror_status(&self) -> Option<MirrorStatus> {
        self.mirror.as_ref().map(MirrorHandle::status)
    }

    /// Newest first.
    pub fn entries(&self) -> Vec<MoodEntry> {
        let mut entries = self.snapshot().entries.clone();
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        entries
    }

    /// Entries from the last `days` days, newest first.
    pub fn recent_entries(&self, days: u32) -> Vec<MoodEntry> {
        let cutoff = Utc::now() - Duration::days(i64::from(days));
        self.entries()
            .into_iter()
            .filter(|e| e.timestamp >= cutoff)
            .collect()
    }

    /// Entries with `start <= timestamp <= end`, newest first.
    pub fn entries_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<MoodEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.timestamp >= start && e.timestamp <= end)
            .collect()
    }

    /// Favorited techniques in catalog order.
    pub fn favorite_mechanisms(&self) -> Vec<CopingMechanism> {
        let snapshot = self.snapshot();
        self.catalog
            .iter()
            .filter(|m| snapshot.favorites.contains(&m.id))
            .cloned()
            .collect()
    }

    // ========================================================================
    // Journal mutations
    // ========================================================================

    /// Make `user` the active user. Switching to a different id loads that
    /// user's journal and favorites.
    pub async fn set_user(&self, user: User) -> Result<()> {
        let _guard = self.mutation_lock.lock().await;
        let mut trace = MutationTrace::begin("set_user");

        let switching = self.state.read().await.user.as_ref().map(|u| &u.id) != Some(&user.id);
        // Reads first: once the user key is written nothing else can fail.
        let loaded = if switching {
            Some((
                self.repo.list_mood_entries(&user.id)?,
                self.repo.get_favorites(&user.id)?,
            ))
        } else {
            None
        };
        self.repo.put_user(&user)?;

        let op = MirrorOp::UpsertUser(user.clone());
        self.commit(&mut trace, move |state| {
            state.user = Some(user);
            if let Some((entries, favorites)) = loaded {
                state.entries = entries;
                state.favorites = favorites;
            }
        })
        .await;
        self.enqueue(op);
        Ok(())
    }

    pub async fn add_entry(&self, draft: NewMoodEntry) -> Result<MoodEntry> {
        let _guard = self.mutation_lock.lock().await;
        let mut trace = MutationTrace::begin("add_entry");

        let user_id = self.active_user_id().await?;
        let entry = MoodEntry::create(&user_id, draft, &self.catalog)?;
        self.ensure_unlocked(&entry.coping_mechanisms_used, &BTreeSet::new())?;
        self.repo.append_mood_entry(&entry)?;

        let stored = entry.clone();
        self.commit(&mut trace, move |state| state.entries.push(stored))
            .await;
        tracing::info!("Logged {} ({}) for {}", entry.mood, entry.intensity.get(), user_id);
        self.enqueue(MirrorOp::InsertEntry(entry.clone()));
        Ok(entry)
    }

    /// Amend notes and/or coping usage of an existing entry.
    pub async fn update_entry(&self, id: Uuid, patch: MoodEntryPatch) -> Result<MoodEntry> {
        let _guard = self.mutation_lock.lock().await;
        let mut trace = MutationTrace::begin("update_entry");

        self.active_user_id().await?;
        patch.validate(&self.catalog)?;
        let recorded = self
            .state
            .read()
            .await
            .entries
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.coping_mechanisms_used.clone())
            .ok_or(StoreError::NotFound(id))?;
        if let Some(coping) = &patch.coping_mechanisms_used {
            self.ensure_unlocked(coping, &recorded)?;
        }
        let updated = self.repo.update_mood_entry(id, &patch)?;

        let stored = updated.clone();
        self.commit(&mut trace, move |state| {
            if let Some(slot) = state.entries.iter_mut().find(|e| e.id == id) {
                *slot = stored;
            }
        })
        .await;
        self.enqueue(MirrorOp::UpdateEntry(updated.clone()));
        Ok(updated)
    }

    pub async fn delete_entry(&self, id: Uuid) -> Result<()> {
        let _guard = self.mutation_lock.lock().await;
        let mut trace = MutationTrace::begin("delete_entry");

        self.active_user_id().await?;
        self.ensure_known(id).await?;
        self.repo.delete_mood_entry(id)?;

        self.commit(&mut trace, move |state| state.entries.retain(|e| e.id != id))
            .await;
        self.enqueue(MirrorOp::DeleteEntry { id });
        Ok(())
    }

    /// Replace the whole journal of the active user.
    pub async fn set_entries(&self, entries: Vec<MoodEntry>) -> Result<()> {
        let _guard = self.mutation_lock.lock().await;
        let mut trace = MutationTrace::begin("set_entries");

        let user_id = self.active_user_id().await?;
        self.validate_journal(&user_id, &entries)?;
        self.repo.replace_mood_entries(&user_id, &entries)?;

        let stored = entries.clone();
        self.commit(&mut trace, move |state| state.entries = stored)
            .await;
        self.enqueue(MirrorOp::ReplaceEntries { user_id, entries });
        Ok(())
    }

    /// Flip a technique in or out of the favorites. Returns whether it is
    /// now a favorite.
    pub async fn toggle_favorite(&self, mechanism_id: &str) -> Result<bool> {
        let _guard = self.mutation_lock.lock().await;
        let mut trace = MutationTrace::begin("toggle_favorite");

        let user_id = self.active_user_id().await?;
        if !self.catalog.contains(mechanism_id) {
            return Err(ValidationError::UnknownCopingMechanism(mechanism_id.to_string()).into());
        }
        let current = self.state.read().await.favorites.clone();
        self.ensure_unlocked([mechanism_id.to_string()].iter(), &current)?;
        let now_favorite = self.repo.toggle_favorite(&user_id, mechanism_id)?;

        let id = mechanism_id.to_string();
        self.commit(&mut trace, move |state| {
            if now_favorite {
                state.favorites.insert(id);
            } else {
                state.favorites.remove(&id);
            }
        })
        .await;

        let mechanism_id = mechanism_id.to_string();
        self.enqueue(if now_favorite {
            MirrorOp::AddFavorite { user_id, mechanism_id }
        } else {
            MirrorOp::RemoveFavorite { user_id, mechanism_id }
        });
        Ok(now_favorite)
    }

    pub async fn set_favorites(&self, favorites: BTreeSet<String>) -> Result<()> {
        let _guard = self.mutation_lock.lock().await;
        let mut trace = MutationTrace::begin("set_favorites");

        let user_id = self.active_user_id().await?;
        if let Some(unknown) = favorites.iter().find(|id| !self.catalog.contains(id)) {
            return Err(ValidationError::UnknownCopingMechanism(unknown.clone()).into());
        }
        let previous = self.state.read().await.favorites.clone();
        self.ensure_unlocked(&favorites, &previous)?;
        self.repo.set_favorites(&user_id, &favorites)?;

        let stored = favorites.clone();
        self.commit(&mut trace, move |state| state.favorites = stored)
            .await;

        for mechanism_id in favorites.difference(&previous) {
            self.enqueue(MirrorOp::AddFavorite {
                user_id: user_id.clone(),
                mechanism_id: mechanism_id.clone(),
            });
        }
        for mechanism_id in previous.difference(&favorites) {
            self.enqueue(MirrorOp::RemoveFavorite {
                user_id: user_id.clone(),
                mechanism_id: mechanism_id.clone(),
            });
        }
        Ok(())
    }

    /// Merge a remote copy of the active user's journal (last write wins)
    /// and queue local-only or locally newer entries for upload.
    pub async fn reconcile_remote(&self, remote: Vec<MoodEntry>) -> Result<ReconcileReport> {
        let _guard = self.mutation_lock.lock().await;
        let mut trace = MutationTrace::begin("reconcile_remote");

        let user_id = self.active_user_id().await?;
        let remote: Vec<MoodEntry> = remote
            .into_iter()
            .filter(|e| {
                if e.user_id != user_id {
                    tracing::warn!("Ignoring remote entry {} owned by {}", e.id, e.user_id);
                    return false;
                }
                if let Some(unknown) = e
                    .coping_mechanisms_used
                    .iter()
                    .find(|id| !self.catalog.contains(id))
                {
                    tracing::warn!("Ignoring remote entry {} using unknown technique {}", e.id, unknown);
                    return false;
                }
                true
            })
            .collect();

        let local = self.state.read().await.entries.clone();
        let outcome = merge_last_write_wins(&local, remote);
        if outcome.changed() {
            self.repo.replace_mood_entries(&user_id, &outcome.merged)?;
        }

        let to_push: HashSet<Uuid> = outcome
            .local_only
            .iter()
            .chain(outcome.local_newer.iter())
            .copied()
            .collect();
        let push_ops: Vec<MirrorOp> = outcome
            .merged
            .iter()
            .filter(|e| to_push.contains(&e.id))
            .cloned()
            .map(MirrorOp::InsertEntry)
            .collect();

        let report = ReconcileReport {
            pulled: outcome.pulled,
            pushed: push_ops.len(),
            total: outcome.merged.len(),
        };
        let merged = outcome.merged;
        let changed = report.pulled > 0;
        self.commit(&mut trace, move |state| {
            if changed {
                state.entries = merged;
            }
            state.last_sync = Some(Utc::now());
        })
        .await;

        for op in push_ops {
            self.enqueue(op);
        }
        tracing::info!(
            "Reconciled journal: pulled {}, pushed {}, total {}",
            report.pulled,
            report.pushed,
            report.total
        );
        Ok(report)
    }

    /// Fetch the remote journal through the mirror and reconcile it.
    pub async fn pull_from_mirror(&self) -> Result<ReconcileReport> {
        let mirror = self.mirror.as_ref().ok_or(StoreError::MirrorDisabled)?;
        let user_id = self.active_user_id().await?;
        // Fetch outside the mutation lock so local writes are not held up.
        let remote = mirror.fetch_mood_entries(&user_id).await?;
        self.reconcile_remote(remote).await
    }

    /// Drop the active user's journal and favorites, keeping the user.
    pub async fn reset_user_data(&self) -> Result<()> {
        let _guard = self.mutation_lock.lock().await;
        let mut trace = MutationTrace::begin("reset_user_data");

        let user_id = self.active_user_id().await?;
        self.repo.reset_user(&user_id)?;

        let previous = self.state.read().await.favorites.clone();
        self.commit(&mut trace, |state| {
            state.entries.clear();
            state.favorites.clear();
        })
        .await;

        self.enqueue(MirrorOp::ReplaceEntries {
            user_id: user_id.clone(),
            entries: Vec::new(),
        });
        for mechanism_id in previous {
            self.enqueue(MirrorOp::RemoveFavorite {
                user_id: user_id.clone(),
                mechanism_id,
            });
        }
        tracing::info!("Reset journal data for {}", user_id);
        Ok(())
    }

    /// Forget everything stored locally, including the user. The remote
    /// copy is left alone.
    pub async fn clear_all_data(&self) -> Result<()> {
        let _guard = self.mutation_lock.lock().await;
        let mut trace = MutationTrace::begin("clear_all_data");

        self.repo.clear()?;
        self.commit(&mut trace, |state| {
            *state = AppState {
                is_online: state.is_online,
                ..AppState::default()
            };
        })
        .await;
        tracing::info!("Cleared all local data");
        Ok(())
    }

    // ========================================================================
    // UI state
    // ========================================================================

    pub async fn set_active_tab(&self, tab: ActiveTab) {
        let _guard = self.mutation_lock.lock().await;
        let mut trace = MutationTrace::begin("set_active_tab");
        self.commit(&mut trace, move |state| state.active_tab = tab)
            .await;
    }

    /// Record connectivity. Offline pauses the mirror worker; local
    /// mutations are unaffected.
    pub async fn set_online(&self, online: bool) {
        let _guard = self.mutation_lock.lock().await;
        let mut trace = MutationTrace::begin("set_online");
        self.commit(&mut trace, move |state| state.is_online = online)
            .await;
        if let Some(mirror) = &self.mirror {
            mirror.set_online(online);
        }
    }

    pub async fn mark_synced(&self) {
        let _guard = self.mutation_lock.lock().await;
        let mut trace = MutationTrace::begin("mark_synced");
        self.commit(&mut trace, |state| state.last_sync = Some(Utc::now()))
            .await;
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn active_user_id(&self) -> Result<String> {
        self.state
            .read()
            .await
            .user
            .as_ref()
            .map(|u| u.id.clone())
            .ok_or_else(|| ValidationError::NoActiveUser.into())
    }

    async fn ensure_known(&self, id: Uuid) -> Result<()> {
        if self.state.read().await.entries.iter().any(|e| e.id == id) {
            Ok(())
        } else {
            Err(StoreError::NotFound(id))
        }
    }

    /// Premium techniques can only be newly picked once unlocked. Ids in
    /// `recorded` were accepted earlier and stay usable.
    fn ensure_unlocked<'a, I>(&self, picked: I, recorded: &BTreeSet<String>) -> Result<()>
    where
        I: IntoIterator<Item = &'a String>,
    {
        if self.premium_unlocked {
            return Ok(());
        }
        let locked = picked.into_iter().find(|id| {
            !recorded.contains(*id) && self.catalog.get(id).map_or(false, |m| m.is_premium)
        });
        match locked {
            Some(id) => Err(ValidationError::PremiumLocked(id.clone()).into()),
            None => Ok(()),
        }
    }

    fn validate_journal(&self, user_id: &str, entries: &[MoodEntry]) -> Result<()> {
        let mut seen = HashSet::with_capacity(entries.len());
        for entry in entries {
            if entry.user_id != user_id {
                return Err(ValidationError::ForeignEntry {
                    id: entry.id,
                    owner: entry.user_id.clone(),
                }
                .into());
            }
            if !seen.insert(entry.id) {
                return Err(ValidationError::DuplicateEntry(entry.id).into());
            }
            if let Some(unknown) = entry
                .coping_mechanisms_used
                .iter()
                .find(|id| !self.catalog.contains(id))
            {
                return Err(ValidationError::UnknownCopingMechanism(unknown.clone()).into());
            }
        }
        Ok(())
    }

    /// Apply a change to memory, recompute metrics and publish.
    async fn commit<F>(&self, trace: &mut MutationTrace, apply: F)
    where
        F: FnOnce(&mut AppState),
    {
        let snapshot = {
            let mut state = self.state.write().await;
            apply(&mut state);
            trace.advance(MutationPhase::Recomputing);
            state.metrics = metrics::compute(&state.entries, &self.metrics_config);
            Arc::new(state.clone())
        };
        self.snapshot_tx.send_replace(snapshot);
        trace.advance(MutationPhase::Published);
    }

    fn enqueue(&self, op: MirrorOp) {
        if let Some(mirror) = &self.mirror {
            mirror.enqueue(op);
        }
    }
}
