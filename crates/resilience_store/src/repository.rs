//! Entry Repository - the only component that touches durable storage.
//!
//! Everything is stored as JSON under three fixed logical keys:
//! `user`, `mood_entries` and `favorites`. Each write reads the current
//! value, modifies a copy, serializes it and only then hands it to the
//! backend, so an encoding or backend failure leaves the previous value
//! in place.

use chrono::Utc;
use resilience_core::{MoodEntry, MoodEntryPatch, User};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::backend::{FileBackend, KvBackend, MemoryBackend};
use crate::error::RepositoryError;

pub const USER_KEY: &str = "user";
pub const ENTRIES_KEY: &str = "mood_entries";
pub const FAVORITES_KEY: &str = "favorites";

type Result<T> = std::result::Result<T, RepositoryError>;

/// Durable journal storage. Calls complete synchronously and are safe to
/// retry: a failed write never leaves a partial value visible.
pub trait EntryRepository: Send + Sync {
    fn get_user(&self) -> Result<Option<User>>;
    fn put_user(&self, user: &User) -> Result<()>;

    /// Entries of one user, in insertion order.
    fn list_mood_entries(&self, user_id: &str) -> Result<Vec<MoodEntry>>;
    fn append_mood_entry(&self, entry: &MoodEntry) -> Result<()>;
    /// Apply `patch` and return the stored result.
    fn update_mood_entry(&self, id: Uuid, patch: &MoodEntryPatch) -> Result<MoodEntry>;
    fn delete_mood_entry(&self, id: Uuid) -> Result<()>;
    /// Replace every entry owned by `user_id` with `entries`.
    fn replace_mood_entries(&self, user_id: &str, entries: &[MoodEntry]) -> Result<()>;

    fn get_favorites(&self, user_id: &str) -> Result<BTreeSet<String>>;
    /// Flip membership of `mechanism_id`. Returns whether it is now a favorite.
    fn toggle_favorite(&self, user_id: &str, mechanism_id: &str) -> Result<bool>;
    fn set_favorites(&self, user_id: &str, favorites: &BTreeSet<String>) -> Result<()>;

    /// Drop one user's entries and favorites together. Either both keys
    /// change or neither does.
    fn reset_user(&self, user_id: &str) -> Result<()>;

    /// Drop everything. Either every key is removed or none is.
    fn clear(&self) -> Result<()>;
}

/// [`EntryRepository`] over any [`KvBackend`].
pub struct KvEntryRepository<B> {
    backend: B,
    /// Serializes read-modify-write cycles.
    write_lock: Mutex<()>,
}

pub type FileRepository = KvEntryRepository<FileBackend>;
pub type MemoryRepository = KvEntryRepository<MemoryBackend>;

impl<B: KvBackend> KvEntryRepository<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            write_lock: Mutex::new(()),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn read<T: DeserializeOwned>(&self, key: &'static str) -> Result<Option<T>> {
        let raw = self
            .backend
            .get(key)
            .map_err(|source| RepositoryError::Backend { key, source })?;
        match raw {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|source| RepositoryError::Decode { key, source }),
        }
    }

    fn write<T: Serialize>(&self, key: &'static str, value: &T) -> Result<()> {
        let json = Self::encode(key, value)?;
        self.put_raw(key, Some(&json))
    }

    fn raw(&self, key: &'static str) -> Result<Option<String>> {
        self.backend
            .get(key)
            .map_err(|source| RepositoryError::Backend { key, source })
    }

    fn put_raw(&self, key: &'static str, value: Option<&str>) -> Result<()> {
        let result = match value {
            Some(value) => self.backend.put(key, value),
            None => self.backend.remove(key),
        };
        result.map_err(|source| RepositoryError::Backend { key, source })
    }

    /// Apply several key changes (`None` removes the key) as one unit. The
    /// previous raw values are captured first; if any change fails, the keys
    /// already changed are put back before the error is returned.
    /// Caller must hold `write_lock`.
    fn write_all(&self, changes: &[(&'static str, Option<String>)]) -> Result<()> {
        let mut previous = Vec::with_capacity(changes.len());
        for (key, _) in changes {
            previous.push((*key, self.raw(*key)?));
        }

        for (done, (key, value)) in changes.iter().enumerate() {
            if let Err(err) = self.put_raw(*key, value.as_deref()) {
                for (key, old) in previous[..done].iter().rev() {
                    if let Err(restore) = self.put_raw(*key, old.as_deref()) {
                        tracing::error!("Failed to restore {} after aborted write: {}", key, restore);
                    }
                }
                return Err(err);
            }
        }
        Ok(())
    }

    fn encode<T: Serialize>(key: &'static str, value: &T) -> Result<String> {
        serde_json::to_string(value).map_err(|source| RepositoryError::Encode { key, source })
    }

    fn all_entries(&self) -> Result<Vec<MoodEntry>> {
        Ok(self.read(ENTRIES_KEY)?.unwrap_or_default())
    }

    fn all_favorites(&self) -> Result<BTreeMap<String, BTreeSet<String>>> {
        Ok(self.read(FAVORITES_KEY)?.unwrap_or_default())
    }
}

impl KvEntryRepository<FileBackend> {
    pub fn open_dir<P: AsRef<Path>>(dir: P) -> std::io::Result<Self> {
        let backend = FileBackend::open(dir.as_ref())?;
        tracing::info!("Opened journal store at {}", dir.as_ref().display());
        Ok(Self::new(backend))
    }
}

impl KvEntryRepository<MemoryBackend> {
    pub fn in_memory() -> Self {
        Self::new(MemoryBackend::new())
    }
}

impl<B: KvBackend> EntryRepository for KvEntryRepository<B> {
    fn get_user(&self) -> Result<Option<User>> {
        self.read(USER_KEY)
    }

    fn put_user(&self, user: &User) -> Result<()> {
        let _guard = self.lock();
        self.write(USER_KEY, user)
    }

    fn list_mood_entries(&self, user_id: &str) -> Result<Vec<MoodEntry>> {
        Ok(self
            .all_entries()?
            .into_iter()
            .filter(|e| e.user_id == user_id)
            .collect())
    }

    fn append_mood_entry(&self, entry: &MoodEntry) -> Result<()> {
        let _guard = self.lock();
        let mut entries = self.all_entries()?;
        entries.push(entry.clone());
        self.write(ENTRIES_KEY, &entries)
    }

    fn update_mood_entry(&self, id: Uuid, patch: &MoodEntryPatch) -> Result<MoodEntry> {
        let _guard = self.lock();
        let mut entries = self.all_entries()?;
        let entry = entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(RepositoryError::NotFound(id))?;
        entry.apply_patch(patch, Utc::now());
        let updated = entry.clone();
        self.write(ENTRIES_KEY, &entries)?;
        Ok(updated)
    }

    fn delete_mood_entry(&self, id: Uuid) -> Result<()> {
        let _guard = self.lock();
        let mut entries = self.all_entries()?;
        let before = entries.len();
        entries.retain(|e| e.id != id);
        if entries.len() == before {
            return Err(RepositoryError::NotFound(id));
        }
        self.write(ENTRIES_KEY, &entries)
    }

    fn replace_mood_entries(&self, user_id: &str, replacement: &[MoodEntry]) -> Result<()> {
        let _guard = self.lock();
        let mut entries = self.all_entries()?;
        entries.retain(|e| e.user_id != user_id);
        entries.extend(replacement.iter().cloned());
        self.write(ENTRIES_KEY, &entries)
    }

    fn get_favorites(&self, user_id: &str) -> Result<BTreeSet<String>> {
        Ok(self.all_favorites()?.remove(user_id).unwrap_or_default())
    }

    fn toggle_favorite(&self, user_id: &str, mechanism_id: &str) -> Result<bool> {
        let _guard = self.lock();
        let mut all = self.all_favorites()?;
        let set = all.entry(user_id.to_string()).or_default();
        let now_favorite = if set.remove(mechanism_id) {
            false
        } else {
            set.insert(mechanism_id.to_string());
            true
        };
        self.write(FAVORITES_KEY, &all)?;
        Ok(now_favorite)
    }

    fn set_favorites(&self, user_id: &str, favorites: &BTreeSet<String>) -> Result<()> {
        let _guard = self.lock();
        let mut all = self.all_favorites()?;
        all.insert(user_id.to_string(), favorites.clone());
        self.write(FAVORITES_KEY, &all)
    }

    fn reset_user(&self, user_id: &str) -> Result<()> {
        let _guard = self.lock();
        let mut entries = self.all_entries()?;
        entries.retain(|e| e.user_id != user_id);
        let mut favorites = self.all_favorites()?;
        favorites.remove(user_id);

        self.write_all(&[
            (ENTRIES_KEY, Some(Self::encode(ENTRIES_KEY, &entries)?)),
            (FAVORITES_KEY, Some(Self::encode(FAVORITES_KEY, &favorites)?)),
        ])
    }

    fn clear(&self) -> Result<()> {
        let _guard = self.lock();
        self.write_all(&[(USER_KEY, None), (ENTRIES_KEY, None), (FAVORITES_KEY, None)])
    }
}
