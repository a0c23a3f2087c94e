//! Journal data model: users, mood entries and amendments.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::catalog::CopingCatalog;
use crate::error::ValidationError;

// ============================================================================
// User
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Identity issued by the auth provider. Never changes.
    pub id: String,
    #[serde(default)]
    pub wallet_address: Option<String>,
    #[serde(default)]
    pub farcaster_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            wallet_address: None,
            farcaster_id: None,
            username: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Username if linked, otherwise a shortened wallet address.
    pub fn display_name(&self) -> Option<String> {
        if let Some(name) = &self.username {
            return Some(name.clone());
        }
        self.wallet_address
            .as_ref()
            .map(|addr| addr.chars().take(8).collect())
    }
}

// ============================================================================
// Mood
// ============================================================================

/// Closed set of affect labels a user can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mood {
    Happy,
    Sad,
    Anxious,
    Angry,
    Excited,
    Calm,
    Frustrated,
    Grateful,
    Overwhelmed,
    Content,
}

impl Mood {
    pub const ALL: [Mood; 10] = [
        Mood::Happy,
        Mood::Sad,
        Mood::Anxious,
        Mood::Angry,
        Mood::Excited,
        Mood::Calm,
        Mood::Frustrated,
        Mood::Grateful,
        Mood::Overwhelmed,
        Mood::Content,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Mood::Happy => "happy",
            Mood::Sad => "sad",
            Mood::Anxious => "anxious",
            Mood::Angry => "angry",
            Mood::Excited => "excited",
            Mood::Calm => "calm",
            Mood::Frustrated => "frustrated",
            Mood::Grateful => "grateful",
            Mood::Overwhelmed => "overwhelmed",
            Mood::Content => "content",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Mood::Happy => "Happy",
            Mood::Sad => "Sad",
            Mood::Anxious => "Anxious",
            Mood::Angry => "Angry",
            Mood::Excited => "Excited",
            Mood::Calm => "Calm",
            Mood::Frustrated => "Frustrated",
            Mood::Grateful => "Grateful",
            Mood::Overwhelmed => "Overwhelmed",
            Mood::Content => "Content",
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            Mood::Happy => "😊",
            Mood::Sad => "😢",
            Mood::Anxious => "😰",
            Mood::Angry => "😠",
            Mood::Excited => "🤩",
            Mood::Calm => "😌",
            Mood::Frustrated => "😤",
            Mood::Grateful => "🙏",
            Mood::Overwhelmed => "😵",
            Mood::Content => "🙂",
        }
    }
}

impl fmt::Display for Mood {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mood {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        Mood::ALL
            .into_iter()
            .find(|m| m.as_str() == needle)
            .ok_or_else(|| ValidationError::UnknownMood(s.to_string()))
    }
}

// ============================================================================
// Intensity
// ============================================================================

/// Self-reported intensity, 1 to 10 inclusive.
///
/// Deserialization goes through the same check as [`Intensity::new`], so an
/// out-of-range value can never be loaded from storage either.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Intensity(u8);

impl Intensity {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 10;

    pub fn new(value: u8) -> Result<Self, ValidationError> {
        if (Self::MIN..=Self::MAX).contains(&value) {
            Ok(Self(value))
        } else {
            Err(ValidationError::InvalidIntensity(value))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Intensity {
    type Error = ValidationError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Intensity> for u8 {
    fn from(value: Intensity) -> Self {
        value.0
    }
}

// ============================================================================
// Mood entries
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoodEntry {
    pub id: Uuid,
    pub user_id: String,
    /// Creation instant. The canonical ordering key, not storage position.
    pub timestamp: DateTime<Utc>,
    pub mood: Mood,
    pub intensity: Intensity,
    #[serde(default)]
    pub triggers: BTreeSet<String>,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub coping_mechanisms_used: BTreeSet<String>,
    /// Last amendment; drives last-write-wins against the remote mirror.
    pub updated_at: DateTime<Utc>,
}

impl MoodEntry {
    /// Validate a draft and mint a new entry with a fresh id.
    pub fn create(
        user_id: &str,
        draft: NewMoodEntry,
        catalog: &CopingCatalog,
    ) -> Result<Self, ValidationError> {
        let intensity = Intensity::new(draft.intensity)?;
        let coping = validate_coping_ids(draft.coping_mechanisms_used, catalog)?;
        let timestamp = draft.timestamp.unwrap_or_else(Utc::now);

        Ok(Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            timestamp,
            mood: draft.mood,
            intensity,
            triggers: normalize_labels(draft.triggers),
            notes: draft.notes,
            coping_mechanisms_used: coping,
            updated_at: timestamp,
        })
    }

    /// Apply an already-validated amendment.
    pub fn apply_patch(&mut self, patch: &MoodEntryPatch, now: DateTime<Utc>) {
        if let Some(notes) = &patch.notes {
            self.notes = notes.clone();
        }
        if let Some(coping) = &patch.coping_mechanisms_used {
            self.coping_mechanisms_used = coping.clone();
        }
        // Never move backwards, even if the wall clock does.
        self.updated_at = now.max(self.updated_at);
    }

    pub fn used_coping(&self) -> bool {
        !self.coping_mechanisms_used.is_empty()
    }
}

/// Input of the journal submission flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMoodEntry {
    pub mood: Mood,
    /// Raw value; checked by [`MoodEntry::create`].
    pub intensity: u8,
    pub triggers: Vec<String>,
    pub notes: String,
    pub coping_mechanisms_used: Vec<String>,
    /// Defaults to now. Set explicitly for imports and tests.
    pub timestamp: Option<DateTime<Utc>>,
}

impl NewMoodEntry {
    pub fn new(mood: Mood, intensity: u8) -> Self {
        Self {
            mood,
            intensity,
            triggers: Vec::new(),
            notes: String::new(),
            coping_mechanisms_used: Vec::new(),
            timestamp: None,
        }
    }

    pub fn with_triggers<I, S>(mut self, triggers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.triggers = triggers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }

    pub fn with_coping<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.coping_mechanisms_used = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Partial update. Only notes and coping usage can be amended.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoodEntryPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coping_mechanisms_used: Option<BTreeSet<String>>,
}

impl MoodEntryPatch {
    pub fn notes(notes: impl Into<String>) -> Self {
        Self {
            notes: Some(notes.into()),
            ..Self::default()
        }
    }

    pub fn coping<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            coping_mechanisms_used: Some(ids.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_none() && self.coping_mechanisms_used.is_none()
    }

    pub fn validate(&self, catalog: &CopingCatalog) -> Result<(), ValidationError> {
        if let Some(ids) = &self.coping_mechanisms_used {
            for id in ids {
                if !catalog.contains(id) {
                    return Err(ValidationError::UnknownCopingMechanism(id.clone()));
                }
            }
        }
        Ok(())
    }
}

fn validate_coping_ids(
    ids: Vec<String>,
    catalog: &CopingCatalog,
) -> Result<BTreeSet<String>, ValidationError> {
    let mut out = BTreeSet::new();
    for id in ids {
        let id = id.trim().to_string();
        if !catalog.contains(&id) {
            return Err(ValidationError::UnknownCopingMechanism(id));
        }
        out.insert(id);
    }
    Ok(out)
}

fn normalize_labels(labels: Vec<String>) -> BTreeSet<String> {
    labels
        .into_iter()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect()
}

// ============================================================================
// UI selection
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActiveTab {
    #[default]
    Journal,
    Coping,
    Dashboard,
}
