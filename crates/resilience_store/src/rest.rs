//! PostgREST-backed [`RemoteMirror`] (the hosted `users`, `mood_entries`
//! and `user_favorites` tables).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use resilience_core::{Intensity, MirrorConfig, Mood, MoodEntry, User};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use uuid::Uuid;

use crate::error::MirrorError;
use crate::mirror::{MirrorOp, RemoteMirror};

const USERS: &str = "users";
const MOOD_ENTRIES: &str = "mood_entries";
const FAVORITES: &str = "user_favorites";

pub struct RestMirror {
    client: Client,
    base_url: String,
    api_key: String,
}

impl RestMirror {
    pub fn new(config: &MirrorConfig) -> Result<Self, MirrorError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn request(&self, method: Method, table: &str) -> RequestBuilder {
        let url = format!("{}/rest/v1/{}", self.base_url, table);
        self.client
            .request(method, url)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    /// Insert or merge on primary key, so a replayed insert is harmless.
    fn upsert(&self, table: &str) -> RequestBuilder {
        self.request(Method::POST, table)
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, MirrorError> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let body: String = body.chars().take(200).collect();
        if is_retryable_status(status) {
            Err(MirrorError::Unavailable(format!("{status}: {body}")))
        } else {
            Err(MirrorError::Rejected {
                status: status.as_u16(),
                body,
            })
        }
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn eq(value: impl std::fmt::Display) -> String {
    format!("eq.{value}")
}

#[async_trait]
impl RemoteMirror for RestMirror {
    fn name(&self) -> &str {
        "postgrest"
    }

    async fn apply(&self, op: &MirrorOp) -> Result<(), MirrorError> {
        match op {
            MirrorOp::UpsertUser(user) => {
                self.send(self.upsert(USERS).json(&UserRow::from(user)))
                    .await?;
            }
            MirrorOp::InsertEntry(entry) => {
                self.send(self.upsert(MOOD_ENTRIES).json(&MoodEntryRow::from(entry)))
                    .await?;
            }
            MirrorOp::UpdateEntry(entry) => {
                let body = EntryAmendment {
                    notes: &entry.notes,
                    coping_mechanisms_used: &entry.coping_mechanisms_used,
                    updated_at: entry.updated_at,
                };
                self.send(
                    self.request(Method::PATCH, MOOD_ENTRIES)
                        .query(&[("id", eq(entry.id))])
                        .json(&body),
                )
                .await?;
            }
            MirrorOp::DeleteEntry { id } => {
                self.send(
                    self.request(Method::DELETE, MOOD_ENTRIES)
                        .query(&[("id", eq(id))]),
                )
                .await?;
            }
            MirrorOp::AddFavorite {
                user_id,
                mechanism_id,
            } => {
                let row = FavoriteRow {
                    user_id,
                    coping_mechanism_id: mechanism_id,
                };
                self.send(
                    self.upsert(FAVORITES)
                        .query(&[("on_conflict", "user_id,coping_mechanism_id")])
                        .json(&row),
                )
                .await?;
            }
            MirrorOp::RemoveFavorite {
                user_id,
                mechanism_id,
            } => {
                self.send(self.request(Method::DELETE, FAVORITES).query(&[
                    ("user_id", eq(user_id)),
                    ("coping_mechanism_id", eq(mechanism_id)),
                ]))
                .await?;
            }
            MirrorOp::ReplaceEntries { user_id, entries } => {
                self.send(
                    self.request(Method::DELETE, MOOD_ENTRIES)
                        .query(&[("user_id", eq(user_id))]),
                )
                .await?;
                if !entries.is_empty() {
                    let rows: Vec<MoodEntryRow> = entries.iter().map(MoodEntryRow::from).collect();
                    self.send(self.upsert(MOOD_ENTRIES).json(&rows)).await?;
                }
            }
        }
        Ok(())
    }

    async fn fetch_mood_entries(&self, user_id: &str) -> Result<Vec<MoodEntry>, MirrorError> {
        let response = self
            .send(self.request(Method::GET, MOOD_ENTRIES).query(&[
                ("select", "*".to_string()),
                ("user_id", eq(user_id)),
                ("order", "created_at.asc".to_string()),
            ]))
            .await?;
        let body = response.text().await?;
        let rows: Vec<MoodEntryRow> =
            serde_json::from_str(&body).map_err(|e| MirrorError::Decode(e.to_string()))?;
        tracing::debug!("Fetched {} remote entries for {}", rows.len(), user_id);
        Ok(rows.into_iter().map(MoodEntry::from).collect())
    }
}

// ============================================================================
// Wire rows
// ============================================================================

#[derive(Debug, Serialize)]
struct UserRow<'a> {
    id: &'a str,
    farcaster_id: Option<&'a str>,
    wallet_address: Option<&'a str>,
    username: Option<&'a str>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'a> From<&'a User> for UserRow<'a> {
    fn from(user: &'a User) -> Self {
        Self {
            id: &user.id,
            farcaster_id: user.farcaster_id.as_deref(),
            wallet_address: user.wallet_address.as_deref(),
            username: user.username.as_deref(),
            created_at: user.created_at,
            updated_at: user.updated_at,
        }
    }
}

/// `created_at` carries the entry timestamp.
#[derive(Debug, Serialize, Deserialize)]
struct MoodEntryRow {
    id: Uuid,
    user_id: String,
    mood: Mood,
    intensity: Intensity,
    #[serde(default)]
    triggers: Option<Vec<String>>,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    coping_mechanisms_used: Option<Vec<String>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<&MoodEntry> for MoodEntryRow {
    fn from(entry: &MoodEntry) -> Self {
        Self {
            id: entry.id,
            user_id: entry.user_id.clone(),
            mood: entry.mood,
            intensity: entry.intensity,
            triggers: Some(entry.triggers.iter().cloned().collect()),
            notes: Some(entry.notes.clone()),
            coping_mechanisms_used: Some(entry.coping_mechanisms_used.iter().cloned().collect()),
            created_at: entry.timestamp,
            updated_at: entry.updated_at,
        }
    }
}

impl From<MoodEntryRow> for MoodEntry {
    fn from(row: MoodEntryRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            timestamp: row.created_at,
            mood: row.mood,
            intensity: row.intensity,
            triggers: row.triggers.unwrap_or_default().into_iter().collect(),
            notes: row.notes.unwrap_or_default(),
            coping_mechanisms_used: row
                .coping_mechanisms_used
                .unwrap_or_default()
                .into_iter()
                .collect(),
            updated_at: row.updated_at.max(row.created_at),
        }
    }
}

#[derive(Debug, Serialize)]
struct EntryAmendment<'a> {
    notes: &'a str,
    coping_mechanisms_used: &'a BTreeSet<String>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct FavoriteRow<'a> {
    user_id: &'a str,
    coping_mechanism_id: &'a str,
}
