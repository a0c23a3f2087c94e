//! Remote mirror queue.
//!
//! Local mutations enqueue a [`MirrorOp`] and return immediately. A single
//! background worker drains the queue in order, retrying transient failures
//! with exponential backoff, and parks while the app is offline. Nothing the
//! worker does ever flows back into local state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use resilience_core::{MirrorConfig, MoodEntry, User};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::MirrorError;

/// One local change to replay against the remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MirrorOp {
    UpsertUser(User),
    InsertEntry(MoodEntry),
    UpdateEntry(MoodEntry),
    DeleteEntry { id: Uuid },
    AddFavorite { user_id: String, mechanism_id: String },
    RemoveFavorite { user_id: String, mechanism_id: String },
    /// Bulk replacement of one user's journal.
    ReplaceEntries { user_id: String, entries: Vec<MoodEntry> },
}

impl MirrorOp {
    pub fn kind(&self) -> &'static str {
        match self {
            MirrorOp::UpsertUser(_) => "upsert_user",
            MirrorOp::InsertEntry(_) => "insert_entry",
            MirrorOp::UpdateEntry(_) => "update_entry",
            MirrorOp::DeleteEntry { .. } => "delete_entry",
            MirrorOp::AddFavorite { .. } => "add_favorite",
            MirrorOp::RemoveFavorite { .. } => "remove_favorite",
            MirrorOp::ReplaceEntries { .. } => "replace_entries",
        }
    }
}

/// A remote copy of the journal. Implementations must make `apply`
/// idempotent, since an op may be retried after a lost response.
#[async_trait]
pub trait RemoteMirror: Send + Sync {
    fn name(&self) -> &str;

    async fn apply(&self, op: &MirrorOp) -> Result<(), MirrorError>;

    async fn fetch_mood_entries(&self, user_id: &str) -> Result<Vec<MoodEntry>, MirrorError>;
}

// ============================================================================
// Retry
// ============================================================================

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

impl From<&MirrorConfig> for RetryConfig {
    fn from(cfg: &MirrorConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            initial_delay: Duration::from_millis(cfg.initial_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms.max(cfg.initial_delay_ms)),
            ..Self::default()
        }
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// `max_attempts` is exhausted. Returns the last error in the latter cases.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    label: &str,
    mut operation: F,
) -> Result<T, MirrorError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, MirrorError>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut delay = config.initial_delay;
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!("{} succeeded on attempt {}", label, attempt);
                }
                return Ok(value);
            }
            Err(MirrorError::Offline) => {
                tracing::debug!("{} paused on attempt {}: offline", label, attempt);
                return Err(MirrorError::Offline);
            }
            Err(e) if !e.is_retryable() => {
                tracing::warn!("{} failed permanently: {}", label, e);
                return Err(e);
            }
            Err(e) if attempt >= max_attempts => {
                tracing::warn!("{} gave up after {} attempts: {}", label, attempt, e);
                return Err(e);
            }
            Err(e) => {
                let sleep_time = delay + jitter(delay);
                tracing::warn!(
                    "{} failed on attempt {}/{}: {}; retrying in {:.1}s",
                    label,
                    attempt,
                    max_attempts,
                    e,
                    sleep_time.as_secs_f64()
                );
                tokio::time::sleep(sleep_time).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_factor)
                        .min(config.max_delay.as_secs_f64()),
                );
                attempt += 1;
            }
        }
    }
}

/// Up to half the current delay, capped at 500ms.
fn jitter(delay: Duration) -> Duration {
    let cap = (delay.as_millis() / 2).min(500) as u64;
    if cap == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=cap))
}

// ============================================================================
// Worker
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MirrorStatus {
    pub online: bool,
    /// Ops enqueued but not yet finished (applied or given up on).
    pub pending: usize,
    pub applied_ops: u64,
    pub failed_ops: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Cheap handle to the mirror worker. Enqueueing never blocks.
#[derive(Clone)]
pub struct MirrorHandle {
    tx: mpsc::UnboundedSender<MirrorOp>,
    online: Arc<watch::Sender<bool>>,
    status: Arc<watch::Sender<MirrorStatus>>,
    mirror: Arc<dyn RemoteMirror>,
    retry: RetryConfig,
}

impl MirrorHandle {
    /// Start the worker on the current tokio runtime. The worker exits once
    /// every handle is dropped and the queue is drained.
    pub fn spawn(mirror: Arc<dyn RemoteMirror>, retry: RetryConfig) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (online_tx, online_rx) = watch::channel(true);
        let (status_tx, _) = watch::channel(MirrorStatus {
            online: true,
            ..MirrorStatus::default()
        });
        let status = Arc::new(status_tx);

        let worker = MirrorWorker {
            rx,
            online: online_rx,
            status: Arc::clone(&status),
            mirror: Arc::clone(&mirror),
            retry: retry.clone(),
        };
        let join = tokio::spawn(worker.run());

        let handle = Self {
            tx,
            online: Arc::new(online_tx),
            status,
            mirror,
            retry,
        };
        (handle, join)
    }

    pub fn enqueue(&self, op: MirrorOp) {
        let kind = op.kind();
        self.status.send_modify(|s| s.pending += 1);
        if self.tx.send(op).is_err() {
            self.status
                .send_modify(|s| s.pending = s.pending.saturating_sub(1));
            tracing::warn!("Mirror worker stopped; dropping {} op", kind);
        } else {
            tracing::debug!("Queued {} for {}", kind, self.mirror.name());
        }
    }

    /// While offline the worker holds queued ops instead of sending them.
    pub fn set_online(&self, online: bool) {
        self.online.send_replace(online);
        self.status.send_modify(|s| s.online = online);
    }

    pub fn status(&self) -> MirrorStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<MirrorStatus> {
        self.status.subscribe()
    }

    /// Resolves once every queued op has been applied or given up on.
    pub async fn idle(&self) {
        let mut rx = self.status.subscribe();
        // The sender lives in `self`, so this cannot close while we wait.
        let _ = rx.wait_for(|s| s.pending == 0).await;
    }

    pub fn mirror(&self) -> &Arc<dyn RemoteMirror> {
        &self.mirror
    }

    /// Pull one user's remote journal, retrying like queued ops.
    pub async fn fetch_mood_entries(&self, user_id: &str) -> Result<Vec<MoodEntry>, MirrorError> {
        let mirror = &self.mirror;
        with_retry(&self.retry, mirror.name(), || mirror.fetch_mood_entries(user_id)).await
    }
}

struct MirrorWorker {
    rx: mpsc::UnboundedReceiver<MirrorOp>,
    online: watch::Receiver<bool>,
    status: Arc<watch::Sender<MirrorStatus>>,
    mirror: Arc<dyn RemoteMirror>,
    retry: RetryConfig,
}

impl MirrorWorker {
    async fn run(mut self) {
        tracing::info!("Mirror worker started for {}", self.mirror.name());
        while let Some(op) = self.rx.recv().await {
            let label = format!("{} {}", self.mirror.name(), op.kind());
            let Some(result) = self.deliver(&op, &label).await else {
                break;
            };

            self.status.send_modify(|s| {
                s.pending = s.pending.saturating_sub(1);
                match &result {
                    Ok(()) => {
                        s.applied_ops += 1;
                        s.last_success = Some(Utc::now());
                    }
                    Err(e) => {
                        s.failed_ops += 1;
                        s.last_error = Some(e.to_string());
                    }
                }
            });
            if let Err(e) = result {
                tracing::error!("Dropping {} after failure: {}", label, e);
            }
        }
        tracing::info!("Mirror worker for {} stopped", self.mirror.name());
    }

    /// Send one op, parking whenever the app is offline. Going offline
    /// mid-retry parks the op and starts a fresh attempt budget once back
    /// online, so an op is only given up on while connected. Returns `None`
    /// if every handle went away while parked.
    async fn deliver(&mut self, op: &MirrorOp, label: &str) -> Option<Result<(), MirrorError>> {
        loop {
            if !self.wait_online().await {
                return None;
            }

            let online = &self.online;
            let mirror = &self.mirror;
            let result = with_retry(&self.retry, label, || async move {
                if !*online.borrow() {
                    return Err(MirrorError::Offline);
                }
                mirror.apply(op).await
            })
            .await;

            match result {
                Err(MirrorError::Offline) => {
                    tracing::info!("{} parked until back online", label);
                }
                Err(e) if e.is_retryable() && !*self.online.borrow() => {
                    tracing::info!("{} parked until back online after: {}", label, e);
                }
                other => return Some(other),
            }
        }
    }

    /// Returns false if every handle went away while offline.
    async fn wait_online(&mut self) -> bool {
        self.online.wait_for(|online| *online).await.is_ok()
    }
}
