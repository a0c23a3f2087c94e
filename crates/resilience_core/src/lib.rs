//! # Resilience Core
//!
//! Data model and pure logic for the mood journal:
//!
//! - **journal**: users, mood entries, amendments and their validation
//! - **catalog**: the read-only coping technique reference list
//! - **metrics**: resilience metrics derived from a journal (no I/O)
//! - **config**: TOML configuration with environment overrides
//!
//! Nothing in this crate touches durable storage; see `resilience_store`.

pub mod catalog;
pub mod config;
pub mod error;
pub mod journal;
pub mod metrics;

pub use catalog::{CopingCatalog, CopingMechanism, CopingType, Difficulty, COMMON_TRIGGERS};
pub use config::{FeatureFlags, MetricsConfig, MirrorConfig, ResilienceConfig, StorageConfig};
pub use error::ValidationError;
pub use journal::{ActiveTab, Intensity, Mood, MoodEntry, MoodEntryPatch, NewMoodEntry, User};
pub use metrics::{compute, compute_at, ResilienceMetrics, Trend};
