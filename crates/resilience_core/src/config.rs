use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

// ============================================================================
// Top-level config
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub metrics: MetricsConfig,
    pub storage: StorageConfig,
    pub features: FeatureFlags,
    pub mirror: Option<MirrorConfig>,
}

impl ResilienceConfig {
    /// Load config from a TOML file, falling back to defaults for missing fields.
    /// After loading, env var overrides are applied.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let mut config: ResilienceConfig =
            toml::from_str(&content).with_context(|| "Failed to parse TOML config")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Try to load from path; if file doesn't exist, return defaults with env overrides.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::info!("Config file not found or invalid ({}), using defaults", e);
                let mut cfg = Self::default();
                cfg.apply_env_overrides();
                cfg
            }
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("RESILIENCE_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("RESILIENCE_TREND_WINDOW") {
            if let Ok(n) = v.parse() {
                self.metrics.trend_window_size = n;
            }
        }
        if let Ok(v) = std::env::var("RESILIENCE_TREND_THRESHOLD") {
            if let Ok(n) = v.parse() {
                self.metrics.trend_threshold = n;
            }
        }
        if let Ok(url) = std::env::var("RESILIENCE_MIRROR_URL") {
            let api_key = std::env::var("RESILIENCE_MIRROR_KEY").unwrap_or_default();
            let mirror = self.mirror.get_or_insert_with(|| MirrorConfig {
                base_url: url.clone(),
                api_key: api_key.clone(),
                ..MirrorConfig::default()
            });
            mirror.base_url = url;
            if !api_key.is_empty() {
                mirror.api_key = api_key;
            }
        }
    }
}

// ============================================================================
// Sub-configs
// ============================================================================

/// Scoring policy constants. None of these are physical law; they are
/// heuristics exposed so they can be tuned without a rebuild.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Entries per trend window (recent vs. the window right before it).
    pub trend_window_size: usize,
    /// Minimum absolute mean-intensity difference for a non-stable trend (exclusive).
    pub trend_threshold: f64,
    /// Stability = 100 - factor * variance.
    pub stability_variance_factor: f64,
    /// Length of one streak bucket. Default: one UTC calendar day.
    pub streak_coverage_unit_secs: u64,
    /// Overall score bonus per streak unit.
    pub streak_bonus_per_unit: f64,
    /// Upper bound of the streak bonus.
    pub streak_bonus_cap: f64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            trend_window_size: 7,
            trend_threshold: 0.5,
            stability_variance_factor: 10.0,
            streak_coverage_unit_secs: 86_400,
            streak_bonus_per_unit: 5.0,
            streak_bonus_cap: 50.0,
        }
    }
}

impl MetricsConfig {
    pub fn streak_coverage_unit(&self) -> chrono::Duration {
        let secs = i64::try_from(self.streak_coverage_unit_secs.max(1)).unwrap_or(i64::MAX);
        chrono::Duration::try_seconds(secs).unwrap_or_else(|| chrono::Duration::days(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding one JSON file per logical key.
    pub data_dir: PathBuf,
    /// Optional JSON catalog replacing the built-in techniques.
    pub catalog_path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("resilience_data"),
            catalog_path: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    pub enable_premium_features: bool,
}

/// Remote mirror endpoint and retry policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    pub base_url: String,
    pub api_key: String,
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            max_attempts: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            request_timeout_secs: 15,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
