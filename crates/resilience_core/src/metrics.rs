//! Resilience Metrics Engine
//!
//! Pure projection of a journal into five indicators:
//!
//! - **mood_stability**: `100 - factor * variance(intensity)`, clamped to 0..=100
//! - **coping_usage**: percentage of entries that recorded at least one technique
//! - **streak_days**: consecutive coverage units (UTC days) ending at today
//! - **improvement_trend**: mean intensity of the latest window vs. the one before
//! - **overall_score**: `(stability + usage + min(streak * bonus, cap)) / 2`, clamped
//!
//! Metrics are never patched incrementally. Every change to the journal
//! recomputes them from the full collection, so the result depends on the
//! entries alone and never on their storage order.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::config::MetricsConfig;
use crate::journal::MoodEntry;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Up,
    Down,
    #[default]
    Stable,
}

impl Trend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trend::Up => "up",
            Trend::Down => "down",
            Trend::Stable => "stable",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResilienceMetrics {
    pub overall_score: u8,
    pub mood_stability: u8,
    pub coping_usage: u8,
    pub streak_days: u32,
    pub improvement_trend: Trend,
}

/// Compute metrics against the current wall clock.
pub fn compute(entries: &[MoodEntry], config: &MetricsConfig) -> ResilienceMetrics {
    compute_at(entries, Utc::now(), config)
}

/// Compute metrics as of `now`. Input order does not matter.
pub fn compute_at(
    entries: &[MoodEntry],
    now: DateTime<Utc>,
    config: &MetricsConfig,
) -> ResilienceMetrics {
    if entries.is_empty() {
        return ResilienceMetrics::default();
    }

    // Id breaks timestamp ties so the trend windows never depend on input order.
    let mut ordered: Vec<&MoodEntry> = entries.iter().collect();
    ordered.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));

    let intensities: Vec<f64> = ordered
        .iter()
        .map(|e| f64::from(e.intensity.get()))
        .collect();

    let stability = stability_score(&intensities, config.stability_variance_factor);
    let usage = coping_usage_percent(&ordered);
    let streak = streak_units(
        ordered.iter().map(|e| e.timestamp),
        now,
        config.streak_coverage_unit(),
    );
    let trend = improvement_trend(&intensities, config.trend_window_size, config.trend_threshold);

    ResilienceMetrics {
        overall_score: overall_score(stability, usage, streak, config),
        mood_stability: to_percent(stability),
        coping_usage: to_percent(usage),
        streak_days: streak,
        improvement_trend: trend,
    }
}

// ============================================================================
// Components
// ============================================================================

/// Population variance. Zero for fewer than two values.
pub fn population_variance(values: &[f64]) -> f64 {
    let Some(avg) = mean(values) else {
        return 0.0;
    };
    values.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / values.len() as f64
}

/// Unrounded stability in 0..=100.
pub fn stability_score(intensities: &[f64], variance_factor: f64) -> f64 {
    if intensities.is_empty() {
        return 0.0;
    }
    let raw = 100.0 - variance_factor * population_variance(intensities);
    sanitize(raw).clamp(0.0, 100.0)
}

/// Unrounded share of entries with at least one technique, in 0..=100.
fn coping_usage_percent(entries: &[&MoodEntry]) -> f64 {
    if entries.is_empty() {
        return 0.0;
    }
    let with_coping = entries.iter().filter(|e| e.used_coping()).count();
    100.0 * with_coping as f64 / entries.len() as f64
}

/// Count consecutive coverage units ending at the unit containing `now`.
///
/// Timestamps are bucketed by `unit` since the Unix epoch (UTC calendar days
/// for the default unit) and deduplicated first, so several entries on the
/// same day count once. Entries after `now` are ignored.
pub fn streak_units<I>(timestamps: I, now: DateTime<Utc>, unit: Duration) -> u32
where
    I: IntoIterator<Item = DateTime<Utc>>,
{
    let unit_ms = unit.num_milliseconds().max(1);
    let today = now.timestamp_millis().div_euclid(unit_ms);

    let covered: BTreeSet<i64> = timestamps
        .into_iter()
        .map(|ts| ts.timestamp_millis().div_euclid(unit_ms))
        .filter(|bucket| *bucket <= today)
        .collect();

    let mut streak = 0u32;
    let mut expected_ago = 0i64;
    for bucket in covered.iter().rev() {
        if today - bucket == expected_ago {
            streak += 1;
            expected_ago += 1;
        } else {
            break;
        }
    }
    streak
}

/// Trend over intensities ordered most recent first.
pub fn improvement_trend(intensities: &[f64], window: usize, threshold: f64) -> Trend {
    if window == 0 {
        return Trend::Stable;
    }
    let split = window.min(intensities.len());
    let end = (2 * window).min(intensities.len());
    let recent = &intensities[..split];
    let older = &intensities[split..end];

    match (mean(recent), mean(older)) {
        (Some(recent_mean), Some(older_mean)) => classify_trend(recent_mean, older_mean, threshold),
        _ => Trend::Stable,
    }
}

/// `Up` above `+threshold`, `Down` below `-threshold`. Both bounds exclusive.
pub fn classify_trend(recent_mean: f64, older_mean: f64, threshold: f64) -> Trend {
    let diff = recent_mean - older_mean;
    if diff > threshold {
        Trend::Up
    } else if diff < -threshold {
        Trend::Down
    } else {
        Trend::Stable
    }
}

/// Composite score. Non-decreasing in each of its three inputs.
pub fn overall_score(stability: f64, coping_usage: f64, streak: u32, config: &MetricsConfig) -> u8 {
    let bonus = (f64::from(streak) * config.streak_bonus_per_unit.max(0.0))
        .min(config.streak_bonus_cap.max(0.0));
    to_percent((stability + coping_usage + bonus) / 2.0)
}

/// Mean intensity of a journal, if it has any entries.
pub fn average_intensity(entries: &[MoodEntry]) -> Option<f64> {
    let values: Vec<f64> = entries
        .iter()
        .map(|e| f64::from(e.intensity.get()))
        .collect();
    mean(&values)
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

#[inline]
fn sanitize(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        tracing::warn!("Non-finite metric value {}, treating as 0", v);
        0.0
    }
}

fn to_percent(v: f64) -> u8 {
    sanitize(v).round().clamp(0.0, 100.0) as u8
}
