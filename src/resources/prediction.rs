//! Depletion prediction
//!
//! Usage is bucketed by hour over a trailing window. The hourly mean is taken
//! over the span from the oldest bucket with data to the current hour, so a
//! young pool is not diluted by hours that predate it.

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;

use crate::types::{DepletionForecast, ResourceUsageEntry};

/// Confidence never exceeds this, however much history there is
pub const MAX_CONFIDENCE: f64 = 0.95;

/// Forecast when `available` runs out at the observed consumption rate
pub fn predict_depletion(
    usage: &[ResourceUsageEntry],
    available: u64,
    now: DateTime<Utc>,
    window_hours: u32,
) -> DepletionForecast {
    let window_hours = window_hours.max(1);
    let window_start = now - Duration::hours(window_hours as i64);

    // hours-ago → consumed
    let mut buckets: BTreeMap<i64, u64> = BTreeMap::new();
    for entry in usage {
        if entry.created_at < window_start || entry.created_at > now || entry.amount == 0 {
            continue;
        }
        let hours_ago = (now - entry.created_at).num_hours();
        *buckets.entry(hours_ago).or_default() += entry.amount;
    }

    let Some((&oldest, _)) = buckets.iter().next_back() else {
        return DepletionForecast::default();
    };

    let span_hours = (oldest + 1).min(window_hours as i64) as f64;
    let consumed: u64 = buckets.values().sum();
    let hourly_rate = consumed as f64 / span_hours;
    let daily_average = hourly_rate * 24.0;

    let hours_with_data = buckets.len() as f64;
    let confidence = (hours_with_data / window_hours as f64).min(1.0) * MAX_CONFIDENCE;

    let predicted_depletion = if hourly_rate > 0.0 {
        let seconds = (available as f64 / hourly_rate * 3600.0).round() as i64;
        Some(now + Duration::seconds(seconds))
    } else {
        None
    };

    DepletionForecast {
        daily_average_usage: daily_average.round() as u64,
        predicted_depletion,
        confidence,
    }
}
