use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::domain::event_payload::ConnectorStatus;

#[derive(Debug, Clone, PartialEq)]
pub struct StatusSample {
    pub occurred_at: DateTime<Utc>,
    pub status: ConnectorStatus,
}

/// Whole minutes inside `[window_start, window_end)` during which the
/// connector reported a non-delivering status. Each status holds until the
/// next sample or the end of the window. A status reported before the window
/// opened carries into it.
pub fn idle_minutes(
    samples: &[StatusSample],
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> Decimal {
    if window_end <= window_start {
        return Decimal::ZERO;
    }

    let mut ordered: Vec<&StatusSample> = samples.iter().collect();
    ordered.sort_by_key(|sample| sample.occurred_at);

    let mut idle_seconds: i64 = 0;
    for (index, sample) in ordered.iter().enumerate() {
        if !sample.status.is_idle() {
            continue;
        }

        let interval_end = ordered
            .get(index + 1)
            .map(|next| next.occurred_at)
            .unwrap_or(window_end)
            .min(window_end);
        let interval_start = sample.occurred_at.max(window_start);

        if interval_end > interval_start {
            idle_seconds += (interval_end - interval_start).num_seconds();
        }
    }

    Decimal::from(idle_seconds / 60)
}
