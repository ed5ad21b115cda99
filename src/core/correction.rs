//! Rewrites fabricated timestamps with values interpolated across the
//! task window.

use crate::core::clock::{format_timestamp, parse_timestamp};
use crate::core::event::RawEntry;
use crate::core::integrity::{CorrectableEntry, CorrectionReason};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedCorrection {
    pub index: usize,
    pub step_id: String,
    pub phase_name: String,
    pub original_timestamp: String,
    pub corrected_timestamp: String,
    pub reason: CorrectionReason,
}

/// `n` evenly spaced instants strictly inside `(start, now)`.
///
/// One value lands on the midpoint. Callers resolve the window with
/// [`correction_window`] first; a window too narrow for `n` distinct
/// microseconds yields repeated values.
pub fn interpolate(start: DateTime<Utc>, now: DateTime<Utc>, n: usize) -> Vec<DateTime<Utc>> {
    if n == 0 {
        return Vec::new();
    }
    let span = (now - start).num_microseconds().unwrap_or(0).max(0) as i128;
    let slots = n as i128 + 1;
    (1..=n as i128)
        .map(|k| {
            let offset = span * k / slots;
            start + chrono::Duration::microseconds(offset as i64)
        })
        .collect()
}

/// Window for `n` corrections, or `None` when no valid window exists.
///
/// A parseable task start must lie before `now` with room for `n` distinct
/// microsecond slots. Without one the window is the `n + 1` seconds
/// ending at `now`.
pub fn correction_window(
    task_start_time: Option<&str>,
    now: DateTime<Utc>,
    n: usize,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let slots = n as i64 + 1;
    let Some(start) = task_start_time.and_then(parse_timestamp) else {
        return Some((now - chrono::Duration::seconds(slots), now));
    };
    let span = (now - start).num_microseconds().unwrap_or(i64::MAX);
    if start >= now || span < slots {
        return None;
    }
    Some((start, now))
}

/// Apply corrections in discovery order to the raw arena.
///
/// Entries whose index no longer exists, or which no longer contain
/// their original timestamp, are left alone and not reported. Nothing
/// is rewritten when the task window cannot hold every correction.
pub fn apply_corrections(
    entries: &mut [RawEntry],
    correctable: &[CorrectableEntry],
    task_start_time: Option<&str>,
    now: DateTime<Utc>,
) -> Vec<AppliedCorrection> {
    if correctable.is_empty() {
        return Vec::new();
    }
    let Some((start, end)) = correction_window(task_start_time, now, correctable.len()) else {
        warn!(
            task_start = task_start_time.unwrap_or_default(),
            now = %format_timestamp(now),
            count = correctable.len(),
            "task window cannot hold corrected timestamps; leaving entries as logged"
        );
        return Vec::new();
    };
    let values = interpolate(start, end, correctable.len());
    let mut applied = Vec::new();

    for (entry, at) in correctable.iter().zip(values) {
        let corrected = format_timestamp(at);
        let Some(raw) = entries.get_mut(entry.index) else {
            warn!(index = entry.index, step_id = %entry.step_id, "correction target missing from trace");
            continue;
        };
        if !raw.replace_timestamp(&entry.original_timestamp, &corrected) {
            warn!(index = entry.index, step_id = %entry.step_id, "correction target no longer matches");
            continue;
        }
        debug!(
            index = entry.index,
            phase = %entry.phase_name,
            original = %entry.original_timestamp,
            corrected = %corrected,
            reason = %entry.reason,
            "timestamp corrected"
        );
        applied.push(AppliedCorrection {
            index: entry.index,
            step_id: entry.step_id.clone(),
            phase_name: entry.phase_name.clone(),
            original_timestamp: entry.original_timestamp.clone(),
            corrected_timestamp: corrected,
            reason: entry.reason,
        });
    }
    applied
}
