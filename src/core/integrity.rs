//! Trace integrity checks.
//!
//! Warn-only: nothing found here blocks a step. Timestamps that are
//! clearly fabricated (in the future, or well before the task started)
//! are reported as [`CorrectableEntry`] values for the corrector.

use crate::core::clock::parse_timestamp;
use crate::core::event::IndexedEvent;
use crate::core::schema::PhaseSchema;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

pub const DEFAULT_SKEW_TOLERANCE_SECS: i64 = 60;
const SUGGESTION_CUTOFF: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionReason {
    Future,
    PreTask,
}

impl CorrectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Future => "future",
            Self::PreTask => "pre_task",
        }
    }
}

impl fmt::Display for CorrectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CorrectableEntry {
    /// Position in the unfiltered raw trace.
    pub index: usize,
    pub step_id: String,
    pub phase_name: String,
    pub original_timestamp: String,
    pub reason: CorrectionReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    UnknownPhase,
    ForeignStep,
    FutureTimestamp,
    PreTaskTimestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityWarning {
    pub kind: WarningKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_index: Option<usize>,
}

impl fmt::Display for IntegrityWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct IntegrityResult {
    pub warnings: Vec<IntegrityWarning>,
    pub correctable_entries: Vec<CorrectableEntry>,
}

impl IntegrityResult {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty() && self.correctable_entries.is_empty()
    }

    /// Warnings that still matter once the given raw indices were corrected.
    ///
    /// Only timestamp warnings carry an index; the rest always survive.
    pub fn warnings_excluding(&self, corrected: &[usize]) -> Vec<&IntegrityWarning> {
        self.warnings
            .iter()
            .filter(|w| w.entry_index.is_none_or(|idx| !corrected.contains(&idx)))
            .collect()
    }
}

pub struct IntegrityValidator {
    schema: Arc<PhaseSchema>,
    tolerance: Duration,
}

impl IntegrityValidator {
    pub fn new(schema: Arc<PhaseSchema>) -> Self {
        Self {
            schema,
            tolerance: Duration::seconds(DEFAULT_SKEW_TOLERANCE_SECS),
        }
    }

    pub fn with_skew_tolerance(mut self, secs: u64) -> Self {
        self.tolerance = i64::try_from(secs)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or(Duration::MAX);
        self
    }

    pub fn skew_tolerance(&self) -> Duration {
        self.tolerance
    }

    /// Inspect the whole trace on behalf of `step_id`.
    ///
    /// `events` is the unfiltered trace; other steps' events are only
    /// consulted for the contamination check.
    pub fn validate(
        &self,
        step_id: &str,
        events: &[IndexedEvent],
        task_start_time: Option<&str>,
        now: DateTime<Utc>,
    ) -> IntegrityResult {
        let start = task_start_time.and_then(parse_timestamp);

        let mut result = IntegrityResult::default();
        self.check_phase_names(step_id, events, &mut result);
        if let Some(start) = start {
            check_foreign_steps(step_id, events, start, &mut result);
        }
        self.check_timestamps(step_id, events, start, now, &mut result);
        result
    }

    fn check_phase_names(&self, step_id: &str, events: &[IndexedEvent], out: &mut IntegrityResult) {
        for indexed in events.iter().filter(|e| e.event.step_id == step_id) {
            let phase = &indexed.event.phase_name;
            if self.schema.has_phase(phase) {
                continue;
            }
            let suggestion = closest_match(phase, self.schema.phases())
                .map(|m| format!(" (did you mean '{}'?)", m))
                .unwrap_or_default();
            out.warnings.push(IntegrityWarning {
                kind: WarningKind::UnknownPhase,
                message: format!("Unrecognized phase name '{}'{}", phase, suggestion),
                entry_index: None,
            });
        }
    }

    fn check_timestamps(
        &self,
        step_id: &str,
        events: &[IndexedEvent],
        start: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        out: &mut IntegrityResult,
    ) {
        for indexed in events.iter().filter(|e| e.event.step_id == step_id) {
            let event = &indexed.event;
            let Some(at) = parse_timestamp(&event.timestamp) else {
                continue;
            };

            let (kind, reason) = if at > now {
                (WarningKind::FutureTimestamp, Some(CorrectionReason::Future))
            } else if let Some(start) = start.filter(|s| at < *s) {
                let beyond_tolerance = start
                    .checked_sub_signed(self.tolerance)
                    .is_some_and(|limit| at < limit);
                (
                    WarningKind::PreTaskTimestamp,
                    beyond_tolerance.then_some(CorrectionReason::PreTask),
                )
            } else {
                continue;
            };

            let label = match kind {
                WarningKind::FutureTimestamp => "Future",
                _ => "Pre-task",
            };
            out.warnings.push(IntegrityWarning {
                kind,
                message: format!("{} timestamp on {}: {}", label, event.phase_name, event.timestamp),
                entry_index: Some(indexed.index),
            });
            if let Some(reason) = reason {
                out.correctable_entries.push(CorrectableEntry {
                    index: indexed.index,
                    step_id: event.step_id.clone(),
                    phase_name: event.phase_name.clone(),
                    original_timestamp: event.timestamp.clone(),
                    reason,
                });
            }
        }
    }
}

fn check_foreign_steps(
    step_id: &str,
    events: &[IndexedEvent],
    start: DateTime<Utc>,
    out: &mut IntegrityResult,
) {
    let foreign: BTreeSet<&str> = events
        .iter()
        .map(|e| &e.event)
        .filter(|e| e.step_id != step_id)
        .filter(|e| parse_timestamp(&e.timestamp).is_some_and(|at| at >= start))
        .map(|e| e.step_id.as_str())
        .collect();

    for id in foreign {
        out.warnings.push(IntegrityWarning {
            kind: WarningKind::ForeignStep,
            message: format!("Foreign step_id '{}' has events written during task window", id),
            entry_index: None,
        });
    }
}

/// Best candidate with a similarity ratio of at least 0.5.
fn closest_match<'a>(word: &str, candidates: &'a [String]) -> Option<&'a str> {
    let mut best: Option<(&str, f64)> = None;
    for candidate in candidates {
        let score = similarity(word, candidate);
        if score >= SUGGESTION_CUTOFF && best.is_none_or(|(_, s)| score > s) {
            best = Some((candidate.as_str(), score));
        }
    }
    best.map(|(c, _)| c)
}

/// Ratcliff/Obershelp ratio: 2 * matched / total length.
fn similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    (2 * matched_chars(&a, &b)) as f64 / total as f64
}

fn matched_chars(a: &[char], b: &[char]) -> usize {
    let (mut best_len, mut best_a, mut best_b) = (0, 0, 0);
    for i in 0..a.len() {
        for j in 0..b.len() {
            let mut k = 0;
            while i + k < a.len() && j + k < b.len() && a[i + k] == b[j + k] {
                k += 1;
            }
            if k > best_len {
                (best_len, best_a, best_b) = (k, i, j);
            }
        }
    }
    if best_len == 0 {
        return 0;
    }
    best_len
        + matched_chars(&a[..best_a], &b[..best_b])
        + matched_chars(&a[best_a + best_len..], &b[best_b + best_len..])
}
