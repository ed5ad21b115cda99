//! Phase events and the parser for both trace wire formats.
//!
//! Legacy pipe-delimited strings:
//! `step_id|phase|status|outcome|timestamp[|turns_used|tokens_used]`
//!
//! Structured mappings with short keys:
//! `{sid, p, s, d, t}` plus optional `{tu, tk}`.
//!
//! Parsing never fails loudly. An entry that does not carry the required
//! fields yields `None` so one corrupt line cannot hide the rest of the trace.

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::fmt;

pub const FIELD_SEPARATOR: char = '|';
pub const MINIMUM_FIELDS: usize = 5;
pub const STATS_FIELDS: usize = 7;
/// Position of the timestamp in a pipe line.
pub const TIMESTAMP_FIELD: usize = 4;

pub const KEY_STEP_ID: &str = "sid";
pub const KEY_PHASE: &str = "p";
pub const KEY_STATUS: &str = "s";
pub const KEY_DATA: &str = "d";
pub const KEY_TIMESTAMP: &str = "t";
pub const KEY_TURNS: &str = "tu";
pub const KEY_TOKENS: &str = "tk";

pub const OUTCOME_PASS: &str = "PASS";
pub const OUTCOME_FAIL: &str = "FAIL";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseStatus {
    Executed,
    Skipped,
    InProgress,
    NotExecuted,
}

impl PhaseStatus {
    pub const ALL: [Self; 4] = [Self::Executed, Self::Skipped, Self::InProgress, Self::NotExecuted];

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "EXECUTED" => Some(Self::Executed),
            "SKIPPED" => Some(Self::Skipped),
            "IN_PROGRESS" => Some(Self::InProgress),
            "NOT_EXECUTED" => Some(Self::NotExecuted),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Executed => "EXECUTED",
            Self::Skipped => "SKIPPED",
            Self::InProgress => "IN_PROGRESS",
            Self::NotExecuted => "NOT_EXECUTED",
        }
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded phase execution for one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseEvent {
    pub step_id: String,
    pub phase_name: String,
    pub status: String,
    pub outcome: String,
    pub timestamp: String,
    pub turns_used: Option<u64>,
    pub tokens_used: Option<u64>,
}

impl PhaseEvent {
    pub fn status_kind(&self) -> Option<PhaseStatus> {
        PhaseStatus::parse(&self.status)
    }

    /// Structured wire form. Stats are written only as a pair.
    pub fn to_structured(&self) -> RawEntry {
        let mut map = Mapping::new();
        map.insert(KEY_STEP_ID.into(), self.step_id.clone().into());
        map.insert(KEY_PHASE.into(), self.phase_name.clone().into());
        map.insert(KEY_STATUS.into(), self.status.clone().into());
        map.insert(KEY_DATA.into(), self.outcome.clone().into());
        map.insert(KEY_TIMESTAMP.into(), self.timestamp.clone().into());
        if let (Some(tu), Some(tk)) = (self.turns_used, self.tokens_used) {
            map.insert(KEY_TURNS.into(), tu.into());
            map.insert(KEY_TOKENS.into(), tk.into());
        }
        RawEntry::Structured(map)
    }

    /// `sid=.. p=.. s=.. d=.. t=..` echo line.
    pub fn to_kv_line(&self) -> String {
        let mut parts = vec![
            format!("sid={}", self.step_id),
            format!("p={}", self.phase_name),
            format!("s={}", self.status),
            format!("d={}", self.outcome),
            format!("t={}", self.timestamp),
        ];
        if let (Some(tu), Some(tk)) = (self.turns_used, self.tokens_used) {
            parts.push(format!("tu={}", tu));
            parts.push(format!("tk={}", tk));
        }
        parts.join(" ")
    }
}

/// A parsed event together with the arena index of its raw entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedEvent {
    pub index: usize,
    pub event: PhaseEvent,
}

/// One raw trace entry, exactly as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawEntry {
    Pipe(String),
    Structured(Mapping),
    /// Anything else found in the event list. Never parses, kept on rewrite.
    Other(Value),
}

impl RawEntry {
    pub fn parse(&self) -> Option<PhaseEvent> {
        match self {
            Self::Pipe(line) => parse_pipe(line),
            Self::Structured(map) => parse_structured(map),
            Self::Other(_) => None,
        }
    }

    pub fn contains_timestamp(&self, timestamp: &str) -> bool {
        match self {
            Self::Pipe(line) => line
                .split(FIELD_SEPARATOR)
                .nth(TIMESTAMP_FIELD)
                .is_some_and(|t| t.contains(timestamp)),
            Self::Structured(map) => map
                .get(KEY_TIMESTAMP)
                .and_then(scalar_text)
                .is_some_and(|t| t.contains(timestamp)),
            Self::Other(_) => false,
        }
    }

    /// Swap `original` for `replacement` inside the timestamp-bearing text.
    ///
    /// Returns `false` and leaves the entry untouched when `original` is
    /// not present.
    pub fn replace_timestamp(&mut self, original: &str, replacement: &str) -> bool {
        if original.is_empty() || !self.contains_timestamp(original) {
            return false;
        }
        match self {
            Self::Pipe(line) => {
                let mut fields: Vec<String> = line.split(FIELD_SEPARATOR).map(str::to_string).collect();
                let Some(field) = fields.get_mut(TIMESTAMP_FIELD) else {
                    return false;
                };
                *field = field.replace(original, replacement);
                *line = fields.join(FIELD_SEPARATOR.to_string().as_str());
                true
            }
            Self::Structured(map) => {
                let Some(current) = map.get(KEY_TIMESTAMP).and_then(scalar_text) else {
                    return false;
                };
                map.insert(
                    KEY_TIMESTAMP.into(),
                    Value::String(current.replace(original, replacement)),
                );
                true
            }
            Self::Other(_) => false,
        }
    }
}

impl From<&str> for RawEntry {
    fn from(line: &str) -> Self {
        Self::Pipe(line.to_string())
    }
}

pub fn parse_pipe(line: &str) -> Option<PhaseEvent> {
    let parts: Vec<&str> = line.split(FIELD_SEPARATOR).collect();
    if parts.len() < MINIMUM_FIELDS {
        return None;
    }

    let stat = |i: usize| {
        if parts.len() >= STATS_FIELDS {
            parts[i].trim().parse::<u64>().ok()
        } else {
            None
        }
    };
    let (turns_used, tokens_used) = (stat(5), stat(6));

    Some(PhaseEvent {
        step_id: parts[0].to_string(),
        phase_name: parts[1].to_string(),
        status: parts[2].to_string(),
        outcome: parts[3].to_string(),
        timestamp: parts[4].to_string(),
        turns_used,
        tokens_used,
    })
}

pub fn parse_structured(map: &Mapping) -> Option<PhaseEvent> {
    let field = |key: &str| map.get(key).and_then(scalar_text);
    Some(PhaseEvent {
        step_id: field(KEY_STEP_ID)?,
        phase_name: field(KEY_PHASE)?,
        status: field(KEY_STATUS)?,
        outcome: field(KEY_DATA)?,
        timestamp: field(KEY_TIMESTAMP)?,
        turns_used: map.get(KEY_TURNS).and_then(count_value),
        tokens_used: map.get(KEY_TOKENS).and_then(count_value),
    })
}

/// Parse every entry, keeping only events of `step_id` when given.
pub fn parse_many(entries: &[RawEntry], step_id: Option<&str>) -> Vec<PhaseEvent> {
    entries
        .iter()
        .filter_map(RawEntry::parse)
        .filter(|event| step_id.is_none_or(|sid| event.step_id == sid))
        .collect()
}

/// Parse every entry, tagging each event with its raw position.
pub fn parse_indexed(entries: &[RawEntry]) -> Vec<IndexedEvent> {
    entries
        .iter()
        .enumerate()
        .filter_map(|(index, entry)| entry.parse().map(|event| IndexedEvent { index, event }))
        .collect()
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn count_value(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
