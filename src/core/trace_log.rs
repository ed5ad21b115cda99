//! Persisted execution trace: the YAML document and its stores.
//!
//! The document keeps raw entries exactly as found so a rewrite after
//! timestamp correction only touches the entries that were corrected.

use crate::core::clock::{Clock, SystemClock};
use crate::core::error::{GateError, TraceAccessError};
use crate::core::event::{self, IndexedEvent, PhaseEvent, PhaseStatus, RawEntry};
use crate::core::schema::PhaseSchema;
use chrono::SecondsFormat;
use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml::Value;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub const STRUCTURED_SCHEMA_VERSION: &str = "3.0";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceDocument {
    #[serde(default, deserialize_with = "scalar_or_none", skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, deserialize_with = "scalar_or_none", skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<String>,
    #[serde(default)]
    pub events: Vec<RawEntry>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl TraceDocument {
    pub fn with_project(project_id: &str) -> Self {
        Self {
            project_id: Some(project_id.to_string()),
            ..Self::default()
        }
    }

    pub fn step_events(&self, step_id: &str) -> Vec<PhaseEvent> {
        event::parse_many(&self.events, Some(step_id))
    }

    pub fn indexed_events(&self) -> Vec<IndexedEvent> {
        event::parse_indexed(&self.events)
    }

    /// Distinct phase names logged for `step_id`, in first-seen order.
    pub fn phases_logged(&self, step_id: &str) -> Vec<String> {
        let mut seen: Vec<String> = Vec::new();
        for ev in self.step_events(step_id) {
            if !seen.contains(&ev.phase_name) {
                seen.push(ev.phase_name);
            }
        }
        seen
    }
}

fn scalar_or_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    })
}

/// Access to persisted traces.
///
/// Missing and unreadable traces are distinct [`TraceAccessError`]
/// variants so callers can give a specific remediation hint.
pub trait TraceStore {
    fn load(&self, log: &Path) -> Result<TraceDocument, TraceAccessError>;

    fn save(&self, log: &Path, doc: &TraceDocument) -> Result<(), GateError>;

    fn read_project_id(&self, log: &Path) -> Result<Option<String>, TraceAccessError> {
        Ok(self.load(log)?.project_id)
    }

    fn read_step_events(&self, log: &Path, step_id: &str) -> Result<Vec<PhaseEvent>, TraceAccessError> {
        Ok(self.load(log)?.step_events(step_id))
    }

    fn read_all_events(&self, log: &Path) -> Result<Vec<IndexedEvent>, TraceAccessError> {
        Ok(self.load(log)?.indexed_events())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct YamlTraceStore;

impl YamlTraceStore {
    pub fn new() -> Self {
        Self
    }
}

impl TraceStore for YamlTraceStore {
    fn load(&self, log: &Path) -> Result<TraceDocument, TraceAccessError> {
        let text = match fs::read_to_string(log) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(TraceAccessError::NotFound {
                    path: log.to_path_buf(),
                });
            }
            Err(e) => return Err(corrupt(log, format!("unreadable: {}", e))),
        };

        let value: Value =
            serde_yaml::from_str(&text).map_err(|e| corrupt(log, format!("invalid YAML: {}", e)))?;
        if !value.is_mapping() {
            return Err(corrupt(log, "trace must be a YAML mapping".to_string()));
        }
        serde_yaml::from_value(value).map_err(|e| corrupt(log, e.to_string()))
    }

    fn save(&self, log: &Path, doc: &TraceDocument) -> Result<(), GateError> {
        let text = serde_yaml::to_string(doc)?;
        let file_name = log
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "trace".to_string());
        let tmp = log.with_file_name(format!(".{}.tmp", file_name));
        fs::write(&tmp, text).map_err(GateError::IoError)?;
        fs::rename(&tmp, log).map_err(GateError::IoError)?;
        Ok(())
    }
}

fn corrupt(log: &Path, detail: String) -> TraceAccessError {
    TraceAccessError::Corrupt {
        path: log.to_path_buf(),
        detail,
    }
}

/// In-process store for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryTraceStore {
    docs: RefCell<BTreeMap<PathBuf, Result<TraceDocument, String>>>,
    reject_saves: Cell<bool>,
}

impl MemoryTraceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, log: impl Into<PathBuf>, doc: TraceDocument) {
        self.docs.borrow_mut().insert(log.into(), Ok(doc));
    }

    /// Make `load` report the trace as corrupt.
    pub fn insert_corrupt(&self, log: impl Into<PathBuf>, detail: &str) {
        self.docs.borrow_mut().insert(log.into(), Err(detail.to_string()));
    }

    pub fn document(&self, log: &Path) -> Option<TraceDocument> {
        self.docs.borrow().get(log).and_then(|d| d.as_ref().ok().cloned())
    }

    pub fn reject_saves(&self, reject: bool) {
        self.reject_saves.set(reject);
    }
}

impl TraceStore for MemoryTraceStore {
    fn load(&self, log: &Path) -> Result<TraceDocument, TraceAccessError> {
        match self.docs.borrow().get(log) {
            None => Err(TraceAccessError::NotFound {
                path: log.to_path_buf(),
            }),
            Some(Err(detail)) => Err(corrupt(log, detail.clone())),
            Some(Ok(doc)) => Ok(doc.clone()),
        }
    }

    fn save(&self, log: &Path, doc: &TraceDocument) -> Result<(), GateError> {
        if self.reject_saves.get() {
            return Err(GateError::ValidationError(format!(
                "trace store is read-only: {}",
                log.display()
            )));
        }
        self.docs.borrow_mut().insert(log.to_path_buf(), Ok(doc.clone()));
        Ok(())
    }
}

/// One phase entry to be appended to a trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseRecord {
    pub step_id: String,
    pub phase: String,
    pub status: String,
    pub data: String,
    pub turns_used: Option<u64>,
    pub tokens_used: Option<u64>,
}

impl PhaseRecord {
    /// Reject records the schema would never accept.
    pub fn check(&self, schema: &PhaseSchema) -> Result<(), GateError> {
        if !schema.has_phase(&self.phase) {
            return Err(GateError::ValidationError(format!(
                "Invalid phase '{}'. Valid phases: {}",
                self.phase,
                schema.phases().join(", ")
            )));
        }
        match PhaseStatus::parse(&self.status) {
            Some(PhaseStatus::Executed) => Ok(()),
            Some(PhaseStatus::Skipped) => {
                let prefixes = schema.all_skip_prefixes();
                if prefixes.iter().any(|p| self.data.starts_with(p.as_str())) {
                    Ok(())
                } else {
                    Err(GateError::ValidationError(format!(
                        "SKIPPED status requires a valid skip prefix. Valid prefixes: {}",
                        prefixes.join(", ")
                    )))
                }
            }
            _ => Err(GateError::ValidationError(format!(
                "Invalid status '{}' (must be EXECUTED or SKIPPED)",
                self.status
            ))),
        }
    }
}

/// Append `record` to an existing trace with the current UTC time.
pub fn append_event(
    store: &dyn TraceStore,
    log: &Path,
    schema: &PhaseSchema,
    record: &PhaseRecord,
    clock: &dyn Clock,
) -> Result<PhaseEvent, GateError> {
    record.check(schema)?;
    let mut doc = store.load(log)?;

    let (turns_used, tokens_used) = match (record.turns_used, record.tokens_used) {
        (Some(tu), Some(tk)) => (Some(tu), Some(tk)),
        _ => (None, None),
    };
    let written = PhaseEvent {
        step_id: record.step_id.clone(),
        phase_name: record.phase.clone(),
        status: record.status.clone(),
        outcome: record.data.clone(),
        timestamp: clock.now_utc().to_rfc3339_opts(SecondsFormat::Secs, true),
        turns_used,
        tokens_used,
    };
    doc.events.push(written.to_structured());
    doc.schema_version = Some(STRUCTURED_SCHEMA_VERSION.to_string());
    store.save(log, &doc)?;
    Ok(written)
}

/// [`append_event`] against the YAML file store and the system clock.
pub fn append_to_file(log: &Path, schema: &PhaseSchema, record: &PhaseRecord) -> Result<PhaseEvent, GateError> {
    append_event(&YamlTraceStore::new(), log, schema, record, &SystemClock)
}
