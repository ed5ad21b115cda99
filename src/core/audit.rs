//! Append-only audit trail.
//!
//! Records are compact JSON objects, one per line, with sorted keys,
//! written to one `audit-YYYY-MM-DD.log` file per UTC day.

use crate::core::clock::parse_timestamp;
use crate::core::config::GateConfig;
use crate::core::error::GateError;
use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    LogIntegrityWarning,
    LogIntegrityCorrected,
    HookSubagentStopPassed,
    HookSubagentStopFailed,
    HookSubagentStopError,
    CommitVerified,
    CommitNotVerified,
    ScopeViolation,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LogIntegrityWarning => "LOG_INTEGRITY_WARNING",
            Self::LogIntegrityCorrected => "LOG_INTEGRITY_CORRECTED",
            Self::HookSubagentStopPassed => "HOOK_SUBAGENT_STOP_PASSED",
            Self::HookSubagentStopFailed => "HOOK_SUBAGENT_STOP_FAILED",
            Self::HookSubagentStopError => "HOOK_SUBAGENT_STOP_ERROR",
            Self::CommitVerified => "COMMIT_VERIFIED",
            Self::CommitNotVerified => "COMMIT_NOT_VERIFIED",
            Self::ScopeViolation => "SCOPE_VIOLATION",
        }
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuditEvent {
    pub event_type: AuditEventType,
    pub timestamp: String,
    pub feature_name: Option<String>,
    pub step_id: Option<String>,
    pub hook_id: Option<String>,
    pub data: Map<String, Value>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, timestamp: impl Into<String>) -> Self {
        Self {
            event_type,
            timestamp: timestamp.into(),
            feature_name: None,
            step_id: None,
            hook_id: None,
            data: Map::new(),
        }
    }

    pub fn step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    pub fn feature(mut self, feature_name: Option<String>) -> Self {
        self.feature_name = feature_name;
        self
    }

    pub fn hook(mut self, hook_id: Option<String>) -> Self {
        self.hook_id = hook_id;
        self
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Flat record: header fields first, event data merged over them.
    pub fn to_record(&self) -> Value {
        let mut record = Map::new();
        record.insert("event".to_string(), Value::from(self.event_type.as_str()));
        record.insert("timestamp".to_string(), Value::from(self.timestamp.clone()));
        if let Some(feature) = &self.feature_name {
            record.insert("feature_name".to_string(), Value::from(feature.clone()));
        }
        if let Some(step) = &self.step_id {
            record.insert("step_id".to_string(), Value::from(step.clone()));
        }
        if let Some(hook) = &self.hook_id {
            record.insert("hook_id".to_string(), Value::from(hook.clone()));
        }
        for (key, value) in &self.data {
            record.insert(key.clone(), value.clone());
        }
        Value::Object(record)
    }

    pub fn to_json_line(&self) -> Result<String, GateError> {
        Ok(serde_json::to_string(&self.to_record())?)
    }
}

pub trait AuditSink {
    fn log_event(&self, event: &AuditEvent) -> Result<(), GateError>;
}

/// Daily JSONL files under one directory.
#[derive(Debug, Clone)]
pub struct JsonlAuditSink {
    dir: PathBuf,
}

impl JsonlAuditSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File for the event's UTC day; today when the timestamp is unreadable.
    pub fn file_for(&self, event: &AuditEvent) -> PathBuf {
        let day = parse_timestamp(&event.timestamp).unwrap_or_else(Utc::now);
        self.dir.join(format!("audit-{}.log", day.format("%Y-%m-%d")))
    }
}

impl AuditSink for JsonlAuditSink {
    fn log_event(&self, event: &AuditEvent) -> Result<(), GateError> {
        fs::create_dir_all(&self.dir).map_err(GateError::IoError)?;
        let line = event.to_json_line()?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.file_for(event))
            .map_err(GateError::IoError)?;
        writeln!(file, "{}", line).map_err(GateError::IoError)?;
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn log_event(&self, _event: &AuditEvent) -> Result<(), GateError> {
        Ok(())
    }
}

/// Collects events in memory; can be told to fail every write.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: RefCell<Vec<AuditEvent>>,
    failing: Cell<bool>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let sink = Self::default();
        sink.failing.set(true);
        sink
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.borrow().clone()
    }

    pub fn of_type(&self, event_type: AuditEventType) -> Vec<AuditEvent> {
        self.events
            .borrow()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn log_event(&self, event: &AuditEvent) -> Result<(), GateError> {
        if self.failing.get() {
            return Err(GateError::IoError(std::io::Error::other("audit sink unavailable")));
        }
        self.events.borrow_mut().push(event.clone());
        Ok(())
    }
}

/// The sink `config` asks for: disabled means nothing is written.
pub fn sink_for(config: &GateConfig, explicit_dir: Option<&Path>, root: &Path) -> Box<dyn AuditSink> {
    if config.audit_logging_enabled {
        Box::new(JsonlAuditSink::new(config.audit_dir(explicit_dir, root)))
    } else {
        Box::new(NullAuditSink)
    }
}
