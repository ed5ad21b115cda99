//! Phase schema: the single source of truth for what a complete step looks like.
//!
//! The schema is read from a declarative JSON resource and never mutated.
//! Validators receive it explicitly as an `Arc<PhaseSchema>`; the caller
//! owns the [`SchemaLoader`] that parses it once and caches the result.
//!
//! Resource layout:
//!
//! ```json
//! {
//!   "schema_version": "4.0",
//!   "tdd_cycle": { "phase_execution_log": [ { "phase_name": "PREPARE" } ] },
//!   "phase_validation_rules": {
//!     "total_phases": 5,
//!     "valid_statuses": ["EXECUTED", "SKIPPED"],
//!     "skip_validation": { "valid_prefixes": { "NOT_APPLICABLE": { "allows_commit": true } } },
//!     "terminal_phases": { "phases": ["COMMIT"] }
//!   }
//! }
//! ```

use crate::core::error::GateError;
use crate::core::event::PhaseStatus;
use serde::{Deserialize, Serialize};
use std::cell::OnceCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const DEFAULT_SCHEMA_JSON: &str = include_str!("../../schemas/step-tdd-cycle-schema.json");

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseSchema {
    phases: Vec<String>,
    valid_statuses: Vec<String>,
    valid_skip_prefixes: Vec<String>,
    blocking_skip_prefixes: Vec<String>,
    terminal_phases: Vec<String>,
    schema_version: String,
    total_phases: usize,
}

impl PhaseSchema {
    pub fn new(
        phases: Vec<String>,
        valid_statuses: Vec<String>,
        valid_skip_prefixes: Vec<String>,
        blocking_skip_prefixes: Vec<String>,
        terminal_phases: Vec<String>,
    ) -> Result<Self, GateError> {
        if phases.is_empty() {
            return Err(GateError::SchemaError(
                "schema declares no phases; every step would pass".to_string(),
            ));
        }
        if let Some(stray) = terminal_phases.iter().find(|t| !phases.contains(t)) {
            return Err(GateError::SchemaError(format!(
                "terminal phase '{}' is not one of the declared phases ({})",
                stray,
                phases.join(", ")
            )));
        }
        let valid_statuses = if valid_statuses.is_empty() {
            PhaseStatus::ALL.iter().map(|s| s.as_str().to_string()).collect()
        } else {
            valid_statuses
        };
        let total_phases = phases.len();
        Ok(Self {
            phases,
            valid_statuses,
            valid_skip_prefixes,
            blocking_skip_prefixes,
            terminal_phases,
            schema_version: "4.0".to_string(),
            total_phases,
        })
    }

    pub fn builtin() -> Result<Self, GateError> {
        Self::from_json_str(DEFAULT_SCHEMA_JSON)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, GateError> {
        let doc: SchemaDocument = serde_json::from_str(raw)
            .map_err(|e| GateError::SchemaError(format!("invalid schema JSON: {}", e)))?;
        doc.into_schema()
    }

    pub fn from_path(path: &Path) -> Result<Self, GateError> {
        if !path.exists() {
            return Err(GateError::NotFound(format!(
                "phase schema not found at {}",
                path.display()
            )));
        }
        let raw = fs::read_to_string(path).map_err(GateError::IoError)?;
        Self::from_json_str(&raw).map_err(|e| match e {
            GateError::SchemaError(msg) => {
                GateError::SchemaError(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    /// Ordered phase cycle.
    pub fn phases(&self) -> &[String] {
        &self.phases
    }

    pub fn valid_statuses(&self) -> &[String] {
        &self.valid_statuses
    }

    /// Skip prefixes that still allow the step to complete.
    pub fn valid_skip_prefixes(&self) -> &[String] {
        &self.valid_skip_prefixes
    }

    /// Skip prefixes that never allow the step to complete.
    pub fn blocking_skip_prefixes(&self) -> &[String] {
        &self.blocking_skip_prefixes
    }

    /// Phases that must end with `PASS`.
    pub fn terminal_phases(&self) -> &[String] {
        &self.terminal_phases
    }

    pub fn schema_version(&self) -> &str {
        &self.schema_version
    }

    pub fn total_phases(&self) -> usize {
        self.total_phases
    }

    pub fn has_phase(&self, phase: &str) -> bool {
        self.phases.iter().any(|p| p == phase)
    }

    pub fn is_terminal(&self, phase: &str) -> bool {
        self.terminal_phases.iter().any(|p| p == phase)
    }

    pub fn is_valid_status(&self, status: &str) -> bool {
        self.valid_statuses.iter().any(|s| s == status)
    }

    pub fn permits_skip(&self, reason: &str) -> bool {
        self.valid_skip_prefixes
            .iter()
            .any(|prefix| reason.starts_with(prefix.as_str()))
    }

    pub fn blocks_skip(&self, reason: &str) -> bool {
        self.blocking_skip_prefixes
            .iter()
            .any(|prefix| reason.starts_with(prefix.as_str()))
    }

    /// Every prefix a skip reason may legally carry, permitting or not.
    pub fn all_skip_prefixes(&self) -> Vec<String> {
        self.valid_skip_prefixes
            .iter()
            .chain(self.blocking_skip_prefixes.iter())
            .cloned()
            .collect()
    }
}

#[derive(Debug, Default, Deserialize)]
struct SchemaDocument {
    #[serde(default)]
    schema_version: Option<String>,
    #[serde(default)]
    tdd_cycle: CycleSection,
    #[serde(default)]
    phase_validation_rules: RulesSection,
}

#[derive(Debug, Default, Deserialize)]
struct CycleSection {
    #[serde(default)]
    phase_execution_log: Vec<PhaseEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct PhaseEntry {
    #[serde(default)]
    phase_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RulesSection {
    #[serde(default)]
    total_phases: Option<usize>,
    #[serde(default)]
    valid_statuses: Vec<String>,
    #[serde(default)]
    skip_validation: SkipSection,
    #[serde(default)]
    terminal_phases: TerminalSection,
}

#[derive(Debug, Default, Deserialize)]
struct SkipSection {
    #[serde(default)]
    valid_prefixes: BTreeMap<String, PrefixRule>,
}

#[derive(Debug, Default, Deserialize)]
struct PrefixRule {
    #[serde(default)]
    allows_commit: bool,
}

#[derive(Debug, Default, Deserialize)]
struct TerminalSection {
    #[serde(default)]
    phases: Vec<String>,
}

impl SchemaDocument {
    fn into_schema(self) -> Result<PhaseSchema, GateError> {
        let phases: Vec<String> = self
            .tdd_cycle
            .phase_execution_log
            .into_iter()
            .filter_map(|entry| entry.phase_name)
            .collect();

        let rules = self.phase_validation_rules;
        let (valid, blocking): (Vec<_>, Vec<_>) = rules
            .skip_validation
            .valid_prefixes
            .into_iter()
            .partition(|(_, rule)| rule.allows_commit);

        let mut schema = PhaseSchema::new(
            phases,
            rules.valid_statuses,
            valid.into_iter().map(|(prefix, _)| prefix).collect(),
            blocking.into_iter().map(|(prefix, _)| prefix).collect(),
            rules.terminal_phases.phases,
        )?;
        if let Some(version) = self.schema_version {
            schema.schema_version = version;
        }
        if let Some(total) = rules.total_phases {
            schema.total_phases = total;
        }
        Ok(schema)
    }
}

/// Where a schema comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaSource {
    Builtin,
    File(PathBuf),
}

/// Caller-owned cache: parses the schema on first use, then hands out clones
/// of the same `Arc`.
#[derive(Debug)]
pub struct SchemaLoader {
    source: SchemaSource,
    cached: OnceCell<Arc<PhaseSchema>>,
}

impl SchemaLoader {
    pub fn new(source: SchemaSource) -> Self {
        Self {
            source,
            cached: OnceCell::new(),
        }
    }

    pub fn builtin() -> Self {
        Self::new(SchemaSource::Builtin)
    }

    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self::new(SchemaSource::File(path.into()))
    }

    pub fn source(&self) -> &SchemaSource {
        &self.source
    }

    pub fn load(&self) -> Result<Arc<PhaseSchema>, GateError> {
        if let Some(schema) = self.cached.get() {
            return Ok(Arc::clone(schema));
        }
        let schema = Arc::new(match &self.source {
            SchemaSource::Builtin => PhaseSchema::builtin()?,
            SchemaSource::File(path) => PhaseSchema::from_path(path)?,
        });
        Ok(Arc::clone(self.cached.get_or_init(|| schema)))
    }

    pub fn is_loaded(&self) -> bool {
        self.cached.get().is_some()
    }

    /// Drop the cached schema so the next `load` re-reads the source.
    pub fn reset(&mut self) {
        self.cached = OnceCell::new();
    }
}
