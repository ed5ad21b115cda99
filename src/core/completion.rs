//! Step completion: does one step's event set satisfy the phase schema?
//!
//! Pure and stateless. Every outcome, including "the agent did nothing",
//! is a [`CompletionResult`] value; nothing here returns an error.

use crate::core::event::{OUTCOME_FAIL, OUTCOME_PASS, PhaseEvent, PhaseStatus};
use crate::core::schema::PhaseSchema;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

pub const ENTRY_FORMAT_HINT: &str =
    "Entry format: {sid: <step>, p: <PHASE>, s: EXECUTED|SKIPPED, d: PASS|FAIL|<PREFIX>: <reason>, t: <ISO-8601>}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompletionErrorType {
    /// No events at all for the step.
    SilentCompletion,
    AbandonedPhase,
    IncompletePhase,
    InvalidSkip,
    MultipleErrors,
}

impl CompletionErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SilentCompletion => "SILENT_COMPLETION",
            Self::AbandonedPhase => "ABANDONED_PHASE",
            Self::IncompletePhase => "INCOMPLETE_PHASE",
            Self::InvalidSkip => "INVALID_SKIP",
            Self::MultipleErrors => "MULTIPLE_ERRORS",
        }
    }
}

impl fmt::Display for CompletionErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct CompletionResult {
    pub is_valid: bool,
    pub missing_phases: Vec<String>,
    pub incomplete_phases: Vec<String>,
    pub invalid_skips: Vec<String>,
    pub error_messages: Vec<String>,
    pub recovery_suggestions: Vec<String>,
    pub error_type: Option<CompletionErrorType>,
}

impl CompletionResult {
    fn valid() -> Self {
        Self {
            is_valid: true,
            ..Self::default()
        }
    }
}

#[derive(Default)]
struct Findings {
    missing: Vec<String>,
    incomplete: Vec<String>,
    invalid_skips: Vec<String>,
    messages: Vec<String>,
}

pub struct CompletionValidator {
    schema: Arc<PhaseSchema>,
}

impl CompletionValidator {
    pub fn new(schema: Arc<PhaseSchema>) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &PhaseSchema {
        &self.schema
    }

    /// Validate the events of one step, in trace order.
    pub fn validate(&self, events: &[PhaseEvent]) -> CompletionResult {
        if events.is_empty() {
            return self.silent_completion();
        }

        // Re-executions append, so the latest entry for a phase is authoritative.
        let mut latest: FxHashMap<&str, &PhaseEvent> = FxHashMap::default();
        for event in events {
            latest.insert(event.phase_name.as_str(), event);
        }

        let mut findings = Findings::default();
        for phase in self.schema.phases() {
            match latest.get(phase.as_str()) {
                None => findings.missing.push(phase.clone()),
                Some(event) => self.check_phase(phase, event, &mut findings),
            }
        }

        if !findings.missing.is_empty() {
            findings
                .messages
                .push(format!("Missing phases: {}", findings.missing.join(", ")));
        }

        if findings.messages.is_empty() {
            return CompletionResult::valid();
        }

        let error_type = classify(&findings);
        let recovery_suggestions = self.recovery_for(&findings);
        CompletionResult {
            is_valid: false,
            missing_phases: findings.missing,
            incomplete_phases: findings.incomplete,
            invalid_skips: findings.invalid_skips,
            error_messages: findings.messages,
            recovery_suggestions,
            error_type: Some(error_type),
        }
    }

    fn silent_completion(&self) -> CompletionResult {
        let all = self.schema.phases().join(", ");
        CompletionResult {
            is_valid: false,
            missing_phases: self.schema.phases().to_vec(),
            incomplete_phases: Vec::new(),
            invalid_skips: Vec::new(),
            error_messages: vec![
                "Agent completed without recording any phase in the execution log".to_string(),
                format!("Missing phases: {}", all),
            ],
            recovery_suggestions: vec![
                "Check the agent transcript for errors that prevented execution".to_string(),
                "Verify the agent received the correct step id and execution log path".to_string(),
                format!("Resume execution to complete all phases: {}", all),
                ENTRY_FORMAT_HINT.to_string(),
            ],
            error_type: Some(CompletionErrorType::SilentCompletion),
        }
    }

    fn check_phase(&self, phase: &str, event: &PhaseEvent, findings: &mut Findings) {
        if !self.schema.is_valid_status(&event.status) {
            findings.messages.push(format!(
                "{}: Invalid status '{}' (must be: {})",
                phase,
                event.status,
                self.schema.valid_statuses().join(", ")
            ));
            return;
        }
        match event.status_kind() {
            Some(PhaseStatus::Executed) => self.check_executed(phase, &event.outcome, findings),
            Some(PhaseStatus::Skipped) => self.check_skipped(phase, &event.outcome, findings),
            _ => {
                findings.messages.push(format!(
                    "{}: Phase did not finish (status {}); it must end EXECUTED or SKIPPED",
                    phase, event.status
                ));
            }
        }
    }

    fn check_executed(&self, phase: &str, outcome: &str, findings: &mut Findings) {
        if outcome != OUTCOME_PASS && outcome != OUTCOME_FAIL {
            findings.incomplete.push(phase.to_string());
            findings.messages.push(format!(
                "{}: Invalid outcome '{}' (must be PASS or FAIL)",
                phase, outcome
            ));
        } else if self.schema.is_terminal(phase) && outcome != OUTCOME_PASS {
            findings.incomplete.push(phase.to_string());
            findings.messages.push(format!(
                "{}: Terminal phase must have outcome PASS (not {})",
                phase, outcome
            ));
        }
    }

    fn check_skipped(&self, phase: &str, reason: &str, findings: &mut Findings) {
        let mut invalid = false;
        if !self.schema.permits_skip(reason) {
            invalid = true;
            findings.messages.push(format!(
                "{}: Invalid skip reason '{}' (must start with: {})",
                phase,
                reason,
                self.schema.valid_skip_prefixes().join(", ")
            ));
        }
        if self.schema.blocks_skip(reason) {
            invalid = true;
            findings.messages.push(format!(
                "{}: Skip reason '{}' blocks completion ({} skips are never accepted)",
                phase,
                reason,
                self.schema.blocking_skip_prefixes().join("/")
            ));
        }
        if invalid {
            findings.invalid_skips.push(phase.to_string());
        }
    }

    fn recovery_for(&self, findings: &Findings) -> Vec<String> {
        let mut out = Vec::new();
        if !findings.missing.is_empty() {
            out.push(format!(
                "Resume execution to complete missing phases: {}",
                findings.missing.join(", ")
            ));
        }
        if !findings.incomplete.is_empty() {
            out.push(format!(
                "Re-run and record PASS/FAIL for: {}",
                findings.incomplete.join(", ")
            ));
            let terminal: Vec<&str> = findings
                .incomplete
                .iter()
                .filter(|p| self.schema.is_terminal(p))
                .map(String::as_str)
                .collect();
            if !terminal.is_empty() {
                out.push(format!(
                    "Terminal phase(s) {} must finish with PASS before the step can complete",
                    terminal.join(", ")
                ));
            }
        }
        if !findings.invalid_skips.is_empty() {
            out.push(format!(
                "Execute {} or skip with an accepted reason prefix ({})",
                findings.invalid_skips.join(", "),
                self.schema.valid_skip_prefixes().join(", ")
            ));
        }
        let status_only = findings.missing.is_empty()
            && findings.incomplete.is_empty()
            && findings.invalid_skips.is_empty();
        if status_only {
            out.push(format!(
                "Record a final EXECUTED or SKIPPED entry for every phase ({})",
                self.schema.phases().join(", ")
            ));
        }
        out.push(ENTRY_FORMAT_HINT.to_string());
        out
    }
}

fn classify(findings: &Findings) -> CompletionErrorType {
    let missing = !findings.missing.is_empty();
    let incomplete = !findings.incomplete.is_empty();
    let skips = !findings.invalid_skips.is_empty();
    match (missing, incomplete, skips) {
        (true, false, false) => CompletionErrorType::AbandonedPhase,
        (false, true, false) => CompletionErrorType::IncompletePhase,
        (false, false, true) => CompletionErrorType::InvalidSkip,
        _ => CompletionErrorType::MultipleErrors,
    }
}
