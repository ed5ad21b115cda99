//! Delivery integrity: every planned step must have a full phase cycle
//! in the trace before a feature is finalized.

use crate::core::error::GateError;
use crate::core::trace_log::TraceDocument;
use serde::Serialize;
use serde_yaml::Value;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepIntegrity {
    pub step_id: String,
    pub has_execution_log: bool,
    pub phase_count: usize,
    pub missing_phases: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryResult {
    pub is_valid: bool,
    pub steps_verified: usize,
    pub violations: Vec<StepIntegrity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub struct DeliveryVerifier {
    required_phases: Vec<String>,
}

impl DeliveryVerifier {
    pub fn new(required_phases: &[String]) -> Self {
        Self {
            required_phases: required_phases.to_vec(),
        }
    }

    pub fn verify(&self, step_ids: &[String], trace: &TraceDocument) -> DeliveryResult {
        let violations: Vec<StepIntegrity> = step_ids
            .iter()
            .filter_map(|step_id| {
                let logged = trace.phases_logged(step_id);
                let missing: Vec<String> = self
                    .required_phases
                    .iter()
                    .filter(|p| !logged.contains(p))
                    .cloned()
                    .collect();
                (!missing.is_empty()).then(|| StepIntegrity {
                    step_id: step_id.clone(),
                    has_execution_log: !logged.is_empty(),
                    phase_count: self.required_phases.len() - missing.len(),
                    missing_phases: missing,
                })
            })
            .collect();

        let reason = (!violations.is_empty()).then(|| self.summarize(&violations));
        DeliveryResult {
            is_valid: violations.is_empty(),
            steps_verified: step_ids.len(),
            violations,
            reason,
        }
    }

    fn summarize(&self, violations: &[StepIntegrity]) -> String {
        let (untraced, partial): (Vec<&StepIntegrity>, Vec<&StepIntegrity>) =
            violations.iter().partition(|v| !v.has_execution_log);

        let mut parts = Vec::new();
        if !untraced.is_empty() {
            let ids: Vec<&str> = untraced.iter().map(|v| v.step_id.as_str()).collect();
            parts.push(format!(
                "{} step(s) have no execution log entries: {}",
                untraced.len(),
                ids.join(", ")
            ));
        }
        if !partial.is_empty() {
            let expected = self.required_phases.len();
            let ids: Vec<String> = partial
                .iter()
                .map(|v| format!("{} ({}/{})", v.step_id, v.phase_count, expected))
                .collect();
            parts.push(format!(
                "{} step(s) have incomplete phase cycles: {}",
                partial.len(),
                ids.join(", ")
            ));
        }
        parts.join("; ")
    }
}

/// Step ids listed in a roadmap document.
///
/// Reads a top-level `steps` list, or `phases[].steps` when there is
/// none; each step names itself with `id` or `step_id`.
pub fn roadmap_step_ids(roadmap: &Value) -> Vec<String> {
    fn ids(steps: Option<&Value>, out: &mut Vec<String>) {
        let Some(steps) = steps.and_then(Value::as_sequence) else {
            return;
        };
        for step in steps {
            let id = step.get("id").or_else(|| step.get("step_id"));
            match id {
                Some(Value::String(s)) if !s.is_empty() => out.push(s.clone()),
                Some(Value::Number(n)) => out.push(n.to_string()),
                _ => {}
            }
        }
    }

    let mut out = Vec::new();
    if roadmap.get("steps").is_some() {
        ids(roadmap.get("steps"), &mut out);
    } else if let Some(phases) = roadmap.get("phases").and_then(Value::as_sequence) {
        for phase in phases {
            ids(phase.get("steps"), &mut out);
        }
    }
    out
}

pub fn load_roadmap_step_ids(path: &Path) -> Result<Vec<String>, GateError> {
    if !path.exists() {
        return Err(GateError::NotFound(format!("roadmap not found: {}", path.display())));
    }
    let content = fs::read_to_string(path).map_err(GateError::IoError)?;
    let roadmap: Value = serde_yaml::from_str(&content)?;
    Ok(roadmap_step_ids(&roadmap))
}
