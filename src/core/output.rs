//! Text rendering for CLI results.
//!
//! JSON output is plain `serde_json` of the result types; these helpers
//! cover the human-readable form and keep long messages bounded.

use crate::core::correction::AppliedCorrection;
use crate::core::integrity::IntegrityResult;
use crate::core::schema::PhaseSchema;
use crate::core::stop::HookDecision;
use crate::plugins::delivery::DeliveryResult;
use colored::Colorize;

const MESSAGE_WIDTH: usize = 160;

/// Collapse newlines/extra whitespace and bound length for terminal display.
pub fn compact_line(input: &str, max_chars: usize) -> String {
    let collapsed = input.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut chars = collapsed.chars();
    let preview: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}...", preview)
    } else {
        preview
    }
}

fn bullets(out: &mut Vec<String>, items: impl IntoIterator<Item = impl AsRef<str>>) {
    for item in items {
        out.push(format!("  - {}", compact_line(item.as_ref(), MESSAGE_WIDTH)));
    }
}

pub fn render_decision(decision: &HookDecision) -> String {
    let mut out = Vec::new();
    if decision.is_allowed() {
        out.push(format!("{} step may stop", "ALLOW".green().bold()));
    } else {
        out.push(format!(
            "{} {}",
            "BLOCK".red().bold(),
            compact_line(decision.reason.as_deref().unwrap_or_default(), MESSAGE_WIDTH)
        ));
    }
    if !decision.recovery_suggestions.is_empty() {
        out.push("Recovery:".bold().to_string());
        bullets(&mut out, &decision.recovery_suggestions);
    }
    out.join("\n")
}

pub fn render_integrity(result: &IntegrityResult, applied: &[AppliedCorrection]) -> String {
    if result.is_clean() {
        return format!("{} no integrity anomalies", "OK".green().bold());
    }
    let mut out = Vec::new();
    if !result.warnings.is_empty() {
        out.push(format!("{} {} warning(s)", "WARN".yellow().bold(), result.warnings.len()));
        bullets(&mut out, result.warnings.iter().map(|w| w.message.as_str()));
    }
    if !result.correctable_entries.is_empty() {
        out.push(format!(
            "{} {} correctable",
            "FIX".yellow().bold(),
            result.correctable_entries.len()
        ));
        bullets(
            &mut out,
            result.correctable_entries.iter().map(|c| {
                format!("#{} {} {} ({})", c.index, c.phase_name, c.original_timestamp, c.reason)
            }),
        );
    }
    if !applied.is_empty() {
        out.push(format!("{} {} timestamp(s)", "FIXED".cyan().bold(), applied.len()));
        bullets(
            &mut out,
            applied.iter().map(|a| {
                format!("#{} {}: {} -> {}", a.index, a.phase_name, a.original_timestamp, a.corrected_timestamp)
            }),
        );
    }
    out.join("\n")
}

pub fn render_delivery(result: &DeliveryResult, expected_phases: usize) -> String {
    if result.is_valid {
        return format!(
            "{} all {} step(s) have complete traces",
            "OK".green().bold(),
            result.steps_verified
        );
    }
    let mut out = vec![format!(
        "{} {}",
        "INTEGRITY VIOLATIONS".red().bold(),
        result.reason.as_deref().unwrap_or_default()
    )];
    bullets(
        &mut out,
        result.violations.iter().map(|v| {
            format!(
                "{}: {}/{} phases, missing: {}",
                v.step_id,
                v.phase_count,
                expected_phases,
                v.missing_phases.join(", ")
            )
        }),
    );
    out.join("\n")
}

pub fn render_schema(schema: &PhaseSchema) -> String {
    let mut out = vec![format!(
        "schema {} ({} phases)",
        schema.schema_version().bold(),
        schema.total_phases()
    )];
    for (i, phase) in schema.phases().iter().enumerate() {
        let marker = if schema.is_terminal(phase) { " (terminal)" } else { "" };
        out.push(format!("  {}. {}{}", i + 1, phase, marker));
    }
    out.push(format!("skip prefixes: {}", schema.valid_skip_prefixes().join(", ")));
    out.push(format!("blocking prefixes: {}", schema.blocking_skip_prefixes().join(", ")));
    out.join("\n")
}
