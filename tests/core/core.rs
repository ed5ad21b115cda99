use phasegate::core::audit::{AuditEventType, JsonlAuditSink, MemoryAuditSink};
use phasegate::core::clock::FixedClock;
use phasegate::core::completion::{CompletionErrorType, CompletionValidator};
use phasegate::core::error::GateError;
use phasegate::core::event::{RawEntry, parse_pipe};
use phasegate::core::schema::PhaseSchema;
use phasegate::core::stop::{EXIT_BLOCK, StopContext, StopDecisionService};
use phasegate::core::trace_log::{MemoryTraceStore, TraceDocument, TraceStore, YamlTraceStore};
use phasegate::plugins::git::{CommitVerification, CommitVerifier, ScopeCheckResult, ScopeChecker};
use serde_json::{Value, json};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use tempfile::tempdir;

const LOG: &str = "/repo/docs/feature/demo/execution-log.yaml";
const NOW: &str = "2026-02-02T12:00:00Z";
const PHASES: [&str; 5] = ["PREPARE", "RED_ACCEPTANCE", "RED_UNIT", "GREEN", "COMMIT"];

fn schema() -> Arc<PhaseSchema> {
    Arc::new(PhaseSchema::builtin().unwrap())
}

fn full_cycle(step: &str) -> Vec<String> {
    PHASES
        .iter()
        .enumerate()
        .map(|(i, p)| format!("{step}|{p}|EXECUTED|PASS|2026-02-02T10:{:02}:00Z", i * 10))
        .collect()
}

fn trace(project: &str, lines: &[String]) -> TraceDocument {
    let mut doc = TraceDocument::with_project(project);
    doc.events = lines.iter().map(|l| RawEntry::from(l.as_str())).collect();
    doc
}

fn ctx() -> StopContext {
    StopContext {
        log_path: PathBuf::from(LOG),
        project_id: "demo".to_string(),
        step_id: "01-01".to_string(),
        ..StopContext::default()
    }
}

struct StubVerifier(Result<CommitVerification, String>);

impl CommitVerifier for StubVerifier {
    fn verify_commit(&self, _step_id: &str, _cwd: &Path) -> Result<CommitVerification, GateError> {
        self.0.clone().map_err(GateError::ValidationError)
    }
}

struct PanickingVerifier;

impl CommitVerifier for PanickingVerifier {
    fn verify_commit(&self, _step_id: &str, _cwd: &Path) -> Result<CommitVerification, GateError> {
        panic!("verifier exploded")
    }
}

struct StubScope(Vec<&'static str>);

impl ScopeChecker for StubScope {
    fn check_scope(&self, _root: &Path, _patterns: &[String]) -> ScopeCheckResult {
        ScopeCheckResult {
            has_violations: !self.0.is_empty(),
            out_of_scope_files: self.0.iter().map(|s| s.to_string()).collect(),
            skipped: false,
            skip_reason: None,
        }
    }
}

#[derive(Default)]
struct RecordingScope(Mutex<Vec<PathBuf>>);

impl ScopeChecker for RecordingScope {
    fn check_scope(&self, root: &Path, _patterns: &[String]) -> ScopeCheckResult {
        self.0.lock().unwrap().push(root.to_path_buf());
        ScopeCheckResult {
            has_violations: false,
            out_of_scope_files: Vec::new(),
            skipped: false,
            skip_reason: None,
        }
    }
}

fn timestamps_of(doc: &TraceDocument, step: &str) -> Vec<String> {
    doc.step_events(step).into_iter().map(|e| e.timestamp).collect()
}

fn verified() -> CommitVerification {
    CommitVerification::from_log_line("abc123|2026-02-02 11:00:00 +0000|feat: step 01-01")
}

#[test]
fn complete_cycle_is_allowed_and_audited() {
    let store = MemoryTraceStore::new();
    store.insert(LOG, trace("demo", &full_cycle("01-01")));
    let audit = MemoryAuditSink::new();
    let clock = FixedClock::at(NOW);

    let mut context = ctx();
    context.turns_used = Some(12);
    context.tokens_used = Some(3400);
    let decision = StopDecisionService::new(&store, schema(), &audit, &clock).decide(&context, Some("hook-1"));

    assert!(decision.is_allowed());
    assert_eq!(decision.exit_code, 0);
    let passed = audit.of_type(AuditEventType::HookSubagentStopPassed);
    assert_eq!(passed.len(), 1);
    let record = passed[0].to_record();
    assert_eq!(record["step_id"], json!("01-01"));
    assert_eq!(record["feature_name"], json!("demo"));
    assert_eq!(record["hook_id"], json!("hook-1"));
    assert_eq!(record["turns_used"], json!(12));
    assert_eq!(record["tokens_used"], json!(3400));
    assert_eq!(record["timestamp"], json!(NOW));
}

#[test]
fn identity_failures_block_with_specific_reasons() {
    let store = MemoryTraceStore::new();
    let audit = MemoryAuditSink::new();
    let clock = FixedClock::at(NOW);
    let service = StopDecisionService::new(&store, schema(), &audit, &clock);

    let missing = service.decide(&ctx(), None);
    assert_eq!(missing.exit_code, EXIT_BLOCK);
    assert_eq!(missing.reason.as_deref(), Some(format!("Execution log not found: {LOG}").as_str()));

    store.insert_corrupt(LOG, "invalid YAML: mapping values are not allowed");
    let corrupt = service.decide(&ctx(), None);
    assert!(corrupt.reason.unwrap().starts_with("Invalid execution log: invalid YAML"));

    store.insert(LOG, trace("other", &full_cycle("01-01")));
    let mismatch = service.decide(&ctx(), None);
    assert_eq!(
        mismatch.reason.as_deref(),
        Some("Project ID mismatch: expected 'demo', found 'other'")
    );

    store.insert(LOG, TraceDocument::default());
    let absent = service.decide(&ctx(), None);
    assert_eq!(
        absent.reason.as_deref(),
        Some("Project ID mismatch: expected 'demo', found '<none>'")
    );
    assert!(audit.events().is_empty());
}

#[test]
fn silent_completion_blocks() {
    let store = MemoryTraceStore::new();
    store.insert(LOG, trace("demo", &full_cycle("02-01")));
    let audit = MemoryAuditSink::new();
    let clock = FixedClock::at(NOW);

    let decision = StopDecisionService::new(&store, schema(), &audit, &clock).decide(&ctx(), None);

    assert!(!decision.is_allowed());
    assert!(decision.reason.unwrap().starts_with("Agent completed without recording any phase"));
    assert_eq!(decision.recovery_suggestions.len(), 4);
    let failed = audit.of_type(AuditEventType::HookSubagentStopFailed);
    assert_eq!(failed[0].get("error_type"), Some(&json!("SILENT_COMPLETION")));
}

#[test]
fn repeat_stop_is_allowed_despite_failure() {
    let store = MemoryTraceStore::new();
    let mut lines = full_cycle("01-01");
    lines.truncate(3);
    store.insert(LOG, trace("demo", &lines));
    let audit = MemoryAuditSink::new();
    let clock = FixedClock::at(NOW);
    let service = StopDecisionService::new(&store, schema(), &audit, &clock);

    let first = service.decide(&ctx(), None);
    assert_eq!(first.reason.as_deref(), Some("Missing phases: GREEN, COMMIT"));

    let mut again = ctx();
    again.stop_hook_active = true;
    let second = service.decide(&again, None);
    assert!(second.is_allowed());

    let failed = audit.of_type(AuditEventType::HookSubagentStopFailed);
    assert_eq!(failed.len(), 2);
    assert_eq!(failed[0].get("allowed_despite_failure"), None);
    assert_eq!(failed[1].get("allowed_despite_failure"), Some(&json!(true)));
    assert_eq!(failed[1].get("error_type"), Some(&json!("ABANDONED_PHASE")));
    assert!(audit.of_type(AuditEventType::HookSubagentStopPassed).is_empty());
}

#[test]
fn future_timestamp_is_corrected_before_completion() {
    let store = MemoryTraceStore::new();
    let mut lines = full_cycle("01-01");
    lines[3] = "01-01|GREEN|EXECUTED|PASS|2026-02-03T00:00:00Z".to_string();
    store.insert(LOG, trace("demo", &lines));
    let audit = MemoryAuditSink::new();
    let clock = FixedClock::at(NOW);

    let decision = StopDecisionService::new(&store, schema(), &audit, &clock).decide(&ctx(), None);
    assert!(decision.is_allowed());

    let saved = store.document(Path::new(LOG)).unwrap();
    assert_eq!(
        saved.events[3],
        RawEntry::from("01-01|GREEN|EXECUTED|PASS|2026-02-02T11:59:59Z")
    );
    assert_eq!(saved.events[0], RawEntry::from(lines[0].as_str()));

    let corrected = audit.of_type(AuditEventType::LogIntegrityCorrected);
    assert_eq!(corrected.len(), 1);
    assert_eq!(corrected[0].get("phase"), Some(&json!("GREEN")));
    assert_eq!(corrected[0].get("reason"), Some(&json!("future")));
    assert_eq!(corrected[0].get("original_timestamp"), Some(&json!("2026-02-03T00:00:00Z")));
    // A corrected entry does not also surface as a warning.
    assert!(audit.of_type(AuditEventType::LogIntegrityWarning).is_empty());
}

#[test]
fn pre_task_entries_are_spread_inside_the_task_window() {
    let store = MemoryTraceStore::new();
    let mut lines = full_cycle("01-01");
    lines[0] = "01-01|PREPARE|EXECUTED|PASS|2026-02-01T08:00:00Z".to_string();
    lines[1] = "01-01|RED_ACCEPTANCE|EXECUTED|PASS|2026-02-01T08:05:00Z".to_string();
    lines[4] = "01-01|COMMIT|EXECUTED|PASS|2026-02-09T00:00:00Z".to_string();
    store.insert(LOG, trace("demo", &lines));
    let audit = MemoryAuditSink::new();
    let clock = FixedClock::at(NOW);

    let mut context = ctx();
    context.task_start_time = Some("2026-02-02T10:00:00Z".to_string());
    let decision = StopDecisionService::new(&store, schema(), &audit, &clock).decide(&context, None);
    assert!(decision.is_allowed());

    let corrected: Vec<Value> = audit
        .of_type(AuditEventType::LogIntegrityCorrected)
        .iter()
        .filter_map(|e| e.get("corrected_timestamp").cloned())
        .collect();
    assert_eq!(
        corrected,
        vec![
            json!("2026-02-02T10:30:00Z"),
            json!("2026-02-02T11:00:00Z"),
            json!("2026-02-02T11:30:00Z"),
        ]
    );

    let saved = store.document(Path::new(LOG)).unwrap();
    let stamps = timestamps_of(&saved, "01-01");
    assert_eq!(stamps[0], "2026-02-02T10:30:00Z");
    assert_eq!(stamps[1], "2026-02-02T11:00:00Z");
    assert_eq!(stamps[4], "2026-02-02T11:30:00Z");
    assert_eq!(stamps[2], "2026-02-02T10:20:00Z");

    // The saved trace passes a second stop cleanly.
    let second = MemoryAuditSink::new();
    let again = StopDecisionService::new(&store, schema(), &second, &clock).decide(&context, None);
    assert!(again.is_allowed());
    assert!(second.of_type(AuditEventType::LogIntegrityCorrected).is_empty());
    assert!(second.of_type(AuditEventType::LogIntegrityWarning).is_empty());
    assert_eq!(store.document(Path::new(LOG)).unwrap(), saved);
}

#[test]
fn many_future_entries_without_start_stay_ordered_and_past() {
    let store = MemoryTraceStore::new();
    let mut lines = full_cycle("01-01");
    for (i, line) in lines.iter_mut().enumerate().skip(2) {
        *line = format!("01-01|{}|EXECUTED|PASS|2026-03-0{}T00:00:00Z", PHASES[i], i);
    }
    store.insert(LOG, trace("demo", &lines));
    let audit = MemoryAuditSink::new();
    let clock = FixedClock::at(NOW);

    let decision = StopDecisionService::new(&store, schema(), &audit, &clock).decide(&ctx(), None);
    assert!(decision.is_allowed());

    let stamps = timestamps_of(&store.document(Path::new(LOG)).unwrap(), "01-01");
    let now = phasegate::core::clock::parse_timestamp(NOW).unwrap();
    let corrected: Vec<_> = stamps[2..]
        .iter()
        .map(|t| phasegate::core::clock::parse_timestamp(t).unwrap())
        .collect();
    assert_eq!(corrected.len(), 3);
    assert!(corrected.windows(2).all(|w| w[0] < w[1]));
    assert!(corrected.iter().all(|t| *t < now));
    assert_eq!(stamps[2], "2026-02-02T11:59:57Z");
    assert_eq!(audit.of_type(AuditEventType::LogIntegrityCorrected).len(), 3);
}

#[test]
fn task_start_after_now_leaves_trace_untouched() {
    let store = MemoryTraceStore::new();
    let mut lines = full_cycle("01-01");
    lines[3] = "01-01|GREEN|EXECUTED|PASS|2026-02-02T12:30:00Z".to_string();
    store.insert(LOG, trace("demo", &lines));
    let before = store.document(Path::new(LOG)).unwrap();
    let audit = MemoryAuditSink::new();
    let clock = FixedClock::at(NOW);

    let mut context = ctx();
    context.task_start_time = Some("2026-02-02T13:00:00Z".to_string());
    let decision = StopDecisionService::new(&store, schema(), &audit, &clock).decide(&context, None);

    assert!(decision.is_allowed());
    assert_eq!(store.document(Path::new(LOG)).unwrap(), before);
    assert!(audit.of_type(AuditEventType::LogIntegrityCorrected).is_empty());
    let warnings: Vec<Value> = audit
        .of_type(AuditEventType::LogIntegrityWarning)
        .iter()
        .filter_map(|e| e.get("warning").cloned())
        .collect();
    assert_eq!(warnings.len(), 5);
    assert!(warnings.contains(&json!("Future timestamp on GREEN: 2026-02-02T12:30:00Z")));
    assert!(warnings.contains(&json!("Pre-task timestamp on PREPARE: 2026-02-02T10:00:00Z")));
}

#[test]
fn unsaved_correction_surfaces_as_warning() {
    let store = MemoryTraceStore::new();
    let mut lines = full_cycle("01-01");
    lines[3] = "01-01|GREEN|EXECUTED|PASS|2026-02-03T00:00:00Z".to_string();
    store.insert(LOG, trace("demo", &lines));
    store.reject_saves(true);
    let audit = MemoryAuditSink::new();
    let clock = FixedClock::at(NOW);

    let decision = StopDecisionService::new(&store, schema(), &audit, &clock).decide(&ctx(), None);

    assert!(decision.is_allowed());
    assert!(audit.of_type(AuditEventType::LogIntegrityCorrected).is_empty());
    let warnings = audit.of_type(AuditEventType::LogIntegrityWarning);
    assert_eq!(
        warnings[0].get("warning"),
        Some(&json!("Future timestamp on GREEN: 2026-02-03T00:00:00Z"))
    );
}

#[test]
fn integrity_warnings_never_block() {
    let store = MemoryTraceStore::new();
    let mut lines = full_cycle("01-01");
    lines.push("01-01|GREN|EXECUTED|PASS|2026-02-02T10:45:00Z".to_string());
    lines.push("02-01|PREPARE|EXECUTED|PASS|2026-02-02T10:30:00Z".to_string());
    store.insert(LOG, trace("demo", &lines));
    let audit = MemoryAuditSink::new();
    let clock = FixedClock::at(NOW);

    let mut context = ctx();
    context.task_start_time = Some("2026-02-02T09:59:00Z".to_string());
    let decision = StopDecisionService::new(&store, schema(), &audit, &clock).decide(&context, None);

    assert!(decision.is_allowed());
    let messages: Vec<Value> = audit
        .of_type(AuditEventType::LogIntegrityWarning)
        .iter()
        .filter_map(|e| e.get("warning").cloned())
        .collect();
    assert_eq!(
        messages,
        vec![
            json!("Unrecognized phase name 'GREN' (did you mean 'GREEN'?)"),
            json!("Foreign step_id '02-01' has events written during task window"),
        ]
    );
}

#[test]
fn audit_failure_does_not_change_the_decision() {
    let store = MemoryTraceStore::new();
    store.insert(LOG, trace("demo", &full_cycle("01-01")));
    let audit = MemoryAuditSink::failing();
    let clock = FixedClock::at(NOW);
    let service = StopDecisionService::new(&store, schema(), &audit, &clock);

    assert!(service.decide(&ctx(), None).is_allowed());

    store.insert(LOG, trace("demo", &[]));
    assert!(!service.decide(&ctx(), None).is_allowed());
}

#[test]
fn commit_check_is_fail_closed() {
    let store = MemoryTraceStore::new();
    store.insert(LOG, trace("demo", &full_cycle("01-01")));
    let clock = FixedClock::at(NOW);
    let mut context = ctx();
    context.cwd = Some(PathBuf::from("/repo"));

    let audit = MemoryAuditSink::new();
    let missing = StubVerifier(Ok(CommitVerification::not_verified("No commit found with Step-ID: 01-01")));
    let decision = StopDecisionService::new(&store, schema(), &audit, &clock)
        .with_commit_verifier(&missing)
        .decide(&context, None);
    assert_eq!(
        decision.reason.as_deref(),
        Some("COMMIT_NOT_VERIFIED: No commit found with Step-ID: 01-01")
    );
    assert_eq!(
        decision.recovery_suggestions[0],
        "Create a git commit with trailer 'Step-ID: 01-01'"
    );
    assert_eq!(audit.of_type(AuditEventType::CommitNotVerified).len(), 1);

    let audit = MemoryAuditSink::new();
    let broken = StubVerifier(Err("git timed out after 5s".to_string()));
    let decision = StopDecisionService::new(&store, schema(), &audit, &clock)
        .with_commit_verifier(&broken)
        .decide(&context, None);
    assert!(!decision.is_allowed());
    assert!(decision.reason.unwrap().contains("Git verification error"));

    let audit = MemoryAuditSink::new();
    let found = StubVerifier(Ok(verified()));
    let decision = StopDecisionService::new(&store, schema(), &audit, &clock)
        .with_commit_verifier(&found)
        .decide(&context, None);
    assert!(decision.is_allowed());
    let record = audit.of_type(AuditEventType::CommitVerified)[0].to_record();
    assert_eq!(record["commit_hash"], json!("abc123"));
    assert_eq!(record["commit_subject"], json!("feat: step 01-01"));
}

#[test]
fn commit_check_needs_a_working_directory() {
    let store = MemoryTraceStore::new();
    store.insert(LOG, trace("demo", &full_cycle("01-01")));
    let audit = MemoryAuditSink::new();
    let clock = FixedClock::at(NOW);
    let missing = StubVerifier(Ok(CommitVerification::not_verified("nothing")));

    let decision = StopDecisionService::new(&store, schema(), &audit, &clock)
        .with_commit_verifier(&missing)
        .decide(&ctx(), None);

    assert!(decision.is_allowed());
    assert!(audit.of_type(AuditEventType::CommitNotVerified).is_empty());
}

#[test]
fn scope_violations_are_recorded_but_allowed() {
    let store = MemoryTraceStore::new();
    store.insert(LOG, trace("demo", &full_cycle("01-01")));
    let audit = MemoryAuditSink::new();
    let clock = FixedClock::at(NOW);
    let scope = StubScope(vec!["Cargo.lock", "secrets.env"]);

    let decision = StopDecisionService::new(&store, schema(), &audit, &clock)
        .with_scope_checker(&scope)
        .with_scope_patterns(vec!["src/**".to_string()])
        .decide(&ctx(), None);

    assert!(decision.is_allowed());
    let files: Vec<Value> = audit
        .of_type(AuditEventType::ScopeViolation)
        .iter()
        .filter_map(|e| e.get("out_of_scope_file").cloned())
        .collect();
    assert_eq!(files, vec![json!("Cargo.lock"), json!("secrets.env")]);
}

#[test]
fn scope_check_runs_from_the_project_root() {
    let store = MemoryTraceStore::new();
    store.insert(LOG, trace("demo", &full_cycle("01-01")));
    let audit = MemoryAuditSink::new();
    let clock = FixedClock::at(NOW);
    let scope = RecordingScope::default();

    let service = StopDecisionService::new(&store, schema(), &audit, &clock).with_scope_checker(&scope);
    assert!(service.decide(&ctx(), None).is_allowed());

    let mut context = ctx();
    context.cwd = Some(PathBuf::from("/work"));
    assert!(service.decide(&context, None).is_allowed());

    assert_eq!(
        *scope.0.lock().unwrap(),
        vec![PathBuf::from("/repo"), PathBuf::from("/work")]
    );
}

#[test]
fn internal_failure_blocks_and_is_audited() {
    let store = MemoryTraceStore::new();
    store.insert(LOG, trace("demo", &full_cycle("01-01")));
    let audit = MemoryAuditSink::new();
    let clock = FixedClock::at(NOW);
    let mut context = ctx();
    context.cwd = Some(PathBuf::from("/repo"));

    let decision = StopDecisionService::new(&store, schema(), &audit, &clock)
        .with_commit_verifier(&PanickingVerifier)
        .decide(&context, Some("hook-9"));

    assert_eq!(decision.exit_code, EXIT_BLOCK);
    assert_eq!(
        decision.reason.as_deref(),
        Some("Stop validation failed internally: verifier exploded")
    );
    let errors = audit.of_type(AuditEventType::HookSubagentStopError);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].hook_id.as_deref(), Some("hook-9"));
}

#[test]
fn reexecution_replaces_earlier_outcome() {
    let validator = CompletionValidator::new(schema());
    let mut events: Vec<_> = full_cycle("01-01").iter().filter_map(|l| parse_pipe(l)).collect();
    events.insert(0, parse_pipe("01-01|COMMIT|EXECUTED|FAIL|2026-02-02T09:00:00Z").unwrap());
    assert!(validator.validate(&events).is_valid);

    events.push(parse_pipe("01-01|COMMIT|EXECUTED|FAIL|2026-02-02T11:00:00Z").unwrap());
    let result = validator.validate(&events);
    assert!(!result.is_valid);
    assert_eq!(result.error_type, Some(CompletionErrorType::IncompletePhase));
    assert_eq!(result.incomplete_phases, vec!["COMMIT"]);
}

#[test]
fn completion_is_independent_of_other_steps() {
    let validator = CompletionValidator::new(schema());
    let doc = trace("demo", &[full_cycle("01-01"), full_cycle("01-02")].concat());
    assert!(validator.validate(&doc.step_events("01-01")).is_valid);
    assert!(validator.validate(&doc.step_events("01-02")).is_valid);
    assert_eq!(
        validator.validate(&doc.step_events("01-03")).error_type,
        Some(CompletionErrorType::SilentCompletion)
    );
}

#[test]
fn yaml_trace_round_trip_preserves_unknown_content() {
    let dir = tempdir().unwrap();
    let log = dir.path().join("execution-log.yaml");
    fs::write(
        &log,
        "project_id: demo\nowner: team-a\nevents:\n  - \"01-01|PREPARE|EXECUTED|PASS|2026-02-02T10:00:00Z\"\n  - {sid: \"01-01\", p: GREEN, s: EXECUTED, d: PASS, t: \"2026-02-02T10:10:00Z\"}\n  - 17\n",
    )
    .unwrap();

    let store = YamlTraceStore::new();
    let doc = store.load(&log).unwrap();
    assert_eq!(doc.events.len(), 3);
    assert_eq!(doc.step_events("01-01").len(), 2);
    store.save(&log, &doc).unwrap();

    let reloaded = store.load(&log).unwrap();
    assert_eq!(reloaded, doc);
    assert_eq!(reloaded.extra.get("owner"), Some(&serde_yaml::Value::from("team-a")));
}

#[test]
fn stop_against_yaml_files_writes_daily_audit() {
    let dir = tempdir().unwrap();
    let log = dir.path().join("execution-log.yaml");
    let mut lines = full_cycle("01-01");
    lines[4] = "01-01|COMMIT|EXECUTED|PASS|2026-02-03T00:00:00Z".to_string();
    YamlTraceStore::new().save(&log, &trace("demo", &lines)).unwrap();

    let store = YamlTraceStore::new();
    let audit = JsonlAuditSink::new(dir.path().join("audit"));
    let clock = FixedClock::at(NOW);
    let mut context = ctx();
    context.log_path = log.clone();

    let decision = StopDecisionService::new(&store, schema(), &audit, &clock).decide(&context, None);
    assert!(decision.is_allowed());

    let text = fs::read_to_string(&log).unwrap();
    assert!(text.contains("01-01|COMMIT|EXECUTED|PASS|2026-02-02T11:59:59Z"));
    assert!(!text.contains("2026-02-03"));

    let audit_text = fs::read_to_string(dir.path().join("audit/audit-2026-02-02.log")).unwrap();
    let kinds: Vec<String> = audit_text
        .lines()
        .map(|l| serde_json::from_str::<Value>(l).unwrap()["event"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(kinds, vec!["LOG_INTEGRITY_CORRECTED", "HOOK_SUBAGENT_STOP_PASSED"]);
}

fn phasegate(root: &Path, args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_phasegate"))
        .arg("--root")
        .arg(root)
        .args(args)
        .env_remove("PHASEGATE_SCHEMA_PATH")
        .env_remove("PHASEGATE_AUDIT_LOG_DIR")
        .env("PHASEGATE_AUDIT_LOGGING_ENABLED", "false")
        .output()
        .unwrap()
}

#[test]
fn cli_log_phase_then_stop() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    let log = root.join("execution-log.yaml");
    fs::write(&log, "project_id: demo\nevents: []\n").unwrap();
    let log_arg = log.to_str().unwrap();

    let stop = |root: &Path| {
        phasegate(
            root,
            &["stop", "--log", log_arg, "--project-id", "demo", "--step-id", "01-01", "--format", "json"],
        )
    };

    let blocked = stop(root);
    assert_eq!(blocked.status.code(), Some(2));
    let body: Value = serde_json::from_slice(&blocked.stdout).unwrap();
    assert_eq!(body["action"], json!("block"));

    for phase in PHASES {
        let out = phasegate(
            root,
            &["log-phase", "--log", log_arg, "--step-id", "01-01", "--phase", phase, "--status", "EXECUTED", "--data", "PASS"],
        );
        assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
        assert!(String::from_utf8_lossy(&out.stdout).starts_with(&format!("sid=01-01 p={phase} s=EXECUTED d=PASS t=")));
    }

    let allowed = stop(root);
    assert_eq!(allowed.status.code(), Some(0));
    let body: Value = serde_json::from_slice(&allowed.stdout).unwrap();
    assert_eq!(body["action"], json!("allow"));
    assert!(fs::read_to_string(&log).unwrap().contains("schema_version"));
}

#[test]
fn cli_log_phase_rejects_unprefixed_skip() {
    let dir = tempdir().unwrap();
    let log = dir.path().join("execution-log.yaml");
    fs::write(&log, "project_id: demo\nevents: []\n").unwrap();

    let out = phasegate(
        dir.path(),
        &["log-phase", "--log", log.to_str().unwrap(), "--step-id", "01-01", "--phase", "RED_UNIT", "--status", "SKIPPED", "--data", "too hard"],
    );

    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("SKIPPED status requires a valid skip prefix"));
    assert_eq!(fs::read_to_string(&log).unwrap(), "project_id: demo\nevents: []\n");
}

#[test]
fn cli_config_schema_override() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    fs::create_dir_all(root.join(".phasegate")).unwrap();
    fs::write(
        root.join("custom-schema.json"),
        r#"{"schema_version": "9.1",
            "tdd_cycle": {"phase_execution_log": [{"phase_name": "SPIKE"}, {"phase_name": "SHIP"}]},
            "phase_validation_rules": {"terminal_phases": {"phases": ["SHIP"]}}}"#,
    )
    .unwrap();
    fs::write(root.join(".phasegate/config.toml"), "schema_path = \"custom-schema.json\"\n").unwrap();

    let out = phasegate(root, &["schema", "--format", "json"]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let body: Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(body["schema_version"], json!("9.1"));
    assert_eq!(body["phases"], json!(["SPIKE", "SHIP"]));
}

#[test]
fn rerunning_integrity_after_correction_finds_nothing_new() {
    use phasegate::core::correction::apply_corrections;
    use phasegate::core::integrity::IntegrityValidator;

    let mut lines = full_cycle("01-01");
    lines[0] = "01-01|PREPARE|EXECUTED|PASS|2026-02-01T08:00:00Z".to_string();
    lines[4] = "01-01|COMMIT|EXECUTED|PASS|2026-02-09T00:00:00Z".to_string();
    let mut doc = trace("demo", &lines);
    let now = phasegate::core::clock::parse_timestamp(NOW).unwrap();
    let start = Some("2026-02-02T09:30:00Z");
    let validator = IntegrityValidator::new(schema());

    let first = validator.validate("01-01", &doc.indexed_events(), start, now);
    assert_eq!(first.correctable_entries.len(), 2);
    let applied = apply_corrections(&mut doc.events, &first.correctable_entries, start, now);
    assert_eq!(applied.len(), 2);

    let second = validator.validate("01-01", &doc.indexed_events(), start, now);
    assert!(second.correctable_entries.is_empty());
    assert!(second.is_clean());
}
