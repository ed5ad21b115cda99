//! Stop decision: may an agent that claims a step is done actually stop?
//!
//! Runs identity, integrity, completion, commit and scope checks in that
//! order and turns the outcome into an allow/block [`HookDecision`].
//! Everything observed along the way goes to the audit sink.

use crate::core::audit::{AuditEvent, AuditEventType, AuditSink};
use crate::core::clock::{Clock, now_timestamp};
use crate::core::completion::CompletionValidator;
use crate::core::correction::{self, AppliedCorrection};
use crate::core::error::TraceAccessError;
use crate::core::event::PhaseEvent;
use crate::core::integrity::{DEFAULT_SKEW_TOLERANCE_SECS, IntegrityValidator};
use crate::core::schema::PhaseSchema;
use crate::core::trace_log::TraceStore;
use crate::plugins::git::{CommitVerification, CommitVerifier, ScopeChecker};
use serde::Serialize;
use std::any::Any;
use std::ffi::OsStr;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const EXIT_ALLOW: i32 = 0;
pub const EXIT_BLOCK: i32 = 2;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopContext {
    pub log_path: PathBuf,
    pub project_id: String,
    pub step_id: String,
    /// Set when the agent already tried to stop once and was blocked.
    pub stop_hook_active: bool,
    pub cwd: Option<PathBuf>,
    pub task_start_time: Option<String>,
    pub turns_used: Option<u64>,
    pub tokens_used: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HookAction {
    Allow,
    Block,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HookDecision {
    pub action: HookAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub exit_code: i32,
    pub recovery_suggestions: Vec<String>,
}

impl HookDecision {
    pub fn allow() -> Self {
        Self {
            action: HookAction::Allow,
            reason: None,
            exit_code: EXIT_ALLOW,
            recovery_suggestions: Vec::new(),
        }
    }

    pub fn block(reason: impl Into<String>, recovery_suggestions: Vec<String>) -> Self {
        Self {
            action: HookAction::Block,
            reason: Some(reason.into()),
            exit_code: EXIT_BLOCK,
            recovery_suggestions,
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.action == HookAction::Allow
    }
}

pub struct StopDecisionService<'a> {
    store: &'a dyn TraceStore,
    schema: Arc<PhaseSchema>,
    audit: &'a dyn AuditSink,
    clock: &'a dyn Clock,
    commit_verifier: Option<&'a dyn CommitVerifier>,
    scope_checker: Option<&'a dyn ScopeChecker>,
    skew_tolerance_secs: u64,
    scope_patterns: Vec<String>,
}

impl<'a> StopDecisionService<'a> {
    pub fn new(
        store: &'a dyn TraceStore,
        schema: Arc<PhaseSchema>,
        audit: &'a dyn AuditSink,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            store,
            schema,
            audit,
            clock,
            commit_verifier: None,
            scope_checker: None,
            skew_tolerance_secs: DEFAULT_SKEW_TOLERANCE_SECS as u64,
            scope_patterns: vec!["**/*".to_string()],
        }
    }

    pub fn with_commit_verifier(mut self, verifier: &'a dyn CommitVerifier) -> Self {
        self.commit_verifier = Some(verifier);
        self
    }

    pub fn with_scope_checker(mut self, checker: &'a dyn ScopeChecker) -> Self {
        self.scope_checker = Some(checker);
        self
    }

    pub fn with_skew_tolerance(mut self, secs: u64) -> Self {
        self.skew_tolerance_secs = secs;
        self
    }

    pub fn with_scope_patterns(mut self, patterns: Vec<String>) -> Self {
        self.scope_patterns = patterns;
        self
    }

    /// Decide whether the agent may stop. Never panics and never errors:
    /// internal failures become a block decision.
    pub fn decide(&self, ctx: &StopContext, hook_id: Option<&str>) -> HookDecision {
        match panic::catch_unwind(AssertUnwindSafe(|| self.evaluate(ctx, hook_id))) {
            Ok(decision) => decision,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(step_id = %ctx.step_id, error = %message, "stop evaluation failed");
                self.emit(
                    self.event(AuditEventType::HookSubagentStopError, ctx, hook_id)
                        .with("error", message.clone()),
                );
                HookDecision::block(
                    format!("Stop validation failed internally: {}", message),
                    vec![
                        "Retry the stop; the step was not validated".to_string(),
                        "Inspect the audit log for HOOK_SUBAGENT_STOP_ERROR records".to_string(),
                    ],
                )
            }
        }
    }

    fn evaluate(&self, ctx: &StopContext, hook_id: Option<&str>) -> HookDecision {
        debug!(step_id = %ctx.step_id, log = %ctx.log_path.display(), "identity check");
        if let Some(blocked) = self.check_identity(ctx) {
            return blocked;
        }

        let events = match self.store.read_step_events(&ctx.log_path, &ctx.step_id) {
            Ok(events) => events,
            Err(e) => {
                return HookDecision::block(
                    format!("Failed to read step events: {}", e),
                    vec![format!("Check the integrity of {}", ctx.log_path.display())],
                );
            }
        };

        debug!(step_id = %ctx.step_id, "integrity correction");
        let events = if self.correct_integrity(ctx, hook_id) {
            self.store
                .read_step_events(&ctx.log_path, &ctx.step_id)
                .unwrap_or(events)
        } else {
            events
        };

        debug!(step_id = %ctx.step_id, events = events.len(), "completion check");
        if let Some(decision) = self.check_completion(ctx, hook_id, &events) {
            return decision;
        }

        if let Some(blocked) = self.check_commit(ctx, hook_id) {
            return blocked;
        }

        self.check_scope(ctx, hook_id);

        info!(step_id = %ctx.step_id, "step completion passed");
        self.emit(self.with_stats(
            self.event(AuditEventType::HookSubagentStopPassed, ctx, hook_id),
            ctx,
        ));
        HookDecision::allow()
    }

    fn check_identity(&self, ctx: &StopContext) -> Option<HookDecision> {
        let log = ctx.log_path.display();
        let found = match self.store.read_project_id(&ctx.log_path) {
            Ok(found) => found,
            Err(TraceAccessError::NotFound { .. }) => {
                return Some(HookDecision::block(
                    format!("Execution log not found: {}", log),
                    vec![
                        format!("Create the execution log at {}", log),
                        "Run the orchestrator to initialize the log".to_string(),
                    ],
                ));
            }
            Err(TraceAccessError::Corrupt { detail, .. }) => {
                return Some(HookDecision::block(
                    format!("Invalid execution log: {}", detail),
                    vec![format!("Fix the YAML syntax of {}", log)],
                ));
            }
        };

        if found.as_deref() == Some(ctx.project_id.as_str()) {
            return None;
        }
        Some(HookDecision::block(
            format!(
                "Project ID mismatch: expected '{}', found '{}'",
                ctx.project_id,
                found.as_deref().unwrap_or("<none>")
            ),
            vec![
                format!("Verify you are working on project '{}'", ctx.project_id),
                format!("Check the project_id recorded in {}", log),
            ],
        ))
    }

    /// Returns true when the trace was rewritten.
    fn correct_integrity(&self, ctx: &StopContext, hook_id: Option<&str>) -> bool {
        let Ok(mut doc) = self.store.load(&ctx.log_path) else {
            return false;
        };
        let now = self.clock.now_utc();
        let validator =
            IntegrityValidator::new(Arc::clone(&self.schema)).with_skew_tolerance(self.skew_tolerance_secs);
        let result = validator.validate(
            &ctx.step_id,
            &doc.indexed_events(),
            ctx.task_start_time.as_deref(),
            now,
        );

        let mut applied: Vec<AppliedCorrection> = Vec::new();
        if !result.correctable_entries.is_empty() {
            let planned = correction::apply_corrections(
                &mut doc.events,
                &result.correctable_entries,
                ctx.task_start_time.as_deref(),
                now,
            );
            if !planned.is_empty() {
                match self.store.save(&ctx.log_path, &doc) {
                    Ok(()) => applied = planned,
                    Err(e) => warn!(step_id = %ctx.step_id, error = %e, "corrected trace not saved"),
                }
            }
        }

        for fix in &applied {
            info!(
                step_id = %ctx.step_id,
                index = fix.index,
                phase = %fix.phase_name,
                "timestamp corrected"
            );
            self.emit(
                self.event(AuditEventType::LogIntegrityCorrected, ctx, hook_id)
                    .with("phase", fix.phase_name.clone())
                    .with("original_timestamp", fix.original_timestamp.clone())
                    .with("corrected_timestamp", fix.corrected_timestamp.clone())
                    .with("reason", fix.reason.as_str()),
            );
        }

        let corrected: Vec<usize> = applied.iter().map(|a| a.index).collect();
        for warning in result.warnings_excluding(&corrected) {
            debug!(step_id = %ctx.step_id, warning = %warning, "integrity warning");
            self.emit(
                self.event(AuditEventType::LogIntegrityWarning, ctx, hook_id)
                    .with("warning", warning.message.clone()),
            );
        }
        !applied.is_empty()
    }

    fn check_completion(
        &self,
        ctx: &StopContext,
        hook_id: Option<&str>,
        events: &[PhaseEvent],
    ) -> Option<HookDecision> {
        let completion = CompletionValidator::new(Arc::clone(&self.schema)).validate(events);
        if completion.is_valid {
            return None;
        }

        let mut failed = self
            .event(AuditEventType::HookSubagentStopFailed, ctx, hook_id)
            .with("validation_errors", completion.error_messages.clone());
        if let Some(kind) = completion.error_type {
            failed = failed.with("error_type", kind.as_str());
        }

        if ctx.stop_hook_active {
            warn!(step_id = %ctx.step_id, "completion invalid on repeat stop; allowing");
            self.emit(self.with_stats(failed.with("allowed_despite_failure", true), ctx));
            return Some(HookDecision::allow());
        }

        info!(step_id = %ctx.step_id, "completion invalid; blocking");
        self.emit(self.with_stats(failed, ctx));
        let reason = if completion.error_messages.is_empty() {
            "Validation failed".to_string()
        } else {
            completion.error_messages.join("; ")
        };
        Some(HookDecision::block(reason, completion.recovery_suggestions))
    }

    fn check_commit(&self, ctx: &StopContext, hook_id: Option<&str>) -> Option<HookDecision> {
        let (Some(cwd), Some(verifier)) = (ctx.cwd.as_deref(), self.commit_verifier) else {
            return None;
        };
        debug!(step_id = %ctx.step_id, cwd = %cwd.display(), "commit check");

        let verification = verifier
            .verify_commit(&ctx.step_id, cwd)
            .unwrap_or_else(|e| CommitVerification::not_verified(format!("Git verification error: {}", e)));

        if verification.verified {
            let event = self
                .event(AuditEventType::CommitVerified, ctx, hook_id)
                .with("commit_hash", verification.commit_hash.clone())
                .with("commit_date", verification.commit_date.clone())
                .with("commit_subject", verification.commit_subject.clone());
            self.emit(self.with_stats(event, ctx));
            return None;
        }

        let reason = verification
            .error_reason
            .unwrap_or_else(|| "commit not found".to_string());
        info!(step_id = %ctx.step_id, %reason, "commit not verified; blocking");
        self.emit(
            self.event(AuditEventType::CommitNotVerified, ctx, hook_id)
                .with("error_reason", reason.clone()),
        );
        Some(HookDecision::block(
            format!("COMMIT_NOT_VERIFIED: {}", reason),
            vec![
                format!(
                    "Create a git commit with trailer '{}: {}'",
                    verifier.trailer(),
                    ctx.step_id
                ),
                "Ensure the commit phase actually runs git commit".to_string(),
                "Check that git is available and the working directory is a repository".to_string(),
            ],
        ))
    }

    fn check_scope(&self, ctx: &StopContext, hook_id: Option<&str>) {
        let Some(checker) = self.scope_checker else {
            return;
        };
        let root = scope_root(ctx);
        debug!(step_id = %ctx.step_id, root = %root.display(), "scope check");

        let result = checker.check_scope(&root, &self.scope_patterns);
        if result.skipped {
            warn!(
                step_id = %ctx.step_id,
                reason = result.skip_reason.as_deref().unwrap_or("unknown"),
                "scope check skipped"
            );
            return;
        }
        for file in &result.out_of_scope_files {
            self.emit(
                self.event(AuditEventType::ScopeViolation, ctx, hook_id)
                    .with("out_of_scope_file", file.clone()),
            );
        }
    }

    fn event(&self, event_type: AuditEventType, ctx: &StopContext, hook_id: Option<&str>) -> AuditEvent {
        AuditEvent::new(event_type, now_timestamp(self.clock))
            .feature(Some(ctx.project_id.clone()))
            .step(ctx.step_id.clone())
            .hook(hook_id.map(str::to_string))
    }

    fn with_stats(&self, mut event: AuditEvent, ctx: &StopContext) -> AuditEvent {
        if let Some(turns) = ctx.turns_used {
            event = event.with("turns_used", turns);
        }
        if let Some(tokens) = ctx.tokens_used {
            event = event.with("tokens_used", tokens);
        }
        event
    }

    fn emit(&self, event: AuditEvent) {
        if let Err(e) = self.audit.log_event(&event) {
            warn!(event = %event.event_type, error = %e, "audit write failed");
        }
    }
}

/// Working directory when given, else the project root of a trace laid
/// out as `<root>/docs/feature/<id>/execution-log.yaml`. Any other layout
/// falls back to the trace's directory.
fn scope_root(ctx: &StopContext) -> PathBuf {
    if let Some(cwd) = &ctx.cwd {
        return cwd.clone();
    }
    let log_dir = ctx.log_path.parent().filter(|p| !p.as_os_str().is_empty());
    let feature_dir = log_dir.and_then(Path::parent).filter(|p| p.file_name() == Some(OsStr::new("feature")));
    let docs_dir = feature_dir.and_then(Path::parent).filter(|p| p.file_name() == Some(OsStr::new("docs")));
    let project_root = docs_dir.map(|docs| {
        docs.parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
    });
    project_root
        .or(log_dir)
        .unwrap_or(Path::new("."))
        .to_path_buf()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
