//! phasegate: execution-trace validation for TDD-driven agents
//!
//! **phasegate decides whether an agent that claims a step is finished may
//! actually stop.**
//!
//! Agents record every TDD phase they run (PREPARE, RED_ACCEPTANCE,
//! RED_UNIT, GREEN, COMMIT by default) in a YAML execution trace. When the
//! agent stops, phasegate reads the trace, checks it against a declarative
//! phase schema and answers allow or block.
//!
//! # Checks
//!
//! - **Identity**: the trace belongs to the expected project
//! - **Integrity** (warn-only): unknown phase names, other steps writing
//!   during the task window, fabricated timestamps (rewritten in place)
//! - **Completion**: every schema phase ended EXECUTED/PASS|FAIL or with an
//!   accepted skip; the terminal phase passed
//! - **Commit** (fail-closed): a git commit carries the `Step-ID` trailer
//! - **Scope** (warn-only): modified files match the allowed patterns
//!
//! A second stop attempt after a block is allowed even when completion is
//! still invalid, so an agent can never loop forever; the failure is still
//! audited.
//!
//! # Examples
//!
//! ```bash
//! # Record a phase
//! phasegate log-phase --log execution-log.yaml --step-id 01-01 \
//!     --phase GREEN --status EXECUTED --data PASS
//!
//! # Decide at stop time (exit code 0 = allow, 2 = block)
//! phasegate stop --log execution-log.yaml --project-id demo --step-id 01-01
//! ```
//!
//! # Crate Structure
//!
//! - [`core`]: events, schema, validators, correction, trace store, audit, stop decision
//! - [`plugins`]: git commit/scope checks and delivery verification

mod cli;
pub mod core;
pub mod plugins;

use crate::cli::{Cli, Command, IntegrityCli, LogPhaseCli, SchemaCli, StopCli, VerifyDeliveryCli};
use crate::core::audit::{self, AuditEvent, AuditEventType};
use crate::core::clock::{Clock, SystemClock, new_hook_id, now_timestamp};
use crate::core::config::GateConfig;
use crate::core::error::GateError;
use crate::core::schema::{PhaseSchema, SchemaLoader};
use crate::core::stop::{StopContext, StopDecisionService};
use crate::core::trace_log::{PhaseRecord, TraceStore, YamlTraceStore};
use crate::core::{correction, integrity::IntegrityValidator, output, trace_log};
use crate::plugins::delivery::{self, DeliveryVerifier};
use crate::plugins::git::{GitCommitVerifier, GitScopeChecker};

use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Exit code for failed delivery verification.
pub const EXIT_VIOLATIONS: i32 = 1;

struct Session {
    root: PathBuf,
    config: GateConfig,
    schema: Arc<PhaseSchema>,
}

impl Session {
    fn open(root: Option<PathBuf>, schema_override: Option<PathBuf>) -> Result<Self, GateError> {
        let root = match root {
            Some(root) => root,
            None => std::env::current_dir()?,
        };
        let config = GateConfig::load(&root)?;
        let loader = match schema_override.or_else(|| config.schema_path.clone()) {
            Some(path) => SchemaLoader::from_path(path),
            None => SchemaLoader::builtin(),
        };
        let schema = loader.load()?;
        debug!(root = %root.display(), version = schema.schema_version(), "session opened");
        Ok(Self { root, config, schema })
    }
}

/// Parse arguments, run the command and return the process exit code.
pub fn run() -> Result<i32, GateError> {
    let cli = Cli::parse();
    let session = Session::open(cli.root, cli.schema)?;

    match cli.command {
        Command::Stop(args) => run_stop(&session, args),
        Command::Integrity(args) => run_integrity(&session, args),
        Command::LogPhase(args) => run_log_phase(&session, args),
        Command::VerifyDelivery(args) => run_verify_delivery(&session, args),
        Command::Schema(args) => run_schema(&session, args),
    }
}

fn emit<T: Serialize>(format: &str, value: &T, text: impl FnOnce() -> String) -> Result<(), GateError> {
    if format == "json" {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", text());
    }
    Ok(())
}

fn run_stop(session: &Session, args: StopCli) -> Result<i32, GateError> {
    let config = &session.config;
    let store = YamlTraceStore::new();
    let sink = audit::sink_for(config, args.audit_dir.as_deref(), &session.root);
    let clock = SystemClock;
    let timeout = Duration::from_secs(config.git_timeout_secs);
    let verifier = GitCommitVerifier::new(&config.commit_trailer, timeout);
    let scope = GitScopeChecker::new(timeout);

    let service = StopDecisionService::new(&store, Arc::clone(&session.schema), sink.as_ref(), &clock)
        .with_commit_verifier(&verifier)
        .with_scope_checker(&scope)
        .with_skew_tolerance(config.clock_skew_tolerance_secs)
        .with_scope_patterns(config.scope_allowed_patterns.clone());

    let ctx = StopContext {
        log_path: args.log,
        project_id: args.project_id,
        step_id: args.step_id,
        stop_hook_active: args.stop_hook_active,
        cwd: args.cwd,
        task_start_time: args.task_start,
        turns_used: args.turns_used,
        tokens_used: args.tokens_used,
    };
    let hook_id = new_hook_id();
    let decision = service.decide(&ctx, Some(&hook_id));
    emit(&args.format, &decision, || output::render_decision(&decision))?;
    Ok(decision.exit_code)
}

#[derive(Serialize)]
struct IntegrityReport {
    step_id: String,
    #[serde(flatten)]
    result: crate::core::integrity::IntegrityResult,
    corrections: Vec<correction::AppliedCorrection>,
}

fn run_integrity(session: &Session, args: IntegrityCli) -> Result<i32, GateError> {
    let store = YamlTraceStore::new();
    let mut doc = store.load(&args.log)?;
    let now = SystemClock.now_utc();
    let result = IntegrityValidator::new(Arc::clone(&session.schema))
        .with_skew_tolerance(session.config.clock_skew_tolerance_secs)
        .validate(&args.step_id, &doc.indexed_events(), args.task_start.as_deref(), now);

    let mut applied = Vec::new();
    if args.fix && !result.correctable_entries.is_empty() {
        applied = correction::apply_corrections(
            &mut doc.events,
            &result.correctable_entries,
            args.task_start.as_deref(),
            now,
        );
        if !applied.is_empty() {
            store.save(&args.log, &doc)?;
            let sink = audit::sink_for(&session.config, None, &session.root);
            for fix in &applied {
                let event = AuditEvent::new(AuditEventType::LogIntegrityCorrected, now_timestamp(&SystemClock))
                    .feature(doc.project_id.clone())
                    .step(args.step_id.clone())
                    .with("phase", fix.phase_name.clone())
                    .with("original_timestamp", fix.original_timestamp.clone())
                    .with("corrected_timestamp", fix.corrected_timestamp.clone())
                    .with("reason", fix.reason.as_str());
                if let Err(e) = sink.log_event(&event) {
                    tracing::warn!(error = %e, "audit write failed");
                }
            }
        }
    }

    let text = output::render_integrity(&result, &applied);
    let report = IntegrityReport {
        step_id: args.step_id,
        result,
        corrections: applied,
    };
    emit(&args.format, &report, || text)?;
    Ok(0)
}

fn run_log_phase(session: &Session, args: LogPhaseCli) -> Result<i32, GateError> {
    let record = PhaseRecord {
        step_id: args.step_id,
        phase: args.phase,
        status: args.status,
        data: args.data,
        turns_used: args.turns_used,
        tokens_used: args.tokens_used,
    };
    let written = trace_log::append_to_file(&args.log, &session.schema, &record)?;
    println!("{}", written.to_kv_line());
    Ok(0)
}

fn run_verify_delivery(session: &Session, args: VerifyDeliveryCli) -> Result<i32, GateError> {
    let mut steps = args.steps;
    if let Some(roadmap) = &args.roadmap {
        steps.extend(delivery::load_roadmap_step_ids(roadmap)?);
    }
    if steps.is_empty() {
        return Err(GateError::ValidationError(
            "no steps given; pass --step or --roadmap".to_string(),
        ));
    }
    let doc = YamlTraceStore::new().load(&args.log)?;
    let result = DeliveryVerifier::new(session.schema.phases()).verify(&steps, &doc);
    let expected = session.schema.phases().len();
    emit(&args.format, &result, || output::render_delivery(&result, expected))?;
    Ok(if result.is_valid { 0 } else { EXIT_VIOLATIONS })
}

fn run_schema(session: &Session, args: SchemaCli) -> Result<i32, GateError> {
    let schema = session.schema.as_ref();
    emit(&args.format, schema, || output::render_schema(schema))?;
    Ok(0)
}
