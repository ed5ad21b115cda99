//! CLI struct definitions for the phasegate command-line interface.
//!
//! All clap-derived types live here. Dispatch logic lives in `lib.rs`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "phasegate",
    version = env!("CARGO_PKG_VERSION"),
    about = "Validates TDD execution traces and decides whether an agent may stop."
)]
pub(crate) struct Cli {
    /// Project root holding `.phasegate/config.toml` (defaults to the current directory).
    #[clap(long, global = true)]
    pub root: Option<PathBuf>,
    /// Phase schema JSON; overrides config and the built-in schema.
    #[clap(long, global = true)]
    pub schema: Option<PathBuf>,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Decide whether an agent may stop after claiming a step is done
    Stop(StopCli),
    /// Report trace anomalies for a step, optionally rewriting bad timestamps
    Integrity(IntegrityCli),
    /// Append a phase entry with the current UTC timestamp
    LogPhase(LogPhaseCli),
    /// Check that every delivered step has a full phase cycle
    VerifyDelivery(VerifyDeliveryCli),
    /// Print the active phase schema
    Schema(SchemaCli),
}

#[derive(clap::Args, Debug)]
pub(crate) struct StopCli {
    /// Execution log (YAML trace).
    #[clap(long)]
    pub log: PathBuf,
    #[clap(long)]
    pub project_id: String,
    #[clap(long)]
    pub step_id: String,
    /// The agent was already blocked once for this step.
    #[clap(long)]
    pub stop_hook_active: bool,
    /// Working directory for commit and scope checks.
    #[clap(long)]
    pub cwd: Option<PathBuf>,
    /// When the task started (ISO-8601).
    #[clap(long)]
    pub task_start: Option<String>,
    #[clap(long)]
    pub turns_used: Option<u64>,
    #[clap(long)]
    pub tokens_used: Option<u64>,
    /// Audit directory; overrides env and config.
    #[clap(long)]
    pub audit_dir: Option<PathBuf>,
    /// Output format: 'text' or 'json'.
    #[clap(long, default_value = "text")]
    pub format: String,
}

#[derive(clap::Args, Debug)]
pub(crate) struct IntegrityCli {
    #[clap(long)]
    pub log: PathBuf,
    #[clap(long)]
    pub step_id: String,
    /// When the task started (ISO-8601).
    #[clap(long)]
    pub task_start: Option<String>,
    /// Rewrite correctable timestamps in place.
    #[clap(long)]
    pub fix: bool,
    /// Output format: 'text' or 'json'.
    #[clap(long, default_value = "text")]
    pub format: String,
}

#[derive(clap::Args, Debug)]
pub(crate) struct LogPhaseCli {
    #[clap(long)]
    pub log: PathBuf,
    #[clap(long)]
    pub step_id: String,
    #[clap(long)]
    pub phase: String,
    /// EXECUTED or SKIPPED.
    #[clap(long)]
    pub status: String,
    /// PASS, FAIL, or a prefixed skip reason.
    #[clap(long)]
    pub data: String,
    #[clap(long)]
    pub turns_used: Option<u64>,
    #[clap(long)]
    pub tokens_used: Option<u64>,
}

#[derive(clap::Args, Debug)]
pub(crate) struct VerifyDeliveryCli {
    #[clap(long)]
    pub log: PathBuf,
    /// Step expected to be delivered (repeatable).
    #[clap(long = "step")]
    pub steps: Vec<String>,
    /// Roadmap YAML listing the steps.
    #[clap(long)]
    pub roadmap: Option<PathBuf>,
    /// Output format: 'text' or 'json'.
    #[clap(long, default_value = "text")]
    pub format: String,
}

#[derive(clap::Args, Debug)]
pub(crate) struct SchemaCli {
    /// Output format: 'text' or 'json'.
    #[clap(long, default_value = "text")]
    pub format: String,
}
