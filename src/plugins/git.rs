//! Git-backed checks run after a step claims completion.
//!
//! Commit verification looks for a commit carrying the step trailer
//! (`Step-ID: 01-01`). Scope checking compares the working tree diff
//! against allowed glob patterns. Every git call is bounded by a timeout.

use crate::core::error::GateError;
use regex::Regex;
use serde::Serialize;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::warn;

pub const DEFAULT_TRAILER: &str = "Step-ID";
pub const DEFAULT_GIT_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommitVerification {
    pub verified: bool,
    pub commit_hash: Option<String>,
    pub commit_date: Option<String>,
    pub commit_subject: Option<String>,
    pub error_reason: Option<String>,
}

impl CommitVerification {
    pub fn not_verified(reason: impl Into<String>) -> Self {
        Self {
            verified: false,
            error_reason: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Parse one `%H|%ai|%s` line.
    pub fn from_log_line(line: &str) -> Self {
        let mut parts = line.splitn(3, '|');
        let mut next = || parts.next().map(str::to_string);
        Self {
            verified: true,
            commit_hash: next(),
            commit_date: next(),
            commit_subject: next(),
            error_reason: None,
        }
    }
}

pub trait CommitVerifier {
    fn verify_commit(&self, step_id: &str, cwd: &Path) -> Result<CommitVerification, GateError>;

    /// Trailer key the verifier searches for.
    fn trailer(&self) -> &str {
        DEFAULT_TRAILER
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScopeCheckResult {
    pub has_violations: bool,
    pub out_of_scope_files: Vec<String>,
    pub skipped: bool,
    pub skip_reason: Option<String>,
}

impl ScopeCheckResult {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            skipped: true,
            skip_reason: Some(reason.into()),
            ..Self::default()
        }
    }
}

pub trait ScopeChecker {
    fn check_scope(&self, project_root: &Path, allowed_patterns: &[String]) -> ScopeCheckResult;
}

/// Run git in `repo_root`, killing it once `timeout` passes.
pub fn run_git(repo_root: &Path, args: &[&str], timeout: Duration) -> Result<String, String> {
    let mut child = Command::new("git")
        .args(args)
        .current_dir(repo_root)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("git failed: {}", e))?;

    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(format!("git timed out after {}s", timeout.as_secs()));
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(e) => return Err(format!("git failed: {}", e)),
        }
    };

    let collect = |handle: Option<thread::JoinHandle<String>>| {
        handle.and_then(|h| h.join().ok()).unwrap_or_default()
    };
    let out = collect(stdout);
    let err = collect(stderr);
    if !status.success() {
        return Err(format!("git failed: {}", err.trim()));
    }
    Ok(out.trim().to_string())
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

#[derive(Debug, Clone)]
pub struct GitCommitVerifier {
    trailer: String,
    timeout: Duration,
}

impl Default for GitCommitVerifier {
    fn default() -> Self {
        Self::new(DEFAULT_TRAILER, DEFAULT_GIT_TIMEOUT)
    }
}

impl GitCommitVerifier {
    pub fn new(trailer: &str, timeout: Duration) -> Self {
        Self {
            trailer: trailer.to_string(),
            timeout,
        }
    }
}

impl CommitVerifier for GitCommitVerifier {
    fn verify_commit(&self, step_id: &str, cwd: &Path) -> Result<CommitVerification, GateError> {
        let grep = format!("--grep={}: {}", self.trailer, step_id);
        let args = ["log", "--format=%H|%ai|%s", grep.as_str(), "-1"];
        match run_git(cwd, &args, self.timeout) {
            Ok(out) if out.is_empty() => Ok(CommitVerification::not_verified(format!(
                "No commit found with {}: {}",
                self.trailer, step_id
            ))),
            Ok(out) => Ok(CommitVerification::from_log_line(out.lines().next().unwrap_or_default())),
            Err(reason) => {
                warn!(step_id, cwd = %cwd.display(), %reason, "commit verification failed");
                Err(GateError::ValidationError(reason))
            }
        }
    }

    fn trailer(&self) -> &str {
        &self.trailer
    }
}

#[derive(Debug, Clone)]
pub struct GitScopeChecker {
    timeout: Duration,
}

impl Default for GitScopeChecker {
    fn default() -> Self {
        Self::new(DEFAULT_GIT_TIMEOUT)
    }
}

impl GitScopeChecker {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl ScopeChecker for GitScopeChecker {
    fn check_scope(&self, project_root: &Path, allowed_patterns: &[String]) -> ScopeCheckResult {
        let modified = match run_git(project_root, &["diff", "--name-only", "HEAD"], self.timeout) {
            Ok(out) => out,
            Err(reason) => {
                warn!(root = %project_root.display(), %reason, "scope check skipped");
                return ScopeCheckResult::skipped(reason);
            }
        };

        let matchers: Vec<Regex> = allowed_patterns.iter().filter_map(|p| glob_regex(p)).collect();
        let out_of_scope: Vec<String> = modified
            .lines()
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .filter(|f| !matchers.iter().any(|re| re.is_match(f)))
            .map(str::to_string)
            .collect();

        ScopeCheckResult {
            has_violations: !out_of_scope.is_empty(),
            out_of_scope_files: out_of_scope,
            skipped: false,
            skip_reason: None,
        }
    }
}

/// True when `path` matches the fnmatch-style `pattern`.
pub fn glob_match(pattern: &str, path: &str) -> bool {
    glob_regex(pattern).is_some_and(|re| re.is_match(path))
}

/// Translate an fnmatch pattern into an anchored regex.
///
/// `*` matches any run of characters including `/`, `?` one character,
/// `[...]` a class (`[!...]` negated). A leading `**/` may also match
/// nothing, so `**/*.rs` covers `main.rs`.
fn glob_regex(pattern: &str) -> Option<Regex> {
    let (optional_root, body) = match pattern.strip_prefix("**/") {
        Some(rest) => (true, rest),
        None => (false, pattern),
    };

    let mut re = String::from("^");
    if optional_root {
        re.push_str("(?:.*/)?");
    }
    let chars: Vec<char> = body.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            '[' => match chars[i + 1..].iter().position(|c| *c == ']') {
                Some(len) if len > 0 => {
                    let class: String = chars[i + 1..i + 1 + len].iter().collect();
                    let class = match class.strip_prefix('!') {
                        Some(rest) => format!("^{}", rest),
                        None => class,
                    };
                    re.push('[');
                    re.push_str(&class.replace('\\', "\\\\"));
                    re.push(']');
                    i += len + 1;
                }
                _ => re.push_str("\\["),
            },
            c => re.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }
    re.push('$');
    Regex::new(&re).ok()
}
