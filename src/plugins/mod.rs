//! Checks that reach outside the trace: git history, working tree scope
//! and delivery across a whole roadmap.

pub mod delivery;
pub mod git;
