//! Core modules for phasegate's trace model and stop decision.
//!
//! Events, the phase schema, the validators and the trace store live
//! here; git-backed checks live in [`crate::plugins`].

pub mod audit;
pub mod clock;
pub mod completion;
pub mod config;
pub mod correction;
pub mod error;
pub mod event;
pub mod integrity;
pub mod output;
pub mod schema;
pub mod stop;
pub mod trace_log;
