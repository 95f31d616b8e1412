//! Schema-driven entity views, compiled to a SQL syntax tree and rendered.

pub mod compile;
pub mod sql;

pub use compile::{EntityViewPlan, ViewVariant};

/// Resolved state across every version, including pending buffered writes.
pub const STATE_ALL_VIEW: &str = "state_all";
/// Per-commit entity history rooted at every version tip. `depth` ranks the changes of
/// one entity under one root commit, newest first, so depth 0 is the current change.
pub const STATE_HISTORY_VIEW: &str = "state_history";
pub const ACTIVE_VERSION_TABLE: &str = "internal_active_version";
/// Transaction buffer that generated write triggers stage into.
pub const TRANSACTION_STATE_TABLE: &str = "internal_transaction_state";
