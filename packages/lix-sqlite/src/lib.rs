#![forbid(unsafe_code)]
//! SQLite storage and engine for Lix.
//!
//! [`Lix`] owns one `rusqlite` connection. The change log, commit graph, versions and
//! journal live in append-only tables; the state cache is a set of per-schema tables
//! derived from them; `state`, `state_all`, `state_history` and the generated entity
//! views are plain SQL views over the cache and the transaction buffer.

mod buffer;
mod cache;
mod catalog;
mod change_log;
mod commit;
mod engine;
mod files;
mod graph;
mod journal;
mod observer;
mod schema;
mod version;

pub use commit::CommitSummary;
pub use engine::{CreateVersion, InheritsFrom, Lix, Transaction};
pub use observer::ObserverId;

pub use lix_core;
