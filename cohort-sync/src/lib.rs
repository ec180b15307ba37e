//! # cohort-sync
//!
//! Append-only journals other tooling reads to reconcile cross-instance
//! state:
//!
//! - [`DecisionLog`]: recorded decisions waiting for an external sync
//! - [`WorkRegistry`]: which instance is working on what
//!
//! Both are JSONL files under the coordination directory. Every append holds
//! an exclusive lease on the journal file through the lock manager; entries
//! are never rewritten, state changes are further appended lines.

pub mod decisions;
pub mod error;
pub mod journal;
pub mod work;

pub use decisions::{DecisionEntry, DecisionLog, DecisionStatus};
pub use error::SyncError;
pub use journal::Journal;
pub use work::{WorkClaim, WorkRegistry, WorkStatus};
