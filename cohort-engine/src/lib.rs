//! Cohort coordination engine.
//!
//! Lets independent processes working on one checkout claim files without a
//! lock server:
//!
//! - [`identity`]: stable per-context instance ids, re-adopted while the
//!   owning process lives
//! - [`heartbeat`]: liveness pings and the stale-lock sweep
//! - [`manager`]: acquire / release / extend / inspect with the conflict policy
//! - [`coordinator`]: the call surface adapters use, wiring the above to one
//!   store and one clock

pub mod coordinator;
pub mod error;
pub mod heartbeat;
pub mod identity;
pub mod manager;

pub use coordinator::Coordinator;
pub use error::CoordError;
pub use heartbeat::{HeartbeatMonitor, InstanceLiveness, SweepReport};
pub use identity::{context_key, is_pid_alive, Identity, Registration};
pub use manager::{AcquireOutcome, DenyReason, LockManager, LockStatus, ReleaseOutcome};

use cohort_core::AuditEvent;
use cohort_store::LockStore;

/// Append to the audit trail. A failed append is logged, never surfaced:
/// the operation it describes has already happened.
pub(crate) fn record_audit(store: &dyn LockStore, event: AuditEvent) {
    if let Err(e) = store.append_audit(&event) {
        tracing::warn!(
            action = event.action_type.as_str(),
            target = %event.target_id,
            error = %e,
            "failed to append audit event"
        );
    }
}
