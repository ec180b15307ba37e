//! Companion daemon: keeps one instance's heartbeat fresh, sweeps stale
//! locks on a schedule, rotates the audit trail and answers status requests
//! on a per-context Unix socket.

mod error;
pub mod audit_rotation;
pub mod protocol;
mod runtime;

pub use error::DaemonError;
pub use protocol::{
    request_ping, request_status, request_stop, request_sweep, DaemonClient, DaemonRequest,
    DaemonResponse,
};
pub use runtime::{run, start_blocking, DaemonState};

/// Env var selecting `json` log lines instead of the human format.
pub const ENV_LOG_FORMAT: &str = "COHORT_LOG_FORMAT";

/// Install the global tracing subscriber once.
///
/// `RUST_LOG` wins; otherwise `default_level` applies. Logs go to stderr so
/// stdout stays free for machine-readable output.
pub fn init_tracing(default_level: &str) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let json = std::env::var(ENV_LOG_FORMAT).is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let builder = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
