//! `cohort daemon`: companion process lifecycle.

use anyhow::{Context, Result};
use clap::Subcommand;

use cohort_core::paths::socket_path;
use cohort_daemon::{request_status, request_stop, request_sweep, start_blocking, DaemonError};

use super::{print_json, GlobalArgs};

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Run in the foreground: heartbeat, scheduled sweeps, socket server.
    Start,
    /// Request graceful shutdown over the Unix socket.
    Stop,
    /// Query runtime status over the Unix socket.
    Status,
    /// Ask the running daemon to sweep now.
    Sweep,
}

pub fn run(command: DaemonCommand, global: &GlobalArgs) -> Result<()> {
    let coord = global.coordinator()?;
    let socket = socket_path(&coord.config().coordination_dir, coord.context());

    match command {
        DaemonCommand::Start => {
            start_blocking(coord).context("daemon exited with error")?;
        }
        DaemonCommand::Stop => match request_stop(&socket) {
            Ok(()) => println!("daemon stop requested"),
            Err(DaemonError::DaemonNotRunning { .. }) => println!("daemon is not running"),
            Err(err) => return Err(err).context("failed to stop daemon"),
        },
        DaemonCommand::Status => match request_status(&socket) {
            Ok(status) => print_json(&status)?,
            Err(DaemonError::DaemonNotRunning { .. }) => print_json(&serde_json::json!({
                "running": false,
                "socket": socket.display().to_string(),
            }))?,
            Err(err) => return Err(err).context("failed to query daemon status"),
        },
        DaemonCommand::Sweep => match request_sweep(&socket) {
            Ok(report) => print_json(&report)?,
            Err(DaemonError::DaemonNotRunning { .. }) => println!("daemon is not running"),
            Err(err) => return Err(err).context("failed to request sweep"),
        },
    }
    Ok(())
}
