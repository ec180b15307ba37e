//! Cohort: file coordination between concurrent agent instances.
//!
//! # Usage
//!
//! ```text
//! cohort register | deregister | heartbeat | instances
//! cohort acquire <path> [--type read|write] [--ttl <secs>] [--intent <text>]
//! cohort release <path>
//! cohort extend <path> [--ttl <secs>]
//! cohort status <path> | info <path> | locks [--all]
//! cohort cleanup | audit [--limit <n>]
//! cohort decision record|pending|mark-synced
//! cohort work claim|complete|list
//! cohort mail send|drain
//! cohort daemon start|stop|status
//! ```
//!
//! Global flags: `--root`, `--session`, `--pid`, `--json`.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    daemon::DaemonCommand,
    instance::{DeregisterArgs, HeartbeatArgs, InstancesArgs, RegisterArgs},
    journal::{DecisionCommand, WorkCommand},
    lock::{AcquireArgs, ExtendArgs, InfoArgs, LocksArgs, ReleaseArgs, StatusArgs},
    mail::MailCommand,
    maintenance::{AuditArgs, CleanupArgs},
    GlobalArgs,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "cohort",
    version,
    about = "Coordinate file access between concurrent agent instances",
    long_about = None,
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register (or re-adopt) the instance of this session.
    Register(RegisterArgs),

    /// Release all locks and retire the instance of this session.
    Deregister(DeregisterArgs),

    /// Refresh this instance's heartbeat.
    Heartbeat(HeartbeatArgs),

    /// Claim a file.
    Acquire(AcquireArgs),

    /// Release a claimed file.
    Release(ReleaseArgs),

    /// Push out the expiry of a held lock.
    Extend(ExtendArgs),

    /// Show whether a file is locked and by whom.
    Status(StatusArgs),

    /// Print the stored lock record of a file.
    Info(InfoArgs),

    /// List lock records.
    Locks(LocksArgs),

    /// List known instances and their liveness.
    Instances(InstancesArgs),

    /// Release locks of dead instances and purge expired ones.
    Cleanup(CleanupArgs),

    /// Show recent audit events.
    Audit(AuditArgs),

    /// Record and sync decisions.
    Decision {
        #[command(subcommand)]
        command: DecisionCommand,
    },

    /// Claim and complete work.
    Work {
        #[command(subcommand)]
        command: WorkCommand,
    },

    /// Send and drain inter-instance messages (sqlite backend).
    Mail {
        #[command(subcommand)]
        command: MailCommand,
    },

    /// Run or query the companion daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    if !matches!(cli.command, Commands::Daemon { .. }) {
        cohort_daemon::init_tracing("warn");
    }
    let global = cli.global;
    match cli.command {
        Commands::Register(args) => args.run(&global),
        Commands::Deregister(args) => args.run(&global),
        Commands::Heartbeat(args) => args.run(&global),
        Commands::Acquire(args) => args.run(&global),
        Commands::Release(args) => args.run(&global),
        Commands::Extend(args) => args.run(&global),
        Commands::Status(args) => args.run(&global),
        Commands::Info(args) => args.run(&global),
        Commands::Locks(args) => args.run(&global),
        Commands::Instances(args) => args.run(&global),
        Commands::Cleanup(args) => args.run(&global),
        Commands::Audit(args) => args.run(&global),
        Commands::Decision { command } => commands::journal::run_decision(command, &global),
        Commands::Work { command } => commands::journal::run_work(command, &global),
        Commands::Mail { command } => commands::mail::run(command, &global),
        Commands::Daemon { command } => commands::daemon::run(command, &global),
    }
}
