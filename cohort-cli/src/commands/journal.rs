//! `cohort decision ...` and `cohort work ...`

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;

use cohort_sync::{DecisionLog, WorkRegistry};

use super::{print_json, GlobalArgs};

#[derive(Subcommand, Debug)]
pub enum DecisionCommand {
    /// Append a decision. The payload is JSON, or plain text stored as a string.
    Record(RecordArgs),
    /// List decisions not yet synced.
    Pending,
    /// Mark decisions as synced.
    MarkSynced(MarkSyncedArgs),
}

#[derive(Args, Debug)]
pub struct RecordArgs {
    pub payload: String,
}

#[derive(Args, Debug)]
pub struct MarkSyncedArgs {
    #[arg(required = true)]
    pub ids: Vec<String>,
}

pub fn run_decision(command: DecisionCommand, global: &GlobalArgs) -> Result<()> {
    let coord = global.coordinator()?;
    let log = DecisionLog::new(&coord);
    match command {
        DecisionCommand::Record(args) => {
            let payload = serde_json::from_str(&args.payload)
                .unwrap_or(serde_json::Value::String(args.payload));
            let entry = log
                .record_decision(payload)
                .context("failed to record decision")?;
            if global.json {
                return print_json(&entry);
            }
            println!("{} decision {}", "recorded".green(), entry.id);
        }
        DecisionCommand::Pending => {
            let pending = log.pending().context("failed to read decision log")?;
            if global.json {
                return print_json(&pending);
            }
            if pending.is_empty() {
                println!("No pending decisions.");
            }
            for entry in pending {
                println!(
                    "{} {} {}",
                    entry.id.bold(),
                    entry.instance_id,
                    serde_json::to_string(&entry.payload)?
                );
            }
        }
        DecisionCommand::MarkSynced(args) => {
            let marked = log
                .mark_synced(&args.ids)
                .context("failed to mark decisions synced")?;
            if global.json {
                return print_json(&serde_json::json!({ "marked": marked }));
            }
            println!("marked {marked} decision(s) synced");
        }
    }
    Ok(())
}

#[derive(Subcommand, Debug)]
pub enum WorkCommand {
    /// Claim a task, superseding this instance's previous claim.
    Claim(ClaimArgs),
    /// Complete this instance's active claim.
    Complete,
    /// List active claims across instances.
    List(ListArgs),
}

#[derive(Args, Debug)]
pub struct ClaimArgs {
    pub task: String,

    #[arg(long, default_value = "")]
    pub description: String,

    /// Files the task touches. Repeatable.
    #[arg(long = "file")]
    pub files: Vec<PathBuf>,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Show superseded and completed claims too.
    #[arg(long)]
    pub all: bool,
}

pub fn run_work(command: WorkCommand, global: &GlobalArgs) -> Result<()> {
    let coord = global.coordinator()?;
    let registry = WorkRegistry::new(&coord);
    match command {
        WorkCommand::Claim(args) => {
            let claim = registry
                .claim(&args.task, &args.description, args.files)
                .context("failed to claim work")?;
            if global.json {
                return print_json(&claim);
            }
            println!("{} {} ({})", "claimed".green(), claim.task, claim.claim_id);
        }
        WorkCommand::Complete => {
            let done = registry.complete().context("failed to complete work")?;
            if global.json {
                return print_json(&done);
            }
            match done {
                Some(claim) => println!("{} {}", "completed".green(), claim.task),
                None => println!("no active claim for this instance"),
            }
        }
        WorkCommand::List(args) => {
            let claims = if args.all {
                registry.history()
            } else {
                registry.active_claims()
            }
            .context("failed to read work log")?;
            if global.json {
                return print_json(&claims);
            }
            if claims.is_empty() {
                println!("No work claimed.");
            }
            for claim in claims {
                println!(
                    "{} {} {:?} {}",
                    claim.instance_id,
                    claim.task.bold(),
                    claim.status,
                    claim.description
                );
            }
        }
    }
    Ok(())
}
