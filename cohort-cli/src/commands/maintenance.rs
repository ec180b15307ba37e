//! `cohort cleanup|audit`

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use super::{print_json, GlobalArgs};

#[derive(Args, Debug)]
pub struct CleanupArgs {}

impl CleanupArgs {
    pub fn run(self, global: &GlobalArgs) -> Result<()> {
        let coord = global.coordinator()?;
        let report = coord.cleanup_stale().context("sweep failed")?;
        if global.json {
            return print_json(&report);
        }
        if report.is_empty() {
            println!("nothing to clean up");
            return Ok(());
        }
        println!(
            "{} {} lock(s) of dead instances, purged {} expired lock(s), forgot {} instance(s)",
            "released".green(),
            report.released.len(),
            report.purged.len(),
            report.dead_instances.len()
        );
        if report.messages_purged > 0 {
            println!("dropped {} expired message(s)", report.messages_purged);
        }
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct AuditArgs {
    /// Number of most recent events to show.
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

impl AuditArgs {
    pub fn run(self, global: &GlobalArgs) -> Result<()> {
        let coord = global.coordinator()?;
        let events = coord
            .recent_audit(self.limit)
            .context("failed to read audit trail")?;
        if global.json {
            return print_json(&events);
        }
        for event in events {
            println!(
                "{} {:<12} {} {}",
                event.timestamp.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
                event.action_type.as_str(),
                event.instance_id,
                event.target_id
            );
        }
        Ok(())
    }
}
