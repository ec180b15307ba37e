//! Subcommand implementations and the plumbing they share.

pub mod daemon;
pub mod instance;
pub mod journal;
pub mod lock;
pub mod mail;
pub mod maintenance;

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use serde::Serialize;

use cohort_core::config;
use cohort_engine::Coordinator;

/// Flags every subcommand understands.
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Project root whose coordination directory is used. Defaults to the
    /// current directory.
    #[arg(long, global = true, env = "COHORT_ROOT")]
    pub root: Option<PathBuf>,

    /// Session name identifying this instance. Defaults to the owner pid.
    #[arg(long, global = true, env = "COHORT_SESSION")]
    pub session: Option<String>,

    /// Process whose lifetime the instance is tied to. Defaults to the
    /// parent of this process.
    #[arg(long, global = true, env = "COHORT_OWNER_PID")]
    pub pid: Option<u32>,

    /// Emit machine-readable JSON.
    #[arg(long, global = true)]
    pub json: bool,
}

impl GlobalArgs {
    pub fn root(&self) -> Result<PathBuf> {
        let root = match &self.root {
            Some(root) => root.clone(),
            None => std::env::current_dir().context("could not determine current directory")?,
        };
        std::fs::canonicalize(&root)
            .with_context(|| format!("project root {} does not exist", root.display()))
    }

    pub fn owner_pid(&self) -> u32 {
        self.pid.unwrap_or_else(std::os::unix::process::parent_id)
    }

    /// Load configuration for the root and bind a coordinator to the session.
    pub fn coordinator(&self) -> Result<Coordinator> {
        let root = self.root()?;
        let config = config::load(&root)
            .with_context(|| format!("failed to load configuration for {}", root.display()))?;
        Coordinator::open(config, self.session.as_deref(), self.owner_pid())
            .context("failed to open coordination store")
    }
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to serialize JSON output")?
    );
    Ok(())
}

/// `"in 4m 10s"` / `"2m ago"` relative to `now`.
pub fn relative(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (at - now).num_seconds();
    let span = human_secs(secs.unsigned_abs());
    if secs >= 0 {
        format!("in {span}")
    } else {
        format!("{span} ago")
    }
}

fn human_secs(secs: u64) -> String {
    match secs {
        0..=59 => format!("{secs}s"),
        60..=3599 => format!("{}m {}s", secs / 60, secs % 60),
        _ => format!("{}h {}m", secs / 3600, (secs % 3600) / 60),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_times_read_naturally() {
        let now = Utc::now();
        assert_eq!(relative(now + chrono::Duration::seconds(250), now), "in 4m 10s");
        assert_eq!(relative(now - chrono::Duration::seconds(30), now), "30s ago");
        assert_eq!(relative(now + chrono::Duration::hours(2), now), "in 2h 0m");
    }
}
