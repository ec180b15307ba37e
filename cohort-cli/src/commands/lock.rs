//! `cohort acquire|release|extend|status|info|locks`

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, ValueEnum};
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use cohort_core::LockType;
use cohort_engine::{AcquireOutcome, ReleaseOutcome};

use super::{print_json, relative, GlobalArgs};

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Read,
    Write,
}

impl From<LockKind> for LockType {
    fn from(kind: LockKind) -> Self {
        match kind {
            LockKind::Read => LockType::SharedRead,
            LockKind::Write => LockType::ExclusiveWrite,
        }
    }
}

fn ttl_arg(secs: Option<i64>) -> Option<chrono::Duration> {
    secs.map(chrono::Duration::seconds)
}

// ---------------------------------------------------------------------------
// acquire
// ---------------------------------------------------------------------------

#[derive(Args, Debug)]
pub struct AcquireArgs {
    /// File to lock, absolute or relative to the project root.
    pub path: PathBuf,

    #[arg(long = "type", value_enum, default_value_t = LockKind::Write)]
    pub lock_type: LockKind,

    /// Lock lifetime in seconds. Clamped to the configured maximum.
    #[arg(long, allow_hyphen_values = true)]
    pub ttl: Option<i64>,

    /// What the lock is for, shown to anyone who is denied.
    #[arg(long, default_value = "")]
    pub intent: String,
}

impl AcquireArgs {
    /// A denial is a normal answer, not a failure: the exit code stays 0 and
    /// the decision is printed.
    pub fn run(self, global: &GlobalArgs) -> Result<()> {
        let coord = global.coordinator()?;
        let outcome = coord
            .acquire_file_lock(
                &self.path,
                self.lock_type.into(),
                ttl_arg(self.ttl),
                &self.intent,
            )
            .with_context(|| format!("failed to acquire lock on {}", self.path.display()))?;
        if global.json {
            let mut payload = serde_json::to_value(&outcome)?;
            if let Some(map) = payload.as_object_mut() {
                map.insert("decision".into(), outcome.decision().into());
                map.insert("message".into(), outcome.message().into());
            }
            return print_json(&payload);
        }
        let label = match &outcome {
            AcquireOutcome::Denied { .. } => "deny".red().bold(),
            AcquireOutcome::Reclaimed { .. } => "allow".yellow().bold(),
            AcquireOutcome::Granted { .. } => "allow".green().bold(),
        };
        println!("{label} {}", outcome.message());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// release / extend
// ---------------------------------------------------------------------------

#[derive(Args, Debug)]
pub struct ReleaseArgs {
    pub path: PathBuf,
}

impl ReleaseArgs {
    pub fn run(self, global: &GlobalArgs) -> Result<()> {
        let coord = global.coordinator()?;
        let outcome = coord
            .release_file_lock(&self.path)
            .with_context(|| format!("failed to release lock on {}", self.path.display()))?;
        if global.json {
            return print_json(&outcome);
        }
        match outcome {
            ReleaseOutcome::Released { records, modified } => {
                let note = match modified {
                    Some(true) => " (file modified)",
                    Some(false) => " (file unchanged)",
                    None => "",
                };
                println!(
                    "{} {} record(s) on {}{note}",
                    "released".green(),
                    records.len(),
                    self.path.display()
                );
            }
            ReleaseOutcome::NotHeld => println!("no lock held on {}", self.path.display()),
            ReleaseOutcome::NotHolder { holder } => println!(
                "{} {} is held by {holder}",
                "not holder:".yellow(),
                self.path.display()
            ),
        }
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct ExtendArgs {
    pub path: PathBuf,

    /// New lifetime in seconds, counted from now.
    #[arg(long, allow_hyphen_values = true)]
    pub ttl: Option<i64>,
}

impl ExtendArgs {
    pub fn run(self, global: &GlobalArgs) -> Result<()> {
        let coord = global.coordinator()?;
        let record = coord
            .extend_file_lock(&self.path, ttl_arg(self.ttl))
            .with_context(|| format!("failed to extend lock on {}", self.path.display()))?;
        if global.json {
            return print_json(&record);
        }
        println!(
            "{} {} until {} ({} extension(s))",
            "extended".green(),
            record.file_path.display(),
            record.expires_at.to_rfc3339(),
            record.extensions
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// status / info / locks
// ---------------------------------------------------------------------------

#[derive(Args, Debug)]
pub struct StatusArgs {
    pub path: PathBuf,
}

impl StatusArgs {
    pub fn run(self, global: &GlobalArgs) -> Result<()> {
        let coord = global.coordinator()?;
        let status = coord
            .is_file_locked(&self.path)
            .with_context(|| format!("failed to inspect {}", self.path.display()))?;
        if global.json {
            return print_json(&status);
        }
        if !status.locked {
            println!("{} {}", "unlocked".green(), status.path.display());
            return Ok(());
        }
        println!("{} {}", "locked".red(), status.path.display());
        for holder in &status.holders {
            println!("  {holder}");
        }
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct InfoArgs {
    pub path: PathBuf,
}

impl InfoArgs {
    pub fn run(self, global: &GlobalArgs) -> Result<()> {
        let coord = global.coordinator()?;
        let record = coord
            .get_lock_info(&self.path)
            .with_context(|| format!("failed to read lock of {}", self.path.display()))?;
        match record {
            None if !global.json => {
                println!("no lock record for {}", self.path.display());
                Ok(())
            }
            record => print_json(&record),
        }
    }
}

#[derive(Args, Debug)]
pub struct LocksArgs {
    /// Include expired records the sweep has not removed yet.
    #[arg(long)]
    pub all: bool,
}

#[derive(Tabled)]
struct LockRow {
    #[tabled(rename = "file")]
    file: String,
    #[tabled(rename = "type")]
    lock_type: String,
    #[tabled(rename = "holder")]
    holder: String,
    #[tabled(rename = "expires")]
    expires: String,
    #[tabled(rename = "intent")]
    intent: String,
}

impl LocksArgs {
    pub fn run(self, global: &GlobalArgs) -> Result<()> {
        let coord = global.coordinator()?;
        let records = coord.list_locks(self.all).context("failed to list locks")?;
        if global.json {
            return print_json(&records);
        }
        if records.is_empty() {
            println!("No locks held.");
            return Ok(());
        }
        let now = Utc::now();
        let rows: Vec<LockRow> = records
            .iter()
            .map(|r| LockRow {
                file: r.file_path.display().to_string(),
                lock_type: r.lock_type.to_string(),
                holder: r.holder().to_string(),
                expires: if r.is_expired(now) {
                    format!("expired {}", relative(r.expires_at, now)).red().to_string()
                } else {
                    relative(r.expires_at, now)
                },
                intent: r.intent.clone(),
            })
            .collect();
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
        Ok(())
    }
}
