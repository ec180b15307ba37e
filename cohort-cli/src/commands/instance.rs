//! `cohort register|deregister|heartbeat|instances`

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Args;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use super::{print_json, relative, GlobalArgs};

#[derive(Args, Debug)]
pub struct RegisterArgs {}

impl RegisterArgs {
    pub fn run(self, global: &GlobalArgs) -> Result<()> {
        let coord = global.coordinator()?;
        let registration = coord
            .register_instance()
            .context("failed to register instance")?;
        if global.json {
            return print_json(&registration);
        }
        let instance = &registration.instance;
        let verb = if registration.reused {
            "reusing"
        } else {
            "registered"
        };
        println!(
            "{} {} (pid {}, context {})",
            verb.green(),
            instance.instance_id.to_string().bold(),
            instance.pid,
            instance.context
        );
        if !instance.capabilities.is_empty() {
            let caps: Vec<&str> = instance.capabilities.iter().map(String::as_str).collect();
            println!("capabilities: {}", caps.join(", "));
        }
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct DeregisterArgs {}

impl DeregisterArgs {
    pub fn run(self, global: &GlobalArgs) -> Result<()> {
        let coord = global.coordinator()?;
        let retired = coord
            .deregister_instance()
            .context("failed to deregister instance")?;
        if global.json {
            return print_json(&serde_json::json!({ "instance_id": retired }));
        }
        match retired {
            Some(id) => println!("{} {}", "deregistered".green(), id),
            None => println!("no instance registered for context {}", coord.context()),
        }
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct HeartbeatArgs {}

impl HeartbeatArgs {
    pub fn run(self, global: &GlobalArgs) -> Result<()> {
        let coord = global.coordinator()?;
        if coord.current_instance()?.is_none() {
            bail!(
                "no instance registered for context {}; run 'cohort register' first",
                coord.context()
            );
        }
        let heartbeat = coord.heartbeat().context("failed to record heartbeat")?;
        if global.json {
            return print_json(&heartbeat);
        }
        println!(
            "heartbeat #{} for {}",
            heartbeat.ping_count, heartbeat.instance_id
        );
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct InstancesArgs {}

#[derive(Tabled)]
struct InstanceRow {
    #[tabled(rename = "instance")]
    instance: String,
    #[tabled(rename = "pid")]
    pid: u32,
    #[tabled(rename = "status")]
    status: String,
    #[tabled(rename = "last ping")]
    last_ping: String,
    #[tabled(rename = "pings")]
    pings: u64,
}

impl InstancesArgs {
    pub fn run(self, global: &GlobalArgs) -> Result<()> {
        let coord = global.coordinator()?;
        let instances = coord.instances().context("failed to list instances")?;
        if global.json {
            return print_json(&instances);
        }
        if instances.is_empty() {
            println!("No instances have sent a heartbeat.");
            return Ok(());
        }
        let now = Utc::now();
        let rows: Vec<InstanceRow> = instances
            .iter()
            .map(|entry| InstanceRow {
                instance: entry.heartbeat.instance_id.to_string(),
                pid: entry.heartbeat.pid,
                status: if entry.alive {
                    "alive".green().to_string()
                } else {
                    "stale".red().to_string()
                },
                last_ping: relative(entry.heartbeat.last_ping, now),
                pings: entry.heartbeat.ping_count,
            })
            .collect();
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
        Ok(())
    }
}
