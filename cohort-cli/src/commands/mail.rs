//! `cohort mail send|drain` (sqlite backend only)

use anyhow::{anyhow, Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;

use cohort_core::{Priority, BROADCAST};

use super::{print_json, GlobalArgs};

#[derive(Subcommand, Debug)]
pub enum MailCommand {
    /// Send a message to an instance, or to everyone with `*`.
    Send(SendArgs),
    /// Print and consume messages addressed to this instance.
    Drain,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    #[arg(long, default_value = BROADCAST)]
    pub to: String,

    #[arg(long = "type", default_value = "note")]
    pub message_type: String,

    /// JSON payload, or plain text stored as a string.
    pub payload: String,

    /// low, normal, high or urgent.
    #[arg(long, default_value = "normal")]
    pub priority: String,

    /// Lifetime in seconds.
    #[arg(long)]
    pub ttl: Option<i64>,
}

pub fn run(command: MailCommand, global: &GlobalArgs) -> Result<()> {
    let coord = global.coordinator()?;
    match command {
        MailCommand::Send(args) => {
            let priority = Priority::parse(&args.priority)
                .ok_or_else(|| anyhow!("unknown priority '{}'", args.priority))?;
            let payload = serde_json::from_str(&args.payload)
                .unwrap_or(serde_json::Value::String(args.payload));
            let message = coord
                .send_message(
                    &args.to,
                    &args.message_type,
                    payload,
                    priority,
                    args.ttl.map(chrono::Duration::seconds),
                )
                .context("failed to send message")?;
            if global.json {
                return print_json(&message);
            }
            println!("{} {} to {}", "sent".green(), message.message_id, message.to_instance);
        }
        MailCommand::Drain => {
            let messages = coord.drain_messages().context("failed to drain mailbox")?;
            if global.json {
                return print_json(&messages);
            }
            if messages.is_empty() {
                println!("No messages.");
            }
            for m in messages {
                let scope = if m.is_broadcast() { " (broadcast)" } else { "" };
                println!(
                    "[{:?}] {} from {}{scope}: {}",
                    m.priority,
                    m.message_type.bold(),
                    m.from_instance,
                    serde_json::to_string(&m.payload)?
                );
            }
        }
    }
    Ok(())
}
