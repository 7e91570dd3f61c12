//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

/// SessionFlow - durable planning-session workflows
#[derive(Parser)]
#[command(
    name = "sf",
    about = "Durable multi-stage workflow engine for planning sessions",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Session database (overrides storage.db-path)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the instance id for a user's session
    SessionId {
        user_id: String,
        session_id: String,
    },

    /// Start an instance (or a new generation of a terminal one)
    Start {
        /// Instance id, as printed by `session-id`
        instance_id: String,

        /// Initial context fields, KEY=VALUE (VALUE parsed as JSON when possible)
        #[arg(short = 's', long = "set", value_name = "KEY=VALUE")]
        fields: Vec<String>,
    },

    /// Deliver a signal to an instance
    Signal {
        instance_id: String,

        /// JSON payload for a user message
        #[arg(conflicts_with_all = ["cancel", "escalate"])]
        payload: Option<String>,

        /// Signal id; generated when omitted
        #[arg(long)]
        id: Option<String>,

        /// Stage intent for off-stage messages (e.g. budget, vendor)
        #[arg(short, long)]
        intent: Option<String>,

        /// Cancel the session
        #[arg(long, conflicts_with = "escalate")]
        cancel: bool,

        /// Hand the session to a human, with a reason
        #[arg(long, value_name = "REASON")]
        escalate: Option<String>,
    },

    /// Show the current state of an instance
    Status {
        instance_id: String,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Show the recorded history of an instance
    History {
        instance_id: String,

        /// Only this generation
        #[arg(short, long)]
        generation: Option<u32>,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// List escalation tickets
    Tickets {
        /// Only tickets for this instance
        instance_id: Option<String>,

        /// Only tickets the escalation sink has not accepted
        #[arg(short, long)]
        undelivered: bool,
    },

    /// Report live instances, pending signals and undelivered tickets
    Recover,

    /// Drive live instances locally with in-memory collaborators
    Run {
        /// Advance every live instance until idle, then exit
        #[arg(long)]
        once: bool,
    },
}

/// Get the log file path
pub fn get_log_path() -> PathBuf {
    debug!("get_log_path: called");
    let path = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sessionflow")
        .join("logs")
        .join("sessionflow.log");
    debug!(?path, "get_log_path: returning path");
    path
}

/// Split `KEY=VALUE`; the value is JSON when it parses, a string otherwise
pub fn parse_field(field: &str) -> Result<(String, serde_json::Value), String> {
    debug!(%field, "parse_field: called");
    let Some((key, raw)) = field.split_once('=') else {
        return Err(format!("Expected KEY=VALUE, got: {}", field));
    };
    if key.trim().is_empty() {
        return Err(format!("Empty key in: {}", field));
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
    Ok((key.trim().to_string(), value))
}

/// Output format for status/history commands
#[derive(Clone, Debug, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        debug!(%s, "OutputFormat::from_str: called");
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use: text or json", s)),
        }
    }
}
