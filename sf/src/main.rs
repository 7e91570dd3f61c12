//! SessionFlow - durable planning-session workflows
//!
//! CLI entry point for starting, signalling and inspecting instances.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info};

use sessionflow::cli::{Cli, Command, OutputFormat, get_log_path, parse_field};
use sessionflow::clock::{SharedClock, SystemClock};
use sessionflow::collaborators::mock::MockCollaborators;
use sessionflow::config::Config;
use sessionflow::domain::{HistoryEvent, Signal, Stage, instance_id_for_session};
use sessionflow::engine::{HistoryEntry, WorkflowClient, WorkflowEngine};
use sessionflow::events::create_event_bus;
use sessionflow::runner::WorkflowRunner;
use sessionflow::signals::SignalOutcome;
use sessionflow::state::{StateManager, scan_for_recovery};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Note: Can't log params here since logging isn't initialized yet
    let log_path = get_log_path();
    if let Some(log_dir) = log_path.parent() {
        fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    }

    // Priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::File::create(&log_path).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    setup_logging(cli.log_level.as_deref(), config.log_level.as_deref()).context("Failed to setup logging")?;

    let db_path = cli.db.clone().unwrap_or_else(|| config.storage.db_path.clone());
    info!(db = %db_path.display(), "SessionFlow loaded config");

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::SessionId { user_id, session_id } => {
            println!("{}", instance_id_for_session(&user_id, &session_id));
            Ok(())
        }
        Command::Start { instance_id, fields } => cmd_start(&config, &db_path, &instance_id, &fields).await,
        Command::Signal {
            instance_id,
            payload,
            id,
            intent,
            cancel,
            escalate,
        } => {
            let signal_id = id.unwrap_or_else(|| uuid::Uuid::now_v7().to_string());
            let signal = if cancel {
                Signal::cancel(signal_id)
            } else if let Some(reason) = escalate {
                Signal::escalate(signal_id, &reason)
            } else {
                let payload: Value = match payload {
                    Some(raw) => serde_json::from_str(&raw).context("Signal payload is not valid JSON")?,
                    None => Value::Object(Map::new()),
                };
                Signal::user_message(signal_id, payload)
            };
            let signal = match intent {
                Some(intent) => signal.with_intent(intent),
                None => signal,
            };
            cmd_signal(&config, &db_path, &instance_id, signal).await
        }
        Command::Status { instance_id, format } => cmd_status(&config, &db_path, &instance_id, format).await,
        Command::History {
            instance_id,
            generation,
            format,
        } => cmd_history(&config, &db_path, &instance_id, generation, format).await,
        Command::Tickets {
            instance_id,
            undelivered,
        } => cmd_tickets(&config, &db_path, instance_id.as_deref(), undelivered).await,
        Command::Recover => cmd_recover(&db_path).await,
        Command::Run { once } => cmd_run(&config, &db_path, once).await,
    }
}

fn open_state(db_path: &Path) -> Result<StateManager> {
    debug!(db = %db_path.display(), "open_state: called");
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    StateManager::spawn(db_path).context(format!("Failed to open {}", db_path.display()))
}

fn open_client(config: &Config, db_path: &Path) -> Result<WorkflowClient> {
    let clock: SharedClock = Arc::new(SystemClock);
    Ok(WorkflowClient::new(
        open_state(db_path)?,
        create_event_bus(),
        clock,
        config.signals.queue_capacity,
    ))
}

fn stage_label(stage: Stage) -> ColoredString {
    match stage {
        Stage::Completed => stage.as_str().green(),
        Stage::Failed => stage.as_str().red(),
        Stage::Escalated => stage.as_str().yellow(),
        Stage::IdleInterrupt => stage.as_str().magenta(),
        _ => stage.as_str().cyan(),
    }
}

async fn cmd_start(config: &Config, db_path: &Path, instance_id: &str, fields: &[String]) -> Result<()> {
    debug!(%instance_id, "cmd_start: called");
    let mut context = Map::new();
    for field in fields {
        let (key, value) = parse_field(field).map_err(|e| eyre::eyre!(e))?;
        context.insert(key, value);
    }

    let client = open_client(config, db_path)?;
    let handle = client.start(instance_id, context).await?;
    println!(
        "{} Started {} (generation {}) in {}",
        "✓".green(),
        handle.instance_id.cyan(),
        handle.generation,
        stage_label(handle.stage)
    );
    Ok(())
}

async fn cmd_signal(config: &Config, db_path: &Path, instance_id: &str, signal: Signal) -> Result<()> {
    debug!(%instance_id, signal_id = %signal.signal_id, "cmd_signal: called");
    let client = open_client(config, db_path)?;
    let signal_id = signal.signal_id.clone();
    match client.signal(instance_id, signal).await? {
        SignalOutcome::Accepted { dropped: None } => {
            println!("{} Signal {} queued", "✓".green(), signal_id.cyan());
        }
        SignalOutcome::Accepted { dropped: Some(dropped) } => {
            println!(
                "{} Signal {} queued; dropped oldest pending signal {}",
                "✓".green(),
                signal_id.cyan(),
                dropped.yellow()
            );
        }
        SignalOutcome::Duplicate => println!("Signal {} was already received", signal_id.cyan()),
        SignalOutcome::Rejected => {
            eyre::bail!("Signal queue for {} is full of signals that cannot be dropped", instance_id)
        }
        SignalOutcome::IgnoredTerminal => {
            println!("{} Instance {} has finished; signal ignored", "!".yellow(), instance_id)
        }
    }
    Ok(())
}

async fn cmd_status(config: &Config, db_path: &Path, instance_id: &str, format: OutputFormat) -> Result<()> {
    debug!(%instance_id, ?format, "cmd_status: called");
    let client = open_client(config, db_path)?;
    let view = client.query(instance_id).await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&view)?),
        OutputFormat::Text => {
            println!("{} {}", "Instance:".bold(), view.instance_id);
            println!("{} {}", "Stage:   ".bold(), stage_label(view.stage));
            if let Some(resume) = view.resume_stage {
                println!("{} {}", "Resume:  ".bold(), stage_label(resume));
            }
            println!("{} {}", "Status:  ".bold(), view.status);
            println!(
                "{} generation {}, version {}",
                "Revision:".bold(),
                view.generation,
                view.version
            );
            if view.consecutive_failures > 0 {
                println!("{} {}", "Failures:".bold(), view.consecutive_failures.to_string().red());
            }
            if let Some(ticket_id) = &view.ticket_id {
                println!("{} {}", "Ticket:  ".bold(), ticket_id.yellow());
            }
            if let Some(reply) = &view.reply {
                println!("{} {}", "Reply:   ".bold(), reply);
            }
            if !view.session_state.is_empty() {
                println!("{}", "Fields:".bold());
                for (key, value) in &view.session_state {
                    println!("  {} = {}", key.dimmed(), value);
                }
            }
        }
    }
    Ok(())
}

fn describe(entry: &HistoryEntry) -> String {
    match &entry.event {
        HistoryEvent::Started { initial_context, .. } => {
            format!("started with {} context field(s)", initial_context.len())
        }
        HistoryEvent::TurnDispatched { turn } => {
            format!("dispatched {:?} turn {} ({} task(s))", turn.kind, turn.turn_id, turn.tasks.len())
        }
        HistoryEvent::ActivityCompleted { task_id, attempt, .. } => {
            format!("completed {} on attempt {}", task_id, attempt)
        }
        HistoryEvent::ActivityFailed {
            task_id,
            attempt,
            failure,
            retry_at,
        } => match retry_at {
            Some(at) => format!("failed {} on attempt {}: {} (retry at {})", task_id, attempt, failure, at),
            None => format!("failed {} on attempt {}: {} (gave up)", task_id, attempt, failure),
        },
        HistoryEvent::Transition(record) => match &record.note {
            Some(note) => format!("{} -> {} ({})", record.from, record.to, note),
            None => format!("{} -> {}", record.from, record.to),
        },
    }
}

async fn cmd_history(
    config: &Config,
    db_path: &Path,
    instance_id: &str,
    generation: Option<u32>,
    format: OutputFormat,
) -> Result<()> {
    debug!(%instance_id, ?generation, ?format, "cmd_history: called");
    let client = open_client(config, db_path)?;
    let entries = client.history(instance_id, generation).await?;

    match format {
        OutputFormat::Json => {
            let events: Vec<&HistoryEvent> = entries.iter().map(|entry| &entry.event).collect();
            println!("{}", serde_json::to_string_pretty(&events)?);
        }
        OutputFormat::Text => {
            for entry in &entries {
                println!(
                    "{:>5} {} {} {}",
                    entry.sequence_no.to_string().dimmed(),
                    format!("g{}v{}", entry.generation, entry.version).cyan(),
                    entry.event.kind().bold(),
                    describe(entry)
                );
            }
        }
    }
    Ok(())
}

async fn cmd_tickets(config: &Config, db_path: &Path, instance_id: Option<&str>, undelivered: bool) -> Result<()> {
    debug!(?instance_id, undelivered, "cmd_tickets: called");
    let client = open_client(config, db_path)?;
    let tickets = client.tickets(instance_id, undelivered).await?;
    if tickets.is_empty() {
        println!("No escalation tickets");
        return Ok(());
    }
    for entry in tickets {
        let delivery = match entry.delivered_at {
            Some(_) => "delivered".green(),
            None => "pending".yellow(),
        };
        println!(
            "{} [{}] {} in {}: {}",
            entry.ticket.ticket_id.cyan(),
            delivery,
            entry.ticket.instance_id,
            stage_label(entry.ticket.stage),
            entry.ticket.reason
        );
    }
    Ok(())
}

async fn cmd_recover(db_path: &Path) -> Result<()> {
    debug!("cmd_recover: called");
    let state = open_state(db_path)?;
    let stats = scan_for_recovery(&state).await?;
    println!("Live instances:      {}", stats.live_instances);
    println!("Pending signals:     {}", stats.pending_signals);
    println!("Undelivered tickets: {}", stats.undelivered_tickets);
    for instance_id in &stats.instances {
        println!("  {}", instance_id.cyan());
    }
    Ok(())
}

/// Drive instances with in-memory collaborators
async fn cmd_run(config: &Config, db_path: &Path, once: bool) -> Result<()> {
    debug!(once, "cmd_run: called");
    let clock: SharedClock = Arc::new(SystemClock);
    let engine = WorkflowEngine::new(
        config,
        open_state(db_path)?,
        MockCollaborators::new().collaborators(),
        create_event_bus(),
        clock,
    );
    let mut runner = WorkflowRunner::new(engine, config.runner.clone());

    if once {
        let runs = runner.run_until_idle().await?;
        println!("{} {} run(s) completed", "✓".green(), runs);
        if let Some((count, due_at)) = runner.pending_timers() {
            println!("{} {} instance(s) waiting on a retry, next due at {}", "!".yellow(), count, due_at);
        }
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(()).await;
        }
    });
    println!("Running; press Ctrl-C to stop");
    runner.run(shutdown_rx).await
}
