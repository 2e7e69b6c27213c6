//! `RingChat` console front-end.
//!
//! Starts a new ring, or joins an existing one when `--king` is given, then
//! reads chat lines and commands from stdin and prints what the node
//! reports. Configuration via CLI flags, environment variables, or config
//! file (`~/.config/ringchat/config.toml`).
//!
//! ```bash
//! # Start a ring
//! cargo run --bin ringchat -- --name king --bind 127.0.0.1:7000
//!
//! # Join it
//! cargo run --bin ringchat -- --name alice --king 127.0.0.1:7000
//! ```

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;

use ringchat::config::{CliArgs, ClientConfig};
use ringchat::node::{Node, NodeError, NodeEvent};
use ringchat_proto::presence::UserStateChange;

const HELP: &str = "\
commands:
  /users     list members that are online
  /topology  show every member's neighbors
  /king      show the king's address
  /help      show this help
  /quit      leave the ring
anything else is sent as a chat message";

const FALLBACK_TIMESTAMP_FORMAT: &str = "%H:%M:%S";

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    // Load and resolve configuration (CLI args > env > config file > defaults).
    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::from_cli(&cli)
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());

    let identity = match config.identity() {
        Ok(identity) => identity,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    let king = match config.king_endpoint() {
        Ok(king) => king,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(node = %identity.name, "ringchat starting");
    let login = match king {
        Some(king) => Node::connect_to_remote_king(king, identity, config.to_node_config()).await,
        None => Node::start_new_network(identity, config.to_node_config()).await,
    };
    let (node, events) = match login {
        Ok(login) => login,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    println!(
        "logged in as {}{}",
        node.info(),
        if node.is_king() { " (king)" } else { "" }
    );
    println!("type /help for commands");

    run_console(&node, events, &config.timestamp_format).await;

    node.log_off().await;
    tracing::info!("ringchat exiting");
    ExitCode::SUCCESS
}

/// Initialize logging.
///
/// Logs go to the given file, or to stderr since the console owns stdout.
/// A path without a file name falls back to stderr. Returns a
/// [`WorkerGuard`] that must be held until shutdown to ensure all buffered
/// log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> WorkerGuard {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let log_file = file_path.and_then(|path| {
        let file_name = path.file_name();
        if file_name.is_none() {
            eprintln!(
                "Warning: log path {} has no file name, logging to stderr",
                path.display()
            );
        }
        file_name.map(|name| (path.parent().filter(|p| !p.as_os_str().is_empty()), name))
    });
    let (writer, guard) = match log_file {
        Some((log_dir, file_name)) => {
            let appender =
                tracing_appender::rolling::never(log_dir.unwrap_or(Path::new(".")), file_name);
            tracing_appender::non_blocking(appender)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    tracing_subscriber::fmt()
        .with_writer(writer)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    guard
}

/// Reads stdin until `/quit` or end of input, printing node events as
/// they arrive.
async fn run_console(node: &Node, mut events: mpsc::Receiver<NodeEvent>, timestamp_format: &str) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    if let Err(e) = print_event(&event, timestamp_format) {
                        tracing::warn!(err = %e, "could not format event");
                    }
                }
                None => break,
            },
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !run_command(node, line.trim()).await {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(err = %e, "stdin failed");
                    break;
                }
            },
        }
        if !node.is_logged_in() {
            break;
        }
    }
}

/// Runs one console line. Returns `false` when the user wants to leave.
async fn run_command(node: &Node, line: &str) -> bool {
    match line {
        "" => {}
        "/quit" => return false,
        "/help" => println!("{HELP}"),
        "/users" => match node.get_online_users().await {
            Ok(users) => println!("online: {users}"),
            Err(e) => report(&e),
        },
        "/topology" => match node.get_topology_info().await {
            Ok(topology) => {
                for snapshot in topology {
                    println!("  {snapshot}");
                }
            }
            Err(e) => report(&e),
        },
        "/king" => println!("king: {}", node.king_address().await),
        text if text.starts_with('/') => println!("unknown command {text}, try /help"),
        text => {
            if let Err(e) = node.send_message(text).await {
                report(&e);
            }
        }
    }
    true
}

fn report(error: &NodeError) {
    println!("! {error}");
}

/// Current local time in the configured format, falling back to
/// `HH:MM:SS` when the format string is invalid.
fn timestamp(format: &str) -> Result<String, std::fmt::Error> {
    use std::fmt::Write;
    let now = chrono::Local::now();
    let mut out = String::new();
    if write!(out, "{}", now.format(format)).is_err() {
        out.clear();
        write!(out, "{}", now.format(FALLBACK_TIMESTAMP_FORMAT))?;
    }
    Ok(out)
}

fn print_event(event: &NodeEvent, timestamp_format: &str) -> Result<(), std::fmt::Error> {
    match event {
        NodeEvent::ChatLine(line) => println!("[{}] {line}", timestamp(timestamp_format)?),
        NodeEvent::StateChanged(change) => print_state_change(change),
        NodeEvent::Error(message) => println!("! {message}"),
    }
    Ok(())
}

fn print_state_change(change: &UserStateChange) {
    if change.user_name.is_some() {
        println!("* {change}");
    }
    if let Some(topology) = &change.topology {
        println!("* ring:");
        for snapshot in topology {
            println!("    {snapshot}");
        }
    }
}
