//! dispatchq-admin binary
//!
//! Operational CLI over the inspection interface: look up task records, list and replay dead
//! letters, print queue statistics. Output is JSON on stdout.

mod commands;

use clap::{Parser, Subcommand};
use dispatchq::base::constants::DEFAULT_CONSUMER_GROUP;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// dispatchq operational CLI.
#[derive(Parser, Debug)]
#[command(name = "dispatchq-admin", about = "Inspect dispatchq tasks and queues")]
struct Cli {
  /// Redis connection URL.
  #[arg(
    long,
    env = "REDIS_URL",
    global = true,
    default_value = "redis://127.0.0.1:6379"
  )]
  redis_url: String,

  /// Consumer group used for pending counts.
  #[arg(
    long,
    env = "DISPATCHQ_CONSUMER_GROUP",
    global = true,
    default_value = DEFAULT_CONSUMER_GROUP
  )]
  group: String,

  /// Pretty-print JSON output.
  #[arg(long, global = true)]
  pretty: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show a task record.
  Task {
    /// Task id.
    id: String,
  },

  /// List the dead letters of a topic.
  #[command(name = "dead-letters")]
  DeadLetters {
    /// Topic name, e.g. tasks:normal.
    topic: String,
  },

  /// Replay a dead letter back onto its topic.
  Replay {
    /// Topic name.
    topic: String,
    /// Dead-letter entry id.
    entry_id: String,
  },

  /// Show queue statistics, for one topic or every priority topic.
  Stats {
    /// Topic name; all priority topics when omitted.
    topic: Option<String>,
  },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::registry()
    .with(fmt::layer().with_writer(std::io::stderr))
    .with(EnvFilter::from_default_env().add_directive("dispatchq=warn".parse()?))
    .init();

  let cli = Cli::parse();
  let inspector = commands::connect(&cli.redis_url, &cli.group).await?;

  let output = match cli.command {
    Command::Task { id } => commands::task(&inspector, &id).await?,
    Command::DeadLetters { topic } => commands::dead_letters(&inspector, &topic).await?,
    Command::Replay { topic, entry_id } => {
      commands::replay(&inspector, &topic, &entry_id).await?
    }
    Command::Stats { topic } => commands::stats(&inspector, topic.as_deref()).await?,
  };

  if cli.pretty {
    println!("{}", serde_json::to_string_pretty(&output)?);
  } else {
    println!("{output}");
  }
  Ok(())
}
