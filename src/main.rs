use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use pacer::application::scheduler::Acknowledgement;
use pacer::domain::models::{MinuteOfDay, Options};
use pacer::AppState;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "pacer")]
#[command(about = "Tops up the daily activity count towards a target")]
#[command(version)]
struct Cli {
    /// Workspace holding config/, state/ and logs/ (default: current directory)
    #[arg(short, long, global = true)]
    workspace: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pacing engine once
    Run,

    /// Run the pacing engine periodically until interrupted
    Schedule,

    /// Print today's progress as JSON
    Status,

    /// Update the pacing options
    SetOptions {
        /// Daily target count
        #[arg(long)]
        target: Option<u64>,
        /// Start of the active window (HH:MM)
        #[arg(long)]
        from: Option<String>,
        /// End of the active window (HH:MM)
        #[arg(long)]
        to: Option<String>,
    },

    /// Import an organically recorded activity interval
    Record {
        /// Interval start (RFC 3339)
        #[arg(long)]
        from: String,
        /// Interval end (RFC 3339)
        #[arg(long)]
        to: String,
        #[arg(long)]
        count: u64,
        #[arg(long, default_value = "manual")]
        source: String,
    },
}

fn parse_instant(value: &str, field: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("--{field} must be an RFC 3339 timestamp"))?
        .with_timezone(&Utc))
}

fn parse_minute_of_day(value: &str, field: &str) -> Result<MinuteOfDay> {
    MinuteOfDay::parse(value).map_err(|error| anyhow::anyhow!("--{field}: {error}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let workspace = match cli.workspace {
        Some(path) => path,
        None => std::env::current_dir().context("failed to resolve current directory")?,
    };
    let state = AppState::new(&workspace)
        .with_context(|| format!("failed to initialize workspace {}", workspace.display()))?;

    match cli.command {
        Commands::Run => {
            let acknowledgement = state.run_once().await;
            println!("{}", serde_json::to_string_pretty(&acknowledgement)?);
            if !matches!(acknowledgement, Acknowledgement::Finished { .. }) {
                std::process::exit(1);
            }
        }
        Commands::Schedule => {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("shutdown requested");
                }
                let _ = shutdown_tx.send(true);
            });
            state.trigger().run(shutdown_rx).await;
        }
        Commands::Status => {
            let report = state.status().await.context("failed to build status report")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::SetOptions { target, from, to } => {
            let current = state.options()?;
            let options = Options {
                target: target.unwrap_or(current.target),
                active_from: match from {
                    Some(value) => parse_minute_of_day(&value, "from")?,
                    None => current.active_from,
                },
                active_to: match to {
                    Some(value) => parse_minute_of_day(&value, "to")?,
                    None => current.active_to,
                },
            };
            state.save_options(&options).context("failed to save options")?;
            println!("{}", serde_json::to_string_pretty(&options)?);
        }
        Commands::Record {
            from,
            to,
            count,
            source,
        } => {
            let from = parse_instant(&from, "from")?;
            let to = parse_instant(&to, "to")?;
            state
                .record(&source, from, to, count)
                .await
                .context("failed to record activity")?;
        }
    }

    Ok(())
}
