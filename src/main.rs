//! # Synopsis CLI (`synopsis`)
//!
//! ## Usage
//!
//! ```bash
//! synopsis --config ./config/synopsis.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `synopsis init` | Create the SQLite database and run schema migrations |
//! | `synopsis serve` | Start the REST API |
//! | `synopsis summarize <file>` | Run one summary to completion and print it |
//! | `synopsis get <request_id>` | Show a stored job |
//! | `synopsis detect <text>` | Detect the language of a text |

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use synopsis::config::{self, Config};
use synopsis::coordinator::{open_store, Coordinator, Submission};
use synopsis::pipeline::Capabilities;
use synopsis::server::{self, SummaryResponse};
use synopsis::text::StopwordDetector;
use synopsis::{migrate, models::Params};

/// Synopsis: a deduplicating, asynchronous text-summarization API.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. Without one, `summarize` and `detect` fall back to an in-memory
/// configuration.
#[derive(Parser)]
#[command(name = "synopsis", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/synopsis.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Start the REST API on `[server].bind`.
    Serve,

    /// Summarize a file and print the result as JSON.
    ///
    /// Goes through the same coordinator and pipeline as the API, so the
    /// job is stored and can be fetched later with `get` when the SQLite
    /// backend is configured.
    Summarize {
        /// Text file to summarize; `-` reads standard input.
        path: PathBuf,

        /// Model name (defaults to `[summaries].default_model`).
        #[arg(long)]
        model: Option<String>,

        /// Language code; detected when omitted.
        #[arg(long)]
        language: Option<String>,

        /// Generation parameters as `key=value` pairs; values are parsed as
        /// JSON when possible.
        #[arg(long = "param", value_parser = parse_key_val)]
        params: Vec<(String, String)>,

        /// Give up waiting after this many seconds.
        #[arg(long, default_value_t = 120)]
        timeout: u64,
    },

    /// Show the job behind a request id.
    Get {
        /// Request id returned on submission.
        request_id: String,
    },

    /// Detect the language of a text.
    Detect {
        text: String,
    },
}

/// Parse a `key=value` pair for `--param` arguments.
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::default().add_directive(Level::INFO.into()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Local commands work without a config file, but not with a broken one.
    let cfg = match &cli.command {
        Commands::Summarize { .. } | Commands::Detect { .. } if !cli.config.exists() => {
            Config::minimal()
        }
        _ => config::load_config(&cli.config)?,
    };
    init_tracing(&cfg.logging.level);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Summarize {
            path,
            model,
            language,
            params,
            timeout,
        } => {
            let source = if path.as_os_str() == "-" {
                std::io::read_to_string(std::io::stdin()).context("Failed to read stdin")?
            } else {
                std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?
            };
            let mut submission = Submission::new(source);
            submission.model = model;
            submission.language = language;
            submission.params = params
                .into_iter()
                .map(|(k, v)| {
                    let value = serde_json::from_str(&v).unwrap_or(serde_json::Value::String(v));
                    (k, value)
                })
                .collect::<Params>();
            run_summarize(&cfg, submission, Duration::from_secs(timeout)).await?;
        }
        Commands::Get { request_id } => {
            let (coordinator, _dispatcher) = start(&cfg).await?;
            match coordinator.fetch(&request_id).await? {
                Some((summary, warnings)) => print_json(&SummaryResponse::new(summary, warnings))?,
                None => anyhow::bail!("no summary found for request {}", request_id),
            }
        }
        Commands::Detect { text } => {
            let (coordinator, _dispatcher) = start(&cfg).await?;
            match coordinator.detect_language(&text).await? {
                Some(found) => print_json(&found)?,
                None => anyhow::bail!("text is empty"),
            }
        }
    }

    Ok(())
}

async fn start(cfg: &Config) -> anyhow::Result<(Arc<Coordinator>, tokio::task::JoinHandle<()>)> {
    let store = open_store(cfg).await?;
    Ok(Coordinator::start(
        cfg,
        store,
        Capabilities::builtin(cfg.pipeline.max_chunk_tokens),
        Arc::new(StopwordDetector::new()),
    ))
}

async fn run_summarize(
    cfg: &Config,
    submission: Submission,
    timeout: Duration,
) -> anyhow::Result<()> {
    let (coordinator, _dispatcher) = start(cfg).await?;
    let (accepted, _) = coordinator.submit(submission).await?;
    let request_id = accepted.id;

    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let Some((summary, warnings)) = coordinator.fetch(&request_id).await? else {
            anyhow::bail!("request {} disappeared", request_id);
        };
        if summary.status.is_terminal() {
            print_json(&SummaryResponse::new(summary, warnings))?;
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!(
                "timed out after {:?} waiting for request {} (status: {})",
                timeout,
                request_id,
                summary.status
            );
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
