use anyhow::{bail, Context as AnyhowContext, Result};
use clap::{Args, Parser, Subcommand};
use log::info;
use serde::Serialize;
use spool_broker::{
    read_health_report, Broker, BrokerConfig, Diagnostics, ReadOutcome, SessionId, SpoolClient,
};
use spool_protocol::{response_schema_json, PayloadDefect};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

mod report;

const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

const EXIT_FAILED: u8 = 1;
const EXIT_TIMED_OUT: u8 = 2;
const EXIT_MALFORMED: u8 = 3;
const EXIT_INVALID_SESSION: u8 = 4;

#[derive(Parser)]
#[command(name = "spool")]
#[command(about = "Directory-based request/response job broker", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode: log only warnings/errors (stdout is reserved for output)
    #[arg(long, global = true)]
    quiet: bool,

    /// TOML config file (default: <root>/spool.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch a shared directory and answer requests until Ctrl-C
    Serve(ServeArgs),

    /// Write a request and print its session id
    Enqueue(EnqueueArgs),

    /// Wait for the response to a session
    Wait(WaitArgs),

    /// Inspect a shared directory without touching it
    Diagnose(DiagnoseArgs),

    /// Print the last health report persisted by `serve`
    Status(StatusArgs),

    /// Print the JSON Schema of response artifacts
    Schema,
}

#[derive(Args)]
struct ServeArgs {
    /// Shared directory
    #[arg(long)]
    root: PathBuf,

    /// Artificial delay before each job runs (ms); overrides processing_delay_ms
    #[arg(long)]
    processing_delay_ms: Option<u64>,

    /// Directory scan period (ms)
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Persist health reports to this file
    #[arg(long)]
    health_file: Option<PathBuf>,

    /// Rely on the periodic scan only
    #[arg(long)]
    no_notify: bool,
}

#[derive(Args)]
struct EnqueueArgs {
    #[arg(long)]
    root: PathBuf,

    /// Session id to use instead of a generated one
    #[arg(long)]
    session: Option<String>,

    /// Request body (mutually exclusive with --file)
    #[arg(long, conflicts_with = "file", required_unless_present = "file")]
    text: Option<String>,

    /// Read the request body from a file
    #[arg(long)]
    file: Option<PathBuf>,
}

#[derive(Args)]
struct WaitArgs {
    #[arg(long)]
    root: PathBuf,

    #[arg(long)]
    session: String,

    #[arg(long, default_value_t = 30_000)]
    timeout_ms: u64,

    /// Print the outcome as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct DiagnoseArgs {
    #[arg(long)]
    root: PathBuf,

    /// Print the report as JSON instead of Markdown
    #[arg(long)]
    json: bool,

    /// Age after which a pending request counts as stale (ms)
    #[arg(long)]
    stale_after_ms: Option<u64>,

    /// Number of error patterns to list
    #[arg(long)]
    top: Option<usize>,
}

#[derive(Args)]
struct StatusArgs {
    #[arg(long)]
    health_file: PathBuf,
}

#[derive(Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum WaitOutput<'a> {
    TimedOut {
        #[serde(rename = "sessionId")]
        session_id: &'a SessionId,
        #[serde(rename = "waitedMs")]
        waited_ms: u64,
    },
    Malformed {
        #[serde(rename = "sessionId")]
        session_id: &'a SessionId,
        defects: &'a [PayloadDefect],
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if cli.quiet {
        builder.filter_level(log::LevelFilter::Warn);
    } else if cli.verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.target(env_logger::Target::Stderr).init();

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Serve(args) => serve(args, config_path).await,
        Commands::Enqueue(args) => enqueue(args, config_path).await,
        Commands::Wait(args) => wait(args, config_path).await,
        Commands::Diagnose(args) => diagnose(args, config_path).await,
        Commands::Status(args) => status(&args).await,
        Commands::Schema => {
            println!("{}", response_schema_json().context("render schema")?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_config(root: &Path, explicit: Option<&Path>) -> Result<BrokerConfig> {
    BrokerConfig::load(root, explicit)
        .with_context(|| format!("load configuration for {}", root.display()))
}

/// Flags win over the loaded configuration; absent flags leave it untouched.
fn apply_serve_flags(config: &mut BrokerConfig, args: &ServeArgs) {
    if let Some(ms) = args.processing_delay_ms {
        config.processing_delay = Duration::from_millis(ms);
    }
    if let Some(ms) = args.poll_interval_ms {
        config.poll_interval = Duration::from_millis(ms);
    }
    if let Some(path) = &args.health_file {
        config.health_file = Some(path.clone());
    }
}

async fn serve(args: ServeArgs, config_path: Option<&Path>) -> Result<ExitCode> {
    let mut config = load_config(&args.root, config_path)?;
    apply_serve_flags(&mut config, &args);
    config.validate()?;

    let mut builder = Broker::builder(config);
    if args.no_notify {
        builder = builder.without_notify();
    }
    let broker = builder.start().await.context("start broker")?;
    info!("serving {} (Ctrl-C to stop)", args.root.display());

    tokio::signal::ctrl_c()
        .await
        .context("listen for Ctrl-C")?;
    info!("shutting down");
    broker.shutdown(SHUTDOWN_DRAIN).await;
    Ok(ExitCode::SUCCESS)
}

async fn enqueue(args: EnqueueArgs, config_path: Option<&Path>) -> Result<ExitCode> {
    let config = load_config(&args.root, config_path)?;
    let client = SpoolClient::from_config(&config)?;
    let body = match (&args.text, &args.file) {
        (Some(text), _) => text.clone(),
        (None, Some(file)) => std::fs::read_to_string(file)
            .with_context(|| format!("read request body from {}", file.display()))?,
        (None, None) => bail!("either --text or --file is required"),
    };

    let session = match args.session {
        Some(raw) => {
            let session = SessionId::parse(raw)?;
            client.enqueue_with_session(&session, &body).await?;
            session
        }
        None => client.enqueue(&body).await?,
    };
    println!("{session}");
    Ok(ExitCode::SUCCESS)
}

async fn wait(args: WaitArgs, config_path: Option<&Path>) -> Result<ExitCode> {
    let session = match SessionId::parse(args.session) {
        Ok(session) => session,
        Err(err) => {
            eprintln!("{err}");
            return Ok(ExitCode::from(EXIT_INVALID_SESSION));
        }
    };
    let config = load_config(&args.root, config_path)?;
    let client = SpoolClient::from_config(&config)?;
    let outcome = client
        .wait_for_response(&session, Duration::from_millis(args.timeout_ms))
        .await?;

    match outcome {
        ReadOutcome::Ready(payload) => {
            if args.json {
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else if payload.success {
                println!("{}", payload.response);
            } else {
                eprintln!(
                    "{}",
                    payload.error.as_deref().unwrap_or("request failed")
                );
            }
            Ok(if payload.success {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(EXIT_FAILED)
            })
        }
        ReadOutcome::TimedOut { session_id, waited } => {
            if args.json {
                let waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX);
                let out = WaitOutput::TimedOut {
                    session_id: &session_id,
                    waited_ms,
                };
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                eprintln!("no response for {session_id} after {waited:?}");
            }
            Ok(ExitCode::from(EXIT_TIMED_OUT))
        }
        ReadOutcome::Malformed {
            session_id,
            defects,
            ..
        } => {
            if args.json {
                let out = WaitOutput::Malformed {
                    session_id: &session_id,
                    defects: &defects,
                };
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                eprintln!("malformed response for {session_id}:");
                for defect in &defects {
                    eprintln!("  - {defect}");
                }
            }
            Ok(ExitCode::from(EXIT_MALFORMED))
        }
    }
}

async fn diagnose(args: DiagnoseArgs, config_path: Option<&Path>) -> Result<ExitCode> {
    let mut config = load_config(&args.root, config_path)?;
    if let Some(ms) = args.stale_after_ms {
        config.stale_after = Duration::from_millis(ms);
    }
    if let Some(top) = args.top {
        config.top_errors = top;
    }
    let report = Diagnostics::from_config(&config)?
        .run()
        .await
        .context("diagnose shared directory")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report::render_diagnostic_report(&report));
    }
    Ok(ExitCode::SUCCESS)
}

async fn status(args: &StatusArgs) -> Result<ExitCode> {
    let Some(report) = read_health_report(&args.health_file)
        .await
        .with_context(|| format!("read {}", args.health_file.display()))?
    else {
        bail!("no health report at {}", args.health_file.display());
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(ExitCode::SUCCESS)
}
