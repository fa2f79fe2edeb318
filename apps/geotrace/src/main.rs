mod config;
mod server;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use clap::{Args, Parser, Subcommand};
use config::TraceOptions;
use geotrace_model::{Hop, TraceStatus};
use geotrace_trace::{SessionEmitter, TraceMode};
use serde::Serialize;
use server::{create_router, AppState};
use std::io::Write;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "geotrace", version, about = "Trace the route to a host and locate every hop")]
struct Cli {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence.
    #[arg(long = "log-level", global = true, env = "GEOTRACE_LOG", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Serve(ServeArgs),
    Trace(TraceArgs),
    Watch(WatchArgs),
}

#[derive(Args)]
#[command(about = "Serve the HTTP, WebSocket and SSE trace API")]
struct ServeArgs {
    #[arg(long, env = "GEOTRACE_ADDR", default_value = "0.0.0.0:3001")]
    addr: SocketAddr,

    #[command(flatten)]
    trace: TraceOptions,
}

#[derive(Args)]
#[command(
    about = "Run one trace and print the located hops as JSON. Only target networks you own or have permission to test."
)]
struct TraceArgs {
    #[arg(long)]
    target: String,

    #[arg(long)]
    pretty: bool,

    #[command(flatten)]
    trace: TraceOptions,
}

#[derive(Args)]
#[command(about = "Stream trace events as JSON lines until the trace ends or Ctrl-C")]
struct WatchArgs {
    #[arg(long)]
    target: String,

    #[command(flatten)]
    trace: TraceOptions,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TraceReport {
    target: String,
    started_at_utc: String,
    finished_at_utc: Option<String>,
    hops: Vec<Hop>,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    setup_tracing(&cli.log_level);

    match cli.command {
        Commands::Serve(args) => run_serve(args).await,
        Commands::Trace(args) => run_trace(args).await,
        Commands::Watch(args) => run_watch(args).await,
    }
}

fn setup_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let tracer = args.trace.tracer()?;
    let dialect = tracer.settings().dialect;
    let router = create_router(AppState { tracer });

    let listener = tokio::net::TcpListener::bind(args.addr)
        .await
        .with_context(|| format!("failed to bind to {}", args.addr))?;
    info!(%dialect, "HTTP server listening on {}", args.addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await
        .context("server error")
}

async fn run_trace(args: TraceArgs) -> Result<()> {
    let tracer = args.trace.tracer()?;
    let outcome = tracer
        .run(
            &args.target,
            TraceMode::Batch,
            SessionEmitter::detached(),
            CancellationToken::new(),
        )
        .await;

    let report = TraceReport {
        target: outcome.target.clone(),
        started_at_utc: timestamp(outcome.started_at),
        finished_at_utc: outcome.finished_at.map(timestamp),
        hops: Vec::new(),
    };
    let hops = outcome
        .into_result()
        .map_err(|err| anyhow!("traceroute failed for {}: {err}", args.target))?;
    let report = TraceReport { hops, ..report };

    let json = if args.pretty {
        serde_json::to_string_pretty(&report)?
    } else {
        serde_json::to_string(&report)?
    };
    println!("{json}");
    Ok(())
}

async fn run_watch(args: WatchArgs) -> Result<()> {
    let tracer = args.trace.tracer()?;
    let (emitter, mut events) = SessionEmitter::channel();
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });

    let target = args.target.clone();
    let session = tokio::spawn(async move {
        tracer
            .run(&target, TraceMode::Streaming, emitter, cancel)
            .await
    });

    let stdout = std::io::stdout();
    while let Some(envelope) = events.recv().await {
        let line = serde_json::to_string(&envelope)?;
        let mut out = stdout.lock();
        writeln!(out, "{line}")?;
        out.flush()?;
    }

    let outcome = session.await.context("trace task failed")?;
    match (outcome.status, outcome.error) {
        (TraceStatus::Completed, _) => Ok(()),
        (_, Some(err)) => Err(anyhow!("traceroute failed for {}: {err}", args.target)),
        (status, None) => Err(anyhow!("trace ended as {status:?}")),
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}
