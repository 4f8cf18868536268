//! colonysync - host-authoritative world replication
//!
//! Runs a host and a number of clients in one process over the loopback
//! transport and prints how the session went.

mod config;
mod run;

use anyhow::Result;
use clap::Parser;
use colonysync_testkit::{JsonlSink, ReportSink, RunResult};
use run::RunOptions;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a colonysync host and loopback clients", long_about = None)]
struct Args {
    /// Engine configuration (TOML)
    #[arg(long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Number of loopback clients
    #[arg(long, default_value_t = 2)]
    clients: usize,
    /// Host ticks to run (50 ms each)
    #[arg(long, default_value_t = 600)]
    ticks: u64,
    /// Extra bytes added to the world snapshot
    #[arg(long, default_value_t = 256 * 1024)]
    snapshot_bytes: usize,
    /// Drop every Kth chunk ack on the link (0 = lossless)
    #[arg(long, default_value_t = 0)]
    drop_every: u64,
    /// Write a JSONL event log here
    #[arg(long)]
    events: Option<PathBuf>,
    /// Also write the JSON report to this file
    #[arg(long)]
    report: Option<PathBuf>,
    /// Write the effective configuration back to --config and exit
    #[arg(long)]
    save_config: bool,
    /// Seed for transfer ids and world mutations
    #[arg(long, default_value_t = 1337)]
    seed: u64,
}

fn main() -> Result<()> {
    // INFO by default; RUST_LOG overrides
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!("Starting colonysync v{}", env!("CARGO_PKG_VERSION"));

    let config = config::load_from_path(&args.config);
    if args.save_config {
        config::save_to_path(&config, &args.config)?;
        info!("Wrote configuration to {}", args.config.display());
        return Ok(());
    }

    let events = args.events.as_ref().map(JsonlSink::create).transpose()?;
    let options = RunOptions {
        clients: args.clients,
        ticks: args.ticks.max(run::SETTLE_TICKS),
        snapshot_bytes: args.snapshot_bytes,
        drop_every: args.drop_every,
        seed: args.seed,
    };

    let report = run::run(&config, &options, events)?;

    println!("Ran {} ticks with {} client(s)", report.ticks, report.clients.len());
    println!(
        "  transfers: {} started, {} completed, {} chunk resends",
        report.transfers.started, report.transfers.completed, report.transfers.resends
    );
    println!(
        "  link     : {} delivered, {} dropped, {} refused",
        report.link.delivered, report.link.dropped, report.link.refused
    );
    for client in &report.clients {
        println!(
            "  peer:{} {:<10} {:>8} bytes in, latency {}, in sync: {}",
            client.peer,
            client.state,
            client.bytes_received,
            client
                .latency_ms
                .map_or_else(|| "n/a".to_string(), |ms| format!("{ms:.1} ms")),
            client.in_sync.unwrap_or(false)
        );
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    if let Some(path) = &args.report {
        ReportSink::create(path)?.write(&report)?;
        info!("Report written to {}", path.display());
    }

    if report.result == RunResult::Diverged {
        warn!("At least one client did not converge on the host world");
    }
    Ok(())
}
