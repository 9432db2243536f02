//! Meshbus Node - command-line host and client for meshbus processors.
//!
//! `serve` hosts a multi-peer processor with the diagnostic service on one
//! or more addresses. `call` connects to a processor, performs one request and
//! prints the JSON result.

mod service;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use meshbus_core::{
    Client, MeshbusError, MultiPeerProcessor, ProcessorConfig, Service, SinglePeerProcessor,
};
use serde_json::Value;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "meshbus-node")]
#[command(about = "Host or call meshbus processors")]
struct Cli {
    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Listen for peers and answer diagnostic commands
    Serve(ServeArgs),
    /// Connect to a processor and issue a single call
    Call(CallArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Address to listen on (repeatable), e.g. tcp://127.0.0.1:7000
    #[arg(long = "listen", required = true)]
    listen: Vec<String>,

    #[arg(long, default_value = "meshbus-node")]
    name: String,

    #[arg(long)]
    domain: Option<String>,

    /// Additional name to announce (repeatable)
    #[arg(long = "alias")]
    aliases: Vec<String>,

    /// Peer address to keep a connection open to (repeatable)
    #[arg(long = "connect")]
    connect: Vec<String>,
}

#[derive(Args, Debug)]
struct CallArgs {
    /// Address of the processor to call
    #[arg(long)]
    connect: String,

    #[arg(long)]
    command: String,

    /// JSON arguments
    #[arg(long, default_value = "null")]
    args: String,

    /// Name announced to the remote processor
    #[arg(long, default_value = "meshbus-cli")]
    name: String,

    /// Give up after this many seconds
    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,
}

fn init_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.json_logs);

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Call(args) => call(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let mut config = ProcessorConfig::new(&args.name)
        .with_aliases(args.aliases)
        .with_synchronous_requests(false);
    if let Some(domain) = args.domain {
        config = config.with_domain(domain);
    }

    let slot: service::ProcessorSlot = Arc::new(OnceLock::new());
    let processor = Arc::new(MultiPeerProcessor::new(
        args.listen,
        config,
        service::diagnostic_service(Arc::clone(&slot)),
    )?);
    let _ = slot.set(Arc::downgrade(&processor));

    let bound = processor.start().await.context("Failed to start listeners")?;
    for address in &bound {
        // Intentional stdout so scripts can discover ephemeral ports.
        println!("LISTENING={}", address);
    }
    for address in &args.connect {
        processor
            .open_connection(address, None)
            .with_context(|| format!("Cannot connect to {}", address))?;
    }
    info!(name = %args.name, "Node running");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    processor.shutdown().await;
    Ok(())
}

async fn call(args: CallArgs) -> Result<()> {
    let call_args: Value = serde_json::from_str(&args.args).context("--args must be valid JSON")?;
    let processor = SinglePeerProcessor::new(
        &args.connect,
        ProcessorConfig::new(&args.name),
        Service::builder().build(),
    );
    let deadline = Duration::from_secs(args.timeout_secs);

    let request = async {
        processor.start().await?;
        let client: Client = processor
            .client()
            .ok_or_else(|| MeshbusError::NoConnection("Not connected".to_string()))?;
        client.call::<_, Value>(&args.command, &call_args).await
    };
    let outcome = tokio::select! {
        outcome = tokio::time::timeout(deadline, request) => outcome,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted");
            processor.shutdown().await;
            return Ok(());
        }
    };
    processor.shutdown().await;

    match outcome {
        Ok(Ok(result)) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Ok(Err(e)) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
        Err(_) => {
            eprintln!("No response from {} within {:?}", args.connect, deadline);
            std::process::exit(1);
        }
    }
}
