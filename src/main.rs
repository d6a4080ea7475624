//! # Netbench - Main Entry Point
//!
//! Dispatches the three operating modes:
//!
//! - `serve`: bind the control channel and per-provider data listeners,
//!   then answer control connections until terminated
//! - `run`: execute a single benchmark configuration against a server and
//!   print the result
//! - `batch`: replay a script of configurations over one control
//!   connection, reporting each line's outcome independently
//!
//! Logging is structured via tracing; the level is controlled with the
//! RUST_LOG environment variable (e.g. `RUST_LOG=debug netbench serve`).

use anyhow::{Context, Result};
use clap::Parser;
use netbench::{
    batch::BatchRunner,
    cli::{Args, BatchArgs, CliCommand, ClientArgs, ServeArgs},
    report::{self, ResultsManager},
    BenchmarkDriver, ControlConnection, PayloadCache, ProviderRegistry, Server, ServerConfig,
};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    match args.command {
        CliCommand::Serve(serve) => run_server(serve).await,
        CliCommand::Run(client) => run_single(client).await,
        CliCommand::Batch(batch) => run_batch(batch).await,
    }
}

async fn run_server(args: ServeArgs) -> Result<()> {
    let providers = Arc::new(ProviderRegistry::with_defaults());
    let config = ServerConfig { host: args.host, control_port: args.port };
    let server = Server::bind(&config, providers).await?;
    info!(
        "serving control on port {}, data ports: {:?}",
        server.control_port(),
        server.data_ports()
    );
    server.run().await
}

async fn run_single(args: ClientArgs) -> Result<()> {
    let config = args.to_test_config();
    // Configuration problems should surface before any connection attempt
    config.validate()?;

    println!("{}", report::config_banner(&config));

    let providers = ProviderRegistry::with_defaults();
    let mut control = ControlConnection::open(&args.host, args.port)
        .await
        .context("could not open control connection")?;
    let mut payloads = PayloadCache::new();

    let mut driver = BenchmarkDriver::new(&mut control, &providers, &mut payloads);
    let record = driver.run(&config).await?;

    if args.detail {
        println!("{}", report::detail_block(&record));
    } else {
        println!("{}", report::summary_line(&record));
    }

    if let Some(ref path) = args.output_file {
        let mut manager = ResultsManager::new(path);
        manager.add_record("run", record);
        manager.finalize()?;
    }
    Ok(())
}

async fn run_batch(args: BatchArgs) -> Result<()> {
    let base = args.client.to_test_config();
    let script = std::fs::read_to_string(&args.script)
        .with_context(|| format!("could not read script {:?}", args.script))?;

    let providers = ProviderRegistry::with_defaults();
    let mut control = ControlConnection::open(&args.client.host, args.client.port)
        .await
        .context("could not open control connection")?;
    let mut payloads = PayloadCache::new();

    let runner = BatchRunner::new(base);
    let outcomes = runner
        .run_script(&script, &mut control, &providers, &mut payloads)
        .await;

    let mut manager = args.client.output_file.as_ref().map(|path| ResultsManager::new(path));
    let mut failures = 0usize;
    for outcome in &outcomes {
        let label = outcome.label();
        match &outcome.result {
            Ok(record) => {
                if args.client.detail {
                    println!("{}:\n{}", label, report::detail_block(record));
                } else {
                    println!("{}: {}", label, report::summary_line(record));
                }
                if let Some(ref mut manager) = manager {
                    manager.add_record(label, record.clone());
                }
            }
            Err(error) => {
                failures += 1;
                println!("{}", report::failure_line(&label, error));
                if let Some(ref mut manager) = manager {
                    manager.add_failure(label, error.clone());
                }
            }
        }
    }

    if let Some(manager) = manager {
        manager.finalize()?;
    }
    info!("batch complete: {} runs, {} failed", outcomes.len(), failures);
    Ok(())
}
