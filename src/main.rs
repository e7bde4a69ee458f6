//! muxbench: one multiplexed connection vs. connection-per-request HTTP/1.1
//!
//! The same binary plays four parts:
//! - `--role server --transport mux`: answers calls on long-lived connections,
//!   every call on a connection handled concurrently
//! - `--role client --transport mux`: opens one connection and fires N
//!   concurrent calls over it
//! - `--role server --transport http`: plain HTTP/1.1 `GET /`
//! - `--role client --transport http`: fires N concurrent GETs through a
//!   connection pool
//!
//! Every server call sleeps a fixed delay, so the client's total time shows
//! whether the calls overlapped.

mod bench;
mod call;
mod config;
mod error;
mod listener;
mod protocols;

use bench::Completion;
use call::Transport;
use config::{Config, Role, TransportType};
use protocols::http::{HttpClient, HttpServer};
use protocols::mux::{MuxClient, MuxServer};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        role = ?config.role,
        transport = ?config.transport,
        addr = %config.addr(),
        concurrency = config.concurrency,
        delay_ms = config.delay.as_millis() as u64,
        pool = config.pool,
        serial = config.serial,
        "Starting muxbench"
    );

    let mut runtime = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers {
        runtime.worker_threads(workers);
    }
    let runtime = runtime.enable_all().build()?;

    let result = runtime.block_on(run(config));
    if let Err(e) = &result {
        error!(error = %e, "Fatal error");
    }
    result
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    match (config.role, config.transport) {
        (Role::Server, TransportType::Mux) => {
            let server = MuxServer::bind(config.addr(), config.delay).await?;
            server.run().await?;
        }
        (Role::Server, TransportType::Http) => {
            let server = HttpServer::bind(config.addr(), config.delay, config.serial).await?;
            server.run().await?;
        }
        (Role::Client, TransportType::Mux) => {
            let client = MuxClient::connect(config.addr()).await?;
            info!(peer = %client.peer_addr(), "Connected over a single connection");
            println!("--- Starting {} Concurrent Requests ---", config.concurrency);
            let client = Arc::new(client);
            benchmark(Arc::clone(&client), config.concurrency).await?;
            if let Ok(client) = Arc::try_unwrap(client) {
                client.close();
            }
        }
        (Role::Client, TransportType::Http) => {
            let client = HttpClient::new(config.addr(), config.pool);
            println!(
                "--- Starting {} Concurrent HTTP/1.1 Requests ---",
                config.concurrency
            );
            benchmark(Arc::new(client), config.concurrency).await?;
        }
    }
    Ok(())
}

async fn benchmark<T: Transport>(
    transport: Arc<T>,
    calls: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let report = bench::run(transport, calls, |c: &Completion| {
        println!("Finished Request {}", c.id);
    })
    .await?;
    print!("{}", report.render());
    Ok(())
}
