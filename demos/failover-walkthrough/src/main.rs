//! Failover Walkthrough - drives a simulated stripe through a fail-over.
//!
//! Starts a stripe, creates a counter entity, increments it from a live
//! client, kills the active server and keeps incrementing through the
//! promoted passive.
//!
//! ```bash
//! RUST_LOG=passthrough=debug cargo run --package failover-walkthrough -- --servers 3
//! ```

use anyhow::{bail, Result};
use clap::Parser;
use passthrough::testing::{CounterMessage, CounterResponse, CounterService, COUNTER_CLASS, COUNTER_VERSION};
use passthrough::{ClusterControl, ServiceCatalog, StripeConfig};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "failover-walkthrough")]
#[command(about = "Drives a simulated stripe through a fail-over")]
struct Args {
    /// Number of simulated servers.
    #[arg(long, default_value_t = 3)]
    servers: usize,

    /// Seed for the active election. Random when omitted.
    #[arg(long)]
    seed: Option<u64>,

    /// Increments sent before and after the fail-over.
    #[arg(long, default_value_t = 5)]
    increments: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("failover_walkthrough=info".parse()?))
        .init();

    let args = Args::parse();
    let config = StripeConfig {
        election_seed: args.seed,
        ..StripeConfig::with_servers((0..args.servers).map(|i| format!("server-{i}")))
    };
    let service = CounterService::new();
    let catalog = ServiceCatalog::new().with_entity_service(service.clone());
    let stripe = ClusterControl::start(config, catalog).await?;
    tracing::info!(active = ?stripe.active_server_name().await, "stripe started");

    let connection = stripe.connect_client("walkthrough").await?;
    let counter = connection.entity_ref(COUNTER_CLASS, "visits", COUNTER_VERSION);
    counter.create(Vec::new()).await?;
    let endpoint = counter.fetch().await?;
    let codec = service.codec();

    for _ in 0..args.increments {
        endpoint
            .invoke_with_codec(&codec, &CounterMessage::Increment(1), true)
            .await?;
    }

    stripe.terminate_active().await?;
    let Some(active) = stripe.active_server_name().await else {
        bail!("no passive was left to take over; run with --servers 2 or more");
    };
    tracing::info!(%active, "fail-over complete");

    let mut value = 0;
    for _ in 0..args.increments {
        let CounterResponse::Value(v) = endpoint
            .invoke_with_codec(&codec, &CounterMessage::Increment(1), true)
            .await?;
        value = v;
    }
    tracing::info!(value, reconnects = service.stats().reconnects(), "counter survived fail-over");

    stripe.start_all_servers().await?;
    for name in stripe.running_server_names().await {
        let snapshot = stripe.snapshot(&name).await?;
        tracing::info!(
            server = %snapshot.name,
            role = %snapshot.role,
            entities = snapshot.entities.len(),
            passives = snapshot.passives,
            "server state"
        );
    }

    endpoint.release().await?;
    connection.close().await;
    stripe.shutdown().await;
    tracing::info!("Failover walkthrough finished");
    Ok(())
}
