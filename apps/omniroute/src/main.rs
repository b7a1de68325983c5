use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use omniroute_core::Engine;
use omniroute_provider_core::{
    Event, EventHub, MachineRecord, MemoryConfigStore, ProviderRuntime,
};
use omniroute_provider_impl::{ExecutorRegistry, UpstreamClientConfig, WreqUpstreamClient};

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "omniroute=info,warn".into()),
        )
        .init();

    let args = cli::Cli::parse();

    let raw = tokio::fs::read(&args.config)
        .await
        .with_context(|| format!("reading machine config {}", args.config))?;
    let record: MachineRecord =
        serde_json::from_slice(&raw).context("parsing machine config")?;
    info!(
        event = "config_loaded",
        machine_id = %args.machine_id,
        providers = record.providers.len(),
        aliases = record.model_aliases.len(),
        combos = record.combos.len()
    );

    let store = Arc::new(MemoryConfigStore::new());
    store.insert(args.machine_id.clone(), record).await;

    let client_config = UpstreamClientConfig {
        proxy: args.proxy.clone(),
        ..UpstreamClientConfig::default()
    };
    let client = Arc::new(WreqUpstreamClient::new(client_config)?);
    let executors = Arc::new(ExecutorRegistry::standard());
    let runtime = Arc::new(ProviderRuntime::new());
    let _sweeper = runtime.spawn_sweeper();

    let events = EventHub::new(256);
    spawn_terminal_sink(events.clone());

    let engine = Arc::new(Engine::new(
        store,
        client,
        executors,
        runtime,
        events,
    ));
    let app = omniroute_router::gateway_router(engine, args.server_secret.clone());

    let bind = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    info!(event = "listening", addr = %bind);
    axum::serve(listener, app).await?;
    Ok(())
}

fn spawn_terminal_sink(events: EventHub) {
    tokio::spawn(async move {
        let mut rx = events.subscribe();
        while let Ok(event) = rx.recv().await {
            match event {
                Event::ConnectionUnavailable {
                    connection_id,
                    status,
                    cooldown_ms,
                    ..
                } => warn!(
                    event = "connection_unavailable",
                    connection_id = %connection_id,
                    status = ?status,
                    cooldown_ms
                ),
                Event::ConnectionActive { connection_id, .. } => {
                    info!(event = "connection_recovered", connection_id = %connection_id)
                }
                Event::TokenRefreshed {
                    connection_id,
                    provider,
                    ..
                } => info!(
                    event = "token_refreshed",
                    connection_id = %connection_id,
                    provider = %provider
                ),
            }
        }
    });
}
