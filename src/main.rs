mod config;
mod gatt;
mod identity;
mod peripheral;
mod provisioning;
mod relay;
mod supervisor;

#[cfg(test)]
mod test_support;

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use identity::DeviceIdentity;
use provisioning::{ClaimHandoff, HttpClaimer, NmcliJoiner, ProvisioningSession, StatusReporter};
use relay::{CommandDispatcher, RelayClient, WsConnector};
use supervisor::{ProcessSupervisor, Provisioner};

#[derive(Parser)]
#[command(name = "homebase")]
#[command(about = "HomeBase gateway: WiFi provisioning over BLE and backend relay for sprinkler peripherals")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = config::Config::load_or_default(&cli.config)?;

    // Initialize tracing/logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!("HomeBase gateway v{}", env!("CARGO_PKG_VERSION"));

    let identity = DeviceIdentity::load(&config.identity)?;
    let (token_tx, token_rx) = watch::channel(identity.token.clone());

    // Credential provisioning over the GATT bridge
    let (reporter, statuses) = StatusReporter::new();
    let (session, handoffs) = ProvisioningSession::new(
        identity.device_id.clone(),
        NmcliJoiner::new(&config.wifi),
        HttpClaimer::new(&config.backend)?,
        reporter,
    );

    if config.gatt.enabled {
        let bridge = gatt::GattBridge::bind(&config.gatt.bind, session).await?;
        tokio::spawn(async move {
            if let Err(e) = bridge.run(statuses).await {
                error!("GATT bridge failed: {}", e);
            }
        });
    } else {
        info!("GATT bridge disabled, credential provisioning unavailable");
    }

    tokio::spawn(run_handoff_task(
        handoffs,
        config.identity.token_path.clone(),
        token_tx,
    ));

    // Backend relay
    let supervisor = Arc::new(ProcessSupervisor::new(config.provisioner.clone()));
    let dispatcher = CommandDispatcher::new(
        peripheral::HttpPeripheral::new(config.peripheral.timeout())?,
        Arc::clone(&supervisor),
        config.peripheral.timeout(),
    );
    let relay = RelayClient::new(
        WsConnector,
        dispatcher,
        config.backend.url.clone(),
        identity.device_id.clone(),
        token_rx,
        config.backend.reconnect_backoff(),
    );

    let mut relay_state = relay.state();
    tokio::spawn(async move {
        while relay_state.changed().await.is_ok() {
            let state = *relay_state.borrow_and_update();
            info!("Backend connection: {:?}", state);
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let relay_task = tokio::spawn(relay.run(shutdown_rx));

    info!("Gateway running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    shutdown_tx.send_replace(true);
    supervisor.stop();
    if let Err(e) = relay_task.await {
        error!("Relay task failed: {}", e);
    }

    Ok(())
}

/// Persist each newly claimed token and hand it to the relay client
async fn run_handoff_task(
    mut handoffs: tokio::sync::mpsc::UnboundedReceiver<ClaimHandoff>,
    token_path: PathBuf,
    token_tx: watch::Sender<String>,
) {
    while let Some(ClaimHandoff { token }) = handoffs.recv().await {
        if let Err(e) = identity::store_token(&token_path, &token) {
            error!("{:#}", e);
        }
        token_tx.send_replace(token);
        info!("Relay will use the claimed token");
    }
}
