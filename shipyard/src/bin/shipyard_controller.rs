//! Runs one shipyard controller replica until Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use shipyard::prelude::*;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ControllerConfig::from_env();
    shipyard::observability::init_logging(&config.log_level, config.log_format);
    config.validate().context("invalid controller configuration")?;

    tracing::info!(
        identity = %config.identity,
        nats_url = %config.nats_url,
        configuration_service = %config.configuration_service,
        "Configuration loaded"
    );

    let leases = Arc::new(InMemoryLeaseBackend::new(config.lease_config().lease_duration));
    let controller = ShipyardController::new(
        config.clone(),
        Arc::new(InMemorySequenceStore::new()),
        Arc::new(InMemoryMessageBus::new().with_history_limit(0)),
        shipyard_provider(&config),
        leases,
    );

    let shutdown = Arc::new(CancellationToken::new());
    let signal = {
        let shutdown = Arc::clone(&shutdown);
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("Shutdown requested"),
                Err(e) => tracing::error!(error = %e, "Failed to listen for Ctrl-C"),
            }
            shutdown.cancel("shutdown requested");
        }
    };

    let (result, ()) = tokio::join!(controller.run(Arc::clone(&shutdown)), signal);
    result.context("controller failed")?;
    Ok(())
}

#[cfg(feature = "http-provider")]
fn shipyard_provider(config: &ControllerConfig) -> Arc<dyn ShipyardProvider> {
    Arc::new(shipyard::provider::HttpShipyardProvider::new(
        &config.configuration_service,
    ))
}

#[cfg(not(feature = "http-provider"))]
fn shipyard_provider(_config: &ControllerConfig) -> Arc<dyn ShipyardProvider> {
    Arc::new(shipyard::provider::file::FileShipyardProvider::new("shipyards"))
}
