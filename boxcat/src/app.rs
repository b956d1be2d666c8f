use anyhow::{Context, Result};
use boxcat_core::config::HarnessConfig;
use boxcat_harness::harness;
use boxcat_protocol::{ClientRuntime, ConnectionOptions};
use tokio::signal;
use tracing::{error, info, warn};

/// Harness the server, connect one client, and log everything it receives
/// until the server goes away or Ctrl-C.
pub async fn watch(config: HarnessConfig, nick: String) -> Result<()> {
    let server = harness(&config)
        .await
        .context("error starting server")?;

    let mut client = ClientRuntime::with_options(
        nick.clone(),
        config.client.host.clone(),
        server.port(),
        ConnectionOptions::from_config(&config.client),
    );

    let mut channels = match client.start().await {
        Ok(channels) => channels,
        Err(e) => {
            // Still tear the server down before reporting.
            if let Err(stop_err) = server.stop().await {
                warn!("error stopping server: {}", stop_err);
            }
            return Err(e).context("error starting client");
        }
    };

    loop {
        tokio::select! {
            result = signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Received SIGINT, shutting down..."),
                    Err(err) => error!("Unable to listen for shutdown signal: {}", err),
                }
                break;
            }
            message = channels.inbound.recv() => match message {
                Some(message) => info!("client {}: received: {}", nick, message),
                None => {
                    info!("client {}: connection closed", nick);
                    break;
                }
            },
        }
    }

    let client_result = client.stop().await;

    // Closed once both loops are done, so this terminates.
    while let Some(err) = channels.errors.recv().await {
        error!("client {}: {}", nick, err);
    }

    let status = server.stop().await.context("error stopping server")?;
    if let Some(status) = status {
        info!("Server exited: {}", status);
    }

    client_result.context("error stopping client")?;
    Ok(())
}
