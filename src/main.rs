use anyhow::Result;
use open_charge_point::config::Config;
use open_charge_point::controller::{self, ChargePoint, CommandRouter};
use open_charge_point::hardware::DeviceFactory;
use open_charge_point::ocpp::client::{ClientSettings, ConnectionEvent, WebSocketClient};
use open_charge_point::ocpp::messages::Reason;
use open_charge_point::ocpp::CallHandler;
use open_charge_point::repo;
use open_charge_point::telemetry::{init_tracing, shutdown_signal};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const CLIENT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cfg = Config::load()?;
    let _guard = init_tracing(&cfg.logging);

    info!(
        charge_point_id = %cfg.charge_point.id,
        server = %cfg.connection.server_uri,
        evses = cfg.evses.len(),
        "starting Open Charge Point"
    );

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let (cp, client) = assemble(&cfg).await?;
        cp.start();

        let router: Arc<dyn CallHandler> = Arc::new(CommandRouter::new(cp.clone()));
        spawn_connection_events(&cp, &client);
        let client_task = tokio::spawn(client.clone().run(router, cp.token()));

        tokio::select! {
            _ = &mut shutdown => {
                cp.cleanup(Reason::Local).await;
                wait_for_client(client_task).await;
                break;
            }
            _ = cp.restart_requested() => {
                info!("reset complete, rebuilding charge point");
                wait_for_client(client_task).await;
            }
        }
    }

    warn!("shutdown complete");
    Ok(())
}

async fn assemble(cfg: &Config) -> Result<(Arc<ChargePoint>, Arc<WebSocketClient>)> {
    let repository = repo::from_config(&cfg.storage);
    let configuration = Arc::new(controller::load_configuration(cfg, repository.as_ref()).await);

    let client = WebSocketClient::new(
        ClientSettings {
            server_uri: cfg.connection.server_uri.clone(),
            charge_point_id: cfg.charge_point.id.clone(),
            reconnect_delay: Duration::from_secs(cfg.connection.reconnect_delay_seconds),
            max_reconnect_delay: Duration::from_secs(cfg.connection.max_reconnect_delay_seconds),
        },
        configuration.clone(),
    );

    let cp = ChargePoint::builder(cfg.clone())
        .configuration(configuration)
        .transport(client.clone())
        .repository(repository)
        .with_configured_devices(&DeviceFactory::new(cfg.hardware.clone()))?
        .build()
        .await?;
    Ok((cp, client))
}

/// Boot whenever the socket comes up. Subscribes before returning, so call it
/// ahead of starting the client.
fn spawn_connection_events(cp: &Arc<ChargePoint>, client: &WebSocketClient) {
    let mut events = client.subscribe();
    let token = cp.token();
    let cp = Arc::downgrade(cp);
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = token.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(ConnectionEvent::Connected) => {
                    let Some(cp) = cp.upgrade() else { break };
                    cp.on_connected().await;
                }
                Ok(ConnectionEvent::Disconnected) => warn!("central system connection lost"),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });
}

async fn wait_for_client(task: JoinHandle<()>) {
    if tokio::time::timeout(CLIENT_SHUTDOWN_TIMEOUT, task).await.is_err() {
        warn!("websocket client did not stop in time");
    }
}
