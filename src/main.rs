use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;
use vdms_relay::{observability, server, Relay, RelayConfig};

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let config = RelayConfig::from_env().context("load relay config")?;
    info!(
        bind = %config.bind,
        queue_capacity = config.relay.queue_capacity,
        mailbox_capacity = config.relay.connection.mailbox_capacity,
        max_frame_bytes = config.relay.connection.max_frame_bytes,
        delivery = ?config.relay.delivery,
        broadcast_policy = ?config.relay.broadcast_policy,
        disconnect_policy = ?config.relay.connection.disconnect_policy,
        "starting relay"
    );

    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("bind {}", config.bind))?;
    let relay = Relay::start(config.relay);

    tokio::select! {
        res = server::serve(listener, &relay) => res.context("accept loop")?,
        res = tokio::signal::ctrl_c() => {
            res.context("listen for ctrl-c")?;
            info!("ctrl-c received, stopping relay");
        }
    }

    let stats = relay.stats();
    relay.shutdown().await;
    info!(
        requests_routed = stats.to_consumers.routed,
        requests_delivered = stats.to_consumers.delivered,
        requests_lost = stats.to_consumers.lost,
        replies_routed = stats.to_producers.routed,
        replies_unmatched = stats.to_producers.misses,
        "relay stopped"
    );
    Ok(())
}
