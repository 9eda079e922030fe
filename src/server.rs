//! TCP accept loop.

use std::{io, time::Duration};

use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::relay::Relay;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Accepts connections on `listener` and attaches each one to `relay`.
///
/// Accept failures are logged and skipped. Returns once the relay stops.
pub async fn serve(listener: TcpListener, relay: &Relay) -> io::Result<()> {
    let local_addr = listener.local_addr()?;
    info!(%local_addr, "relay listening");

    let registry = relay.registry().clone();
    loop {
        let accepted = tokio::select! {
            biased;
            _ = registry.stopped() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(%peer, error = %err, "failed to set TCP_NODELAY");
                }
                debug!(%peer, "accepted connection");
                relay.attach(stream);
            }
            Err(err) => {
                warn!(error = %err, "failed to accept connection");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }

    info!(%local_addr, "listener stopped");
    Ok(())
}
