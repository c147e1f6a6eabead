//! Server side of the tunnel
//!
//! [`listen`] binds the QUIC endpoint, [`serve`] hands every stream accepted on
//! it to its own dispatcher task. A dispatcher reads the target line and runs
//! either the TCP or the UDP relay until the session ends.

mod accept;
pub mod dispatch;
pub mod relay;

pub use accept::{ACCEPT_QUEUE_CAPACITY, AcceptError, AcceptPump, AcceptedStream};
pub use dispatch::DispatchError;
pub use relay::{RelayError, UDP_REPLY_TIMEOUT};

/// Bind a QUIC endpoint on `addr` and start accepting connections on it.
pub fn listen(
    addr: std::net::SocketAddr,
    tls: quinn::ServerConfig,
) -> eyre::Result<AcceptPump> {
    let endpoint = quinn::Endpoint::server(tls, addr)?;
    tracing::info!("Listening on {}", endpoint.local_addr()?);
    Ok(AcceptPump::new(endpoint))
}

/// Dispatch accepted streams until the pump closes or `shutdown` fires.
///
/// Cancelling closes the endpoint. Relays are not told about it, they simply
/// see their streams fail.
pub async fn serve(mut pump: AcceptPump, shutdown: tokio_util::sync::CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("Shutting down listener");
                pump.close();
                break;
            }
            accepted = pump.accept() => match accepted {
                Ok(accepted) => {
                    tokio::spawn(dispatch::handle(accepted));
                }
                Err(e) => {
                    tracing::info!("Stopped serving: {e}");
                    break;
                }
            },
        }
    }
}
