/// Streams waiting to be picked up by [`AcceptPump::accept`].
///
/// Peer tasks block once this many streams are queued, which in turn stops
/// them from accepting more streams from their connection.
pub const ACCEPT_QUEUE_CAPACITY: usize = 4;

/// A stream opened by a client, ready for its handshake line to be read.
#[derive(Debug)]
pub struct AcceptedStream {
    pub stream: quic_tunnel_net::TunnelStream,
    pub peer: std::net::SocketAddr,
}

#[derive(Debug, thiserror::Error)]
pub enum AcceptError {
    #[error("listener closed")]
    Closed,
}

/// Turns every stream of every connection on an endpoint into one queue.
///
/// One task accepts connections and one task per connection accepts its
/// streams, so a single peer never holds up the others.
pub struct AcceptPump {
    endpoint: quinn::Endpoint,
    streams: tokio::sync::mpsc::Receiver<AcceptedStream>,
}

impl AcceptPump {
    pub fn new(endpoint: quinn::Endpoint) -> Self {
        let (sender, streams) = tokio::sync::mpsc::channel(ACCEPT_QUEUE_CAPACITY);
        tokio::spawn(accept_connections(endpoint.clone(), sender));
        Self { endpoint, streams }
    }

    /// Next accepted stream, or [`AcceptError::Closed`] once the endpoint is
    /// closed and every connection has wound down.
    pub async fn accept(&mut self) -> Result<AcceptedStream, AcceptError> {
        self.streams.recv().await.ok_or(AcceptError::Closed)
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.endpoint.local_addr()
    }

    /// Stop accepting and close every connection.
    pub fn close(&self) {
        self.endpoint
            .close(quinn::VarInt::from_u32(0), b"server shutting down");
    }
}

async fn accept_connections(
    endpoint: quinn::Endpoint,
    sender: tokio::sync::mpsc::Sender<AcceptedStream>,
) {
    while let Some(incoming) = endpoint.accept().await {
        let sender = sender.clone();
        tokio::spawn(async move {
            let remote = incoming.remote_address();
            match incoming.await {
                Ok(connection) => accept_streams(connection, sender).await,
                Err(e) => tracing::warn!("Handshake with {remote} failed: {e}"),
            }
        });
    }
    tracing::info!("Endpoint closed, no longer accepting connections");
}

async fn accept_streams(
    connection: quinn::Connection,
    sender: tokio::sync::mpsc::Sender<AcceptedStream>,
) {
    let peer = connection.remote_address();
    tracing::info!("Accepted connection from {peer}");

    loop {
        let (send, recv) = match connection.accept_bi().await {
            Ok(streams) => streams,
            Err(e) => {
                tracing::info!("Connection from {peer} ended: {e}");
                connection.close(
                    quinn::VarInt::from_u32(quic_tunnel_net::SERVER_ACCEPT_CODE),
                    e.to_string().as_bytes(),
                );
                return;
            }
        };

        let stream = quic_tunnel_net::TunnelStream::new(send, recv);
        tracing::debug!("Accepted stream {} from {peer}", stream.id());
        if sender.send(AcceptedStream { stream, peer }).await.is_err() {
            // Nobody is accepting anymore
            connection.close(
                quinn::VarInt::from_u32(quic_tunnel_net::SERVER_ACCEPT_CODE),
                b"listener closed",
            );
            return;
        }
    }
}
