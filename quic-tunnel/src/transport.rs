//! The seam between the connection manager and the QUIC stack.
//!
//! [`crate::client::ConnectionManager`] only needs to dial a connection, open
//! streams on it and close it with a diagnostic code. Those three operations
//! are captured by [`Connector`] and [`TunnelConnection`], with the quinn
//! implementation in [`QuicConnector`] / [`QuicConnection`].

/// Dials new tunnel connections.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: TunnelConnection;

    /// Establish a fresh connection to `server_addr` (`host:port`).
    async fn connect(
        &self,
        server_addr: &str,
        skip_cert_verify: bool,
    ) -> eyre::Result<Self::Connection>;
}

/// One live multiplexed connection.
#[async_trait::async_trait]
pub trait TunnelConnection: Send + Sync + 'static {
    type Stream: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static;

    /// Open a new bidirectional stream.
    async fn open_stream(&self) -> eyre::Result<Self::Stream>;

    /// Close the connection and every stream on it.
    fn close(&self, code: u32, reason: &str);
}

/// Dials QUIC connections with quinn.
///
/// Each connection gets its own client endpoint on an ephemeral local port,
/// so replacing a connection also throws away its socket.
#[derive(Debug, Default, Clone)]
pub struct QuicConnector;

#[async_trait::async_trait]
impl Connector for QuicConnector {
    type Connection = QuicConnection;

    async fn connect(
        &self,
        server_addr: &str,
        skip_cert_verify: bool,
    ) -> eyre::Result<QuicConnection> {
        let remote = tokio::net::lookup_host(server_addr)
            .await?
            .next()
            .ok_or_else(|| eyre::eyre!("{server_addr} did not resolve to any address"))?;

        let bind: std::net::SocketAddr = if remote.is_ipv4() {
            (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let endpoint = quinn::Endpoint::client(bind)?;

        let config = quic_tunnel_net::tls::client_config(skip_cert_verify)?;
        let connection = endpoint
            .connect_with(config, remote, server_name(server_addr))?
            .await?;

        tracing::info!(
            "Connected to {server_addr} ({remote}), skip_cert_verify: {skip_cert_verify}"
        );
        Ok(QuicConnection {
            connection,
            _endpoint: endpoint,
        })
    }
}

/// A quinn connection together with the endpoint that owns its socket.
#[derive(Debug)]
pub struct QuicConnection {
    connection: quinn::Connection,
    _endpoint: quinn::Endpoint, // Keep the client socket bound for this connection
}

#[async_trait::async_trait]
impl TunnelConnection for QuicConnection {
    type Stream = quic_tunnel_net::TunnelStream;

    async fn open_stream(&self) -> eyre::Result<quic_tunnel_net::TunnelStream> {
        let (send, recv) = self.connection.open_bi().await?;
        Ok(quic_tunnel_net::TunnelStream::new(send, recv))
    }

    fn close(&self, code: u32, reason: &str) {
        self.connection
            .close(quinn::VarInt::from_u32(code), reason.as_bytes());
    }
}

/// TLS server name for `host:port`, with IPv6 brackets removed.
fn server_name(server_addr: &str) -> &str {
    let host = server_addr
        .rsplit_once(':')
        .map_or(server_addr, |(host, _port)| host);
    host.trim_start_matches('[').trim_end_matches(']')
}
