#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Failed to read target line: {source}")]
    Handshake { source: eyre::Error },

    #[error("Failed to connect to {target}: {source}")]
    Connect {
        target: String,
        source: std::io::Error,
    },

    #[error("Relay for {target} failed: {source}")]
    Relay {
        target: String,
        source: super::RelayError,
    },
}

/// Read the target line off a freshly accepted stream and run its relay.
///
/// Errors are logged here. Returning drops the stream, which closes it.
pub async fn handle(accepted: super::AcceptedStream) {
    let super::AcceptedStream { stream, peer } = accepted;
    let id = stream.id();
    match dispatch(stream).await {
        Ok(target) => tracing::info!("Stream {id} from {peer} to {target} finished"),
        Err(e) => tracing::error!("Stream {id} from {peer}: {e}"),
    }
}

/// Route a stream by its target line. Returns the target once its relay ended.
pub async fn dispatch<S>(stream: S) -> Result<quic_tunnel_net::Target, DispatchError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    // The BufReader may already hold bytes past the target line, so the relay
    // has to keep reading through it.
    let mut stream = tokio::io::BufReader::new(stream);
    let line = quic_tunnel_net::read_handshake(&mut stream)
        .await
        .map_err(|source| DispatchError::Handshake { source })?;
    let target = quic_tunnel_net::Target::parse(&line);
    tracing::info!("Relaying to {target}");

    match &target {
        quic_tunnel_net::Target::Udp => super::relay::udp(stream).await,
        quic_tunnel_net::Target::Tcp(addr) => {
            let dest = tokio::net::TcpStream::connect(addr.as_str())
                .await
                .map_err(|source| DispatchError::Connect {
                    target: addr.clone(),
                    source,
                })?;
            super::relay::tcp(stream, dest).await
        }
    }
    .map_err(|source| DispatchError::Relay {
        target: target.to_string(),
        source,
    })?;

    Ok(target)
}
