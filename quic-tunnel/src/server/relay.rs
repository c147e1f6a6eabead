use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;

/// How long the UDP relay waits for the reply to one request.
pub const UDP_REPLY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Malformed UDP frame: {source}")]
    Frame {
        #[from]
        source: quic_tunnel_net::FrameError,
    },

    #[error("Failed to resolve {dest}: {source}")]
    Resolve {
        dest: String,
        source: std::io::Error,
    },

    #[error("Failed to open UDP socket towards {dest}: {source}")]
    Socket {
        dest: String,
        source: std::io::Error,
    },

    #[error("IO error: {source}")]
    Io { source: std::io::Error },
}

/// Copy bytes between a tunnel stream and a TCP destination.
///
/// Returns as soon as either direction hits EOF or an error. Both sides are
/// then closed, cutting off whatever the other direction still had in flight.
pub async fn tcp<S>(stream: S, dest: tokio::net::TcpStream) -> Result<(), RelayError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (mut stream_read, mut stream_write) = tokio::io::split(stream);
    let (mut dest_read, mut dest_write) = dest.into_split();

    let mut upstream =
        tokio::spawn(async move { tokio::io::copy(&mut stream_read, &mut dest_write).await });

    let result = tokio::select! {
        copied = tokio::io::copy(&mut dest_read, &mut stream_write) => {
            copied.map(|n| tracing::debug!("Destination closed after {n} bytes"))
        }
        copied = &mut upstream => match copied {
            Ok(copied) => copied.map(|n| tracing::debug!("Stream closed after {n} bytes")),
            Err(e) => Err(std::io::Error::other(e)),
        },
    };

    upstream.abort();
    let _ = stream_write.shutdown().await;

    result.map_err(|source| RelayError::Io { source })
}

/// Serve UDP request frames on a stream until the client closes it.
///
/// Every request goes out on a fresh socket connected to its destination, and
/// at most one non-empty reply per request is sent back. A request whose send
/// or reply fails (or times out) gets no response frame at all.
pub async fn udp<S>(stream: S) -> Result<(), RelayError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite,
{
    let (reader, writer) = tokio::io::split(stream);
    let mut requests =
        tokio_util::codec::FramedRead::new(reader, quic_tunnel_net::UdpRequestCodec);
    let mut responses =
        tokio_util::codec::FramedWrite::new(writer, quic_tunnel_net::UdpResponseCodec);

    let mut buf = vec![0u8; quic_tunnel_net::MAX_PAYLOAD_LEN];
    while let Some(request) = requests.next().await {
        let request = request?;
        let socket = connect_udp(&request.dest).await?;

        if let Err(e) = socket.send(&request.data).await {
            tracing::debug!("UDP send to {} failed: {e}", request.dest);
            continue;
        }

        match tokio::time::timeout(UDP_REPLY_TIMEOUT, socket.recv(&mut buf)).await {
            Ok(Ok(0)) => tracing::debug!("Empty UDP reply from {}", request.dest),
            Ok(Ok(n)) => {
                responses
                    .send(bytes::Bytes::copy_from_slice(&buf[..n]))
                    .await?;
            }
            Ok(Err(e)) => tracing::debug!("UDP receive from {} failed: {e}", request.dest),
            Err(_) => tracing::debug!("No UDP reply from {} in time", request.dest),
        }
    }

    Ok(())
}

async fn connect_udp(dest: &str) -> Result<tokio::net::UdpSocket, RelayError> {
    let addr = tokio::net::lookup_host(dest)
        .await
        .and_then(|mut addrs| {
            addrs.next().ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses found")
            })
        })
        .map_err(|source| RelayError::Resolve {
            dest: dest.to_string(),
            source,
        })?;

    let bind: std::net::SocketAddr = if addr.is_ipv4() {
        (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket_error = |source| RelayError::Socket {
        dest: dest.to_string(),
        source,
    };
    let socket = tokio::net::UdpSocket::bind(bind)
        .await
        .map_err(socket_error)?;
    socket.connect(addr).await.map_err(socket_error)?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn tcp_echo() -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let (mut read, mut write) = socket.split();
            let _ = tokio::io::copy(&mut read, &mut write).await;
        });
        addr
    }

    async fn udp_echo() -> std::net::SocketAddr {
        let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                let (n, from) = socket.recv_from(&mut buf).await.unwrap();
                socket.send_to(&buf[..n], from).await.unwrap();
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_tcp_relay_echo() {
        let addr = tcp_echo().await;
        let (mut client, server_side) = tokio::io::duplex(1024);
        let dest = tokio::net::TcpStream::connect(addr).await.unwrap();
        let relay = tokio::spawn(tcp(server_side, dest));

        client.write_all(b"hello tunnel").await.unwrap();
        let mut echoed = [0u8; 12];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello tunnel");

        client.shutdown().await.unwrap();
        relay.await.unwrap().unwrap();

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_tcp_relay_ends_when_destination_closes() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"bye").await.unwrap();
        });

        let (mut client, server_side) = tokio::io::duplex(1024);
        let dest = tokio::net::TcpStream::connect(addr).await.unwrap();
        let relay = tokio::spawn(tcp(server_side, dest));

        // the client never closes its side, the relay still finishes
        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"bye");
        relay.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_udp_relay_round_trip() {
        let echo = udp_echo().await.to_string();
        let (client, server_side) = tokio::io::duplex(4096);
        let relay = tokio::spawn(udp(server_side));
        let mut tunnel = crate::UdpTunnel::new(client);

        for payload in [&b"ping"[..], &b"second datagram"[..]] {
            tunnel.send_to(&echo, payload).await.unwrap();
            assert_eq!(&tunnel.recv().await.unwrap().unwrap()[..], payload);
        }

        drop(tunnel);
        relay.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_udp_lost_reply_sends_nothing() {
        let echo = udp_echo().await.to_string();
        let silent = {
            let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
            socket.local_addr().unwrap().to_string()
        };

        let (client, server_side) = tokio::io::duplex(4096);
        tokio::spawn(udp(server_side));
        let mut tunnel = crate::UdpTunnel::new(client);

        tunnel.send_to(&silent, &b"into the void"[..]).await.unwrap();
        tunnel.send_to(&echo, &b"pong"[..]).await.unwrap();

        // the first frame back answers the second request
        assert_eq!(&tunnel.recv().await.unwrap().unwrap()[..], b"pong");
    }

    #[tokio::test]
    async fn test_udp_unresolvable_destination_ends_session() {
        let (client, server_side) = tokio::io::duplex(4096);
        let relay = tokio::spawn(udp(server_side));
        let mut tunnel = crate::UdpTunnel::new(client);

        tunnel.send_to("no port here", &b"x"[..]).await.unwrap();

        assert!(matches!(
            relay.await.unwrap(),
            Err(RelayError::Resolve { .. })
        ));
        assert!(tunnel.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_udp_truncated_frame() {
        let (mut client, server_side) = tokio::io::duplex(64);
        let relay = tokio::spawn(udp(server_side));

        client.write_all(&[9, b'1', b'2', b'7']).await.unwrap();
        client.shutdown().await.unwrap();

        assert!(matches!(relay.await.unwrap(), Err(RelayError::Frame { .. })));
    }
}
