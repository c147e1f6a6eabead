//! Client-side tunnel access
//!
//! The client keeps at most one QUIC connection to the server and opens one
//! stream per proxied session on it. [`ConnectionManager::dial`] hides the
//! connection entirely: callers get back a byte stream whose first line
//! (the target) has already been sent.
//!
//! ## TCP
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//!
//! let manager = quic_tunnel::ConnectionManager::quic(true);
//! let mut stream = manager.dial("server.example:4433", "example.com:80").await?;
//!
//! stream.write_all(b"GET / HTTP/1.0\r\nHost: example.com\r\n\r\n").await?;
//! let mut response = Vec::new();
//! stream.read_to_end(&mut response).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## UDP
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = quic_tunnel::ConnectionManager::quic(true);
//! let mut udp = manager.dial_udp("server.example:4433").await?;
//!
//! udp.send_to("8.8.8.8:53", b"...dns query...".to_vec()).await?;
//! if let Some(reply) = udp.recv().await {
//!     println!("{} byte reply", reply?.len());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Reconnection
//!
//! A connection that can no longer open streams (idle timeout, server restart)
//! is closed with code [`quic_tunnel_net::CLIENT_RECONNECT_CODE`] and replaced
//! by a fresh one within the same `dial`. Only one replacement is tried per
//! call; see [`DialState`] for the full transition table.

use futures_util::{SinkExt, StreamExt};

/// Where a single [`ConnectionManager::dial`] stands.
///
/// | state                          | event        | next                           |
/// |--------------------------------|--------------|--------------------------------|
/// | `Disconnected`                 | `ConnectOk`  | `Connected { retried: false }` |
/// | `Disconnected`                 | `ConnectErr` | `Failed`                       |
/// | `Connected { .. }`             | `OpenOk`     | `Ready`                        |
/// | `Connected { retried: false }` | `OpenErr`    | `Reconnecting`                 |
/// | `Connected { retried: true }`  | `OpenErr`    | `Failed`                       |
/// | `Reconnecting`                 | `ConnectOk`  | `Connected { retried: true }`  |
/// | `Reconnecting`                 | `ConnectErr` | `Failed`                       |
///
/// `Ready` and `Failed` are terminal. Any other pairing is a driver bug and
/// ends in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialState {
    /// No connection is held; dial with the configured verification flag.
    Disconnected,
    /// A connection is held; open a stream on it.
    Connected { retried: bool },
    /// The held connection was closed after a failed stream open.
    Reconnecting,
    /// A stream is open.
    Ready,
    /// The dial gave up.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialEvent {
    ConnectOk,
    ConnectErr,
    OpenOk,
    OpenErr,
}

impl DialState {
    pub fn next(self, event: DialEvent) -> DialState {
        match (self, event) {
            (DialState::Disconnected, DialEvent::ConnectOk) => {
                DialState::Connected { retried: false }
            }
            (DialState::Connected { .. }, DialEvent::OpenOk) => DialState::Ready,
            (DialState::Connected { retried: false }, DialEvent::OpenErr) => {
                DialState::Reconnecting
            }
            (DialState::Reconnecting, DialEvent::ConnectOk) => {
                DialState::Connected { retried: true }
            }
            (DialState::Ready, _) => DialState::Ready,
            _ => DialState::Failed,
        }
    }

    /// Verification flag to dial with from this state.
    ///
    /// Reconnects always skip certificate verification, whatever the manager
    /// was configured with.
    fn skip_cert_verify(self, configured: bool) -> bool {
        match self {
            DialState::Reconnecting => true,
            _ => configured,
        }
    }
}

/// Owns the client's single tunnel connection.
///
/// All `dial` calls on one manager are serialized, handshake write included.
pub struct ConnectionManager<C: crate::Connector = crate::QuicConnector> {
    connector: C,
    skip_cert_verify: bool,
    connection: tokio::sync::Mutex<Option<C::Connection>>,
}

impl ConnectionManager<crate::QuicConnector> {
    /// Manager dialing real QUIC connections.
    pub fn quic(skip_cert_verify: bool) -> Self {
        Self::new(crate::QuicConnector, skip_cert_verify)
    }
}

impl<C: crate::Connector> ConnectionManager<C> {
    pub fn new(connector: C, skip_cert_verify: bool) -> Self {
        Self {
            connector,
            skip_cert_verify,
            connection: tokio::sync::Mutex::new(None),
        }
    }

    /// Open a stream to the server and announce `target_addr` on it.
    ///
    /// `target_addr` is either a `host:port` TCP target or
    /// [`quic_tunnel_net::UDP_DESCRIPTOR`]. The live connection is reused no
    /// matter which `server_addr` later calls pass.
    #[tracing::instrument(skip(self))]
    pub async fn dial(
        &self,
        server_addr: &str,
        target_addr: &str,
    ) -> Result<<C::Connection as crate::TunnelConnection>::Stream, DialError> {
        use crate::TunnelConnection;
        use tokio::io::AsyncWriteExt;

        let mut connection = self.connection.lock().await;
        let mut state = match *connection {
            Some(_) => DialState::Connected { retried: false },
            None => DialState::Disconnected,
        };

        // outcome of the last connect or open, consumed by the terminal states
        let mut opened = None;
        let mut failure = None;

        let mut stream = loop {
            state = match state {
                DialState::Disconnected | DialState::Reconnecting => {
                    let skip = state.skip_cert_verify(self.skip_cert_verify);
                    if skip && !self.skip_cert_verify {
                        tracing::warn!(
                            "Reconnecting to {server_addr} without certificate verification"
                        );
                    }
                    match self.connector.connect(server_addr, skip).await {
                        Ok(conn) => {
                            if state == DialState::Reconnecting {
                                tracing::info!("Re-established connection to {server_addr}");
                            }
                            *connection = Some(conn);
                            state.next(DialEvent::ConnectOk)
                        }
                        Err(source) => {
                            tracing::error!("Dial connection to {server_addr} failed: {source}");
                            failure = Some(DialError::Connect {
                                server: server_addr.to_string(),
                                source,
                            });
                            state.next(DialEvent::ConnectErr)
                        }
                    }
                }
                DialState::Connected { retried } => {
                    let result = match connection.as_ref() {
                        Some(conn) => conn.open_stream().await,
                        None => Err(eyre::eyre!("no connection held")),
                    };
                    match result {
                        Ok(stream) => {
                            opened = Some(stream);
                            state.next(DialEvent::OpenOk)
                        }
                        Err(source) => {
                            let next = state.next(DialEvent::OpenErr);
                            if next == DialState::Reconnecting {
                                tracing::info!(
                                    "Open stream failed: {source}, replacing connection (retried: {retried})"
                                );
                                if let Some(stale) = connection.take() {
                                    stale.close(
                                        quic_tunnel_net::CLIENT_RECONNECT_CODE,
                                        &source.to_string(),
                                    );
                                }
                            } else {
                                tracing::error!("Open stream on new connection failed: {source}");
                            }
                            failure = Some(DialError::OpenStream { source });
                            next
                        }
                    }
                }
                DialState::Ready => match opened.take() {
                    Some(stream) => break stream,
                    None => {
                        return Err(DialError::OpenStream {
                            source: eyre::eyre!("dial ready without an open stream"),
                        });
                    }
                },
                DialState::Failed => {
                    return Err(failure.unwrap_or_else(|| DialError::OpenStream {
                        source: eyre::eyre!("dial failed"),
                    }));
                }
            };
            tracing::trace!("Dial moved to {state:?}");
        };

        let line = quic_tunnel_net::Target::from(target_addr).to_line();
        if let Err(source) = stream.write_all(line.as_bytes()).await {
            tracing::error!("Failed to send target address to server: {source}");
            let _ = stream.shutdown().await;
            return Err(DialError::Handshake {
                target: target_addr.to_string(),
                source,
            });
        }

        tracing::info!("Opened stream to {server_addr} for {target_addr}");
        Ok(stream)
    }

    /// Open a UDP relay session.
    pub async fn dial_udp(
        &self,
        server_addr: &str,
    ) -> Result<UdpTunnel<<C::Connection as crate::TunnelConnection>::Stream>, DialError> {
        let stream = self
            .dial(server_addr, quic_tunnel_net::UDP_DESCRIPTOR)
            .await?;
        Ok(UdpTunnel::new(stream))
    }
}

/// Client end of a UDP relay session.
///
/// Requests are answered one at a time and a lost reply produces nothing, so
/// `recv` after a lost reply waits for the reply to a later request.
pub struct UdpTunnel<S> {
    requests: tokio_util::codec::FramedWrite<
        tokio::io::WriteHalf<S>,
        quic_tunnel_net::UdpRequestCodec,
    >,
    responses: tokio_util::codec::FramedRead<
        tokio::io::ReadHalf<S>,
        quic_tunnel_net::UdpResponseCodec,
    >,
}

impl<S> UdpTunnel<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite,
{
    /// Wrap a stream whose `__UDP__` handshake line was already sent.
    pub fn new(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            requests: tokio_util::codec::FramedWrite::new(
                writer,
                quic_tunnel_net::UdpRequestCodec,
            ),
            responses: tokio_util::codec::FramedRead::new(
                reader,
                quic_tunnel_net::UdpResponseCodec,
            ),
        }
    }

    /// Ask the server to send `data` to `dest` (`host:port`).
    pub async fn send_to(
        &mut self,
        dest: &str,
        data: impl Into<bytes::Bytes>,
    ) -> Result<(), quic_tunnel_net::FrameError> {
        self.requests
            .send(quic_tunnel_net::UdpRequest::new(dest, data))
            .await
    }

    /// Next reply; `None` once the server closed the session.
    pub async fn recv(&mut self) -> Option<Result<bytes::Bytes, quic_tunnel_net::FrameError>> {
        self.responses.next().await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("Failed to connect to {server}: {source}")]
    Connect { server: String, source: eyre::Error },

    #[error("Failed to open stream: {source}")]
    OpenStream { source: eyre::Error },

    #[error("Failed to send target {target} to server: {source}")]
    Handshake {
        target: String,
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};

    #[derive(Default)]
    struct Script {
        /// `false` entries make the matching connect fail, missing entries succeed
        connects: VecDeque<bool>,
        /// `false` entries make the matching stream open fail
        opens: VecDeque<bool>,
        /// drop the server half of every opened stream immediately
        hang_up: bool,
    }

    #[derive(Default)]
    struct Log {
        /// skip_cert_verify flag of every connect attempt
        connects: Vec<bool>,
        /// (connection id, code) of every close
        closes: Vec<(usize, u32)>,
        /// (connection id) of every successful open
        opened_on: Vec<usize>,
        /// server halves of opened streams
        peers: Vec<tokio::io::DuplexStream>,
    }

    #[derive(Clone, Default)]
    struct MockConnector {
        script: Arc<Mutex<Script>>,
        log: Arc<Mutex<Log>>,
    }

    struct MockConnection {
        id: usize,
        closed: std::sync::atomic::AtomicBool,
        script: Arc<Mutex<Script>>,
        log: Arc<Mutex<Log>>,
    }

    #[async_trait::async_trait]
    impl crate::Connector for MockConnector {
        type Connection = MockConnection;

        async fn connect(&self, _server: &str, skip: bool) -> eyre::Result<MockConnection> {
            let id = {
                let mut log = self.log.lock().unwrap();
                log.connects.push(skip);
                log.connects.len() - 1
            };
            if self.script.lock().unwrap().connects.pop_front() == Some(false) {
                eyre::bail!("connection refused");
            }
            Ok(MockConnection {
                id,
                closed: Default::default(),
                script: self.script.clone(),
                log: self.log.clone(),
            })
        }
    }

    #[async_trait::async_trait]
    impl crate::TunnelConnection for MockConnection {
        type Stream = tokio::io::DuplexStream;

        async fn open_stream(&self) -> eyre::Result<tokio::io::DuplexStream> {
            if self.closed.load(std::sync::atomic::Ordering::SeqCst) {
                eyre::bail!("connection {} already closed", self.id);
            }
            let (ok, hang_up) = {
                let mut script = self.script.lock().unwrap();
                (script.opens.pop_front() != Some(false), script.hang_up)
            };
            if !ok {
                eyre::bail!("idle timeout");
            }
            let (client, server) = tokio::io::duplex(1024);
            let mut log = self.log.lock().unwrap();
            log.opened_on.push(self.id);
            if !hang_up {
                log.peers.push(server);
            }
            Ok(client)
        }

        fn close(&self, code: u32, _reason: &str) {
            self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
            self.log.lock().unwrap().closes.push((self.id, code));
        }
    }

    fn manager(script: Script, skip: bool) -> (ConnectionManager<MockConnector>, Arc<Mutex<Log>>) {
        let connector = MockConnector {
            script: Arc::new(Mutex::new(script)),
            log: Default::default(),
        };
        let log = connector.log.clone();
        (ConnectionManager::new(connector, skip), log)
    }

    async fn first_line(peer: tokio::io::DuplexStream) -> String {
        let mut line = String::new();
        tokio::io::BufReader::new(peer)
            .read_line(&mut line)
            .await
            .unwrap();
        line
    }

    #[test]
    fn test_transition_table() {
        use DialEvent::*;
        use DialState::*;

        assert_eq!(Disconnected.next(ConnectOk), Connected { retried: false });
        assert_eq!(Disconnected.next(ConnectErr), Failed);
        assert_eq!(Connected { retried: false }.next(OpenOk), Ready);
        assert_eq!(Connected { retried: true }.next(OpenOk), Ready);
        assert_eq!(Connected { retried: false }.next(OpenErr), Reconnecting);
        assert_eq!(Connected { retried: true }.next(OpenErr), Failed);
        assert_eq!(Reconnecting.next(ConnectOk), Connected { retried: true });
        assert_eq!(Reconnecting.next(ConnectErr), Failed);
        assert_eq!(Disconnected.next(OpenOk), Failed);
        assert_eq!(Failed.next(ConnectOk), Failed);
    }

    #[test]
    fn test_at_most_one_reconnect() {
        // Drive the table with every open failing; only one reconnect happens.
        let mut state = DialState::Disconnected;
        let mut connects = 0;
        while state != DialState::Failed {
            state = match state {
                DialState::Disconnected | DialState::Reconnecting => {
                    connects += 1;
                    state.next(DialEvent::ConnectOk)
                }
                _ => state.next(DialEvent::OpenErr),
            };
        }
        assert_eq!(connects, 2);
    }

    #[test]
    fn test_reconnect_skips_verification() {
        assert!(DialState::Reconnecting.skip_cert_verify(false));
        assert!(!DialState::Disconnected.skip_cert_verify(false));
        assert!(DialState::Disconnected.skip_cert_verify(true));
    }

    #[tokio::test]
    async fn test_fresh_dial_sends_target_line() {
        let (manager, log) = manager(Script::default(), false);

        let _stream = manager.dial("server:4433", "example.com:80").await.unwrap();

        let peer = {
            let mut log = log.lock().unwrap();
            assert_eq!(log.connects, vec![false]);
            assert_eq!(log.opened_on, vec![0]);
            assert!(log.closes.is_empty());
            log.peers.remove(0)
        };
        assert_eq!(first_line(peer).await, "example.com:80\n");
    }

    #[tokio::test]
    async fn test_connection_is_reused() {
        let (manager, log) = manager(Script::default(), false);

        manager.dial("server:4433", "a.example:80").await.unwrap();
        manager.dial("server:4433", "b.example:443").await.unwrap();

        let log = log.lock().unwrap();
        assert_eq!(log.connects.len(), 1);
        assert_eq!(log.opened_on, vec![0, 0]);
    }

    #[tokio::test]
    async fn test_open_failure_reconnects_once() {
        let script = Script {
            opens: VecDeque::from([true, false]),
            ..Default::default()
        };
        let (manager, log) = manager(script, false);

        manager.dial("server:4433", "a.example:80").await.unwrap();
        let mut stream = manager.dial("server:4433", "b.example:80").await.unwrap();
        stream.write_all(b"payload").await.unwrap();

        let peer = {
            let mut log = log.lock().unwrap();
            assert_eq!(log.connects, vec![false, true]);
            assert_eq!(log.closes, vec![(0, quic_tunnel_net::CLIENT_RECONNECT_CODE)]);
            assert_eq!(log.opened_on, vec![0, 1]);
            log.peers.remove(1)
        };
        let mut reader = tokio::io::BufReader::new(peer);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "b.example:80\n");
        let mut payload = [0u8; 7];
        reader.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"payload");
    }

    #[tokio::test]
    async fn test_open_failure_on_fresh_connection_reconnects() {
        // Disconnected -> Connected -> Reconnecting -> Connected { retried } -> Ready
        let script = Script {
            opens: VecDeque::from([false]),
            ..Default::default()
        };
        let (manager, log) = manager(script, false);

        manager.dial("server:4433", "a.example:80").await.unwrap();

        let log = log.lock().unwrap();
        assert_eq!(log.connects, vec![false, true]);
        assert_eq!(log.closes, vec![(0, quic_tunnel_net::CLIENT_RECONNECT_CODE)]);
        assert_eq!(log.opened_on, vec![1]);
    }

    #[tokio::test]
    async fn test_second_open_failure_is_fatal() {
        let script = Script {
            opens: VecDeque::from([false, false]),
            ..Default::default()
        };
        let (manager, log) = manager(script, false);

        let err = manager.dial("server:4433", "a.example:80").await.unwrap_err();
        assert!(matches!(err, DialError::OpenStream { .. }));

        let log = log.lock().unwrap();
        assert_eq!(log.connects, vec![false, true]);
        assert_eq!(log.closes, vec![(0, quic_tunnel_net::CLIENT_RECONNECT_CODE)]);
        assert!(log.opened_on.is_empty());
    }

    #[tokio::test]
    async fn test_connect_failure_is_returned() {
        let script = Script {
            connects: VecDeque::from([false]),
            ..Default::default()
        };
        let (manager, log) = manager(script, true);

        let err = manager.dial("server:4433", "a.example:80").await.unwrap_err();
        assert!(matches!(err, DialError::Connect { .. }));
        assert_eq!(log.lock().unwrap().connects, vec![true]);

        // the next dial starts over from a clean slate
        manager.dial("server:4433", "a.example:80").await.unwrap();
        assert_eq!(log.lock().unwrap().connects, vec![true, true]);
    }

    #[tokio::test]
    async fn test_failed_reconnect_never_reuses_closed_connection() {
        let script = Script {
            connects: VecDeque::from([true, false]),
            opens: VecDeque::from([false]),
            ..Default::default()
        };
        let (manager, log) = manager(script, false);

        let err = manager.dial("server:4433", "a.example:80").await.unwrap_err();
        assert!(matches!(err, DialError::Connect { .. }));

        manager.dial("server:4433", "a.example:80").await.unwrap();
        let log = log.lock().unwrap();
        // reconnect skipped verification, the following fresh dial did not
        assert_eq!(log.connects, vec![false, true, false]);
        assert_eq!(log.opened_on, vec![2]);
    }

    #[tokio::test]
    async fn test_handshake_write_failure() {
        let script = Script {
            hang_up: true,
            ..Default::default()
        };
        let (manager, _log) = manager(script, false);

        let err = manager.dial("server:4433", "a.example:80").await.unwrap_err();
        assert!(matches!(err, DialError::Handshake { ref target, .. } if target == "a.example:80"));
    }

    #[tokio::test]
    async fn test_concurrent_dials_share_one_connection() {
        let (manager, log) = manager(Script::default(), false);
        let manager = Arc::new(manager);

        let dials = (0..8).map(|i| {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .dial("server:4433", &format!("host{i}.example:80"))
                    .await
                    .map(|_| ())
            })
        });
        for dial in dials.collect::<Vec<_>>() {
            dial.await.unwrap().unwrap();
        }

        let log = log.lock().unwrap();
        assert_eq!(log.connects.len(), 1);
        assert_eq!(log.opened_on.len(), 8);
    }

    #[tokio::test]
    async fn test_udp_tunnel_frames() {
        let (client, server) = tokio::io::duplex(1024);
        let mut tunnel = UdpTunnel::new(client);
        let (mut server_read, mut server_write) = tokio::io::split(server);

        tunnel.send_to("8.8.8.8:53", &b"hello"[..]).await.unwrap();
        let mut request = [0u8; 18];
        server_read.read_exact(&mut request).await.unwrap();
        assert_eq!(request[0], 10);
        assert_eq!(&request[1..11], b"8.8.8.8:53");
        assert_eq!(&request[11..13], &[0, 5]);
        assert_eq!(&request[13..], b"hello");

        server_write.write_all(&[0, 3, b'a', b'b', b'c']).await.unwrap();
        let reply = tunnel.recv().await.unwrap().unwrap();
        assert_eq!(&reply[..], b"abc");

        drop(server_write);
        drop(server_read);
        assert!(tunnel.recv().await.is_none());
    }
}
