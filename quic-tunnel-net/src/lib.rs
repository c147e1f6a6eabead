//! # quic-tunnel-net
//!
//! Wire-level building blocks shared by the tunnel client and server.
//!
//! A tunnel is one QUIC connection between a client and a server. Every proxied
//! TCP connection, and every UDP relay session, gets its own bidirectional
//! stream inside that connection:
//!
//! ```text
//! Single QUIC connection (ALPN "quic-proxy")
//!     ├── Stream 1: "example.com:443\n" + raw TCP bytes
//!     ├── Stream 2: "__UDP__\n" + UDP request/response frames
//!     └── Stream N: ...
//! ```
//!
//! This crate owns the pieces both ends must agree on:
//!
//! - [`Target`]: the handshake descriptor sent as the first line of a stream
//! - [`UdpRequestCodec`] / [`UdpResponseCodec`]: the UDP-over-stream framing
//! - [`tls`]: rustls/quinn configuration for both ends
//! - [`TunnelStream`]: a QUIC send/receive pair viewed as one duplex byte pipe

mod frame;
mod protocol;
mod stream;
pub mod tls;

pub use frame::{
    FrameError, MAX_ADDR_LEN, MAX_PAYLOAD_LEN, UdpRequest, UdpRequestCodec, UdpResponseCodec,
};
pub use protocol::{
    ALPN, CLIENT_RECONNECT_CODE, MAX_HANDSHAKE_LEN, SERVER_ACCEPT_CODE, Target, UDP_DESCRIPTOR,
    read_handshake,
};
pub use stream::TunnelStream;
