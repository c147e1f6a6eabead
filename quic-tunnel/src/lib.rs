//! # quic-tunnel
//!
//! A TCP and UDP tunnel over a single QUIC connection.
//!
//! The client side runs a local HTTP proxy. Every proxied session becomes one
//! bidirectional stream on the client's one QUIC connection to the server. The
//! first line on each stream names what the server should connect to:
//!
//! ```text
//! example.com:443\n   -> raw TCP relay to example.com:443
//! __UDP__\n           -> framed UDP relay (see quic_tunnel_net::UdpRequestCodec)
//! ```
//!
//! ## Server
//!
//! ```rust,no_run
//! # async fn example() -> eyre::Result<()> {
//! let tls = quic_tunnel_net::tls::server_config_from_pem(
//!     "cert.pem".as_ref(),
//!     "key.pem".as_ref(),
//! )?;
//! let pump = quic_tunnel::server::listen("0.0.0.0:4433".parse()?, tls)?;
//! quic_tunnel::server::serve(pump, tokio_util::sync::CancellationToken::new()).await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Client
//!
//! See [`ConnectionManager`] for dialing streams directly and [`proxy::run`]
//! for the HTTP front end the binary runs.

pub mod auth;
pub mod client;
pub mod config;
pub mod proxy;
pub mod server;
mod transport;

pub use client::{ConnectionManager, DialError, DialEvent, DialState, UdpTunnel};
pub use transport::{Connector, QuicConnection, QuicConnector, TunnelConnection};
