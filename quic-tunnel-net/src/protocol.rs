//! Stream handshake protocol.
//!
//! Every stream opened inside a tunnel connection starts with a single text line
//! naming what the server should relay the stream to. Nothing else is negotiated:
//! there is no ACK and no version field, the first payload byte follows the
//! newline directly.
//!
//! # The Handshake Line
//!
//! ```text
//! example.com:80\n      -> TCP relay to example.com:80
//! [2001:db8::1]:443\n   -> TCP relay to an IPv6 target
//! __UDP__\n             -> UDP request/response framing (see `frame`)
//! ```
//!
//! The literal `__UDP__` is reserved. Any other line is taken as a `host:port`
//! TCP target, and it is up to the server's TCP dial to reject garbage.
//!
//! # ALPN
//!
//! Both ends negotiate the single ALPN [`ALPN`] during the TLS handshake.
//! Routing happens per stream through the handshake line.

/// ALPN identifier both ends must agree on.
pub const ALPN: &[u8] = b"quic-proxy";

/// Reserved handshake descriptor selecting the UDP relay.
pub const UDP_DESCRIPTOR: &str = "__UDP__";

/// Upper bound on the handshake line, newline included.
pub const MAX_HANDSHAKE_LEN: usize = 1024;

/// Close code the server uses when a peer's stream accept fails.
pub const SERVER_ACCEPT_CODE: u32 = 2020;

/// Close code the client uses when a stream open fails and it reconnects.
pub const CLIENT_RECONNECT_CODE: u32 = 2021;

/// What a stream should be relayed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// UDP request/response loop
    Udp,
    /// TCP connection to `host:port`
    Tcp(String),
}

impl Target {
    /// Classify a handshake line. Surrounding whitespace is ignored.
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line == UDP_DESCRIPTOR {
            Target::Udp
        } else {
            Target::Tcp(line.to_string())
        }
    }

    /// The handshake line for this target, newline included.
    pub fn to_line(&self) -> String {
        format!("{self}\n")
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Udp => write!(f, "{UDP_DESCRIPTOR}"),
            Target::Tcp(addr) => write!(f, "{addr}"),
        }
    }
}

impl From<&str> for Target {
    fn from(line: &str) -> Self {
        Target::parse(line)
    }
}

/// Read the handshake line from the front of a stream.
///
/// Only the line itself is consumed; payload bytes that arrived in the same
/// read stay buffered in `reader`, so callers must keep reading through it.
///
/// # Errors
///
/// Fails if the stream ends before a newline, if no newline shows up within
/// [`MAX_HANDSHAKE_LEN`] bytes, or if the line is not UTF-8.
pub async fn read_handshake<R>(reader: &mut R) -> eyre::Result<String>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    use tokio::io::{AsyncBufReadExt, AsyncReadExt};

    let mut line = Vec::new();
    let read = (&mut *reader)
        .take(MAX_HANDSHAKE_LEN as u64)
        .read_until(b'\n', &mut line)
        .await?;

    if read == 0 {
        tracing::debug!("Stream closed before sending a handshake line");
        eyre::bail!("stream closed before the handshake line");
    }
    if line.last() != Some(&b'\n') {
        tracing::debug!("Rejecting handshake line: no newline in {} bytes", line.len());
        eyre::bail!(
            "handshake line not terminated within {} bytes",
            line.len()
        );
    }
    line.pop();

    let line = match String::from_utf8(line) {
        Ok(line) => line,
        Err(e) => {
            tracing::debug!("Rejecting handshake line: {e}");
            return Err(e.into());
        }
    };
    Ok(line.trim().to_string())
}
