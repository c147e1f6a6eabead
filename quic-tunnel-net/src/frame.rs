//! UDP-over-stream framing.
//!
//! After the `__UDP__` handshake line a stream carries length-prefixed frames.
//! The client sends requests, the server answers each request with at most one
//! response:
//!
//! ```text
//! request:  [1B dest len][dest addr][2B data len, BE][data]
//! response:                         [2B data len, BE][data]
//! ```
//!
//! Responses carry no address. They belong to the most recent request on the
//! same stream, and a request whose reply never came gets no response at all.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Longest destination address a request frame can carry.
pub const MAX_ADDR_LEN: usize = u8::MAX as usize;

/// Largest payload a frame can carry.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("destination address is {len} bytes, at most 255 fit in a frame")]
    AddressTooLong { len: usize },

    #[error("payload is {len} bytes, at most 65535 fit in a frame")]
    PayloadTooLarge { len: usize },

    #[error("destination address is not valid UTF-8")]
    InvalidAddress,

    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

/// One datagram the client wants delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpRequest {
    /// `host:port` the server resolves and sends to
    pub dest: String,
    pub data: Bytes,
}

impl UdpRequest {
    pub fn new(dest: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            dest: dest.into(),
            data: data.into(),
        }
    }
}

/// Codec for client-to-server request frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct UdpRequestCodec;

impl tokio_util::codec::Decoder for UdpRequestCodec {
    type Item = UdpRequest;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<UdpRequest>, FrameError> {
        let Some(&dest_len) = src.first() else {
            return Ok(None);
        };
        let dest_len = dest_len as usize;

        let header_len = 1 + dest_len + 2;
        if src.len() < header_len {
            src.reserve(header_len - src.len());
            return Ok(None);
        }
        let data_len = u16::from_be_bytes([src[1 + dest_len], src[2 + dest_len]]) as usize;

        let frame_len = header_len + data_len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(1);
        let dest = src.split_to(dest_len);
        src.advance(2);
        let data = src.split_to(data_len).freeze();

        let dest = String::from_utf8(dest.to_vec()).map_err(|_| FrameError::InvalidAddress)?;
        Ok(Some(UdpRequest { dest, data }))
    }
}

impl tokio_util::codec::Encoder<UdpRequest> for UdpRequestCodec {
    type Error = FrameError;

    fn encode(&mut self, item: UdpRequest, dst: &mut BytesMut) -> Result<(), FrameError> {
        let dest_len = u8::try_from(item.dest.len()).map_err(|_| FrameError::AddressTooLong {
            len: item.dest.len(),
        })?;
        let data_len = u16::try_from(item.data.len()).map_err(|_| FrameError::PayloadTooLarge {
            len: item.data.len(),
        })?;

        dst.reserve(1 + item.dest.len() + 2 + item.data.len());
        dst.put_u8(dest_len);
        dst.put_slice(item.dest.as_bytes());
        dst.put_u16(data_len);
        dst.put_slice(&item.data);
        Ok(())
    }
}

/// Codec for server-to-client response frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct UdpResponseCodec;

impl tokio_util::codec::Decoder for UdpResponseCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        if src.len() < 2 {
            return Ok(None);
        }
        let data_len = u16::from_be_bytes([src[0], src[1]]) as usize;
        if src.len() < 2 + data_len {
            src.reserve(2 + data_len - src.len());
            return Ok(None);
        }

        src.advance(2);
        Ok(Some(src.split_to(data_len).freeze()))
    }
}

impl tokio_util::codec::Encoder<Bytes> for UdpResponseCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), FrameError> {
        let data_len = u16::try_from(item.len())
            .map_err(|_| FrameError::PayloadTooLarge { len: item.len() })?;

        dst.reserve(2 + item.len());
        dst.put_u16(data_len);
        dst.put_slice(&item);
        Ok(())
    }
}
