//! Protocol codec for encoding/decoding bus frames
//!
//! Handles framing of `LLLLL` + `AAAAA` + `BODY` units, both as a streaming
//! decoder over a byte buffer and as a direct read from an async source.

use bytes::{Buf, Bytes, BytesMut};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::{Address, AddressError, ADDRESS_LEN, HEADER_LEN, MAX_BODY_LEN, MAX_FRAME_LEN};

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Invalid address: {0}")]
    InvalidAddress(#[from] AddressError),

    #[error("Invalid length header: {0:?}")]
    InvalidHeader(String),

    #[error("Frame length {0} cannot hold a 5-byte address")]
    LengthTooShort(usize),

    #[error("Frame body too large: {0} bytes (max: {1})")]
    FrameTooLarge(usize, usize),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl CodecError {
    /// Whether the byte stream can no longer be trusted to be on a frame boundary
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            CodecError::InvalidAddress(_)
                | CodecError::InvalidHeader(_)
                | CodecError::LengthTooShort(_)
        )
    }
}

pub type CodecResult<T> = Result<T, CodecError>;

/// One complete unit of transmission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Destination when sending, sender when receiving
    pub address: Address,
    /// Opaque payload
    pub body: Bytes,
}

impl Frame {
    pub fn new(address: Address, body: impl Into<Bytes>) -> Self {
        Self {
            address,
            body: body.into(),
        }
    }

    /// Whether this frame comes from (or goes to) the registration address
    pub fn is_system(&self) -> bool {
        self.address.is_system()
    }

    /// Body as text, replacing invalid UTF-8
    pub fn body_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Size of this frame on the wire
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + ADDRESS_LEN + self.body.len()
    }

    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        encode(&self.address, &self.body)
    }
}

/// Encode an address and body into the wire format
pub fn encode(address: &Address, body: &[u8]) -> CodecResult<Vec<u8>> {
    if body.len() > MAX_BODY_LEN {
        return Err(CodecError::FrameTooLarge(body.len(), MAX_BODY_LEN));
    }

    let length = ADDRESS_LEN + body.len();
    let mut buf = Vec::with_capacity(HEADER_LEN + length);
    buf.extend_from_slice(format!("{:0width$}", length, width = HEADER_LEN).as_bytes());
    buf.extend_from_slice(address.as_bytes());
    buf.extend_from_slice(body);
    Ok(buf)
}

/// Encode to a raw destination name, which must already be exactly 5 bytes
pub fn encode_to(destination: &str, body: &[u8]) -> CodecResult<Vec<u8>> {
    encode(&Address::new(destination)?, body)
}

/// Parse the 5-digit length header
pub fn decode_header(header: &[u8; HEADER_LEN]) -> CodecResult<usize> {
    if !header.iter().all(u8::is_ascii_digit) {
        return Err(CodecError::InvalidHeader(
            String::from_utf8_lossy(header).into_owned(),
        ));
    }

    let length = header
        .iter()
        .fold(0usize, |acc, b| acc * 10 + usize::from(b - b'0'));

    if length < ADDRESS_LEN {
        return Err(CodecError::LengthTooShort(length));
    }
    debug_assert!(length <= MAX_FRAME_LEN);

    Ok(length)
}

/// Split a complete payload into sender and body
///
/// `decode_header` guarantees at least `ADDRESS_LEN` bytes. The sender is
/// taken verbatim: a well-formed frame is never rejected for its name.
fn split_payload(mut payload: Bytes) -> Frame {
    let mut raw = [0u8; ADDRESS_LEN];
    raw.copy_from_slice(&payload[..ADDRESS_LEN]);
    payload.advance(ADDRESS_LEN);
    Frame::new(Address::from_wire(raw), payload)
}

/// Read exactly one frame from an async byte source
///
/// Short reads are retried until the full frame is available. End of stream
/// before a frame is complete is reported as [`CodecError::ConnectionClosed`].
pub async fn read_frame<R>(reader: &mut R) -> CodecResult<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    read_exact_or_closed(reader, &mut header).await?;
    let length = decode_header(&header)?;

    let mut payload = vec![0u8; length];
    read_exact_or_closed(reader, &mut payload).await?;

    Ok(split_payload(Bytes::from(payload)))
}

async fn read_exact_or_closed<R>(reader: &mut R, buf: &mut [u8]) -> CodecResult<()>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(CodecError::ConnectionClosed),
        Err(e) => Err(CodecError::Io(e)),
    }
}

/// Incremental decoder over an accumulating buffer
///
/// Bytes may arrive in any chunking; `decode` yields a frame only once all of
/// it has been buffered and leaves any following bytes in place.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    state: DecodeState,
}

#[derive(Debug, Default)]
enum DecodeState {
    #[default]
    Header,
    Payload {
        length: usize,
    },
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt to decode a frame from the buffer
    /// Returns Ok(None) if more data is needed
    pub fn decode(&mut self, buf: &mut BytesMut) -> CodecResult<Option<Frame>> {
        loop {
            match self.state {
                DecodeState::Header => {
                    if buf.len() < HEADER_LEN {
                        return Ok(None);
                    }

                    let mut header = [0u8; HEADER_LEN];
                    header.copy_from_slice(&buf[..HEADER_LEN]);
                    let length = decode_header(&header)?;

                    buf.advance(HEADER_LEN);
                    self.state = DecodeState::Payload { length };
                }
                DecodeState::Payload { length } => {
                    if buf.len() < length {
                        buf.reserve(length - buf.len());
                        return Ok(None);
                    }

                    let payload = buf.split_to(length).freeze();
                    self.state = DecodeState::Header;

                    return Ok(Some(split_payload(payload)));
                }
            }
        }
    }

    /// Whether a frame has been started but not finished
    pub fn is_mid_frame(&self, buf: &BytesMut) -> bool {
        matches!(self.state, DecodeState::Payload { .. }) || !buf.is_empty()
    }
}
