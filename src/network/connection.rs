//! Connection handling for the bus
//!
//! Manages the single TCP connection a participant holds to the bus, including:
//! - Connecting and the `sinit` registration handshake
//! - Frame encoding on the write path
//! - Direct frame reads when no receive loop has been started
//! - Connection state shared with the receive loop

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use super::{resolve_host, BusSettings};
use crate::protocol::{self, Address, AddressError, CodecError, Frame};

/// Bus errors
#[derive(Error, Debug)]
pub enum BusError {
    #[error("Bus unreachable at {addr}: {source}")]
    ConnectionRefused {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    Protocol(CodecError),

    #[error("Send failed: {0}")]
    SendError(#[source] io::Error),

    #[error("Frame body too large: {0} bytes (max: {1})")]
    FrameTooLarge(usize, usize),

    #[error("Invalid address: {0}")]
    Address(#[from] AddressError),

    #[error("Connection timeout")]
    Timeout,

    #[error("Not connected")]
    NotConnected,

    #[error("Already registered as {0}")]
    AlreadyRegistered(Address),

    #[error("A request to {0} is already outstanding")]
    AlreadyPending(Address),

    #[error("Receive task failed: {0}")]
    TaskFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<CodecError> for BusError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::ConnectionClosed => BusError::ConnectionClosed,
            CodecError::Io(e) if is_link_loss(&e) => BusError::ConnectionClosed,
            CodecError::Io(e) => BusError::Io(e),
            CodecError::FrameTooLarge(len, max) => BusError::FrameTooLarge(len, max),
            other => BusError::Protocol(other),
        }
    }
}

impl BusError {
    /// Whether this error means the link to the bus is gone
    ///
    /// Failures local to one outbound frame, such as an oversized body, leave
    /// the link usable.
    pub fn is_link_lost(&self) -> bool {
        match self {
            BusError::ConnectionClosed | BusError::NotConnected => true,
            BusError::Protocol(e) => e.is_protocol_violation(),
            _ => false,
        }
    }
}

pub type BusResult<T> = Result<T, BusError>;

/// Whether an I/O error means the peer went away
pub(crate) fn is_link_loss(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

/// Connection statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Frames sent
    pub frames_sent: u64,
    /// Frames received
    pub frames_received: u64,
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
}

/// State shared between the application side of a connection and its receive loop
#[derive(Debug)]
pub struct LinkState {
    stop: AtomicBool,
    connected: AtomicBool,
    registered: AtomicBool,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl Default for LinkState {
    fn default() -> Self {
        Self {
            stop: AtomicBool::new(false),
            connected: AtomicBool::new(true),
            registered: AtomicBool::new(false),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }
}

impl LinkState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the receive loop to stop at its next poll
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    /// Record the registration acknowledgment. Returns true only the first time.
    pub fn mark_registered(&self) -> bool {
        !self.registered.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn record_sent(&self, bytes: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_bytes_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Represents the connection to the bus
pub struct BusConnection {
    /// Remote bus address
    peer_addr: SocketAddr,
    /// Read half, until handed to a receive loop
    reader: Option<OwnedReadHalf>,
    /// Write half, until closed
    writer: Option<OwnedWriteHalf>,
    /// Address announced through `sinit`
    local_address: Option<Address>,
    /// Flags and counters shared with the receive loop
    state: Arc<LinkState>,
    /// Last outbound activity
    last_activity: Instant,
}

impl BusConnection {
    /// Open a TCP connection to the bus
    pub async fn connect(settings: &BusSettings) -> BusResult<Self> {
        let target = format!("{}:{}", settings.host, settings.port);

        let peer_addr = resolve_host(&settings.host, settings.port)
            .await
            .map_err(|source| BusError::ConnectionRefused {
                addr: target.clone(),
                source,
            })?;

        tracing::debug!("Connecting to bus at {}", peer_addr);

        let stream =
            match tokio::time::timeout(settings.connect_timeout(), TcpStream::connect(peer_addr))
                .await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(source)) => {
                    return Err(BusError::ConnectionRefused {
                        addr: target,
                        source,
                    })
                }
                Err(_) => return Err(BusError::Timeout),
            };

        stream.set_nodelay(true)?;
        tracing::info!("Connected to bus at {}", peer_addr);

        Ok(Self::new(stream, peer_addr))
    }

    /// Wrap an established TCP stream
    pub fn new(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        let (reader, writer) = stream.into_split();

        Self {
            peer_addr,
            reader: Some(reader),
            writer: Some(writer),
            local_address: None,
            state: Arc::new(LinkState::new()),
            last_activity: Instant::now(),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// The address this connection registered with, if any
    pub fn local_address(&self) -> Option<Address> {
        self.local_address
    }

    /// Shared state handle for a receive loop
    pub fn state(&self) -> Arc<LinkState> {
        Arc::clone(&self.state)
    }

    pub fn stats(&self) -> ConnectionStats {
        self.state.stats()
    }

    pub fn is_connected(&self) -> bool {
        self.writer.is_some() && self.state.is_connected()
    }

    /// Announce this participant's address to the bus
    ///
    /// The acknowledgment is not awaited here. It arrives as an ordinary frame
    /// from `sinit` and is consumed by whoever reads the connection.
    pub async fn register(&mut self, own_address: Address) -> BusResult<()> {
        if let Some(existing) = self.local_address {
            return Err(BusError::AlreadyRegistered(existing));
        }

        self.send(&Address::SINIT, own_address.as_bytes()).await?;
        self.local_address = Some(own_address);

        tracing::info!("Registering as '{}'", own_address);
        Ok(())
    }

    /// Send one frame, returning once every byte has been written
    pub async fn send(&mut self, destination: &Address, body: &[u8]) -> BusResult<()> {
        if !self.state.is_connected() {
            return Err(BusError::NotConnected);
        }
        let bytes = protocol::encode(destination, body)?;
        let writer = self.writer.as_mut().ok_or(BusError::NotConnected)?;

        let written = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = written {
            if is_link_loss(&e) {
                self.state.mark_disconnected();
            }
            return Err(BusError::SendError(e));
        }

        self.state.record_sent(bytes.len());
        self.last_activity = Instant::now();

        tracing::trace!("Sent {} bytes to '{}'", body.len(), destination);
        Ok(())
    }

    /// Send to a raw destination name, which must already be exactly 5 bytes
    pub async fn send_to(&mut self, destination: &str, body: &[u8]) -> BusResult<()> {
        let destination = Address::new(destination)?;
        self.send(&destination, body).await
    }

    /// Read the next data frame directly from the socket
    ///
    /// Only usable while no receive loop owns the read half. Registration
    /// acknowledgments are consumed here and never returned.
    pub async fn recv(&mut self) -> BusResult<Frame> {
        let reader = self.reader.as_mut().ok_or(BusError::NotConnected)?;

        loop {
            let frame = match protocol::read_frame(reader).await {
                Ok(frame) => frame,
                Err(e) => {
                    self.state.mark_disconnected();
                    return Err(e.into());
                }
            };

            self.state.record_frame_received();
            self.state.record_bytes_received(frame.wire_len());

            if frame.is_system() {
                if self.state.mark_registered() {
                    tracing::info!("Registration confirmed by bus");
                }
                continue;
            }

            return Ok(frame);
        }
    }

    /// Hand the read half to a receive loop
    pub fn take_reader(&mut self) -> Option<OwnedReadHalf> {
        self.reader.take()
    }

    /// Close the connection
    ///
    /// Safe to call more than once. Any receive loop sharing this connection's
    /// state is asked to stop.
    pub async fn close(&mut self) -> BusResult<()> {
        self.state.request_stop();
        self.state.mark_disconnected();
        self.reader = None;

        if let Some(mut writer) = self.writer.take() {
            tracing::debug!("Closing connection to {}", self.peer_addr);
            if let Err(e) = writer.shutdown().await {
                if !is_link_loss(&e) {
                    return Err(BusError::Io(e));
                }
            }
        }

        Ok(())
    }

    /// Time since the last successful send
    pub fn idle_time(&self) -> std::time::Duration {
        self.last_activity.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn pair() -> (BusConnection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let settings = BusSettings::new("127.0.0.1", addr.port());

        let (conn, accepted) = tokio::join!(BusConnection::connect(&settings), listener.accept());
        (conn.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = BusConnection::connect(&BusSettings::new("127.0.0.1", port)).await;
        assert!(matches!(result, Err(BusError::ConnectionRefused { .. })));
    }

    #[tokio::test]
    async fn test_register_sends_sinit_frame() {
        let (mut conn, mut bus) = pair().await;
        let me = Address::new("abcde").unwrap();

        conn.register(me).await.unwrap();
        assert_eq!(conn.local_address(), Some(me));

        let mut buf = [0u8; 15];
        bus.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"00010sinitabcde");

        assert!(matches!(
            conn.register(me).await,
            Err(BusError::AlreadyRegistered(_))
        ));
    }

    #[tokio::test]
    async fn test_recv_skips_acknowledgment() {
        let (mut conn, mut bus) = pair().await;

        let mut wire = protocol::encode(&Address::SINIT, b"abcde").unwrap();
        wire.extend(protocol::encode(&Address::new("prodc").unwrap(), b"hola").unwrap());
        bus.write_all(&wire).await.unwrap();

        let frame = conn.recv().await.unwrap();
        assert_eq!(frame.address.as_str(), "prodc");
        assert_eq!(&frame.body[..], b"hola");
        assert!(conn.state().is_registered());
        assert_eq!(conn.stats().frames_received, 2);
    }

    #[tokio::test]
    async fn test_recv_after_peer_close() {
        let (mut conn, bus) = pair().await;
        drop(bus);

        assert!(matches!(conn.recv().await, Err(BusError::ConnectionClosed)));
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut conn, _bus) = pair().await;

        conn.close().await.unwrap();
        conn.close().await.unwrap();

        assert!(!conn.is_connected());
        assert!(conn.state().stop_requested());
        assert!(matches!(
            conn.send_to("prodc", b"x").await,
            Err(BusError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_send_counts_bytes() {
        let (mut conn, mut bus) = pair().await;

        conn.send_to("prodc", br#"{"command":"ver_catalogo"}"#).await.unwrap();

        let frame = protocol::read_frame(&mut bus).await.unwrap();
        assert_eq!(frame.address.as_str(), "prodc");
        assert_eq!(conn.stats().frames_sent, 1);
        assert_eq!(conn.stats().bytes_sent, 36);
    }

    #[test]
    fn test_codec_error_mapping() {
        assert!(matches!(
            BusError::from(CodecError::ConnectionClosed),
            BusError::ConnectionClosed
        ));
        assert!(matches!(
            BusError::from(CodecError::InvalidHeader("xx".into())),
            BusError::Protocol(_)
        ));
        assert!(matches!(
            BusError::from(CodecError::Io(io::ErrorKind::ConnectionReset.into())),
            BusError::ConnectionClosed
        ));

        let too_large = BusError::from(CodecError::FrameTooLarge(100_000, 99_994));
        assert!(matches!(too_large, BusError::FrameTooLarge(100_000, 99_994)));
        assert!(!too_large.is_link_lost());
        assert!(BusError::from(CodecError::InvalidHeader("xx".into())).is_link_lost());
    }

    #[tokio::test]
    async fn test_oversized_send_keeps_connection() {
        let (mut conn, mut bus) = pair().await;
        let prodc = Address::new("prodc").unwrap();

        let body = vec![b'x'; protocol::MAX_BODY_LEN + 1];
        let err = conn.send(&prodc, &body).await.unwrap_err();
        assert!(matches!(err, BusError::FrameTooLarge(_, protocol::MAX_BODY_LEN)));
        assert!(!err.is_link_lost());
        assert!(conn.is_connected());
        assert_eq!(conn.stats().frames_sent, 0);

        conn.send(&prodc, b"still here").await.unwrap();
        let frame = protocol::read_frame(&mut bus).await.unwrap();
        assert_eq!(&frame.body[..], b"still here");
    }
}
