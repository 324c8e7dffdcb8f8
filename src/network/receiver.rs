//! Receive loop
//!
//! Owns the read side of a bus connection on its own task. Each iteration
//! waits for bytes at most one poll interval and then checks the stop flag,
//! so stop-then-close always ends the loop in bounded time even when the bus
//! never sends anything again.

use bytes::BytesMut;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::connection::{is_link_loss, BusError, LinkState};
use super::correlator::{Correlator, Resolution};
use crate::protocol::{Address, Frame, FrameDecoder};

/// Events emitted by the receive loop
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// The bus acknowledged our registration
    Registered {
        /// Body of the acknowledgment, normally our own address
        ack: String,
    },
    /// The link is gone
    Disconnected {
        reason: String,
    },
    /// The loop hit an unrecoverable error
    Error {
        message: String,
    },
}

/// Why the receive loop ended
#[derive(Debug)]
pub enum LoopExit {
    /// The stop flag was observed
    Stopped,
    /// The bus closed the connection
    Closed,
    /// A read or decode error ended the loop
    Failed(BusError),
}

impl LoopExit {
    fn reason(&self) -> String {
        match self {
            LoopExit::Stopped => "Receive loop stopped".to_string(),
            LoopExit::Closed => "Connection closed by bus".to_string(),
            LoopExit::Failed(e) => format!("Error: {}", e),
        }
    }
}

/// Decodes inbound frames and hands them to the correlator
pub struct ReceiveLoop<R> {
    reader: R,
    decoder: FrameDecoder,
    read_buf: BytesMut,
    state: Arc<LinkState>,
    correlator: Arc<Correlator>,
    events: mpsc::Sender<BusEvent>,
    poll_interval: Duration,
}

impl<R> ReceiveLoop<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    pub fn new(
        reader: R,
        state: Arc<LinkState>,
        correlator: Arc<Correlator>,
        events: mpsc::Sender<BusEvent>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::new(),
            read_buf: BytesMut::with_capacity(4096),
            state,
            correlator,
            events,
            poll_interval,
        }
    }

    /// Run the loop on its own task
    pub fn spawn(self) -> JoinHandle<LoopExit> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) -> LoopExit {
        let exit = loop {
            if self.state.stop_requested() {
                break LoopExit::Stopped;
            }

            // Drain whatever is already buffered before reading again
            match self.decoder.decode(&mut self.read_buf) {
                Ok(Some(frame)) => {
                    self.dispatch(frame).await;
                    continue;
                }
                Ok(None) => {}
                Err(e) => break LoopExit::Failed(e.into()),
            }

            let read =
                tokio::time::timeout(self.poll_interval, self.reader.read_buf(&mut self.read_buf))
                    .await;

            match read {
                Err(_) => continue,
                Ok(Ok(0)) if self.state.stop_requested() => break LoopExit::Stopped,
                Ok(Ok(0)) => {
                    if self.decoder.is_mid_frame(&self.read_buf) {
                        tracing::warn!("Bus closed the connection in the middle of a frame");
                    }
                    break LoopExit::Closed;
                }
                Ok(Ok(n)) => self.state.record_bytes_received(n),
                Ok(Err(e)) if self.state.stop_requested() => {
                    tracing::debug!("Read interrupted by shutdown: {}", e);
                    break LoopExit::Stopped;
                }
                Ok(Err(e)) if is_link_loss(&e) => break LoopExit::Closed,
                Ok(Err(e)) => break LoopExit::Failed(BusError::Io(e)),
            }
        };

        self.state.mark_disconnected();
        let abandoned = self.correlator.fail_all().await;
        if abandoned > 0 {
            tracing::warn!("{} pending request(s) abandoned", abandoned);
        }

        let reason = exit.reason();
        if let LoopExit::Failed(e) = &exit {
            tracing::error!("Receive loop failed: {}", e);
            let _ = self
                .events
                .send(BusEvent::Error {
                    message: e.to_string(),
                })
                .await;
        } else {
            tracing::info!("{}", reason);
        }

        let _ = self.events.send(BusEvent::Disconnected { reason }).await;

        exit
    }

    async fn dispatch(&mut self, frame: Frame) {
        self.state.record_frame_received();

        if frame.is_system() {
            let ack = frame.body_text().into_owned();
            if self.state.mark_registered() {
                tracing::info!("Registration confirmed by bus ({})", ack.trim());
                let _ = self.events.send(BusEvent::Registered { ack }).await;
            } else {
                tracing::debug!("Ignoring repeated acknowledgment from sinit");
            }
            return;
        }

        let sender: Address = frame.address;
        let size = frame.body.len();
        match self.correlator.resolve(sender, frame.body).await {
            Resolution::Pending => {
                tracing::debug!("Response from '{}' ({} bytes)", sender, size)
            }
            Resolution::Unsolicited => {
                tracing::debug!("Unsolicited frame from '{}' ({} bytes)", sender, size)
            }
            Resolution::Dropped => {}
        }
    }
}
