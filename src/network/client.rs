//! Bus client
//!
//! Connects to the bus, registers an address and runs the receive loop,
//! leaving the application with the write path, the correlator and two
//! channels: lifecycle events and unsolicited frames.

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::connection::{BusConnection, BusError, BusResult, ConnectionStats, LinkState};
use super::correlator::{Correlator, PendingHandler, PendingResponse};
use super::receiver::{BusEvent, LoopExit, ReceiveLoop};
use super::BusSettings;
use crate::protocol::{Address, Frame};

/// A registered participant on the bus
pub struct BusClient {
    /// Settings the client was started with
    settings: BusSettings,
    /// Our registered address
    address: Address,
    /// Write side of the connection
    connection: BusConnection,
    /// Shared with the receive loop
    state: Arc<LinkState>,
    /// Pending request table
    correlator: Arc<Correlator>,
    /// Event receiver (for consumers)
    event_rx: Option<mpsc::Receiver<BusEvent>>,
    /// Unsolicited frame receiver (for consumers)
    message_rx: Option<mpsc::Receiver<Frame>>,
    /// Receive loop task
    receive_task: Option<JoinHandle<LoopExit>>,
}

impl BusClient {
    /// Connect to the bus and register as `address`
    pub async fn connect(settings: BusSettings, address: Address) -> BusResult<Self> {
        let connection = BusConnection::connect(&settings).await?;
        Self::start(settings, connection, address).await
    }

    /// Register on an already-open connection and start receiving
    pub async fn start(
        settings: BusSettings,
        mut connection: BusConnection,
        address: Address,
    ) -> BusResult<Self> {
        connection.register(address).await?;

        let reader = connection.take_reader().ok_or(BusError::NotConnected)?;
        let state = connection.state();

        let (event_tx, event_rx) = mpsc::channel(settings.channel_capacity);
        let (message_tx, message_rx) = mpsc::channel(settings.channel_capacity);
        let correlator = Arc::new(Correlator::new(Some(message_tx)));

        let receive_task = ReceiveLoop::new(
            reader,
            Arc::clone(&state),
            Arc::clone(&correlator),
            event_tx,
            settings.poll_interval(),
        )
        .spawn();

        Ok(Self {
            settings,
            address,
            connection,
            state,
            correlator,
            event_rx: Some(event_rx),
            message_rx: Some(message_rx),
            receive_task: Some(receive_task),
        })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn settings(&self) -> &BusSettings {
        &self.settings
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<BusEvent>> {
        self.event_rx.take()
    }

    /// Take the receiver for frames no request was waiting on (can only be called once)
    pub fn take_message_receiver(&mut self) -> Option<mpsc::Receiver<Frame>> {
        self.message_rx.take()
    }

    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn is_registered(&self) -> bool {
        self.state.is_registered()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.connection.stats()
    }

    /// Send a frame without expecting a reply
    pub async fn send(&mut self, destination: &Address, body: &[u8]) -> BusResult<()> {
        self.connection.send(destination, body).await
    }

    /// Send a request and return a handle to its response
    ///
    /// Fails with [`BusError::AlreadyPending`] if a request to `destination`
    /// is still outstanding.
    pub async fn request(
        &mut self,
        destination: &Address,
        body: &[u8],
    ) -> BusResult<PendingResponse> {
        let response = self.correlator.expect(*destination).await?;
        self.send_pending(destination, body).await?;
        Ok(response)
    }

    /// Send a request whose response is handed to `callback` on the receive task
    pub async fn request_with<F>(
        &mut self,
        destination: &Address,
        body: &[u8],
        callback: F,
    ) -> BusResult<()>
    where
        F: FnOnce(Bytes) + Send + 'static,
    {
        self.correlator
            .register_pending(*destination, PendingHandler::callback(callback))
            .await?;
        self.send_pending(destination, body).await
    }

    async fn send_pending(&mut self, destination: &Address, body: &[u8]) -> BusResult<()> {
        if let Err(e) = self.connection.send(destination, body).await {
            self.correlator.cancel(destination).await;
            return Err(e);
        }
        Ok(())
    }

    /// Stop the receive loop, close the socket and wait for the loop to end
    pub async fn shutdown(mut self) -> BusResult<LoopExit> {
        self.state.request_stop();
        self.connection.close().await?;

        let Some(handle) = self.receive_task.take() else {
            return Ok(LoopExit::Stopped);
        };

        // A few poll intervals is always enough once the stop flag is set
        let grace = self.settings.poll_interval() * 4;
        let abort = handle.abort_handle();
        match tokio::time::timeout(grace, handle).await {
            Ok(Ok(exit)) => {
                tracing::debug!("Receive loop ended: {:?}", exit);
                Ok(exit)
            }
            Ok(Err(e)) => Err(BusError::TaskFailed(e.to_string())),
            Err(_) => {
                abort.abort();
                Err(BusError::Timeout)
            }
        }
    }
}

impl Drop for BusClient {
    fn drop(&mut self) {
        self.state.request_stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn client_with_bus(name: &str) -> (BusClient, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let settings =
            BusSettings::new("127.0.0.1", port).with_poll_interval(Duration::from_millis(25));

        let (client, accepted) = tokio::join!(
            BusClient::connect(settings, Address::new(name).unwrap()),
            listener.accept()
        );
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_connect_registers_first() {
        let (client, mut bus) = client_with_bus("abcde").await;

        let frame = protocol::read_frame(&mut bus).await.unwrap();
        assert!(frame.is_system());
        assert_eq!(&frame.body[..], b"abcde");
        assert_eq!(client.address().as_str(), "abcde");
        assert!(!client.is_registered());
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let (mut client, mut bus) = client_with_bus("abcde").await;
        let mut events = client.take_event_receiver().unwrap();
        let prodc = Address::new("prodc").unwrap();

        let _register = protocol::read_frame(&mut bus).await.unwrap();
        bus.write_all(&protocol::encode(&Address::SINIT, b"abcde").unwrap())
            .await
            .unwrap();

        let response = client
            .request(&prodc, br#"{"command":"ver_catalogo"}"#)
            .await
            .unwrap();

        let request = protocol::read_frame(&mut bus).await.unwrap();
        assert_eq!(request.address, prodc);
        assert_eq!(&request.body[..], br#"{"command":"ver_catalogo"}"#);

        bus.write_all(&protocol::encode(&prodc, br#"{"status":"success","data":[]}"#).unwrap())
            .await
            .unwrap();

        let body = response.recv().await.unwrap();
        assert_eq!(&body[..], br#"{"status":"success","data":[]}"#);
        assert!(matches!(
            events.recv().await.unwrap(),
            BusEvent::Registered { .. }
        ));
        assert!(client.is_registered());
    }

    #[tokio::test]
    async fn test_shutdown_is_bounded_when_bus_is_silent() {
        let (client, _bus) = client_with_bus("abcde").await;

        let exit = tokio::time::timeout(Duration::from_secs(2), client.shutdown())
            .await
            .expect("shutdown hung")
            .unwrap();
        assert!(matches!(exit, LoopExit::Stopped));
    }

    #[tokio::test]
    async fn test_link_loss_fails_waiters() {
        let (mut client, bus) = client_with_bus("abcde").await;
        let mut events = client.take_event_receiver().unwrap();

        let response = client
            .request(&Address::new("prodc").unwrap(), b"{}")
            .await
            .unwrap();
        drop(bus);

        assert!(matches!(response.recv().await, Err(BusError::ConnectionClosed)));
        assert!(matches!(
            events.recv().await.unwrap(),
            BusEvent::Disconnected { .. }
        ));
        assert!(!client.is_connected());
    }
}
