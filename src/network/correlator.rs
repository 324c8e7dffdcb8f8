//! Request/response correlation
//!
//! The wire carries no request identifier, so an inbound frame is matched to
//! an outstanding request purely by its sender address. Only one request per
//! destination can be told apart; a second one is refused with
//! [`BusError::AlreadyPending`] until the first is answered or cancelled.

use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::{mpsc, oneshot, Mutex};

use super::connection::{BusError, BusResult};
use crate::protocol::{Address, Frame};

/// What to do with the response from a destination
pub enum PendingHandler {
    /// Invoke a callback on the receive task
    Callback(Box<dyn FnOnce(Bytes) + Send>),
    /// Wake a task waiting on [`PendingResponse`]
    Waiter(oneshot::Sender<Bytes>),
}

impl PendingHandler {
    pub fn callback<F>(f: F) -> Self
    where
        F: FnOnce(Bytes) + Send + 'static,
    {
        PendingHandler::Callback(Box::new(f))
    }

    /// Create a waiter handler and the response handle it completes
    pub fn waiter(address: Address) -> (Self, PendingResponse) {
        let (tx, rx) = oneshot::channel();
        (PendingHandler::Waiter(tx), PendingResponse { address, rx })
    }

    /// Deliver the body. Gives it back if the waiter has gone away.
    fn complete(self, body: Bytes) -> Result<(), Bytes> {
        match self {
            PendingHandler::Callback(f) => {
                f(body);
                Ok(())
            }
            PendingHandler::Waiter(tx) => tx.send(body),
        }
    }
}

impl fmt::Debug for PendingHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PendingHandler::Callback(_) => f.write_str("PendingHandler::Callback"),
            PendingHandler::Waiter(_) => f.write_str("PendingHandler::Waiter"),
        }
    }
}

/// Handle to a response that has not arrived yet
#[derive(Debug)]
pub struct PendingResponse {
    address: Address,
    rx: oneshot::Receiver<Bytes>,
}

impl PendingResponse {
    /// The destination the response is expected from
    pub fn address(&self) -> Address {
        self.address
    }

    /// Wait for the response body
    ///
    /// Fails with [`BusError::ConnectionClosed`] if the link is lost or the
    /// request is cancelled first.
    pub async fn recv(self) -> BusResult<Bytes> {
        self.rx.await.map_err(|_| BusError::ConnectionClosed)
    }
}

/// Outcome of routing one inbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Completed the pending request for the sender
    Pending,
    /// No request was pending; forwarded to the unsolicited channel
    Unsolicited,
    /// Nobody could take the frame
    Dropped,
}

/// Matches inbound frames to outstanding requests
#[derive(Debug)]
pub struct Correlator {
    pending: Mutex<HashMap<Address, PendingHandler>>,
    unsolicited: Option<mpsc::Sender<Frame>>,
}

impl Correlator {
    /// Create a correlator; frames nobody is waiting for go to `unsolicited`
    pub fn new(unsolicited: Option<mpsc::Sender<Frame>>) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            unsolicited,
        }
    }

    /// Register the handler for the next frame from `address`
    pub async fn register_pending(
        &self,
        address: Address,
        handler: PendingHandler,
    ) -> BusResult<()> {
        let mut pending = self.pending.lock().await;
        if pending.contains_key(&address) {
            return Err(BusError::AlreadyPending(address));
        }
        pending.insert(address, handler);
        Ok(())
    }

    /// Register a waiter for the next frame from `address`
    pub async fn expect(&self, address: Address) -> BusResult<PendingResponse> {
        let (handler, response) = PendingHandler::waiter(address);
        self.register_pending(address, handler).await?;
        Ok(response)
    }

    /// Route one inbound frame
    ///
    /// The pending entry for `sender`, if any, is removed and completed exactly
    /// once. The handler runs after the table lock is released.
    pub async fn resolve(&self, sender: Address, body: Bytes) -> Resolution {
        let handler = self.pending.lock().await.remove(&sender);

        let body = match handler {
            Some(handler) => match handler.complete(body) {
                Ok(()) => return Resolution::Pending,
                Err(body) => {
                    tracing::debug!(
                        "Waiter for '{}' went away, treating reply as unsolicited",
                        sender
                    );
                    body
                }
            },
            None => body,
        };

        let Some(tx) = &self.unsolicited else {
            tracing::debug!("Dropping unsolicited frame from '{}'", sender);
            return Resolution::Dropped;
        };

        match tx.try_send(Frame::new(sender, body)) {
            Ok(()) => Resolution::Unsolicited,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("Unsolicited queue full, dropping frame from '{}'", sender);
                Resolution::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("Unsolicited queue closed, dropping frame from '{}'", sender);
                Resolution::Dropped
            }
        }
    }

    /// Forget the pending request for `address`
    pub async fn cancel(&self, address: &Address) -> bool {
        self.pending.lock().await.remove(address).is_some()
    }

    /// Drop every pending handler, so waiters observe the link going away
    pub async fn fail_all(&self) -> usize {
        let drained: Vec<_> = self.pending.lock().await.drain().collect();
        drained.len()
    }

    pub async fn is_pending(&self, address: &Address) -> bool {
        self.pending.lock().await.contains_key(address)
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};

    fn addr(name: &str) -> Address {
        Address::new(name).unwrap()
    }

    #[tokio::test]
    async fn test_waiter_resolved_once() {
        let correlator = Correlator::new(None);
        let prodc = addr("prodc");

        let response = correlator.expect(prodc).await.unwrap();
        assert!(correlator.is_pending(&prodc).await);

        let body = Bytes::from_static(br#"{"status":"success","data":[]}"#);
        assert_eq!(
            correlator.resolve(prodc, body.clone()).await,
            Resolution::Pending
        );
        assert!(!correlator.is_pending(&prodc).await);
        assert_eq!(response.recv().await.unwrap(), body);

        // A second reply has nowhere to go
        assert_eq!(
            correlator.resolve(prodc, Bytes::from_static(b"late")).await,
            Resolution::Dropped
        );
    }

    #[tokio::test]
    async fn test_callback_receives_body() {
        let correlator = Correlator::new(None);
        let seen = Arc::new(StdMutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        correlator
            .register_pending(
                addr("prodc"),
                PendingHandler::callback(move |body| sink.lock().unwrap().push(body)),
            )
            .await
            .unwrap();

        correlator
            .resolve(addr("prodc"), Bytes::from_static(b"one"))
            .await;
        correlator
            .resolve(addr("prodc"), Bytes::from_static(b"two"))
            .await;

        assert_eq!(*seen.lock().unwrap(), vec![Bytes::from_static(b"one")]);
    }

    #[tokio::test]
    async fn test_second_request_to_same_destination_refused() {
        let correlator = Correlator::new(None);
        let _first = correlator.expect(addr("prodc")).await.unwrap();

        assert!(matches!(
            correlator.expect(addr("prodc")).await,
            Err(BusError::AlreadyPending(a)) if a == addr("prodc")
        ));
        // Other destinations are independent
        assert!(correlator.expect(addr("users")).await.is_ok());
        assert_eq!(correlator.pending_count().await, 2);
    }

    #[tokio::test]
    async fn test_unsolicited_routing() {
        let (tx, mut rx) = mpsc::channel(4);
        let correlator = Correlator::new(Some(tx));
        let _pending = correlator.expect(addr("prodc")).await.unwrap();

        assert_eq!(
            correlator
                .resolve(addr("other"), Bytes::from_static(b"ping"))
                .await,
            Resolution::Unsolicited
        );
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.address, addr("other"));
        assert_eq!(&frame.body[..], b"ping");

        // The unrelated frame left the prodc request in place
        assert!(correlator.is_pending(&addr("prodc")).await);
    }

    #[tokio::test]
    async fn test_abandoned_waiter_falls_back_to_unsolicited() {
        let (tx, mut rx) = mpsc::channel(4);
        let correlator = Correlator::new(Some(tx));

        drop(correlator.expect(addr("prodc")).await.unwrap());

        assert_eq!(
            correlator
                .resolve(addr("prodc"), Bytes::from_static(b"late"))
                .await,
            Resolution::Unsolicited
        );
        assert_eq!(&rx.recv().await.unwrap().body[..], b"late");
    }

    #[tokio::test]
    async fn test_full_unsolicited_queue_drops() {
        let (tx, _rx) = mpsc::channel(1);
        let correlator = Correlator::new(Some(tx));

        assert_eq!(
            correlator.resolve(addr("aaaaa"), Bytes::new()).await,
            Resolution::Unsolicited
        );
        assert_eq!(
            correlator.resolve(addr("aaaaa"), Bytes::new()).await,
            Resolution::Dropped
        );
    }

    #[tokio::test]
    async fn test_cancel_and_fail_all() {
        let correlator = Correlator::new(None);

        let cancelled = correlator.expect(addr("prodc")).await.unwrap();
        assert!(correlator.cancel(&addr("prodc")).await);
        assert!(!correlator.cancel(&addr("prodc")).await);
        assert!(matches!(
            cancelled.recv().await,
            Err(BusError::ConnectionClosed)
        ));

        let a = correlator.expect(addr("aaaaa")).await.unwrap();
        let b = correlator.expect(addr("bbbbb")).await.unwrap();
        assert_eq!(correlator.fail_all().await, 2);
        assert!(a.recv().await.is_err());
        assert!(b.recv().await.is_err());
        assert_eq!(correlator.pending_count().await, 0);
    }
}
