//! Transport Seam
//!
//! The only place the async network side meets the game thread.
//!
//! ```text
//!   socket tasks ──► IngressEvent ──► [bounded mpsc] ──► game thread (try_recv, once per iteration)
//!   game thread  ──► Vec<u8>      ──► [bounded mpsc per session] ──► socket task
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::core::ids::SessionId;

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Ingress queue is full.
    #[error("Ingress queue full")]
    QueueFull,

    /// Game is no longer draining the queue.
    #[error("Game is not accepting events")]
    Closed,
}

/// Event handed from the transport to the game thread.
#[derive(Debug)]
pub enum IngressEvent {
    /// A session connected.
    Connected {
        /// Session.
        session: SessionId,
        /// Account lookup key.
        account_key: String,
        /// Egress queue for encoded messages to this session.
        egress: mpsc::Sender<Vec<u8>>,
    },

    /// A session disconnected.
    Disconnected {
        /// Session.
        session: SessionId,
    },

    /// Raw inbound payload.
    Message {
        /// Session.
        session: SessionId,
        /// Encoded client message.
        payload: Vec<u8>,
    },
}

/// Cloneable sender side of a game's ingress queue.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    ingress: mpsc::Sender<IngressEvent>,
    next_session: Arc<AtomicU64>,
    egress_capacity: usize,
}

impl TransportHandle {
    /// Create the ingress queue.
    pub fn new(ingress_capacity: usize, egress_capacity: usize) -> (Self, mpsc::Receiver<IngressEvent>) {
        let (tx, rx) = mpsc::channel(ingress_capacity.max(1));
        let handle = Self {
            ingress: tx,
            next_session: Arc::new(AtomicU64::new(1)),
            egress_capacity: egress_capacity.max(1),
        };
        (handle, rx)
    }

    /// Register a session. Returns its id and the receiver of its egress queue.
    pub async fn add_session(&self, account_key: impl Into<String>) -> Result<(SessionId, mpsc::Receiver<Vec<u8>>), TransportError> {
        let (event, session, rx) = self.connect_event(account_key.into());
        self.ingress.send(event).await.map_err(|_| TransportError::Closed)?;
        Ok((session, rx))
    }

    /// Non-async [`add_session`](Self::add_session).
    pub fn try_add_session(&self, account_key: impl Into<String>) -> Result<(SessionId, mpsc::Receiver<Vec<u8>>), TransportError> {
        let (event, session, rx) = self.connect_event(account_key.into());
        self.try_send(event)?;
        Ok((session, rx))
    }

    /// Unregister a session.
    pub async fn remove_session(&self, session: SessionId) -> Result<(), TransportError> {
        self.ingress
            .send(IngressEvent::Disconnected { session })
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Non-async [`remove_session`](Self::remove_session).
    pub fn try_remove_session(&self, session: SessionId) -> Result<(), TransportError> {
        self.try_send(IngressEvent::Disconnected { session })
    }

    /// Hand a raw payload to the game, waiting for queue space.
    pub async fn post_inbound(&self, session: SessionId, payload: Vec<u8>) -> Result<(), TransportError> {
        self.ingress
            .send(IngressEvent::Message { session, payload })
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Hand a raw payload to the game without waiting.
    pub fn try_post_inbound(&self, session: SessionId, payload: Vec<u8>) -> Result<(), TransportError> {
        self.try_send(IngressEvent::Message { session, payload })
    }

    /// True once the game dropped its receiver.
    pub fn is_closed(&self) -> bool {
        self.ingress.is_closed()
    }

    fn connect_event(&self, account_key: String) -> (IngressEvent, SessionId, mpsc::Receiver<Vec<u8>>) {
        let session = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed));
        let (egress, rx) = mpsc::channel(self.egress_capacity);
        debug!("Session {} registered for {}", session, account_key);
        (IngressEvent::Connected { session, account_key, egress }, session, rx)
    }

    fn try_send(&self, event: IngressEvent) -> Result<(), TransportError> {
        self.ingress.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let (handle, mut rx) = TransportHandle::new(8, 4);
        let (session, _egress) = handle.add_session("alice").await.unwrap();
        handle.post_inbound(session, vec![1, 2]).await.unwrap();
        handle.remove_session(session).await.unwrap();

        assert!(matches!(rx.try_recv(), Ok(IngressEvent::Connected { account_key, .. }) if account_key == "alice"));
        assert!(matches!(rx.try_recv(), Ok(IngressEvent::Message { payload, .. }) if payload == vec![1, 2]));
        assert!(matches!(rx.try_recv(), Ok(IngressEvent::Disconnected { session: s }) if s == session));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_bounded_ingress() {
        let (handle, rx) = TransportHandle::new(1, 4);
        handle.try_post_inbound(SessionId(1), vec![]).unwrap();
        assert_eq!(handle.try_post_inbound(SessionId(1), vec![]), Err(TransportError::QueueFull));
        drop(rx);
        assert!(handle.is_closed());
        assert_eq!(handle.try_remove_session(SessionId(1)), Err(TransportError::Closed));
    }

    #[test]
    fn test_session_ids_are_unique() {
        let (handle, _rx) = TransportHandle::new(8, 4);
        let (a, _) = handle.try_add_session("a").unwrap();
        let (b, _) = handle.try_add_session("b").unwrap();
        assert_ne!(a, b);
        assert!(a.is_valid() && b.is_valid());
    }
}
