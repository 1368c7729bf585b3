//! Process-wide map from user identity to its live outbound channel.

use axum::extract::ws::Message;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendTimeoutError, error::TrySendError};
use tokio::sync::watch;

use crate::chat::message::UserId;

/// Cloneable handle to one connection's bounded outbound buffer.
///
/// Equality is channel identity: two handles are the same connection only
/// if they feed the same buffer, regardless of which user they belong to.
///
/// Closing does not go through the buffer. It sets a stop signal the session
/// watches, so a connection whose buffer is full can still be ended.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    tx: mpsc::Sender<Message>,
    stop: Arc<watch::Sender<Option<CloseRequest>>>,
}

/// Close code and reason the session sends when it is told to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseRequest {
    pub code: u16,
    pub reason: &'static str,
}

/// Result of pushing one frame onto a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Buffer stayed full for the whole wait.
    Dropped,
    /// Writer side is gone.
    Closed,
}

impl ConnectionHandle {
    pub fn new(tx: mpsc::Sender<Message>) -> Self {
        let (stop, _) = watch::channel(None);
        Self {
            tx,
            stop: Arc::new(stop),
        }
    }

    pub fn same_connection(&self, other: &ConnectionHandle) -> bool {
        self.tx.same_channel(&other.tx)
    }

    /// Enqueue a frame, waiting at most `wait` for buffer space.
    pub async fn deliver(&self, frame: Message, wait: Duration) -> Delivery {
        match self.tx.try_send(frame) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
            Err(TrySendError::Full(frame)) => match self.tx.send_timeout(frame, wait).await {
                Ok(()) => Delivery::Queued,
                Err(SendTimeoutError::Timeout(_)) => Delivery::Dropped,
                Err(SendTimeoutError::Closed(_)) => Delivery::Closed,
            },
        }
    }

    /// Enqueue a frame only if there is room right now.
    pub fn try_deliver(&self, frame: Message) -> Delivery {
        match self.tx.try_send(frame) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => Delivery::Dropped,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Tell the session to send a close frame and stop. The first request
    /// wins; returns false if the connection was already told to close.
    pub fn close(&self, code: u16, reason: &'static str) -> bool {
        self.stop.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(CloseRequest { code, reason });
            true
        })
    }

    pub fn close_request(&self) -> Option<CloseRequest> {
        *self.stop.borrow()
    }

    /// Receiver that observes [`ConnectionHandle::close`] on any clone.
    pub fn stop_signal(&self) -> watch::Receiver<Option<CloseRequest>> {
        self.stop.subscribe()
    }
}

/// Read side of the registry, the only thing fanout needs.
pub trait PeerLookup: Send + Sync {
    fn lookup(&self, user_id: UserId) -> Option<ConnectionHandle>;
}

/// At most one entry per identity. A newer registration replaces the older
/// one, and removal only succeeds for the handle currently registered.
///
/// Every operation touches a single DashMap shard under its lock and never
/// awaits, so none of them can block on I/O.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    entries: DashMap<UserId, ConnectionHandle>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `user_id` to `handle`, returning the displaced handle if any.
    pub fn register(&self, user_id: UserId, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let previous = self.entries.insert(user_id, handle);
        tracing::debug!(
            user_id,
            replaced = previous.is_some(),
            "Connection registered"
        );
        previous
    }

    /// Remove the entry for `user_id` only if it is still `handle`.
    /// Returns whether anything was removed.
    pub fn deregister(&self, user_id: UserId, handle: &ConnectionHandle) -> bool {
        let removed = self
            .entries
            .remove_if(&user_id, |_, current| current.same_connection(handle))
            .is_some();
        tracing::debug!(user_id, removed, "Connection deregistered");
        removed
    }

    pub fn lookup(&self, user_id: UserId) -> Option<ConnectionHandle> {
        self.entries.get(&user_id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl PeerLookup for ConnectionRegistry {
    fn lookup(&self, user_id: UserId) -> Option<ConnectionHandle> {
        ConnectionRegistry::lookup(self, user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn handle(capacity: usize) -> (ConnectionHandle, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity);
        (ConnectionHandle::new(tx), rx)
    }

    #[test]
    fn register_returns_displaced_handle() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = handle(4);
        let (second, _rx2) = handle(4);

        assert!(registry.register(1, first.clone()).is_none());
        let displaced = registry.register(1, second.clone()).unwrap();
        assert!(displaced.same_connection(&first));
        assert!(registry.lookup(1).unwrap().same_connection(&second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn stale_deregister_keeps_newer_entry() {
        let registry = ConnectionRegistry::new();
        let (old, _rx1) = handle(4);
        let (new, _rx2) = handle(4);

        registry.register(1, old.clone());
        registry.register(1, new.clone());

        assert!(!registry.deregister(1, &old));
        assert!(registry.lookup(1).unwrap().same_connection(&new));

        assert!(registry.deregister(1, &new));
        assert!(registry.lookup(1).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn deregister_ignores_handle_of_other_user() {
        let registry = ConnectionRegistry::new();
        let (a, _rx1) = handle(4);
        let (b, _rx2) = handle(4);
        registry.register(1, a);
        registry.register(2, b.clone());

        assert!(!registry.deregister(1, &b));
        assert!(registry.lookup(1).is_some());
    }

    #[test]
    fn clones_are_the_same_connection() {
        let (a, _rx) = handle(1);
        let (b, _rx2) = handle(1);
        assert!(a.same_connection(&a.clone()));
        assert!(!a.same_connection(&b));
    }

    #[tokio::test]
    async fn deliver_drops_when_buffer_stays_full() {
        let (h, mut rx) = handle(1);
        assert_eq!(h.deliver(Message::Text("one".into()), Duration::from_millis(10)).await, Delivery::Queued);
        assert_eq!(
            h.deliver(Message::Text("two".into()), Duration::from_millis(20)).await,
            Delivery::Dropped
        );
        assert!(matches!(rx.recv().await, Some(Message::Text(t)) if t.as_str() == "one"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_reaches_session_with_full_buffer() {
        let (h, _rx) = handle(1);
        let mut stop = h.clone().stop_signal();
        assert_eq!(h.try_deliver(Message::Text("fill".into())), Delivery::Queued);
        assert_eq!(h.try_deliver(Message::Text("more".into())), Delivery::Dropped);

        assert!(h.close(4000, "Superseded by a newer connection"));
        assert!(!h.close(1001, "Pong timeout"));

        tokio::time::timeout(Duration::from_secs(1), stop.changed())
            .await
            .expect("stop signal not observed")
            .unwrap();
        let request = (*stop.borrow()).expect("close request set");
        assert_eq!(request.code, 4000);
        assert_eq!(h.close_request(), Some(request));
    }

    #[tokio::test]
    async fn deliver_reports_closed_receiver() {
        let (h, rx) = handle(1);
        drop(rx);
        assert_eq!(
            h.deliver(Message::Text("x".into()), Duration::from_millis(10)).await,
            Delivery::Closed
        );
    }

    #[tokio::test]
    async fn concurrent_register_and_deregister_leave_consistent_map() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut tasks = Vec::new();
        for user in 0..32i64 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let mut receivers = Vec::new();
                let mut last = None;
                for _ in 0..16 {
                    let (tx, rx) = mpsc::channel(1);
                    let h = ConnectionHandle::new(tx);
                    if let Some(previous) = registry.register(user, h.clone()) {
                        registry.deregister(user, &previous);
                    }
                    receivers.push(rx);
                    last = Some(h);
                }
                last
            }));
        }
        for (user, task) in tasks.into_iter().enumerate() {
            let last = task.await.unwrap().unwrap();
            assert!(registry.lookup(user as i64).unwrap().same_connection(&last));
        }
        assert_eq!(registry.len(), 32);
    }
}
