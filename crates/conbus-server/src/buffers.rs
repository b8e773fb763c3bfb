//! Per-client broadcast buffers.
//!
//! Every frame the emulator or proxy originates goes to every connected
//! client. [`ClientBufferManager`] owns the registry: one bounded queue
//! per client, all of them under a single mutex. Broadcast never awaits a
//! slow consumer; a client whose queue is full is disconnected instead.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

/// Default soft cap of a per-client buffer, in frames.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1024;

/// Registry of per-client outbound buffers.
#[derive(Debug)]
pub struct ClientBufferManager {
    clients: Mutex<HashMap<u64, mpsc::Sender<Vec<u8>>>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl ClientBufferManager {
    /// Create a manager with the given per-client capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            capacity: capacity.max(1),
        }
    }

    /// Register a new client; returns its id and the queue to drain.
    ///
    /// The client only sees frames broadcast after this call.
    pub fn register(&self) -> (u64, mpsc::Receiver<Vec<u8>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.capacity);
        self.lock().insert(id, tx);
        (id, rx)
    }

    /// Remove a client; its writer sees the queue close.
    pub fn unregister(&self, id: u64) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Append `frame` to every registered buffer.
    ///
    /// Clients over their cap are dropped from the registry; closing the
    /// sender ends their writer task. Returns the number of buffers that
    /// accepted the frame.
    pub fn broadcast(&self, frame: &[u8]) -> usize {
        let mut clients = self.lock();
        let mut delivered = 0;
        let mut slow = Vec::new();
        for (&id, tx) in clients.iter() {
            match tx.try_send(frame.to_vec()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => slow.push(id),
                Err(mpsc::error::TrySendError::Closed(_)) => slow.push(id),
            }
        }
        for id in slow {
            tracing::warn!(client = id, "buffer over cap, disconnecting slow client");
            clients.remove(&id);
        }
        delivered
    }

    /// Number of registered clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, mpsc::Sender<Vec<u8>>>> {
        self.clients.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for ClientBufferManager {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_reaches_every_registered_client() {
        let manager = ClientBufferManager::default();
        let (_a, mut rx_a) = manager.register();
        let (_b, mut rx_b) = manager.register();

        assert_eq!(manager.broadcast(b"<R0020030837F01DFM>"), 2);
        assert_eq!(rx_a.recv().await.unwrap(), b"<R0020030837F01DFM>");
        assert_eq!(rx_b.recv().await.unwrap(), b"<R0020030837F01DFM>");
    }

    #[tokio::test]
    async fn late_client_misses_earlier_broadcasts() {
        let manager = ClientBufferManager::default();
        let (_a, mut rx_a) = manager.register();

        manager.broadcast(b"<A>");
        let (_b, mut rx_b) = manager.register();
        manager.broadcast(b"<B>");

        assert_eq!(rx_a.recv().await.unwrap(), b"<A>");
        assert_eq!(rx_a.recv().await.unwrap(), b"<B>");
        assert_eq!(rx_b.recv().await.unwrap(), b"<B>");
        assert!(rx_b.try_recv().is_err(), "no frames from before registration");
    }

    #[tokio::test]
    async fn unregistered_client_is_skipped() {
        let manager = ClientBufferManager::default();
        let (a, _rx_a) = manager.register();
        let (_b, _rx_b) = manager.register();

        assert!(manager.unregister(a));
        assert!(!manager.unregister(a));
        assert_eq!(manager.client_count(), 1);
        assert_eq!(manager.broadcast(b"<A>"), 1);
    }

    #[tokio::test]
    async fn slow_client_is_disconnected_at_cap() {
        let manager = ClientBufferManager::new(2);
        let (_slow, mut rx_slow) = manager.register();
        let (_fast, mut rx_fast) = manager.register();

        manager.broadcast(b"<A>");
        manager.broadcast(b"<B>");
        // The fast client drains; the slow one does not.
        assert_eq!(rx_fast.recv().await.unwrap(), b"<A>");
        assert_eq!(rx_fast.recv().await.unwrap(), b"<B>");
        // The third frame overflows the undrained slow buffer.
        manager.broadcast(b"<C>");

        assert_eq!(manager.client_count(), 1);
        assert_eq!(rx_fast.recv().await.unwrap(), b"<C>");
        // The slow client keeps what was queued, then its channel closes.
        assert_eq!(rx_slow.recv().await.unwrap(), b"<A>");
        assert_eq!(rx_slow.recv().await.unwrap(), b"<B>");
        assert!(rx_slow.recv().await.is_none());
    }
}
