use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::CLIENT_QUEUE;

/// Handle to a room's chat hub.
///
/// The hub itself is a single background task selecting over register,
/// unregister and broadcast channels; this handle is the only way in.
/// Dropping the last handle ends the task.
#[derive(Clone)]
pub struct ChatHub {
    register_tx: mpsc::UnboundedSender<(u64, mpsc::Sender<String>)>,
    unregister_tx: mpsc::UnboundedSender<u64>,
    broadcast_tx: mpsc::UnboundedSender<String>,
    client_count: Arc<AtomicUsize>,
    next_id: Arc<AtomicU64>,
}

/// A registered chat client: the receiving end of its bounded send queue.
///
/// The connection's write pump drains this; when the hub evicts or
/// unregisters the client the queue closes and `recv` returns `None`.
pub struct ChatClient {
    pub id: u64,
    queue: mpsc::Receiver<String>,
}

impl ChatClient {
    /// Next outbound message, or `None` once the hub has dropped this client.
    pub async fn recv(&mut self) -> Option<String> {
        self.queue.recv().await
    }
}

impl ChatHub {
    /// Create the hub and spawn its run loop.
    #[must_use]
    pub fn new() -> Self {
        let (register_tx, register_rx) = mpsc::unbounded_channel();
        let (unregister_tx, unregister_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, broadcast_rx) = mpsc::unbounded_channel();
        let client_count = Arc::new(AtomicUsize::new(0));

        tokio::spawn(run(
            register_rx,
            unregister_rx,
            broadcast_rx,
            Arc::clone(&client_count),
        ));

        Self {
            register_tx,
            unregister_tx,
            broadcast_tx,
            client_count,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Register a new client and hand back its send queue.
    #[must_use]
    pub fn register(&self) -> ChatClient {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE);
        let _ = self.register_tx.send((id, tx));
        ChatClient { id, queue: rx }
    }

    /// Remove a client; its send queue closes.
    pub fn unregister(&self, id: u64) {
        let _ = self.unregister_tx.send(id);
    }

    /// Fan a message out to every registered client.
    pub fn broadcast(&self, message: String) {
        let _ = self.broadcast_tx.send(message);
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.client_count.load(Ordering::Relaxed)
    }
}

impl Default for ChatHub {
    fn default() -> Self {
        Self::new()
    }
}

async fn run(
    mut register_rx: mpsc::UnboundedReceiver<(u64, mpsc::Sender<String>)>,
    mut unregister_rx: mpsc::UnboundedReceiver<u64>,
    mut broadcast_rx: mpsc::UnboundedReceiver<String>,
    client_count: Arc<AtomicUsize>,
) {
    let mut clients: HashMap<u64, mpsc::Sender<String>> = HashMap::new();

    loop {
        tokio::select! {
            registered = register_rx.recv() => {
                let Some((id, tx)) = registered else { break };
                clients.insert(id, tx);
                client_count.store(clients.len(), Ordering::Relaxed);
                debug!(client = id, total = clients.len(), "chat client registered");
            }
            unregistered = unregister_rx.recv() => {
                let Some(id) = unregistered else { break };
                if clients.remove(&id).is_some() {
                    client_count.store(clients.len(), Ordering::Relaxed);
                    debug!(client = id, total = clients.len(), "chat client unregistered");
                }
            }
            message = broadcast_rx.recv() => {
                let Some(message) = message else { break };
                // Non-blocking send per client; a full queue evicts the client.
                clients.retain(|id, tx| match tx.try_send(message.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(client = id, "evicting slow chat client");
                        false
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                });
                client_count.store(clients.len(), Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_broadcast_reaches_all_clients() {
        let hub = ChatHub::new();
        let mut a = hub.register();
        let mut b = hub.register();

        hub.broadcast("hello".to_string());

        assert_eq!(a.recv().await.as_deref(), Some("hello"));
        assert_eq!(b.recv().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_unregister_closes_queue() {
        let hub = ChatHub::new();
        let mut client = hub.register();
        hub.unregister(client.id);

        assert!(timeout(Duration::from_secs(1), client.recv())
            .await
            .expect("queue should close")
            .is_none());
    }

    #[tokio::test]
    async fn test_slow_consumer_is_evicted() {
        let hub = ChatHub::new();
        let mut slow = hub.register();
        let mut fast = hub.register();

        // Never drain `slow`; once its queue overflows the hub drops it.
        // The fast client drains as it goes and keeps receiving throughout.
        for i in 0..=CLIENT_QUEUE {
            hub.broadcast(format!("m{i}"));
            let got = timeout(Duration::from_secs(1), fast.recv())
                .await
                .expect("fast client should keep receiving");
            assert_eq!(got.as_deref(), Some(format!("m{i}").as_str()));
        }

        // The slow client's queue eventually closes after eviction.
        let mut drained = 0;
        loop {
            match timeout(Duration::from_secs(1), slow.recv()).await {
                Ok(Some(_)) => drained += 1,
                Ok(None) => break,
                Err(_) => panic!("slow client queue never closed"),
            }
        }
        assert!(drained <= CLIENT_QUEUE);
    }
}
