use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::{sync::oneshot, time::Instant};
use tracing::info;

struct Connection {
    user: String,
    last_seen: Instant,
    evict: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    connections: HashMap<u64, Connection>,
}

/// Liveness tracking for open WebSocket connections.
#[derive(Default)]
pub struct Connections {
    inner: Mutex<Inner>,
}

impl Connections {
    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a new connection. The receiver fires when the connection is evicted.
    pub fn register(&self, user: &str) -> (u64, oneshot::Receiver<()>) {
        let (evict, evicted) = oneshot::channel();
        let mut inner = self.inner();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.connections.insert(
            id,
            Connection {
                user: user.to_string(),
                last_seen: Instant::now(),
                evict: Some(evict),
            },
        );
        (id, evicted)
    }

    /// Record activity on a connection.
    pub fn touch(&self, id: u64) {
        if let Some(connection) = self.inner().connections.get_mut(&id) {
            connection.last_seen = Instant::now();
        }
    }

    pub fn unregister(&self, id: u64) {
        self.inner().connections.remove(&id);
    }

    /// Evict every connection silent for longer than `timeout`. Returns the evicted ids.
    pub fn reap(&self, timeout: Duration) -> Vec<u64> {
        let now = Instant::now();
        let mut inner = self.inner();
        let stale: Vec<u64> = inner
            .connections
            .iter()
            .filter(|(_, connection)| now.duration_since(connection.last_seen) > timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            if let Some(mut connection) = inner.connections.remove(id) {
                info!(id, user = %connection.user, "evicting silent connection");
                if let Some(evict) = connection.evict.take() {
                    let _ = evict.send(());
                }
            }
        }
        stale
    }

    pub fn len(&self) -> usize {
        self.inner().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
