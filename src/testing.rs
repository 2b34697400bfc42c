//! In-memory transport host and store for tests.
//!
//! `MockHost` mirrors the real host's observable behavior (host-assigned ids,
//! connected events on open, send failures for unknown connections) while
//! recording every interaction so tests can assert on wire traffic without a
//! network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::core::{ConnectionId, EngineError};
use crate::store::{KvStore, StoreFuture};
use crate::transport::{
    ConnectionRecord, HostFuture, TransportEvent, TransportEventSender, TransportHost,
};

#[derive(Default)]
struct MockHostState {
    connections: HashMap<ConnectionId, (String, Vec<String>)>,
    sent: Vec<(ConnectionId, Bytes)>,
}

struct MockHostInner {
    events: TransportEventSender,
    next_id: AtomicU64,
    open_count: AtomicUsize,
    close_count: AtomicUsize,
    fail_opens: AtomicUsize,
    fail_sends: AtomicUsize,
    state: Mutex<MockHostState>,
}

#[derive(Clone)]
pub struct MockHost {
    inner: Arc<MockHostInner>,
}

impl MockHost {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let host = Self {
            inner: Arc::new(MockHostInner {
                events,
                next_id: AtomicU64::new(1),
                open_count: AtomicUsize::new(0),
                close_count: AtomicUsize::new(0),
                fail_opens: AtomicUsize::new(0),
                fail_sends: AtomicUsize::new(0),
                state: Mutex::new(MockHostState::default()),
            }),
        };
        (host, rx)
    }

    /// Make the next `n` open calls fail.
    pub fn fail_opens(&self, n: usize) {
        self.inner.fail_opens.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` send calls fail.
    pub fn fail_sends(&self, n: usize) {
        self.inner.fail_sends.store(n, Ordering::SeqCst);
    }

    pub fn open_count(&self) -> usize {
        self.inner.open_count.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.inner.close_count.load(Ordering::SeqCst)
    }

    /// Every payload sent so far, in order.
    pub fn sent(&self) -> Vec<(ConnectionId, Bytes)> {
        self.inner.state.lock().unwrap().sent.clone()
    }

    /// Sent payloads decoded as UTF-8, in order.
    pub fn sent_texts(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .map(|(_, bytes)| String::from_utf8_lossy(&bytes).into_owned())
            .collect()
    }

    pub fn clear_sent(&self) {
        self.inner.state.lock().unwrap().sent.clear();
    }

    /// Simulate an unsolicited drop: forget the connection and emit a
    /// disconnected event, like a real host losing its socket.
    pub fn drop_connection(&self, id: ConnectionId) {
        let removed = self
            .inner
            .state
            .lock()
            .unwrap()
            .connections
            .remove(&id)
            .is_some();
        if removed {
            let _ = self.inner.events.send(TransportEvent::Disconnected(id));
        }
    }

    /// Deliver an inbound payload as if the server pushed it.
    pub fn push_message(&self, connection: ConnectionId, payload: crate::core::TransportPayload) {
        let _ = self.inner.events.send(TransportEvent::Message {
            connection,
            payload,
        });
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl TransportHost for MockHost {
    fn open(&self, url: String, protocols: Vec<String>) -> HostFuture<ConnectionId> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            inner.open_count.fetch_add(1, Ordering::SeqCst);
            if Self::take_failure(&inner.fail_opens) {
                return Err(EngineError::transport("open", "injected open failure"));
            }
            let id = ConnectionId(inner.next_id.fetch_add(1, Ordering::SeqCst));
            inner
                .state
                .lock()
                .unwrap()
                .connections
                .insert(id, (url, protocols));
            let _ = inner.events.send(TransportEvent::Connected(id));
            Ok(id)
        })
    }

    fn send(&self, connection: ConnectionId, payload: Bytes) -> HostFuture<()> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            if Self::take_failure(&inner.fail_sends) {
                return Err(EngineError::transport("send", "injected send failure"));
            }
            let mut state = inner.state.lock().unwrap();
            if !state.connections.contains_key(&connection) {
                return Err(EngineError::transport("send", "connection is not open"));
            }
            state.sent.push((connection, payload));
            Ok(())
        })
    }

    fn close(&self, connection: ConnectionId) -> HostFuture<()> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            inner.close_count.fetch_add(1, Ordering::SeqCst);
            inner.state.lock().unwrap().connections.remove(&connection);
            Ok(())
        })
    }

    fn list_all(&self) -> HostFuture<Vec<ConnectionRecord>> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            let state = inner.state.lock().unwrap();
            Ok(state
                .connections
                .iter()
                .map(|(id, (url, protocols))| ConnectionRecord {
                    id: *id,
                    url: url.clone(),
                    protocols: protocols.clone(),
                })
                .collect())
        })
    }
}

/// Store backed by a shared in-process map.
#[derive(Clone, Default)]
pub struct MemoryStore {
    data: Arc<Mutex<HashMap<String, Bytes>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw bytes currently stored under `path`, if any.
    pub fn raw(&self, path: &str) -> Option<Bytes> {
        self.data.lock().unwrap().get(path).cloned()
    }
}

impl KvStore for MemoryStore {
    fn get_raw(&self, path: &str) -> StoreFuture<Option<Bytes>> {
        let data = Arc::clone(&self.data);
        let path = path.to_string();
        Box::pin(async move { Ok(data.lock().unwrap().get(&path).cloned()) })
    }

    fn set_raw(&self, path: &str, value: Bytes) -> StoreFuture<()> {
        let data = Arc::clone(&self.data);
        let path = path.to_string();
        Box::pin(async move {
            data.lock().unwrap().insert(path, value);
            Ok(())
        })
    }

    fn delete_raw(&self, path: &str) -> StoreFuture<()> {
        let data = Arc::clone(&self.data);
        let path = path.to_string();
        Box::pin(async move {
            data.lock().unwrap().remove(&path);
            Ok(())
        })
    }
}
