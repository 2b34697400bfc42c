//! Transport boundary for the subscription engine.
//!
//! A transport host owns the physical duplex connections; the engine owns
//! protocol state and policies. The trait is intentionally minimal so
//! different websocket implementations can be swapped while keeping the
//! subscribe/notify/recover logic unchanged.

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::core::{ConnectionId, EngineResult, TransportPayload};

pub mod tungstenite;

pub type HostFuture<T> = Pin<Box<dyn Future<Output = EngineResult<T>> + Send + 'static>>;

/// One open transport connection as reported by the host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionRecord {
    pub id: ConnectionId,
    pub url: String,
    pub protocols: Vec<String>,
}

/// Events pushed from the host into the engine.
#[derive(Debug)]
pub enum TransportEvent {
    Connected(ConnectionId),
    Disconnected(ConnectionId),
    Message {
        connection: ConnectionId,
        payload: TransportPayload,
    },
}

/// Sender half handed to a host at construction; the engine consumes the
/// receiving end.
pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

/// Duplex, message-oriented connection host.
pub trait TransportHost: Clone + Send + Sync + 'static {
    /// Open a new connection; the returned id is host-assigned and opaque.
    fn open(&self, url: String, protocols: Vec<String>) -> HostFuture<ConnectionId>;

    /// Send one text payload over an open connection.
    fn send(&self, connection: ConnectionId, payload: Bytes) -> HostFuture<()>;

    /// Close a connection. Closing an unknown id is a no-op.
    fn close(&self, connection: ConnectionId) -> HostFuture<()>;

    /// List every connection currently open at the host.
    fn list_all(&self) -> HostFuture<Vec<ConnectionRecord>>;
}
