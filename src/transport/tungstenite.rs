//! tokio-tungstenite implementation of the transport host.
//!
//! Each opened connection gets a writer task (owning the sink half) and a
//! reader task (forwarding inbound frames as [`TransportEvent`]s). The host
//! registry is the source of truth for which connections are open; an
//! unsolicited stream end removes the registry entry and emits
//! `Disconnected`, while an explicit `close` removes the entry first so no
//! disconnect event is produced.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::{
    connect_async as tungstenite_connect,
    tungstenite::{Message as TungsteniteMessage, Utf8Bytes, client::IntoClientRequest},
};
use tracing::{debug, warn};

use crate::core::{ConnectionId, EngineError, TransportPayload};
use crate::tls::install_rustls_crypto_provider;
use crate::transport::{
    ConnectionRecord, HostFuture, TransportEvent, TransportEventSender, TransportHost,
};

fn map_transport_error(context: &'static str, err: impl ToString) -> EngineError {
    EngineError::Transport {
        context,
        error: err.to_string(),
    }
}

fn payload_to_msg(payload: Bytes) -> TungsteniteMessage {
    match std::str::from_utf8(payload.as_ref()) {
        // Valid UTF-8 was just checked.
        Ok(_) => TungsteniteMessage::Text(unsafe { Utf8Bytes::from_bytes_unchecked(payload) }),
        Err(_) => TungsteniteMessage::Binary(payload),
    }
}

struct ConnectionHandle {
    url: String,
    protocols: Vec<String>,
    outbound: mpsc::UnboundedSender<Bytes>,
}

struct HostInner {
    events: TransportEventSender,
    next_id: AtomicU64,
    connections: Mutex<HashMap<ConnectionId, ConnectionHandle>>,
}

/// Websocket transport host backed by tokio-tungstenite.
#[derive(Clone)]
pub struct TungsteniteHost {
    inner: Arc<HostInner>,
}

impl TungsteniteHost {
    pub fn new(events: TransportEventSender) -> Self {
        Self {
            inner: Arc::new(HostInner {
                events,
                next_id: AtomicU64::new(1),
                connections: Mutex::new(HashMap::new()),
            }),
        }
    }
}

impl TransportHost for TungsteniteHost {
    fn open(&self, url: String, protocols: Vec<String>) -> HostFuture<ConnectionId> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            install_rustls_crypto_provider();

            let mut request = url
                .as_str()
                .into_client_request()
                .map_err(|err| map_transport_error("request", err))?;
            if !protocols.is_empty() {
                let joined = protocols.join(", ");
                let value = joined
                    .parse()
                    .map_err(|err| map_transport_error("request", err))?;
                let _ = request
                    .headers_mut()
                    .insert("Sec-WebSocket-Protocol", value);
            }

            let (stream, _) = tungstenite_connect(request)
                .await
                .map_err(|err| map_transport_error("open", err))?;
            let (mut write, mut read) = stream.split();

            let id = ConnectionId(inner.next_id.fetch_add(1, Ordering::Relaxed));
            let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Bytes>();
            inner.connections.lock().await.insert(
                id,
                ConnectionHandle {
                    url: url.clone(),
                    protocols,
                    outbound: outbound_tx,
                },
            );

            // Writer task: drains the outbound queue into the sink. Ends when
            // the handle is dropped (explicit close) or a write fails.
            let writer_inner = Arc::clone(&inner);
            tokio::spawn(async move {
                while let Some(payload) = outbound_rx.recv().await {
                    if let Err(err) = write.send(payload_to_msg(payload)).await {
                        warn!(connection = %id, error = %err, "websocket write failed");
                        break;
                    }
                }
                let _ = write.close().await;
                drop(writer_inner);
            });

            // Reader task: forwards frames as events; stream end or read
            // failure reconciles the registry and emits a disconnect.
            let reader_inner = Arc::clone(&inner);
            tokio::spawn(async move {
                loop {
                    match read.next().await {
                        Some(Ok(TungsteniteMessage::Text(text))) => {
                            let bytes = AsRef::<Bytes>::as_ref(&text).clone();
                            let _ = reader_inner.events.send(TransportEvent::Message {
                                connection: id,
                                payload: TransportPayload::Text(bytes),
                            });
                        }
                        Some(Ok(TungsteniteMessage::Binary(bytes))) => {
                            let _ = reader_inner.events.send(TransportEvent::Message {
                                connection: id,
                                payload: TransportPayload::Binary(bytes),
                            });
                        }
                        Some(Ok(TungsteniteMessage::Close(frame))) => {
                            debug!(connection = %id, close = ?frame, "received websocket close frame");
                            break;
                        }
                        Some(Ok(_)) => {
                            // Ping/pong frames are handled by tungstenite.
                        }
                        Some(Err(err)) => {
                            warn!(connection = %id, error = %err, "websocket read failed");
                            break;
                        }
                        None => break,
                    }
                }

                // Only an unsolicited drop still has a registry entry.
                let was_open = reader_inner.connections.lock().await.remove(&id).is_some();
                if was_open {
                    let _ = reader_inner.events.send(TransportEvent::Disconnected(id));
                }
            });

            let _ = inner.events.send(TransportEvent::Connected(id));
            Ok(id)
        })
    }

    fn send(&self, connection: ConnectionId, payload: Bytes) -> HostFuture<()> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            let connections = inner.connections.lock().await;
            let handle = connections.get(&connection).ok_or_else(|| {
                map_transport_error("send", format!("connection {connection} is not open"))
            })?;
            handle
                .outbound
                .send(payload)
                .map_err(|_| map_transport_error("send", "writer task stopped"))
        })
    }

    fn close(&self, connection: ConnectionId) -> HostFuture<()> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            // Dropping the handle closes the outbound channel, which ends the
            // writer task and closes the sink.
            let removed = inner.connections.lock().await.remove(&connection);
            if removed.is_none() {
                debug!(connection = %connection, "close for unknown connection ignored");
            }
            Ok(())
        })
    }

    fn list_all(&self) -> HostFuture<Vec<ConnectionRecord>> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            let connections = inner.connections.lock().await;
            Ok(connections
                .iter()
                .map(|(id, handle)| ConnectionRecord {
                    id: *id,
                    url: handle.url.clone(),
                    protocols: handle.protocols.clone(),
                })
                .collect())
        })
    }
}
