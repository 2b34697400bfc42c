//! Subscription protocol engine.
//!
//! Owns the durable records, the process-local callback registry, and the
//! request-id allocator. Subscribes are persisted before any wire traffic so
//! a crash between persist and send leaves a reapable pending record rather
//! than an untracked server-side subscription.
//!
//! Inbound replies and notifications that match nothing are logged and
//! dropped; a stray message from a previous process lifetime must never tear
//! down the engine.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use tracing::{debug, info, warn};

use crate::core::{
    ConnectionId, EngineResult, FailureCallback, InboundMessage, Network, NotificationCallback,
    RecoveryCallback, RequestId, RpcError, Subscription, SubscriptionCallbacks, SubscriptionId,
    SubscriptionState, TransportPayload, classify, encode_request, now_epoch_ms,
};
use crate::engine::subscription_repo::SubscriptionRepository;
use crate::store::KvStore;
use crate::transport::TransportHost;

struct RegisteredCallbacks {
    on_notification: NotificationCallback,
    on_subscription_failed: Option<FailureCallback>,
}

/// An encoded request waiting for its network's connection to (re)establish.
struct DeferredSend {
    network: Network,
    subscription: Option<SubscriptionId>,
    payload: Bytes,
}

pub struct Subscriber<H: TransportHost, S: KvStore> {
    host: H,
    repo: SubscriptionRepository<S>,
    callbacks: HashMap<SubscriptionId, RegisteredCallbacks>,
    next_request_id: u64,
    deferred: Vec<DeferredSend>,
}

impl<H: TransportHost, S: KvStore> Subscriber<H, S> {
    pub fn new(host: H, store: Arc<S>) -> Self {
        Self {
            host,
            repo: SubscriptionRepository::new(store),
            callbacks: HashMap::new(),
            next_request_id: 1,
            deferred: Vec::new(),
        }
    }

    fn allocate_request_id(&mut self) -> RequestId {
        let id = RequestId(self.next_request_id);
        self.next_request_id += 1;
        id
    }

    /// Create a subscription: persist it as pending, register its callbacks,
    /// then send the subscribe call if the network is connected (deferring it
    /// otherwise). Returns the new id plus the caller's recovery callback,
    /// which the connection layer registers for reconnect fan-out.
    pub async fn subscribe(
        &mut self,
        request: crate::core::SubscribeRequest,
        callbacks: SubscriptionCallbacks,
        connection: Option<ConnectionId>,
    ) -> EngineResult<(SubscriptionId, Option<RecoveryCallback>)> {
        let id = SubscriptionId::generate();
        let request_id = self.allocate_request_id();

        let record = Subscription {
            id: id.clone(),
            network: request.network.clone(),
            method: request.method.clone(),
            unsubscribe_method: request.unsubscribe_method,
            params: request.params.clone(),
            created_at: now_epoch_ms(),
            state: SubscriptionState::Pending { request_id },
        };
        self.repo.save(&record).await?;

        let SubscriptionCallbacks {
            on_notification,
            on_subscription_failed,
            on_connection_recovery,
        } = callbacks;
        self.callbacks.insert(
            id.clone(),
            RegisteredCallbacks {
                on_notification,
                on_subscription_failed,
            },
        );

        let payload = encode_request(request_id, &request.method, &request.params)?;
        self.send_or_defer(request.network, Some(id.clone()), payload, connection)
            .await;

        Ok((id, on_connection_recovery))
    }

    /// Remove a subscription. Unknown or already-removed ids are a no-op; a
    /// confirmed subscription additionally gets an unsubscribe call on the
    /// wire (best effort, skipped when the network is disconnected).
    pub async fn unsubscribe(
        &mut self,
        id: &SubscriptionId,
        connection: Option<ConnectionId>,
    ) -> EngineResult<()> {
        self.callbacks.remove(id);
        self.deferred
            .retain(|entry| entry.subscription.as_ref() != Some(id));

        let Some(record) = self.repo.find_by_id(id).await? else {
            debug!(subscription = %id, "unsubscribe for unknown subscription ignored");
            return Ok(());
        };

        if let Some(rpc_id) = record.rpc_subscription_id() {
            let request_id = self.allocate_request_id();
            let payload =
                encode_request(request_id, &record.unsubscribe_method, &[rpc_id.0])?;
            match connection {
                Some(connection) => {
                    if let Err(err) = self.host.send(connection, payload).await {
                        warn!(subscription = %id, error = %err, "unsubscribe send failed");
                    }
                }
                None => {
                    debug!(subscription = %id, "network disconnected, skipping unsubscribe call");
                }
            }
        }

        self.repo.delete(id).await
    }

    pub async fn find(&self, id: &SubscriptionId) -> EngineResult<Option<Subscription>> {
        self.repo.find_by_id(id).await
    }

    /// Dispatch one inbound payload. Unmatched messages are dropped with a
    /// log line; only store failures and invalid JSON surface as errors.
    pub async fn handle_message(&mut self, payload: &TransportPayload) -> EngineResult<()> {
        let text = payload.as_utf8()?;
        match classify(text.as_bytes())? {
            InboundMessage::Notification {
                method,
                rpc_subscription_id,
                result,
            } => {
                let Some(record) = self
                    .repo
                    .find_by_rpc_subscription_id(rpc_subscription_id)
                    .await?
                else {
                    warn!(
                        method = %method,
                        rpc_subscription_id = %rpc_subscription_id,
                        "notification for unknown subscription dropped"
                    );
                    return Ok(());
                };
                let Some(registered) = self.callbacks.get_mut(&record.id) else {
                    warn!(subscription = %record.id, "notification for unregistered subscription dropped");
                    return Ok(());
                };
                if let Err(err) = (registered.on_notification)(result) {
                    warn!(subscription = %record.id, error = %err, "notification callback failed");
                }
            }
            InboundMessage::Confirmation {
                request_id,
                rpc_subscription_id,
            } => {
                self.handle_confirmation(request_id, rpc_subscription_id)
                    .await?;
            }
            InboundMessage::Failure { request_id, error } => {
                self.handle_failure(request_id, error).await?;
            }
            InboundMessage::Unrecognized => {
                debug!("unrecognized message dropped");
            }
        }
        Ok(())
    }

    async fn handle_confirmation(
        &mut self,
        request_id: RequestId,
        rpc_subscription_id: crate::core::RpcSubscriptionId,
    ) -> EngineResult<()> {
        let Some(mut record) = self.repo.find_by_request_id(request_id).await? else {
            // Unsubscribe acks and duplicate confirmations land here.
            debug!(request_id = %request_id, "confirmation matches no pending subscription");
            return Ok(());
        };

        record.state = SubscriptionState::Confirmed {
            rpc_subscription_id,
            confirmed_at: now_epoch_ms(),
        };
        self.repo.update(&record).await?;
        info!(
            subscription = %record.id,
            rpc_subscription_id = %rpc_subscription_id,
            "subscription confirmed"
        );
        Ok(())
    }

    async fn handle_failure(
        &mut self,
        request_id: Option<RequestId>,
        error: RpcError,
    ) -> EngineResult<()> {
        let Some(request_id) = request_id else {
            warn!(error = %error, "connection-level error reported by server");
            return Ok(());
        };
        let Some(record) = self.repo.find_by_request_id(request_id).await? else {
            warn!(request_id = %request_id, error = %error, "error reply matches no pending subscription");
            return Ok(());
        };

        warn!(subscription = %record.id, error = %error, "subscribe rejected by server");
        if let Some(mut registered) = self.callbacks.remove(&record.id) {
            if let Some(on_failed) = registered.on_subscription_failed.as_mut() {
                if let Err(err) = on_failed(&error) {
                    warn!(subscription = %record.id, error = %err, "failure callback failed");
                }
            }
        }
        self.repo.delete(&record.id).await
    }

    /// Send queued requests for a network that just (re)connected. Entries
    /// whose send fails go back on the queue for the next connect.
    pub async fn flush_deferred(&mut self, network: &Network, connection: ConnectionId) {
        let (to_send, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.deferred)
            .into_iter()
            .partition(|entry| entry.network == *network);
        self.deferred = rest;

        for entry in to_send {
            if let Err(err) = self.host.send(connection, entry.payload.clone()).await {
                warn!(
                    network = %network,
                    subscription = ?entry.subscription,
                    error = %err,
                    "deferred send failed, requeueing"
                );
                self.deferred.push(entry);
            }
        }
    }

    /// Drop persisted subscriptions that have no registered callbacks.
    ///
    /// Callback registrations do not survive a restart, so records found at
    /// startup belong to a previous process lifetime. Confirmed ones also get
    /// an unsubscribe queued so the server stops pushing once the network
    /// connects.
    pub async fn reap_orphans(&mut self) -> EngineResult<()> {
        for record in self.repo.get_all().await? {
            if self.callbacks.contains_key(&record.id) {
                continue;
            }
            info!(subscription = %record.id, pending = record.is_pending(), "reaping orphaned subscription");
            if let Some(rpc_id) = record.rpc_subscription_id() {
                let request_id = self.allocate_request_id();
                let payload =
                    encode_request(request_id, &record.unsubscribe_method, &[rpc_id.0])?;
                self.deferred.push(DeferredSend {
                    network: record.network.clone(),
                    subscription: None,
                    payload,
                });
            }
            self.repo.delete(&record.id).await?;
        }
        Ok(())
    }

    async fn send_or_defer(
        &mut self,
        network: Network,
        subscription: Option<SubscriptionId>,
        payload: Bytes,
        connection: Option<ConnectionId>,
    ) {
        match connection {
            Some(connection) => {
                if let Err(err) = self.host.send(connection, payload.clone()).await {
                    warn!(
                        network = %network,
                        subscription = ?subscription,
                        error = %err,
                        "send failed, deferring until reconnect"
                    );
                    self.deferred.push(DeferredSend {
                        network,
                        subscription,
                        payload,
                    });
                }
            }
            None => {
                debug!(
                    network = %network,
                    subscription = ?subscription,
                    "network disconnected, deferring send"
                );
                self.deferred.push(DeferredSend {
                    network,
                    subscription,
                    payload,
                });
            }
        }
    }
}
