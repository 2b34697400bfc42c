//! The engine actor.
//!
//! All mutable engine state (connection index, subscription records, callback
//! registry, deferred queue) lives inside one actor, so every operation and
//! every transport event is serialized through its mailbox and no locking is
//! needed anywhere in the protocol logic.

use std::sync::Arc;

use kameo::prelude::{Actor, ActorRef, Context, Message as KameoMessage};
use tracing::{error, warn};

use crate::core::{
    ConnectionId, EngineResult, Network, RecoveryCallback, RetryStrategy, SubscribeRequest,
    Subscription, SubscriptionCallbacks, SubscriptionId,
};
use crate::engine::manager::{ConnectionManager, EndpointConfig};
use crate::engine::subscriber::Subscriber;
use crate::store::KvStore;
use crate::transport::{TransportEvent, TransportHost};

pub struct EngineArgs<H: TransportHost, S: KvStore, R: RetryStrategy> {
    pub host: H,
    pub store: Arc<S>,
    pub config: EndpointConfig,
    pub retry: R,
}

pub struct SubscriptionEngine<H: TransportHost, S: KvStore, R: RetryStrategy> {
    manager: ConnectionManager<H, R>,
    subscriber: Subscriber<H, S>,
}

impl<H: TransportHost, S: KvStore, R: RetryStrategy> Actor for SubscriptionEngine<H, S, R> {
    type Args = EngineArgs<H, S, R>;
    type Error = crate::core::EngineError;

    fn name() -> &'static str {
        "SubscriptionEngine"
    }

    async fn on_start(args: Self::Args, _ctx: ActorRef<Self>) -> Result<Self, Self::Error> {
        let EngineArgs {
            host,
            store,
            config,
            retry,
        } = args;
        let mut engine = Self {
            manager: ConnectionManager::new(host.clone(), config, retry),
            subscriber: Subscriber::new(host, store),
        };
        engine.subscriber.reap_orphans().await?;
        Ok(engine)
    }

    fn on_panic(
        &mut self,
        _actor_ref: kameo::actor::WeakActorRef<Self>,
        err: kameo::prelude::PanicError,
    ) -> impl std::future::Future<
        Output = Result<std::ops::ControlFlow<kameo::prelude::ActorStopReason>, Self::Error>,
    > + Send {
        async move {
            error!(error = ?err, "SubscriptionEngine panicked");
            Ok(std::ops::ControlFlow::Continue(()))
        }
    }
}

/// Create a subscription and send (or defer) its subscribe call.
pub struct Subscribe {
    pub request: SubscribeRequest,
    pub callbacks: SubscriptionCallbacks,
}

impl<H: TransportHost, S: KvStore, R: RetryStrategy> KameoMessage<Subscribe>
    for SubscriptionEngine<H, S, R>
{
    type Reply = EngineResult<SubscriptionId>;

    async fn handle(&mut self, msg: Subscribe, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let connection = self.manager.connection_id_by_network(&msg.request.network);
        let (id, recovery) = self
            .subscriber
            .subscribe(msg.request, msg.callbacks, connection)
            .await?;
        if let Some(recovery) = recovery {
            self.manager.on_connection_recovery(recovery);
        }
        Ok(id)
    }
}

/// Remove a subscription (idempotent).
pub struct Unsubscribe(pub SubscriptionId);

impl<H: TransportHost, S: KvStore, R: RetryStrategy> KameoMessage<Unsubscribe>
    for SubscriptionEngine<H, S, R>
{
    type Reply = EngineResult<()>;

    async fn handle(
        &mut self,
        msg: Unsubscribe,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let record = self.subscriber.find(&msg.0).await?;
        let connection = record
            .as_ref()
            .and_then(|sub| self.manager.connection_id_by_network(&sub.network));
        self.subscriber.unsubscribe(&msg.0, connection).await
    }
}

/// Open (or reuse) the connection for one network.
pub struct OpenConnection(pub Network);

impl<H: TransportHost, S: KvStore, R: RetryStrategy> KameoMessage<OpenConnection>
    for SubscriptionEngine<H, S, R>
{
    type Reply = EngineResult<ConnectionId>;

    async fn handle(
        &mut self,
        msg: OpenConnection,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.manager.open_connection(&msg.0).await
    }
}

/// Close the connection for one network, if open.
pub struct CloseConnection(pub Network);

impl<H: TransportHost, S: KvStore, R: RetryStrategy> KameoMessage<CloseConnection>
    for SubscriptionEngine<H, S, R>
{
    type Reply = EngineResult<()>;

    async fn handle(
        &mut self,
        msg: CloseConnection,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.manager.close_connection(&msg.0).await
    }
}

/// Bring every active network to the connected state.
pub struct SetupAllConnections;

impl<H: TransportHost, S: KvStore, R: RetryStrategy> KameoMessage<SetupAllConnections>
    for SubscriptionEngine<H, S, R>
{
    type Reply = EngineResult<()>;

    async fn handle(
        &mut self,
        _msg: SetupAllConnections,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.manager.setup_all_connections().await
    }
}

/// Register a standalone recovery callback, independent of any subscription.
pub struct RegisterRecovery(pub RecoveryCallback);

impl<H: TransportHost, S: KvStore, R: RetryStrategy> KameoMessage<RegisterRecovery>
    for SubscriptionEngine<H, S, R>
{
    type Reply = ();

    async fn handle(
        &mut self,
        msg: RegisterRecovery,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.manager.on_connection_recovery(msg.0);
    }
}

/// Look up the live connection id for a network, if connected.
pub struct GetConnectionId(pub Network);

impl<H: TransportHost, S: KvStore, R: RetryStrategy> KameoMessage<GetConnectionId>
    for SubscriptionEngine<H, S, R>
{
    type Reply = Option<ConnectionId>;

    async fn handle(
        &mut self,
        msg: GetConnectionId,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.manager.connection_id_by_network(&msg.0)
    }
}

/// Fetch the durable record for a subscription id.
pub struct GetSubscription(pub SubscriptionId);

impl<H: TransportHost, S: KvStore, R: RetryStrategy> KameoMessage<GetSubscription>
    for SubscriptionEngine<H, S, R>
{
    type Reply = EngineResult<Option<Subscription>>;

    async fn handle(
        &mut self,
        msg: GetSubscription,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.subscriber.find(&msg.0).await
    }
}

/// One event pushed from the transport host.
pub struct HostEvent(pub TransportEvent);

impl<H: TransportHost, S: KvStore, R: RetryStrategy> KameoMessage<HostEvent>
    for SubscriptionEngine<H, S, R>
{
    type Reply = ();

    async fn handle(&mut self, msg: HostEvent, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        match msg.0 {
            TransportEvent::Connected(connection) => {
                self.manager.handle_connected(connection).await;
                if let Some(network) = self.manager.network_by_connection(connection).cloned() {
                    self.subscriber.flush_deferred(&network, connection).await;
                }
            }
            TransportEvent::Disconnected(connection) => {
                self.manager.handle_disconnected(connection).await;
            }
            TransportEvent::Message {
                connection,
                payload,
            } => {
                if let Err(err) = self.subscriber.handle_message(&payload).await {
                    warn!(connection = %connection, error = %err, "inbound message handling failed");
                }
            }
        }
    }
}

/// Forward transport events into the engine's mailbox until the host drops
/// the sender or the actor stops.
pub fn spawn_event_pump<H, S, R>(
    mut events: tokio::sync::mpsc::UnboundedReceiver<TransportEvent>,
    engine: ActorRef<SubscriptionEngine<H, S, R>>,
) -> tokio::task::JoinHandle<()>
where
    H: TransportHost,
    S: KvStore,
    R: RetryStrategy,
{
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if engine.tell(HostEvent(event)).send().await.is_err() {
                break;
            }
        }
    })
}
