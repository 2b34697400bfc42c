//! Engine internals: connection lifecycle, durable records, and the actor
//! that serializes access to both.

pub mod actor;
pub mod connection_repo;
pub mod manager;
pub mod subscriber;
pub mod subscription_repo;

pub use actor::{
    CloseConnection, EngineArgs, GetConnectionId, GetSubscription, HostEvent, OpenConnection,
    RegisterRecovery, SetupAllConnections, Subscribe, SubscriptionEngine, Unsubscribe,
    spawn_event_pump,
};
pub use connection_repo::ConnectionRepository;
pub use manager::{ConnectionManager, EndpointConfig};
pub use subscriber::Subscriber;
pub use subscription_repo::SubscriptionRepository;
