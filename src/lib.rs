//! Kameo-based JSON-RPC subscription engine.
//!
//! Maintains long-lived, reconnect-resilient subscriptions against
//! JSON-RPC push endpoints: one logical connection per network, durable
//! subscription records, asynchronous confirmation/failure correlation, and
//! notification routing back into caller-supplied callbacks.

pub mod core;
pub mod engine;
pub mod store;
pub mod testing;
pub mod tls;
pub mod transport;

pub use engine::{
    CloseConnection, EndpointConfig, EngineArgs, GetConnectionId, GetSubscription, HostEvent,
    OpenConnection, RegisterRecovery, SetupAllConnections, Subscribe, SubscriptionEngine,
    Unsubscribe, spawn_event_pump,
};
