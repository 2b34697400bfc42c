use std::fmt;
use std::future::Future;
use std::pin::Pin;

use rand::{Rng, SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use sonic_rs::Value;
use thiserror::Error;

/// Convenience result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Canonical error surface shared across the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no endpoint configured for network {network}")]
    MissingEndpoint { network: Network },

    #[error("connection to {url} failed after {attempts} attempts: {error}")]
    ConnectExhausted {
        url: String,
        attempts: u32,
        error: String,
    },

    #[error("transport error ({context}): {error}")]
    Transport {
        context: &'static str,
        error: String,
    },

    #[error("store error ({context}): {error}")]
    Store {
        context: &'static str,
        error: String,
    },

    #[error("parse failed: {0}")]
    ParseFailed(String),
}

impl EngineError {
    #[inline]
    pub fn transport(context: &'static str, err: impl ToString) -> Self {
        Self::Transport {
            context,
            error: err.to_string(),
        }
    }

    #[inline]
    pub fn store(context: &'static str, err: impl ToString) -> Self {
        Self::Store {
            context,
            error: err.to_string(),
        }
    }
}

/// Logical identifier for one endpoint the engine can connect to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Network(pub String);

impl Network {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Network {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

/// Host-assigned identifier for one open transport connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlation key for one outgoing JSON-RPC call and its single expected
/// reply (confirmation or failure).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server-assigned key routing all notifications for a confirmed subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RpcSubscriptionId(pub u64);

impl fmt::Display for RpcSubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client-generated subscription identifier, stable across state transitions.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub String);

impl SubscriptionId {
    /// Allocate a random 128-bit identifier.
    pub fn generate() -> Self {
        let mut rng = SmallRng::from_entropy();
        let id: u128 = rng.gen();
        Self(format!("{id:032x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Server-reported JSON-RPC error object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code={} message={}", self.code, self.message)
    }
}

/// Durable subscription record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub network: Network,
    pub method: String,
    pub unsubscribe_method: String,
    pub params: Value,
    pub created_at: u64,
    #[serde(flatten)]
    pub state: SubscriptionState,
}

/// Lifecycle state of a subscription.
///
/// `Pending → Confirmed` happens at most once; either state may transition to
/// deletion (failure, explicit unsubscribe, or orphan reaping at startup).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SubscriptionState {
    Pending {
        request_id: RequestId,
    },
    Confirmed {
        rpc_subscription_id: RpcSubscriptionId,
        confirmed_at: u64,
    },
}

impl Subscription {
    #[inline]
    pub fn is_pending(&self) -> bool {
        matches!(self.state, SubscriptionState::Pending { .. })
    }

    #[inline]
    pub fn request_id(&self) -> Option<RequestId> {
        match self.state {
            SubscriptionState::Pending { request_id } => Some(request_id),
            SubscriptionState::Confirmed { .. } => None,
        }
    }

    #[inline]
    pub fn rpc_subscription_id(&self) -> Option<RpcSubscriptionId> {
        match self.state {
            SubscriptionState::Pending { .. } => None,
            SubscriptionState::Confirmed {
                rpc_subscription_id,
                ..
            } => Some(rpc_subscription_id),
        }
    }
}

/// Domain request handed to the engine by a business service.
#[derive(Clone, Debug)]
pub struct SubscribeRequest {
    pub network: Network,
    pub method: String,
    pub unsubscribe_method: String,
    pub params: Value,
}

/// Error type produced by caller-supplied callbacks.
///
/// A callback returning `Err` is the Rust rendition of "the callback threw":
/// the engine catches it, logs it, and never lets it affect other
/// subscriptions or the protocol state machine.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

pub type NotificationCallback = Box<dyn FnMut(Value) -> Result<(), CallbackError> + Send + Sync>;

pub type FailureCallback = Box<dyn FnMut(&RpcError) -> Result<(), CallbackError> + Send + Sync>;

pub type RecoveryFuture = Pin<Box<dyn Future<Output = Result<(), CallbackError>> + Send>>;

/// Invoked every time a connection (re)establishes, so callers can resync
/// state possibly missed while disconnected.
pub type RecoveryCallback = Box<dyn FnMut() -> RecoveryFuture + Send>;

/// Caller-supplied callback set for one subscription.
///
/// Registrations are process-local: they do not survive a restart, and any
/// persisted subscription found at startup without one is reaped as an orphan.
pub struct SubscriptionCallbacks {
    pub on_notification: NotificationCallback,
    pub on_subscription_failed: Option<FailureCallback>,
    pub on_connection_recovery: Option<RecoveryCallback>,
}

impl SubscriptionCallbacks {
    pub fn notify_only(on_notification: NotificationCallback) -> Self {
        Self {
            on_notification,
            on_subscription_failed: None,
            on_connection_recovery: None,
        }
    }
}

impl fmt::Debug for SubscriptionCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionCallbacks")
            .field("on_subscription_failed", &self.on_subscription_failed.is_some())
            .field("on_connection_recovery", &self.on_connection_recovery.is_some())
            .finish()
    }
}

/// Best-effort current time as Unix epoch milliseconds.
#[inline]
pub fn now_epoch_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(u64::MAX as u128) as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_distinct_lowercase_hex() {
        let a = SubscriptionId::generate();
        let b = SubscriptionId::generate();
        assert_ne!(a, b);
        for id in [&a, &b] {
            assert_eq!(id.as_str().len(), 32);
            assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        }
    }

    // Notification and failure callbacks are dispatched from handlers that
    // borrow the registry across await points, which requires Sync.
    #[test]
    fn registered_callback_types_are_shareable() {
        fn assert_sync<T: Sync>() {}
        assert_sync::<NotificationCallback>();
        assert_sync::<FailureCallback>();
    }
}
