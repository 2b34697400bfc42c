//! Per-network connection lifecycle: open with bounded retry, dedup against
//! already-open connections, recovery fan-out, and reconnect after an
//! unsolicited drop.

use std::collections::{HashMap, HashSet};

use futures_util::future::join_all;
use tracing::{debug, info, warn};

use crate::core::{ConnectionId, EngineError, EngineResult, Network, RecoveryCallback, RetryStrategy};
use crate::engine::connection_repo::ConnectionRepository;
use crate::transport::TransportHost;

/// Static endpoint table plus the set of networks the engine should keep
/// connected.
#[derive(Clone, Debug, Default)]
pub struct EndpointConfig {
    endpoints: HashMap<Network, String>,
    active: HashSet<Network>,
}

impl EndpointConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint and mark its network active.
    pub fn with_endpoint(mut self, network: impl Into<Network>, url: impl Into<String>) -> Self {
        let network = network.into();
        self.endpoints.insert(network.clone(), url.into());
        self.active.insert(network);
        self
    }

    /// Register an endpoint without activating it. Inactive networks are
    /// skipped by [`ConnectionManager::setup_all_connections`] but can still
    /// be opened explicitly.
    pub fn with_inactive_endpoint(
        mut self,
        network: impl Into<Network>,
        url: impl Into<String>,
    ) -> Self {
        self.endpoints.insert(network.into(), url.into());
        self
    }

    pub fn url_for(&self, network: &Network) -> Option<&str> {
        self.endpoints.get(network).map(String::as_str)
    }

    pub fn active_networks(&self) -> impl Iterator<Item = &Network> {
        self.active.iter()
    }

    pub fn is_active(&self, network: &Network) -> bool {
        self.active.contains(network)
    }
}

pub struct ConnectionManager<H: TransportHost, R: RetryStrategy> {
    config: EndpointConfig,
    retry: R,
    repo: ConnectionRepository<H>,
    network_by_connection: HashMap<ConnectionId, Network>,
    recovery_callbacks: Vec<RecoveryCallback>,
}

impl<H: TransportHost, R: RetryStrategy> ConnectionManager<H, R> {
    pub fn new(host: H, config: EndpointConfig, retry: R) -> Self {
        Self {
            config,
            retry,
            repo: ConnectionRepository::new(host),
            network_by_connection: HashMap::new(),
            recovery_callbacks: Vec::new(),
        }
    }

    pub fn connection_id_by_network(&self, network: &Network) -> Option<ConnectionId> {
        self.config
            .url_for(network)
            .and_then(|url| self.repo.id_by_url(url))
    }

    pub fn network_by_connection(&self, connection: ConnectionId) -> Option<&Network> {
        self.network_by_connection.get(&connection)
    }

    /// Register a callback invoked on every (re)connect.
    pub fn on_connection_recovery(&mut self, callback: RecoveryCallback) {
        self.recovery_callbacks.push(callback);
    }

    /// Open the connection for `network`, reusing an existing one when the
    /// endpoint is already connected. Fresh opens retry up to the strategy's
    /// attempt bound before giving up.
    pub async fn open_connection(&mut self, network: &Network) -> EngineResult<ConnectionId> {
        let url = self
            .config
            .url_for(network)
            .ok_or_else(|| EngineError::MissingEndpoint {
                network: network.clone(),
            })?
            .to_string();

        if let Some(existing) = self.repo.id_by_url(&url) {
            debug!(network = %network, connection = %existing, "reusing open connection");
            return Ok(existing);
        }

        let max_attempts = self.retry.max_attempts().max(1);
        let mut last_error = None;
        for attempt in 1..=max_attempts {
            match self.repo.save(&url, vec![]).await {
                Ok(id) => {
                    info!(network = %network, connection = %id, attempt, "connection opened");
                    self.network_by_connection.insert(id, network.clone());
                    return Ok(id);
                }
                Err(err) => {
                    warn!(
                        network = %network,
                        url = %url,
                        attempt,
                        max_attempts,
                        error = %err,
                        "connection attempt failed"
                    );
                    last_error = Some(err);
                    if attempt < max_attempts {
                        tokio::time::sleep(self.retry.delay(attempt)).await;
                    }
                }
            }
        }

        Err(EngineError::ConnectExhausted {
            url,
            attempts: max_attempts,
            error: last_error
                .map(|err| err.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        })
    }

    /// Close the network's connection if one is open. Closing a network with
    /// no open connection is a no-op.
    pub async fn close_connection(&mut self, network: &Network) -> EngineResult<()> {
        let Some(id) = self.connection_id_by_network(network) else {
            debug!(network = %network, "close requested but no connection open");
            return Ok(());
        };
        self.network_by_connection.remove(&id);
        self.repo.delete(id).await
    }

    /// Reconcile connections against the configured active set: open every
    /// active network lacking one and close connections for networks that are
    /// no longer active. A failing endpoint is logged and skipped so one bad
    /// network cannot block the others.
    pub async fn setup_all_connections(&mut self) -> EngineResult<()> {
        let stale: Vec<Network> = self
            .network_by_connection
            .values()
            .filter(|network| !self.config.is_active(network))
            .cloned()
            .collect();
        for network in stale {
            info!(network = %network, "closing connection for inactive network");
            if let Err(err) = self.close_connection(&network).await {
                warn!(network = %network, error = %err, "failed to close stale connection");
            }
        }

        let networks: Vec<Network> = self.config.active_networks().cloned().collect();
        for network in networks {
            if let Err(err) = self.open_connection(&network).await {
                warn!(network = %network, error = %err, "failed to set up connection");
            }
        }
        Ok(())
    }

    /// Fan the connected event out to every recovery callback. Callback
    /// failures are logged individually and never affect each other.
    pub async fn handle_connected(&mut self, connection: ConnectionId) {
        let network = self.network_by_connection.get(&connection).cloned();
        debug!(connection = %connection, network = ?network, "connection established");

        let futures: Vec<_> = self
            .recovery_callbacks
            .iter_mut()
            .map(|callback| callback())
            .collect();
        for (index, result) in join_all(futures).await.into_iter().enumerate() {
            if let Err(err) = result {
                warn!(connection = %connection, index, error = %err, "recovery callback failed");
            }
        }
    }

    /// React to an unsolicited drop: forget the dead connection and reopen.
    /// A reconnect failure is logged, not surfaced; the next disconnect or an
    /// explicit open will try again.
    pub async fn handle_disconnected(&mut self, connection: ConnectionId) {
        self.repo.forget(connection);
        let Some(network) = self.network_by_connection.remove(&connection) else {
            debug!(connection = %connection, "disconnect for untracked connection ignored");
            return;
        };

        info!(connection = %connection, network = %network, "connection lost, reconnecting");
        if let Err(err) = self.open_connection(&network).await {
            warn!(network = %network, error = %err, "reconnect failed");
        }
    }
}
