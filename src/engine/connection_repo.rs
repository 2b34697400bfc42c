//! Url ↔ connection-id bookkeeping over the transport host.
//!
//! The host owns the authoritative list of open connections; this repository
//! keeps a process-local index so the engine can resolve a network's endpoint
//! url to a live connection id without round-tripping through the host.

use std::collections::HashMap;

use tracing::warn;

use crate::core::{ConnectionId, EngineResult};
use crate::transport::{ConnectionRecord, TransportHost};

pub struct ConnectionRepository<H: TransportHost> {
    host: H,
    id_by_url: HashMap<String, ConnectionId>,
    url_by_id: HashMap<ConnectionId, String>,
}

impl<H: TransportHost> ConnectionRepository<H> {
    pub fn new(host: H) -> Self {
        Self {
            host,
            id_by_url: HashMap::new(),
            url_by_id: HashMap::new(),
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    /// Every connection currently open at the host.
    pub async fn get_all(&self) -> EngineResult<Vec<ConnectionRecord>> {
        self.host.list_all().await
    }

    pub async fn get_by_id(&self, id: ConnectionId) -> EngineResult<Option<ConnectionRecord>> {
        let all = self.host.list_all().await?;
        Ok(all.into_iter().find(|record| record.id == id))
    }

    pub async fn find_by_url(&self, url: &str) -> EngineResult<Option<ConnectionRecord>> {
        let all = self.host.list_all().await?;
        Ok(all.into_iter().find(|record| record.url == url))
    }

    /// Open a connection at the host and index it. Host errors propagate
    /// unmodified; nothing is indexed on failure.
    pub async fn save(&mut self, url: &str, protocols: Vec<String>) -> EngineResult<ConnectionId> {
        let id = self.host.open(url.to_string(), protocols).await?;
        if let Some(stale) = self.id_by_url.insert(url.to_string(), id) {
            warn!(url = %url, stale = %stale, "replacing stale connection index entry");
            let _ = self.url_by_id.remove(&stale);
        }
        self.url_by_id.insert(id, url.to_string());
        Ok(id)
    }

    /// Close at the host and drop the index entry.
    pub async fn delete(&mut self, id: ConnectionId) -> EngineResult<()> {
        self.host.close(id).await?;
        self.forget(id);
        Ok(())
    }

    /// Drop the index entry only. Used when the host reports the connection
    /// already gone (unsolicited disconnect).
    pub fn forget(&mut self, id: ConnectionId) {
        if let Some(url) = self.url_by_id.remove(&id) {
            let _ = self.id_by_url.remove(&url);
        }
    }

    pub fn id_by_url(&self, url: &str) -> Option<ConnectionId> {
        self.id_by_url.get(url).copied()
    }

    pub fn url_by_id(&self, id: ConnectionId) -> Option<&str> {
        self.url_by_id.get(&id).map(String::as_str)
    }
}
