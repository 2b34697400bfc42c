//! Durable subscription records.
//!
//! The whole collection is persisted as one JSON object under a single store
//! path; records are few enough that read-modify-write of the full map is
//! simpler and safer than per-record keys.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::core::{EngineResult, RequestId, RpcSubscriptionId, Subscription, SubscriptionId};
use crate::store::{KvStore, KvStoreExt};

const ROOT_PATH: &str = "subscriptions";

pub struct SubscriptionRepository<S: KvStore> {
    store: Arc<S>,
}

impl<S: KvStore> SubscriptionRepository<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn get_all(&self) -> EngineResult<Vec<Subscription>> {
        let map = self.load().await?;
        Ok(map.into_values().collect())
    }

    pub async fn find_by_id(&self, id: &SubscriptionId) -> EngineResult<Option<Subscription>> {
        let map = self.load().await?;
        Ok(map.get(id.as_str()).cloned())
    }

    /// Resolve a pending subscription by the request id of its in-flight
    /// subscribe call. Confirmed records no longer carry a request id, so a
    /// late or duplicate reply simply misses.
    pub async fn find_by_request_id(
        &self,
        request_id: RequestId,
    ) -> EngineResult<Option<Subscription>> {
        let map = self.load().await?;
        Ok(map
            .into_values()
            .find(|sub| sub.request_id() == Some(request_id)))
    }

    /// Resolve a confirmed subscription by its server-assigned id.
    pub async fn find_by_rpc_subscription_id(
        &self,
        rpc_subscription_id: RpcSubscriptionId,
    ) -> EngineResult<Option<Subscription>> {
        let map = self.load().await?;
        Ok(map
            .into_values()
            .find(|sub| sub.rpc_subscription_id() == Some(rpc_subscription_id)))
    }

    pub async fn save(&self, subscription: &Subscription) -> EngineResult<()> {
        let mut map = self.load().await?;
        map.insert(subscription.id.0.clone(), subscription.clone());
        self.persist(&map).await
    }

    /// Overwrite an existing record after a state transition.
    pub async fn update(&self, subscription: &Subscription) -> EngineResult<()> {
        self.save(subscription).await
    }

    /// Delete by id. Deleting an absent record is a no-op; removing the last
    /// record drops the store key entirely.
    pub async fn delete(&self, id: &SubscriptionId) -> EngineResult<()> {
        let mut map = self.load().await?;
        if map.remove(id.as_str()).is_some() {
            if map.is_empty() {
                self.store.delete_raw(ROOT_PATH).await?;
            } else {
                self.persist(&map).await?;
            }
        }
        Ok(())
    }

    async fn load(&self) -> EngineResult<BTreeMap<String, Subscription>> {
        Ok(self
            .store
            .get_json::<BTreeMap<String, Subscription>>(ROOT_PATH)
            .await?
            .unwrap_or_default())
    }

    async fn persist(&self, map: &BTreeMap<String, Subscription>) -> EngineResult<()> {
        self.store.set_json(ROOT_PATH, map).await
    }
}
