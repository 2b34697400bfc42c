//! Persistent key-value store boundary.
//!
//! The engine persists subscription records through this trait; the store
//! itself (extension storage, disk, …) lives outside the crate. Paths are
//! hierarchical dot-style strings (e.g. `subscriptions`).

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::core::{EngineError, EngineResult};

pub type StoreFuture<T> = Pin<Box<dyn Future<Output = EngineResult<T>> + Send + 'static>>;

/// Durable get/set/delete storage.
///
/// This trait is intentionally minimal so different stores can be swapped
/// while keeping repository logic unchanged. Absent keys are `None`, never an
/// error.
pub trait KvStore: Send + Sync + 'static {
    fn get_raw(&self, path: &str) -> StoreFuture<Option<Bytes>>;

    fn set_raw(&self, path: &str, value: Bytes) -> StoreFuture<()>;

    fn delete_raw(&self, path: &str) -> StoreFuture<()>;
}

/// JSON (de)serialization layered over the raw byte store.
pub trait KvStoreExt: KvStore {
    fn get_json<T>(&self, path: &str) -> StoreFuture<Option<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let fut = self.get_raw(path);
        Box::pin(async move {
            match fut.await? {
                Some(bytes) => sonic_rs::from_slice(bytes.as_ref())
                    .map(Some)
                    .map_err(|err| EngineError::store("decode", err)),
                None => Ok(None),
            }
        })
    }

    fn set_json<T>(&self, path: &str, value: &T) -> StoreFuture<()>
    where
        T: Serialize,
    {
        match sonic_rs::to_vec(value) {
            Ok(bytes) => self.set_raw(path, Bytes::from(bytes)),
            Err(err) => {
                let err = EngineError::store("encode", err);
                Box::pin(async move { Err(err) })
            }
        }
    }
}

impl<S: KvStore + ?Sized> KvStoreExt for S {}
