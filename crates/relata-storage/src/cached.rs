//! Caching decorator for a [`DataStore`].
//!
//! Authorization models are immutable once written, so
//! `read_authorization_model` results are memoized in a bounded `moka`
//! cache with a very long TTL. Concurrent `find_latest_authorization_model_id`
//! calls for the same store collapse into one backend lookup via
//! singleflight. Everything else delegates to the wrapped store.

use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;

use crate::error::{StorageError, StorageResult};
use crate::singleflight::{Singleflight, SingleflightGuard, SingleflightResult, SingleflightSlot};
use crate::traits::{
    DataStore, PaginatedResult, PaginationOptions, Store, StoredAuthorizationModel, StoredTuple,
    TupleChange, TupleFilter,
};

/// Models never change, so a week-long TTL is purely a memory bound.
const MODEL_CACHE_TTL: Duration = Duration::from_secs(168 * 60 * 60);

/// Default maximum number of cached models.
const MODEL_CACHE_CAPACITY: u64 = 10_000;

/// Caching wrapper over a [`DataStore`].
pub struct CachedDataStore<S> {
    inner: S,
    model_cache: Cache<String, StoredAuthorizationModel>,
    latest_lookup: Singleflight<String, String>,
}

impl<S: DataStore> CachedDataStore<S> {
    /// Wraps a store with the default cache capacity.
    pub fn new(inner: S) -> Self {
        Self::with_capacity(inner, MODEL_CACHE_CAPACITY)
    }

    /// Wraps a store, caching up to `max_models` authorization models.
    pub fn with_capacity(inner: S, max_models: u64) -> Self {
        Self {
            inner,
            model_cache: Cache::builder()
                .max_capacity(max_models)
                .time_to_live(MODEL_CACHE_TTL)
                .build(),
            latest_lookup: Singleflight::new(),
        }
    }

    /// Returns the wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn model_cache_key(store_id: &str, model_id: &str) -> String {
        format!("{store_id}:{model_id}")
    }
}

#[async_trait]
impl<S: DataStore> DataStore for CachedDataStore<S> {
    async fn create_store(&self, id: &str, name: &str) -> StorageResult<Store> {
        self.inner.create_store(id, name).await
    }

    async fn get_store(&self, id: &str) -> StorageResult<Store> {
        self.inner.get_store(id).await
    }

    async fn delete_store(&self, id: &str) -> StorageResult<()> {
        self.inner.delete_store(id).await
    }

    async fn list_stores(
        &self,
        pagination: &PaginationOptions,
    ) -> StorageResult<PaginatedResult<Store>> {
        self.inner.list_stores(pagination).await
    }

    async fn write_authorization_model(
        &self,
        store_id: &str,
        model: StoredAuthorizationModel,
    ) -> StorageResult<()> {
        self.inner.write_authorization_model(store_id, model).await
    }

    async fn read_authorization_model(
        &self,
        store_id: &str,
        model_id: &str,
    ) -> StorageResult<StoredAuthorizationModel> {
        let key = Self::model_cache_key(store_id, model_id);
        if let Some(cached) = self.model_cache.get(&key).await {
            return Ok(cached);
        }

        let model = self.inner.read_authorization_model(store_id, model_id).await?;
        self.model_cache.insert(key, model.clone()).await;
        Ok(model)
    }

    async fn read_authorization_models(
        &self,
        store_id: &str,
        pagination: &PaginationOptions,
    ) -> StorageResult<PaginatedResult<StoredAuthorizationModel>> {
        self.inner.read_authorization_models(store_id, pagination).await
    }

    async fn find_latest_authorization_model_id(&self, store_id: &str) -> StorageResult<String> {
        match self.latest_lookup.acquire(store_id.to_string()) {
            SingleflightSlot::Leader(tx) => {
                let guard = SingleflightGuard::new(&self.latest_lookup, store_id.to_string());
                let result = self.inner.find_latest_authorization_model_id(store_id).await;
                guard.complete();

                let broadcast = match &result {
                    Ok(id) => SingleflightResult {
                        value: Some(id.clone()),
                        error: None,
                    },
                    Err(e) => SingleflightResult {
                        value: None,
                        error: Some(e.to_string()),
                    },
                };
                // No followers is fine.
                let _ = tx.send(broadcast);
                result
            }
            SingleflightSlot::Follower(mut rx) => match rx.recv().await {
                Ok(SingleflightResult {
                    value: Some(id), ..
                }) => Ok(id),
                Ok(SingleflightResult { error, .. }) => Err(StorageError::InternalError {
                    message: error.unwrap_or_else(|| "latest model lookup failed".to_string()),
                }),
                // Leader dropped before sending; fall back to our own lookup.
                Err(_) => self.inner.find_latest_authorization_model_id(store_id).await,
            },
        }
    }

    async fn read_user_tuple(
        &self,
        store_id: &str,
        tuple: &StoredTuple,
    ) -> StorageResult<StoredTuple> {
        self.inner.read_user_tuple(store_id, tuple).await
    }

    async fn read(
        &self,
        store_id: &str,
        filter: &TupleFilter,
        pagination: &PaginationOptions,
    ) -> StorageResult<PaginatedResult<StoredTuple>> {
        self.inner.read(store_id, filter, pagination).await
    }

    async fn read_userset_tuples(
        &self,
        store_id: &str,
        object_type: &str,
        object_id: &str,
        relation: &str,
    ) -> StorageResult<Vec<StoredTuple>> {
        self.inner
            .read_userset_tuples(store_id, object_type, object_id, relation)
            .await
    }

    async fn read_starting_with_user(
        &self,
        store_id: &str,
        object_type: &str,
        relation: &str,
        users: &[String],
    ) -> StorageResult<Vec<StoredTuple>> {
        self.inner
            .read_starting_with_user(store_id, object_type, relation, users)
            .await
    }

    async fn write(
        &self,
        store_id: &str,
        deletes: Vec<StoredTuple>,
        writes: Vec<StoredTuple>,
    ) -> StorageResult<()> {
        self.inner.write(store_id, deletes, writes).await
    }

    async fn read_changes(
        &self,
        store_id: &str,
        object_type: Option<&str>,
        horizon_offset: Duration,
        pagination: &PaginationOptions,
    ) -> StorageResult<PaginatedResult<TupleChange>> {
        self.inner
            .read_changes(store_id, object_type, horizon_offset, pagination)
            .await
    }
}
