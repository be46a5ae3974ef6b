//! Adapters that bridge the storage layer to the domain layer.
//!
//! The domain crate defines narrow reader traits (`TupleReader`,
//! `ModelReader`); the storage crate implements `DataStore` with concrete
//! backends. These adapters implement the former over the latter so the
//! service can hand any backend to the resolver.

use std::sync::Arc;

use async_trait::async_trait;
use moka::future::Cache;

use relata_domain::error::{DomainError, DomainResult};
use relata_domain::model::{AuthorizationModel, TypeSystem};
use relata_domain::resolver::{ModelReader, StoredTupleRef, TupleReader};
use relata_storage::{
    DataStore, PaginationOptions, StorageError, StoredTuple, TupleFilter,
};

/// Compiled type systems are immutable per `(store, model_id)`; the cache
/// bound only caps memory.
const TYPE_SYSTEM_CACHE_CAPACITY: u64 = 1_000;

/// Maps a storage error into the domain taxonomy.
fn storage_error(e: StorageError) -> DomainError {
    match e {
        StorageError::StoreNotFound { store_id } => DomainError::StoreNotFound { store_id },
        StorageError::ModelNotFound { model_id } => {
            DomainError::AuthorizationModelNotFound { model_id }
        }
        other => DomainError::Internal {
            message: other.to_string(),
        },
    }
}

/// Adapter that implements `TupleReader` using a `DataStore`.
pub struct DataStoreTupleReader<S> {
    storage: Arc<S>,
}

impl<S: DataStore> DataStoreTupleReader<S> {
    /// Creates a new adapter wrapping the given storage.
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }
}

fn to_ref(tuple: StoredTuple) -> StoredTupleRef {
    StoredTupleRef::new(tuple.user_type, tuple.user_id, tuple.user_relation)
}

#[async_trait]
impl<S: DataStore> TupleReader for DataStoreTupleReader<S> {
    async fn read_user_tuple(
        &self,
        store_id: &str,
        object_type: &str,
        object_id: &str,
        relation: &str,
        user: &str,
    ) -> DomainResult<bool> {
        let tuple = StoredTuple::parse(
            &format!("{object_type}:{object_id}"),
            relation,
            user,
        )
        .map_err(storage_error)?;

        match self.storage.read_user_tuple(store_id, &tuple).await {
            Ok(_) => Ok(true),
            Err(StorageError::TupleNotFound { .. }) => Ok(false),
            Err(e) => Err(storage_error(e)),
        }
    }

    async fn read_relation_tuples(
        &self,
        store_id: &str,
        object_type: &str,
        object_id: &str,
        relation: &str,
    ) -> DomainResult<Vec<StoredTupleRef>> {
        let filter = TupleFilter {
            object_type: Some(object_type.to_string()),
            object_id: Some(object_id.to_string()),
            relation: Some(relation.to_string()),
            user: None,
        };

        let mut refs = Vec::new();
        let mut token = None;
        loop {
            let page = self
                .storage
                .read(
                    store_id,
                    &filter,
                    &PaginationOptions {
                        page_size: None,
                        continuation_token: token,
                    },
                )
                .await
                .map_err(storage_error)?;
            refs.extend(page.items.into_iter().map(to_ref));
            match page.continuation_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        Ok(refs)
    }

    async fn read_userset_tuples(
        &self,
        store_id: &str,
        object_type: &str,
        object_id: &str,
        relation: &str,
    ) -> DomainResult<Vec<StoredTupleRef>> {
        let tuples = self
            .storage
            .read_userset_tuples(store_id, object_type, object_id, relation)
            .await
            .map_err(storage_error)?;
        Ok(tuples.into_iter().map(to_ref).collect())
    }

    async fn read_starting_with_user(
        &self,
        store_id: &str,
        object_type: &str,
        relation: &str,
        users: &[String],
    ) -> DomainResult<Vec<String>> {
        let tuples = self
            .storage
            .read_starting_with_user(store_id, object_type, relation, users)
            .await
            .map_err(storage_error)?;

        let mut seen = std::collections::HashSet::new();
        Ok(tuples
            .into_iter()
            .filter(|t| seen.insert(t.object_id.clone()))
            .map(|t| t.object_id)
            .collect())
    }

    async fn read_objects_of_type(
        &self,
        store_id: &str,
        object_type: &str,
        max_count: usize,
    ) -> DomainResult<Vec<String>> {
        let filter = TupleFilter {
            object_type: Some(object_type.to_string()),
            ..Default::default()
        };

        let mut seen = std::collections::HashSet::new();
        let mut objects = Vec::new();
        let mut token = None;
        loop {
            let page = self
                .storage
                .read(
                    store_id,
                    &filter,
                    &PaginationOptions {
                        page_size: None,
                        continuation_token: token,
                    },
                )
                .await
                .map_err(storage_error)?;
            for tuple in page.items {
                if seen.insert(tuple.object_id.clone()) {
                    objects.push(tuple.object_id);
                    if objects.len() >= max_count {
                        return Ok(objects);
                    }
                }
            }
            match page.continuation_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        Ok(objects)
    }

    async fn store_exists(&self, store_id: &str) -> DomainResult<bool> {
        match self.storage.get_store(store_id).await {
            Ok(_) => Ok(true),
            Err(StorageError::StoreNotFound { .. }) => Ok(false),
            Err(e) => Err(storage_error(e)),
        }
    }
}

/// Adapter that implements `ModelReader` using a `DataStore`.
///
/// Stored model JSON is parsed and compiled into a [`TypeSystem`] once per
/// `(store, model_id)`; models are immutable, so entries never go stale.
/// Concurrent compilations of the same model collapse through the cache's
/// `try_get_with`.
pub struct DataStoreModelReader<S> {
    storage: Arc<S>,
    type_systems: Cache<String, Arc<TypeSystem>>,
}

impl<S: DataStore> DataStoreModelReader<S> {
    /// Creates a new adapter wrapping the given storage.
    pub fn new(storage: Arc<S>) -> Self {
        Self {
            storage,
            type_systems: Cache::builder()
                .max_capacity(TYPE_SYSTEM_CACHE_CAPACITY)
                .build(),
        }
    }

    async fn load_type_system(&self, store_id: &str, model_id: &str) -> DomainResult<Arc<TypeSystem>> {
        let stored = self
            .storage
            .read_authorization_model(store_id, model_id)
            .await
            .map_err(storage_error)?;

        let mut model: AuthorizationModel =
            serde_json::from_str(&stored.model_json).map_err(|e| DomainError::ModelParseError {
                message: format!("failed to parse stored model '{}': {}", stored.id, e),
            })?;
        model.id = stored.id;

        Ok(Arc::new(TypeSystem::new(model)))
    }
}

#[async_trait]
impl<S: DataStore> ModelReader for DataStoreModelReader<S> {
    async fn get_type_system(
        &self,
        store_id: &str,
        authorization_model_id: Option<&str>,
    ) -> DomainResult<Arc<TypeSystem>> {
        let model_id = match authorization_model_id {
            Some(id) => id.to_string(),
            None => self
                .storage
                .find_latest_authorization_model_id(store_id)
                .await
                .map_err(storage_error)?,
        };

        let key = format!("{store_id}:{model_id}");
        self.type_systems
            .try_get_with(key, self.load_type_system(store_id, &model_id))
            .await
            .map_err(|e: Arc<DomainError>| DomainError::Internal {
                message: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relata_storage::{MemoryDataStore, StoredAuthorizationModel};

    async fn storage_with_model() -> Arc<MemoryDataStore> {
        let storage = MemoryDataStore::new_shared();
        storage.create_store("store1", "Test Store").await.unwrap();

        let model = relata_domain::model::parse(
            r"
            type user
            type document
              relations
                define viewer: [user]
            ",
        )
        .unwrap();
        storage
            .write_authorization_model(
                "store1",
                StoredAuthorizationModel {
                    id: "01ARZ3NDEKTSV4RRFFQ69G5FAV".to_string(),
                    schema_version: model.schema_version.clone(),
                    created_at: chrono_now(),
                    model_json: serde_json::to_string(&model).unwrap(),
                },
            )
            .await
            .unwrap();
        storage
    }

    fn chrono_now() -> chrono::DateTime<chrono::Utc> {
        chrono::Utc::now()
    }

    #[tokio::test]
    async fn test_tuple_reader_point_lookup_and_store_exists() {
        let storage = storage_with_model().await;
        storage
            .write(
                "store1",
                vec![],
                vec![StoredTuple::parse("document:1", "viewer", "user:anne").unwrap()],
            )
            .await
            .unwrap();

        let reader = DataStoreTupleReader::new(Arc::clone(&storage));

        assert!(reader.store_exists("store1").await.unwrap());
        assert!(!reader.store_exists("missing").await.unwrap());

        assert!(reader
            .read_user_tuple("store1", "document", "1", "viewer", "user:anne")
            .await
            .unwrap());
        assert!(!reader
            .read_user_tuple("store1", "document", "1", "viewer", "user:bob")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_tuple_reader_pages_through_relation_tuples() {
        let storage = storage_with_model().await;
        let writes: Vec<StoredTuple> = (0..250)
            .map(|i| {
                StoredTuple::parse("document:1", "viewer", &format!("user:u{i}")).unwrap()
            })
            .collect();
        storage.write("store1", vec![], writes).await.unwrap();

        let reader = DataStoreTupleReader::new(storage);
        let tuples = reader
            .read_relation_tuples("store1", "document", "1", "viewer")
            .await
            .unwrap();
        assert_eq!(tuples.len(), 250);
    }

    #[tokio::test]
    async fn test_tuple_reader_reverse_index_dedupes_object_ids() {
        let storage = storage_with_model().await;
        storage
            .write(
                "store1",
                vec![],
                vec![
                    StoredTuple::parse("document:1", "viewer", "user:anne").unwrap(),
                    StoredTuple::parse("document:2", "viewer", "user:anne").unwrap(),
                ],
            )
            .await
            .unwrap();

        let reader = DataStoreTupleReader::new(storage);
        let mut ids = reader
            .read_starting_with_user(
                "store1",
                "document",
                "viewer",
                &["user:anne".to_string()],
            )
            .await
            .unwrap();
        ids.sort();
        assert_eq!(ids, vec!["1", "2"]);
    }

    #[tokio::test]
    async fn test_model_reader_compiles_and_caches_type_systems() {
        let storage = storage_with_model().await;
        let reader = DataStoreModelReader::new(storage);

        let first = reader.get_type_system("store1", None).await.unwrap();
        assert!(first.has_relation("document", "viewer"));
        assert_eq!(first.model().id, "01ARZ3NDEKTSV4RRFFQ69G5FAV");

        let second = reader
            .get_type_system("store1", Some("01ARZ3NDEKTSV4RRFFQ69G5FAV"))
            .await
            .unwrap();
        // Same compiled instance, served from the cache.
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_model_reader_unknown_model_errors() {
        let storage = storage_with_model().await;
        let reader = DataStoreModelReader::new(storage);

        let err = reader
            .get_type_system("store1", Some("missing"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DomainError::AuthorizationModelNotFound { .. } | DomainError::Internal { .. }
        ));
    }
}
