//! The request surface exposed to transport layers.
//!
//! `AuthorizationService` owns the storage (behind the model cache), the
//! resolver, and the configured limits. Transport layers translate their
//! wire formats into these calls; everything here is transport-agnostic.

use std::sync::Arc;

use thiserror::Error;
use tokio_stream::wrappers::ReceiverStream;
use tracing::instrument;

use relata_domain::error::{DomainError, DomainResult};
use relata_domain::model::{AuthorizationModel, Tuple, TypeSystem};
use relata_domain::resolver::{
    CheckRequest, CheckResult, ContextualTuple, ExpandRequest, ExpandResult, GraphResolver,
    ListObjectsRequest, ListObjectsResult, ModelReader, ResolverConfig,
};
use relata_storage::{
    CachedDataStore, DataStore, PaginatedResult, PaginationOptions, Store,
    StoredAuthorizationModel, StoredTuple, TupleChange, TupleFilter,
};

use crate::adapters::{DataStoreModelReader, DataStoreTupleReader};
use crate::config::ServerConfig;

/// Errors surfaced by the service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Storage(#[from] relata_storage::StorageError),

    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Result type for service operations.
pub type ServiceResult<T> = Result<T, ServiceError>;

type Reader<S> = DataStoreTupleReader<CachedDataStore<S>>;
type Models<S> = DataStoreModelReader<CachedDataStore<S>>;

/// The authorization service: stores, models, tuples and queries.
pub struct AuthorizationService<S: DataStore> {
    storage: Arc<CachedDataStore<S>>,
    model_reader: Arc<Models<S>>,
    resolver: Arc<GraphResolver<Reader<S>, Models<S>>>,
    config: ServerConfig,
    /// Monotonic ULID source: model ids must sort in creation order even
    /// within one millisecond.
    model_ids: std::sync::Mutex<ulid::Generator>,
}

impl<S: DataStore> AuthorizationService<S> {
    /// Builds the service around a storage backend.
    pub fn new(storage: S, config: ServerConfig) -> Self {
        let storage = Arc::new(CachedDataStore::new(storage));
        let tuple_reader = Arc::new(DataStoreTupleReader::new(Arc::clone(&storage)));
        let model_reader = Arc::new(DataStoreModelReader::new(Arc::clone(&storage)));

        let resolver_config = ResolverConfig {
            max_depth: config.limits.resolve_node_limit,
            list_objects_deadline: config.limits.list_objects_deadline(),
            list_objects_max_results: config.limits.list_objects_max_results,
            ..ResolverConfig::default()
        };
        let resolver = Arc::new(GraphResolver::with_config(
            tuple_reader,
            Arc::clone(&model_reader),
            resolver_config,
        ));

        Self {
            storage,
            model_reader,
            resolver,
            config,
            model_ids: std::sync::Mutex::new(ulid::Generator::new()),
        }
    }

    fn next_model_id(&self) -> Result<String, ServiceError> {
        let mut generator = self
            .model_ids
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        generator
            .generate()
            .map(|id| id.to_string())
            .map_err(|e| ServiceError::Validation {
                message: format!("failed to generate model id: {e}"),
            })
    }

    // ---- Stores ----

    pub async fn create_store(&self, id: &str, name: &str) -> ServiceResult<Store> {
        Ok(self.storage.create_store(id, name).await?)
    }

    pub async fn get_store(&self, id: &str) -> ServiceResult<Store> {
        Ok(self.storage.get_store(id).await?)
    }

    pub async fn delete_store(&self, id: &str) -> ServiceResult<()> {
        Ok(self.storage.delete_store(id).await?)
    }

    pub async fn list_stores(
        &self,
        pagination: &PaginationOptions,
    ) -> ServiceResult<PaginatedResult<Store>> {
        Ok(self.storage.list_stores(pagination).await?)
    }

    // ---- Authorization models ----

    /// Validates and persists a model; returns the assigned model id.
    #[instrument(skip(self, model), fields(store_id = %store_id))]
    pub async fn write_authorization_model(
        &self,
        store_id: &str,
        mut model: AuthorizationModel,
    ) -> ServiceResult<String> {
        if model.type_definitions.len() > self.config.limits.max_types_per_authorization_model {
            return Err(ServiceError::Validation {
                message: format!(
                    "authorization model exceeds {} type definitions",
                    self.config.limits.max_types_per_authorization_model
                ),
            });
        }

        let model_id = self.next_model_id()?;
        model.id = model_id.clone();

        let type_system = TypeSystem::new(model.clone());
        type_system.validate()?;

        let stored = StoredAuthorizationModel {
            id: model_id.clone(),
            schema_version: model.schema_version.clone(),
            created_at: chrono::Utc::now(),
            model_json: serde_json::to_string(&model).map_err(|e| DomainError::Internal {
                message: format!("failed to serialize model: {e}"),
            })?,
        };
        self.storage
            .write_authorization_model(store_id, stored)
            .await?;

        Ok(model_id)
    }

    /// Reads a model by id.
    pub async fn read_authorization_model(
        &self,
        store_id: &str,
        model_id: &str,
    ) -> ServiceResult<AuthorizationModel> {
        let stored = self
            .storage
            .read_authorization_model(store_id, model_id)
            .await?;
        Ok(parse_stored_model(&stored)?)
    }

    /// Reads models newest-first with pagination.
    pub async fn read_authorization_models(
        &self,
        store_id: &str,
        pagination: &PaginationOptions,
    ) -> ServiceResult<PaginatedResult<AuthorizationModel>> {
        let page = self
            .storage
            .read_authorization_models(store_id, pagination)
            .await?;
        let mut items = Vec::with_capacity(page.items.len());
        for stored in &page.items {
            items.push(parse_stored_model(stored)?);
        }
        Ok(PaginatedResult {
            items,
            continuation_token: page.continuation_token,
        })
    }

    // ---- Queries ----

    /// Decides whether the user holds the relation on the object.
    pub async fn check(&self, request: &CheckRequest) -> ServiceResult<CheckResult> {
        self.validate_contextual_tuples(request).await?;
        Ok(self.resolver.check(request).await?)
    }

    /// Explains a relation on an object as a one-level usertree.
    pub async fn expand(&self, request: &ExpandRequest) -> ServiceResult<ExpandResult> {
        Ok(self.resolver.expand(request).await?)
    }

    /// Lists objects of a type the user has the relation to.
    pub async fn list_objects(
        &self,
        request: &ListObjectsRequest,
    ) -> ServiceResult<ListObjectsResult> {
        Ok(self.resolver.list_objects(request).await?)
    }

    /// Streaming variant of [`Self::list_objects`].
    pub async fn streamed_list_objects(
        &self,
        request: ListObjectsRequest,
    ) -> ServiceResult<ReceiverStream<DomainResult<String>>> {
        Ok(self.resolver.streamed_list_objects(request).await?)
    }

    // ---- Tuples ----

    /// Applies a transactional write batch after validating every tuple
    /// against the store's model.
    #[instrument(skip(self, writes, deletes), fields(store_id = %store_id))]
    pub async fn write(
        &self,
        store_id: &str,
        writes: Vec<Tuple>,
        deletes: Vec<Tuple>,
    ) -> ServiceResult<()> {
        let total = writes.len() + deletes.len();
        if total == 0 {
            return Err(ServiceError::Validation {
                message: "write batch cannot be empty".to_string(),
            });
        }
        if total > self.config.limits.max_tuples_per_write {
            return Err(ServiceError::Validation {
                message: format!(
                    "write batch of {total} tuples exceeds the limit of {}",
                    self.config.limits.max_tuples_per_write
                ),
            });
        }

        let type_system = self.model_reader.get_type_system(store_id, None).await?;

        let mut stored_writes = Vec::with_capacity(writes.len());
        for tuple in &writes {
            type_system.validate_tuple(tuple)?;
            stored_writes.push(to_stored(tuple)?);
        }
        // Deletes only need to be well-formed; the tuple may predate the
        // current model.
        let mut stored_deletes = Vec::with_capacity(deletes.len());
        for tuple in &deletes {
            stored_deletes.push(to_stored(tuple)?);
        }

        Ok(self
            .storage
            .write(store_id, stored_deletes, stored_writes)
            .await?)
    }

    /// Reads tuples matching the filter.
    pub async fn read(
        &self,
        store_id: &str,
        filter: &TupleFilter,
        pagination: &PaginationOptions,
    ) -> ServiceResult<PaginatedResult<Tuple>> {
        let page = self.storage.read(store_id, filter, pagination).await?;
        Ok(PaginatedResult {
            items: page
                .items
                .into_iter()
                .map(|t| Tuple::new(t.user_string(), t.relation.clone(), t.object_string()))
                .collect(),
            continuation_token: page.continuation_token,
        })
    }

    /// Reads the tuple change log, honouring the configured horizon offset.
    pub async fn read_changes(
        &self,
        store_id: &str,
        object_type: Option<&str>,
        pagination: &PaginationOptions,
    ) -> ServiceResult<PaginatedResult<TupleChange>> {
        Ok(self
            .storage
            .read_changes(
                store_id,
                object_type,
                self.config.limits.changelog_horizon_offset(),
                pagination,
            )
            .await?)
    }

    /// Contextual tuples obey the same model restrictions as stored ones.
    async fn validate_contextual_tuples(&self, request: &CheckRequest) -> ServiceResult<()> {
        if request.contextual_tuples.is_empty() {
            return Ok(());
        }
        let type_system = self
            .model_reader
            .get_type_system(&request.store_id, request.authorization_model_id.as_deref())
            .await?;
        for ct in request.contextual_tuples.iter() {
            type_system.validate_tuple(&contextual_to_tuple(ct))?;
        }
        Ok(())
    }
}

fn contextual_to_tuple(ct: &ContextualTuple) -> Tuple {
    Tuple::new(ct.user.clone(), ct.relation.clone(), ct.object.clone())
}

fn to_stored(tuple: &Tuple) -> Result<StoredTuple, ServiceError> {
    StoredTuple::parse(&tuple.object, &tuple.relation, &tuple.user).map_err(ServiceError::from)
}

fn parse_stored_model(stored: &StoredAuthorizationModel) -> DomainResult<AuthorizationModel> {
    let mut model: AuthorizationModel =
        serde_json::from_str(&stored.model_json).map_err(|e| DomainError::ModelParseError {
            message: format!("failed to parse stored model '{}': {}", stored.id, e),
        })?;
    model.id = stored.id.clone();
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use relata_domain::model::parse;
    use relata_storage::MemoryDataStore;

    const MODEL_DSL: &str = r"
        type user

        type group
          relations
            define member: [user, group#member]

        type document
          relations
            define owner: [user]
            define editor: [user, group#member] or owner
            define viewer: [user, user:*] or editor
    ";

    async fn service_with_model() -> AuthorizationService<MemoryDataStore> {
        let service = AuthorizationService::new(MemoryDataStore::new(), ServerConfig::default());
        service.create_store("store1", "Test Store").await.unwrap();
        service
            .write_authorization_model("store1", parse(MODEL_DSL).unwrap())
            .await
            .unwrap();
        service
    }

    fn tuple(user: &str, relation: &str, object: &str) -> Tuple {
        Tuple::new(user, relation, object)
    }

    #[tokio::test]
    async fn test_write_model_assigns_monotonic_ids() {
        let service = service_with_model().await;

        let first = service
            .write_authorization_model("store1", parse(MODEL_DSL).unwrap())
            .await
            .unwrap();
        let second = service
            .write_authorization_model("store1", parse(MODEL_DSL).unwrap())
            .await
            .unwrap();
        assert!(second > first, "model ids must be monotonic");

        let model = service
            .read_authorization_model("store1", &second)
            .await
            .unwrap();
        assert_eq!(model.id, second);
        assert_eq!(model.type_definitions.len(), 3);
    }

    #[tokio::test]
    async fn test_write_model_rejects_invalid_models() {
        let service = service_with_model().await;

        let invalid = parse(
            r"
            type user
            type document
              relations
                define viewer: editor
            ",
        )
        .unwrap();
        let err = service
            .write_authorization_model("store1", invalid)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Domain(DomainError::InvalidAuthorizationModel { .. })
        ));
    }

    #[tokio::test]
    async fn test_write_model_enforces_type_limit() {
        let mut config = ServerConfig::default();
        config.limits.max_types_per_authorization_model = 2;
        let service = AuthorizationService::new(MemoryDataStore::new(), config);
        service.create_store("store1", "Test Store").await.unwrap();

        let err = service
            .write_authorization_model("store1", parse(MODEL_DSL).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_write_validates_tuples_against_the_model() {
        let service = service_with_model().await;

        // Allowed: user objects on owner.
        service
            .write(
                "store1",
                vec![tuple("user:anne", "owner", "document:1")],
                vec![],
            )
            .await
            .unwrap();

        // Rejected: group#member is not an allowed type for owner.
        let err = service
            .write(
                "store1",
                vec![tuple("group:eng#member", "owner", "document:1")],
                vec![],
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Domain(DomainError::InvalidTuple { .. })
        ));
    }

    #[tokio::test]
    async fn test_write_enforces_batch_limit() {
        let mut config = ServerConfig::default();
        config.limits.max_tuples_per_write = 2;
        let service = AuthorizationService::new(MemoryDataStore::new(), config);
        service.create_store("store1", "Test Store").await.unwrap();
        service
            .write_authorization_model("store1", parse(MODEL_DSL).unwrap())
            .await
            .unwrap();

        let batch: Vec<Tuple> = (0..3)
            .map(|i| tuple("user:anne", "owner", &format!("document:{i}")))
            .collect();
        let err = service.write("store1", batch, vec![]).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation { .. }));

        let err = service.write("store1", vec![], vec![]).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_check_through_the_full_stack() {
        let service = service_with_model().await;
        service
            .write(
                "store1",
                vec![
                    tuple("group:eng#member", "editor", "document:1"),
                    tuple("user:anne", "member", "group:eng"),
                ],
                vec![],
            )
            .await
            .unwrap();

        let result = service
            .check(&CheckRequest::new(
                "store1",
                "user:anne",
                "viewer",
                "document:1",
                vec![],
            ))
            .await
            .unwrap();
        assert!(result.allowed);

        let result = service
            .check(&CheckRequest::new(
                "store1",
                "user:bob",
                "viewer",
                "document:1",
                vec![],
            ))
            .await
            .unwrap();
        assert!(!result.allowed);
    }

    #[tokio::test]
    async fn test_check_rejects_invalid_contextual_tuples() {
        let service = service_with_model().await;

        let request = CheckRequest::new(
            "store1",
            "user:anne",
            "viewer",
            "document:1",
            vec![ContextualTuple::new("user:anne", "nonexistent", "document:1")],
        );
        let err = service.check(&request).await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Domain(DomainError::RelationNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_expand_and_list_objects_through_the_stack() {
        let service = service_with_model().await;
        service
            .write(
                "store1",
                vec![
                    tuple("user:anne", "owner", "document:1"),
                    tuple("user:anne", "viewer", "document:2"),
                ],
                vec![],
            )
            .await
            .unwrap();

        let expand = service
            .expand(&ExpandRequest::new("store1", "owner", "document:1"))
            .await
            .unwrap();
        assert_eq!(expand.tree.root.name(), "document:1#owner");

        let mut listed = service
            .list_objects(&ListObjectsRequest::new(
                "store1", "document", "viewer", "user:anne",
            ))
            .await
            .unwrap()
            .objects;
        listed.sort();
        assert_eq!(listed, vec!["document:1", "document:2"]);
    }

    #[tokio::test]
    async fn test_streamed_list_objects_through_the_stack() {
        let service = service_with_model().await;
        service
            .write(
                "store1",
                vec![tuple("user:anne", "viewer", "document:1")],
                vec![],
            )
            .await
            .unwrap();

        let stream = service
            .streamed_list_objects(ListObjectsRequest::new(
                "store1", "document", "viewer", "user:anne",
            ))
            .await
            .unwrap();
        let objects: Vec<String> = stream.map(|item| item.unwrap()).collect().await;
        assert_eq!(objects, vec!["document:1"]);
    }

    #[tokio::test]
    async fn test_read_and_read_changes() {
        let service = service_with_model().await;
        service
            .write(
                "store1",
                vec![tuple("user:anne", "viewer", "document:1")],
                vec![],
            )
            .await
            .unwrap();
        service
            .write(
                "store1",
                vec![],
                vec![tuple("user:anne", "viewer", "document:1")],
            )
            .await
            .unwrap();

        let filter = TupleFilter {
            user: Some("user:anne".to_string()),
            ..Default::default()
        };
        let page = service
            .read("store1", &filter, &PaginationOptions::default())
            .await
            .unwrap();
        assert!(page.items.is_empty());

        let changes = service
            .read_changes("store1", None, &PaginationOptions::default())
            .await
            .unwrap();
        assert_eq!(changes.items.len(), 2);
    }

    #[tokio::test]
    async fn test_write_conflict_surfaces_invalid_write_input() {
        let service = service_with_model().await;
        service
            .write(
                "store1",
                vec![tuple("user:anne", "viewer", "document:1")],
                vec![],
            )
            .await
            .unwrap();

        let err = service
            .write(
                "store1",
                vec![tuple("user:anne", "viewer", "document:1")],
                vec![],
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Storage(relata_storage::StorageError::InvalidWriteInput { .. })
        ));
    }
}
