//! In-memory storage implementation.
//!
//! Uses `HashSet<StoredTuple>` per store for O(1) write/delete/membership
//! and `DashMap` for thread-safe concurrent access without a global lock.
//! Read operations filter with a linear scan, which is fine at the scale
//! this backend serves (tests and single-process deployments).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::instrument;

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    parse_continuation_token, parse_user_filter, validate_store_id, validate_store_name,
    validate_tuple, DataStore, PaginatedResult, PaginationOptions, Store,
    StoredAuthorizationModel, StoredTuple, TupleChange, TupleFilter, TupleOperation,
};

/// In-memory implementation of [`DataStore`].
#[derive(Debug, Default)]
pub struct MemoryDataStore {
    stores: DashMap<String, Store>,
    /// Tuples per store; HashSet gives O(1) insert/delete/contains.
    tuples: DashMap<String, HashSet<StoredTuple>>,
    /// Models per store, insertion order (newest at the end).
    authorization_models: DashMap<String, Vec<StoredAuthorizationModel>>,
    /// Change log per store, write order.
    changes: DashMap<String, Vec<TupleChange>>,
}

impl MemoryDataStore {
    /// Creates a new in-memory data store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new in-memory data store wrapped in Arc.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn require_store(&self, store_id: &str) -> StorageResult<()> {
        if !self.stores.contains_key(store_id) {
            return Err(StorageError::StoreNotFound {
                store_id: store_id.to_string(),
            });
        }
        Ok(())
    }
}

fn tuple_matches(
    tuple: &StoredTuple,
    filter: &TupleFilter,
    user_parts: &Option<(String, String, Option<String>)>,
) -> bool {
    filter
        .object_type
        .as_ref()
        .map_or(true, |v| &tuple.object_type == v)
        && filter
            .object_id
            .as_ref()
            .map_or(true, |v| &tuple.object_id == v)
        && filter.relation.as_ref().map_or(true, |v| &tuple.relation == v)
        && user_parts.as_ref().map_or(true, |(ut, ui, ur)| {
            &tuple.user_type == ut
                && &tuple.user_id == ui
                && tuple.user_relation.as_deref() == ur.as_deref()
        })
}

fn paginate<T>(
    items: Vec<T>,
    pagination: &PaginationOptions,
) -> StorageResult<PaginatedResult<T>> {
    let page_size = pagination.page_size.unwrap_or(100) as usize;
    let offset = parse_continuation_token(&pagination.continuation_token)? as usize;

    let page: Vec<T> = items.into_iter().skip(offset).take(page_size).collect();
    let next_offset = offset + page.len();
    let continuation_token = if page.len() == page_size {
        Some(next_offset.to_string())
    } else {
        None
    };

    Ok(PaginatedResult {
        items: page,
        continuation_token,
    })
}

#[async_trait]
impl DataStore for MemoryDataStore {
    async fn create_store(&self, id: &str, name: &str) -> StorageResult<Store> {
        validate_store_id(id)?;
        validate_store_name(name)?;

        let now = chrono::Utc::now();
        let store = Store {
            id: id.to_string(),
            name: name.to_string(),
            created_at: now,
            updated_at: now,
        };

        // Atomic entry API prevents a race between check and insert.
        use dashmap::mapref::entry::Entry;
        match self.stores.entry(id.to_string()) {
            Entry::Occupied(_) => {
                return Err(StorageError::StoreAlreadyExists {
                    store_id: id.to_string(),
                });
            }
            Entry::Vacant(entry) => {
                entry.insert(store.clone());
            }
        }

        self.tuples.entry(id.to_string()).or_default();
        Ok(store)
    }

    async fn get_store(&self, id: &str) -> StorageResult<Store> {
        self.stores
            .get(id)
            .map(|s| s.value().clone())
            .ok_or_else(|| StorageError::StoreNotFound {
                store_id: id.to_string(),
            })
    }

    async fn delete_store(&self, id: &str) -> StorageResult<()> {
        if self.stores.remove(id).is_none() {
            return Err(StorageError::StoreNotFound {
                store_id: id.to_string(),
            });
        }
        self.tuples.remove(id);
        self.authorization_models.remove(id);
        self.changes.remove(id);
        Ok(())
    }

    async fn list_stores(
        &self,
        pagination: &PaginationOptions,
    ) -> StorageResult<PaginatedResult<Store>> {
        let mut stores: Vec<Store> = self.stores.iter().map(|s| s.value().clone()).collect();
        stores.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        paginate(stores, pagination)
    }

    async fn write_authorization_model(
        &self,
        store_id: &str,
        model: StoredAuthorizationModel,
    ) -> StorageResult<()> {
        self.require_store(store_id)?;
        if model.id.is_empty() {
            return Err(StorageError::InvalidInput {
                message: "model id cannot be empty".to_string(),
            });
        }

        let mut models = self
            .authorization_models
            .entry(store_id.to_string())
            .or_default();
        if models.iter().any(|m| m.id == model.id) {
            return Err(StorageError::InvalidInput {
                message: format!("model id '{}' already exists", model.id),
            });
        }
        models.push(model);
        Ok(())
    }

    async fn read_authorization_model(
        &self,
        store_id: &str,
        model_id: &str,
    ) -> StorageResult<StoredAuthorizationModel> {
        self.require_store(store_id)?;
        self.authorization_models
            .get(store_id)
            .and_then(|models| models.iter().find(|m| m.id == model_id).cloned())
            .ok_or_else(|| StorageError::ModelNotFound {
                model_id: model_id.to_string(),
            })
    }

    async fn read_authorization_models(
        &self,
        store_id: &str,
        pagination: &PaginationOptions,
    ) -> StorageResult<PaginatedResult<StoredAuthorizationModel>> {
        self.require_store(store_id)?;
        let mut models = self
            .authorization_models
            .get(store_id)
            .map(|m| m.clone())
            .unwrap_or_default();
        // Newest first; ids are ULIDs so lexicographic order is creation order.
        models.sort_by(|a, b| b.id.cmp(&a.id));
        paginate(models, pagination)
    }

    async fn find_latest_authorization_model_id(&self, store_id: &str) -> StorageResult<String> {
        self.require_store(store_id)?;
        self.authorization_models
            .get(store_id)
            .and_then(|models| models.iter().map(|m| m.id.clone()).max())
            .ok_or_else(|| StorageError::ModelNotFound {
                model_id: format!("latest for store {store_id}"),
            })
    }

    async fn read_user_tuple(
        &self,
        store_id: &str,
        tuple: &StoredTuple,
    ) -> StorageResult<StoredTuple> {
        self.require_store(store_id)?;
        self.tuples
            .get(store_id)
            .and_then(|tuples| tuples.get(tuple).cloned())
            .ok_or_else(|| StorageError::TupleNotFound {
                object_type: tuple.object_type.clone(),
                object_id: tuple.object_id.clone(),
                relation: tuple.relation.clone(),
                user: tuple.user_string(),
            })
    }

    async fn read(
        &self,
        store_id: &str,
        filter: &TupleFilter,
        pagination: &PaginationOptions,
    ) -> StorageResult<PaginatedResult<StoredTuple>> {
        self.require_store(store_id)?;
        if filter.is_empty() {
            return Err(StorageError::InvalidFilter {
                message: "at least one filter field must be set".to_string(),
            });
        }

        let user_parts = match &filter.user {
            Some(user) => Some(parse_user_filter(user)?),
            None => None,
        };

        let mut matched: Vec<StoredTuple> = Vec::new();
        if let Some(tuples) = self.tuples.get(store_id) {
            for tuple in tuples.iter() {
                if tuple_matches(tuple, filter, &user_parts) {
                    matched.push(tuple.clone());
                }
            }
        }
        // Deterministic page boundaries over the unordered set.
        matched.sort_by(|a, b| {
            (
                &a.object_type,
                &a.object_id,
                &a.relation,
                &a.user_type,
                &a.user_id,
                &a.user_relation,
            )
                .cmp(&(
                    &b.object_type,
                    &b.object_id,
                    &b.relation,
                    &b.user_type,
                    &b.user_id,
                    &b.user_relation,
                ))
        });
        paginate(matched, pagination)
    }

    async fn read_userset_tuples(
        &self,
        store_id: &str,
        object_type: &str,
        object_id: &str,
        relation: &str,
    ) -> StorageResult<Vec<StoredTuple>> {
        self.require_store(store_id)?;
        Ok(self
            .tuples
            .get(store_id)
            .map(|tuples| {
                tuples
                    .iter()
                    .filter(|t| {
                        t.is_userset()
                            && t.object_type == object_type
                            && t.object_id == object_id
                            && t.relation == relation
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn read_starting_with_user(
        &self,
        store_id: &str,
        object_type: &str,
        relation: &str,
        users: &[String],
    ) -> StorageResult<Vec<StoredTuple>> {
        self.require_store(store_id)?;
        Ok(self
            .tuples
            .get(store_id)
            .map(|tuples| {
                tuples
                    .iter()
                    .filter(|t| {
                        t.object_type == object_type
                            && t.relation == relation
                            && users.iter().any(|u| *u == t.user_string())
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    #[instrument(skip(self, deletes, writes), fields(store_id = %store_id))]
    async fn write(
        &self,
        store_id: &str,
        deletes: Vec<StoredTuple>,
        writes: Vec<StoredTuple>,
    ) -> StorageResult<()> {
        validate_store_id(store_id)?;
        self.require_store(store_id)?;
        for tuple in deletes.iter().chain(writes.iter()) {
            validate_tuple(tuple)?;
        }

        let mut tuples = self.tuples.entry(store_id.to_string()).or_default();

        // Check the whole batch before touching anything so a failed batch
        // applies nothing.
        for tuple in &deletes {
            if !tuples.contains(tuple) {
                return Err(StorageError::InvalidWriteInput {
                    message: format!(
                        "cannot delete a tuple which does not exist: {}#{}@{}",
                        tuple.object_string(),
                        tuple.relation,
                        tuple.user_string()
                    ),
                });
            }
        }
        for tuple in &writes {
            if tuples.contains(tuple) {
                return Err(StorageError::InvalidWriteInput {
                    message: format!(
                        "cannot write a tuple which already exists: {}#{}@{}",
                        tuple.object_string(),
                        tuple.relation,
                        tuple.user_string()
                    ),
                });
            }
        }

        let now = chrono::Utc::now();
        let mut log = self.changes.entry(store_id.to_string()).or_default();

        for tuple in deletes {
            tuples.remove(&tuple);
            log.push(TupleChange {
                id: ulid::Ulid::new().to_string(),
                tuple,
                operation: TupleOperation::Delete,
                timestamp: now,
            });
        }
        for tuple in writes {
            tuples.insert(tuple.clone());
            log.push(TupleChange {
                id: ulid::Ulid::new().to_string(),
                tuple,
                operation: TupleOperation::Write,
                timestamp: now,
            });
        }

        Ok(())
    }

    async fn read_changes(
        &self,
        store_id: &str,
        object_type: Option<&str>,
        horizon_offset: Duration,
        pagination: &PaginationOptions,
    ) -> StorageResult<PaginatedResult<TupleChange>> {
        self.require_store(store_id)?;
        let horizon = chrono::Utc::now()
            - chrono::Duration::from_std(horizon_offset).unwrap_or_else(|_| chrono::Duration::zero());

        let changes: Vec<TupleChange> = self
            .changes
            .get(store_id)
            .map(|log| {
                log.iter()
                    .filter(|c| {
                        object_type.map_or(true, |t| c.tuple.object_type == t)
                            && c.timestamp <= horizon
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        paginate(changes, pagination)
    }
}
