//! Mock implementations for resolver testing.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{DomainError, DomainResult};
use crate::model::{parse, TypeSystem};
use crate::resolver::{GraphResolver, ModelReader, StoredTupleRef, TupleReader};

/// A fully decomposed tuple for the mock store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockTuple {
    pub object_type: String,
    pub object_id: String,
    pub relation: String,
    pub user: String,
}

/// Mock tuple reader for testing, with read counters per operation.
pub struct MockTupleReader {
    stores: RwLock<HashSet<String>>,
    tuples: RwLock<HashMap<String, Vec<MockTuple>>>,
    pub reverse_index_reads: AtomicU64,
    pub point_reads: AtomicU64,
    /// Artificial latency added to every read, for deadline tests.
    pub read_delay: RwLock<Option<Duration>>,
}

impl MockTupleReader {
    pub fn new() -> Self {
        Self {
            stores: RwLock::new(HashSet::new()),
            tuples: RwLock::new(HashMap::new()),
            reverse_index_reads: AtomicU64::new(0),
            point_reads: AtomicU64::new(0),
            read_delay: RwLock::new(None),
        }
    }

    pub async fn add_store(&self, store_id: &str) {
        self.stores.write().await.insert(store_id.to_string());
    }

    /// Adds a tuple given "type:id" object and a user string.
    pub async fn add_tuple(&self, store_id: &str, object: &str, relation: &str, user: &str) {
        let (object_type, object_id) = object.split_once(':').expect("object must be type:id");
        self.tuples
            .write()
            .await
            .entry(store_id.to_string())
            .or_default()
            .push(MockTuple {
                object_type: object_type.to_string(),
                object_id: object_id.to_string(),
                relation: relation.to_string(),
                user: user.to_string(),
            });
    }

    pub async fn set_read_delay(&self, delay: Duration) {
        *self.read_delay.write().await = Some(delay);
    }

    async fn simulate_latency(&self) {
        if let Some(delay) = *self.read_delay.read().await {
            tokio::time::sleep(delay).await;
        }
    }

    fn to_ref(tuple: &MockTuple) -> StoredTupleRef {
        match tuple.user.split_once('#') {
            Some((object, relation)) => {
                let (user_type, user_id) = object.split_once(':').unwrap_or((object, ""));
                StoredTupleRef::new(user_type, user_id, Some(relation.to_string()))
            }
            None => {
                let (user_type, user_id) = tuple.user.split_once(':').unwrap_or((&tuple.user, ""));
                StoredTupleRef::new(user_type, user_id, None)
            }
        }
    }
}

#[async_trait]
impl TupleReader for MockTupleReader {
    async fn read_user_tuple(
        &self,
        store_id: &str,
        object_type: &str,
        object_id: &str,
        relation: &str,
        user: &str,
    ) -> DomainResult<bool> {
        self.simulate_latency().await;
        self.point_reads.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .tuples
            .read()
            .await
            .get(store_id)
            .map(|tuples| {
                tuples.iter().any(|t| {
                    t.object_type == object_type
                        && t.object_id == object_id
                        && t.relation == relation
                        && t.user == user
                })
            })
            .unwrap_or(false))
    }

    async fn read_relation_tuples(
        &self,
        store_id: &str,
        object_type: &str,
        object_id: &str,
        relation: &str,
    ) -> DomainResult<Vec<StoredTupleRef>> {
        self.simulate_latency().await;
        Ok(self
            .tuples
            .read()
            .await
            .get(store_id)
            .map(|tuples| {
                tuples
                    .iter()
                    .filter(|t| {
                        t.object_type == object_type
                            && t.object_id == object_id
                            && t.relation == relation
                    })
                    .map(Self::to_ref)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn read_userset_tuples(
        &self,
        store_id: &str,
        object_type: &str,
        object_id: &str,
        relation: &str,
    ) -> DomainResult<Vec<StoredTupleRef>> {
        let tuples = self
            .read_relation_tuples(store_id, object_type, object_id, relation)
            .await?;
        Ok(tuples.into_iter().filter(|t| t.is_userset()).collect())
    }

    async fn read_starting_with_user(
        &self,
        store_id: &str,
        object_type: &str,
        relation: &str,
        users: &[String],
    ) -> DomainResult<Vec<String>> {
        self.simulate_latency().await;
        self.reverse_index_reads.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .tuples
            .read()
            .await
            .get(store_id)
            .map(|tuples| {
                tuples
                    .iter()
                    .filter(|t| {
                        t.object_type == object_type
                            && t.relation == relation
                            && users.iter().any(|u| *u == t.user)
                    })
                    .map(|t| t.object_id.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn read_objects_of_type(
        &self,
        store_id: &str,
        object_type: &str,
        max_count: usize,
    ) -> DomainResult<Vec<String>> {
        self.simulate_latency().await;
        let mut seen = HashSet::new();
        let mut objects = Vec::new();
        if let Some(tuples) = self.tuples.read().await.get(store_id) {
            for tuple in tuples.iter().filter(|t| t.object_type == object_type) {
                if seen.insert(tuple.object_id.clone()) {
                    objects.push(tuple.object_id.clone());
                    if objects.len() >= max_count {
                        break;
                    }
                }
            }
        }
        Ok(objects)
    }

    async fn store_exists(&self, store_id: &str) -> DomainResult<bool> {
        Ok(self.stores.read().await.contains(store_id))
    }
}

/// Mock model reader serving compiled type systems per store.
pub struct MockModelReader {
    models: RwLock<HashMap<String, Arc<TypeSystem>>>,
}

impl MockModelReader {
    pub fn new() -> Self {
        Self {
            models: RwLock::new(HashMap::new()),
        }
    }

    /// Parses the DSL and registers the compiled model for a store.
    pub async fn add_model(&self, store_id: &str, dsl: &str) {
        let model = parse(dsl).expect("test model must parse");
        self.models
            .write()
            .await
            .insert(store_id.to_string(), Arc::new(TypeSystem::new(model)));
    }
}

#[async_trait]
impl ModelReader for MockModelReader {
    async fn get_type_system(
        &self,
        store_id: &str,
        _authorization_model_id: Option<&str>,
    ) -> DomainResult<Arc<TypeSystem>> {
        self.models
            .read()
            .await
            .get(store_id)
            .cloned()
            .ok_or_else(|| DomainError::AuthorizationModelNotFound {
                model_id: format!("latest for store {store_id}"),
            })
    }
}

/// Helper to create a resolver wired to fresh mocks.
pub fn create_resolver() -> (
    Arc<MockTupleReader>,
    Arc<MockModelReader>,
    GraphResolver<MockTupleReader, MockModelReader>,
) {
    let tuple_reader = Arc::new(MockTupleReader::new());
    let model_reader = Arc::new(MockModelReader::new());
    let resolver = GraphResolver::new(Arc::clone(&tuple_reader), Arc::clone(&model_reader));
    (tuple_reader, model_reader, resolver)
}
