//! Reader traits for the data the resolver needs.
//!
//! These are the only external capabilities the evaluators depend on; the
//! server crate adapts a storage backend to them.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::DomainResult;
use crate::model::TypeSystem;

use super::types::StoredTupleRef;

/// Trait for tuple reads needed by the resolver.
#[async_trait]
pub trait TupleReader: Send + Sync {
    /// Point lookup: returns true if the exact tuple exists.
    ///
    /// `user` is in `type:id`, `type:id#relation` or `type:*` form.
    async fn read_user_tuple(
        &self,
        store_id: &str,
        object_type: &str,
        object_id: &str,
        relation: &str,
        user: &str,
    ) -> DomainResult<bool>;

    /// Reads all tuples for `(object, relation)`.
    async fn read_relation_tuples(
        &self,
        store_id: &str,
        object_type: &str,
        object_id: &str,
        relation: &str,
    ) -> DomainResult<Vec<StoredTupleRef>>;

    /// Reads the tuples for `(object, relation)` whose user is a userset.
    async fn read_userset_tuples(
        &self,
        store_id: &str,
        object_type: &str,
        object_id: &str,
        relation: &str,
    ) -> DomainResult<Vec<StoredTupleRef>>;

    /// Reverse index: object ids of `object_type` that have `relation` to
    /// any of `users`. Required by the reverse-expand strategy.
    async fn read_starting_with_user(
        &self,
        store_id: &str,
        object_type: &str,
        relation: &str,
        users: &[String],
    ) -> DomainResult<Vec<String>>;

    /// Distinct object ids of `object_type` appearing in stored tuples,
    /// up to `max_count`. Used by the check-each strategy to enumerate
    /// candidates; the limit bounds the scan.
    async fn read_objects_of_type(
        &self,
        store_id: &str,
        object_type: &str,
        max_count: usize,
    ) -> DomainResult<Vec<String>>;

    /// Checks if a store exists.
    async fn store_exists(&self, store_id: &str) -> DomainResult<bool>;
}

/// Trait for authorization model access needed by the resolver.
#[async_trait]
pub trait ModelReader: Send + Sync {
    /// Returns the compiled type system for a store.
    ///
    /// With `authorization_model_id` unset, resolves the store's latest
    /// model. Models are immutable, so implementations may cache the
    /// compiled view indefinitely per `(store, model_id)`.
    async fn get_type_system(
        &self,
        store_id: &str,
        authorization_model_id: Option<&str>,
    ) -> DomainResult<Arc<TypeSystem>>;
}
