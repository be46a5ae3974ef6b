//! DataStore trait definition and shared storage types.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::{StorageError, StorageResult};

/// Maximum length for string fields.
const MAX_FIELD_LENGTH: usize = 255;

/// Validate a store ID.
///
/// # Errors
/// Returns `StorageError::InvalidInput` if the store ID is empty or too long.
pub fn validate_store_id(store_id: &str) -> StorageResult<()> {
    if store_id.is_empty() {
        return Err(StorageError::InvalidInput {
            message: "store_id cannot be empty".to_string(),
        });
    }
    if store_id.len() > MAX_FIELD_LENGTH {
        return Err(StorageError::InvalidInput {
            message: format!(
                "store_id exceeds maximum length of {MAX_FIELD_LENGTH} characters"
            ),
        });
    }
    Ok(())
}

/// Validate a store name.
pub fn validate_store_name(name: &str) -> StorageResult<()> {
    if name.is_empty() {
        return Err(StorageError::InvalidInput {
            message: "store name cannot be empty".to_string(),
        });
    }
    if name.len() > MAX_FIELD_LENGTH {
        return Err(StorageError::InvalidInput {
            message: format!(
                "store name exceeds maximum length of {MAX_FIELD_LENGTH} characters"
            ),
        });
    }
    Ok(())
}

/// Validate a stored tuple structurally: required fields present, no field
/// over length. Model-level validation (type restrictions) happens in the
/// service layer, where the authorization model is available.
pub fn validate_tuple(tuple: &StoredTuple) -> StorageResult<()> {
    let fields: [(&str, &str); 5] = [
        ("object_type", &tuple.object_type),
        ("object_id", &tuple.object_id),
        ("relation", &tuple.relation),
        ("user_type", &tuple.user_type),
        ("user_id", &tuple.user_id),
    ];
    for (name, value) in fields {
        if value.is_empty() {
            return Err(StorageError::InvalidInput {
                message: format!("{name} cannot be empty"),
            });
        }
        if value.len() > MAX_FIELD_LENGTH {
            return Err(StorageError::InvalidInput {
                message: format!("{name} exceeds maximum length of {MAX_FIELD_LENGTH} characters"),
            });
        }
    }
    if let Some(ref user_relation) = tuple.user_relation {
        if user_relation.is_empty() {
            return Err(StorageError::InvalidInput {
                message: "user_relation cannot be empty if provided".to_string(),
            });
        }
        if user_relation.len() > MAX_FIELD_LENGTH {
            return Err(StorageError::InvalidInput {
                message: format!(
                    "user_relation exceeds maximum length of {MAX_FIELD_LENGTH} characters"
                ),
            });
        }
    }
    Ok(())
}

/// Parse a user filter string into (user_type, user_id, user_relation).
///
/// # Format
/// - `"type:id"` for direct users
/// - `"type:id#relation"` for usersets
/// - `"type:*"` for wildcards (user_id is `"*"`)
pub fn parse_user_filter(user: &str) -> StorageResult<(String, String, Option<String>)> {
    let (object_part, user_relation) = match user.split_once('#') {
        Some((object, relation)) if !relation.is_empty() => (object, Some(relation.to_string())),
        Some(_) => {
            return Err(StorageError::InvalidFilter {
                message: format!(
                    "invalid user filter '{user}': expected 'type:id#relation'"
                ),
            })
        }
        None => (user, None),
    };

    match object_part.split_once(':') {
        Some((user_type, user_id)) if !user_type.is_empty() && !user_id.is_empty() => Ok((
            user_type.to_string(),
            user_id.to_string(),
            user_relation,
        )),
        _ => Err(StorageError::InvalidFilter {
            message: format!("invalid user filter '{user}': expected 'type:id'"),
        }),
    }
}

/// Parse an offset-style continuation token.
pub fn parse_continuation_token(token: &Option<String>) -> StorageResult<u64> {
    match token {
        None => Ok(0),
        Some(token) => token
            .parse::<u64>()
            .map_err(|_| StorageError::InvalidContinuationToken {
                token: token.clone(),
            }),
    }
}

/// Filter for reading tuples. At least one field must be set.
#[derive(Debug, Clone, Default)]
pub struct TupleFilter {
    /// Filter by object type.
    pub object_type: Option<String>,
    /// Filter by object ID.
    pub object_id: Option<String>,
    /// Filter by relation.
    pub relation: Option<String>,
    /// Filter by user: `"type:id"`, `"type:id#relation"` or `"type:*"`.
    pub user: Option<String>,
}

impl TupleFilter {
    /// Returns true if no field is set.
    pub fn is_empty(&self) -> bool {
        self.object_type.is_none()
            && self.object_id.is_none()
            && self.relation.is_none()
            && self.user.is_none()
    }
}

/// A stored relationship tuple, decomposed for indexability.
///
/// Wildcard users are stored with `user_id == "*"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoredTuple {
    pub object_type: String,
    pub object_id: String,
    pub relation: String,
    pub user_type: String,
    pub user_id: String,
    pub user_relation: Option<String>,
}

impl StoredTuple {
    pub fn new(
        object_type: impl Into<String>,
        object_id: impl Into<String>,
        relation: impl Into<String>,
        user_type: impl Into<String>,
        user_id: impl Into<String>,
        user_relation: Option<String>,
    ) -> Self {
        Self {
            object_type: object_type.into(),
            object_id: object_id.into(),
            relation: relation.into(),
            user_type: user_type.into(),
            user_id: user_id.into(),
            user_relation,
        }
    }

    /// Builds a tuple from `"type:id"` object and user strings.
    pub fn parse(object: &str, relation: &str, user: &str) -> StorageResult<Self> {
        let (object_type, object_id) = object.split_once(':').ok_or_else(|| {
            StorageError::InvalidInput {
                message: format!("invalid object '{object}': expected 'type:id'"),
            }
        })?;
        let (user_type, user_id, user_relation) = parse_user_filter(user).map_err(|_| {
            StorageError::InvalidInput {
                message: format!("invalid user '{user}'"),
            }
        })?;
        let tuple = Self::new(object_type, object_id, relation, user_type, user_id, user_relation);
        validate_tuple(&tuple)?;
        Ok(tuple)
    }

    /// Formats the object as "type:id".
    pub fn object_string(&self) -> String {
        format!("{}:{}", self.object_type, self.object_id)
    }

    /// Formats the user as "type:id", "type:id#relation" or "type:*".
    pub fn user_string(&self) -> String {
        match &self.user_relation {
            Some(relation) => format!("{}:{}#{}", self.user_type, self.user_id, relation),
            None => format!("{}:{}", self.user_type, self.user_id),
        }
    }

    /// Returns true if the tuple's user is a userset reference.
    pub fn is_userset(&self) -> bool {
        self.user_relation.is_some()
    }
}

/// Store metadata.
#[derive(Debug, Clone)]
pub struct Store {
    pub id: String,
    pub name: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// A stored authorization model.
///
/// Models are immutable once written: the `(store, id)` pair always resolves
/// to the same payload, which makes them safely cacheable forever. `id` is a
/// ULID, so lexicographic order is creation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAuthorizationModel {
    pub id: String,
    pub schema_version: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// The serialized model (JSON); the service layer owns the schema.
    pub model_json: String,
}

/// The operation recorded by a changelog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TupleOperation {
    Write,
    Delete,
}

/// A change log entry for a tuple write or delete.
#[derive(Debug, Clone)]
pub struct TupleChange {
    /// ULID ordering the change within the store.
    pub id: String,
    pub tuple: StoredTuple,
    pub operation: TupleOperation,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Options for paginated queries.
#[derive(Debug, Clone, Default)]
pub struct PaginationOptions {
    /// Maximum number of results to return.
    pub page_size: Option<u32>,
    /// Continuation token from a previous query.
    pub continuation_token: Option<String>,
}

/// Paginated query result.
#[derive(Debug, Clone)]
pub struct PaginatedResult<T> {
    /// The results.
    pub items: Vec<T>,
    /// Token for fetching the next page, if there are more results.
    pub continuation_token: Option<String>,
}

/// Abstract storage interface for authorization data.
///
/// Implementations must be thread-safe (Send + Sync) and support async
/// operations. Read order is unspecified; callers treat result pages as
/// lazy, finite, forward-only sequences.
#[async_trait]
pub trait DataStore: Send + Sync + 'static {
    // Store operations

    /// Creates a new store.
    async fn create_store(&self, id: &str, name: &str) -> StorageResult<Store>;

    /// Gets a store by ID.
    async fn get_store(&self, id: &str) -> StorageResult<Store>;

    /// Deletes a store and everything in it.
    async fn delete_store(&self, id: &str) -> StorageResult<()>;

    /// Lists stores with pagination.
    async fn list_stores(
        &self,
        pagination: &PaginationOptions,
    ) -> StorageResult<PaginatedResult<Store>>;

    // Authorization model operations

    /// Persists a model. The model id must be unique within the store.
    async fn write_authorization_model(
        &self,
        store_id: &str,
        model: StoredAuthorizationModel,
    ) -> StorageResult<()>;

    /// Reads a model by id. Immutable result; safely cacheable forever.
    async fn read_authorization_model(
        &self,
        store_id: &str,
        model_id: &str,
    ) -> StorageResult<StoredAuthorizationModel>;

    /// Reads models newest-first with pagination.
    async fn read_authorization_models(
        &self,
        store_id: &str,
        pagination: &PaginationOptions,
    ) -> StorageResult<PaginatedResult<StoredAuthorizationModel>>;

    /// Returns the greatest model id for the store.
    async fn find_latest_authorization_model_id(&self, store_id: &str) -> StorageResult<String>;

    // Tuple operations

    /// Point lookup for an exact tuple; `TupleNotFound` if absent.
    async fn read_user_tuple(
        &self,
        store_id: &str,
        tuple: &StoredTuple,
    ) -> StorageResult<StoredTuple>;

    /// Reads tuples matching the filter, paginated. The filter must set at
    /// least one field.
    async fn read(
        &self,
        store_id: &str,
        filter: &TupleFilter,
        pagination: &PaginationOptions,
    ) -> StorageResult<PaginatedResult<StoredTuple>>;

    /// Reads the tuples for `(object, relation)` whose user is a userset.
    async fn read_userset_tuples(
        &self,
        store_id: &str,
        object_type: &str,
        object_id: &str,
        relation: &str,
    ) -> StorageResult<Vec<StoredTuple>>;

    /// Reverse index: tuples of `object_type`/`relation` whose user is any
    /// of `users` (each `"type:id"`, `"type:id#relation"` or `"type:*"`).
    async fn read_starting_with_user(
        &self,
        store_id: &str,
        object_type: &str,
        relation: &str,
        users: &[String],
    ) -> StorageResult<Vec<StoredTuple>>;

    /// Transactional batch: applies `deletes` then `writes` atomically.
    ///
    /// Fails with `InvalidWriteInput` when a delete names a missing tuple or
    /// a write names an existing one; on failure nothing is applied.
    async fn write(
        &self,
        store_id: &str,
        deletes: Vec<StoredTuple>,
        writes: Vec<StoredTuple>,
    ) -> StorageResult<()>;

    /// Reads the change log in write order, optionally filtered by object
    /// type. Changes newer than `horizon_offset` ago are withheld.
    async fn read_changes(
        &self,
        store_id: &str,
        object_type: Option<&str>,
        horizon_offset: Duration,
        pagination: &PaginationOptions,
    ) -> StorageResult<PaginatedResult<TupleChange>>;
}
