//! Domain error types for authorization operations.

use thiserror::Error;

/// Domain-specific errors for authorization operations.
#[derive(Debug, Error)]
pub enum DomainError {
    /// Error parsing an authorization model from the DSL or JSON form.
    #[error("model parse error: {message}")]
    ModelParseError { message: String },

    /// Submitted model violates a model invariant.
    #[error("invalid authorization model: {message}")]
    InvalidAuthorizationModel { message: String },

    /// Requested authorization model id is absent.
    #[error("authorization model not found: {model_id}")]
    AuthorizationModelNotFound { model_id: String },

    /// Type not found in the authorization model.
    #[error("type not found: {type_name}")]
    TypeNotFound { type_name: String },

    /// Relation not found on a type.
    #[error("relation '{relation}' not found on type '{type_name}'")]
    RelationNotFound { type_name: String, relation: String },

    /// Store not found.
    #[error("store not found: {store_id}")]
    StoreNotFound { store_id: String },

    /// Tuple references entities absent from the model, or is malformed
    /// relative to the model's type restrictions.
    #[error("invalid tuple: {message}")]
    InvalidTuple { message: String },

    /// Invalid user format.
    #[error("invalid user format: {value}")]
    InvalidUserFormat { value: String },

    /// Invalid object format.
    #[error("invalid object format: {value}")]
    InvalidObjectFormat { value: String },

    /// Invalid relation format.
    #[error("invalid relation format: {value}")]
    InvalidRelationFormat { value: String },

    /// Request shape invalid (missing store, malformed field).
    #[error("validation error: {message}")]
    ValidationError { message: String },

    /// Depth budget exhausted while resolving the rewrite graph.
    #[error("authorization model resolution too complex (depth limit {max_depth})")]
    ResolutionTooComplex { max_depth: u32 },

    /// Query exceeded its deadline.
    #[error("deadline exceeded after {duration_ms}ms")]
    DeadlineExceeded { duration_ms: u64 },

    /// Unexpected failure in a collaborator; wraps the underlying error.
    #[error("internal error: {message}")]
    Internal { message: String },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
