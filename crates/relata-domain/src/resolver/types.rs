//! Request and response types for the graph resolver.

use std::sync::Arc;
use std::time::Duration;

/// Request for a permission check.
#[derive(Debug, Clone)]
pub struct CheckRequest {
    /// The store ID to check against.
    pub store_id: String,
    /// Model id to evaluate under; the store's latest model when unset.
    pub authorization_model_id: Option<String>,
    /// The user identifier (e.g., "user:anne" or "group:eng#member").
    pub user: String,
    /// The relation to check (e.g., "viewer").
    pub relation: String,
    /// The object identifier (e.g., "document:readme").
    pub object: String,
    /// Request-scoped tuples merged with stored tuples for this check.
    /// Wrapped in Arc for cheap cloning during graph traversal.
    pub contextual_tuples: Arc<Vec<ContextualTuple>>,
}

impl CheckRequest {
    /// Creates a new CheckRequest against the store's latest model.
    pub fn new(
        store_id: impl Into<String>,
        user: impl Into<String>,
        relation: impl Into<String>,
        object: impl Into<String>,
        contextual_tuples: Vec<ContextualTuple>,
    ) -> Self {
        Self {
            store_id: store_id.into(),
            authorization_model_id: None,
            user: user.into(),
            relation: relation.into(),
            object: object.into(),
            contextual_tuples: Arc::new(contextual_tuples),
        }
    }
}

/// A request-scoped tuple considered alongside stored tuples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextualTuple {
    pub user: String,
    pub relation: String,
    pub object: String,
}

impl ContextualTuple {
    pub fn new(
        user: impl Into<String>,
        relation: impl Into<String>,
        object: impl Into<String>,
    ) -> Self {
        Self {
            user: user.into(),
            relation: relation.into(),
            object: object.into(),
        }
    }
}

/// Bookkeeping about how a check was resolved.
#[derive(Debug, Clone, Default)]
pub struct ResolutionMetadata {
    /// Number of datastore reads the query issued.
    pub datastore_query_count: u64,
}

/// Result of a permission check.
#[derive(Debug, Clone)]
pub struct CheckResult {
    /// Whether the check is allowed.
    pub allowed: bool,
    /// Resolution bookkeeping.
    pub resolution: ResolutionMetadata,
}

/// Reference to a stored tuple for resolver use.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoredTupleRef {
    pub user_type: String,
    pub user_id: String,
    pub user_relation: Option<String>,
}

impl StoredTupleRef {
    pub fn new(
        user_type: impl Into<String>,
        user_id: impl Into<String>,
        user_relation: Option<String>,
    ) -> Self {
        Self {
            user_type: user_type.into(),
            user_id: user_id.into(),
            user_relation,
        }
    }

    /// Returns true if the tuple's user is a userset reference.
    pub fn is_userset(&self) -> bool {
        self.user_relation.is_some()
    }

    /// Returns true if the tuple's user is a type wildcard.
    pub fn is_wildcard(&self) -> bool {
        self.user_id == "*"
    }

    /// Formats the user as "type:id", "type:id#relation" or "type:*".
    pub fn user_string(&self) -> String {
        match &self.user_relation {
            Some(rel) => format!("{}:{}#{}", self.user_type, self.user_id, rel),
            None => format!("{}:{}", self.user_type, self.user_id),
        }
    }
}

// ============================================================
// Expand API Types
// ============================================================

/// Request for expanding a relation into a usertree.
#[derive(Debug, Clone)]
pub struct ExpandRequest {
    /// The store ID to expand against.
    pub store_id: String,
    /// Model id to evaluate under; the store's latest model when unset.
    pub authorization_model_id: Option<String>,
    /// The relation to expand (e.g., "viewer").
    pub relation: String,
    /// The object to expand (e.g., "document:readme").
    pub object: String,
}

impl ExpandRequest {
    pub fn new(
        store_id: impl Into<String>,
        relation: impl Into<String>,
        object: impl Into<String>,
    ) -> Self {
        Self {
            store_id: store_id.into(),
            authorization_model_id: None,
            relation: relation.into(),
            object: object.into(),
        }
    }
}

/// Result of expanding a relation.
#[derive(Debug, Clone)]
pub struct ExpandResult {
    /// The expansion tree showing why users hold (or may hold) the relation.
    pub tree: UsersetTree,
}

/// A tree mirroring the relation's rewrite, one level deep.
#[derive(Debug, Clone)]
pub struct UsersetTree {
    /// The root node of the expansion tree.
    pub root: ExpandNode,
}

/// A node in the expansion tree.
#[derive(Debug, Clone)]
pub enum ExpandNode {
    /// A leaf node: direct users or a userset indirection.
    Leaf(ExpandLeaf),
    /// A union of child nodes (any child grants access).
    Union {
        /// The userset this node expands (e.g., "document:1#viewer").
        name: String,
        /// Child nodes in the union.
        nodes: Vec<ExpandNode>,
    },
    /// An intersection of child nodes (all children must grant access).
    Intersection {
        name: String,
        nodes: Vec<ExpandNode>,
    },
    /// A difference of nodes (base minus subtract).
    Difference {
        name: String,
        base: Box<ExpandNode>,
        subtract: Box<ExpandNode>,
    },
}

impl ExpandNode {
    /// Returns the name of this node.
    pub fn name(&self) -> &str {
        match self {
            ExpandNode::Leaf(leaf) => &leaf.name,
            ExpandNode::Union { name, .. } => name,
            ExpandNode::Intersection { name, .. } => name,
            ExpandNode::Difference { name, .. } => name,
        }
    }
}

/// A leaf node in the expansion tree.
#[derive(Debug, Clone)]
pub struct ExpandLeaf {
    /// The userset this leaf expands.
    pub name: String,
    /// The leaf content.
    pub value: ExpandLeafValue,
}

/// The value of a leaf node.
#[derive(Debug, Clone)]
pub enum ExpandLeafValue {
    /// Directly assigned users.
    Users(Vec<String>),
    /// A reference to another userset; Expand does not recurse into it.
    Computed { userset: String },
}

// ============================================================
// ListObjects API Types
// ============================================================

/// Request for listing objects a user has a relation to.
#[derive(Debug, Clone)]
pub struct ListObjectsRequest {
    /// The store ID to query.
    pub store_id: String,
    /// Model id to evaluate under; the store's latest model when unset.
    pub authorization_model_id: Option<String>,
    /// The object type to enumerate (e.g., "document").
    pub object_type: String,
    /// The relation to check (e.g., "viewer").
    pub relation: String,
    /// The user to check permissions for.
    pub user: String,
    /// Request-scoped tuples merged with stored tuples.
    pub contextual_tuples: Arc<Vec<ContextualTuple>>,
    /// Deadline override; the resolver default applies when unset.
    pub deadline: Option<Duration>,
    /// Result-cap override; the resolver default applies when unset.
    pub max_results: Option<u32>,
}

impl ListObjectsRequest {
    pub fn new(
        store_id: impl Into<String>,
        object_type: impl Into<String>,
        relation: impl Into<String>,
        user: impl Into<String>,
    ) -> Self {
        Self {
            store_id: store_id.into(),
            authorization_model_id: None,
            object_type: object_type.into(),
            relation: relation.into(),
            user: user.into(),
            contextual_tuples: Arc::new(Vec::new()),
            deadline: None,
            max_results: None,
        }
    }

    /// Attaches contextual tuples to the request.
    pub fn with_contextual_tuples(mut self, tuples: Vec<ContextualTuple>) -> Self {
        self.contextual_tuples = Arc::new(tuples);
        self
    }
}

/// Result of listing objects.
#[derive(Debug, Clone)]
pub struct ListObjectsResult {
    /// Objects the user has the relation to, in "type:id" form.
    ///
    /// The result is partial (and still a success) when the deadline or the
    /// result cap stopped the enumeration.
    pub objects: Vec<String>,
}
