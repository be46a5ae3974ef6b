//! Core type definitions for the authorization model.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Returns true if `s` is a valid type or relation identifier.
///
/// The grammar is `[A-Za-z_][A-Za-z0-9_-]*`.
pub fn is_valid_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// An object identifier (e.g., "document:readme").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Object {
    /// The type portion (e.g., "document").
    pub object_type: String,
    /// The ID portion (e.g., "readme").
    pub object_id: String,
}

impl Object {
    /// Creates a new Object from type and ID.
    pub fn new(object_type: impl Into<String>, object_id: impl Into<String>) -> Self {
        Self {
            object_type: object_type.into(),
            object_id: object_id.into(),
        }
    }

    /// Parses an object from "type:id" format.
    ///
    /// The type must match the identifier grammar; the id is any non-empty
    /// string without `#` or `:`.
    pub fn parse(value: &str) -> Result<Self, &'static str> {
        let (object_type, object_id) = value
            .split_once(':')
            .ok_or("object must be in 'type:id' format")?;
        if !is_valid_identifier(object_type) {
            return Err("object type must match [A-Za-z_][A-Za-z0-9_-]*");
        }
        if object_id.is_empty() {
            return Err("object id cannot be empty");
        }
        if object_id.contains(':') || object_id.contains('#') {
            return Err("object id cannot contain ':' or '#'");
        }
        Ok(Self::new(object_type, object_id))
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.object_type, self.object_id)
    }
}

/// A user reference: a concrete object, a userset, or a type wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UserRef {
    /// A concrete object (e.g., "user:anne").
    Object(Object),
    /// A userset (e.g., "group:eng#member").
    Userset { object: Object, relation: String },
    /// All users of a type (e.g., "user:*").
    Wildcard { user_type: String },
}

impl UserRef {
    /// Parses a user from "type:id", "type:id#relation" or "type:*" format.
    pub fn parse(value: &str) -> Result<Self, &'static str> {
        if let Some((object_part, relation)) = value.split_once('#') {
            if !is_valid_identifier(relation) {
                return Err("userset relation must match [A-Za-z_][A-Za-z0-9_-]*");
            }
            let object = Object::parse(object_part)?;
            return Ok(Self::Userset {
                object,
                relation: relation.to_string(),
            });
        }
        if let Some(user_type) = value.strip_suffix(":*") {
            if !is_valid_identifier(user_type) {
                return Err("wildcard type must match [A-Za-z_][A-Za-z0-9_-]*");
            }
            return Ok(Self::Wildcard {
                user_type: user_type.to_string(),
            });
        }
        Ok(Self::Object(Object::parse(value)?))
    }

    /// Returns the type portion of the user.
    pub fn user_type(&self) -> &str {
        match self {
            Self::Object(o) => &o.object_type,
            Self::Userset { object, .. } => &object.object_type,
            Self::Wildcard { user_type } => user_type,
        }
    }

    /// Returns true if this user is a type wildcard.
    pub fn is_wildcard(&self) -> bool {
        matches!(self, Self::Wildcard { .. })
    }
}

impl fmt::Display for UserRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Object(o) => write!(f, "{o}"),
            Self::Userset { object, relation } => write!(f, "{object}#{relation}"),
            Self::Wildcard { user_type } => write!(f, "{user_type}:*"),
        }
    }
}

/// A stored fact: `user` holds `relation` on `object`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tuple {
    /// The user (subject) of the relationship.
    pub user: String,
    /// The relation between user and object.
    pub relation: String,
    /// The object of the relationship.
    pub object: String,
}

impl Tuple {
    /// Creates a new Tuple.
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

/// A type restriction on the directly assignable users of a relation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationReference {
    /// Any object of the given type (e.g., `user`).
    Direct(String),
    /// A userset on the given type (e.g., `group#member`).
    Userset { r#type: String, relation: String },
    /// The type wildcard (e.g., `user:*`).
    Wildcard(String),
}

impl RelationReference {
    /// Parses a restriction from "type", "type#relation" or "type:*" form.
    pub fn parse(value: &str) -> Result<Self, &'static str> {
        if let Some((type_name, relation)) = value.split_once('#') {
            if !is_valid_identifier(type_name) || !is_valid_identifier(relation) {
                return Err("restriction must match 'type', 'type#relation' or 'type:*'");
            }
            return Ok(Self::Userset {
                r#type: type_name.to_string(),
                relation: relation.to_string(),
            });
        }
        if let Some(type_name) = value.strip_suffix(":*") {
            if !is_valid_identifier(type_name) {
                return Err("restriction must match 'type', 'type#relation' or 'type:*'");
            }
            return Ok(Self::Wildcard(type_name.to_string()));
        }
        if !is_valid_identifier(value) {
            return Err("restriction must match 'type', 'type#relation' or 'type:*'");
        }
        Ok(Self::Direct(value.to_string()))
    }

    /// Returns the type portion of the restriction.
    pub fn type_name(&self) -> &str {
        match self {
            Self::Direct(t) | Self::Wildcard(t) => t,
            Self::Userset { r#type, .. } => r#type,
        }
    }
}

impl fmt::Display for RelationReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct(t) => write!(f, "{t}"),
            Self::Userset { r#type, relation } => write!(f, "{}#{}", r#type, relation),
            Self::Wildcard(t) => write!(f, "{t}:*"),
        }
    }
}

/// A userset rewrite defines how a relation is computed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Userset {
    /// Directly assigned tuples.
    This,
    /// Rewrite to another relation on the same object.
    ComputedUserset { relation: String },
    /// For each tuple `(obj, tupleset, X)`, expand `X#computed_userset`.
    TupleToUserset {
        tupleset: String,
        computed_userset: String,
    },
    /// Union of multiple usersets.
    Union { children: Vec<Userset> },
    /// Intersection of multiple usersets.
    Intersection { children: Vec<Userset> },
    /// Difference (base minus subtract).
    Difference {
        base: Box<Userset>,
        subtract: Box<Userset>,
    },
}

/// A relation definition on a type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationDefinition {
    /// The relation name.
    pub name: String,
    /// The userset rewrite for this relation.
    pub rewrite: Userset,
    /// The user types that may be directly assigned to this relation.
    ///
    /// Required to be non-empty wherever the rewrite contains `This`.
    #[serde(default)]
    pub directly_related_user_types: Vec<RelationReference>,
}

/// A type definition within the authorization model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDefinition {
    /// The type name (e.g., "document", "folder").
    pub type_name: String,
    /// Relations defined on this type.
    pub relations: Vec<RelationDefinition>,
}

/// An authorization model: an immutable set of type definitions.
///
/// Models are identified by a monotonic lexicographic id; the id is assigned
/// when the model is written, so a freshly parsed model carries an empty id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationModel {
    /// Model id (ULID). Empty until the model is persisted.
    #[serde(default)]
    pub id: String,
    /// Schema version (e.g., "1.1").
    pub schema_version: String,
    /// Type definitions in the model.
    pub type_definitions: Vec<TypeDefinition>,
}

impl AuthorizationModel {
    /// Creates an empty model with the given schema version.
    pub fn new(schema_version: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            schema_version: schema_version.into(),
            type_definitions: Vec::new(),
        }
    }

    /// Creates a model with the given schema version and type definitions.
    pub fn with_types(
        schema_version: impl Into<String>,
        type_definitions: Vec<TypeDefinition>,
    ) -> Self {
        Self {
            id: String::new(),
            schema_version: schema_version.into(),
            type_definitions,
        }
    }

    /// Finds a type definition by name.
    pub fn find_type_definition(&self, type_name: &str) -> Option<&TypeDefinition> {
        self.type_definitions
            .iter()
            .find(|td| td.type_name == type_name)
    }
}
