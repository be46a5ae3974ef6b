//! Type system for authorization model validation and introspection.
//!
//! The `TypeSystem` compiles an [`AuthorizationModel`] into a queryable view:
//! relation lookups, direct-assignment restrictions, and the precomputed
//! intersection/exclusion flags the evaluators use to pick their strategy.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::{DomainError, DomainResult};

use super::types::{
    is_valid_identifier, AuthorizationModel, Object, RelationDefinition, RelationReference, Tuple,
    TypeDefinition, UserRef, Userset,
};

/// Which rewrite operator a transitive reachability walk is looking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OperatorKind {
    Intersection,
    Exclusion,
}

/// Type system providing cached access to an authorization model.
///
/// # Thread Safety
///
/// The `TypeSystem` is thread-safe and intended to be shared across async
/// tasks as `Arc<TypeSystem>`. Lookup caches use `DashMap` for lock-free
/// concurrent reads.
#[derive(Debug)]
pub struct TypeSystem {
    /// The underlying authorization model.
    model: Arc<AuthorizationModel>,
    /// Cache for type definitions, keyed by type name.
    type_cache: DashMap<String, Arc<TypeDefinition>>,
    /// Cache for relation definitions, keyed by "type_name:relation_name".
    relation_cache: DashMap<String, Arc<RelationDefinition>>,
    /// Relations whose evaluation transitively involves an intersection.
    intersection_flags: HashMap<(String, String), bool>,
    /// Relations whose evaluation transitively involves an exclusion.
    exclusion_flags: HashMap<(String, String), bool>,
}

impl TypeSystem {
    /// Creates a new `TypeSystem` from an authorization model.
    ///
    /// The intersection/exclusion flags are precomputed here; relation and
    /// type lookups are cached lazily as they are accessed.
    pub fn new(model: AuthorizationModel) -> Self {
        let model = Arc::new(model);
        let mut intersection_flags = HashMap::new();
        let mut exclusion_flags = HashMap::new();

        for type_def in &model.type_definitions {
            for relation_def in &type_def.relations {
                let key = (type_def.type_name.clone(), relation_def.name.clone());
                let mut visited = HashSet::new();
                intersection_flags.insert(
                    key.clone(),
                    relation_involves(
                        &model,
                        &type_def.type_name,
                        &relation_def.name,
                        OperatorKind::Intersection,
                        &mut visited,
                    ),
                );
                let mut visited = HashSet::new();
                exclusion_flags.insert(
                    key,
                    relation_involves(
                        &model,
                        &type_def.type_name,
                        &relation_def.name,
                        OperatorKind::Exclusion,
                        &mut visited,
                    ),
                );
            }
        }

        Self {
            model,
            type_cache: DashMap::new(),
            relation_cache: DashMap::new(),
            intersection_flags,
            exclusion_flags,
        }
    }

    /// Returns a reference to the underlying authorization model.
    pub fn model(&self) -> &AuthorizationModel {
        &self.model
    }

    /// Gets a type definition by name, using the cache if available.
    pub fn get_type(&self, type_name: &str) -> DomainResult<Arc<TypeDefinition>> {
        if let Some(cached) = self.type_cache.get(type_name) {
            return Ok(Arc::clone(cached.value()));
        }

        let type_def = self
            .model
            .find_type_definition(type_name)
            .ok_or_else(|| DomainError::TypeNotFound {
                type_name: type_name.to_string(),
            })?;

        let type_def_arc = Arc::new(type_def.clone());
        self.type_cache
            .insert(type_name.to_string(), Arc::clone(&type_def_arc));
        Ok(type_def_arc)
    }

    /// Gets a relation definition for a specific type.
    pub fn get_relation(
        &self,
        type_name: &str,
        relation: &str,
    ) -> DomainResult<Arc<RelationDefinition>> {
        let cache_key = format!("{type_name}:{relation}");

        if let Some(cached) = self.relation_cache.get(&cache_key) {
            return Ok(Arc::clone(cached.value()));
        }

        let type_def = self.get_type(type_name)?;

        let relation_def = type_def
            .relations
            .iter()
            .find(|r| r.name == relation)
            .ok_or_else(|| DomainError::RelationNotFound {
                type_name: type_name.to_string(),
                relation: relation.to_string(),
            })?;

        let relation_def_arc = Arc::new(relation_def.clone());
        self.relation_cache
            .insert(cache_key, Arc::clone(&relation_def_arc));
        Ok(relation_def_arc)
    }

    /// Checks if a type exists in the model.
    pub fn has_type(&self, type_name: &str) -> bool {
        self.get_type(type_name).is_ok()
    }

    /// Checks if a relation exists on a type.
    pub fn has_relation(&self, type_name: &str, relation: &str) -> bool {
        self.get_relation(type_name, relation).is_ok()
    }

    /// Returns the user types that may be directly assigned to a relation.
    pub fn get_directly_related_user_types(
        &self,
        type_name: &str,
        relation: &str,
    ) -> DomainResult<Vec<RelationReference>> {
        Ok(self
            .get_relation(type_name, relation)?
            .directly_related_user_types
            .clone())
    }

    /// Returns true if the relation accepts a type wildcard assignment.
    pub fn is_publicly_assignable(&self, type_name: &str, relation: &str) -> DomainResult<bool> {
        Ok(self
            .get_relation(type_name, relation)?
            .directly_related_user_types
            .iter()
            .any(|r| matches!(r, RelationReference::Wildcard(_))))
    }

    /// Returns true if the relation accepts wildcard assignments of `user_type`.
    pub fn is_wildcard_allowed(
        &self,
        type_name: &str,
        relation: &str,
        user_type: &str,
    ) -> DomainResult<bool> {
        Ok(self
            .get_relation(type_name, relation)?
            .directly_related_user_types
            .iter()
            .any(|r| matches!(r, RelationReference::Wildcard(t) if t == user_type)))
    }

    /// Returns true if evaluating the relation transitively reaches an
    /// intersection operator.
    pub fn relation_involves_intersection(
        &self,
        type_name: &str,
        relation: &str,
    ) -> DomainResult<bool> {
        self.get_relation(type_name, relation)?;
        Ok(*self
            .intersection_flags
            .get(&(type_name.to_string(), relation.to_string()))
            .unwrap_or(&false))
    }

    /// Returns true if evaluating the relation transitively reaches an
    /// exclusion (difference) operator.
    pub fn relation_involves_exclusion(
        &self,
        type_name: &str,
        relation: &str,
    ) -> DomainResult<bool> {
        self.get_relation(type_name, relation)?;
        Ok(*self
            .exclusion_flags
            .get(&(type_name.to_string(), relation.to_string()))
            .unwrap_or(&false))
    }

    /// Validates the authorization model.
    ///
    /// Enforces:
    /// - type and relation names match the identifier grammar, no duplicates
    /// - every referenced relation exists on the correct type
    /// - every `This` rewrite carries non-empty type restrictions, and each
    ///   restriction names an existing type (and relation, for usersets)
    /// - tupleset relations resolve only to plain object types, and the
    ///   computed relation exists on each of those types
    /// - no cycle of pure computed-userset edges within a single type
    pub fn validate(&self) -> DomainResult<()> {
        let mut errors = Vec::new();
        let mut seen_types = HashSet::new();

        for type_def in &self.model.type_definitions {
            if !is_valid_identifier(&type_def.type_name) {
                errors.push(format!("invalid type name '{}'", type_def.type_name));
                continue;
            }
            if !seen_types.insert(type_def.type_name.as_str()) {
                errors.push(format!("duplicate type '{}'", type_def.type_name));
                continue;
            }

            let mut seen_relations = HashSet::new();
            for relation_def in &type_def.relations {
                if !is_valid_identifier(&relation_def.name) {
                    errors.push(format!(
                        "type '{}': invalid relation name '{}'",
                        type_def.type_name, relation_def.name
                    ));
                    continue;
                }
                if !seen_relations.insert(relation_def.name.as_str()) {
                    errors.push(format!(
                        "type '{}': duplicate relation '{}'",
                        type_def.type_name, relation_def.name
                    ));
                    continue;
                }

                self.validate_userset(
                    &type_def.type_name,
                    relation_def,
                    &relation_def.rewrite,
                    &mut errors,
                );
            }

            self.validate_no_computed_cycles(type_def, &mut errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(DomainError::InvalidAuthorizationModel {
                message: errors.join("; "),
            })
        }
    }

    /// Validates a single rewrite node, recursing into set operators.
    fn validate_userset(
        &self,
        type_name: &str,
        relation_def: &RelationDefinition,
        userset: &Userset,
        errors: &mut Vec<String>,
    ) {
        match userset {
            Userset::This => {
                if relation_def.directly_related_user_types.is_empty() {
                    errors.push(format!(
                        "type '{}' relation '{}': directly assignable relation requires at least one user type",
                        type_name, relation_def.name
                    ));
                }
                for restriction in &relation_def.directly_related_user_types {
                    match restriction {
                        RelationReference::Direct(t) | RelationReference::Wildcard(t) => {
                            if !self.has_type(t) {
                                errors.push(format!(
                                    "type '{}' relation '{}': restriction references non-existent type '{}'",
                                    type_name, relation_def.name, t
                                ));
                            }
                        }
                        RelationReference::Userset { r#type, relation } => {
                            if !self.has_type(r#type) {
                                errors.push(format!(
                                    "type '{}' relation '{}': restriction references non-existent type '{}'",
                                    type_name, relation_def.name, r#type
                                ));
                            } else if !self.has_relation(r#type, relation) {
                                errors.push(format!(
                                    "type '{}' relation '{}': restriction references non-existent relation '{}#{}'",
                                    type_name, relation_def.name, r#type, relation
                                ));
                            }
                        }
                    }
                }
            }
            Userset::ComputedUserset { relation } => {
                if !self.has_relation(type_name, relation) {
                    errors.push(format!(
                        "type '{}' relation '{}': computed userset references non-existent relation '{}'",
                        type_name, relation_def.name, relation
                    ));
                }
            }
            Userset::TupleToUserset {
                tupleset,
                computed_userset,
            } => {
                let Ok(tupleset_def) = self.get_relation(type_name, tupleset) else {
                    errors.push(format!(
                        "type '{}' relation '{}': tupleset references non-existent relation '{}'",
                        type_name, relation_def.name, tupleset
                    ));
                    return;
                };

                // The tupleset must resolve only to plain objects: userset or
                // wildcard restrictions cannot name a parent object.
                for restriction in &tupleset_def.directly_related_user_types {
                    match restriction {
                        RelationReference::Direct(t) => {
                            if self.has_type(t) && !self.has_relation(t, computed_userset) {
                                errors.push(format!(
                                    "type '{}' relation '{}': computed relation '{}' does not exist on type '{}'",
                                    type_name, relation_def.name, computed_userset, t
                                ));
                            }
                        }
                        RelationReference::Userset { .. } | RelationReference::Wildcard(_) => {
                            errors.push(format!(
                                "type '{}' relation '{}': tupleset '{}' must be assignable only to objects",
                                type_name, relation_def.name, tupleset
                            ));
                        }
                    }
                }
            }
            Userset::Union { children } | Userset::Intersection { children } => {
                for child in children {
                    self.validate_userset(type_name, relation_def, child, errors);
                }
            }
            Userset::Difference { base, subtract } => {
                self.validate_userset(type_name, relation_def, base, errors);
                self.validate_userset(type_name, relation_def, subtract, errors);
            }
        }
    }

    /// Detects cycles of pure computed-userset edges within a type.
    ///
    /// `ComputedUserset(r)` creates an edge to `r`; set operators transmit
    /// edges from their children; `This` and `TupleToUserset` terminate edge
    /// propagation because their expansion depends on stored tuples.
    fn validate_no_computed_cycles(&self, type_def: &TypeDefinition, errors: &mut Vec<String>) {
        let mut done: HashSet<&str> = HashSet::new();

        for relation_def in &type_def.relations {
            if done.contains(relation_def.name.as_str()) {
                continue;
            }
            let mut on_path: Vec<&str> = Vec::new();
            if let Some(cycle_relation) =
                self.find_computed_cycle(type_def, &relation_def.name, &mut on_path, &mut done)
            {
                errors.push(format!("relation '{cycle_relation}' is a cycle"));
            }
        }
    }

    /// DFS helper; returns the relation name closing a cycle, if any.
    fn find_computed_cycle<'a>(
        &self,
        type_def: &'a TypeDefinition,
        relation: &'a str,
        on_path: &mut Vec<&'a str>,
        done: &mut HashSet<&'a str>,
    ) -> Option<String> {
        if on_path.contains(&relation) {
            return Some(relation.to_string());
        }
        if done.contains(relation) {
            return None;
        }

        let Some(relation_def) = type_def.relations.iter().find(|r| r.name == relation) else {
            // Dangling references are reported by validate_userset.
            return None;
        };

        on_path.push(relation);
        let found = Self::computed_edges(&relation_def.rewrite)
            .into_iter()
            .find_map(|next| self.find_computed_cycle(type_def, next, on_path, done));
        on_path.pop();
        done.insert(relation);
        found
    }

    /// Collects the computed-userset edges of a rewrite.
    fn computed_edges(userset: &Userset) -> Vec<&str> {
        match userset {
            Userset::This | Userset::TupleToUserset { .. } => Vec::new(),
            Userset::ComputedUserset { relation } => vec![relation.as_str()],
            Userset::Union { children } | Userset::Intersection { children } => children
                .iter()
                .flat_map(|c| Self::computed_edges(c))
                .collect(),
            Userset::Difference { base, subtract } => {
                let mut edges = Self::computed_edges(base);
                edges.extend(Self::computed_edges(subtract));
                edges
            }
        }
    }

    /// Validates a tuple against the model before it is written.
    ///
    /// Checks that the object type and relation exist, that the user parses,
    /// and that the user form is listed in the relation's restrictions:
    /// userset users `X:x#Y` require a `X#Y` restriction, wildcard users
    /// `t:*` require a `t:*` restriction, and plain object users require
    /// their type to be listed.
    pub fn validate_tuple(&self, tuple: &Tuple) -> DomainResult<()> {
        let object = Object::parse(&tuple.object).map_err(|e| DomainError::InvalidTuple {
            message: format!("invalid object '{}': {}", tuple.object, e),
        })?;

        if !is_valid_identifier(&tuple.relation) {
            return Err(DomainError::InvalidTuple {
                message: format!("invalid relation '{}'", tuple.relation),
            });
        }

        let relation_def = self.get_relation(&object.object_type, &tuple.relation)?;

        let user = UserRef::parse(&tuple.user).map_err(|e| DomainError::InvalidTuple {
            message: format!("invalid user '{}': {}", tuple.user, e),
        })?;

        if relation_def.directly_related_user_types.is_empty() {
            return Err(DomainError::InvalidTuple {
                message: format!(
                    "relation '{}' on type '{}' does not accept direct assignment",
                    tuple.relation, object.object_type
                ),
            });
        }

        let allowed = match &user {
            UserRef::Object(o) => {
                self.get_type(&o.object_type)?;
                relation_def
                    .directly_related_user_types
                    .iter()
                    .any(|r| matches!(r, RelationReference::Direct(t) if *t == o.object_type))
            }
            UserRef::Userset { object: o, relation } => {
                self.get_relation(&o.object_type, relation)?;
                relation_def.directly_related_user_types.iter().any(|r| {
                    matches!(
                        r,
                        RelationReference::Userset { r#type, relation: rel }
                            if *r#type == o.object_type && rel == relation
                    )
                })
            }
            UserRef::Wildcard { user_type } => {
                self.get_type(user_type)?;
                relation_def
                    .directly_related_user_types
                    .iter()
                    .any(|r| matches!(r, RelationReference::Wildcard(t) if t == user_type))
            }
        };

        if !allowed {
            return Err(DomainError::InvalidTuple {
                message: format!(
                    "user '{}' is not an allowed type for relation '{}' on type '{}'",
                    tuple.user, tuple.relation, object.object_type
                ),
            });
        }

        Ok(())
    }
}

/// Walks a relation's rewrite transitively, looking for an operator kind.
///
/// Traversal follows computed usersets on the same type, the computed
/// relation of tuple-to-userset on every type its tupleset may name, and the
/// userset restrictions of direct assignment.
fn relation_involves(
    model: &AuthorizationModel,
    type_name: &str,
    relation: &str,
    kind: OperatorKind,
    visited: &mut HashSet<(String, String)>,
) -> bool {
    if !visited.insert((type_name.to_string(), relation.to_string())) {
        return false;
    }
    let Some(relation_def) = model
        .find_type_definition(type_name)
        .and_then(|td| td.relations.iter().find(|r| r.name == relation))
    else {
        return false;
    };
    rewrite_involves(model, type_name, relation_def, &relation_def.rewrite, kind, visited)
}

fn rewrite_involves(
    model: &AuthorizationModel,
    type_name: &str,
    relation_def: &RelationDefinition,
    userset: &Userset,
    kind: OperatorKind,
    visited: &mut HashSet<(String, String)>,
) -> bool {
    match userset {
        Userset::This => relation_def
            .directly_related_user_types
            .iter()
            .any(|restriction| match restriction {
                RelationReference::Userset { r#type, relation } => {
                    relation_involves(model, r#type, relation, kind, visited)
                }
                _ => false,
            }),
        Userset::ComputedUserset { relation } => {
            relation_involves(model, type_name, relation, kind, visited)
        }
        Userset::TupleToUserset {
            tupleset,
            computed_userset,
        } => {
            let Some(tupleset_def) = model
                .find_type_definition(type_name)
                .and_then(|td| td.relations.iter().find(|r| r.name == *tupleset))
            else {
                return false;
            };
            tupleset_def
                .directly_related_user_types
                .iter()
                .any(|restriction| match restriction {
                    RelationReference::Direct(t) => {
                        relation_involves(model, t, computed_userset, kind, visited)
                    }
                    _ => false,
                })
        }
        Userset::Union { children } => children
            .iter()
            .any(|c| rewrite_involves(model, type_name, relation_def, c, kind, visited)),
        Userset::Intersection { children } => {
            kind == OperatorKind::Intersection
                || children
                    .iter()
                    .any(|c| rewrite_involves(model, type_name, relation_def, c, kind, visited))
        }
        Userset::Difference { base, subtract } => {
            kind == OperatorKind::Exclusion
                || rewrite_involves(model, type_name, relation_def, base, kind, visited)
                || rewrite_involves(model, type_name, relation_def, subtract, kind, visited)
        }
    }
}
