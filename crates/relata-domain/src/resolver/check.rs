//! Graph resolver: the Check evaluator.
//!
//! The resolver performs async graph traversal over a relation's rewrite to
//! decide whether a user holds the relation on an object.
//!
//! - **Parallel execution**: union, intersection and the direct-userset
//!   fan-out evaluate branches with `FuturesUnordered` and short-circuit;
//!   losing siblings are dropped, which cancels their pending reads.
//! - **Cycle handling**: a path-scoped visited set (copy-on-write
//!   `Arc<HashSet>`) detects re-entry; a revisited node resolves to
//!   not-allowed rather than erroring, so cyclic data terminates cleanly.
//! - **Depth limiting**: traversal deeper than `max_depth` fails the query
//!   with `ResolutionTooComplex`; sub-checks already resolved elsewhere in
//!   the query are served from the dedup map regardless of path depth.
//! - **Sub-check dedup**: identical `(object, relation, user)` sub-checks
//!   fanned out from different branches share completed results through the
//!   query-scoped map in [`ResolutionContext`]. Results that depended on a
//!   cycle cut are valid for their own path but not for others, so they are
//!   never published (see [`Outcome`]).

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::time::timeout;

use crate::error::{DomainError, DomainResult};
use crate::model::{RelationReference, TypeSystem, UserRef, Userset};

use super::config::ResolverConfig;
use super::context::ResolutionContext;
use super::traits::{ModelReader, TupleReader};
use super::types::{CheckRequest, CheckResult, ResolutionMetadata, StoredTupleRef};

/// Type alias for boxed future to handle async recursion.
pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Internal evaluation outcome.
///
/// `tainted` marks a result that depended on a cycle cut somewhere below
/// it. Such a result is correct for the path that produced it, but another
/// path may reach the same node without the cycle, so tainted results are
/// never memoized.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Outcome {
    pub(crate) allowed: bool,
    tainted: bool,
}

impl Outcome {
    fn decided(allowed: bool) -> Self {
        Self {
            allowed,
            tainted: false,
        }
    }

    fn cycle() -> Self {
        Self {
            allowed: false,
            tainted: true,
        }
    }

    fn denied(tainted: bool) -> Self {
        Self {
            allowed: false,
            tainted,
        }
    }
}

/// Graph resolver for Check, Expand and ListObjects queries.
pub struct GraphResolver<T, M> {
    pub(crate) tuple_reader: Arc<T>,
    pub(crate) model_reader: Arc<M>,
    pub(crate) config: ResolverConfig,
}

impl<T, M> GraphResolver<T, M>
where
    T: TupleReader + 'static,
    M: ModelReader + 'static,
{
    /// Creates a new graph resolver with the default configuration.
    pub fn new(tuple_reader: Arc<T>, model_reader: Arc<M>) -> Self {
        Self {
            tuple_reader,
            model_reader,
            config: ResolverConfig::default(),
        }
    }

    /// Creates a new graph resolver with custom configuration.
    pub fn with_config(tuple_reader: Arc<T>, model_reader: Arc<M>, config: ResolverConfig) -> Self {
        Self {
            tuple_reader,
            model_reader,
            config,
        }
    }

    /// Returns the resolver configuration.
    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Performs a permission check.
    #[tracing::instrument(skip(self, request), fields(
        store_id = %request.store_id,
        object = %request.object,
        relation = %request.relation,
        user = %request.user,
    ))]
    pub async fn check(&self, request: &CheckRequest) -> DomainResult<CheckResult> {
        self.validate_check_request(request)?;

        if !self.tuple_reader.store_exists(&request.store_id).await? {
            return Err(DomainError::StoreNotFound {
                store_id: request.store_id.clone(),
            });
        }

        let ctx = ResolutionContext::new(self.config.fan_out_limit);
        let check_future = self.resolve_check(request.clone(), ctx.clone());

        match timeout(self.config.timeout, check_future).await {
            Ok(result) => result.map(|outcome| CheckResult {
                allowed: outcome.allowed,
                resolution: ResolutionMetadata {
                    datastore_query_count: ctx.datastore_reads(),
                },
            }),
            Err(_) => Err(DomainError::DeadlineExceeded {
                duration_ms: self.config.timeout.as_millis() as u64,
            }),
        }
    }

    /// Validates the check request shape.
    fn validate_check_request(&self, request: &CheckRequest) -> DomainResult<()> {
        if request.store_id.is_empty() {
            return Err(DomainError::ValidationError {
                message: "store_id is required".to_string(),
            });
        }

        let user = UserRef::parse(&request.user).map_err(|_| DomainError::InvalidUserFormat {
            value: request.user.clone(),
        })?;
        // A check for "every user of a type" is not a meaningful question;
        // wildcards are only valid in stored tuples.
        if user.is_wildcard() {
            return Err(DomainError::InvalidUserFormat {
                value: request.user.clone(),
            });
        }

        crate::model::Object::parse(&request.object).map_err(|_| {
            DomainError::InvalidObjectFormat {
                value: request.object.clone(),
            }
        })?;

        if !crate::model::is_valid_identifier(&request.relation) {
            return Err(DomainError::InvalidRelationFormat {
                value: request.relation.clone(),
            });
        }

        Ok(())
    }

    /// Internal check resolution with traversal context (boxed for recursion).
    pub(crate) fn resolve_check(
        &self,
        request: CheckRequest,
        ctx: ResolutionContext,
    ) -> BoxFuture<'_, DomainResult<Outcome>> {
        Box::pin(async move {
            let key = format!("{}#{}@{}", request.object, request.relation, request.user);

            // A result another branch already published needs no further
            // resolution work, so it short-circuits even a path that has
            // exhausted its depth budget.
            if let Some(allowed) = ctx.completed_subcheck(&key) {
                return Ok(Outcome::decided(allowed));
            }

            if ctx.depth >= self.config.max_depth {
                return Err(DomainError::ResolutionTooComplex {
                    max_depth: self.config.max_depth,
                });
            }

            // Re-entering a node already on this path means the decision for
            // it is circular; a cycle contributes nothing.
            if ctx.visited.contains(&key) {
                return Ok(Outcome::cycle());
            }

            let type_system = self
                .model_reader
                .get_type_system(&request.store_id, request.authorization_model_id.as_deref())
                .await?;

            let (object_type, object_id) = parse_object(&request.object)?;
            let relation_def = type_system.get_relation(&object_type, &request.relation)?;

            let ctx = ctx.with_visited(&key);
            let outcome = self
                .resolve_userset(
                    request,
                    relation_def.rewrite.clone(),
                    Arc::clone(&type_system),
                    object_type,
                    object_id,
                    ctx.clone(),
                )
                .await?;

            if !outcome.tainted {
                ctx.publish_subcheck(key, outcome.allowed);
            }
            Ok(outcome)
        })
    }

    /// Resolves a userset rewrite (boxed for recursion).
    #[allow(clippy::too_many_arguments)]
    fn resolve_userset(
        &self,
        request: CheckRequest,
        userset: Userset,
        type_system: Arc<TypeSystem>,
        object_type: String,
        object_id: String,
        ctx: ResolutionContext,
    ) -> BoxFuture<'_, DomainResult<Outcome>> {
        Box::pin(async move {
            match userset {
                Userset::This => {
                    self.resolve_direct(request, type_system, object_type, object_id, ctx)
                        .await
                }

                Userset::ComputedUserset { relation } => {
                    // Check another relation on the same object.
                    let new_request = CheckRequest {
                        relation,
                        ..request
                    };
                    self.resolve_check(new_request, ctx.increment_depth()).await
                }

                Userset::TupleToUserset {
                    tupleset,
                    computed_userset,
                } => {
                    self.resolve_tuple_to_userset(
                        request,
                        &tupleset,
                        &computed_userset,
                        &object_type,
                        &object_id,
                        ctx,
                    )
                    .await
                }

                Userset::Union { children } => {
                    self.resolve_union(request, children, type_system, object_type, object_id, ctx)
                        .await
                }

                Userset::Intersection { children } => {
                    self.resolve_intersection(
                        request,
                        children,
                        type_system,
                        object_type,
                        object_id,
                        ctx,
                    )
                    .await
                }

                Userset::Difference { base, subtract } => {
                    self.resolve_difference(
                        request,
                        *base,
                        *subtract,
                        type_system,
                        object_type,
                        object_id,
                        ctx,
                    )
                    .await
                }
            }
        })
    }

    /// Resolves a direct assignment: point lookup, wildcard lookups, then a
    /// concurrent fan-out through userset tuples.
    fn resolve_direct(
        &self,
        request: CheckRequest,
        type_system: Arc<TypeSystem>,
        object_type: String,
        object_id: String,
        ctx: ResolutionContext,
    ) -> BoxFuture<'_, DomainResult<Outcome>> {
        Box::pin(async move {
            let restrictions =
                type_system.get_directly_related_user_types(&object_type, &request.relation)?;
            let user_type = user_type_of(&request.user);

            // Contextual tuples first: direct and wildcard matches.
            for ct in request.contextual_tuples.iter() {
                if ct.object != request.object || ct.relation != request.relation {
                    continue;
                }
                if ct.user == request.user {
                    return Ok(Outcome::decided(true));
                }
                if let Some(wildcard_type) = ct.user.strip_suffix(":*") {
                    if wildcard_type == user_type
                        && wildcard_allowed(&restrictions, wildcard_type)
                    {
                        return Ok(Outcome::decided(true));
                    }
                }
            }

            // (a) exact stored tuple
            let found = {
                let _permit = ctx.read_permit().await?;
                self.tuple_reader
                    .read_user_tuple(
                        &request.store_id,
                        &object_type,
                        &object_id,
                        &request.relation,
                        &request.user,
                    )
                    .await?
            };
            if found {
                return Ok(Outcome::decided(true));
            }

            // (b) wildcard tuples, one lookup per wildcard-capable restriction
            // of the user's type
            for restriction in &restrictions {
                let RelationReference::Wildcard(t) = restriction else {
                    continue;
                };
                if t != user_type {
                    continue;
                }
                let found = {
                    let _permit = ctx.read_permit().await?;
                    self.tuple_reader
                        .read_user_tuple(
                            &request.store_id,
                            &object_type,
                            &object_id,
                            &request.relation,
                            &format!("{t}:*"),
                        )
                        .await?
                };
                if found {
                    return Ok(Outcome::decided(true));
                }
            }

            // (c) userset tuples: recurse into each allowed userset
            let stored = {
                let _permit = ctx.read_permit().await?;
                self.tuple_reader
                    .read_userset_tuples(
                        &request.store_id,
                        &object_type,
                        &object_id,
                        &request.relation,
                    )
                    .await?
            };

            let mut seen: HashSet<String> = HashSet::new();
            let mut sub_requests: Vec<CheckRequest> = Vec::new();

            for tuple in stored.iter().filter(|t| t.is_userset()) {
                if !userset_allowed(&restrictions, tuple) {
                    continue;
                }
                if !seen.insert(tuple.user_string()) {
                    continue;
                }
                sub_requests.push(CheckRequest {
                    store_id: request.store_id.clone(),
                    authorization_model_id: request.authorization_model_id.clone(),
                    user: request.user.clone(),
                    relation: tuple.user_relation.clone().unwrap_or_default(),
                    object: format!("{}:{}", tuple.user_type, tuple.user_id),
                    contextual_tuples: request.contextual_tuples.clone(),
                });
            }

            for ct in request.contextual_tuples.iter() {
                if ct.object != request.object || ct.relation != request.relation {
                    continue;
                }
                let Some((user_object, user_relation)) = ct.user.split_once('#') else {
                    continue;
                };
                if let Some(tuple) = userset_ref(user_object, user_relation) {
                    if !userset_allowed(&restrictions, &tuple) {
                        continue;
                    }
                    if !seen.insert(ct.user.clone()) {
                        continue;
                    }
                    sub_requests.push(CheckRequest {
                        store_id: request.store_id.clone(),
                        authorization_model_id: request.authorization_model_id.clone(),
                        user: request.user.clone(),
                        relation: user_relation.to_string(),
                        object: user_object.to_string(),
                        contextual_tuples: request.contextual_tuples.clone(),
                    });
                }
            }

            if sub_requests.is_empty() {
                return Ok(Outcome::decided(false));
            }

            let new_ctx = ctx.increment_depth();
            let futures: FuturesUnordered<_> = sub_requests
                .into_iter()
                .map(|sub| self.resolve_check(sub, new_ctx.clone()))
                .collect();

            any_allows(futures).await
        })
    }

    /// Resolves a tuple-to-userset: for each tupleset tuple naming a parent
    /// object, check the computed relation on that parent.
    ///
    /// Tupleset tuples whose user is a userset or a wildcard are skipped
    /// silently: only plain objects can name a parent.
    async fn resolve_tuple_to_userset(
        &self,
        request: CheckRequest,
        tupleset: &str,
        computed_userset: &str,
        object_type: &str,
        object_id: &str,
        ctx: ResolutionContext,
    ) -> DomainResult<Outcome> {
        let stored = {
            let _permit = ctx.read_permit().await?;
            self.tuple_reader
                .read_relation_tuples(&request.store_id, object_type, object_id, tupleset)
                .await?
        };

        let mut parents: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for tuple in &stored {
            if tuple.is_userset() || tuple.is_wildcard() {
                continue;
            }
            let parent = format!("{}:{}", tuple.user_type, tuple.user_id);
            if seen.insert(parent.clone()) {
                parents.push(parent);
            }
        }

        for ct in request.contextual_tuples.iter() {
            if ct.object != request.object || ct.relation != tupleset {
                continue;
            }
            if ct.user.contains('#') || ct.user.ends_with(":*") {
                continue;
            }
            if seen.insert(ct.user.clone()) {
                parents.push(ct.user.clone());
            }
        }

        if parents.is_empty() {
            return Ok(Outcome::decided(false));
        }

        let new_ctx = ctx.increment_depth();
        let futures: FuturesUnordered<_> = parents
            .into_iter()
            .map(|parent| {
                let sub = CheckRequest {
                    store_id: request.store_id.clone(),
                    authorization_model_id: request.authorization_model_id.clone(),
                    user: request.user.clone(),
                    relation: computed_userset.to_string(),
                    object: parent,
                    contextual_tuples: request.contextual_tuples.clone(),
                };
                self.resolve_check(sub, new_ctx.clone())
            })
            .collect();

        any_allows(futures).await
    }

    /// Resolves a union of usersets (any child must be true).
    ///
    /// Children evaluate in parallel via `FuturesUnordered` and the first
    /// allow short-circuits; remaining siblings are dropped.
    #[allow(clippy::too_many_arguments)]
    async fn resolve_union(
        &self,
        request: CheckRequest,
        children: Vec<Userset>,
        type_system: Arc<TypeSystem>,
        object_type: String,
        object_id: String,
        ctx: ResolutionContext,
    ) -> DomainResult<Outcome> {
        let new_ctx = ctx.increment_depth();

        let futures: FuturesUnordered<_> = children
            .into_iter()
            .map(|child| {
                self.resolve_userset(
                    request.clone(),
                    child,
                    Arc::clone(&type_system),
                    object_type.clone(),
                    object_id.clone(),
                    new_ctx.clone(),
                )
            })
            .collect();

        any_allows(futures).await
    }

    /// Resolves an intersection of usersets (all children must be true).
    ///
    /// The first deny short-circuits; remaining siblings are dropped.
    #[allow(clippy::too_many_arguments)]
    async fn resolve_intersection(
        &self,
        request: CheckRequest,
        children: Vec<Userset>,
        type_system: Arc<TypeSystem>,
        object_type: String,
        object_id: String,
        ctx: ResolutionContext,
    ) -> DomainResult<Outcome> {
        let new_ctx = ctx.increment_depth();

        let mut futures: FuturesUnordered<_> = children
            .into_iter()
            .map(|child| {
                self.resolve_userset(
                    request.clone(),
                    child,
                    Arc::clone(&type_system),
                    object_type.clone(),
                    object_id.clone(),
                    new_ctx.clone(),
                )
            })
            .collect();

        // A deny decides the intersection on its own, so an error in one
        // sibling is deferred until the drain completes without a deny —
        // mirroring how any_allows defers errors once an allow wins.
        let mut pending_error: Option<DomainError> = None;
        let mut tainted = false;
        while let Some(result) = futures.next().await {
            match result {
                Ok(outcome) if !outcome.allowed => return Ok(outcome),
                Ok(outcome) => tainted |= outcome.tainted,
                Err(e) => pending_error = Some(e),
            }
        }

        if let Some(e) = pending_error {
            return Err(e);
        }
        Ok(Outcome { allowed: true, tainted })
    }

    /// Resolves a difference (base must allow AND subtract must not).
    ///
    /// Both sides evaluate in parallel. An error on one side is only
    /// propagated when that side's result is needed for the decision:
    /// - base is false → false regardless of subtract
    /// - subtract is true → false regardless of base
    #[allow(clippy::too_many_arguments)]
    async fn resolve_difference(
        &self,
        request: CheckRequest,
        base: Userset,
        subtract: Userset,
        type_system: Arc<TypeSystem>,
        object_type: String,
        object_id: String,
        ctx: ResolutionContext,
    ) -> DomainResult<Outcome> {
        let new_ctx = ctx.increment_depth();

        let (base_result, subtract_result) = futures::future::join(
            self.resolve_userset(
                request.clone(),
                base,
                Arc::clone(&type_system),
                object_type.clone(),
                object_id.clone(),
                new_ctx.clone(),
            ),
            self.resolve_userset(request, subtract, type_system, object_type, object_id, new_ctx),
        )
        .await;

        match (base_result, subtract_result) {
            (Ok(base), Ok(subtract)) => {
                if !base.allowed {
                    Ok(Outcome::denied(base.tainted))
                } else if subtract.allowed {
                    Ok(Outcome::denied(subtract.tainted))
                } else {
                    Ok(Outcome {
                        allowed: true,
                        tainted: base.tainted || subtract.tainted,
                    })
                }
            }
            (Ok(base), Err(e)) => {
                if base.allowed {
                    Err(e)
                } else {
                    Ok(Outcome::denied(base.tainted))
                }
            }
            (Err(e), Ok(subtract)) => {
                if subtract.allowed {
                    Ok(Outcome::denied(subtract.tainted))
                } else {
                    Err(e)
                }
            }
            (Err(base_err), Err(_)) => Err(base_err),
        }
    }
}

/// Drains a fan-out with allow-wins semantics: the first allow returns
/// immediately; a full drain of denies returns a deny tainted if any
/// contributor was; errors surface after the drain unless an allow won.
async fn any_allows(
    mut futures: FuturesUnordered<impl Future<Output = DomainResult<Outcome>>>,
) -> DomainResult<Outcome> {
    let mut pending_error: Option<DomainError> = None;
    let mut tainted = false;

    while let Some(result) = futures.next().await {
        match result {
            Ok(outcome) if outcome.allowed => return Ok(outcome),
            Ok(outcome) => tainted |= outcome.tainted,
            Err(e) => pending_error = Some(e),
        }
    }

    if let Some(e) = pending_error {
        return Err(e);
    }
    Ok(Outcome::denied(tainted))
}

/// Parses an object string into owned type and id.
pub(crate) fn parse_object(object: &str) -> DomainResult<(String, String)> {
    match object.split_once(':') {
        Some((object_type, object_id)) if !object_type.is_empty() && !object_id.is_empty() => {
            Ok((object_type.to_string(), object_id.to_string()))
        }
        _ => Err(DomainError::InvalidObjectFormat {
            value: object.to_string(),
        }),
    }
}

/// Returns the type portion of a user string.
fn user_type_of(user: &str) -> &str {
    user.split(':').next().unwrap_or(user)
}

/// Returns true if the restrictions allow wildcard assignment of `user_type`.
fn wildcard_allowed(restrictions: &[RelationReference], user_type: &str) -> bool {
    restrictions
        .iter()
        .any(|r| matches!(r, RelationReference::Wildcard(t) if t == user_type))
}

/// Returns true if the restrictions list the tuple's userset form.
fn userset_allowed(restrictions: &[RelationReference], tuple: &StoredTupleRef) -> bool {
    let Some(user_relation) = &tuple.user_relation else {
        return false;
    };
    restrictions.iter().any(|r| {
        matches!(
            r,
            RelationReference::Userset { r#type, relation }
                if *r#type == tuple.user_type && relation == user_relation
        )
    })
}

/// Builds a tuple ref from a "type:id" object and a relation, if well-formed.
fn userset_ref(user_object: &str, user_relation: &str) -> Option<StoredTupleRef> {
    let (user_type, user_id) = user_object.split_once(':')?;
    if user_type.is_empty() || user_id.is_empty() || user_relation.is_empty() {
        return None;
    }
    Some(StoredTupleRef::new(
        user_type,
        user_id,
        Some(user_relation.to_string()),
    ))
}
