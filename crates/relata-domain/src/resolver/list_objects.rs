//! The ListObjects evaluator: inverted traversal from a user to objects.
//!
//! Two strategies, selected statically per call from the type-system flags:
//!
//! - **Reverse-expand** walks the rewrite graph backwards from the target
//!   `(type, relation)` toward the user. Direct restrictions query the
//!   datastore's reverse index, computed usersets recurse, tuple-to-userset
//!   enumerates parents, unions merge concurrently. Objects stream out as
//!   they are discovered, each at most once.
//! - **Check-each** applies when the relation involves intersection or
//!   exclusion: candidate objects of the target type are enumerated from a
//!   bounded scan and each runs through Check in a worker pool.
//!
//! Both stop at the result cap or the deadline and return what they have as
//! a success; datastore failures terminate the stream with an error.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{DomainError, DomainResult};
use crate::model::{RelationReference, TypeSystem, UserRef, Userset};

use super::check::{BoxFuture, GraphResolver};
use super::context::ResolutionContext;
use super::traits::{ModelReader, TupleReader};
use super::types::{CheckRequest, ContextualTuple, ListObjectsRequest, ListObjectsResult};

/// The pieces of a ListObjects request threaded through reverse expansion.
#[derive(Debug, Clone)]
struct ReverseQuery {
    store_id: String,
    user: String,
    user_ref: UserRef,
    contextual_tuples: Arc<Vec<ContextualTuple>>,
}

impl<T, M> GraphResolver<T, M>
where
    T: TupleReader + 'static,
    M: ModelReader + 'static,
{
    /// Lists objects of a type the user has the relation to.
    ///
    /// Stops at the result cap or the deadline; a truncated result is still
    /// a success.
    #[tracing::instrument(skip(self, request), fields(
        store_id = %request.store_id,
        object_type = %request.object_type,
        relation = %request.relation,
        user = %request.user,
    ))]
    pub async fn list_objects(
        &self,
        request: &ListObjectsRequest,
    ) -> DomainResult<ListObjectsResult> {
        self.validate_list_objects_request(request)?;

        if !self.tuple_reader.store_exists(&request.store_id).await? {
            return Err(DomainError::StoreNotFound {
                store_id: request.store_id.clone(),
            });
        }

        let type_system = self
            .model_reader
            .get_type_system(&request.store_id, request.authorization_model_id.as_deref())
            .await?;
        // Surface model errors before anything streams.
        type_system.get_relation(&request.object_type, &request.relation)?;

        let max_results = request
            .max_results
            .unwrap_or(self.config.list_objects_max_results) as usize;
        let deadline = request
            .deadline
            .unwrap_or(self.config.list_objects_deadline);

        let (tx, mut rx) = mpsc::channel(64);
        let producer = self.produce_objects(request.clone(), type_system, tx);
        tokio::pin!(producer);
        let timer = tokio::time::sleep(deadline);
        tokio::pin!(timer);

        let mut objects = Vec::new();
        let mut producer_result: Option<DomainResult<()>> = None;

        loop {
            tokio::select! {
                _ = &mut timer => {
                    // Deadline: partial result, success.
                    return Ok(ListObjectsResult { objects });
                }
                maybe = rx.recv() => match maybe {
                    Some(object) => {
                        objects.push(object);
                        if objects.len() >= max_results {
                            return Ok(ListObjectsResult { objects });
                        }
                    }
                    None => break,
                },
                result = &mut producer, if producer_result.is_none() => {
                    producer_result = Some(result);
                }
            }
        }

        match producer_result {
            Some(Err(e)) => Err(e),
            _ => Ok(ListObjectsResult { objects }),
        }
    }

    /// Streaming variant: the same producer, emitted as discovered.
    ///
    /// The stream yields objects until the cap or deadline closes it; a
    /// producer failure surfaces as a final `Err` item after the buffered
    /// objects drain.
    pub async fn streamed_list_objects(
        self: &Arc<Self>,
        request: ListObjectsRequest,
    ) -> DomainResult<ReceiverStream<DomainResult<String>>> {
        self.validate_list_objects_request(&request)?;

        if !self.tuple_reader.store_exists(&request.store_id).await? {
            return Err(DomainError::StoreNotFound {
                store_id: request.store_id.clone(),
            });
        }

        let type_system = self
            .model_reader
            .get_type_system(&request.store_id, request.authorization_model_id.as_deref())
            .await?;
        type_system.get_relation(&request.object_type, &request.relation)?;

        let max_results = request
            .max_results
            .unwrap_or(self.config.list_objects_max_results) as usize;
        let deadline = request
            .deadline
            .unwrap_or(self.config.list_objects_deadline);

        let (out_tx, out_rx) = mpsc::channel(64);
        let resolver = Arc::clone(self);

        tokio::spawn(async move {
            let (tx, mut rx) = mpsc::channel(64);
            let producer = resolver.produce_objects(request, type_system, tx);
            tokio::pin!(producer);
            let timer = tokio::time::sleep(deadline);
            tokio::pin!(timer);

            let mut sent = 0usize;
            let mut producer_result: Option<DomainResult<()>> = None;

            loop {
                tokio::select! {
                    _ = &mut timer => return,
                    maybe = rx.recv() => match maybe {
                        Some(object) => {
                            if out_tx.send(Ok(object)).await.is_err() {
                                return;
                            }
                            sent += 1;
                            if sent >= max_results {
                                return;
                            }
                        }
                        None => break,
                    },
                    result = &mut producer, if producer_result.is_none() => {
                        producer_result = Some(result);
                    }
                }
            }

            if let Some(Err(e)) = producer_result {
                let _ = out_tx.send(Err(e)).await;
            }
        });

        Ok(ReceiverStream::new(out_rx))
    }

    fn validate_list_objects_request(&self, request: &ListObjectsRequest) -> DomainResult<()> {
        if request.store_id.is_empty() {
            return Err(DomainError::ValidationError {
                message: "store_id is required".to_string(),
            });
        }
        if !crate::model::is_valid_identifier(&request.object_type) {
            return Err(DomainError::ValidationError {
                message: format!("invalid object type '{}'", request.object_type),
            });
        }
        if !crate::model::is_valid_identifier(&request.relation) {
            return Err(DomainError::InvalidRelationFormat {
                value: request.relation.clone(),
            });
        }
        let user = UserRef::parse(&request.user).map_err(|_| DomainError::InvalidUserFormat {
            value: request.user.clone(),
        })?;
        if user.is_wildcard() {
            return Err(DomainError::InvalidUserFormat {
                value: request.user.clone(),
            });
        }
        Ok(())
    }

    /// Runs the selected strategy, emitting objects in "type:id" form.
    async fn produce_objects(
        &self,
        request: ListObjectsRequest,
        type_system: Arc<TypeSystem>,
        tx: mpsc::Sender<String>,
    ) -> DomainResult<()> {
        let use_check_each = type_system
            .relation_involves_intersection(&request.object_type, &request.relation)?
            || type_system.relation_involves_exclusion(&request.object_type, &request.relation)?;

        if use_check_each {
            return self.list_objects_check_each(request, tx).await;
        }

        // user_ref parse already validated at request entry
        let user_ref =
            UserRef::parse(&request.user).map_err(|_| DomainError::InvalidUserFormat {
                value: request.user.clone(),
            })?;
        let query = ReverseQuery {
            store_id: request.store_id.clone(),
            user: request.user.clone(),
            user_ref,
            contextual_tuples: request.contextual_tuples.clone(),
        };

        let ctx = ResolutionContext::new(self.config.fan_out_limit);
        let (id_tx, mut id_rx) = mpsc::channel(64);
        let expansion = self.reverse_expand_objects(
            query,
            type_system,
            request.object_type.clone(),
            request.relation.clone(),
            ctx,
            id_tx,
        );
        tokio::pin!(expansion);
        let mut expansion_result: Option<DomainResult<()>> = None;

        loop {
            tokio::select! {
                maybe = id_rx.recv() => match maybe {
                    Some(id) => {
                        if tx.send(format!("{}:{}", request.object_type, id)).await.is_err() {
                            return Ok(());
                        }
                    }
                    None => break,
                },
                result = &mut expansion, if expansion_result.is_none() => {
                    expansion_result = Some(result);
                }
            }
        }

        match expansion_result {
            Some(Err(e)) => Err(e),
            _ => Ok(()),
        }
    }

    /// Reverse-expands `(target_type, relation)`, emitting each object id of
    /// `target_type` at most once.
    ///
    /// After the rewrite expansion drains, a worklist pass re-feeds found
    /// objects through any self-referencing tupleset (an object hierarchy
    /// like `folder.parent: [folder]`), so transitive parents reach every
    /// descendant.
    fn reverse_expand_objects(
        &self,
        query: ReverseQuery,
        type_system: Arc<TypeSystem>,
        target_type: String,
        relation: String,
        ctx: ResolutionContext,
        out: mpsc::Sender<String>,
    ) -> BoxFuture<'_, DomainResult<()>> {
        Box::pin(async move {
            if ctx.depth >= self.config.max_depth {
                return Err(DomainError::ResolutionTooComplex {
                    max_depth: self.config.max_depth,
                });
            }

            let key = format!("{target_type}#{relation}");
            // A target already being expanded on this path contributes
            // nothing new.
            if ctx.visited.contains(&key) {
                return Ok(());
            }
            let ctx = ctx.with_visited(&key).increment_depth();

            let relation_def = type_system.get_relation(&target_type, &relation)?;
            let self_tuplesets = self_referencing_tuplesets(
                &relation_def.rewrite,
                &type_system,
                &target_type,
                &relation,
            );

            let (mid_tx, mut mid_rx) = mpsc::channel(64);
            let expansion = self.reverse_expand_node(
                query.clone(),
                Arc::clone(&type_system),
                target_type.clone(),
                relation.clone(),
                relation_def.rewrite.clone(),
                relation_def.directly_related_user_types.clone(),
                ctx.clone(),
                mid_tx,
            );
            tokio::pin!(expansion);
            let mut expansion_result: Option<DomainResult<()>> = None;

            let mut found: HashSet<String> = HashSet::new();
            let mut queue: VecDeque<String> = VecDeque::new();

            loop {
                tokio::select! {
                    maybe = mid_rx.recv() => match maybe {
                        Some(id) => {
                            if found.insert(id.clone()) {
                                if out.send(id.clone()).await.is_err() {
                                    return Ok(());
                                }
                                if !self_tuplesets.is_empty() {
                                    queue.push_back(id);
                                }
                            }
                        }
                        None => break,
                    },
                    result = &mut expansion, if expansion_result.is_none() => {
                        expansion_result = Some(result);
                    }
                }
            }
            if let Some(Err(e)) = expansion_result {
                return Err(e);
            }

            while let Some(parent_id) = queue.pop_front() {
                let parent = format!("{target_type}:{parent_id}");
                for tupleset in &self_tuplesets {
                    let ids = self
                        .read_objects_with_user(
                            &query,
                            &target_type,
                            tupleset,
                            std::slice::from_ref(&parent),
                            &ctx,
                        )
                        .await?;
                    for id in ids {
                        if found.insert(id.clone()) {
                            if out.send(id.clone()).await.is_err() {
                                return Ok(());
                            }
                            queue.push_back(id);
                        }
                    }
                }
            }

            Ok(())
        })
    }

    /// Reverse-expands one rewrite node.
    #[allow(clippy::too_many_arguments)]
    fn reverse_expand_node(
        &self,
        query: ReverseQuery,
        type_system: Arc<TypeSystem>,
        target_type: String,
        relation: String,
        node: Userset,
        restrictions: Vec<RelationReference>,
        ctx: ResolutionContext,
        out: mpsc::Sender<String>,
    ) -> BoxFuture<'_, DomainResult<()>> {
        Box::pin(async move {
            match node {
                Userset::This => {
                    self.reverse_expand_direct(
                        query,
                        type_system,
                        target_type,
                        relation,
                        restrictions,
                        ctx,
                        out,
                    )
                    .await
                }

                Userset::ComputedUserset { relation: computed } => {
                    self.reverse_expand_objects(query, type_system, target_type, computed, ctx, out)
                        .await
                }

                Userset::TupleToUserset {
                    tupleset,
                    computed_userset,
                } => {
                    self.reverse_expand_tupleset(
                        query,
                        type_system,
                        target_type,
                        relation,
                        tupleset,
                        computed_userset,
                        ctx,
                        out,
                    )
                    .await
                }

                Userset::Union { children } => {
                    let mut futures: FuturesUnordered<_> = children
                        .into_iter()
                        .map(|child| {
                            self.reverse_expand_node(
                                query.clone(),
                                Arc::clone(&type_system),
                                target_type.clone(),
                                relation.clone(),
                                child,
                                restrictions.clone(),
                                ctx.clone(),
                                out.clone(),
                            )
                        })
                        .collect();

                    let mut pending_error: Option<DomainError> = None;
                    while let Some(result) = futures.next().await {
                        if let Err(e) = result {
                            pending_error = Some(e);
                        }
                    }
                    match pending_error {
                        Some(e) => Err(e),
                        None => Ok(()),
                    }
                }

                // The strategy guard routes these to check-each.
                Userset::Intersection { .. } | Userset::Difference { .. } => {
                    Err(DomainError::Internal {
                        message: "reverse expansion reached an intersection or exclusion operator"
                            .to_string(),
                    })
                }
            }
        })
    }

    /// Reverse edge for `This`: find objects with a matching stored tuple.
    ///
    /// Builds the user filters the relation's restrictions allow (the user
    /// itself, its type wildcard, matching usersets), then queries the
    /// reverse index. When the relation's restrictions reference the
    /// relation itself (e.g. `group#member` on `member`), found objects are
    /// fed back as userset sources until a pass finds nothing new.
    #[allow(clippy::too_many_arguments)]
    async fn reverse_expand_direct(
        &self,
        query: ReverseQuery,
        type_system: Arc<TypeSystem>,
        target_type: String,
        relation: String,
        restrictions: Vec<RelationReference>,
        ctx: ResolutionContext,
        out: mpsc::Sender<String>,
    ) -> DomainResult<()> {
        let mut frontier: Vec<String> = Vec::new();
        let mut self_loop = false;

        match &query.user_ref {
            UserRef::Object(object) => {
                for restriction in &restrictions {
                    match restriction {
                        RelationReference::Direct(t) if *t == object.object_type => {
                            frontier.push(query.user.clone());
                        }
                        RelationReference::Wildcard(t) if *t == object.object_type => {
                            frontier.push(format!("{t}:*"));
                        }
                        _ => {}
                    }
                }
            }
            UserRef::Userset {
                object,
                relation: user_relation,
            } => {
                for restriction in &restrictions {
                    if let RelationReference::Userset { r#type, relation: rel } = restriction {
                        if *r#type == object.object_type && rel == user_relation {
                            frontier.push(query.user.clone());
                        }
                    }
                }
            }
            // Wildcard query users are rejected at request validation.
            UserRef::Wildcard { .. } => {}
        }

        for restriction in &restrictions {
            let RelationReference::Userset { r#type, relation: rel } = restriction else {
                continue;
            };
            if *r#type == target_type && *rel == relation {
                // The relation is assignable to its own usersets; expand by
                // fixpoint below instead of recursing into ourselves.
                self_loop = true;
                continue;
            }
            let sources = self
                .collect_objects(
                    query.clone(),
                    Arc::clone(&type_system),
                    r#type.clone(),
                    rel.clone(),
                    ctx.clone(),
                )
                .await?;
            for source in sources {
                frontier.push(format!("{}:{}#{}", r#type, source, rel));
            }
        }

        let mut known: HashSet<String> = HashSet::new();
        loop {
            if frontier.is_empty() {
                return Ok(());
            }
            let ids = self
                .read_objects_with_user(&query, &target_type, &relation, &frontier, &ctx)
                .await?;

            let mut new_ids = Vec::new();
            for id in ids {
                if known.insert(id.clone()) {
                    new_ids.push(id);
                }
            }
            for id in &new_ids {
                if out.send(id.clone()).await.is_err() {
                    return Ok(());
                }
            }

            if !self_loop || new_ids.is_empty() {
                return Ok(());
            }
            frontier = new_ids
                .into_iter()
                .map(|id| format!("{target_type}:{id}#{relation}"))
                .collect();
        }
    }

    /// Reverse edge for `TupleToUserset`: objects whose tupleset names a
    /// parent the user can reach through the computed relation.
    #[allow(clippy::too_many_arguments)]
    async fn reverse_expand_tupleset(
        &self,
        query: ReverseQuery,
        type_system: Arc<TypeSystem>,
        target_type: String,
        relation: String,
        tupleset: String,
        computed_userset: String,
        ctx: ResolutionContext,
        out: mpsc::Sender<String>,
    ) -> DomainResult<()> {
        let tupleset_def = type_system.get_relation(&target_type, &tupleset)?;

        for restriction in &tupleset_def.directly_related_user_types {
            // Tupleset relations resolve only to objects (model invariant);
            // anything else was rejected at model write.
            let RelationReference::Direct(parent_type) = restriction else {
                continue;
            };

            if *parent_type == target_type && computed_userset == relation {
                // Self-referencing hierarchy; the caller's worklist pass
                // walks it from the objects found by the other branches.
                continue;
            }

            let parents = self
                .collect_objects(
                    query.clone(),
                    Arc::clone(&type_system),
                    parent_type.clone(),
                    computed_userset.clone(),
                    ctx.clone(),
                )
                .await?;
            if parents.is_empty() {
                continue;
            }

            let filters: Vec<String> = parents
                .iter()
                .map(|p| format!("{parent_type}:{p}"))
                .collect();
            let ids = self
                .read_objects_with_user(&query, &target_type, &tupleset, &filters, &ctx)
                .await?;
            for id in ids {
                if out.send(id).await.is_err() {
                    return Ok(());
                }
            }
        }

        Ok(())
    }

    /// Collects the object ids of `target_type` where the user holds
    /// `relation`; used for intermediate steps of reverse expansion.
    async fn collect_objects(
        &self,
        query: ReverseQuery,
        type_system: Arc<TypeSystem>,
        target_type: String,
        relation: String,
        ctx: ResolutionContext,
    ) -> DomainResult<Vec<String>> {
        let (tx, mut rx) = mpsc::channel(64);
        let expansion =
            self.reverse_expand_objects(query, type_system, target_type, relation, ctx, tx);
        tokio::pin!(expansion);

        let mut out = Vec::new();
        let mut expansion_result: Option<DomainResult<()>> = None;
        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(id) => out.push(id),
                    None => break,
                },
                result = &mut expansion, if expansion_result.is_none() => {
                    expansion_result = Some(result);
                }
            }
        }
        if let Some(Err(e)) = expansion_result {
            return Err(e);
        }
        Ok(out)
    }

    /// Queries the reverse index and merges matching contextual tuples.
    async fn read_objects_with_user(
        &self,
        query: &ReverseQuery,
        object_type: &str,
        relation: &str,
        users: &[String],
        ctx: &ResolutionContext,
    ) -> DomainResult<Vec<String>> {
        if users.is_empty() {
            return Ok(Vec::new());
        }

        let mut ids = {
            let _permit = ctx.read_permit().await?;
            self.tuple_reader
                .read_starting_with_user(&query.store_id, object_type, relation, users)
                .await?
        };

        for ct in query.contextual_tuples.iter() {
            if ct.relation != relation {
                continue;
            }
            if !users.iter().any(|u| u == &ct.user) {
                continue;
            }
            if let Some((t, id)) = ct.object.split_once(':') {
                if t == object_type {
                    ids.push(id.to_string());
                }
            }
        }

        Ok(ids)
    }

    /// Check-each fallback: enumerate candidates, Check each in a pool.
    async fn list_objects_check_each(
        &self,
        request: ListObjectsRequest,
        tx: mpsc::Sender<String>,
    ) -> DomainResult<()> {
        let base_ctx = ResolutionContext::new(self.config.fan_out_limit);

        let mut candidates = {
            let _permit = base_ctx.read_permit().await?;
            self.tuple_reader
                .read_objects_of_type(
                    &request.store_id,
                    &request.object_type,
                    self.config.max_candidate_objects,
                )
                .await?
        };

        let mut seen: HashSet<String> = candidates.iter().cloned().collect();
        for ct in request.contextual_tuples.iter() {
            if let Some((t, id)) = ct.object.split_once(':') {
                if t == request.object_type && seen.insert(id.to_string()) {
                    candidates.push(id.to_string());
                }
            }
        }

        let results = futures::stream::iter(candidates.into_iter().map(|id| {
            let check = CheckRequest {
                store_id: request.store_id.clone(),
                authorization_model_id: request.authorization_model_id.clone(),
                user: request.user.clone(),
                relation: request.relation.clone(),
                object: format!("{}:{}", request.object_type, id),
                contextual_tuples: request.contextual_tuples.clone(),
            };
            // Fresh path, shared query state: sub-check results learned for
            // one candidate carry over to the others.
            let ctx = base_ctx.fresh_path();
            async move { (id, self.resolve_check(check, ctx).await) }
        }))
        .buffer_unordered(self.config.check_concurrency);
        tokio::pin!(results);

        while let Some((id, result)) = results.next().await {
            match result {
                Ok(outcome) if outcome.allowed => {
                    let object = format!("{}:{}", request.object_type, id);
                    if tx.send(object).await.is_err() {
                        return Ok(());
                    }
                }
                Ok(_) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }
}

/// Tupleset relations of `node` that both compute `relation` and are
/// assignable to `target_type` itself — the self-referencing hierarchies
/// the worklist pass walks.
fn self_referencing_tuplesets(
    node: &Userset,
    type_system: &TypeSystem,
    target_type: &str,
    relation: &str,
) -> Vec<String> {
    match node {
        Userset::This | Userset::ComputedUserset { .. } => Vec::new(),
        Userset::TupleToUserset {
            tupleset,
            computed_userset,
        } => {
            if computed_userset != relation {
                return Vec::new();
            }
            let is_self = type_system
                .get_relation(target_type, tupleset)
                .map(|def| {
                    def.directly_related_user_types
                        .iter()
                        .any(|r| matches!(r, RelationReference::Direct(t) if t == target_type))
                })
                .unwrap_or(false);
            if is_self {
                vec![tupleset.clone()]
            } else {
                Vec::new()
            }
        }
        Userset::Union { children } | Userset::Intersection { children } => children
            .iter()
            .flat_map(|c| self_referencing_tuplesets(c, type_system, target_type, relation))
            .collect(),
        Userset::Difference { base, subtract } => {
            let mut tuplesets = self_referencing_tuplesets(base, type_system, target_type, relation);
            tuplesets.extend(self_referencing_tuplesets(
                subtract,
                type_system,
                target_type,
                relation,
            ));
            tuplesets
        }
    }
}
