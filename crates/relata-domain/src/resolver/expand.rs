//! The Expand evaluator: first-level materialization of a userset.
//!
//! The returned tree mirrors the relation's rewrite. Leaves carry directly
//! assigned users or userset references; Expand never recurses through a
//! referenced userset — callers follow the indirection if they want more.

use tokio::time::timeout;

use crate::error::{DomainError, DomainResult};
use crate::model::Userset;

use super::check::{parse_object, BoxFuture, GraphResolver};
use super::context::ResolutionContext;
use super::traits::{ModelReader, TupleReader};
use super::types::{
    ExpandLeaf, ExpandLeafValue, ExpandNode, ExpandRequest, ExpandResult, UsersetTree,
};

impl<T, M> GraphResolver<T, M>
where
    T: TupleReader + 'static,
    M: ModelReader + 'static,
{
    /// Expands a relation on an object into a usertree.
    #[tracing::instrument(skip(self, request), fields(
        store_id = %request.store_id,
        object = %request.object,
        relation = %request.relation,
    ))]
    pub async fn expand(&self, request: &ExpandRequest) -> DomainResult<ExpandResult> {
        self.validate_expand_request(request)?;

        if !self.tuple_reader.store_exists(&request.store_id).await? {
            return Err(DomainError::StoreNotFound {
                store_id: request.store_id.clone(),
            });
        }

        match timeout(self.config.timeout, self.expand_tree(request)).await {
            Ok(result) => result,
            Err(_) => Err(DomainError::DeadlineExceeded {
                duration_ms: self.config.timeout.as_millis() as u64,
            }),
        }
    }

    fn validate_expand_request(&self, request: &ExpandRequest) -> DomainResult<()> {
        if request.store_id.is_empty() {
            return Err(DomainError::ValidationError {
                message: "store_id is required".to_string(),
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

    async fn expand_tree(&self, request: &ExpandRequest) -> DomainResult<ExpandResult> {
        let type_system = self
            .model_reader
            .get_type_system(&request.store_id, request.authorization_model_id.as_deref())
            .await?;

        let (object_type, object_id) = parse_object(&request.object)?;
        let relation_def = type_system.get_relation(&object_type, &request.relation)?;

        let ctx = ResolutionContext::new(self.config.fan_out_limit);
        let root = self
            .expand_userset(
                request.clone(),
                relation_def.rewrite.clone(),
                object_type,
                object_id,
                ctx,
            )
            .await?;

        Ok(ExpandResult {
            tree: UsersetTree { root },
        })
    }

    /// Expands one rewrite node (boxed for recursion into set operators).
    #[allow(clippy::too_many_arguments)]
    fn expand_userset(
        &self,
        request: ExpandRequest,
        userset: Userset,
        object_type: String,
        object_id: String,
        ctx: ResolutionContext,
    ) -> BoxFuture<'_, DomainResult<ExpandNode>> {
        Box::pin(async move {
            if ctx.depth >= self.config.max_depth {
                return Err(DomainError::ResolutionTooComplex {
                    max_depth: self.config.max_depth,
                });
            }

            let name = format!("{}:{}#{}", object_type, object_id, request.relation);

            match userset {
                Userset::This => {
                    let tuples = {
                        let _permit = ctx.read_permit().await?;
                        self.tuple_reader
                            .read_relation_tuples(
                                &request.store_id,
                                &object_type,
                                &object_id,
                                &request.relation,
                            )
                            .await?
                    };

                    let users = tuples.iter().map(|t| t.user_string()).collect();
                    Ok(ExpandNode::Leaf(ExpandLeaf {
                        name,
                        value: ExpandLeafValue::Users(users),
                    }))
                }

                Userset::ComputedUserset { relation } => Ok(ExpandNode::Leaf(ExpandLeaf {
                    name,
                    value: ExpandLeafValue::Computed {
                        userset: format!("{object_type}:{object_id}#{relation}"),
                    },
                })),

                Userset::TupleToUserset {
                    tupleset,
                    computed_userset,
                } => {
                    let tuples = {
                        let _permit = ctx.read_permit().await?;
                        self.tuple_reader
                            .read_relation_tuples(
                                &request.store_id,
                                &object_type,
                                &object_id,
                                &tupleset,
                            )
                            .await?
                    };

                    // Only plain objects name a parent; userset and wildcard
                    // tupleset users are skipped.
                    let nodes = tuples
                        .iter()
                        .filter(|t| !t.is_userset() && !t.is_wildcard())
                        .map(|t| {
                            ExpandNode::Leaf(ExpandLeaf {
                                name: name.clone(),
                                value: ExpandLeafValue::Computed {
                                    userset: format!(
                                        "{}:{}#{}",
                                        t.user_type, t.user_id, computed_userset
                                    ),
                                },
                            })
                        })
                        .collect();

                    Ok(ExpandNode::Union { name, nodes })
                }

                Userset::Union { children } => {
                    let mut nodes = Vec::with_capacity(children.len());
                    for child in children {
                        nodes.push(
                            self.expand_userset(
                                request.clone(),
                                child,
                                object_type.clone(),
                                object_id.clone(),
                                ctx.increment_depth(),
                            )
                            .await?,
                        );
                    }
                    Ok(ExpandNode::Union { name, nodes })
                }

                Userset::Intersection { children } => {
                    let mut nodes = Vec::with_capacity(children.len());
                    for child in children {
                        nodes.push(
                            self.expand_userset(
                                request.clone(),
                                child,
                                object_type.clone(),
                                object_id.clone(),
                                ctx.increment_depth(),
                            )
                            .await?,
                        );
                    }
                    Ok(ExpandNode::Intersection { name, nodes })
                }

                Userset::Difference { base, subtract } => {
                    let base_node = self
                        .expand_userset(
                            request.clone(),
                            *base,
                            object_type.clone(),
                            object_id.clone(),
                            ctx.increment_depth(),
                        )
                        .await?;
                    let subtract_node = self
                        .expand_userset(
                            request.clone(),
                            *subtract,
                            object_type.clone(),
                            object_id.clone(),
                            ctx.increment_depth(),
                        )
                        .await?;
                    Ok(ExpandNode::Difference {
                        name,
                        base: Box::new(base_node),
                        subtract: Box::new(subtract_node),
                    })
                }
            }
        })
    }
}
