//! Graph resolver for authorization queries.
//!
//! The resolver answers three questions over a store's tuples and model:
//!
//! - [`GraphResolver::check`] — does a user hold a relation on an object?
//! - [`GraphResolver::expand`] — why: one level of the relation's usertree.
//! - [`GraphResolver::list_objects`] — which objects of a type does a user
//!   hold the relation to, within a deadline and result cap.
//!
//! Evaluation is a concurrent recursion over the relation's rewrite with a
//! per-query resolution context: depth budget, path-scoped visited set for
//! cycle handling, a shared sub-check result map, and a fan-out semaphore
//! bounding outstanding datastore reads.

mod check;
mod config;
mod context;
mod expand;
mod list_objects;
pub mod traits;
mod types;

#[cfg(test)]
mod tests;

pub use check::GraphResolver;
pub use config::ResolverConfig;
pub use traits::{ModelReader, TupleReader};
pub use types::{
    CheckRequest, CheckResult, ContextualTuple, ExpandLeaf, ExpandLeafValue, ExpandNode,
    ExpandRequest, ExpandResult, ListObjectsRequest, ListObjectsResult, ResolutionMetadata,
    StoredTupleRef, UsersetTree,
};
