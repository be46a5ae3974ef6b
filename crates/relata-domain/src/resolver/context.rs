//! Per-query resolution context for the graph resolver.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::error::{DomainError, DomainResult};

/// State shared by every branch of a single query.
#[derive(Debug)]
pub(crate) struct QueryState {
    /// Completed sub-check results keyed by `object#relation@user`.
    ///
    /// First completion wins; sub-checks that started before a result was
    /// published run to completion independently. Blocking later requesters
    /// on an in-flight computation is not safe here: with cyclic data the
    /// in-flight computation can transitively wait on its own requesters.
    completed: DashMap<String, bool>,
    /// Bounds outstanding datastore reads across all branches.
    read_permits: Semaphore,
    /// Number of datastore reads issued by this query.
    datastore_reads: AtomicU64,
}

/// Context threaded through graph traversal.
///
/// `depth` and `visited` are path-scoped; the shared state is query-scoped
/// and discarded when the query ends.
#[derive(Debug, Clone)]
pub(crate) struct ResolutionContext {
    /// Current traversal depth.
    pub(crate) depth: u32,
    /// Visited nodes for cycle detection, keyed `object#relation@user`.
    /// Wrapped in Arc for cheap cloning when not mutating.
    pub(crate) visited: Arc<HashSet<String>>,
    state: Arc<QueryState>,
}

impl ResolutionContext {
    pub(crate) fn new(fan_out_limit: usize) -> Self {
        Self {
            depth: 0,
            visited: Arc::new(HashSet::new()),
            state: Arc::new(QueryState {
                completed: DashMap::new(),
                read_permits: Semaphore::new(fan_out_limit),
                datastore_reads: AtomicU64::new(0),
            }),
        }
    }

    pub(crate) fn increment_depth(&self) -> Self {
        Self {
            depth: self.depth + 1,
            visited: Arc::clone(&self.visited),
            state: Arc::clone(&self.state),
        }
    }

    pub(crate) fn with_visited(&self, key: &str) -> Self {
        // Clone the inner HashSet only when adding new entries (copy-on-write)
        let mut new_visited = (*self.visited).clone();
        new_visited.insert(key.to_string());
        Self {
            depth: self.depth,
            visited: Arc::new(new_visited),
            state: Arc::clone(&self.state),
        }
    }

    /// Starts a fresh traversal path sharing this query's state.
    pub(crate) fn fresh_path(&self) -> Self {
        Self {
            depth: 0,
            visited: Arc::new(HashSet::new()),
            state: Arc::clone(&self.state),
        }
    }

    /// Returns the published result of an identical sub-check, if any.
    pub(crate) fn completed_subcheck(&self, key: &str) -> Option<bool> {
        self.state.completed.get(key).map(|entry| *entry.value())
    }

    /// Publishes a completed sub-check result.
    pub(crate) fn publish_subcheck(&self, key: String, allowed: bool) {
        self.state.completed.insert(key, allowed);
    }

    /// Acquires a permit for a datastore read and counts it.
    ///
    /// Hold the permit only for the duration of the read; holding it across
    /// recursion would let deep traversals starve the pool.
    pub(crate) async fn read_permit(&self) -> DomainResult<SemaphorePermit<'_>> {
        self.state.datastore_reads.fetch_add(1, Ordering::Relaxed);
        self.state
            .read_permits
            .acquire()
            .await
            .map_err(|_| DomainError::Internal {
                message: "query semaphore closed".to_string(),
            })
    }

    /// Number of datastore reads issued by this query so far.
    pub(crate) fn datastore_reads(&self) -> u64 {
        self.state.datastore_reads.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visited_is_path_scoped() {
        let ctx = ResolutionContext::new(10);
        let with_key = ctx.with_visited("document:1#viewer@user:anne");

        assert!(with_key.visited.contains("document:1#viewer@user:anne"));
        // The original context is unchanged.
        assert!(ctx.visited.is_empty());
    }

    #[test]
    fn test_depth_increments_without_touching_visited() {
        let ctx = ResolutionContext::new(10).with_visited("k");
        let deeper = ctx.increment_depth();

        assert_eq!(deeper.depth, 1);
        assert!(deeper.visited.contains("k"));
    }

    #[test]
    fn test_subcheck_results_are_query_scoped() {
        let ctx = ResolutionContext::new(10);
        let branch = ctx.increment_depth().with_visited("k");

        branch.publish_subcheck("doc#viewer@anne".to_string(), true);
        // Visible from every branch of the same query.
        assert_eq!(ctx.completed_subcheck("doc#viewer@anne"), Some(true));
        // A fresh path still shares the published results.
        assert_eq!(ctx.fresh_path().completed_subcheck("doc#viewer@anne"), Some(true));
    }

    #[tokio::test]
    async fn test_read_permits_count_reads() {
        let ctx = ResolutionContext::new(2);
        {
            let _p1 = ctx.read_permit().await.unwrap();
            let _p2 = ctx.read_permit().await.unwrap();
        }
        assert_eq!(ctx.datastore_reads(), 2);
    }
}
