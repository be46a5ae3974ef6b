//! Configuration for the graph resolver.

use std::time::Duration;

/// Configuration for the graph resolver.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Maximum depth for rewrite-graph traversal.
    pub max_depth: u32,
    /// Timeout for Check and Expand operations.
    pub timeout: Duration,
    /// Maximum outstanding datastore reads per query.
    pub fan_out_limit: usize,
    /// Deadline for ListObjects; elapsed time returns a partial result.
    pub list_objects_deadline: Duration,
    /// Maximum number of objects a ListObjects call emits.
    pub list_objects_max_results: u32,
    /// Upper bound on the candidate scan used by the check-each strategy.
    pub max_candidate_objects: usize,
    /// Concurrent checks in the check-each worker pool.
    pub check_concurrency: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_depth: 25,
            timeout: Duration::from_secs(30),
            fan_out_limit: 100,
            list_objects_deadline: Duration::from_secs(3),
            list_objects_max_results: 1000,
            max_candidate_objects: 100_000,
            check_concurrency: 10,
        }
    }
}
