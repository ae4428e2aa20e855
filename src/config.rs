//! Configuration types.

use std::time::Duration;

/// Task registry configuration.
#[derive(Debug, Clone)]
pub struct TaskConfig {
    /// How long terminal tasks are retained before the sweep removes them.
    pub ttl: Duration,
    /// Interval between eviction sweeps.
    pub cleanup_interval: Duration,
    /// Maximum tasks simultaneously pending or working.
    pub max_concurrent: usize,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),            // 1 hour
            cleanup_interval: Duration::from_secs(300), // 5 minutes
            max_concurrent: 20,
        }
    }
}

/// Workflow execution configuration.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    /// Spacing between collection status polls.
    pub poll_interval: Duration,
    /// Default deadline for polling a collection to idle.
    pub default_timeout: Duration,
    /// Hard cap on items collected from a single collection.
    pub item_cap: usize,
    /// Maximum simultaneous per-entity research calls.
    pub research_concurrency: usize,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            default_timeout: Duration::from_secs(300), // 5 minutes
            item_cap: 1000,
            research_concurrency: 3,
        }
    }
}
