//! Planner configuration (§6). A plain struct with `Default`, constructed
//! programmatically — the teacher crate carries no configuration-file
//! dependency (no `serde` anywhere in its tree) and neither does this one.

use std::sync::Arc;

use crate::backend::TdsExecutor;
use crate::session::VariableScope;

#[derive(Clone)]
pub struct PlannerConfig {
    /// Hard cap on total rows emitted by a scan.
    pub max_rows: Option<u64>,
    /// Caller-controlled paging cursor (page number + opaque cookie).
    pub page_number: Option<u32>,
    pub paging_cookie: Option<String>,
    /// Ask the backend for total count alongside data.
    pub include_count: bool,
    /// Turn on `PrefetchScan`.
    pub enable_prefetch: bool,
    pub prefetch_buffer_size: usize,
    /// Max concurrent backend calls in `ParallelPartitionNode`.
    pub pool_capacity: usize,
    /// Enables aggregate partitioning (§4.10) when all three are present.
    pub estimated_record_count: Option<u64>,
    pub min_date: Option<chrono::DateTime<chrono::Utc>>,
    pub max_date: Option<chrono::DateTime<chrono::Utc>>,
    /// Backend-specific caps for aggregate partitioning.
    pub aggregate_record_limit: u64,
    pub max_records_per_partition: u64,
    /// Enable direct-wire passthrough.
    pub use_tds_endpoint: bool,
    pub tds_query_executor: Option<Arc<dyn TdsExecutor>>,
    pub original_sql: Option<String>,
    /// Scope for `@variable` substitution / `SET` / `SELECT @=`.
    pub variable_scope: Option<VariableScope>,
    /// Per-statement cap on rows affected by DML.
    pub dml_row_cap: Option<u64>,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        PlannerConfig {
            max_rows: None,
            page_number: None,
            paging_cookie: None,
            include_count: false,
            enable_prefetch: false,
            prefetch_buffer_size: 256,
            pool_capacity: 1,
            estimated_record_count: None,
            min_date: None,
            max_date: None,
            aggregate_record_limit: 50_000,
            max_records_per_partition: 50_000,
            use_tds_endpoint: false,
            tds_query_executor: None,
            original_sql: None,
            variable_scope: None,
            dml_row_cap: None,
        }
    }
}

impl PlannerConfig {
    pub fn new() -> Self {
        PlannerConfig::default()
    }

    /// §4.10 "when to partition": aggregates present (checked by the
    /// caller), pool_capacity > 1, an estimated row count over the backend's
    /// aggregate limit, and both date bounds supplied.
    pub fn aggregate_partitioning_applies(&self) -> bool {
        self.pool_capacity > 1
            && self
                .estimated_record_count
                .map(|n| n > self.aggregate_record_limit)
                .unwrap_or(false)
            && self.min_date.is_some()
            && self.max_date.is_some()
    }
}

impl std::fmt::Debug for PlannerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlannerConfig")
            .field("max_rows", &self.max_rows)
            .field("page_number", &self.page_number)
            .field("include_count", &self.include_count)
            .field("enable_prefetch", &self.enable_prefetch)
            .field("pool_capacity", &self.pool_capacity)
            .field("estimated_record_count", &self.estimated_record_count)
            .field("use_tds_endpoint", &self.use_tds_endpoint)
            .field("dml_row_cap", &self.dml_row_cap)
            .finish()
    }
}
