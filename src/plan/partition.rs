//! Parallel aggregate partitioning (§4.10): split a date range into
//! sub-ranges sized to the backend's aggregate cap, run each partition's
//! FetchXML concurrently, and feed the results into `MergeAggregate`.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use chrono::{DateTime, Utc};

use crate::backend::enrich_with_date_range;
use crate::error::{EngineError, EngineResult};
use crate::row::Row;

use super::scan::FetchXmlScan;
use super::{ExecutionContext, PlanNode, RowStream};

/// One contiguous `[start, end)` sub-range of the aggregate date window,
/// lowered to a `FetchXmlScan` enriched with a `createdon` filter.
#[derive(Debug, Clone)]
pub struct AdaptiveAggregateScan {
    pub scan: FetchXmlScan,
}

impl AdaptiveAggregateScan {
    pub fn new(base_fetchxml: &str, entity: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        let fetchxml = enrich_with_date_range(base_fetchxml, &start.to_rfc3339(), &end.to_rfc3339());
        AdaptiveAggregateScan {
            scan: FetchXmlScan {
                fetchxml,
                primary_entity: entity.to_string(),
                max_rows: None,
                initial_cursor: None,
                include_count: false,
                use_remote_backend: false,
            },
        }
    }
}

/// Splits `[min_date, max_date]` into contiguous sub-ranges sized so each
/// is expected to stay under `max_records_per_partition`.
pub struct DateRangePartitioner;

impl DateRangePartitioner {
    /// `estimated_total` is the planner's cardinality estimate for the
    /// unpartitioned query; partition count is the smallest `k` keeping each
    /// slice's expected row count at or under `max_records_per_partition`.
    pub fn split(
        min_date: DateTime<Utc>,
        max_date: DateTime<Utc>,
        estimated_total: u64,
        max_records_per_partition: u64,
    ) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
        if max_date <= min_date {
            return vec![(min_date, max_date)];
        }
        let k = ((estimated_total.max(1) as f64) / (max_records_per_partition.max(1) as f64))
            .ceil()
            .max(1.0) as i64;
        let total_ns = (max_date - min_date).num_nanoseconds().unwrap_or(i64::MAX);
        let step_ns = (total_ns / k).max(1);
        let mut ranges = Vec::with_capacity(k as usize);
        let mut cursor = min_date;
        for i in 0..k {
            let next = if i == k - 1 {
                max_date
            } else {
                cursor + chrono::Duration::nanoseconds(step_ns)
            };
            ranges.push((cursor, next));
            cursor = next;
        }
        ranges
    }
}

/// Executes its child partitions concurrently (bounded by `pool_capacity`)
/// and yields rows as each partition completes. Feeds `MergeAggregate`.
pub struct ParallelPartitionNode {
    pub partitions: Vec<PlanNode>,
    pub pool_capacity: usize,
}

impl std::fmt::Debug for ParallelPartitionNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelPartitionNode")
            .field("partitions", &self.partitions.len())
            .field("pool_capacity", &self.pool_capacity)
            .finish()
    }
}

impl ParallelPartitionNode {
    pub fn execute(&self, ctx: &ExecutionContext) -> EngineResult<RowStream> {
        let (tx, rx) = mpsc::channel::<EngineResult<Row>>();
        let cap = self.pool_capacity.max(1);
        let gate = Arc::new(PermitGate::new(cap));
        let mut handles = Vec::with_capacity(self.partitions.len());

        for partition in &self.partitions {
            // Each partition is a self-contained `FetchXmlScan`/`AdaptiveAggregateScan`
            // over `Arc`-backed state, so it's safe to build and run the
            // stream entirely on its own worker thread.
            let backend = ctx.backend.clone();
            let remote = ctx.remote_backend.clone();
            let tds = ctx.tds.clone();
            let dml = ctx.dml.clone();
            let progress = ctx.progress.clone();
            let cancel = ctx.cancel.clone();
            let variables = ctx.variables.clone();
            let session = ctx.session.clone();
            let tx = tx.clone();
            let gate = gate.clone();

            // scan nodes hold only owned/Arc state, so cloning the plan
            // subtree across the thread boundary is sound.
            let partition_ctx = ExecutionContext {
                backend,
                remote_backend: remote,
                tds,
                dml,
                progress,
                cancel: cancel.clone(),
                variables,
                session,
            };
            let plan = clone_plan(partition)?;

            let _permit = gate.acquire();
            let handle = thread::Builder::new()
                .name("fetchql-partition".into())
                .spawn(move || {
                    let _permit = _permit;
                    let result = plan.execute(&partition_ctx).and_then(|stream| {
                        for row in stream {
                            if cancel.is_cancelled() {
                                return Err(EngineError::Cancelled);
                            }
                            if tx.send(row).is_err() {
                                return Ok(());
                            }
                        }
                        Ok(())
                    });
                    if let Err(e) = result {
                        let _ = tx.send(Err(e));
                    }
                })
                .map_err(|e| EngineError::execution(format!("failed to spawn partition thread: {e}")))?;
            handles.push(handle);
        }
        drop(tx);

        Ok(Box::new(PartitionStream { rx, handles: Some(handles) }))
    }
}

struct PartitionStream {
    rx: mpsc::Receiver<EngineResult<Row>>,
    handles: Option<Vec<thread::JoinHandle<()>>>,
}

impl Iterator for PartitionStream {
    type Item = EngineResult<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.rx.recv() {
            Ok(item) => Some(item),
            Err(_) => {
                if let Some(handles) = self.handles.take() {
                    for h in handles {
                        let _ = h.join();
                    }
                }
                None
            }
        }
    }
}

/// A plan subtree rooted at a partition is always a `FetchXmlScan` (or a
/// `ClientFilter`/`Project` wrapping one) — clone it by hand rather than
/// deriving `Clone` on all of `PlanNode`, since most variants legitimately
/// shouldn't be cloned (build-phase state, correlated closures).
fn clone_plan(node: &PlanNode) -> EngineResult<PlanNode> {
    Ok(match node {
        PlanNode::FetchXmlScan(s) => PlanNode::FetchXmlScan(s.clone()),
        PlanNode::ClientFilter(child, pred) => PlanNode::ClientFilter(Box::new(clone_plan(child)?), pred.clone()),
        PlanNode::Project(child, proj) => PlanNode::Project(Box::new(clone_plan(child)?), proj.clone()),
        other => {
            return Err(EngineError::InvariantViolation(format!(
                "ParallelPartitionNode expects a scan-shaped partition plan, found {}",
                other.describe()
            )))
        }
    })
}

/// Minimal counting semaphore: blocks `acquire()` until a permit is free,
/// releases on `Permit` drop. Avoids pulling in `tokio`/a semaphore crate
/// for one gate.
struct PermitGate {
    state: std::sync::Mutex<usize>,
    cvar: std::sync::Condvar,
}

impl PermitGate {
    fn new(capacity: usize) -> Self {
        PermitGate { state: std::sync::Mutex::new(capacity), cvar: std::sync::Condvar::new() }
    }

    fn acquire(self: &Arc<Self>) -> Permit {
        let mut count = self.state.lock().unwrap();
        while *count == 0 {
            count = self.cvar.wait(count).unwrap();
        }
        *count -= 1;
        Permit { gate: self.clone() }
    }
}

struct Permit {
    gate: Arc<PermitGate>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        let mut count = self.gate.state.lock().unwrap();
        *count += 1;
        self.gate.cvar.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn date_range_partitioner_covers_the_whole_window_contiguously() {
        let min = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let max = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let ranges = DateRangePartitioner::split(min, max, 250_000, 50_000);
        assert_eq!(ranges.first().unwrap().0, min);
        assert_eq!(ranges.last().unwrap().1, max);
        for w in ranges.windows(2) {
            assert_eq!(w[0].1, w[1].0);
        }
    }

    #[test]
    fn date_range_partitioner_is_single_range_when_under_the_cap() {
        let min = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let max = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let ranges = DateRangePartitioner::split(min, max, 1_000, 50_000);
        assert_eq!(ranges.len(), 1);
    }
}
