//! The physical operator algebra (§4) as a closed sum type (`PlanNode`) with
//! per-variant `execute`/`describe`/`estimated_rows`/`children` —
//! see DESIGN.md "Variant plan nodes".

mod aggregate;
mod join;
mod offset_fetch;
mod partition;
mod project;
mod recursive_cte;
mod scan;
mod semi_join;
mod set_ops;
mod sort;
mod window;

pub use aggregate::{AggregateColumn, AggregateFunction, MergeAggregate};
pub use join::{HashJoin, InnerSide, JoinType, MergeJoin, NestedLoopJoin};
pub use offset_fetch::OffsetFetch;
pub use partition::{AdaptiveAggregateScan, DateRangePartitioner, ParallelPartitionNode};
pub use project::{Projection, ProjectionItem};
pub use recursive_cte::{RecursiveCte, DEFAULT_MAX_RECURSION};
pub use scan::{CteScan, FetchXmlScan, MetadataScan, PagingCursor, RemoteScan, TdsScan, TempTableScan};
pub use semi_join::HashSemiJoin;
pub use set_ops::{Concatenate, Distinct, Except, Intersect};
pub use sort::{ClientSort, SortKey};
pub use window::{ClientWindow, WindowFunction, WindowSpec};

use std::sync::{Arc, Mutex, MutexGuard};

use crate::backend::{BackendExecutor, DmlExecutor, NullProgressReporter, ProgressReporter, TdsExecutor};
use crate::cancel::CancellationToken;
use crate::error::{EngineError, EngineResult};
use crate::expr::{Expr, EvalContext, Predicate};
use crate::row::Row;
use crate::session::{SessionContext, VariableScope};

/// A lazy, cooperatively-cancellable row sequence — the "language-native
/// lazy iteration primitive" of DESIGN.md's "Lazy row streams" note.
///
/// `Send` so a stream built on the driver thread can be hand off to the
/// worker threads `PrefetchScan`/`ParallelPartitionNode` spawn (§5).
pub type RowStream = Box<dyn Iterator<Item = EngineResult<Row>> + Send>;

/// Everything an operator's `execute` needs. Owns the shared, mutable
/// single-writer state (variable scope, session context) behind
/// `Arc<Mutex<_>>`: the driver is still logically single-writer (§5), but
/// `PrefetchScan`/`ParallelPartitionNode` read ahead on worker threads, so
/// the state they might touch has to be `Send + Sync`, not just `Clone`.
#[derive(Clone)]
pub struct ExecutionContext {
    pub backend: Arc<dyn BackendExecutor>,
    pub remote_backend: Option<Arc<dyn BackendExecutor>>,
    pub tds: Option<Arc<dyn TdsExecutor>>,
    pub dml: Option<Arc<dyn DmlExecutor>>,
    pub progress: Arc<dyn ProgressReporter>,
    pub cancel: CancellationToken,
    pub variables: Arc<Mutex<VariableScope>>,
    pub session: Arc<Mutex<SessionContext>>,
}

impl ExecutionContext {
    pub fn new(backend: Arc<dyn BackendExecutor>) -> Self {
        ExecutionContext {
            backend,
            remote_backend: None,
            tds: None,
            dml: None,
            progress: Arc::new(NullProgressReporter),
            cancel: CancellationToken::new(),
            variables: Arc::new(Mutex::new(VariableScope::new())),
            session: Arc::new(Mutex::new(SessionContext::new())),
        }
    }

    pub fn check_cancelled(&self) -> EngineResult<()> {
        if self.cancel.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// A throwaway `EvalContext` snapshot borrowing the current scope/session
    /// for one evaluation. Operators re-derive this per row rather than
    /// storing locks across the stream's lifetime.
    pub fn eval_scope(&self) -> (MutexGuard<'_, VariableScope>, MutexGuard<'_, SessionContext>) {
        (self.variables.lock().unwrap(), self.session.lock().unwrap())
    }

    pub(crate) fn backend_for(&self, remote: bool) -> Arc<dyn BackendExecutor> {
        if remote {
            self.remote_backend.clone().unwrap_or_else(|| self.backend.clone())
        } else {
            self.backend.clone()
        }
    }
}

/// The closed operator algebra. Every producing statement lowers to exactly
/// one `PlanNode` tree (§4.12 "Planner output invariants").
pub enum PlanNode {
    FetchXmlScan(FetchXmlScan),
    TdsScan(TdsScan),
    MetadataScan(MetadataScan),
    PrefetchScan(Box<PlanNode>, usize),
    TempTableScan(TempTableScan),
    CteScan(CteScan),
    RemoteScan(RemoteScan),
    ClientFilter(Box<PlanNode>, Arc<Predicate>),
    Project(Box<PlanNode>, Projection),
    ClientSort(Box<PlanNode>, Vec<SortKey>),
    OffsetFetch(Box<PlanNode>, OffsetFetch),
    HashJoin(Box<PlanNode>, Box<PlanNode>, HashJoin),
    MergeJoin(Box<PlanNode>, Box<PlanNode>, MergeJoin),
    NestedLoopJoin(Box<PlanNode>, NestedLoopJoin),
    HashSemiJoin(Box<PlanNode>, Box<PlanNode>, HashSemiJoin),
    Concatenate(Vec<PlanNode>),
    Distinct(Box<PlanNode>),
    Intersect(Box<PlanNode>, Box<PlanNode>),
    Except(Box<PlanNode>, Box<PlanNode>),
    MergeAggregate(Box<PlanNode>, MergeAggregate),
    ParallelPartition(ParallelPartitionNode),
    RecursiveCte(RecursiveCte),
    ClientWindow(Box<PlanNode>, ClientWindow),
}

impl PlanNode {
    /// Human-readable description for EXPLAIN (§3 "Plan node... exposes a
    /// description"; wired up by `Planner::explain`, see SPEC_FULL.md §2a).
    pub fn describe(&self) -> String {
        match self {
            PlanNode::FetchXmlScan(s) => format!("FetchXmlScan({})", s.primary_entity),
            PlanNode::TdsScan(_) => "TdsScan".to_string(),
            PlanNode::MetadataScan(s) => format!("MetadataScan({})", s.table_name),
            PlanNode::PrefetchScan(_, n) => format!("PrefetchScan(buffer={n})"),
            PlanNode::TempTableScan(s) => format!("TempTableScan(#{})", s.name),
            PlanNode::CteScan(s) => format!("CteScan({})", s.name),
            PlanNode::RemoteScan(s) => format!("RemoteScan({})", s.scan.primary_entity),
            PlanNode::ClientFilter(..) => "ClientFilter".to_string(),
            PlanNode::Project(_, p) => format!("Project({} cols)", p.items.len()),
            PlanNode::ClientSort(_, keys) => format!("ClientSort({} keys)", keys.len()),
            PlanNode::OffsetFetch(_, of) => format!("OffsetFetch(offset={}, fetch={})", of.offset, of.fetch),
            PlanNode::HashJoin(.., j) => format!("HashJoin({:?})", j.join_type),
            PlanNode::MergeJoin(.., j) => format!("MergeJoin({:?})", j.join_type),
            PlanNode::NestedLoopJoin(_, j) => format!("NestedLoopJoin({:?})", j.join_type),
            PlanNode::HashSemiJoin(.., s) => format!("HashSemiJoin(anti={})", s.anti),
            PlanNode::Concatenate(children) => format!("Concatenate({} branches)", children.len()),
            PlanNode::Distinct(_) => "Distinct".to_string(),
            PlanNode::Intersect(..) => "Intersect".to_string(),
            PlanNode::Except(..) => "Except".to_string(),
            PlanNode::MergeAggregate(_, a) => format!("MergeAggregate({} cols)", a.columns.len()),
            PlanNode::ParallelPartition(p) => format!("ParallelPartition({} partitions)", p.partitions.len()),
            PlanNode::RecursiveCte(_) => "RecursiveCte".to_string(),
            PlanNode::ClientWindow(_, w) => format!("ClientWindow({:?})", w.spec.function),
        }
    }

    /// Render this node and its children as an indented tree, the shape
    /// `Planner::explain` returns to callers.
    pub fn explain(&self) -> String {
        fn go(node: &PlanNode, depth: usize, out: &mut String) {
            out.push_str(&"  ".repeat(depth));
            out.push_str(&node.describe());
            let est = node.estimated_rows();
            if est >= 0 {
                out.push_str(&format!(" [~{est} rows]"));
            } else {
                out.push_str(" [~unknown rows]");
            }
            out.push('\n');
            for child in node.children() {
                go(child, depth + 1, out);
            }
        }
        let mut out = String::new();
        go(self, 0, &mut out);
        out
    }

    pub fn children(&self) -> Vec<&PlanNode> {
        match self {
            PlanNode::FetchXmlScan(_)
            | PlanNode::TdsScan(_)
            | PlanNode::MetadataScan(_)
            | PlanNode::TempTableScan(_)
            | PlanNode::CteScan(_)
            | PlanNode::RemoteScan(_)
            | PlanNode::RecursiveCte(_) => vec![],
            PlanNode::PrefetchScan(c, _)
            | PlanNode::ClientFilter(c, _)
            | PlanNode::Project(c, _)
            | PlanNode::ClientSort(c, _)
            | PlanNode::OffsetFetch(c, _)
            | PlanNode::Distinct(c)
            | PlanNode::MergeAggregate(c, _)
            | PlanNode::ClientWindow(c, _) => vec![c.as_ref()],
            PlanNode::HashJoin(l, r, _)
            | PlanNode::MergeJoin(l, r, _)
            | PlanNode::HashSemiJoin(l, r, _)
            | PlanNode::Intersect(l, r)
            | PlanNode::Except(l, r) => vec![l.as_ref(), r.as_ref()],
            PlanNode::NestedLoopJoin(l, j) => match &j.inner {
                InnerSide::Fixed(inner) => vec![l.as_ref(), inner.as_ref()],
                InnerSide::Correlated(_) => vec![l.as_ref()],
            },
            PlanNode::Concatenate(children) => children.iter().collect(),
            PlanNode::ParallelPartition(p) => p.partitions.iter().collect(),
        }
    }

    /// Execute this node against `ctx`, producing a lazy row stream.
    pub fn execute(&self, ctx: &ExecutionContext) -> EngineResult<RowStream> {
        ctx.check_cancelled()?;
        match self {
            PlanNode::FetchXmlScan(s) => s.execute(ctx),
            PlanNode::TdsScan(s) => s.execute(ctx),
            PlanNode::MetadataScan(s) => s.execute(ctx),
            PlanNode::PrefetchScan(child, buffer) => scan::execute_prefetch(child, *buffer, ctx),
            PlanNode::TempTableScan(s) => s.execute(ctx),
            PlanNode::CteScan(s) => s.execute(ctx),
            PlanNode::RemoteScan(s) => s.execute(ctx),
            PlanNode::ClientFilter(child, pred) => {
                let input = child.execute(ctx)?;
                let pred = pred.clone();
                let vars = ctx.variables.clone();
                let session = ctx.session.clone();
                Ok(Box::new(input.filter_map(move |row| match row {
                    Ok(row) => {
                        let (v, s) = (vars.lock().unwrap(), session.lock().unwrap());
                        let eval_ctx = EvalContext::new(Some(&*v), Some(&*s));
                        match pred.test(&row, &eval_ctx) {
                            Ok(true) => Some(Ok(row)),
                            Ok(false) => None,
                            Err(e) => Some(Err(e)),
                        }
                    }
                    Err(e) => Some(Err(e)),
                })))
            }
            PlanNode::Project(child, proj) => project::execute(child, proj, ctx),
            PlanNode::ClientSort(child, keys) => sort::execute(child, keys, ctx),
            PlanNode::OffsetFetch(child, of) => of.execute(child, ctx),
            PlanNode::HashJoin(l, r, j) => j.execute(l, r, ctx),
            PlanNode::MergeJoin(l, r, j) => j.execute(l, r, ctx),
            PlanNode::NestedLoopJoin(l, j) => j.execute(l, ctx),
            PlanNode::HashSemiJoin(l, r, s) => s.execute(l, r, ctx),
            PlanNode::Concatenate(children) => set_ops::execute_concatenate(children, ctx),
            PlanNode::Distinct(child) => set_ops::execute_distinct(child, ctx),
            PlanNode::Intersect(l, r) => set_ops::execute_intersect(l, r, ctx),
            PlanNode::Except(l, r) => set_ops::execute_except(l, r, ctx),
            PlanNode::MergeAggregate(child, agg) => agg.execute(child, ctx),
            PlanNode::ParallelPartition(p) => p.execute(ctx),
            PlanNode::RecursiveCte(r) => r.execute(ctx),
            PlanNode::ClientWindow(child, w) => w.execute(child, ctx),
        }
    }

    /// Estimated cardinality, or -1 for "unknown" (§4.13).
    pub fn estimated_rows(&self) -> i64 {
        crate::plan_cost::estimate(self)
    }
}

/// Build a `ClientFilter` node from a lowered `Expr`.
pub fn client_filter(child: PlanNode, predicate: Expr) -> PlanNode {
    PlanNode::ClientFilter(Box::new(child), Arc::new(Predicate::new(predicate)))
}
