//! fetchql: a SQL planner and streaming execution engine over a
//! FetchXML-speaking backend.
//!
//! The crate translates a (restricted) T-SQL surface into a tree of
//! physical operators (`plan::PlanNode`) and drives that tree as a lazy
//! stream of rows against an injected `backend::BackendExecutor`. Planning
//! pushes as much work as possible into a single FetchXML document (via an
//! injected `backend::FetchXmlTranspiler`) and plans whatever the backend
//! can't express — client joins, arithmetic, CASE, windowing, set
//! operations, recursion, T-SQL control flow — as composable streaming
//! operators.
//!
//! Module map:
//! - [`value`] / [`row`] — the tagged cell value and the row shape every
//!   operator passes between itself and its children.
//! - [`session`] — `@`-prefixed variable scope, `#`-prefixed temp tables,
//!   and the session error state CATCH populates.
//! - [`expr`] — the row-level scalar expression / predicate engine.
//! - [`backend`] — the external collaborator contracts (§6): the backend
//!   executor, the FetchXML transpiler, and FetchXML enrichment helpers.
//! - [`plan`] — the physical operator algebra and the streaming execution
//!   context that drives it.
//! - [`plan_cost`] — the cardinality estimator.
//! - [`planner`] — SQL AST to `PlanNode` tree, including DML lowering.
//! - [`script`] — T-SQL batch control flow (`DECLARE`/`SET`/`IF`/`WHILE`/
//!   `TRY`/`CATCH`/`THROW`/`RAISERROR`/`PRINT`) layered on top of `planner`.
//! - [`config`] — planner configuration (paging, prefetch, partitioning,
//!   direct-wire passthrough, DML row caps).
//! - [`error`] — the closed `EngineError` enum every fallible operation in
//!   this crate returns.
//! - [`cancel`] — the cooperative cancellation token threaded through
//!   every operator.

pub mod backend;
pub mod cancel;
pub mod config;
pub mod error;
pub mod expr;
pub mod plan;
pub mod plan_cost;
pub mod planner;
pub mod row;
pub mod script;
pub mod session;
pub mod value;

pub use config::PlannerConfig;
pub use error::{EngineError, EngineResult};
pub use plan::{ExecutionContext, PlanNode, RowStream};
pub use planner::{DmlPlan, PlanOutput, Planner, QueryPlanResult};
pub use row::Row;
pub use script::ScriptExecution;
pub use session::{SessionContext, VariableScope};
pub use value::Value;
