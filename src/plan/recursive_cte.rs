//! Recursive CTE (§4.11, test property 9).
//!
//! DESIGN.md "Factory callback in RecursiveCte": rather than a closure that
//! rebuilds an inner plan bound to a sentinel `CteScan`, this holds the
//! anchor plan and a substitution function that, given the previous
//! iteration's materialized rows, produces the next iteration's plan.

use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::row::Row;

use super::{ExecutionContext, PlanNode, RowStream};

/// Default maximum recursion depth (§4.11).
pub const DEFAULT_MAX_RECURSION: u32 = 100;

pub struct RecursiveCte {
    pub anchor: Box<PlanNode>,
    /// Builds the next iteration's plan from the previous iteration's rows.
    /// Must be pure with respect to the shared variable scope (§5).
    pub step: Arc<dyn Fn(&[Row]) -> EngineResult<PlanNode> + Send + Sync>,
    pub max_recursion: u32,
}

impl std::fmt::Debug for RecursiveCte {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecursiveCte").field("max_recursion", &self.max_recursion).finish()
    }
}

impl RecursiveCte {
    pub fn execute(&self, ctx: &ExecutionContext) -> EngineResult<RowStream> {
        let mut all_rows: Vec<Row> = Vec::new();

        let mut previous: Vec<Row> = Vec::new();
        for row in self.anchor.execute(ctx)? {
            ctx.check_cancelled()?;
            let row = row?;
            previous.push(row.clone());
            all_rows.push(row);
        }

        let mut depth = 0u32;
        loop {
            if previous.is_empty() {
                break;
            }
            depth += 1;
            if depth > self.max_recursion {
                return Err(EngineError::Recursion(format!(
                    "maximum recursion {} exhausted",
                    self.max_recursion
                )));
            }

            let plan = (self.step)(&previous)?;
            let mut next: Vec<Row> = Vec::new();
            for row in plan.execute(ctx)? {
                ctx.check_cancelled()?;
                next.push(row?);
            }
            if next.is_empty() {
                break;
            }
            all_rows.extend(next.iter().cloned());
            previous = next;
        }

        Ok(Box::new(all_rows.into_iter().map(Ok)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendExecutor;
    use crate::value::Value;

    struct EmptyBackend;
    impl BackendExecutor for EmptyBackend {
        fn execute_fetchxml(
            &self,
            _: &str,
            _: Option<u64>,
            _: Option<&str>,
            _: bool,
            _: &crate::cancel::CancellationToken,
        ) -> EngineResult<crate::backend::FetchPage> {
            unreachable!()
        }
    }

    fn row_n(n: i64) -> Row {
        let mut r = Row::new();
        r.set("n", Value::Int(n));
        r
    }

    fn rows_plan(rows: Vec<Row>) -> PlanNode {
        PlanNode::CteScan(super::super::CteScan { name: "t".into(), rows: std::sync::Arc::new(rows) })
    }

    #[test]
    fn anchor_plus_n_while_n_lt_3_yields_1_2_3() {
        let ctx = ExecutionContext::new(std::sync::Arc::new(EmptyBackend));
        let anchor = rows_plan(vec![row_n(1)]);
        let step: Arc<dyn Fn(&[Row]) -> EngineResult<PlanNode> + Send + Sync> = Arc::new(|prev: &[Row]| {
            let next: Vec<Row> = prev
                .iter()
                .filter_map(|r| match r.get("n") {
                    Some(Value::Int(n)) if *n < 3 => Some(row_n(n + 1)),
                    _ => None,
                })
                .collect();
            Ok(rows_plan(next))
        });
        let cte = RecursiveCte { anchor: Box::new(anchor), step, max_recursion: 100 };
        let out: Vec<_> = cte.execute(&ctx).unwrap().collect::<EngineResult<Vec<_>>>().unwrap();
        let vals: Vec<i64> = out.iter().map(|r| match r.get("n") { Some(Value::Int(n)) => *n, _ => panic!() }).collect();
        assert_eq!(vals, vec![1, 2, 3]);
    }

    #[test]
    fn exceeding_max_recursion_while_still_producing_rows_is_an_error() {
        let ctx = ExecutionContext::new(std::sync::Arc::new(EmptyBackend));
        let anchor = rows_plan(vec![row_n(1)]);
        // never terminates on its own — always emits one more row.
        let step: Arc<dyn Fn(&[Row]) -> EngineResult<PlanNode> + Send + Sync> =
            Arc::new(|prev: &[Row]| {
                let n = match prev[0].get("n") { Some(Value::Int(n)) => *n, _ => 0 };
                Ok(rows_plan(vec![row_n(n + 1)]))
            });
        let cte = RecursiveCte { anchor: Box::new(anchor), step, max_recursion: 2 };
        let result = cte.execute(&ctx);
        assert!(matches!(result, Err(EngineError::Recursion(_))));
    }
}
