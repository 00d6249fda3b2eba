//! `Project` (§4.3): client-side pass-through / computed output columns.

use crate::error::EngineResult;
use crate::expr::{Expr, EvalContext};
use crate::row::Row;

use super::{ExecutionContext, PlanNode, RowStream};

/// One output column: either copied verbatim from an input column, or
/// computed by evaluating an expression against the row.
#[derive(Debug, Clone)]
pub enum ProjectionItem {
    PassThrough { input: String, output: String },
    Computed { expr: Expr, output: String },
}

/// An ordered list of projections. The output row carries exactly these
/// names, in this order.
#[derive(Debug, Clone, Default)]
pub struct Projection {
    pub items: Vec<ProjectionItem>,
}

impl Projection {
    pub fn new(items: Vec<ProjectionItem>) -> Self {
        Projection { items }
    }
}

pub fn execute(child: &PlanNode, proj: &Projection, ctx: &ExecutionContext) -> EngineResult<RowStream> {
    let input = child.execute(ctx)?;
    let items = proj.items.clone();
    let vars = ctx.variables.clone();
    let session = ctx.session.clone();
    Ok(Box::new(input.map(move |row| {
        let row = row?;
        let (v, s) = (vars.lock().unwrap(), session.lock().unwrap());
        let eval_ctx = EvalContext::new(Some(&*v), Some(&*s));
        let mut out = Row::new();
        out.entity = row.entity.clone();
        for item in &items {
            match item {
                ProjectionItem::PassThrough { input, output } => {
                    let value = row.get(input).cloned().unwrap_or(crate::value::Value::Null);
                    out.set(output.clone(), value);
                }
                ProjectionItem::Computed { expr, output } => {
                    let value = crate::expr::eval(expr, &row, &eval_ctx)?;
                    out.set(output.clone(), value);
                }
            }
        }
        Ok(out)
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendExecutor;
    use crate::expr::BinOp;
    use crate::value::Value;
    use std::sync::Arc;

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

    #[test]
    fn pass_through_and_computed_columns_coexist() {
        let mut row = Row::new();
        row.set("a", Value::Int(2));
        let child = PlanNode::CteScan(super::super::CteScan {
            name: "t".into(),
            rows: std::sync::Arc::new(vec![row]),
        });
        let proj = Projection::new(vec![
            ProjectionItem::PassThrough { input: "a".into(), output: "a".into() },
            ProjectionItem::Computed {
                expr: Expr::Binary(
                    Box::new(Expr::Column("a".into())),
                    BinOp::Mul,
                    Box::new(Expr::Literal(Value::Int(10))),
                ),
                output: "a_times_10".into(),
            },
        ]);
        let ctx = ExecutionContext::new(Arc::new(EmptyBackend));
        let rows: Vec<_> = execute(&child, &proj, &ctx).unwrap().collect::<EngineResult<Vec<_>>>().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("a"), Some(&Value::Int(2)));
        assert_eq!(rows[0].get("a_times_10"), Some(&Value::Int(20)));
        assert_eq!(rows[0].len(), 2);
    }
}
