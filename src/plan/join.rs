//! The three physical join strategies of §4.6, sharing one `JoinType`.

use std::collections::HashMap;

use crate::error::EngineResult;
use crate::expr::{Expr, EvalContext};
use crate::row::Row;
use crate::value::{compare_non_null, compare_nulls_last, Value};

use super::{ExecutionContext, PlanNode, RowStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    FullOuter,
    Cross,
    CrossApply,
    OuterApply,
}

impl JoinType {
    fn emits_unmatched_left(self) -> bool {
        matches!(self, JoinType::Left | JoinType::FullOuter)
    }

    fn emits_unmatched_right(self) -> bool {
        matches!(self, JoinType::Right | JoinType::FullOuter)
    }
}

/// Normalized join-key form (§4.6): uuid → canonical string, numeric →
/// invariant decimal string, strings → invariant uppercase, null → a
/// dedicated variant that never matches another `NullSentinel` (DESIGN.md
/// "Key normalization for joins").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum JoinKey {
    Null(u64),
    Value(String),
}

thread_local! {
    static NULL_COUNTER: std::cell::Cell<u64> = std::cell::Cell::new(0);
}

fn normalize_key(v: &Value) -> JoinKey {
    if v.is_null() {
        // Every null gets a fresh sentinel so nulls never compare equal to
        // one another or to any real key (DESIGN.md).
        let n = NULL_COUNTER.with(|c| {
            let n = c.get();
            c.set(n + 1);
            n
        });
        return JoinKey::Null(n);
    }
    JoinKey::Value(v.canonical_string())
}

// ---------------------------------------------------------------------------
// HashJoin
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HashJoin {
    pub join_type: JoinType,
    pub left_key: String,
    pub right_key: String,
}

impl HashJoin {
    pub fn execute(&self, left: &PlanNode, right: &PlanNode, ctx: &ExecutionContext) -> EngineResult<RowStream> {
        // Build side: bucket indices into `build_order` by normalized key,
        // so matched-tracking for Right/FullOuter doesn't need row identity.
        let mut build: HashMap<JoinKey, Vec<usize>> = HashMap::new();
        let mut build_order: Vec<Row> = Vec::new();
        for row in right.execute(ctx)? {
            ctx.check_cancelled()?;
            let row = row?;
            let key = row.get(&self.right_key).cloned().unwrap_or(Value::Null);
            let idx = build_order.len();
            build.entry(normalize_key(&key)).or_default().push(idx);
            build_order.push(row);
        }
        let mut matched = vec![false; build_order.len()];

        let join_type = self.join_type;
        let left_key = self.left_key.clone();
        let mut left_rows: Vec<Row> = Vec::new();
        for row in left.execute(ctx)? {
            ctx.check_cancelled()?;
            left_rows.push(row?);
        }

        let mut output: Vec<Row> = Vec::new();
        for lrow in &left_rows {
            let key = lrow.get(&left_key).cloned().unwrap_or(Value::Null);
            let nk = normalize_key(&key);
            match build.get(&nk) {
                Some(indices) if !indices.is_empty() => {
                    for &idx in indices {
                        matched[idx] = true;
                        output.push(Row::combine(lrow, &build_order[idx]));
                    }
                }
                _ => {
                    if join_type.emits_unmatched_left() {
                        if let Some(schema) = build_order.first() {
                            output.push(Row::combine(lrow, &Row::null_filled_like(schema)));
                        } else {
                            output.push(lrow.clone());
                        }
                    }
                }
            }
        }

        if join_type.emits_unmatched_right() {
            let left_schema = left_rows.first().cloned();
            for (i, rrow) in build_order.iter().enumerate() {
                if !matched[i] {
                    let filler = left_schema
                        .as_ref()
                        .map(Row::null_filled_like)
                        .unwrap_or_default();
                    output.push(Row::combine(&filler, rrow));
                }
            }
        }

        Ok(Box::new(output.into_iter().map(Ok)))
    }
}

// ---------------------------------------------------------------------------
// MergeJoin
// ---------------------------------------------------------------------------

/// Both inputs must already be sorted on their join key (the planner emits
/// matching ORDER BYs, §4.6).
#[derive(Debug, Clone)]
pub struct MergeJoin {
    pub join_type: JoinType,
    pub left_key: String,
    pub right_key: String,
}

impl MergeJoin {
    pub fn execute(&self, left: &PlanNode, right: &PlanNode, ctx: &ExecutionContext) -> EngineResult<RowStream> {
        let mut l: Vec<Row> = Vec::new();
        for row in left.execute(ctx)? {
            ctx.check_cancelled()?;
            l.push(row?);
        }
        let mut r: Vec<Row> = Vec::new();
        for row in right.execute(ctx)? {
            ctx.check_cancelled()?;
            r.push(row?);
        }

        let left_schema = l.first().cloned();
        let right_schema = r.first().cloned();
        let join_type = self.join_type;
        let (mut i, mut j) = (0usize, 0usize);
        let mut output: Vec<Row> = Vec::new();

        while i < l.len() && j < r.len() {
            let lv = l[i].get(&self.left_key).cloned().unwrap_or(Value::Null);
            let rv = r[j].get(&self.right_key).cloned().unwrap_or(Value::Null);
            if lv.is_null() || rv.is_null() {
                // SQL semantics: two nulls are never considered equal even
                // under a merge-join key comparison.
                if lv.is_null() && join_type.emits_unmatched_left() {
                    output.push(emit_left_unmatched(&l[i], &right_schema));
                }
                if rv.is_null() && join_type.emits_unmatched_right() {
                    output.push(emit_right_unmatched(&r[j], &left_schema));
                }
                if lv.is_null() {
                    i += 1;
                } else {
                    j += 1;
                }
                continue;
            }
            match compare_nulls_last(&lv, &rv) {
                std::cmp::Ordering::Less => {
                    if join_type.emits_unmatched_left() {
                        output.push(emit_left_unmatched(&l[i], &right_schema));
                    }
                    i += 1;
                }
                std::cmp::Ordering::Greater => {
                    if join_type.emits_unmatched_right() {
                        output.push(emit_right_unmatched(&r[j], &left_schema));
                    }
                    j += 1;
                }
                std::cmp::Ordering::Equal => {
                    // Emit the full cross-product of the equal-key runs.
                    let li_start = i;
                    while i < l.len() {
                        let next = l[i].get(&self.left_key).cloned().unwrap_or(Value::Null);
                        if next.is_null() || compare_non_null(&next, &lv) != std::cmp::Ordering::Equal {
                            break;
                        }
                        i += 1;
                    }
                    let lj_start = j;
                    while j < r.len() {
                        let next = r[j].get(&self.right_key).cloned().unwrap_or(Value::Null);
                        if next.is_null() || compare_non_null(&next, &rv) != std::cmp::Ordering::Equal {
                            break;
                        }
                        j += 1;
                    }
                    for lrow in &l[li_start..i] {
                        for rrow in &r[lj_start..j] {
                            output.push(Row::combine(lrow, rrow));
                        }
                    }
                }
            }
        }
        while i < l.len() {
            if join_type.emits_unmatched_left() {
                output.push(emit_left_unmatched(&l[i], &right_schema));
            }
            i += 1;
        }
        while j < r.len() {
            if join_type.emits_unmatched_right() {
                output.push(emit_right_unmatched(&r[j], &left_schema));
            }
            j += 1;
        }

        Ok(Box::new(output.into_iter().map(Ok)))
    }
}

fn emit_left_unmatched(lrow: &Row, right_schema: &Option<Row>) -> Row {
    match right_schema {
        Some(schema) => Row::combine(lrow, &Row::null_filled_like(schema)),
        None => lrow.clone(),
    }
}

fn emit_right_unmatched(rrow: &Row, left_schema: &Option<Row>) -> Row {
    match left_schema {
        Some(schema) => Row::combine(&Row::null_filled_like(schema), rrow),
        None => rrow.clone(),
    }
}

// ---------------------------------------------------------------------------
// NestedLoopJoin
// ---------------------------------------------------------------------------

/// The inner side is either a fixed plan (CROSS JOIN / non-equi predicate)
/// or a factory re-evaluated per outer row (CROSS/OUTER APPLY).
pub enum InnerSide {
    Fixed(Box<PlanNode>),
    /// `CROSS APPLY`/`OUTER APPLY`: rebuilt from the current outer row.
    Correlated(std::sync::Arc<dyn Fn(&Row) -> EngineResult<PlanNode> + Send + Sync>),
}

impl std::fmt::Debug for InnerSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InnerSide::Fixed(_) => write!(f, "InnerSide::Fixed"),
            InnerSide::Correlated(_) => write!(f, "InnerSide::Correlated"),
        }
    }
}

pub struct NestedLoopJoin {
    pub join_type: JoinType,
    pub inner: InnerSide,
    /// Optional non-equi predicate (e.g. `a.x < b.y`); `None` for CROSS JOIN.
    pub predicate: Option<Expr>,
}

impl std::fmt::Debug for NestedLoopJoin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NestedLoopJoin").field("join_type", &self.join_type).finish()
    }
}

impl NestedLoopJoin {
    pub fn execute(&self, left: &PlanNode, ctx: &ExecutionContext) -> EngineResult<RowStream> {
        let join_type = self.join_type;
        let mut output: Vec<Row> = Vec::new();
        let mut right_schema: Option<Row> = None;

        // Fixed inner side is materialized once and reused for every outer row.
        let fixed_inner: Option<Vec<Row>> = match &self.inner {
            InnerSide::Fixed(plan) => {
                let mut rows = Vec::new();
                for row in plan.execute(ctx)? {
                    ctx.check_cancelled()?;
                    rows.push(row?);
                }
                right_schema = rows.first().cloned();
                Some(rows)
            }
            InnerSide::Correlated(_) => None,
        };

        let (vars, session) = (ctx.variables.clone(), ctx.session.clone());

        for lrow in left.execute(ctx)? {
            ctx.check_cancelled()?;
            let lrow = lrow?;
            let inner_rows: Vec<Row> = match (&self.inner, &fixed_inner) {
                (InnerSide::Fixed(_), Some(rows)) => rows.clone(),
                (InnerSide::Correlated(factory), _) => {
                    let plan = factory(&lrow)?;
                    let mut rows = Vec::new();
                    for row in plan.execute(ctx)? {
                        ctx.check_cancelled()?;
                        rows.push(row?);
                    }
                    if right_schema.is_none() {
                        right_schema = rows.first().cloned();
                    }
                    rows
                }
                _ => unreachable!(),
            };

            let mut any_match = false;
            for rrow in &inner_rows {
                let keep = match &self.predicate {
                    None => true,
                    Some(pred) => {
                        let combined = Row::combine(&lrow, rrow);
                        let (v, s) = (vars.lock().unwrap(), session.lock().unwrap());
                        let eval_ctx = EvalContext::new(Some(&*v), Some(&*s));
                        crate::expr::eval(pred, &combined, &eval_ctx)?.truthy().unwrap_or(false)
                    }
                };
                if keep {
                    any_match = true;
                    output.push(Row::combine(&lrow, rrow));
                }
            }
            if !any_match && join_type.emits_unmatched_left() {
                match &right_schema {
                    Some(schema) => output.push(Row::combine(&lrow, &Row::null_filled_like(schema))),
                    None => output.push(lrow.clone()),
                }
            }
        }

        Ok(Box::new(output.into_iter().map(Ok)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn row(k: &str, v: i64) -> Row {
        let mut r = Row::new();
        r.set(k, Value::Int(v));
        r
    }

    fn rows_plan(rows: Vec<Row>) -> PlanNode {
        PlanNode::CteScan(super::super::CteScan { name: "t".into(), rows: std::sync::Arc::new(rows) })
    }

    fn empty_ctx() -> ExecutionContext {
        struct EmptyBackend;
        impl crate::backend::BackendExecutor for EmptyBackend {
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
        ExecutionContext::new(std::sync::Arc::new(EmptyBackend))
    }

    #[test]
    fn hash_join_inner_matches_on_equal_keys() {
        let left = rows_plan(vec![row("k", 1), row("k", 2)]);
        let right = rows_plan(vec![row("k", 1)]);
        let j = HashJoin { join_type: JoinType::Inner, left_key: "k".into(), right_key: "k".into() };
        let out: Vec<_> = j.execute(&left, &right, &empty_ctx()).unwrap().collect::<EngineResult<Vec<_>>>().unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn hash_join_left_outer_fills_nulls_for_unmatched() {
        let left = rows_plan(vec![row("k", 1), row("k", 2)]);
        let right = rows_plan(vec![row("k", 1)]);
        let j = HashJoin { join_type: JoinType::Left, left_key: "k".into(), right_key: "k".into() };
        let out: Vec<_> = j.execute(&left, &right, &empty_ctx()).unwrap().collect::<EngineResult<Vec<_>>>().unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn merge_join_emits_cross_product_of_equal_key_runs() {
        let left = rows_plan(vec![row("k", 1), row("k", 1)]);
        let right = rows_plan(vec![row("k", 1), row("k", 1)]);
        let j = MergeJoin { join_type: JoinType::Inner, left_key: "k".into(), right_key: "k".into() };
        let out: Vec<_> = j.execute(&left, &right, &empty_ctx()).unwrap().collect::<EngineResult<Vec<_>>>().unwrap();
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn nested_loop_cross_join_emits_full_product() {
        let left = rows_plan(vec![row("a", 1), row("a", 2)]);
        let right = rows_plan(vec![row("b", 10), row("b", 20)]);
        let j = NestedLoopJoin { join_type: JoinType::Cross, inner: InnerSide::Fixed(Box::new(right)), predicate: None };
        let out: Vec<_> = j.execute(&left, &empty_ctx()).unwrap().collect::<EngineResult<Vec<_>>>().unwrap();
        assert_eq!(out.len(), 4);
    }
}
