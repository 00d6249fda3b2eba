//! Set operations (§4.8): `Concatenate` (UNION ALL), `Distinct`, `Intersect`,
//! `Except`. Composite keys come from `Row::composite_key`.

use std::collections::HashSet;

use crate::error::EngineResult;

use super::{ExecutionContext, PlanNode, RowStream};

pub fn execute_concatenate(children: &[PlanNode], ctx: &ExecutionContext) -> EngineResult<RowStream> {
    let mut streams = Vec::with_capacity(children.len());
    for child in children {
        streams.push(child.execute(ctx)?);
    }
    Ok(Box::new(streams.into_iter().flatten()))
}

pub fn execute_distinct(child: &PlanNode, ctx: &ExecutionContext) -> EngineResult<RowStream> {
    let input = child.execute(ctx)?;
    let mut seen: HashSet<String> = HashSet::new();
    Ok(Box::new(input.filter_map(move |row| match row {
        Ok(row) => {
            let key = row.composite_key();
            if seen.insert(key) {
                Some(Ok(row))
            } else {
                None
            }
        }
        Err(e) => Some(Err(e)),
    })))
}

pub fn execute_intersect(left: &PlanNode, right: &PlanNode, ctx: &ExecutionContext) -> EngineResult<RowStream> {
    let mut right_keys: HashSet<String> = HashSet::new();
    for row in right.execute(ctx)? {
        ctx.check_cancelled()?;
        right_keys.insert(row?.composite_key());
    }
    let mut yielded: HashSet<String> = HashSet::new();
    let left_stream = left.execute(ctx)?;
    Ok(Box::new(left_stream.filter_map(move |row| match row {
        Ok(row) => {
            let key = row.composite_key();
            if right_keys.contains(&key) && yielded.insert(key) {
                Some(Ok(row))
            } else {
                None
            }
        }
        Err(e) => Some(Err(e)),
    })))
}

pub fn execute_except(left: &PlanNode, right: &PlanNode, ctx: &ExecutionContext) -> EngineResult<RowStream> {
    let mut right_keys: HashSet<String> = HashSet::new();
    for row in right.execute(ctx)? {
        ctx.check_cancelled()?;
        right_keys.insert(row?.composite_key());
    }
    let mut yielded: HashSet<String> = HashSet::new();
    let left_stream = left.execute(ctx)?;
    Ok(Box::new(left_stream.filter_map(move |row| match row {
        Ok(row) => {
            let key = row.composite_key();
            if !right_keys.contains(&key) && yielded.insert(key) {
                Some(Ok(row))
            } else {
                None
            }
        }
        Err(e) => Some(Err(e)),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendExecutor;
    use crate::row::Row;
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

    fn rows_plan(vals: &[i64]) -> PlanNode {
        let rows: Vec<Row> = vals
            .iter()
            .map(|v| {
                let mut r = Row::new();
                r.set("n", Value::Int(*v));
                r
            })
            .collect();
        PlanNode::CteScan(super::super::CteScan { name: "t".into(), rows: std::sync::Arc::new(rows) })
    }

    #[test]
    fn distinct_dedups_by_composite_key() {
        let ctx = ExecutionContext::new(Arc::new(EmptyBackend));
        let child = rows_plan(&[1, 1, 2, 2, 3]);
        let out: Vec<_> = execute_distinct(&child, &ctx).unwrap().collect::<EngineResult<Vec<_>>>().unwrap();
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn intersect_is_subset_of_both_with_dedup() {
        let ctx = ExecutionContext::new(Arc::new(EmptyBackend));
        let left = rows_plan(&[1, 1, 2, 3]);
        let right = rows_plan(&[2, 3, 3]);
        let out: Vec<_> = execute_intersect(&left, &right, &ctx).unwrap().collect::<EngineResult<Vec<_>>>().unwrap();
        let vals: Vec<i64> = out.iter().map(|r| match r.get("n") { Some(Value::Int(n)) => *n, _ => panic!() }).collect();
        assert_eq!(vals, vec![2, 3]);
    }

    #[test]
    fn except_removes_right_set_members() {
        let ctx = ExecutionContext::new(Arc::new(EmptyBackend));
        let left = rows_plan(&[1, 2, 3]);
        let right = rows_plan(&[2]);
        let out: Vec<_> = execute_except(&left, &right, &ctx).unwrap().collect::<EngineResult<Vec<_>>>().unwrap();
        let vals: Vec<i64> = out.iter().map(|r| match r.get("n") { Some(Value::Int(n)) => *n, _ => panic!() }).collect();
        assert_eq!(vals, vec![1, 3]);
    }

    #[test]
    fn concatenate_preserves_branch_order_and_multiplicity() {
        let ctx = ExecutionContext::new(Arc::new(EmptyBackend));
        let a = rows_plan(&[1, 1]);
        let b = rows_plan(&[2]);
        let out: Vec<_> = execute_concatenate(&[a, b], &ctx).unwrap().collect::<EngineResult<Vec<_>>>().unwrap();
        assert_eq!(out.len(), 3);
    }
}
