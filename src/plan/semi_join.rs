//! `HashSemiJoin` (§4.7): IN / NOT IN / EXISTS / NOT EXISTS as a client-side
//! hash set membership test, with the outer-NULL and inner-NULL rules SQL
//! requires for `NOT IN`.

use std::collections::HashSet;

use crate::error::EngineResult;
use crate::row::Row;
use crate::value::Value;

use super::{ExecutionContext, PlanNode, RowStream};

#[derive(Debug, Clone)]
pub struct HashSemiJoin {
    pub outer_key: String,
    pub inner_key: String,
    pub anti: bool,
}

impl HashSemiJoin {
    pub fn execute(&self, outer: &PlanNode, inner: &PlanNode, ctx: &ExecutionContext) -> EngineResult<RowStream> {
        let mut set: HashSet<String> = HashSet::new();
        let mut inner_had_null = false;
        for row in inner.execute(ctx)? {
            ctx.check_cancelled()?;
            let row = row?;
            match row.get(&self.inner_key) {
                Some(v) if !v.is_null() => {
                    set.insert(v.canonical_string());
                }
                _ => inner_had_null = true,
            }
        }

        // `NOT IN (... NULL ...)` is defined to return empty (§4.7, test property 7).
        if self.anti && inner_had_null {
            return Ok(Box::new(std::iter::empty()));
        }

        let anti = self.anti;
        let outer_key = self.outer_key.clone();
        let outer_stream = outer.execute(ctx)?;
        Ok(Box::new(outer_stream.filter_map(move |row| {
            let row = match row {
                Ok(r) => r,
                Err(e) => return Some(Err(e)),
            };
            let key: &Value = match row.get(&outer_key) {
                Some(v) => v,
                None => return None,
            };
            if key.is_null() {
                // "IN (S)" where outer key is NULL yields zero rows — and
                // symmetrically for "NOT IN" (test properties 7 & 8).
                return None;
            }
            let is_member = set.contains(&key.canonical_string());
            if is_member != anti {
                Some(Ok(row))
            } else {
                None
            }
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendExecutor;
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

    fn rows_plan(vals: &[Option<i64>]) -> PlanNode {
        let rows: Vec<Row> = vals
            .iter()
            .map(|v| {
                let mut r = Row::new();
                r.set("id", v.map(Value::Int).unwrap_or(Value::Null));
                r
            })
            .collect();
        PlanNode::CteScan(super::super::CteScan { name: "t".into(), rows: std::sync::Arc::new(rows) })
    }

    #[test]
    fn not_in_with_null_member_returns_empty() {
        let ctx = ExecutionContext::new(Arc::new(EmptyBackend));
        let outer = rows_plan(&[Some(1), Some(2), Some(3)]);
        let inner = rows_plan(&[Some(1), None]);
        let j = HashSemiJoin { outer_key: "id".into(), inner_key: "id".into(), anti: true };
        let out: Vec<_> = j.execute(&outer, &inner, &ctx).unwrap().collect::<EngineResult<Vec<_>>>().unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn in_with_null_outer_key_drops_that_row() {
        let ctx = ExecutionContext::new(Arc::new(EmptyBackend));
        let outer = rows_plan(&[Some(1), None, Some(2)]);
        let inner = rows_plan(&[Some(1), Some(2)]);
        let j = HashSemiJoin { outer_key: "id".into(), inner_key: "id".into(), anti: false };
        let out: Vec<_> = j.execute(&outer, &inner, &ctx).unwrap().collect::<EngineResult<Vec<_>>>().unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn not_in_without_nulls_excludes_members() {
        let ctx = ExecutionContext::new(Arc::new(EmptyBackend));
        let outer = rows_plan(&[Some(1), Some(2), Some(3)]);
        let inner = rows_plan(&[Some(1), Some(3)]);
        let j = HashSemiJoin { outer_key: "id".into(), inner_key: "id".into(), anti: true };
        let out: Vec<_> = j.execute(&outer, &inner, &ctx).unwrap().collect::<EngineResult<Vec<_>>>().unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get("id"), Some(&Value::Int(2)));
    }
}
