//! `OffsetFetch` (§4.5): skip then cap, short-circuiting once the fetch
//! budget is spent.

use crate::error::EngineResult;

use super::{ExecutionContext, PlanNode, RowStream};

/// `fetch < 0` means unlimited.
#[derive(Debug, Clone, Copy)]
pub struct OffsetFetch {
    pub offset: u64,
    pub fetch: i64,
}

impl OffsetFetch {
    pub fn execute(&self, child: &PlanNode, ctx: &ExecutionContext) -> EngineResult<RowStream> {
        let input = child.execute(ctx)?;
        let mut skipped = 0u64;
        let offset = self.offset;
        let mut remaining = self.fetch;
        let unlimited = self.fetch < 0;
        Ok(Box::new(input.filter_map(move |row| {
            if !unlimited && remaining <= 0 {
                return None;
            }
            if skipped < offset {
                skipped += 1;
                match row {
                    Ok(_) => return None,
                    Err(e) => return Some(Err(e)),
                }
            }
            if !unlimited {
                remaining -= 1;
            }
            Some(row)
        })))
    }
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
            unreachable!("not used by this test")
        }
    }

    fn literal_rows(vals: &[i64]) -> PlanNode {
        let rows: Vec<Row> = vals
            .iter()
            .map(|v| {
                let mut r = Row::new();
                r.set("n", Value::Int(*v));
                r
            })
            .collect();
        PlanNode::CteScan(super::CteScan { name: "t".into(), rows: std::sync::Arc::new(rows) })
    }

    #[test]
    fn offset_then_fetch_slices_the_middle() {
        let ctx = ExecutionContext::new(Arc::new(EmptyBackend));
        let child = literal_rows(&[1, 2, 3, 4, 5]);
        let of = OffsetFetch { offset: 2, fetch: 2 };
        let rows: Vec<_> = of.execute(&child, &ctx).unwrap().collect::<EngineResult<Vec<_>>>().unwrap();
        let vals: Vec<_> = rows.iter().map(|r| r.get("n").cloned().unwrap()).collect();
        assert_eq!(vals, vec![Value::Int(3), Value::Int(4)]);
    }

    #[test]
    fn negative_fetch_is_unlimited() {
        let ctx = ExecutionContext::new(Arc::new(EmptyBackend));
        let child = literal_rows(&[1, 2, 3]);
        let of = OffsetFetch { offset: 1, fetch: -1 };
        let rows = of.execute(&child, &ctx).unwrap().collect::<EngineResult<Vec<_>>>().unwrap();
        assert_eq!(rows.len(), 2);
    }
}
