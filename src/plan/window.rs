//! `ClientWindow`: client-side window functions (ROW_NUMBER, RANK,
//! DENSE_RANK, and windowed aggregates) over a `PARTITION BY`/`ORDER BY`
//! spec. Not named as its own §4 operator in the core spec, but required
//! to satisfy the planner's "ClientWindow for any window function" step
//! (§4.12) — see SPEC_FULL.md.

use std::cmp::Ordering;

use crate::error::EngineResult;
use crate::row::Row;
use crate::value::{compare_non_null, Value};

use super::sort::SortKey;
use super::{ExecutionContext, PlanNode, RowStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowFunction {
    RowNumber,
    Rank,
    DenseRank,
    Sum,
    Count,
    Avg,
    Min,
    Max,
}

#[derive(Debug, Clone)]
pub struct WindowSpec {
    pub function: WindowFunction,
    pub partition_by: Vec<String>,
    pub order_by: Vec<SortKey>,
    /// Source column for aggregate-style window functions (unused by
    /// ROW_NUMBER/RANK/DENSE_RANK).
    pub argument: Option<String>,
    pub output: String,
}

#[derive(Debug, Clone)]
pub struct ClientWindow {
    pub spec: WindowSpec,
}

impl ClientWindow {
    pub fn execute(&self, child: &PlanNode, ctx: &ExecutionContext) -> EngineResult<RowStream> {
        let mut rows: Vec<Row> = Vec::new();
        for row in child.execute(ctx)? {
            ctx.check_cancelled()?;
            rows.push(row?);
        }

        // Partition by grouping on the partition-key string form, preserving
        // first-seen order of each partition and, within a partition, input
        // order (stable) before applying the window ORDER BY.
        let mut partition_order: Vec<String> = Vec::new();
        let mut partitions: std::collections::HashMap<String, Vec<usize>> = std::collections::HashMap::new();
        for (i, row) in rows.iter().enumerate() {
            let key = partition_key(row, &self.spec.partition_by);
            if !partitions.contains_key(&key) {
                partition_order.push(key.clone());
            }
            partitions.entry(key).or_default().push(i);
        }

        let mut output_value: Vec<Value> = vec![Value::Null; rows.len()];
        let order_by = self.spec.order_by.clone();

        for key in &partition_order {
            let mut indices = partitions.remove(key).unwrap();
            indices.sort_by(|&a, &b| compare_by_keys(&rows[a], &rows[b], &order_by));
            assign_window_values(&self.spec, &rows, &indices, &order_by, &mut output_value);
        }

        let output = self.spec.output.clone();
        Ok(Box::new(rows.into_iter().enumerate().map(move |(i, mut row)| {
            row.set(output.clone(), output_value[i].clone());
            Ok(row)
        })))
    }
}

fn partition_key(row: &Row, partition_by: &[String]) -> String {
    partition_by
        .iter()
        .map(|c| row.get(c).map(|v| v.canonical_string()).unwrap_or_default())
        .collect::<Vec<_>>()
        .join("\u{1F}")
}

fn compare_by_keys(a: &Row, b: &Row, keys: &[SortKey]) -> Ordering {
    for key in keys {
        let av = a.get(&key.column);
        let bv = b.get(&key.column);
        let av_null = av.map(|v| v.is_null()).unwrap_or(true);
        let bv_null = bv.map(|v| v.is_null()).unwrap_or(true);
        let ord = match (av_null, bv_null) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => {
                let ord = compare_non_null(av.unwrap(), bv.unwrap());
                if key.descending { ord.reverse() } else { ord }
            }
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn assign_window_values(
    spec: &WindowSpec,
    rows: &[Row],
    indices: &[usize],
    order_by: &[SortKey],
    out: &mut [Value],
) {
    match spec.function {
        WindowFunction::RowNumber => {
            for (rank, &idx) in indices.iter().enumerate() {
                out[idx] = Value::Int(rank as i64 + 1);
            }
        }
        WindowFunction::Rank | WindowFunction::DenseRank => {
            let mut rank = 0i64;
            let mut dense_rank = 0i64;
            let mut prev: Option<usize> = None;
            for (pos, &idx) in indices.iter().enumerate() {
                let tied = prev.map(|p| compare_by_keys(&rows[p], &rows[idx], order_by) == Ordering::Equal).unwrap_or(false);
                if !tied {
                    rank = pos as i64 + 1;
                    dense_rank += 1;
                }
                out[idx] = Value::Int(if spec.function == WindowFunction::Rank { rank } else { dense_rank });
                prev = Some(idx);
            }
        }
        WindowFunction::Sum | WindowFunction::Count | WindowFunction::Avg | WindowFunction::Min | WindowFunction::Max => {
            // Whole-partition (unbounded preceding/following) aggregate —
            // every row in the partition sees the same value.
            let values: Vec<Value> = indices
                .iter()
                .filter_map(|&idx| spec.argument.as_ref().and_then(|col| rows[idx].get(col).cloned()))
                .filter(|v| !v.is_null())
                .collect();
            let result = match spec.function {
                WindowFunction::Count => Value::Int(values.len() as i64),
                WindowFunction::Sum => sum_values(&values),
                WindowFunction::Avg => avg_values(&values),
                WindowFunction::Min => values
                    .iter()
                    .min_by(|a, b| crate::value::compare_non_null(a, b))
                    .cloned()
                    .unwrap_or(Value::Null),
                WindowFunction::Max => values
                    .iter()
                    .max_by(|a, b| crate::value::compare_non_null(a, b))
                    .cloned()
                    .unwrap_or(Value::Null),
                _ => unreachable!(),
            };
            for &idx in indices {
                out[idx] = result.clone();
            }
        }
    }
}

fn sum_values(values: &[Value]) -> Value {
    let total: f64 = values.iter().filter_map(|v| v.as_f64()).sum();
    Value::Float(total)
}

fn avg_values(values: &[Value]) -> Value {
    if values.is_empty() {
        return Value::Null;
    }
    let total: f64 = values.iter().filter_map(|v| v.as_f64()).sum();
    Value::Float(total / values.len() as f64)
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

    fn row(grp: &str, n: i64) -> Row {
        let mut r = Row::new();
        r.set("grp", Value::String(grp.into()));
        r.set("n", Value::Int(n));
        r
    }

    #[test]
    fn row_number_restarts_per_partition_in_order_by_order() {
        let ctx = ExecutionContext::new(Arc::new(EmptyBackend));
        let rows = vec![row("a", 3), row("a", 1), row("b", 5)];
        let child = PlanNode::CteScan(super::super::CteScan { name: "t".into(), rows: std::sync::Arc::new(rows) });
        let w = ClientWindow {
            spec: WindowSpec {
                function: WindowFunction::RowNumber,
                partition_by: vec!["grp".into()],
                order_by: vec![SortKey::asc("n")],
                argument: None,
                output: "rn".into(),
            },
        };
        let out: Vec<_> = w.execute(&child, &ctx).unwrap().collect::<EngineResult<Vec<_>>>().unwrap();
        let a_rows: Vec<_> = out.iter().filter(|r| r.get("grp") == Some(&Value::String("a".into()))).collect();
        let ranks: Vec<i64> = a_rows.iter().map(|r| match r.get("rn") { Some(Value::Int(n)) => *n, _ => panic!() }).collect();
        assert_eq!(ranks.len(), 2);
        assert!(ranks.contains(&1) && ranks.contains(&2));
    }
}
