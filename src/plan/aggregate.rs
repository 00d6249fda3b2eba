//! `MergeAggregate` (§4.9): merges partial aggregate rows produced by
//! independent partitions.

use std::collections::HashMap;

use rust_decimal::Decimal;

use crate::error::{EngineError, EngineResult};
use crate::row::Row;
use crate::value::Value;

use super::{ExecutionContext, PlanNode, RowStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunction {
    Count,
    Sum,
    Min,
    Max,
    Avg,
}

/// One output aggregate column. `count_alias` is required for `Avg` — it
/// names the companion count column each partition contributes.
#[derive(Debug, Clone)]
pub struct AggregateColumn {
    pub alias: String,
    pub function: AggregateFunction,
    pub count_alias: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MergeAggregate {
    pub columns: Vec<AggregateColumn>,
    pub group_by: Vec<String>,
}

#[derive(Default)]
struct Accumulator {
    sum: Decimal,
    min: Option<Value>,
    max: Option<Value>,
    count_sum: i64,
    weighted_sum: Decimal,
}

impl MergeAggregate {
    pub fn execute(&self, child: &PlanNode, ctx: &ExecutionContext) -> EngineResult<RowStream> {
        let mut groups: HashMap<Vec<String>, (Row, HashMap<String, Accumulator>)> = HashMap::new();
        let mut group_order: Vec<Vec<String>> = Vec::new();

        for row in child.execute(ctx)? {
            ctx.check_cancelled()?;
            let row = row?;
            let group_key: Vec<String> = self
                .group_by
                .iter()
                .map(|c| row.get(c).map(|v| v.canonical_string()).unwrap_or_default())
                .collect();

            if !groups.contains_key(&group_key) {
                group_order.push(group_key.clone());
            }
            let entry = groups.entry(group_key).or_insert_with(|| {
                let mut template = Row::new();
                for c in &self.group_by {
                    template.set(c.clone(), row.get(c).cloned().unwrap_or(Value::Null));
                }
                (template, HashMap::new())
            });

            for col in &self.columns {
                let acc = entry.1.entry(col.alias.clone()).or_default();
                let partial = row.get(&col.alias).cloned().unwrap_or(Value::Null);
                merge_partial(acc, col, &partial, &row)?;
            }
        }

        let columns = self.columns.clone();
        let mut output = Vec::with_capacity(group_order.len());
        for key in group_order {
            let (mut out_row, accs) = groups.remove(&key).expect("group key tracked in group_order");
            for col in &columns {
                let acc = accs.get(&col.alias);
                let value = finalize(col.function, acc)?;
                out_row.set(col.alias.clone(), value);
            }
            output.push(out_row);
        }

        Ok(Box::new(output.into_iter().map(Ok)))
    }
}

fn merge_partial(acc: &mut Accumulator, col: &AggregateColumn, partial: &Value, row: &Row) -> EngineResult<()> {
    if partial.is_null() {
        return Ok(());
    }
    match col.function {
        AggregateFunction::Count | AggregateFunction::Sum => {
            acc.sum += as_decimal(partial)?;
        }
        AggregateFunction::Min => {
            acc.min = Some(match &acc.min {
                Some(cur) if crate::value::compare_non_null(cur, partial) != std::cmp::Ordering::Greater => cur.clone(),
                _ => partial.clone(),
            });
        }
        AggregateFunction::Max => {
            acc.max = Some(match &acc.max {
                Some(cur) if crate::value::compare_non_null(cur, partial) != std::cmp::Ordering::Less => cur.clone(),
                _ => partial.clone(),
            });
        }
        AggregateFunction::Avg => {
            let count_alias = col.count_alias.as_ref().ok_or_else(|| {
                EngineError::plan(format!("AVG merge for '{}' is missing its companion count column", col.alias))
            })?;
            let count = row
                .get(count_alias)
                .cloned()
                .unwrap_or(Value::Null);
            if count.is_null() {
                return Ok(());
            }
            let count_n = count.as_f64().map(|f| f as i64).ok_or_else(|| {
                EngineError::plan(format!("companion count column '{count_alias}' is not numeric"))
            })?;
            acc.weighted_sum += as_decimal(partial)? * Decimal::from(count_n);
            acc.count_sum += count_n;
        }
    }
    Ok(())
}

fn finalize(function: AggregateFunction, acc: Option<&Accumulator>) -> EngineResult<Value> {
    let Some(acc) = acc else { return Ok(Value::Null) };
    Ok(match function {
        AggregateFunction::Count | AggregateFunction::Sum => Value::Decimal(acc.sum),
        AggregateFunction::Min => acc.min.clone().unwrap_or(Value::Null),
        AggregateFunction::Max => acc.max.clone().unwrap_or(Value::Null),
        AggregateFunction::Avg => {
            if acc.count_sum == 0 {
                Value::Null
            } else {
                Value::Decimal(acc.weighted_sum / Decimal::from(acc.count_sum))
            }
        }
    })
}

fn as_decimal(v: &Value) -> EngineResult<Decimal> {
    match v {
        Value::Decimal(d) => Ok(*d),
        Value::Int(i) => Ok(Decimal::from(*i)),
        Value::Float(f) => Decimal::try_from(*f).map_err(|_| EngineError::plan("cannot convert float to decimal for aggregation")),
        _ => Err(EngineError::plan("non-numeric value where an aggregate partial was expected")),
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

    fn partial_row(owner: &str, sum: i64) -> Row {
        let mut r = Row::new();
        r.set("ownerid", Value::String(owner.into()));
        r.set("total", Value::Decimal(Decimal::from(sum)));
        r
    }

    #[test]
    fn sum_merges_across_partitions_grouped_by_owner() {
        let ctx = ExecutionContext::new(Arc::new(EmptyBackend));
        let rows = vec![partial_row("u1", 50), partial_row("u1", 80), partial_row("u2", 20)];
        let child = PlanNode::CteScan(super::super::CteScan { name: "t".into(), rows: std::sync::Arc::new(rows) });
        let agg = MergeAggregate {
            columns: vec![AggregateColumn { alias: "total".into(), function: AggregateFunction::Sum, count_alias: None }],
            group_by: vec!["ownerid".into()],
        };
        let out: Vec<_> = agg.execute(&child, &ctx).unwrap().collect::<EngineResult<Vec<_>>>().unwrap();
        assert_eq!(out.len(), 2);
        let u1 = out.iter().find(|r| r.get("ownerid") == Some(&Value::String("u1".into()))).unwrap();
        assert_eq!(u1.get("total"), Some(&Value::Decimal(Decimal::from(130))));
    }

    #[test]
    fn avg_merge_uses_weighted_companion_count() {
        let ctx = ExecutionContext::new(Arc::new(EmptyBackend));
        let mut r1 = Row::new();
        r1.set("avg_rev", Value::Decimal(Decimal::from(100)));
        r1.set("avg_rev_count", Value::Int(2));
        let mut r2 = Row::new();
        r2.set("avg_rev", Value::Decimal(Decimal::from(200)));
        r2.set("avg_rev_count", Value::Int(1));
        let child = PlanNode::CteScan(super::super::CteScan {
            name: "t".into(),
            rows: std::sync::Arc::new(vec![r1, r2]),
        });
        let agg = MergeAggregate {
            columns: vec![AggregateColumn {
                alias: "avg_rev".into(),
                function: AggregateFunction::Avg,
                count_alias: Some("avg_rev_count".into()),
            }],
            group_by: vec![],
        };
        let out: Vec<_> = agg.execute(&child, &ctx).unwrap().collect::<EngineResult<Vec<_>>>().unwrap();
        assert_eq!(out.len(), 1);
        // (100*2 + 200*1) / 3 = 133.33...
        assert_eq!(out[0].get("avg_rev"), Some(&Value::Decimal(Decimal::from(400) / Decimal::from(3))));
    }
}
