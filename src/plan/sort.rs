//! `ClientSort` (§4.4): materialize, sort stably, then stream.

use crate::error::EngineResult;
use crate::row::Row;
use crate::value::compare_non_null;

use super::{ExecutionContext, PlanNode, RowStream};

/// One `(column, descending)` sort key.
#[derive(Debug, Clone)]
pub struct SortKey {
    pub column: String,
    pub descending: bool,
}

impl SortKey {
    pub fn asc(column: impl Into<String>) -> Self {
        SortKey { column: column.into(), descending: false }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        SortKey { column: column.into(), descending: true }
    }
}

pub fn execute(child: &PlanNode, keys: &[SortKey], ctx: &ExecutionContext) -> EngineResult<RowStream> {
    let mut rows: Vec<Row> = Vec::new();
    for row in child.execute(ctx)? {
        ctx.check_cancelled()?;
        rows.push(row?);
    }
    let keys = keys.to_vec();
    rows.sort_by(|a, b| compare_rows(a, b, &keys));
    Ok(Box::new(rows.into_iter().map(Ok)))
}

fn compare_rows(a: &Row, b: &Row, keys: &[SortKey]) -> std::cmp::Ordering {
    use std::cmp::Ordering;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn row(n: Option<i64>) -> Row {
        let mut r = Row::new();
        r.set("n", n.map(Value::Int).unwrap_or(Value::Null));
        r
    }

    #[test]
    fn nulls_sort_last_ascending_and_descending() {
        let rows = vec![row(Some(2)), row(None), row(Some(1))];
        let mut asc = rows.clone();
        asc.sort_by(|a, b| compare_rows(a, b, &[SortKey::asc("n")]));
        let vals: Vec<_> = asc.iter().map(|r| r.get("n").cloned()).collect();
        assert_eq!(vals, vec![Some(Value::Int(1)), Some(Value::Int(2)), Some(Value::Null)]);

        let mut desc = rows;
        desc.sort_by(|a, b| compare_rows(a, b, &[SortKey::desc("n")]));
        let vals: Vec<_> = desc.iter().map(|r| r.get("n").cloned()).collect();
        assert_eq!(vals, vec![Some(Value::Int(2)), Some(Value::Int(1)), Some(Value::Null)]);
    }

    #[test]
    fn stable_sort_preserves_relative_order_of_equal_keys() {
        let mut a = Row::new();
        a.set("k", Value::Int(1));
        a.set("tag", Value::String("first".into()));
        let mut b = Row::new();
        b.set("k", Value::Int(1));
        b.set("tag", Value::String("second".into()));
        let mut rows = vec![a, b];
        rows.sort_by(|x, y| compare_rows(x, y, &[SortKey::asc("k")]));
        assert_eq!(rows[0].get("tag"), Some(&Value::String("first".into())));
        assert_eq!(rows[1].get("tag"), Some(&Value::String("second".into())));
    }
}
