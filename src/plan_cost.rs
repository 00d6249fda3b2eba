//! Cardinality estimator (§4.13). Pure function of a `PlanNode`; `-1`
//! means "unknown" and must never be arithmetically combined (§3 invariant).

use crate::plan::PlanNode;

/// Default cardinality when nothing else is known.
pub const DEFAULT_ESTIMATE: i64 = 10_000;

/// Published selectivity constants (§4.13), for callers composing compound
/// predicates outside the estimator itself (e.g. the planner deciding
/// whether to partition).
pub const SELECTIVITY_EQUALITY: f64 = 0.10;
pub const SELECTIVITY_RANGE: f64 = 0.33;
pub const SELECTIVITY_LIKE: f64 = 0.25;
pub const SELECTIVITY_IS_NULL: f64 = 0.05;
pub const SELECTIVITY_NOT_EQUAL: f64 = 0.90;

const UNKNOWN: i64 = -1;

fn clamp_min_one(n: f64) -> i64 {
    (n.ceil() as i64).max(1)
}

/// Entity record-count table consulted by `FetchXmlScan` when it has no
/// `max_rows` cap — e.g. from prior backend metadata probes. The core
/// doesn't own how this table is populated; it's threaded in by the
/// embedder through `estimate_with_entity_counts`.
pub fn estimate(node: &PlanNode) -> i64 {
    estimate_with_entity_counts(node, &std::collections::HashMap::new())
}

pub fn estimate_with_entity_counts(
    node: &PlanNode,
    entity_record_counts: &std::collections::HashMap<String, u64>,
) -> i64 {
    match node {
        PlanNode::FetchXmlScan(s) => {
            if let Some(cap) = s.max_rows {
                cap as i64
            } else if let Some(n) = entity_record_counts.get(&s.primary_entity) {
                *n as i64
            } else {
                DEFAULT_ESTIMATE
            }
        }
        PlanNode::RemoteScan(s) => {
            if let Some(cap) = s.scan.max_rows {
                cap as i64
            } else if let Some(n) = entity_record_counts.get(&s.scan.primary_entity) {
                *n as i64
            } else {
                DEFAULT_ESTIMATE
            }
        }
        PlanNode::ClientFilter(child, _) => {
            let input = estimate_with_entity_counts(child, entity_record_counts);
            if input < 0 {
                UNKNOWN
            } else {
                clamp_min_one(input as f64 * SELECTIVITY_EQUALITY)
            }
        }
        PlanNode::HashJoin(l, r, _) | PlanNode::MergeJoin(l, r, _) => {
            let (le, re) = (
                estimate_with_entity_counts(l, entity_record_counts),
                estimate_with_entity_counts(r, entity_record_counts),
            );
            if le < 0 || re < 0 {
                UNKNOWN
            } else {
                clamp_min_one((le * re) as f64 * SELECTIVITY_EQUALITY)
            }
        }
        PlanNode::NestedLoopJoin(l, j) => {
            let le = estimate_with_entity_counts(l, entity_record_counts);
            let re = estimate_nested_loop_inner(j, entity_record_counts);
            if le < 0 || re < 0 {
                UNKNOWN
            } else if matches!(
                j.join_type,
                crate::plan::JoinType::Cross | crate::plan::JoinType::CrossApply | crate::plan::JoinType::OuterApply
            ) {
                (le * re).max(1)
            } else {
                clamp_min_one((le * re) as f64 * SELECTIVITY_EQUALITY)
            }
        }
        PlanNode::ParallelPartition(p) => {
            let mut total = 0i64;
            for part in &p.partitions {
                let e = estimate_with_entity_counts(part, entity_record_counts);
                if e < 0 {
                    return UNKNOWN;
                }
                total += e;
            }
            total
        }
        PlanNode::MergeAggregate(child, agg) => {
            let input = estimate_with_entity_counts(child, entity_record_counts);
            if input < 0 {
                UNKNOWN
            } else if !agg.group_by.is_empty() {
                clamp_min_one((input as f64).sqrt())
            } else {
                1
            }
        }
        PlanNode::Concatenate(children) => {
            let mut total = 0i64;
            for c in children {
                let e = estimate_with_entity_counts(c, entity_record_counts);
                if e < 0 {
                    return UNKNOWN;
                }
                total += e;
            }
            total
        }
        PlanNode::Distinct(child) => {
            let input = estimate_with_entity_counts(child, entity_record_counts);
            if input < 0 {
                UNKNOWN
            } else {
                clamp_min_one(input as f64 * 0.80)
            }
        }
        // "Other": first child's estimate, or the default.
        other => match other.children().first() {
            Some(child) => estimate_with_entity_counts(child, entity_record_counts),
            None => DEFAULT_ESTIMATE,
        },
    }
}

fn estimate_nested_loop_inner(
    j: &crate::plan::NestedLoopJoin,
    entity_record_counts: &std::collections::HashMap<String, u64>,
) -> i64 {
    match &j.inner {
        crate::plan::InnerSide::Fixed(plan) => estimate_with_entity_counts(plan, entity_record_counts),
        // A correlated APPLY factory can't be estimated without an outer
        // row to drive it; fall back to the documented default.
        crate::plan::InnerSide::Correlated(_) => DEFAULT_ESTIMATE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{FetchXmlScan, PagingCursor};

    fn scan_with_cap(cap: Option<u64>) -> PlanNode {
        PlanNode::FetchXmlScan(FetchXmlScan {
            fetchxml: "<fetch/>".into(),
            primary_entity: "account".into(),
            max_rows: cap,
            initial_cursor: None::<PagingCursor>,
            include_count: false,
            use_remote_backend: false,
        })
    }

    #[test]
    fn scan_with_max_rows_estimates_the_cap() {
        assert_eq!(estimate(&scan_with_cap(Some(42))), 42);
    }

    #[test]
    fn scan_without_cap_or_entity_count_uses_default() {
        assert_eq!(estimate(&scan_with_cap(None)), DEFAULT_ESTIMATE);
    }

    #[test]
    fn client_filter_applies_equality_selectivity_clamped_at_one() {
        let child = scan_with_cap(Some(5));
        let filtered = crate::plan::client_filter(child, crate::expr::Expr::Literal(crate::value::Value::Bool(true)));
        assert_eq!(estimate(&filtered), 1);
    }
}
