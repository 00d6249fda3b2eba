//! External collaborator contracts (§6): the backend executor and the
//! FetchXML transpiler. Both are injectable traits so the planner and the
//! operator tree can be exercised against mocks in tests.

use crate::cancel::CancellationToken;
use crate::error::EngineResult;
use crate::row::Row;

/// One page of results from `execute_fetchxml`.
#[derive(Debug, Clone, Default)]
pub struct FetchPage {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    /// Total record count, if `include_count` was requested and the backend
    /// supports it.
    pub count: Option<u64>,
    pub more_records: bool,
    /// Opaque paging cookie to pass back unchanged to fetch the next page.
    pub paging_cookie: Option<String>,
}

/// The primary backend access path: a restricted XML query language.
pub trait BackendExecutor: Send + Sync {
    fn execute_fetchxml(
        &self,
        fetchxml: &str,
        max_rows: Option<u64>,
        paging_cookie: Option<&str>,
        include_count: bool,
        cancel: &CancellationToken,
    ) -> EngineResult<FetchPage>;
}

/// Optional direct-wire executor used by `TdsScan` when a statement passes
/// the planner's compatibility check.
pub trait TdsExecutor: Send + Sync {
    fn execute_sql(&self, sql: &str, cancel: &CancellationToken) -> EngineResult<Vec<Row>>;
}

/// Metadata describing one backend-computed ("virtual") output column.
#[derive(Debug, Clone)]
pub struct VirtualColumnInfo {
    pub source_expression: String,
    pub is_aggregate: bool,
}

/// What the transpiler reports about how much of the statement it could
/// push down, consumed by the planner to decide which client operators
/// still need to wrap the scan (§4.12 step 7).
#[derive(Debug, Clone, Default)]
pub struct PushdownInfo {
    /// WHERE-clause predicate text the transpiler could not embed in the
    /// FetchXML `<filter>` and that must be re-applied as a `ClientFilter`.
    pub unpushed_where: Option<String>,
    pub has_group_by: bool,
    pub has_having: bool,
    pub has_window_function: bool,
    pub has_top_or_distinct: bool,
}

/// Output of `FetchXmlTranspiler::generate`.
#[derive(Debug, Clone, Default)]
pub struct TranspileResult {
    pub fetchxml_text: String,
    pub primary_entity: String,
    pub virtual_columns: std::collections::HashMap<String, VirtualColumnInfo>,
    pub pushdown: PushdownInfo,
}

/// Translates a (single-`SELECT`) SQL AST into FetchXML. Out of scope per
/// §1 is *how* it does this; the planner only depends on this contract.
///
/// `Send + Sync` so a recursive CTE's per-iteration replanning closure can
/// hold an `Arc<dyn FetchXmlTranspiler>` (§4.11).
pub trait FetchXmlTranspiler: Send + Sync {
    fn generate(&self, select_sql: &str) -> EngineResult<TranspileResult>;
}

/// Executes data-modification statements against the backend (§4.12 DML
/// lowering: `INSERT`/`UPDATE`/`DELETE`). Distinct from `BackendExecutor`
/// because FetchXML is a read-only query language — writes go over whatever
/// transport the embedder wires up.
pub trait DmlExecutor: Send + Sync {
    fn insert(&self, entity: &str, rows: Vec<Row>, cancel: &CancellationToken) -> EngineResult<u64>;
    fn update(
        &self,
        entity: &str,
        id_column: &str,
        rows: Vec<Row>,
        set_columns: &[String],
        cancel: &CancellationToken,
    ) -> EngineResult<u64>;
    fn delete(&self, entity: &str, id_column: &str, ids: Vec<crate::value::Value>, cancel: &CancellationToken) -> EngineResult<u64>;
}

/// Sink for PRINT output and RAISERROR with severity < 11 (§4.11/§7).
pub trait ProgressReporter: Send + Sync {
    fn report(&self, message: &str);
}

/// A `ProgressReporter` that discards everything — the default when the
/// embedder doesn't care about PRINT/low-severity RAISERROR output.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgressReporter;

impl ProgressReporter for NullProgressReporter {
    fn report(&self, _message: &str) {}
}

// ---------------------------------------------------------------------------
// FetchXML enrichment (§4.10 / §6)
// ---------------------------------------------------------------------------

/// Append a `createdon` date-range `<filter>` before the closing
/// `</entity>` tag. Used by `DateRangePartitioner` to scope each partition's
/// FetchXML to its `[start, end)` sub-range.
pub fn enrich_with_date_range(fetchxml: &str, start_iso: &str, end_iso: &str) -> String {
    let filter = format!(
        "<filter type=\"and\"><condition attribute=\"createdon\" operator=\"ge\" value=\"{start_iso}\" /><condition attribute=\"createdon\" operator=\"lt\" value=\"{end_iso}\" /></filter>"
    );
    insert_before_entity_close(fetchxml, &filter)
}

/// Insert a companion `countcolumn` aggregate attribute immediately after
/// an AVG attribute, so a partitioned AVG can be merged correctly
/// (`MergeAggregate`, §4.9).
pub fn enrich_with_avg_companion_count(fetchxml: &str, avg_attribute: &str, count_alias: &str) -> String {
    let needle = format!("aggregate=\"avg\" alias=\"{avg_attribute}\"");
    if let Some(pos) = fetchxml.find(&needle) {
        if let Some(tag_end) = fetchxml[pos..].find("/>") {
            let insert_at = pos + tag_end + 2;
            let companion = format!(
                "<attribute name=\"{avg_attribute}\" aggregate=\"countcolumn\" alias=\"{count_alias}\" />"
            );
            let mut out = String::with_capacity(fetchxml.len() + companion.len());
            out.push_str(&fetchxml[..insert_at]);
            out.push_str(&companion);
            out.push_str(&fetchxml[insert_at..]);
            return out;
        }
    }
    fetchxml.to_string()
}

/// Attempt to push a "simple" uncorrelated `NOT IN (SELECT col FROM other)`
/// down into FetchXML as a `not-in`-shaped `<link-entity>` filter, mirroring
/// `enrich_with_date_range`'s append-before-`</entity>` technique. Only
/// covers the single-column, no-WHERE subquery shape the planner recognizes
/// as "simple" (DESIGN.md, anti-join pushdown open question); anything else
/// is rejected by returning `None` so the planner falls back to
/// `HashSemiJoin`.
pub fn enrich_with_not_in_link(
    fetchxml: &str,
    outer_attribute: &str,
    inner_entity: &str,
    inner_attribute: &str,
) -> Option<String> {
    if !fetchxml.contains("</entity>") {
        return None;
    }
    let link = format!(
        "<link-entity name=\"{inner_entity}\" from=\"{inner_attribute}\" to=\"{outer_attribute}\" link-type=\"outer\" alias=\"notinlink\"><attribute name=\"{inner_attribute}\" /><filter type=\"and\"><condition attribute=\"{inner_attribute}\" operator=\"null\" /></filter></link-entity>"
    );
    Some(insert_before_entity_close(fetchxml, &link))
}

fn insert_before_entity_close(fetchxml: &str, fragment: &str) -> String {
    match fetchxml.rfind("</entity>") {
        Some(pos) => {
            let mut out = String::with_capacity(fetchxml.len() + fragment.len());
            out.push_str(&fetchxml[..pos]);
            out.push_str(fragment);
            out.push_str(&fetchxml[pos..]);
            out
        }
        None => format!("{fetchxml}{fragment}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_range_enrichment_lands_before_entity_close() {
        let fx = "<fetch><entity name=\"account\"><attribute name=\"name\" /></entity></fetch>";
        let out = enrich_with_date_range(fx, "2024-01-01T00:00:00Z", "2024-02-01T00:00:00Z");
        assert!(out.contains("createdon"));
        assert!(out.find("createdon").unwrap() < out.find("</entity>").unwrap());
    }

    #[test]
    fn avg_companion_count_follows_the_avg_attribute() {
        let fx = "<fetch><entity name=\"account\"><attribute name=\"revenue\" aggregate=\"avg\" alias=\"avg_revenue\" /></entity></fetch>";
        let out = enrich_with_avg_companion_count(fx, "avg_revenue", "avg_revenue_count");
        let avg_pos = out.find("aggregate=\"avg\"").unwrap();
        let count_pos = out.find("countcolumn").unwrap();
        assert!(count_pos > avg_pos);
    }
}
