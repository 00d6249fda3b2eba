//! Terminal (leaf) operators: the scans of §4.1.

use std::sync::mpsc;
use std::thread;

use crate::error::{EngineError, EngineResult};
use crate::expr::{Expr, EvalContext, Predicate};
use crate::row::Row;

use super::{ExecutionContext, PlanNode, RowStream};

/// Caller-supplied paging cursor. When present, auto-paging is disabled and
/// exactly one page is produced (§4.1).
#[derive(Debug, Clone)]
pub struct PagingCursor {
    pub page_number: u32,
    pub paging_cookie: String,
}

/// Scan the primary backend via a single FetchXML document, auto-paging
/// until exhausted or `max_rows` is reached.
#[derive(Debug, Clone)]
pub struct FetchXmlScan {
    pub fetchxml: String,
    pub primary_entity: String,
    pub max_rows: Option<u64>,
    pub initial_cursor: Option<PagingCursor>,
    pub include_count: bool,
    /// When true, use `ExecutionContext::remote_backend` instead of the
    /// primary backend (shared implementation with `RemoteScan`).
    pub use_remote_backend: bool,
}

impl FetchXmlScan {
    pub fn execute(&self, ctx: &ExecutionContext) -> EngineResult<RowStream> {
        let backend = ctx.backend_for(self.use_remote_backend);
        let cancel = ctx.cancel.clone();
        let fetchxml = self.fetchxml.clone();
        let max_rows = self.max_rows;
        let include_count = self.include_count;
        let auto_page = self.initial_cursor.is_none();
        let mut cookie = self.initial_cursor.as_ref().map(|c| c.paging_cookie.clone());

        let mut emitted: u64 = 0;
        let mut page_buffer: Vec<Row> = Vec::new();
        let mut page_idx = 0usize;
        let mut exhausted = false;
        let mut first_call = true;

        Ok(Box::new(std::iter::from_fn(move || loop {
            if page_idx < page_buffer.len() {
                if let Some(cap) = max_rows {
                    if emitted >= cap {
                        return None;
                    }
                }
                let row = page_buffer[page_idx].clone();
                page_idx += 1;
                emitted += 1;
                return Some(Ok(row));
            }
            if exhausted {
                return None;
            }
            if cancel.is_cancelled() {
                return Some(Err(EngineError::Cancelled));
            }
            if let Some(cap) = max_rows {
                if emitted >= cap {
                    return None;
                }
            }
            let page = match backend.execute_fetchxml(
                &fetchxml,
                max_rows.map(|m| m - emitted),
                cookie.as_deref(),
                include_count,
                &cancel,
            ) {
                Ok(p) => p,
                Err(e) => {
                    exhausted = true;
                    return Some(Err(e));
                }
            };
            first_call = false;
            page_buffer = page.rows;
            page_idx = 0;
            if !auto_page || !page.more_records || page.paging_cookie.is_none() {
                exhausted = true;
            } else {
                cookie = page.paging_cookie;
            }
            if page_buffer.is_empty() {
                if exhausted || !first_call {
                    return None;
                }
            }
        })))
    }
}

/// Direct-wire passthrough: the statement is forwarded to the TDS executor
/// verbatim and results mapped 1:1 to rows.
#[derive(Debug, Clone)]
pub struct TdsScan {
    pub sql: String,
}

impl TdsScan {
    pub fn execute(&self, ctx: &ExecutionContext) -> EngineResult<RowStream> {
        let tds = ctx
            .tds
            .clone()
            .ok_or_else(|| EngineError::plan("direct-wire passthrough requested but no TDS executor configured"))?;
        let rows = tds.execute_sql(&self.sql, &ctx.cancel)?;
        Ok(Box::new(rows.into_iter().map(Ok)))
    }
}

/// Scan against a `metadata.*` pseudo-table.
#[derive(Clone)]
pub struct MetadataScan {
    pub table_name: String,
    pub rows: Vec<Row>,
    pub projection: Vec<String>,
    pub filter: Option<std::sync::Arc<Predicate>>,
}

impl std::fmt::Debug for MetadataScan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataScan").field("table_name", &self.table_name).finish()
    }
}

impl MetadataScan {
    pub fn execute(&self, ctx: &ExecutionContext) -> EngineResult<RowStream> {
        let projection = self.projection.clone();
        let filter = self.filter.clone();
        let vars = ctx.variables.clone();
        let session = ctx.session.clone();
        let rows = self.rows.clone();
        Ok(Box::new(rows.into_iter().filter_map(move |row| {
            if let Some(pred) = &filter {
                let (v, s) = (vars.lock().unwrap(), session.lock().unwrap());
                let eval_ctx = EvalContext::new(Some(&*v), Some(&*s));
                match pred.test(&row, &eval_ctx) {
                    Ok(true) => {}
                    Ok(false) => return None,
                    Err(e) => return Some(Err(e)),
                }
            }
            if projection.is_empty() {
                return Some(Ok(row));
            }
            let mut out = Row::new();
            out.entity = row.entity.clone();
            for col in &projection {
                out.set(col.clone(), row.get(col).cloned().unwrap_or(crate::value::Value::Null));
            }
            Some(Ok(out))
        })))
    }
}

/// Read rows from a session temp table (`#name`).
#[derive(Debug, Clone)]
pub struct TempTableScan {
    pub name: String,
}

impl TempTableScan {
    pub fn execute(&self, ctx: &ExecutionContext) -> EngineResult<RowStream> {
        let table = ctx.session.lock().unwrap().get_temp_rows(&self.name)?.clone();
        Ok(Box::new(table.rows.into_iter().map(Ok)))
    }
}

/// Read a pre-materialized row list produced by an earlier CTE evaluation.
#[derive(Debug, Clone)]
pub struct CteScan {
    pub name: String,
    pub rows: std::sync::Arc<Vec<Row>>,
}

impl CteScan {
    pub fn execute(&self, _ctx: &ExecutionContext) -> EngineResult<RowStream> {
        let rows = self.rows.clone();
        Ok(Box::new((0..rows.len()).map(move |i| Ok(rows[i].clone()))))
    }
}

/// Identical to `FetchXmlScan` but targets `ExecutionContext::remote_backend`.
#[derive(Debug, Clone)]
pub struct RemoteScan {
    pub scan: FetchXmlScan,
}

impl RemoteScan {
    pub fn execute(&self, ctx: &ExecutionContext) -> EngineResult<RowStream> {
        let mut scan = self.scan.clone();
        scan.use_remote_backend = true;
        scan.execute(ctx)
    }
}

/// `PrefetchScan`: spawn a producer thread reading up to `buffer` rows ahead
/// into a bounded channel; the outer iterator drains that channel (§4.1/§5).
///
/// The child stream is built on the calling thread (so any planning-time
/// borrows are already resolved) and then handed to the worker thread —
/// sound because `RowStream` is `Send` and the shared variable scope /
/// session context are `Arc<Mutex<_>>` (§5's single-writer policy is about
/// who mutates them, not which thread the bytes live on).
pub fn execute_prefetch(child: &PlanNode, buffer: usize, ctx: &ExecutionContext) -> EngineResult<RowStream> {
    let (tx, rx) = mpsc::sync_channel::<EngineResult<Row>>(buffer.max(1));
    let stream = child.execute(ctx)?;
    let cancel = ctx.cancel.clone();
    thread::Builder::new()
        .name("fetchql-prefetch".into())
        .spawn(move || {
            for item in stream {
                if cancel.is_cancelled() {
                    let _ = tx.send(Err(EngineError::Cancelled));
                    return;
                }
                if tx.send(item).is_err() {
                    return;
                }
            }
        })
        .map_err(|e| EngineError::execution(format!("failed to spawn prefetch thread: {e}")))?;
    Ok(Box::new(rx.into_iter()))
}
