//! Variable scope and session context (§3).

use std::collections::HashMap;

use crate::error::{EngineError, EngineResult};
use crate::row::Row;
use crate::value::Value;

/// A declared SQL type for a variable, as named in a `DECLARE @v T` clause.
/// Only tracked for display/diagnostics — the engine itself is dynamically
/// typed at the `Value` level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeclaredType {
    Int,
    Varchar,
    Decimal,
    Float,
    Bit,
    Uuid,
    DateTime,
    Other(String),
}

impl DeclaredType {
    pub fn from_name(name: &str) -> DeclaredType {
        match name.to_ascii_uppercase().as_str() {
            "INT" | "INTEGER" | "BIGINT" | "SMALLINT" | "TINYINT" => DeclaredType::Int,
            "VARCHAR" | "NVARCHAR" | "CHAR" | "NCHAR" | "TEXT" => DeclaredType::Varchar,
            "DECIMAL" | "NUMERIC" | "MONEY" => DeclaredType::Decimal,
            "FLOAT" | "REAL" => DeclaredType::Float,
            "BIT" | "BOOLEAN" => DeclaredType::Bit,
            "UNIQUEIDENTIFIER" | "UUID" => DeclaredType::Uuid,
            "DATETIME" | "DATETIME2" | "DATE" | "TIMESTAMP" => DeclaredType::DateTime,
            other => DeclaredType::Other(other.to_string()),
        }
    }
}

/// `@`-prefixed variable scope. Declare-before-use, single scope (no nested
/// lexical scoping beyond what the script driver threads through blocks).
#[derive(Debug, Clone, Default)]
pub struct VariableScope {
    vars: HashMap<String, (DeclaredType, Value)>,
}

fn normalize_name(name: &str) -> String {
    name.trim_start_matches('@').to_ascii_uppercase()
}

impl VariableScope {
    pub fn new() -> Self {
        VariableScope { vars: HashMap::new() }
    }

    pub fn declare(&mut self, name: &str, ty: DeclaredType, initial: Value) -> EngineResult<()> {
        let key = normalize_name(name);
        if self.vars.contains_key(&key) {
            return Err(EngineError::plan(format!(
                "variable '{name}' is already declared in this scope"
            )));
        }
        self.vars.insert(key, (ty, initial));
        Ok(())
    }

    pub fn set(&mut self, name: &str, value: Value) -> EngineResult<()> {
        let key = normalize_name(name);
        match self.vars.get_mut(&key) {
            Some((_, slot)) => {
                *slot = value;
                Ok(())
            }
            None => Err(EngineError::plan(format!(
                "variable '{name}' must be declared before it can be set"
            ))),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(&normalize_name(name)).map(|(_, v)| v)
    }

    pub fn is_declared(&self, name: &str) -> bool {
        self.vars.contains_key(&normalize_name(name))
    }

    pub fn declared_type(&self, name: &str) -> Option<&DeclaredType> {
        self.vars.get(&normalize_name(name)).map(|(t, _)| t)
    }
}

/// A materialized temp table (`#name`): ordered column list plus rows.
#[derive(Debug, Clone, Default)]
pub struct TempTable {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

/// The last error recorded by a TRY/CATCH transition, exposed read-only to
/// the expression evaluator as `@@ERROR_*` (see DESIGN.md open question).
#[derive(Debug, Clone, Default)]
pub struct SessionError {
    pub number: i32,
    pub message: String,
    pub severity: i32,
    pub state: i32,
}

/// Per-execution session state: caller identity, last error, and the temp
/// table registry. Lifetime of a temp table == lifetime of the
/// `SessionContext` that created it.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub caller_object_id: Option<String>,
    pub last_error: Option<SessionError>,
    temp_tables: HashMap<String, TempTable>,
}

fn normalize_temp_name(name: &str) -> String {
    name.trim_start_matches('#').to_ascii_uppercase()
}

impl SessionContext {
    pub fn new() -> Self {
        SessionContext::default()
    }

    pub fn create_temp_table(&mut self, name: &str, columns: Vec<String>) {
        self.temp_tables.insert(
            normalize_temp_name(name),
            TempTable { columns, rows: Vec::new() },
        );
    }

    pub fn insert_into_temp(&mut self, name: &str, rows: impl IntoIterator<Item = Row>) -> EngineResult<()> {
        let key = normalize_temp_name(name);
        let table = self
            .temp_tables
            .get_mut(&key)
            .ok_or_else(|| EngineError::plan(format!("temp table '#{name}' does not exist")))?;
        table.rows.extend(rows);
        Ok(())
    }

    pub fn get_temp_rows(&self, name: &str) -> EngineResult<&TempTable> {
        self.temp_tables
            .get(&normalize_temp_name(name))
            .ok_or_else(|| EngineError::plan(format!("temp table '#{name}' does not exist")))
    }

    pub fn temp_exists(&self, name: &str) -> bool {
        self.temp_tables.contains_key(&normalize_temp_name(name))
    }

    pub fn drop_temp(&mut self, name: &str) {
        self.temp_tables.remove(&normalize_temp_name(name));
    }

    /// Record a caught (or about-to-propagate) error as the session's last
    /// error — called at CATCH entry (§7).
    pub fn record_error(&mut self, err: &EngineError) {
        self.last_error = Some(SessionError {
            number: err.error_number(),
            message: err.error_message(),
            severity: 16,
            state: err.error_state(),
        });
    }

    /// Clear the session error — called on successful TRY completion (§7).
    pub fn clear_error(&mut self) {
        self.last_error = None;
    }
}
