//! Script execution & control flow (§4.11): `DECLARE`/`SET`/assignment-form
//! `SELECT`/`IF`/`WHILE`/`BREAK`/`CONTINUE`/`BEGIN...END`/`TRY...CATCH`/
//! `THROW`/`RAISERROR`/`PRINT`.
//!
//! T-SQL's batch control-flow grammar isn't part of the AST `sqlparser`
//! gives us (its `Statement` enum covers one `SELECT`/`INSERT`/`UPDATE`/
//! `DELETE` at a time, not a batch of them glued together with `IF`/`WHILE`).
//! `ScriptParser` below is a small hand-rolled batch splitter: it recognizes
//! the control-flow keywords and tracks only paren depth and quote state
//! well enough to find statement boundaries, then hands every leaf SQL
//! fragment back to `sqlparser` to parse. It never re-implements SELECT or
//! expression grammar itself — `Planner::plan` and `parse_scalar_expr` below
//! do all of the real parsing.

use sqlparser::ast::{BinaryOperator, Expr as SqlExpr, Ident, Query, Select, SelectItem, SetExpr, Statement};
use sqlparser::dialect::MsSqlDialect;
use sqlparser::parser::Parser;

use crate::error::{EngineError, EngineResult};
use crate::expr::{self, EvalContext};
use crate::plan::{ExecutionContext, PlanNode, RowStream};
use crate::planner::{execute_dml, lower_expr, PlanOutput, Planner};
use crate::row::Row;
use crate::session::DeclaredType;
use crate::value::Value;

/// Default `WHILE` iteration cap (§4.11, §6 `dml_row_cap`'s sibling knob —
/// unlike that one this isn't currently configurable, since no script in the
/// test corpus needs more than a few thousand iterations).
pub const DEFAULT_MAX_WHILE_ITERATIONS: u64 = 10_000;

const STOP_WORDS: &[&str] = &[
    "DECLARE", "SET", "IF", "ELSE", "WHILE", "BREAK", "CONTINUE", "BEGIN", "END", "THROW",
    "RAISERROR", "PRINT", "TRY", "CATCH",
];

// ---------------------------------------------------------------------------
// Statement AST
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum ScriptStatement {
    Declare(Vec<DeclareItem>),
    SetVar { name: String, expr: SqlExpr },
    /// A plain `SELECT`/`INSERT`/`UPDATE`/`DELETE` handed wholesale to
    /// `Planner`. `into` is the temp table name for `SELECT ... INTO #t`,
    /// stripped out of `stmt`'s text before `sqlparser` ever sees it.
    Sql { stmt: Statement, into: Option<String> },
    If { predicate: SqlExpr, then_branch: Box<ScriptStatement>, else_branch: Option<Box<ScriptStatement>> },
    While { predicate: SqlExpr, body: Box<ScriptStatement> },
    Break,
    Continue,
    Block(Vec<ScriptStatement>),
    TryCatch { try_body: Vec<ScriptStatement>, catch_body: Vec<ScriptStatement> },
    Throw(Option<ThrowArgs>),
    RaisError { format: SqlExpr, severity: SqlExpr, state: SqlExpr, args: Vec<SqlExpr> },
    Print(SqlExpr),
}

#[derive(Debug)]
struct DeclareItem {
    name: String,
    declared_type: DeclaredType,
    init: Option<SqlExpr>,
}

#[derive(Debug)]
struct ThrowArgs {
    number: SqlExpr,
    message: SqlExpr,
    state: SqlExpr,
}

/// A parsed T-SQL batch, ready to run against a shared variable scope and
/// session context.
pub struct ScriptExecution {
    statements: Vec<ScriptStatement>,
}

impl ScriptExecution {
    pub fn parse(sql: &str) -> EngineResult<Self> {
        let mut cur = Cursor::new(sql);
        let statements = parse_statement_list(&mut cur, &[])?;
        if !cur.is_done() {
            return Err(EngineError::plan("unexpected trailing input in script"));
        }
        Ok(ScriptExecution { statements })
    }

    /// Runs every statement in order against `ctx`'s variable scope and
    /// session context, returning the rows of the last row-producing
    /// statement in the sequence (§4.11) — an empty stream if none produced
    /// rows. Seeds the variable scope from `planner.config.variable_scope`
    /// when one was supplied (§6).
    pub fn run(&self, planner: &Planner, ctx: &ExecutionContext) -> EngineResult<RowStream> {
        if let Some(seed) = &planner.config.variable_scope {
            *ctx.variables.lock().unwrap() = seed.clone();
        }
        let last = exec_list(&self.statements, planner, ctx)?;
        Ok(Box::new(last.unwrap_or_default().into_iter().map(Ok)))
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

fn exec_list(
    stmts: &[ScriptStatement],
    planner: &Planner,
    ctx: &ExecutionContext,
) -> EngineResult<Option<Vec<Row>>> {
    let mut last = None;
    for stmt in stmts {
        ctx.check_cancelled()?;
        if let Some(rows) = exec_statement(stmt, planner, ctx)? {
            last = Some(rows);
        }
    }
    Ok(last)
}

fn exec_statement(
    stmt: &ScriptStatement,
    planner: &Planner,
    ctx: &ExecutionContext,
) -> EngineResult<Option<Vec<Row>>> {
    match stmt {
        ScriptStatement::Declare(items) => {
            for item in items {
                let value = match &item.init {
                    Some(e) => eval_scalar(e, ctx)?,
                    None => Value::Null,
                };
                ctx.variables.lock().unwrap().declare(&item.name, item.declared_type.clone(), value)?;
            }
            Ok(None)
        }
        ScriptStatement::SetVar { name, expr } => {
            let value = eval_scalar(expr, ctx)?;
            ctx.variables.lock().unwrap().set(name, value)?;
            Ok(None)
        }
        ScriptStatement::Sql { stmt, into } => exec_sql_statement(stmt, into, planner, ctx),
        ScriptStatement::Break => Err(EngineError::Break),
        ScriptStatement::Continue => Err(EngineError::Continue),
        ScriptStatement::Block(body) => exec_list(body, planner, ctx),
        ScriptStatement::If { predicate, then_branch, else_branch } => {
            if eval_scalar(predicate, ctx)?.truthy().unwrap_or(false) {
                exec_statement(then_branch, planner, ctx)
            } else if let Some(else_b) = else_branch {
                exec_statement(else_b, planner, ctx)
            } else {
                Ok(None)
            }
        }
        ScriptStatement::While { predicate, body } => exec_while(predicate, body, planner, ctx),
        ScriptStatement::TryCatch { try_body, catch_body } => exec_try_catch(try_body, catch_body, planner, ctx),
        ScriptStatement::Throw(args) => exec_throw(args, ctx),
        ScriptStatement::RaisError { format, severity, state, args } => {
            exec_raiserror(format, severity, state, args, ctx)
        }
        ScriptStatement::Print(expr) => {
            let value = eval_scalar(expr, ctx)?;
            ctx.progress.report(&value.display_string());
            Ok(None)
        }
    }
}

fn exec_while(
    predicate: &SqlExpr,
    body: &ScriptStatement,
    planner: &Planner,
    ctx: &ExecutionContext,
) -> EngineResult<Option<Vec<Row>>> {
    let mut last = None;
    let mut iterations: u64 = 0;
    loop {
        ctx.check_cancelled()?;
        if !eval_scalar(predicate, ctx)?.truthy().unwrap_or(false) {
            break;
        }
        iterations += 1;
        if iterations > DEFAULT_MAX_WHILE_ITERATIONS {
            return Err(EngineError::IterationCap(format!(
                "WHILE loop exceeded the maximum of {DEFAULT_MAX_WHILE_ITERATIONS} iterations"
            )));
        }
        match exec_statement(body, planner, ctx) {
            Ok(rows) => {
                if rows.is_some() {
                    last = rows;
                }
            }
            Err(EngineError::Break) => break,
            Err(EngineError::Continue) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(last)
}

fn exec_try_catch(
    try_body: &[ScriptStatement],
    catch_body: &[ScriptStatement],
    planner: &Planner,
    ctx: &ExecutionContext,
) -> EngineResult<Option<Vec<Row>>> {
    match exec_list(try_body, planner, ctx) {
        Ok(rows) => {
            ctx.session.lock().unwrap().clear_error();
            Ok(rows)
        }
        Err(e) if e.is_uncatchable_signal() => Err(e),
        Err(e) => {
            ctx.session.lock().unwrap().record_error(&e);
            exec_list(catch_body, planner, ctx)
        }
    }
}

fn exec_throw(args: &Option<ThrowArgs>, ctx: &ExecutionContext) -> EngineResult<Option<Vec<Row>>> {
    match args {
        Some(a) => {
            let number = value_as_i32(&eval_scalar(&a.number, ctx)?).unwrap_or(EngineError::DEFAULT_THROW_NUMBER);
            let message = eval_scalar(&a.message, ctx)?.display_string();
            let state = value_as_i32(&eval_scalar(&a.state, ctx)?).unwrap_or(1);
            Err(EngineError::UserRaised { number, message, state })
        }
        None => {
            let last = ctx.session.lock().unwrap().last_error.clone();
            match last {
                Some(e) => Err(EngineError::UserRaised { number: e.number, message: e.message, state: e.state }),
                None => Err(EngineError::plan("THROW with no active error to re-raise")),
            }
        }
    }
}

fn exec_raiserror(
    format: &SqlExpr,
    severity: &SqlExpr,
    state: &SqlExpr,
    args: &[SqlExpr],
    ctx: &ExecutionContext,
) -> EngineResult<Option<Vec<Row>>> {
    let format_value = eval_scalar(format, ctx)?.display_string();
    let severity_n = value_as_i32(&eval_scalar(severity, ctx)?).unwrap_or(0);
    let state_n = value_as_i32(&eval_scalar(state, ctx)?).unwrap_or(1);
    let arg_values = args.iter().map(|a| eval_scalar(a, ctx)).collect::<EngineResult<Vec<_>>>()?;
    let message = substitute_placeholders(&format_value, &arg_values);
    if severity_n >= 11 {
        Err(EngineError::UserRaised { number: EngineError::DEFAULT_THROW_NUMBER, message, state: state_n })
    } else {
        ctx.progress.report(&message);
        Ok(None)
    }
}

/// Substitutes `%s`/`%d`/`%i` placeholders in order, T-SQL `RAISERROR`
/// style. `%%` is a literal `%`.
fn substitute_placeholders(format: &str, args: &[Value]) -> String {
    let mut out = String::with_capacity(format.len());
    let mut chars = format.chars().peekable();
    let mut args = args.iter();
    while let Some(c) = chars.next() {
        if c == '%' {
            match chars.peek() {
                Some('s') | Some('d') | Some('i') => {
                    chars.next();
                    if let Some(v) = args.next() {
                        out.push_str(&v.display_string());
                    }
                    continue;
                }
                Some('%') => {
                    chars.next();
                    out.push('%');
                    continue;
                }
                _ => {}
            }
        }
        out.push(c);
    }
    out
}

fn value_as_i32(v: &Value) -> Option<i32> {
    match v {
        Value::Int(i) => Some(*i as i32),
        Value::Float(f) => Some(*f as i32),
        Value::Decimal(d) => d.to_string().parse().ok(),
        _ => None,
    }
}

fn eval_scalar(expr: &SqlExpr, ctx: &ExecutionContext) -> EngineResult<Value> {
    let core = lower_expr(expr)?;
    let (variables, session) = ctx.eval_scope();
    let eval_ctx = EvalContext::new(Some(&variables), Some(&session));
    expr::eval(&core, &Row::new(), &eval_ctx)
}

fn materialize(plan: &PlanNode, ctx: &ExecutionContext) -> EngineResult<Vec<Row>> {
    let mut out = Vec::new();
    for row in plan.execute(ctx)? {
        ctx.check_cancelled()?;
        out.push(row?);
    }
    Ok(out)
}

/// One `@v = expr` projection item of an assignment-form `SELECT`.
struct AssignSpec {
    name: String,
    expr: SqlExpr,
}

fn extract_assignments(select: &Select) -> Option<Vec<AssignSpec>> {
    let mut out = Vec::new();
    for item in &select.projection {
        if let SelectItem::UnnamedExpr(SqlExpr::BinaryOp { left, op: BinaryOperator::Eq, right }) = item {
            if let SqlExpr::Identifier(id) = left.as_ref() {
                if id.value.starts_with('@') {
                    out.push(AssignSpec { name: id.value.clone(), expr: (**right).clone() });
                }
            }
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

fn exec_sql_statement(
    stmt: &Statement,
    into: &Option<String>,
    planner: &Planner,
    ctx: &ExecutionContext,
) -> EngineResult<Option<Vec<Row>>> {
    if let Statement::Query(query) = stmt {
        if let SetExpr::Select(select) = query.body.as_ref() {
            if let Some(assignments) = extract_assignments(select) {
                exec_assignment_select(query, select, &assignments, planner, ctx)?;
                return Ok(None);
            }
        }
    }
    match planner.plan(stmt)? {
        PlanOutput::Select(plan) => {
            let rows = materialize(&plan, ctx)?;
            if let Some(name) = into {
                let columns: Vec<String> =
                    rows.first().map(|r| r.keys().map(|k| k.to_string()).collect()).unwrap_or_default();
                let mut session = ctx.session.lock().unwrap();
                session.create_temp_table(name, columns);
                session.insert_into_temp(name, rows)?;
                return Ok(None);
            }
            Ok(Some(rows))
        }
        PlanOutput::Dml(dml) => {
            execute_dml(&dml, ctx)?;
            Ok(None)
        }
    }
}

/// `SELECT @a = expr1, @b = expr2 [FROM ...]`: with no `FROM`, each
/// assignment is a plain scalar evaluation. With a `FROM`, the assignment
/// targets take the value from the *last* row of the (otherwise ordinary)
/// result set — we replan with the assignment items rewritten to aliased
/// plain expressions and run that instead.
fn exec_assignment_select(
    query: &Query,
    select: &Select,
    assignments: &[AssignSpec],
    planner: &Planner,
    ctx: &ExecutionContext,
) -> EngineResult<()> {
    if select.from.is_empty() {
        for a in assignments {
            let value = eval_scalar(&a.expr, ctx)?;
            ctx.variables.lock().unwrap().set(&a.name, value)?;
        }
        return Ok(());
    }

    let mut rebuilt_select = select.clone();
    let mut assign_idx = 0usize;
    for item in rebuilt_select.projection.iter_mut() {
        let is_assignment = matches!(
            item,
            SelectItem::UnnamedExpr(SqlExpr::BinaryOp { op: BinaryOperator::Eq, left, .. })
                if matches!(left.as_ref(), SqlExpr::Identifier(id) if id.value.starts_with('@'))
        );
        if !is_assignment {
            continue;
        }
        if let SelectItem::UnnamedExpr(SqlExpr::BinaryOp { right, .. }) = item {
            *item = SelectItem::ExprWithAlias {
                expr: (**right).clone(),
                alias: Ident::new(format!("__assign_{assign_idx}")),
            };
            assign_idx += 1;
        }
    }
    let mut rebuilt_query = query.clone();
    rebuilt_query.body = Box::new(SetExpr::Select(Box::new(rebuilt_select)));

    let plan = match planner.plan(&Statement::Query(Box::new(rebuilt_query)))? {
        PlanOutput::Select(plan) => plan,
        PlanOutput::Dml(_) => {
            return Err(EngineError::InvariantViolation("assignment SELECT planned as DML".into()))
        }
    };
    let rows = materialize(&plan, ctx)?;
    let last_row = rows.last();
    for (i, a) in assignments.iter().enumerate() {
        let alias = format!("__assign_{i}");
        let value = last_row.and_then(|r| r.get(&alias)).cloned().unwrap_or(Value::Null);
        ctx.variables.lock().unwrap().set(&a.name, value)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Parsing: script-level control flow
// ---------------------------------------------------------------------------

fn parse_statement_list(cur: &mut Cursor, stop_words: &[&str]) -> EngineResult<Vec<ScriptStatement>> {
    let mut out = Vec::new();
    loop {
        if cur.is_done() {
            break;
        }
        match cur.peek_keyword_upper() {
            Some(kw) if stop_words.iter().any(|s| kw.eq_ignore_ascii_case(s)) => break,
            _ => {}
        }
        out.push(parse_statement(cur)?);
    }
    Ok(out)
}

fn parse_statement(cur: &mut Cursor) -> EngineResult<ScriptStatement> {
    if cur.is_done() {
        return Err(EngineError::plan("expected a statement"));
    }
    if cur.eat_seq(&["BEGIN", "TRY"]) {
        let try_body = parse_statement_list(cur, &["END"])?;
        if !cur.eat_seq(&["END", "TRY"]) {
            return Err(EngineError::plan("expected END TRY"));
        }
        if !cur.eat_seq(&["BEGIN", "CATCH"]) {
            return Err(EngineError::plan("expected BEGIN CATCH after END TRY"));
        }
        let catch_body = parse_statement_list(cur, &["END"])?;
        if !cur.eat_seq(&["END", "CATCH"]) {
            return Err(EngineError::plan("expected END CATCH"));
        }
        return Ok(ScriptStatement::TryCatch { try_body, catch_body });
    }
    if cur.eat_keyword("BEGIN") {
        let body = parse_statement_list(cur, &["END"])?;
        if !cur.eat_keyword("END") {
            return Err(EngineError::plan("expected END"));
        }
        return Ok(ScriptStatement::Block(body));
    }
    if cur.eat_keyword("DECLARE") {
        return parse_declare(cur);
    }
    if cur.eat_keyword("SET") {
        return parse_set(cur);
    }
    if cur.eat_keyword("IF") {
        return parse_if(cur);
    }
    if cur.eat_keyword("WHILE") {
        return parse_while(cur);
    }
    if cur.eat_keyword("BREAK") {
        cur.eat_char(';');
        return Ok(ScriptStatement::Break);
    }
    if cur.eat_keyword("CONTINUE") {
        cur.eat_char(';');
        return Ok(ScriptStatement::Continue);
    }
    if cur.eat_keyword("THROW") {
        return parse_throw(cur);
    }
    if cur.eat_keyword("RAISERROR") {
        return parse_raiserror(cur);
    }
    if cur.eat_keyword("PRINT") {
        let text = cur.capture_text(false);
        cur.eat_char(';');
        return Ok(ScriptStatement::Print(parse_scalar_expr(text)?));
    }

    // Fallback: a plain SELECT/INSERT/UPDATE/DELETE/WITH statement.
    let text = cur.capture_text(false);
    cur.eat_char(';');
    if text.is_empty() {
        return Err(EngineError::plan("expected a statement"));
    }
    let (clean_text, into) = strip_into_clause(text);
    let stmt = parse_one_statement(&clean_text)?;
    Ok(ScriptStatement::Sql { stmt, into })
}

fn parse_declare(cur: &mut Cursor) -> EngineResult<ScriptStatement> {
    let mut items = Vec::new();
    loop {
        let name = cur.bump_ident().ok_or_else(|| EngineError::plan("DECLARE requires a variable name"))?;
        if !name.starts_with('@') {
            return Err(EngineError::plan(format!("DECLARE variable '{name}' must start with '@'")));
        }
        let type_name = cur.bump_ident().ok_or_else(|| EngineError::plan("DECLARE requires a type"))?;
        let declared_type = DeclaredType::from_name(type_name);
        if cur.peek_char() == Some('(') {
            cur.capture_parenthesized()?;
        }
        let init = if cur.eat_char('=') {
            Some(parse_scalar_expr(cur.capture_text(true))?)
        } else {
            None
        };
        items.push(DeclareItem { name: name.to_string(), declared_type, init });
        if cur.eat_char(',') {
            continue;
        }
        break;
    }
    cur.eat_char(';');
    Ok(ScriptStatement::Declare(items))
}

fn parse_set(cur: &mut Cursor) -> EngineResult<ScriptStatement> {
    let name = cur.bump_ident().ok_or_else(|| EngineError::plan("SET requires a variable name"))?;
    if !name.starts_with('@') {
        return Err(EngineError::plan(format!("SET target '{name}' must be a variable")));
    }
    if !cur.eat_char('=') {
        return Err(EngineError::plan("SET requires '='"));
    }
    let expr = parse_scalar_expr(cur.capture_text(false))?;
    cur.eat_char(';');
    Ok(ScriptStatement::SetVar { name: name.to_string(), expr })
}

/// `IF`/`WHILE` bodies are required to be either a `BEGIN...END` block or a
/// single statement starting with one of the control-flow keywords
/// (`SET`/`DECLARE`/`IF`/`WHILE`/...); a bare single `SELECT`/`INSERT`/
/// `UPDATE`/`DELETE` body with no `BEGIN`/`END` isn't supported by this
/// splitter (DESIGN.md "bare IF/WHILE body") — in practice such bodies are
/// always wrapped in `BEGIN...END`.
fn parse_if(cur: &mut Cursor) -> EngineResult<ScriptStatement> {
    let predicate = parse_scalar_expr(cur.capture_text(false))?;
    let then_branch = Box::new(parse_statement(cur)?);
    let else_branch =
        if cur.eat_keyword("ELSE") { Some(Box::new(parse_statement(cur)?)) } else { None };
    Ok(ScriptStatement::If { predicate, then_branch, else_branch })
}

fn parse_while(cur: &mut Cursor) -> EngineResult<ScriptStatement> {
    let predicate = parse_scalar_expr(cur.capture_text(false))?;
    let body = Box::new(parse_statement(cur)?);
    Ok(ScriptStatement::While { predicate, body })
}

fn parse_throw(cur: &mut Cursor) -> EngineResult<ScriptStatement> {
    let first = cur.capture_text(true);
    if first.is_empty() {
        cur.eat_char(';');
        return Ok(ScriptStatement::Throw(None));
    }
    let mut args = vec![first];
    while cur.eat_char(',') {
        args.push(cur.capture_text(true));
    }
    cur.eat_char(';');
    if args.len() != 3 {
        return Err(EngineError::plan("THROW requires exactly 3 arguments: error number, message, state"));
    }
    Ok(ScriptStatement::Throw(Some(ThrowArgs {
        number: parse_scalar_expr(args[0])?,
        message: parse_scalar_expr(args[1])?,
        state: parse_scalar_expr(args[2])?,
    })))
}

fn parse_raiserror(cur: &mut Cursor) -> EngineResult<ScriptStatement> {
    let inner = cur.capture_parenthesized()?;
    cur.eat_char(';');
    let parts: Vec<&str> =
        split_top_level_commas(inner).into_iter().map(str::trim).filter(|s| !s.is_empty()).collect();
    if parts.len() < 3 {
        return Err(EngineError::plan("RAISERROR requires at least (message, severity, state)"));
    }
    let format = parse_scalar_expr(parts[0])?;
    let severity = parse_scalar_expr(parts[1])?;
    let state = parse_scalar_expr(parts[2])?;
    let args = parts[3..].iter().map(|p| parse_scalar_expr(p)).collect::<EngineResult<Vec<_>>>()?;
    Ok(ScriptStatement::RaisError { format, severity, state, args })
}

/// Finds a top-level `INTO #name` between the `SELECT` list and `FROM`
/// (T-SQL-specific syntax `sqlparser`'s generic dialect doesn't expect in
/// this position) and splices it out before handing the text to `sqlparser`.
fn strip_into_clause(text: &str) -> (String, Option<String>) {
    let mut cur = Cursor::new(text);
    if !cur.eat_keyword("SELECT") {
        return (text.to_string(), None);
    }
    cur.capture_text_with_stops(&["INTO", "FROM"], false);
    cur.skip_trivia();
    let into_kw_start = cur.pos;
    if !cur.eat_keyword("INTO") {
        return (text.to_string(), None);
    }
    let Some(name) = cur.bump_ident() else {
        return (text.to_string(), None);
    };
    let name = name.trim_start_matches('#').to_string();
    let into_end = cur.pos;
    let rebuilt = format!("{}{}", &text[..into_kw_start], &text[into_end..]);
    (rebuilt, Some(name))
}

fn split_top_level_commas(text: &str) -> Vec<&str> {
    let mut cur = Cursor::new(text);
    let mut parts = Vec::new();
    loop {
        parts.push(cur.capture_text(true));
        if !cur.eat_char(',') {
            break;
        }
    }
    parts
}

fn parse_scalar_expr(text: &str) -> EngineResult<SqlExpr> {
    let dialect = MsSqlDialect {};
    let mut parser = Parser::new(&dialect).try_with_sql(text).map_err(|e| EngineError::plan(e.to_string()))?;
    parser.parse_expr().map_err(|e| EngineError::plan(e.to_string()))
}

fn parse_one_statement(text: &str) -> EngineResult<Statement> {
    let dialect = MsSqlDialect {};
    let mut statements = Parser::parse_sql(&dialect, text).map_err(|e| EngineError::plan(e.to_string()))?;
    if statements.len() != 1 {
        return Err(EngineError::plan("expected exactly one SQL statement"));
    }
    Ok(statements.remove(0))
}

// ---------------------------------------------------------------------------
// Lexing
// ---------------------------------------------------------------------------

/// A cheap, `Copy`-able scan position into the batch text. Speculative
/// lookahead (`eat_keyword`, `eat_seq`) probes a cloned cursor and only
/// commits the position back on a match.
#[derive(Clone, Copy)]
struct Cursor<'a> {
    src: &'a str,
    pos: usize,
}

fn peek_ident_at(src: &str, pos: usize) -> Option<&str> {
    let rest = &src[pos..];
    let mut chars = rest.char_indices();
    let (_, c0) = chars.next()?;
    if !(c0.is_alphabetic() || c0 == '_' || c0 == '@' || c0 == '#') {
        return None;
    }
    let mut end = c0.len_utf8();
    for (i, c) in chars {
        if c.is_alphanumeric() || c == '_' || c == '@' || c == '#' || c == '$' {
            end = i + c.len_utf8();
        } else {
            break;
        }
    }
    Some(&rest[..end])
}

impl<'a> Cursor<'a> {
    fn new(src: &'a str) -> Self {
        Cursor { src, pos: 0 }
    }

    fn skip_trivia(&mut self) {
        loop {
            let rest = &self.src[self.pos..];
            let trimmed = rest.trim_start();
            self.pos += rest.len() - trimmed.len();
            if trimmed.starts_with("--") {
                self.pos += match trimmed.find('\n') {
                    Some(nl) => nl,
                    None => trimmed.len(),
                };
                continue;
            }
            if trimmed.starts_with("/*") {
                self.pos += match trimmed.find("*/") {
                    Some(end) => end + 2,
                    None => trimmed.len(),
                };
                continue;
            }
            break;
        }
    }

    fn is_done(&mut self) -> bool {
        self.skip_trivia();
        self.pos >= self.src.len()
    }

    fn peek_ident(&mut self) -> Option<&'a str> {
        self.skip_trivia();
        peek_ident_at(self.src, self.pos)
    }

    fn bump_ident(&mut self) -> Option<&'a str> {
        let w = self.peek_ident()?;
        self.pos += w.len();
        Some(w)
    }

    fn peek_keyword_upper(&mut self) -> Option<String> {
        self.peek_ident().map(|w| w.to_ascii_uppercase())
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        let mut probe = *self;
        match probe.peek_ident() {
            Some(w) if w.eq_ignore_ascii_case(kw) => {
                probe.pos += w.len();
                *self = probe;
                true
            }
            _ => false,
        }
    }

    fn eat_seq(&mut self, words: &[&str]) -> bool {
        let mut probe = *self;
        for w in words {
            if !probe.eat_keyword(w) {
                return false;
            }
        }
        *self = probe;
        true
    }

    fn peek_char(&mut self) -> Option<char> {
        self.skip_trivia();
        self.src[self.pos..].chars().next()
    }

    fn eat_char(&mut self, ch: char) -> bool {
        self.skip_trivia();
        if self.src[self.pos..].starts_with(ch) {
            self.pos += ch.len_utf8();
            true
        } else {
            false
        }
    }

    fn skip_until_quote(&mut self, q: char) {
        while self.pos < self.src.len() {
            let c = self.src[self.pos..].chars().next().unwrap();
            self.pos += c.len_utf8();
            if c == q {
                if self.src[self.pos..].starts_with(q) {
                    self.pos += q.len_utf8();
                    continue;
                }
                break;
            }
        }
    }

    /// Captures text up to (not including) the next top-level stop keyword,
    /// `;`, trailing `,` (if `stop_at_comma`), unmatched `)`, or end of
    /// input — skipping over parenthesized groups, bracketed identifiers,
    /// and quoted strings so they can't be mistaken for boundaries.
    fn capture_text_with_stops(&mut self, stops: &[&str], stop_at_comma: bool) -> &'a str {
        self.skip_trivia();
        let start = self.pos;
        let mut depth: i32 = 0;
        while self.pos < self.src.len() {
            let c = self.src[self.pos..].chars().next().unwrap();
            match c {
                '\'' => {
                    self.pos += 1;
                    self.skip_until_quote('\'');
                    continue;
                }
                '"' => {
                    self.pos += 1;
                    self.skip_until_quote('"');
                    continue;
                }
                '[' => {
                    self.pos += 1;
                    self.skip_until_quote(']');
                    continue;
                }
                '(' => {
                    depth += 1;
                    self.pos += 1;
                    continue;
                }
                ')' => {
                    if depth == 0 {
                        break;
                    }
                    depth -= 1;
                    self.pos += 1;
                    continue;
                }
                ';' if depth == 0 => break,
                ',' if depth == 0 && stop_at_comma => break,
                _ => {}
            }
            if depth == 0 {
                if let Some(w) = peek_ident_at(self.src, self.pos) {
                    if stops.iter().any(|s| w.eq_ignore_ascii_case(s)) {
                        break;
                    }
                    self.pos += w.len();
                    continue;
                }
            }
            self.pos += c.len_utf8();
        }
        self.src[start..self.pos].trim()
    }

    fn capture_text(&mut self, stop_at_comma: bool) -> &'a str {
        self.capture_text_with_stops(STOP_WORDS, stop_at_comma)
    }

    /// Requires the next non-trivia char to be `(` and returns the balanced
    /// interior text, leaving the cursor just past the matching `)`.
    fn capture_parenthesized(&mut self) -> EngineResult<&'a str> {
        self.skip_trivia();
        if !self.src[self.pos..].starts_with('(') {
            return Err(EngineError::plan("expected '('"));
        }
        self.pos += 1;
        let start = self.pos;
        let mut depth = 1;
        while self.pos < self.src.len() {
            let c = self.src[self.pos..].chars().next().unwrap();
            match c {
                '\'' => {
                    self.pos += 1;
                    self.skip_until_quote('\'');
                    continue;
                }
                '"' => {
                    self.pos += 1;
                    self.skip_until_quote('"');
                    continue;
                }
                '[' => {
                    self.pos += 1;
                    self.skip_until_quote(']');
                    continue;
                }
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        let inner = &self.src[start..self.pos];
                        self.pos += 1;
                        return Ok(inner);
                    }
                }
                _ => {}
            }
            self.pos += c.len_utf8();
        }
        Err(EngineError::plan("unterminated '('"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendExecutor, FetchPage, FetchXmlTranspiler, TranspileResult};
    use crate::cancel::CancellationToken;
    use crate::config::PlannerConfig;
    use std::sync::Arc;

    struct EmptyBackend;
    impl BackendExecutor for EmptyBackend {
        fn execute_fetchxml(
            &self,
            _: &str,
            _: Option<u64>,
            _: Option<&str>,
            _: bool,
            _: &CancellationToken,
        ) -> EngineResult<FetchPage> {
            Ok(FetchPage::default())
        }
    }

    struct StubTranspiler;
    impl FetchXmlTranspiler for StubTranspiler {
        fn generate(&self, _: &str) -> EngineResult<TranspileResult> {
            Ok(TranspileResult {
                fetchxml_text: "<fetch><entity name=\"account\"></entity></fetch>".into(),
                primary_entity: "account".into(),
                ..Default::default()
            })
        }
    }

    fn planner() -> Planner {
        Planner::new(PlannerConfig::new(), Arc::new(StubTranspiler))
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(Arc::new(EmptyBackend))
    }

    #[test]
    fn declare_and_set_round_trip_through_the_variable_scope() {
        let script = ScriptExecution::parse("DECLARE @x INT = 1; SET @x = @x + 1;").unwrap();
        let ctx = ctx();
        script.run(&planner(), &ctx).unwrap();
        let vars = ctx.variables.lock().unwrap();
        assert_eq!(vars.get("@x").cloned(), Some(Value::Int(2)));
    }

    #[test]
    fn while_loop_accumulates_and_yields_the_final_assignment_select() {
        let script = ScriptExecution::parse(
            "DECLARE @i INT = 0;
             WHILE @i < 3
             BEGIN
                 SET @i = @i + 1;
             END
             SELECT @i AS last;",
        )
        .unwrap();
        let ctx = ctx();
        let rows: Vec<Row> = script.run(&planner(), &ctx).unwrap().collect::<EngineResult<Vec<_>>>().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("last").cloned(), Some(Value::Int(3)));
    }

    #[test]
    fn while_loop_honors_break() {
        let script = ScriptExecution::parse(
            "DECLARE @i INT = 0;
             WHILE @i < 100
             BEGIN
                 SET @i = @i + 1;
                 IF @i = 3 BREAK;
             END
             SELECT @i AS last;",
        )
        .unwrap();
        let ctx = ctx();
        let rows: Vec<Row> = script.run(&planner(), &ctx).unwrap().collect::<EngineResult<Vec<_>>>().unwrap();
        assert_eq!(rows[0].get("last").cloned(), Some(Value::Int(3)));
    }

    #[test]
    fn try_throw_catch_exposes_error_message() {
        let script = ScriptExecution::parse(
            "BEGIN TRY
                 THROW 51000, 'boom', 1;
             END TRY
             BEGIN CATCH
                 SELECT ERROR_MESSAGE() AS msg;
             END CATCH",
        )
        .unwrap();
        let ctx = ctx();
        let rows: Vec<Row> = script.run(&planner(), &ctx).unwrap().collect::<EngineResult<Vec<_>>>().unwrap();
        assert_eq!(rows[0].get("msg").cloned(), Some(Value::String("boom".into())));
    }

    #[test]
    fn raiserror_below_severity_eleven_reports_instead_of_raising() {
        let script = ScriptExecution::parse("RAISERROR('just a note %d', 5, 1, 7);").unwrap();
        let result = script.run(&planner(), &ctx());
        assert!(result.is_ok());
    }

    #[test]
    fn raiserror_at_or_above_severity_eleven_raises() {
        let script = ScriptExecution::parse("RAISERROR('fatal', 16, 1);").unwrap();
        let err = script.run(&planner(), &ctx()).unwrap_err();
        assert!(matches!(err, EngineError::UserRaised { .. }));
    }

    #[test]
    fn while_loop_exceeding_the_iteration_cap_is_an_error() {
        let script =
            ScriptExecution::parse("DECLARE @x INT = 0; WHILE 1 = 1 BEGIN SET @x = @x + 1; END").unwrap();
        let err = script.run(&planner(), &ctx()).unwrap_err();
        assert!(matches!(err, EngineError::IterationCap(_)));
    }
}
