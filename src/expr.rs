//! Row-level expression / predicate engine (§2, "Expression / predicate
//! engine" component). A small typed expression tree, lowered from
//! `sqlparser::ast::Expr` by the planner (`crate::planner::lower_expr`),
//! evaluated against a `Row` plus the session's read-only error state and
//! variable scope.

use std::cmp::Ordering;

use rust_decimal::Decimal;

use crate::error::{EngineError, EngineResult};
use crate::row::Row;
use crate::session::{SessionContext, VariableScope};
use crate::value::{compare_non_null, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
}

/// A scalar expression. `Exists`/correlated-subquery forms are not
/// representable here — the planner rewrites `EXISTS`/`IN (subquery)` into
/// `HashSemiJoin` before an `Expr` tree is built (§4.7); anything that
/// reaches evaluation unrewritten is a planning bug, not a runtime case.
#[derive(Debug, Clone)]
pub enum Expr {
    Literal(Value),
    Column(String),
    /// `@name` user variable or `@@ERROR*` pseudo-variable.
    Variable(String),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary(Box<Expr>, BinOp, Box<Expr>),
    IsNull { expr: Box<Expr>, negated: bool },
    Like { expr: Box<Expr>, pattern: Box<Expr>, negated: bool },
    InList { expr: Box<Expr>, list: Vec<Expr>, negated: bool },
    Case {
        operand: Option<Box<Expr>>,
        whens: Vec<(Expr, Expr)>,
        else_expr: Option<Box<Expr>>,
    },
    Call(String, Vec<Expr>),
}

/// Read-only view over session error state and variables exposed to the
/// evaluator — see DESIGN.md "@@ERROR convention".
pub struct EvalContext<'a> {
    pub variables: Option<&'a VariableScope>,
    pub session: Option<&'a SessionContext>,
}

impl<'a> EvalContext<'a> {
    pub fn empty() -> Self {
        EvalContext { variables: None, session: None }
    }

    pub fn new(variables: Option<&'a VariableScope>, session: Option<&'a SessionContext>) -> Self {
        EvalContext { variables, session }
    }

    fn resolve_pseudo_variable(&self, name: &str) -> Option<Value> {
        let upper = name.trim_start_matches('@').to_ascii_uppercase();
        let err = self.session.and_then(|s| s.last_error.as_ref());
        match upper.as_str() {
            "ERROR" => err.map(|e| Value::Int(e.number as i64)).or(Some(Value::Int(0))),
            "ERROR_MESSAGE" => Some(Value::String(err.map(|e| e.message.clone()).unwrap_or_default())),
            "ERROR_NUMBER" => Some(err.map(|e| Value::Int(e.number as i64)).unwrap_or(Value::Null)),
            "ERROR_SEVERITY" => Some(err.map(|e| Value::Int(e.severity as i64)).unwrap_or(Value::Null)),
            "ERROR_STATE" => Some(err.map(|e| Value::Int(e.state as i64)).unwrap_or(Value::Null)),
            _ => None,
        }
    }
}

pub fn eval(expr: &Expr, row: &Row, ctx: &EvalContext) -> EngineResult<Value> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Column(name) => Ok(row.get(name).cloned().unwrap_or(Value::Null)),
        Expr::Variable(name) => {
            if name.starts_with("@@") {
                return Ok(ctx.resolve_pseudo_variable(name).unwrap_or(Value::Null));
            }
            match ctx.variables.and_then(|v| v.get(name)) {
                Some(v) => Ok(v.clone()),
                None => Err(EngineError::plan(format!(
                    "variable '{name}' is not declared"
                ))),
            }
        }
        Expr::Not(inner) => {
            let v = eval(inner, row, ctx)?;
            Ok(match v.truthy() {
                Some(b) => Value::Bool(!b),
                None => Value::Null,
            })
        }
        Expr::Neg(inner) => {
            let v = eval(inner, row, ctx)?;
            Ok(negate(&v))
        }
        Expr::Binary(lhs, op, rhs) => eval_binary(lhs, *op, rhs, row, ctx),
        Expr::IsNull { expr, negated } => {
            let v = eval(expr, row, ctx)?;
            Ok(Value::Bool(v.is_null() != *negated))
        }
        Expr::Like { expr, pattern, negated } => {
            let v = eval(expr, row, ctx)?;
            let p = eval(pattern, row, ctx)?;
            if v.is_null() || p.is_null() {
                return Ok(Value::Null);
            }
            let matched = like_match(&v.display_string(), &p.display_string());
            Ok(Value::Bool(matched != *negated))
        }
        Expr::InList { expr, list, negated } => {
            let v = eval(expr, row, ctx)?;
            if v.is_null() {
                return Ok(Value::Null);
            }
            let mut saw_null = false;
            for item in list {
                let iv = eval(item, row, ctx)?;
                if iv.is_null() {
                    saw_null = true;
                    continue;
                }
                if compare_non_null(&v, &iv) == Ordering::Equal {
                    return Ok(Value::Bool(!*negated));
                }
            }
            if saw_null {
                Ok(Value::Null)
            } else {
                Ok(Value::Bool(*negated))
            }
        }
        Expr::Case { operand, whens, else_expr } => {
            for (when_expr, then_expr) in whens {
                let matched = match operand {
                    Some(op) => {
                        let ov = eval(op, row, ctx)?;
                        let wv = eval(when_expr, row, ctx)?;
                        !ov.is_null() && !wv.is_null() && compare_non_null(&ov, &wv) == Ordering::Equal
                    }
                    None => eval(when_expr, row, ctx)?.truthy().unwrap_or(false),
                };
                if matched {
                    return eval(then_expr, row, ctx);
                }
            }
            match else_expr {
                Some(e) => eval(e, row, ctx),
                None => Ok(Value::Null),
            }
        }
        Expr::Call(name, args) => eval_call(name, args, row, ctx),
    }
}

fn negate(v: &Value) -> Value {
    match v {
        Value::Int(i) => Value::Int(-i),
        Value::Float(f) => Value::Float(-f),
        Value::Decimal(d) => Value::Decimal(-*d),
        Value::Null => Value::Null,
        other => other.clone(),
    }
}

fn eval_binary(lhs: &Expr, op: BinOp, rhs: &Expr, row: &Row, ctx: &EvalContext) -> EngineResult<Value> {
    // AND/OR use SQL three-valued logic and must short-circuit null handling
    // specially (e.g. FALSE AND NULL = FALSE), so handle before a blanket
    // null-propagates-everything rule.
    if matches!(op, BinOp::And | BinOp::Or) {
        let l = eval(lhs, row, ctx)?.truthy();
        let r = eval(rhs, row, ctx)?.truthy();
        return Ok(match op {
            BinOp::And => match (l, r) {
                (Some(false), _) | (_, Some(false)) => Value::Bool(false),
                (Some(true), Some(true)) => Value::Bool(true),
                _ => Value::Null,
            },
            BinOp::Or => match (l, r) {
                (Some(true), _) | (_, Some(true)) => Value::Bool(true),
                (Some(false), Some(false)) => Value::Bool(false),
                _ => Value::Null,
            },
            _ => unreachable!(),
        });
    }

    let l = eval(lhs, row, ctx)?;
    let r = eval(rhs, row, ctx)?;
    if l.is_null() || r.is_null() {
        return Ok(Value::Null);
    }
    match op {
        BinOp::Eq => Ok(Value::Bool(compare_non_null(&l, &r) == Ordering::Equal)),
        BinOp::NotEq => Ok(Value::Bool(compare_non_null(&l, &r) != Ordering::Equal)),
        BinOp::Lt => Ok(Value::Bool(compare_non_null(&l, &r) == Ordering::Less)),
        BinOp::LtEq => Ok(Value::Bool(compare_non_null(&l, &r) != Ordering::Greater)),
        BinOp::Gt => Ok(Value::Bool(compare_non_null(&l, &r) == Ordering::Greater)),
        BinOp::GtEq => Ok(Value::Bool(compare_non_null(&l, &r) != Ordering::Less)),
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => arithmetic(op, &l, &r),
        BinOp::And | BinOp::Or => unreachable!(),
    }
}

fn arithmetic(op: BinOp, l: &Value, r: &Value) -> EngineResult<Value> {
    if let (Value::String(a), Value::String(b)) = (l, r) {
        if op == BinOp::Add {
            return Ok(Value::String(format!("{a}{b}")));
        }
    }
    if let (Value::Decimal(a), Value::Decimal(b)) = (l, r) {
        return decimal_arithmetic(op, *a, *b);
    }
    if let (Value::Int(a), Value::Int(b)) = (l, r) {
        return int_arithmetic(op, *a, *b);
    }
    let (a, b) = (
        l.as_f64().ok_or_else(|| EngineError::plan("non-numeric operand in arithmetic expression"))?,
        r.as_f64().ok_or_else(|| EngineError::plan("non-numeric operand in arithmetic expression"))?,
    );
    let result = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b == 0.0 {
                return Err(EngineError::execution("divide by zero error encountered"));
            }
            a / b
        }
        BinOp::Mod => a % b,
        _ => unreachable!(),
    };
    Ok(Value::Float(result))
}

fn int_arithmetic(op: BinOp, a: i64, b: i64) -> EngineResult<Value> {
    Ok(match op {
        BinOp::Add => Value::Int(a.wrapping_add(b)),
        BinOp::Sub => Value::Int(a.wrapping_sub(b)),
        BinOp::Mul => Value::Int(a.wrapping_mul(b)),
        BinOp::Div => {
            if b == 0 {
                return Err(EngineError::execution("divide by zero error encountered"));
            }
            Value::Int(a / b)
        }
        BinOp::Mod => {
            if b == 0 {
                return Err(EngineError::execution("divide by zero error encountered"));
            }
            Value::Int(a % b)
        }
        _ => unreachable!(),
    })
}

fn decimal_arithmetic(op: BinOp, a: Decimal, b: Decimal) -> EngineResult<Value> {
    Ok(match op {
        BinOp::Add => Value::Decimal(a + b),
        BinOp::Sub => Value::Decimal(a - b),
        BinOp::Mul => Value::Decimal(a * b),
        BinOp::Div => {
            if b.is_zero() {
                return Err(EngineError::execution("divide by zero error encountered"));
            }
            Value::Decimal(a / b)
        }
        BinOp::Mod => {
            if b.is_zero() {
                return Err(EngineError::execution("divide by zero error encountered"));
            }
            Value::Decimal(a % b)
        }
        _ => unreachable!(),
    })
}

/// Minimal SQL `LIKE` matcher: `%` = any run, `_` = any single char.
fn like_match(text: &str, pattern: &str) -> bool {
    fn go(t: &[char], p: &[char]) -> bool {
        match p.first() {
            None => t.is_empty(),
            Some('%') => go(t, &p[1..]) || (!t.is_empty() && go(&t[1..], p)),
            Some('_') => !t.is_empty() && go(&t[1..], &p[1..]),
            Some(c) => match t.first() {
                Some(tc) if tc.eq_ignore_ascii_case(c) => go(&t[1..], &p[1..]),
                _ => false,
            },
        }
    }
    let t: Vec<char> = text.chars().collect();
    let p: Vec<char> = pattern.chars().collect();
    go(&t, &p)
}

fn eval_call(name: &str, args: &[Expr], row: &Row, ctx: &EvalContext) -> EngineResult<Value> {
    let upper = name.to_ascii_uppercase();
    match upper.as_str() {
        "ERROR_MESSAGE" => eval(&Expr::Variable("@@ERROR_MESSAGE".into()), row, ctx),
        "ERROR_NUMBER" => eval(&Expr::Variable("@@ERROR_NUMBER".into()), row, ctx),
        "ERROR_SEVERITY" => eval(&Expr::Variable("@@ERROR_SEVERITY".into()), row, ctx),
        "ERROR_STATE" => eval(&Expr::Variable("@@ERROR_STATE".into()), row, ctx),
        "ISNULL" | "COALESCE" => {
            for a in args {
                let v = eval(a, row, ctx)?;
                if !v.is_null() {
                    return Ok(v);
                }
            }
            Ok(Value::Null)
        }
        "UPPER" => Ok(Value::String(arg_string(args, 0, row, ctx)?.to_uppercase())),
        "LOWER" => Ok(Value::String(arg_string(args, 0, row, ctx)?.to_lowercase())),
        "LEN" => Ok(Value::Int(arg_string(args, 0, row, ctx)?.chars().count() as i64)),
        _ => Err(EngineError::plan(format!("unsupported function '{name}'"))),
    }
}

fn arg_string(args: &[Expr], idx: usize, row: &Row, ctx: &EvalContext) -> EngineResult<String> {
    let v = eval(
        args.get(idx).ok_or_else(|| EngineError::plan("missing function argument"))?,
        row,
        ctx,
    )?;
    Ok(v.display_string())
}

/// Compiled row predicate used by `ClientFilter` (§4.2). Rows for which the
/// predicate evaluates to TRUE are kept; FALSE and UNKNOWN (NULL) are
/// dropped.
pub struct Predicate {
    expr: Expr,
}

impl Predicate {
    pub fn new(expr: Expr) -> Self {
        Predicate { expr }
    }

    pub fn test(&self, row: &Row, ctx: &EvalContext) -> EngineResult<bool> {
        Ok(eval(&self.expr, row, ctx)?.truthy().unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row_with(cols: &[(&str, Value)]) -> Row {
        let mut r = Row::new();
        for (k, v) in cols {
            r.set(*k, v.clone());
        }
        r
    }

    #[test]
    fn and_with_null_is_three_valued() {
        let ctx = EvalContext::empty();
        let row = Row::new();
        let e = Expr::Binary(
            Box::new(Expr::Literal(Value::Bool(false))),
            BinOp::And,
            Box::new(Expr::Literal(Value::Null)),
        );
        assert_eq!(eval(&e, &row, &ctx).unwrap(), Value::Bool(false));

        let e2 = Expr::Binary(
            Box::new(Expr::Literal(Value::Bool(true))),
            BinOp::And,
            Box::new(Expr::Literal(Value::Null)),
        );
        assert_eq!(eval(&e2, &row, &ctx).unwrap(), Value::Null);
    }

    #[test]
    fn in_list_with_null_member_and_no_match_is_unknown() {
        let ctx = EvalContext::empty();
        let row = row_with(&[("x", Value::Int(5))]);
        let e = Expr::InList {
            expr: Box::new(Expr::Column("x".into())),
            list: vec![Expr::Literal(Value::Int(1)), Expr::Literal(Value::Null)],
            negated: false,
        };
        assert_eq!(eval(&e, &row, &ctx).unwrap(), Value::Null);
    }

    #[test]
    fn like_supports_percent_and_underscore() {
        assert!(like_match("hello", "h%o"));
        assert!(like_match("hello", "h_llo"));
        assert!(!like_match("hello", "world"));
    }
}
