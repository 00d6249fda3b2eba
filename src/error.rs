//! Error types for the planner and execution engine.
//!
//! Mirrors the teacher crate's hand-rolled `SqlError`: one closed enum,
//! manual `Display`, no `thiserror`/`anyhow`.

use std::fmt;

/// Every error kind the planner or the streaming executor can surface.
#[derive(Debug, Clone)]
pub enum EngineError {
    /// Unsupported SQL construct, malformed AST, missing FROM, etc.
    Plan(String),
    /// Backend call failed. `code` is the wire error code if the backend gave one.
    Execution { code: Option<String>, message: String },
    /// A scalar subquery returned more than one row.
    SubqueryCardinality(String),
    /// A recursive CTE exceeded its maximum recursion depth.
    Recursion(String),
    /// A WHILE loop exceeded its iteration cap.
    IterationCap(String),
    /// THROW or RAISERROR with severity >= 11.
    UserRaised { number: i32, message: String, state: i32 },
    /// Internal consistency failure — should never happen in correct plans.
    InvariantViolation(String),
    /// Execution was cancelled via the cancellation token.
    Cancelled,
    /// `BREAK` inside a `WHILE` — an internal control-flow signal, not a
    /// user-visible error. Unwinds to the innermost loop (§4.11/§5).
    Break,
    /// `CONTINUE` inside a `WHILE` — same shape as `Break`, unwinds to the
    /// innermost loop's next iteration.
    Continue,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Plan(msg) => write!(f, "plan error: {msg}"),
            EngineError::Execution { code: Some(c), message } => {
                write!(f, "execution error [{c}]: {message}")
            }
            EngineError::Execution { code: None, message } => {
                write!(f, "execution error: {message}")
            }
            EngineError::SubqueryCardinality(msg) => {
                write!(f, "subquery returned more than one row: {msg}")
            }
            EngineError::Recursion(msg) => write!(f, "recursion error: {msg}"),
            EngineError::IterationCap(msg) => write!(f, "iteration cap exceeded: {msg}"),
            EngineError::UserRaised { number, message, state } => {
                write!(f, "Msg {number}, Level 16, State {state}: {message}")
            }
            EngineError::InvariantViolation(msg) => write!(f, "internal invariant violation: {msg}"),
            EngineError::Cancelled => write!(f, "execution cancelled"),
            EngineError::Break => write!(f, "BREAK outside of a loop"),
            EngineError::Continue => write!(f, "CONTINUE outside of a loop"),
        }
    }
}

impl std::error::Error for EngineError {}

impl EngineError {
    pub fn plan(msg: impl Into<String>) -> Self {
        EngineError::Plan(msg.into())
    }

    pub fn execution(message: impl Into<String>) -> Self {
        EngineError::Execution { code: None, message: message.into() }
    }

    pub fn execution_with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Execution { code: Some(code.into()), message: message.into() }
    }

    /// The default T-SQL error number used by a bare `THROW` / user RAISERROR
    /// when the caller did not supply one.
    pub const DEFAULT_THROW_NUMBER: i32 = 50000;

    /// Render the `@@ERROR_MESSAGE` text a CATCH block would see for this error.
    pub fn error_message(&self) -> String {
        match self {
            EngineError::UserRaised { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Render the `@@ERROR_NUMBER` a CATCH block would see for this error.
    pub fn error_number(&self) -> i32 {
        match self {
            EngineError::UserRaised { number, .. } => *number,
            _ => Self::DEFAULT_THROW_NUMBER,
        }
    }

    /// Render the `@@ERROR_STATE` a CATCH block would see for this error.
    pub fn error_state(&self) -> i32 {
        match self {
            EngineError::UserRaised { state, .. } => *state,
            _ => 1,
        }
    }

    /// Signals (cancellation, BREAK, CONTINUE) must pass through TRY/CATCH
    /// unmodified rather than being caught — see §4.11/§5.
    pub fn is_uncatchable_signal(&self) -> bool {
        matches!(self, EngineError::Cancelled | EngineError::Break | EngineError::Continue)
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
