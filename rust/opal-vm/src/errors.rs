//! Engine errors.
//!
//! Two tiers: [`Raise`] carries a thrown language value through the
//! recovery-point machinery and can be caught by guarded regions, while
//! [`FatalError`] reports conditions the program itself can never catch
//! (load failures, resource limits, broken internal invariants, and a
//! throw that escaped every recovery point).

use thiserror::Error;

use crate::values::Value;

/// A thrown language value in flight between a throw site and the
/// innermost recovery point.
#[derive(Debug)]
pub struct Raise(pub Value);

impl Raise {
    /// Raise a plain message string.
    pub fn message(text: impl Into<String>) -> Raise {
        Raise(Value::string(&text.into()))
    }
}

/// Error flow through the dispatcher and native operations: either a
/// catchable raise in flight or a fatal condition.
#[derive(Debug)]
pub enum Control {
    Raise(Value),
    Fatal(FatalError),
}

impl From<Raise> for Control {
    fn from(r: Raise) -> Control {
        Control::Raise(r.0)
    }
}

impl From<FatalError> for Control {
    fn from(e: FatalError) -> Control {
        Control::Fatal(e)
    }
}

#[derive(Debug, Clone)]
pub struct StackFrame {
    pub function_name: String,
    pub ip: usize,
}

#[derive(Debug, Error)]
pub enum FatalError {
    #[error("load error: {0}")]
    Load(String),
    #[error("no module loaded")]
    NoModule,
    #[error("undefined function: {0}")]
    UndefinedFunction(String),
    #[error("stack overflow: value stack exceeded {0}")]
    StackOverflow(usize),
    #[error("instruction limit exceeded: {0}")]
    InstructionLimitExceeded(u64),
    #[error("uncaught error: {0}")]
    Uncaught(String),
    #[error("engine invariant violated: {0}")]
    Invariant(String),
    #[error("{message}\nStack trace (most recent call last):{stack_trace}")]
    WithStackTrace {
        message: String,
        stack_trace: String,
        frames: Vec<StackFrame>,
    },
}

impl FatalError {
    /// Attach a stack trace, returning a new WithStackTrace variant.
    /// Empty frames or an already-wrapped error pass through unchanged.
    pub fn with_stack_trace(self, frames: Vec<StackFrame>) -> Self {
        if frames.is_empty() || matches!(self, FatalError::WithStackTrace { .. }) {
            return self;
        }
        let message = format!("{}", self);
        let mut trace = String::new();
        for (i, frame) in frames.iter().rev().enumerate() {
            trace.push_str(&format!(
                "\n  #{}: {} (instruction {})",
                i, frame.function_name, frame.ip
            ));
        }
        FatalError::WithStackTrace {
            message,
            stack_trace: trace,
            frames,
        }
    }

    /// Check if the error message contains a string (works through the
    /// WithStackTrace wrapper).
    pub fn message_contains(&self, needle: &str) -> bool {
        match self {
            FatalError::WithStackTrace { message, .. } => message.contains(needle),
            other => format!("{}", other).contains(needle),
        }
    }

    pub fn is_uncaught(&self) -> bool {
        match self {
            FatalError::Uncaught(_) => true,
            FatalError::WithStackTrace { message, .. } => message.starts_with("uncaught error"),
            _ => false,
        }
    }

    pub fn is_instruction_limit_exceeded(&self) -> bool {
        match self {
            FatalError::InstructionLimitExceeded(_) => true,
            FatalError::WithStackTrace { message, .. } => {
                message.starts_with("instruction limit exceeded")
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_trace_wrapping() {
        let frames = vec![
            StackFrame {
                function_name: "main".to_string(),
                ip: 4,
            },
            StackFrame {
                function_name: "inner".to_string(),
                ip: 11,
            },
        ];
        let err = FatalError::Uncaught("boom".to_string()).with_stack_trace(frames);
        let text = format!("{}", err);
        assert!(text.contains("uncaught error: boom"));
        assert!(text.contains("#0: inner (instruction 11)"));
        assert!(text.contains("#1: main (instruction 4)"));
        assert!(err.is_uncaught());
        assert!(err.message_contains("boom"));
    }

    #[test]
    fn test_no_double_wrap() {
        let err = FatalError::InstructionLimitExceeded(100).with_stack_trace(vec![StackFrame {
            function_name: "f".to_string(),
            ip: 0,
        }]);
        let again = err.with_stack_trace(vec![StackFrame {
            function_name: "g".to_string(),
            ip: 1,
        }]);
        assert!(again.is_instruction_limit_exceeded());
        assert!(!format!("{}", again).contains("g ("));
    }
}
