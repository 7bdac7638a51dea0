use thiserror::Error;

use crate::value::Value;

/// Everything that can go wrong while compiling or running a chunk.
///
/// Runtime errors carry an arbitrary script value (usually a string already
/// prefixed with `"<source>:<line>: "`); protected calls hand that value back
/// to the script unchanged.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LuaError {
    #[error("{chunk}:{line}: {message}")]
    Syntax {
        chunk: String,
        line: u32,
        message: String,
    },

    #[error("{0}")]
    Runtime(Value),

    #[error("bad argument #{index} ({message})")]
    Argument { index: usize, message: String },

    #[error("stack overflow")]
    StackOverflow,

    #[error("'{event}' chain too long; possible loop")]
    MetatableLoop { event: &'static str },

    #[error("internal error: {0}")]
    Internal(String),
}

impl LuaError {
    /// Runtime error from a plain message, without position info.
    pub fn runtime(message: impl Into<String>) -> LuaError {
        LuaError::Runtime(Value::Str(message.into()))
    }

    /// The value a protected call hands back for this error.
    pub fn into_value(self) -> Value {
        match self {
            LuaError::Runtime(v) => v,
            other => Value::Str(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syntax_error_format() {
        let err = LuaError::Syntax {
            chunk: "test.lua".into(),
            line: 3,
            message: "'end' expected".into(),
        };
        assert_eq!(err.to_string(), "test.lua:3: 'end' expected");
    }

    #[test]
    fn argument_error_format() {
        let err = LuaError::Argument {
            index: 2,
            message: "string expected, got nil".into(),
        };
        assert_eq!(err.to_string(), "bad argument #2 (string expected, got nil)");
    }

    #[test]
    fn runtime_error_keeps_value() {
        let err = LuaError::Runtime(Value::Integer(42));
        assert_eq!(err.into_value(), Value::Integer(42));
    }
}
