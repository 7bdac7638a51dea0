use std::any::Any;
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::error::LuaError;
use crate::proto::Closure;
use crate::table::Table;

/// Signature of a host (native) function exposed to scripts.
pub type NativeFn = fn(Vec<Value>) -> Result<Vec<Value>, LuaError>;

pub type TableRef = Arc<RwLock<Table>>;
pub type UserdataRef = Arc<RwLock<Userdata>>;

/// A host-side object handed to scripts as an opaque value. The payload is
/// downcast by the library that created it; the metatable carries its
/// script-visible methods.
pub struct Userdata {
    pub data: Box<dyn Any + Send>,
    pub metatable: Option<TableRef>,
}

impl fmt::Debug for Userdata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Userdata").finish_non_exhaustive()
    }
}

/// A first-class script value.
///
/// Strings compare by content; tables, closures and userdata compare by
/// identity. Numbers carry an explicit integer subtype, with cross-subtype
/// equality (`1 == 1.0`).
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Str(String),
    Native(NativeFn),
    Closure(Arc<Closure>),
    Table(TableRef),
    Userdata(UserdataRef),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Boolean(_) => "boolean",
            Value::Integer(_) | Value::Float(_) => "number",
            Value::Str(_) => "string",
            Value::Native(_) | Value::Closure(_) => "function",
            Value::Table(_) => "table",
            Value::Userdata(_) => "userdata",
        }
    }

    /// Everything is truthy except `nil` and `false`.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Boolean(false))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn string(s: impl Into<String>) -> Value {
        Value::Str(s.into())
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Integer(a), Value::Float(b)) | (Value::Float(b), Value::Integer(a)) => {
                *a as f64 == *b
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Native(a), Value::Native(b)) => *a as usize == *b as usize,
            (Value::Closure(a), Value::Closure(b)) => Arc::ptr_eq(a, b),
            (Value::Table(a), Value::Table(b)) => Arc::ptr_eq(a, b),
            (Value::Userdata(a), Value::Userdata(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Integer(n) => write!(f, "{n}"),
            Value::Float(n) => {
                if n.is_finite() && n.fract() == 0.0 {
                    write!(f, "{n:.1}")
                } else {
                    write!(f, "{n}")
                }
            }
            Value::Str(s) => write!(f, "{s}"),
            Value::Native(func) => write!(f, "function: builtin {:p}", *func as *const ()),
            Value::Closure(c) => write!(f, "function: {:p}", Arc::as_ptr(c)),
            Value::Table(t) => write!(f, "table: {:p}", Arc::as_ptr(t)),
            Value::Userdata(u) => write!(f, "userdata: {:p}", Arc::as_ptr(u)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, RwLock};

    #[test]
    fn truthiness() {
        assert!(!Value::Nil.is_truthy());
        assert!(!Value::Boolean(false).is_truthy());
        assert!(Value::Boolean(true).is_truthy());
        assert!(Value::Integer(0).is_truthy());
        assert!(Value::string("").is_truthy());
    }

    #[test]
    fn numeric_cross_equality() {
        assert_eq!(Value::Integer(3), Value::Float(3.0));
        assert_ne!(Value::Integer(3), Value::Float(3.5));
    }

    #[test]
    fn table_identity() {
        let a = Arc::new(RwLock::new(Table::new()));
        let b = Arc::new(RwLock::new(Table::new()));
        assert_eq!(Value::Table(a.clone()), Value::Table(a.clone()));
        assert_ne!(Value::Table(a), Value::Table(b));
    }

    #[test]
    fn float_display() {
        assert_eq!(Value::Float(2.0).to_string(), "2.0");
        assert_eq!(Value::Float(2.5).to_string(), "2.5");
        assert_eq!(Value::Integer(2).to_string(), "2");
    }
}
