//! Argument accessors for native functions. Positions are 1-based so the
//! `bad argument #N` convention matches what a caller sees at the call site.

use luma_core::{LuaError, TableRef, UserdataRef, Value};

/// View over the argument list a native function received.
pub struct Args<'a> {
    vals: &'a [Value],
}

impl<'a> Args<'a> {
    pub fn new(vals: &'a [Value]) -> Self {
        Args { vals }
    }

    pub fn len(&self) -> usize {
        self.vals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vals.is_empty()
    }

    /// Argument `n` (1-based), or nil when absent.
    pub fn get(&self, n: usize) -> Value {
        debug_assert!(n >= 1);
        self.vals.get(n - 1).cloned().unwrap_or(Value::Nil)
    }

    pub fn check_any(&self, n: usize) -> Result<Value, LuaError> {
        match self.vals.get(n - 1) {
            Some(v) => Ok(v.clone()),
            None => Err(arg_error(n, "value expected")),
        }
    }

    pub fn check_integer(&self, n: usize) -> Result<i64, LuaError> {
        match self.get(n) {
            Value::Integer(i) => Ok(i),
            Value::Float(f) if f.fract() == 0.0 => Ok(f as i64),
            Value::Str(s) => parse_integer(&s).ok_or_else(|| type_error(n, "number", "string")),
            other => Err(type_error(n, "number", other.type_name())),
        }
    }

    pub fn check_number(&self, n: usize) -> Result<f64, LuaError> {
        match self.get(n) {
            Value::Integer(i) => Ok(i as f64),
            Value::Float(f) => Ok(f),
            Value::Str(s) => parse_float(&s).ok_or_else(|| type_error(n, "number", "string")),
            other => Err(type_error(n, "number", other.type_name())),
        }
    }

    /// Strings are accepted as-is; numbers coerce the way the language does
    /// in string contexts. Anything else is a type error.
    pub fn check_string(&self, n: usize) -> Result<String, LuaError> {
        match self.get(n) {
            Value::Str(s) => Ok(s),
            v @ (Value::Integer(_) | Value::Float(_)) => Ok(v.to_string()),
            other => Err(type_error(n, "string", other.type_name())),
        }
    }

    pub fn check_table(&self, n: usize) -> Result<TableRef, LuaError> {
        match self.get(n) {
            Value::Table(t) => Ok(t),
            other => Err(type_error(n, "table", other.type_name())),
        }
    }

    pub fn check_userdata(&self, n: usize) -> Result<UserdataRef, LuaError> {
        match self.get(n) {
            Value::Userdata(u) => Ok(u),
            other => Err(type_error(n, "userdata", other.type_name())),
        }
    }

    pub fn opt_integer(&self, n: usize, default: i64) -> Result<i64, LuaError> {
        match self.get(n) {
            Value::Nil => Ok(default),
            _ => self.check_integer(n),
        }
    }

    pub fn opt_string(&self, n: usize, default: &str) -> Result<String, LuaError> {
        match self.get(n) {
            Value::Nil => Ok(default.into()),
            _ => self.check_string(n),
        }
    }
}

pub fn arg_error(n: usize, message: impl Into<String>) -> LuaError {
    LuaError::Argument {
        index: n,
        message: message.into(),
    }
}

pub fn type_error(n: usize, expected: &str, got: &str) -> LuaError {
    arg_error(n, format!("{expected} expected, got {got}"))
}

/// Number parsing shared by `tonumber` and argument coercion: an optional
/// sign, then decimal or `0x` hex for integers, falling back to floats.
pub fn parse_integer(s: &str) -> Option<i64> {
    let t = s.trim();
    let (neg, digits) = match t.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, t.strip_prefix('+').unwrap_or(t)),
    };
    let n = if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).ok()?
    } else {
        digits.parse::<i64>().ok()?
    };
    Some(if neg { n.wrapping_neg() } else { n })
}

pub fn parse_float(s: &str) -> Option<f64> {
    if let Some(i) = parse_integer(s) {
        return Some(i as f64);
    }
    s.trim().parse::<f64>().ok()
}

/// String-to-number coercion preserving the integer subtype when possible.
pub fn str_to_value(s: &str) -> Option<Value> {
    if let Some(i) = parse_integer(s) {
        return Some(Value::Integer(i));
    }
    let t = s.trim();
    if t.is_empty() {
        return None;
    }
    t.parse::<f64>().ok().map(Value::Float)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_are_one_based() {
        let vals = vec![Value::Integer(7), Value::string("hi")];
        let args = Args::new(&vals);
        assert_eq!(args.check_integer(1).unwrap(), 7);
        assert_eq!(args.check_string(2).unwrap(), "hi");
        assert_eq!(args.get(3), Value::Nil);
    }

    #[test]
    fn missing_argument_message() {
        let args = Args::new(&[]);
        let err = args.check_any(1).unwrap_err();
        assert_eq!(err.to_string(), "bad argument #1 (value expected)");
    }

    #[test]
    fn type_mismatch_names_both_types() {
        let vals = vec![Value::Boolean(true)];
        let err = Args::new(&vals).check_string(1).unwrap_err();
        assert_eq!(
            err.to_string(),
            "bad argument #1 (string expected, got boolean)"
        );
    }

    #[test]
    fn numbers_coerce_to_strings() {
        let vals = vec![Value::Integer(42)];
        assert_eq!(Args::new(&vals).check_string(1).unwrap(), "42");
    }

    #[test]
    fn optionals_default_on_nil_or_absence() {
        let vals = vec![Value::Nil];
        let args = Args::new(&vals);
        assert_eq!(args.opt_integer(1, 9).unwrap(), 9);
        assert_eq!(args.opt_string(2, "d").unwrap(), "d");
    }

    #[test]
    fn integer_parsing() {
        assert_eq!(parse_integer("42"), Some(42));
        assert_eq!(parse_integer("  -7 "), Some(-7));
        assert_eq!(parse_integer("0x10"), Some(16));
        assert_eq!(parse_integer("3.5"), None);
        assert_eq!(str_to_value("2.5"), Some(Value::Float(2.5)));
        assert_eq!(str_to_value("nope"), None);
    }
}
