//! The `math` library. Results keep the integer subtype where the value is
//! exactly representable.

use luma_core::{LuaError, NativeFn, Value};

use crate::api::{arg_error, Args};
use crate::stdlib::new_lib;
use crate::vm::Vm;

pub(crate) fn open(vm: &mut Vm) {
    let entries: &[(&str, NativeFn)] = &[
        ("floor", math_floor),
        ("ceil", math_ceil),
        ("abs", math_abs),
        ("sqrt", math_sqrt),
        ("max", math_max),
        ("min", math_min),
        ("fmod", math_fmod),
    ];
    let t = new_lib(entries);
    {
        let mut tw = t.write().unwrap();
        tw.set(Value::string("huge"), Value::Float(f64::INFINITY))
            .unwrap();
        tw.set(Value::string("pi"), Value::Float(std::f64::consts::PI))
            .unwrap();
    }
    vm.set_global("math", Value::Table(t));
}

/// Converts a rounded float back to an integer when it fits.
fn to_integer(f: f64) -> Value {
    if f.is_finite() && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
        Value::Integer(f as i64)
    } else {
        Value::Float(f)
    }
}

fn math_floor(args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
    let a = Args::new(&args);
    Ok(vec![match a.get(1) {
        Value::Integer(i) => Value::Integer(i),
        _ => to_integer(a.check_number(1)?.floor()),
    }])
}

fn math_ceil(args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
    let a = Args::new(&args);
    Ok(vec![match a.get(1) {
        Value::Integer(i) => Value::Integer(i),
        _ => to_integer(a.check_number(1)?.ceil()),
    }])
}

fn math_abs(args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
    let a = Args::new(&args);
    Ok(vec![match a.get(1) {
        Value::Integer(i) => Value::Integer(i.wrapping_abs()),
        _ => Value::Float(a.check_number(1)?.abs()),
    }])
}

fn math_sqrt(args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
    Ok(vec![Value::Float(Args::new(&args).check_number(1)?.sqrt())])
}

fn pick(args: Vec<Value>, want_max: bool) -> Result<Vec<Value>, LuaError> {
    let a = Args::new(&args);
    if args.is_empty() {
        return Err(arg_error(1, "value expected"));
    }
    let mut best = a.get(1);
    a.check_number(1)?;
    for n in 2..=args.len() {
        let x = a.check_number(n)?;
        let b = match &best {
            Value::Integer(i) => *i as f64,
            Value::Float(f) => *f,
            _ => f64::NAN,
        };
        if (want_max && x > b) || (!want_max && x < b) {
            best = a.get(n);
        }
    }
    Ok(vec![best])
}

fn math_max(args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
    pick(args, true)
}

fn math_min(args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
    pick(args, false)
}

fn math_fmod(args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
    let a = Args::new(&args);
    match (a.get(1), a.get(2)) {
        (Value::Integer(x), Value::Integer(y)) => {
            if y == 0 {
                return Err(arg_error(2, "zero"));
            }
            Ok(vec![Value::Integer(x.wrapping_rem(y))])
        }
        _ => {
            let x = a.check_number(1)?;
            let y = a.check_number(2)?;
            Ok(vec![Value::Float(x % y)])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::Vm;

    fn run1(src: &str) -> Value {
        let chunk = luma_compiler::compile(src, "test").expect("compile error");
        let mut vals = Vm::new().execute(&chunk).expect("runtime error");
        if vals.is_empty() {
            Value::Nil
        } else {
            vals.remove(0)
        }
    }

    #[test]
    fn floor_and_ceil_keep_integers() {
        assert_eq!(run1("return math.floor(3.7)"), Value::Integer(3));
        assert_eq!(run1("return math.floor(-3.2)"), Value::Integer(-4));
        assert_eq!(run1("return math.ceil(3.2)"), Value::Integer(4));
        assert_eq!(run1("return math.floor(5)"), Value::Integer(5));
    }

    #[test]
    fn abs_and_sqrt() {
        assert_eq!(run1("return math.abs(-7)"), Value::Integer(7));
        assert_eq!(run1("return math.abs(-2.5)"), Value::Float(2.5));
        assert_eq!(run1("return math.sqrt(9)"), Value::Float(3.0));
    }

    #[test]
    fn max_min_over_varargs() {
        assert_eq!(run1("return math.max(3, 9, 1)"), Value::Integer(9));
        assert_eq!(run1("return math.min(3, -2.5, 1)"), Value::Float(-2.5));
    }

    #[test]
    fn fmod_keeps_dividend_sign() {
        assert_eq!(run1("return math.fmod(7, 3)"), Value::Integer(1));
        assert_eq!(run1("return math.fmod(-7, 3)"), Value::Integer(-1));
        assert_eq!(run1("return math.fmod(7.5, 2)"), Value::Float(1.5));
    }

    #[test]
    fn constants() {
        assert_eq!(run1("return math.huge"), Value::Float(f64::INFINITY));
        assert_eq!(run1("return math.pi > 3.14 and math.pi < 3.15"), Value::Boolean(true));
    }
}
