//! The `string` library. Indices are byte-based and 1-based, with negative
//! positions counting back from the end, as the `sub`/`byte` contract wants.

use luma_core::{LuaError, NativeFn, Value};

use crate::api::{arg_error, Args};
use crate::meta;
use crate::stdlib::new_lib;
use crate::vm::{with_current_vm, Vm};

pub(crate) fn open(vm: &mut Vm) {
    let entries: &[(&str, NativeFn)] = &[
        ("len", str_len),
        ("sub", str_sub),
        ("upper", str_upper),
        ("lower", str_lower),
        ("rep", str_rep),
        ("byte", str_byte),
        ("char", str_char),
        ("format", str_format),
    ];
    vm.set_global("string", Value::Table(new_lib(entries)));
}

/// Maps 1-based, possibly negative positions onto a byte range.
fn str_range(len: i64, mut i: i64, mut j: i64) -> Option<(usize, usize)> {
    if i < 0 {
        i = (len + i + 1).max(1);
    } else if i == 0 {
        i = 1;
    }
    if j < 0 {
        j += len + 1;
    } else if j > len {
        j = len;
    }
    if i > j {
        return None;
    }
    Some((i as usize - 1, j as usize))
}

fn str_len(args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
    let s = Args::new(&args).check_string(1)?;
    Ok(vec![Value::Integer(s.len() as i64)])
}

fn str_sub(args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
    let a = Args::new(&args);
    let s = a.check_string(1)?;
    let i = a.opt_integer(2, 1)?;
    let j = a.opt_integer(3, -1)?;
    let out = match str_range(s.len() as i64, i, j) {
        Some((lo, hi)) => String::from_utf8_lossy(&s.as_bytes()[lo..hi]).into_owned(),
        None => String::new(),
    };
    Ok(vec![Value::Str(out)])
}

fn str_upper(args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
    let s = Args::new(&args).check_string(1)?;
    Ok(vec![Value::Str(s.to_uppercase())])
}

fn str_lower(args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
    let s = Args::new(&args).check_string(1)?;
    Ok(vec![Value::Str(s.to_lowercase())])
}

fn str_rep(args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
    let a = Args::new(&args);
    let s = a.check_string(1)?;
    let n = a.check_integer(2)?;
    let sep = a.opt_string(3, "")?;
    if n <= 0 {
        return Ok(vec![Value::string("")]);
    }
    let mut out = String::with_capacity(s.len() * n as usize);
    for i in 0..n {
        if i > 0 {
            out.push_str(&sep);
        }
        out.push_str(&s);
    }
    Ok(vec![Value::Str(out)])
}

fn str_byte(args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
    let a = Args::new(&args);
    let s = a.check_string(1)?;
    let i = a.opt_integer(2, 1)?;
    let j = a.opt_integer(3, i)?;
    let out = match str_range(s.len() as i64, i, j) {
        Some((lo, hi)) => s.as_bytes()[lo..hi]
            .iter()
            .map(|b| Value::Integer(*b as i64))
            .collect(),
        None => Vec::new(),
    };
    Ok(out)
}

fn str_char(args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
    let a = Args::new(&args);
    let mut bytes = Vec::with_capacity(args.len());
    for n in 1..=args.len() {
        let c = a.check_integer(n)?;
        if !(0..=255).contains(&c) {
            return Err(arg_error(n, "value out of range"));
        }
        bytes.push(c as u8);
    }
    Ok(vec![Value::Str(String::from_utf8_lossy(&bytes).into_owned())])
}

fn str_format(args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
    let a = Args::new(&args);
    let fmt = a.check_string(1)?;
    with_current_vm(|vm| {
        let mut out = String::with_capacity(fmt.len());
        let mut chars = fmt.chars().peekable();
        let mut arg_n = 1;
        while let Some(c) = chars.next() {
            if c != '%' {
                out.push(c);
                continue;
            }
            // optional precision, e.g. %.3f
            let mut precision = None;
            if chars.peek() == Some(&'.') {
                chars.next();
                let mut p = 0usize;
                while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
                    p = p * 10 + d as usize;
                    chars.next();
                }
                precision = Some(p);
            }
            let spec = chars
                .next()
                .ok_or_else(|| LuaError::runtime("invalid format string to 'format'"))?;
            arg_n += 1;
            match spec {
                '%' => {
                    arg_n -= 1;
                    out.push('%');
                }
                'd' | 'i' => out.push_str(&a.check_integer(arg_n)?.to_string()),
                'x' => out.push_str(&format!("{:x}", a.check_integer(arg_n)?)),
                'X' => out.push_str(&format!("{:X}", a.check_integer(arg_n)?)),
                'f' => {
                    let v = a.check_number(arg_n)?;
                    out.push_str(&format!("{:.*}", precision.unwrap_or(6), v));
                }
                'g' => {
                    let v = a.check_number(arg_n)?;
                    out.push_str(&format!("{v}"));
                }
                's' => {
                    let v = a.get(arg_n);
                    out.push_str(&meta::tostring(vm, &v)?);
                }
                'q' => {
                    let v = a.check_string(arg_n)?;
                    out.push('"');
                    for ch in v.chars() {
                        match ch {
                            '"' => out.push_str("\\\""),
                            '\\' => out.push_str("\\\\"),
                            '\n' => out.push_str("\\n"),
                            '\r' => out.push_str("\\r"),
                            '\0' => out.push_str("\\0"),
                            other => out.push(other),
                        }
                    }
                    out.push('"');
                }
                other => {
                    return Err(LuaError::runtime(format!(
                        "invalid option '%{other}' to 'format'"
                    )))
                }
            }
        }
        Ok(vec![Value::Str(out)])
    })
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
    fn sub_handles_negative_indices() {
        assert_eq!(run1("return string.sub('hello', 2, 4)"), Value::string("ell"));
        assert_eq!(run1("return string.sub('hello', -3)"), Value::string("llo"));
        assert_eq!(run1("return string.sub('hello', 4, 2)"), Value::string(""));
        assert_eq!(run1("return string.sub('hello', 1, -2)"), Value::string("hell"));
    }

    #[test]
    fn case_and_length() {
        assert_eq!(run1("return string.upper('abC')"), Value::string("ABC"));
        assert_eq!(run1("return string.lower('AbC')"), Value::string("abc"));
        assert_eq!(run1("return string.len('abcd')"), Value::Integer(4));
    }

    #[test]
    fn rep_with_separator() {
        assert_eq!(run1("return string.rep('ab', 3)"), Value::string("ababab"));
        assert_eq!(run1("return string.rep('a', 3, '-')"), Value::string("a-a-a"));
        assert_eq!(run1("return string.rep('a', 0)"), Value::string(""));
    }

    #[test]
    fn byte_and_char_round_trip() {
        assert_eq!(run1("return string.byte('A')"), Value::Integer(65));
        assert_eq!(run1("return string.char(104, 105)"), Value::string("hi"));
        let chunk = luma_compiler::compile("return string.char(300)", "test").unwrap();
        let err = Vm::new().execute(&chunk).unwrap_err();
        assert!(err.to_string().contains("value out of range"));
    }

    #[test]
    fn format_directives() {
        assert_eq!(
            run1("return string.format('%d/%s = %.2f', 7, 'two', 3.5)"),
            Value::string("7/two = 3.50")
        );
        assert_eq!(run1("return string.format('%x', 255)"), Value::string("ff"));
        assert_eq!(run1("return string.format('100%%')"), Value::string("100%"));
        assert_eq!(
            run1("return string.format('%q', 'a\\nb')"),
            Value::string("\"a\\nb\"")
        );
    }

    #[test]
    fn format_s_uses_tostring() {
        assert_eq!(
            run1("return string.format('[%s]', nil)"),
            Value::string("[nil]")
        );
    }
}
