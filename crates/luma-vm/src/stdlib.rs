//! The base library: core globals every script can rely on. The other
//! libraries (`string`, `math`, `os`, `io`) are registered from here too.

use std::io::Write;
use std::sync::{Arc, RwLock};

use luma_compiler::Chunk;
use luma_core::{Closure, LuaError, NativeFn, Table, TableRef, Value};

use crate::api::{arg_error, str_to_value, type_error, Args};
use crate::meta;
use crate::vm::{with_current_vm, Vm};

/// Builds a library table out of `(name, function)` pairs.
pub(crate) fn new_lib(entries: &[(&str, NativeFn)]) -> TableRef {
    let t = Arc::new(RwLock::new(Table::new()));
    {
        let mut tw = t.write().unwrap();
        for (name, f) in entries {
            // string keys cannot fail
            tw.set(Value::string(*name), Value::Native(*f)).unwrap();
        }
    }
    t
}

pub(crate) fn open_all(vm: &mut Vm) {
    let base: &[(&str, NativeFn)] = &[
        ("print", base_print),
        ("type", base_type),
        ("tostring", base_tostring),
        ("tonumber", base_tonumber),
        ("assert", base_assert),
        ("error", base_error),
        ("pcall", base_pcall),
        ("ipairs", base_ipairs),
        ("pairs", base_pairs),
        ("next", base_next),
        ("select", base_select),
        ("rawget", base_rawget),
        ("rawset", base_rawset),
        ("rawequal", base_rawequal),
        ("rawlen", base_rawlen),
        ("setmetatable", base_setmetatable),
        ("getmetatable", base_getmetatable),
        ("load", base_load),
        ("loadfile", base_loadfile),
        ("dofile", base_dofile),
    ];
    for (name, f) in base {
        vm.set_global(name, Value::Native(*f));
    }
    crate::strlib::open(vm);
    crate::mathlib::open(vm);
    crate::oslib::open(vm);
    crate::iolib::open(vm);
}

fn base_print(args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
    with_current_vm(|vm| {
        let mut parts = Vec::with_capacity(args.len());
        for v in &args {
            parts.push(meta::tostring(vm, v)?);
        }
        writeln!(vm.stdout, "{}", parts.join("\t"))
            .map_err(|e| LuaError::runtime(e.to_string()))?;
        Ok(Vec::new())
    })
}

fn base_type(args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
    let v = Args::new(&args).check_any(1)?;
    Ok(vec![Value::string(v.type_name())])
}

fn base_tostring(args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
    let v = Args::new(&args).check_any(1)?;
    with_current_vm(|vm| Ok(vec![Value::Str(meta::tostring(vm, &v)?)]))
}

fn base_tonumber(args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
    let a = Args::new(&args);
    if !a.get(2).is_nil() {
        let s = a.check_string(1)?;
        let radix = a.check_integer(2)?;
        if !(2..=36).contains(&radix) {
            return Err(arg_error(2, "base out of range"));
        }
        let parsed = i64::from_str_radix(s.trim(), radix as u32).ok();
        return Ok(vec![parsed.map(Value::Integer).unwrap_or(Value::Nil)]);
    }
    let v = match a.get(1) {
        n @ (Value::Integer(_) | Value::Float(_)) => n,
        Value::Str(s) => str_to_value(&s).unwrap_or(Value::Nil),
        _ => Value::Nil,
    };
    Ok(vec![v])
}

fn base_assert(args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
    let a = Args::new(&args);
    if a.check_any(1)?.is_truthy() {
        return Ok(args);
    }
    match a.get(2) {
        Value::Nil => with_current_vm(|vm| Err(vm.rt_error("assertion failed!"))),
        msg => Err(LuaError::Runtime(msg)),
    }
}

fn base_error(args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
    let a = Args::new(&args);
    let val = a.get(1);
    let level = a.opt_integer(2, 1)?;
    if level > 0 {
        if let Value::Str(s) = &val {
            let msg = s.clone();
            return with_current_vm(move |vm| Err(vm.rt_error(msg)));
        }
    }
    Err(LuaError::Runtime(val))
}

fn base_pcall(mut args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
    if args.is_empty() {
        return Err(arg_error(1, "value expected"));
    }
    let func = args.remove(0);
    with_current_vm(move |vm| match vm.call_value(func, args) {
        Ok(mut results) => {
            let mut out = Vec::with_capacity(results.len() + 1);
            out.push(Value::Boolean(true));
            out.append(&mut results);
            Ok(out)
        }
        Err(e) => Ok(vec![Value::Boolean(false), e.into_value()]),
    })
}

fn base_ipairs(args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
    let t = Args::new(&args).check_any(1)?;
    Ok(vec![Value::Native(ipairs_step), t, Value::Integer(0)])
}

fn ipairs_step(args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
    let a = Args::new(&args);
    let t = a.check_any(1)?;
    let i = a.check_integer(2)? + 1;
    with_current_vm(|vm| {
        let v = meta::index(vm, &t, &Value::Integer(i))?;
        if v.is_nil() {
            Ok(vec![Value::Nil])
        } else {
            Ok(vec![Value::Integer(i), v])
        }
    })
}

fn base_pairs(args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
    let t = Args::new(&args).check_table(1)?;
    Ok(vec![Value::Native(base_next), Value::Table(t), Value::Nil])
}

fn base_next(args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
    let a = Args::new(&args);
    let t = a.check_table(1)?;
    let prev = a.get(2);
    let step = t.read().unwrap().next_entry(&prev)?;
    Ok(match step {
        Some((k, v)) => vec![k, v],
        None => vec![Value::Nil],
    })
}

fn base_select(args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
    let a = Args::new(&args);
    if let Value::Str(s) = a.get(1) {
        if s == "#" {
            return Ok(vec![Value::Integer(args.len() as i64 - 1)]);
        }
    }
    let n = a.check_integer(1)?;
    if n < 1 {
        return Err(arg_error(1, "index out of range"));
    }
    Ok(args.into_iter().skip(n as usize).collect())
}

fn base_rawget(args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
    let a = Args::new(&args);
    let t = a.check_table(1)?;
    let k = a.check_any(2)?;
    let v = t.read().unwrap().get(&k);
    Ok(vec![v])
}

fn base_rawset(args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
    let a = Args::new(&args);
    let t = a.check_table(1)?;
    let k = a.check_any(2)?;
    let v = a.get(3);
    t.write().unwrap().set(k, v)?;
    Ok(vec![Value::Table(t)])
}

fn base_rawequal(args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
    let a = Args::new(&args);
    Ok(vec![Value::Boolean(a.check_any(1)? == a.check_any(2)?)])
}

fn base_rawlen(args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
    match Args::new(&args).check_any(1)? {
        Value::Table(t) => Ok(vec![Value::Integer(t.read().unwrap().len())]),
        Value::Str(s) => Ok(vec![Value::Integer(s.len() as i64)]),
        other => Err(type_error(1, "table or string", other.type_name())),
    }
}

fn base_setmetatable(args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
    let a = Args::new(&args);
    let t = a.check_table(1)?;
    let current = t.read().unwrap().metatable.clone();
    if let Some(mt) = current {
        let guard = mt.read().unwrap().get(&Value::string("__metatable"));
        if !guard.is_nil() {
            return Err(LuaError::runtime("cannot change a protected metatable"));
        }
    }
    match a.get(2) {
        Value::Nil => t.write().unwrap().metatable = None,
        Value::Table(m) => t.write().unwrap().metatable = Some(m),
        other => return Err(type_error(2, "nil or table", other.type_name())),
    }
    Ok(vec![Value::Table(t)])
}

fn base_getmetatable(args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
    let v = Args::new(&args).check_any(1)?;
    Ok(match meta::metatable_of(&v) {
        Some(mt) => {
            let guard = mt.read().unwrap().get(&Value::string("__metatable"));
            if guard.is_nil() {
                vec![Value::Table(mt)]
            } else {
                vec![guard]
            }
        }
        None => vec![Value::Nil],
    })
}

fn closure_value(chunk: Chunk) -> Value {
    Value::Closure(Arc::new(Closure {
        proto: chunk.proto,
        upvalues: Vec::new(),
    }))
}

fn base_load(args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
    let a = Args::new(&args);
    let src = a.check_string(1)?;
    let name = a.opt_string(2, "load")?;
    Ok(match luma_compiler::compile(&src, &name) {
        Ok(chunk) => vec![closure_value(chunk)],
        Err(e) => vec![Value::Nil, e.into_value()],
    })
}

/// Reads and compiles a script file, honoring the configured root and the
/// precompiled binary form.
pub(crate) fn load_chunk_from_file(vm: &Vm, name: &str) -> Result<Chunk, String> {
    let path = vm
        .resolve_path(name)
        .map_err(|reason| format!("cannot open file '{name}' ({reason})"))?;
    let bytes =
        std::fs::read(&path).map_err(|e| format!("cannot open file '{name}' ({e})"))?;
    if bytes.starts_with(luma_compiler::MAGIC) {
        luma_compiler::decode_chunk(&bytes).map_err(|e| e.to_string())
    } else {
        let src = String::from_utf8(bytes)
            .map_err(|_| format!("cannot open file '{name}' (not valid UTF-8)"))?;
        luma_compiler::compile(&src, name).map_err(|e| e.to_string())
    }
}

fn base_loadfile(args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
    let name = Args::new(&args).check_string(1)?;
    with_current_vm(move |vm| {
        Ok(match load_chunk_from_file(vm, &name) {
            Ok(chunk) => vec![closure_value(chunk)],
            Err(msg) => vec![Value::Nil, Value::Str(msg)],
        })
    })
}

fn base_dofile(args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
    let name = Args::new(&args).check_string(1)?;
    with_current_vm(move |vm| {
        let chunk = load_chunk_from_file(vm, &name).map_err(LuaError::runtime)?;
        vm.execute(&chunk)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::SharedBuf;
    use crate::vm::Vm;

    fn run(src: &str) -> Vec<Value> {
        let chunk = luma_compiler::compile(src, "test").expect("compile error");
        Vm::new().execute(&chunk).expect("runtime error")
    }

    fn run1(src: &str) -> Value {
        let mut vals = run(src);
        if vals.is_empty() {
            Value::Nil
        } else {
            vals.remove(0)
        }
    }

    #[test]
    fn type_names() {
        assert_eq!(
            run("return type(nil), type(1), type(1.5), type('s'), type({}), type(print)"),
            vec![
                Value::string("nil"),
                Value::string("number"),
                Value::string("number"),
                Value::string("string"),
                Value::string("table"),
                Value::string("function"),
            ]
        );
    }

    #[test]
    fn tostring_and_tonumber() {
        assert_eq!(run1("return tostring(1.5)"), Value::string("1.5"));
        assert_eq!(run1("return tostring(nil)"), Value::string("nil"));
        assert_eq!(run1("return tonumber('42')"), Value::Integer(42));
        assert_eq!(run1("return tonumber('2.5')"), Value::Float(2.5));
        assert_eq!(run1("return tonumber('ff', 16)"), Value::Integer(255));
        assert_eq!(run1("return tonumber('zz')"), Value::Nil);
        assert_eq!(run1("return tonumber({})"), Value::Nil);
    }

    #[test]
    fn assert_passes_values_through() {
        assert_eq!(
            run("return assert(1, 'unused')"),
            vec![Value::Integer(1), Value::string("unused")]
        );
    }

    #[test]
    fn assert_failure_messages() {
        assert_eq!(
            run1("local _, e = pcall(function() assert(false) end) return e"),
            Value::string("test:1: assertion failed!")
        );
        assert_eq!(
            run1("local _, e = pcall(function() assert(nil, 'custom') end) return e"),
            Value::string("custom")
        );
    }

    #[test]
    fn error_level_zero_suppresses_position() {
        assert_eq!(
            run1("local _, e = pcall(function() error('raw', 0) end) return e"),
            Value::string("raw")
        );
    }

    #[test]
    fn pcall_of_a_non_function() {
        let vals = run("return pcall(nil)");
        assert_eq!(vals[0], Value::Boolean(false));
        assert!(vals[1]
            .to_string()
            .contains("attempt to call a nil value"));
    }

    #[test]
    fn pcall_success_forwards_results() {
        assert_eq!(
            run("return pcall(function(a, b) return a + b, 'ok' end, 2, 3)"),
            vec![Value::Boolean(true), Value::Integer(5), Value::string("ok")]
        );
    }

    #[test]
    fn select_variants() {
        assert_eq!(run1("return select('#', 'a', 'b', 'c')"), Value::Integer(3));
        assert_eq!(
            run("return select(2, 'a', 'b', 'c')"),
            vec![Value::string("b"), Value::string("c")]
        );
    }

    #[test]
    fn raw_access_bypasses_metatables() {
        let src = "local t = setmetatable({}, { __index = function() return 'cooked' end,\n\
                                                __newindex = function() error('blocked') end })\n\
                   rawset(t, 'k', 1)\n\
                   return rawget(t, 'k'), t.missing, rawget(t, 'missing')";
        assert_eq!(
            run(src),
            vec![Value::Integer(1), Value::string("cooked"), Value::Nil]
        );
    }

    #[test]
    fn rawequal_and_rawlen() {
        assert_eq!(
            run("local t = {1, 2, 3} return rawequal(t, t), rawequal({}, {}), rawlen(t), rawlen('abcd')"),
            vec![
                Value::Boolean(true),
                Value::Boolean(false),
                Value::Integer(3),
                Value::Integer(4),
            ]
        );
    }

    #[test]
    fn protected_metatables() {
        let src = "local t = setmetatable({}, { __metatable = 'locked' })\n\
                   local ok = pcall(setmetatable, t, {})\n\
                   return ok, getmetatable(t)";
        assert_eq!(run(src), vec![Value::Boolean(false), Value::string("locked")]);
    }

    #[test]
    fn next_iterates_and_rejects_bad_keys() {
        assert_eq!(
            run1("local t = {} local n = 0 local k, v = next(t) return k"),
            Value::Nil
        );
        let vals = run("local ok, e = pcall(next, {1}, 'nope') return ok, e");
        assert_eq!(vals[0], Value::Boolean(false));
        assert!(vals[1].to_string().contains("invalid key to 'next'"));
    }

    #[test]
    fn load_compiles_a_chunk() {
        assert_eq!(
            run1("local f = load('return 2 + 3') return f()"),
            Value::Integer(5)
        );
    }

    #[test]
    fn load_reports_syntax_errors_as_a_pair() {
        let vals = run("local f, err = load('return +') return f, err");
        assert_eq!(vals[0], Value::Nil);
        assert!(vals[1].to_string().contains("unexpected symbol"));
    }

    #[test]
    fn print_writes_tab_separated_lines() {
        let out = SharedBuf::default();
        let mut vm = Vm::new();
        vm.set_stdout(Box::new(out.clone()));
        vm.run_source("print(1, 'x', nil, 2.0)", "test").unwrap();
        assert_eq!(out.contents(), "1\tx\tnil\t2.0\n");
    }
}
