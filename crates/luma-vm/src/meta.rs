//! The metatable dispatcher: one resolution routine shared by the
//! interpreter loop and the raw-operation entry points of the host ABI.

use luma_core::{LuaError, TableRef, Value};

use crate::vm::Vm;

/// How far an `__index`/`__newindex`/`__call` chain may be followed before
/// it is reported as a loop.
pub const MAX_CHAIN: usize = 100;

pub fn metatable_of(v: &Value) -> Option<TableRef> {
    match v {
        Value::Table(t) => t.read().unwrap().metatable.clone(),
        Value::Userdata(u) => u.read().unwrap().metatable.clone(),
        _ => None,
    }
}

/// The handler registered for `event` on `v`, or nil.
pub fn metamethod(v: &Value, event: &str) -> Value {
    match metatable_of(v) {
        Some(mt) => mt.read().unwrap().get(&Value::string(event)),
        None => Value::Nil,
    }
}

fn is_callable(v: &Value) -> bool {
    matches!(v, Value::Native(_) | Value::Closure(_))
}

/// Invokes a handler through the ordinary call path, keeping one result.
fn call_one(vm: &mut Vm, handler: Value, args: Vec<Value>) -> Result<Value, LuaError> {
    let mut results = vm.call_value(handler, args)?;
    Ok(if results.is_empty() {
        Value::Nil
    } else {
        results.swap_remove(0)
    })
}

/// `obj[key]` with `__index` fallback, chained up to [`MAX_CHAIN`] links.
pub fn index(vm: &mut Vm, obj: &Value, key: &Value) -> Result<Value, LuaError> {
    let mut cur = obj.clone();
    for _ in 0..MAX_CHAIN {
        if let Value::Table(t) = &cur {
            let raw = t.read().unwrap().get(key);
            if !raw.is_nil() {
                return Ok(raw);
            }
        }
        let handler = metamethod(&cur, "__index");
        if handler.is_nil() {
            if matches!(cur, Value::Table(_)) {
                return Ok(Value::Nil);
            }
            return Err(vm.rt_error(format!(
                "attempt to index a {} value",
                cur.type_name()
            )));
        }
        if is_callable(&handler) {
            return call_one(vm, handler, vec![cur, key.clone()]);
        }
        cur = handler;
    }
    Err(LuaError::MetatableLoop { event: "__index" })
}

/// `obj[key] = val` with `__newindex` fallback.
pub fn new_index(vm: &mut Vm, obj: &Value, key: &Value, val: Value) -> Result<(), LuaError> {
    let mut cur = obj.clone();
    for _ in 0..MAX_CHAIN {
        if let Value::Table(t) = &cur {
            let existing = t.read().unwrap().get(key);
            if !existing.is_nil() {
                t.write()
                    .unwrap()
                    .set(key.clone(), val)
                    .map_err(|e| vm.add_position(e))?;
                return Ok(());
            }
            let handler = metamethod(&cur, "__newindex");
            if handler.is_nil() {
                t.write()
                    .unwrap()
                    .set(key.clone(), val)
                    .map_err(|e| vm.add_position(e))?;
                return Ok(());
            }
            if is_callable(&handler) {
                vm.call_value(handler, vec![cur, key.clone(), val])?;
                return Ok(());
            }
            cur = handler;
            continue;
        }
        let handler = metamethod(&cur, "__newindex");
        if handler.is_nil() {
            return Err(vm.rt_error(format!(
                "attempt to index a {} value",
                cur.type_name()
            )));
        }
        if is_callable(&handler) {
            vm.call_value(handler, vec![cur, key.clone(), val])?;
            return Ok(());
        }
        cur = handler;
    }
    Err(LuaError::MetatableLoop {
        event: "__newindex",
    })
}

/// Resolves a callee to something directly callable, following `__call`.
/// The handler receives the original value as its first argument, so the
/// resolved argument list is returned alongside the function.
pub fn resolve_call(
    vm: &mut Vm,
    func: Value,
    mut args: Vec<Value>,
) -> Result<(Value, Vec<Value>), LuaError> {
    let mut cur = func;
    for _ in 0..MAX_CHAIN {
        if is_callable(&cur) {
            return Ok((cur, args));
        }
        let handler = metamethod(&cur, "__call");
        if handler.is_nil() {
            return Err(vm.rt_error(format!("attempt to call a {} value", cur.type_name())));
        }
        args.insert(0, cur);
        cur = handler;
    }
    Err(LuaError::MetatableLoop { event: "__call" })
}

/// Binary operator fallback: the left operand's handler wins, then the
/// right's. `None` means neither side has one.
pub fn binary_event(
    vm: &mut Vm,
    event: &'static str,
    a: &Value,
    b: &Value,
) -> Result<Option<Value>, LuaError> {
    let mut handler = metamethod(a, event);
    if handler.is_nil() {
        handler = metamethod(b, event);
    }
    if handler.is_nil() {
        return Ok(None);
    }
    Ok(Some(call_one(vm, handler, vec![a.clone(), b.clone()])?))
}

/// Equality with `__eq`: only consulted when both operands are tables or
/// both are userdata and they are not already identical.
pub fn equals(vm: &mut Vm, a: &Value, b: &Value) -> Result<bool, LuaError> {
    if a == b {
        return Ok(true);
    }
    let both_tables = matches!((a, b), (Value::Table(_), Value::Table(_)));
    let both_userdata = matches!((a, b), (Value::Userdata(_), Value::Userdata(_)));
    if !both_tables && !both_userdata {
        return Ok(false);
    }
    match binary_event(vm, "__eq", a, b)? {
        Some(v) => Ok(v.is_truthy()),
        None => Ok(false),
    }
}

/// `#v` with `__len` fallback for tables.
pub fn length(vm: &mut Vm, v: &Value) -> Result<Value, LuaError> {
    match v {
        Value::Str(s) => Ok(Value::Integer(s.len() as i64)),
        Value::Table(t) => {
            let handler = metamethod(v, "__len");
            if handler.is_nil() {
                Ok(Value::Integer(t.read().unwrap().len()))
            } else {
                call_one(vm, handler, vec![v.clone()])
            }
        }
        other => Err(vm.rt_error(format!(
            "attempt to get length of a {} value",
            other.type_name()
        ))),
    }
}

/// `tostring` semantics: `__tostring` wins over default formatting.
pub fn tostring(vm: &mut Vm, v: &Value) -> Result<String, LuaError> {
    let handler = metamethod(v, "__tostring");
    if handler.is_nil() {
        return Ok(v.to_string());
    }
    match call_one(vm, handler, vec![v.clone()])? {
        Value::Str(s) => Ok(s),
        other => Ok(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use crate::vm::Vm;
    use luma_core::{LuaError, Value};

    fn run(src: &str) -> Value {
        let chunk = luma_compiler::compile(src, "test").expect("compile error");
        let mut vm = Vm::new();
        let mut results = vm.execute(&chunk).expect("runtime error");
        if results.is_empty() {
            Value::Nil
        } else {
            results.remove(0)
        }
    }

    fn run_err(src: &str) -> LuaError {
        let chunk = luma_compiler::compile(src, "test").expect("compile error");
        Vm::new().execute(&chunk).unwrap_err()
    }

    #[test]
    fn index_chains_through_tables() {
        let v = run("local base = { x = 42 }\n\
                     local mid = setmetatable({}, { __index = base })\n\
                     local top = setmetatable({}, { __index = mid })\n\
                     return top.x");
        assert_eq!(v, Value::Integer(42));
    }

    #[test]
    fn index_function_handler() {
        let v = run("local t = setmetatable({}, { __index = function(t, k)\n\
                       return k .. '!'\n\
                     end })\n\
                     return t.hey");
        assert_eq!(v, Value::string("hey!"));
    }

    #[test]
    fn self_referential_chain_is_a_loop_error() {
        let err = run_err(
            "local t = {}\n\
             local mt = {}\n\
             mt.__index = setmetatable({}, mt)\n\
             setmetatable(t, mt)\n\
             return t.missing",
        );
        assert_eq!(err, LuaError::MetatableLoop { event: "__index" });
    }

    #[test]
    fn newindex_redirects_writes() {
        let v = run("local store = {}\n\
                     local t = setmetatable({}, { __newindex = store })\n\
                     t.a = 5\n\
                     return store.a, rawget(t, 'a')");
        assert_eq!(v, Value::Integer(5));
    }

    #[test]
    fn add_searches_left_then_right() {
        let v = run("local mt = { __add = function(a, b) return 'left' end }\n\
                     local a = setmetatable({}, mt)\n\
                     return a + {}");
        assert_eq!(v, Value::string("left"));
        let v = run("local mt = { __add = function(a, b) return 'right' end }\n\
                     local b = setmetatable({}, mt)\n\
                     return {} + b");
        assert_eq!(v, Value::string("right"));
    }

    #[test]
    fn call_on_a_table() {
        let v = run("local t = setmetatable({}, { __call = function(self, x)\n\
                       return x * 2\n\
                     end })\n\
                     return t(21)");
        assert_eq!(v, Value::Integer(42));
    }

    #[test]
    fn eq_metamethod() {
        let v = run("local mt = { __eq = function() return true end }\n\
                     local a = setmetatable({}, mt)\n\
                     local b = setmetatable({}, mt)\n\
                     return a == b");
        assert_eq!(v, Value::Boolean(true));
    }

    #[test]
    fn len_metamethod() {
        let v = run("local t = setmetatable({}, { __len = function() return 99 end })\n\
                     return #t");
        assert_eq!(v, Value::Integer(99));
    }

    #[test]
    fn tostring_metamethod() {
        let v = run("local t = setmetatable({}, { __tostring = function() return 'custom' end })\n\
                     return tostring(t)");
        assert_eq!(v, Value::string("custom"));
    }

    #[test]
    fn indexing_nil_reports_type() {
        let err = run_err("local x = nil\nreturn x.field");
        assert!(err
            .to_string()
            .contains("attempt to index a nil value"));
        assert!(err.to_string().starts_with("test:2:"));
    }
}
