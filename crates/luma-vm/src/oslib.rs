//! The `os` library: wall-clock time and a per-interpreter monotonic clock.

use std::time::{SystemTime, UNIX_EPOCH};

use luma_core::{LuaError, NativeFn, Value};

use crate::stdlib::new_lib;
use crate::vm::{with_current_vm, Vm};

pub(crate) fn open(vm: &mut Vm) {
    let entries: &[(&str, NativeFn)] = &[("time", os_time), ("clock", os_clock)];
    vm.set_global("os", Value::Table(new_lib(entries)));
}

fn os_time(_args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| LuaError::runtime(e.to_string()))?
        .as_secs();
    Ok(vec![Value::Integer(secs as i64)])
}

fn os_clock(_args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
    with_current_vm(|vm| Ok(vec![Value::Float(vm.clock_start.elapsed().as_secs_f64())]))
}
