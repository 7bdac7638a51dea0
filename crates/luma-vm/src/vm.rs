//! The register-based interpreter. One `Vm` owns the global environment,
//! the shared register stack and the call-frame stack; `call_value` is
//! re-entrant, which is how protected calls, metamethod handlers and native
//! functions all call back into script code.

use std::cell::Cell;
use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use luma_compiler::Chunk;
use luma_core::{
    Closure, LuaError, NativeFn, Op, Table, UpvalDesc, Upvalue, UpvalueState, Value, MULTI,
};

use crate::meta;
use crate::sandbox;
use crate::stdlib;

/// Bound on call nesting: script frames plus native re-entries combined.
/// Exceeding it raises a catchable stack-overflow error.
pub const MAX_CALL_DEPTH: usize = 200;

/// One activation of a script function.
struct Frame {
    closure: Arc<Closure>,
    ip: usize,
    /// Absolute register-stack index of this frame's register 0.
    base: usize,
    /// Absolute slot where the caller wants results (the callee slot).
    result_base: usize,
    /// Result count the call site asked for; [`MULTI`] keeps everything.
    expected: u8,
    varargs: Vec<Value>,
    /// Absolute top of the last multi-value producer, for `MULTI` operands.
    top: usize,
}

pub struct Vm {
    globals: HashMap<String, Value>,
    /// Host-private storage, invisible to scripts.
    registry: HashMap<String, Value>,
    frames: Vec<Frame>,
    regs: Vec<Value>,
    /// Live cells for captured locals, keyed by absolute register index.
    open_upvalues: Vec<(usize, Upvalue)>,
    /// Native re-entries currently on the Rust stack.
    depth: usize,
    pub(crate) stdin: Box<dyn BufRead + Send>,
    pub(crate) stdout: Box<dyn Write + Send>,
    pub(crate) stderr: Box<dyn Write + Send>,
    pub(crate) root: Option<PathBuf>,
    /// Zero point for `os.clock`, set when the interpreter is created.
    pub(crate) clock_start: Instant,
}

thread_local! {
    static CURRENT_VM: Cell<*mut Vm> = Cell::new(std::ptr::null_mut());
}

/// Gives a native function access to the interpreter that invoked it. The
/// pointer is installed for the duration of a dispatch and restored on the
/// way out, so it cannot dangle here.
pub fn with_current_vm<R>(f: impl FnOnce(&mut Vm) -> Result<R, LuaError>) -> Result<R, LuaError> {
    let ptr = CURRENT_VM.with(|c| c.get());
    if ptr.is_null() {
        return Err(LuaError::Internal(
            "no interpreter is active on this thread".into(),
        ));
    }
    let vm = unsafe { &mut *ptr };
    f(vm)
}

struct TlsGuard {
    prev: *mut Vm,
}

impl TlsGuard {
    fn install(vm: &mut Vm) -> TlsGuard {
        let prev = CURRENT_VM.with(|c| c.replace(vm as *mut Vm));
        TlsGuard { prev }
    }
}

impl Drop for TlsGuard {
    fn drop(&mut self) {
        let prev = self.prev;
        CURRENT_VM.with(|c| c.set(prev));
    }
}

pub(crate) fn new_table() -> Value {
    Value::Table(Arc::new(RwLock::new(Table::new())))
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new()
    }
}

impl Vm {
    /// A fresh interpreter with the standard libraries loaded.
    pub fn new() -> Vm {
        let mut vm = Vm {
            globals: HashMap::new(),
            registry: HashMap::new(),
            frames: Vec::new(),
            regs: Vec::new(),
            open_upvalues: Vec::new(),
            depth: 0,
            stdin: Box::new(BufReader::new(io::stdin())),
            stdout: Box::new(io::stdout()),
            stderr: Box::new(io::stderr()),
            root: None,
            clock_start: Instant::now(),
        };
        stdlib::open_all(&mut vm);
        vm
    }

    /// Runs a compiled chunk to completion and returns its results.
    pub fn execute(&mut self, chunk: &Chunk) -> Result<Vec<Value>, LuaError> {
        let closure = Arc::new(Closure {
            proto: chunk.proto.clone(),
            upvalues: Vec::new(),
        });
        self.call_value(Value::Closure(closure), Vec::new())
    }

    /// Compiles and runs source text in one step.
    pub fn run_source(&mut self, src: &str, chunk_name: &str) -> Result<Vec<Value>, LuaError> {
        let chunk = luma_compiler::compile(src, chunk_name)?;
        self.execute(&chunk)
    }

    pub fn get_global(&self, name: &str) -> Value {
        self.globals.get(name).cloned().unwrap_or(Value::Nil)
    }

    pub fn set_global(&mut self, name: &str, value: Value) {
        if value.is_nil() {
            self.globals.remove(name);
        } else {
            self.globals.insert(name.into(), value);
        }
    }

    /// Host-private storage shared between native libraries.
    pub fn get_registry(&self, key: &str) -> Value {
        self.registry.get(key).cloned().unwrap_or(Value::Nil)
    }

    pub fn set_registry(&mut self, key: &str, value: Value) {
        if value.is_nil() {
            self.registry.remove(key);
        } else {
            self.registry.insert(key.into(), value);
        }
    }

    pub fn set_stdin(&mut self, r: Box<dyn BufRead + Send>) {
        self.stdin = r;
    }

    pub fn set_stdout(&mut self, w: Box<dyn Write + Send>) {
        self.stdout = w;
    }

    pub fn set_stderr(&mut self, w: Box<dyn Write + Send>) {
        self.stderr = w;
    }

    /// Confines script file access to a directory; `None` lifts the
    /// restriction.
    pub fn set_root(&mut self, root: Option<PathBuf>) {
        self.root = root;
    }

    pub(crate) fn resolve_path(&self, name: &str) -> Result<PathBuf, String> {
        sandbox::resolve(self.root.as_deref(), name)
    }

    /// A runtime error prefixed with the position of the instruction being
    /// executed, `"<source>:<line>: <message>"`.
    pub fn rt_error(&self, message: impl Into<String>) -> LuaError {
        let m = message.into();
        match self.frames.last() {
            Some(f) => {
                let line = f
                    .closure
                    .proto
                    .line_info
                    .get(f.ip.saturating_sub(1))
                    .copied()
                    .unwrap_or(0);
                LuaError::runtime(format!("{}:{}: {}", f.closure.proto.source, line, m))
            }
            None => LuaError::runtime(m),
        }
    }

    /// Adds position info to an error raised without any.
    pub(crate) fn add_position(&self, err: LuaError) -> LuaError {
        match err {
            LuaError::Runtime(Value::Str(s)) => self.rt_error(s),
            other => other,
        }
    }

    /// Calls any callable value with `args` and returns all of its results.
    /// Errors raised below this call unwind back to exactly the frame and
    /// register heights recorded here, which is what makes the protected
    /// call guarantee hold.
    pub fn call_value(&mut self, func: Value, args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
        if self.depth + self.frames.len() >= MAX_CALL_DEPTH {
            return Err(LuaError::StackOverflow);
        }
        self.depth += 1;
        let result = self.call_inner(func, args);
        self.depth -= 1;
        result
    }

    fn call_inner(&mut self, func: Value, args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
        let _guard = TlsGuard::install(self);
        let (func, args) = meta::resolve_call(self, func, args)?;
        match func {
            Value::Native(f) => f(args),
            Value::Closure(c) => {
                let entry_frames = self.frames.len();
                let entry_regs = self.regs.len();
                self.push_frame(c, args, entry_regs, MULTI)?;
                match self.run(entry_frames) {
                    Ok(results) => Ok(results),
                    Err(e) => {
                        self.unwind(entry_frames, entry_regs);
                        Err(e)
                    }
                }
            }
            _ => Err(LuaError::Internal("unresolved callee".into())),
        }
    }

    fn call_native(&mut self, f: NativeFn, args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
        if self.depth + self.frames.len() >= MAX_CALL_DEPTH {
            return Err(LuaError::StackOverflow);
        }
        self.depth += 1;
        let result = {
            let _guard = TlsGuard::install(self);
            f(args)
        };
        self.depth -= 1;
        result
    }

    /// Drops everything pushed since a protected entry and closes the cells
    /// of the abandoned frames.
    fn unwind(&mut self, entry_frames: usize, entry_regs: usize) {
        self.close_upvalues_from(entry_regs);
        self.frames.truncate(entry_frames);
        self.regs.truncate(entry_regs);
    }

    fn ensure_regs(&mut self, len: usize) {
        if self.regs.len() < len {
            self.regs.resize(len, Value::Nil);
        }
    }

    fn push_frame(
        &mut self,
        closure: Arc<Closure>,
        mut args: Vec<Value>,
        result_base: usize,
        expected: u8,
    ) -> Result<(), LuaError> {
        if self.frames.len() >= MAX_CALL_DEPTH {
            return Err(LuaError::StackOverflow);
        }
        let base = self.regs.len();
        let params = closure.proto.param_count as usize;
        let varargs = if closure.proto.is_vararg && args.len() > params {
            args.split_off(params)
        } else {
            Vec::new()
        };
        args.resize(params, Value::Nil);
        self.regs.extend(args);
        self.ensure_regs(base + closure.proto.max_stack_size as usize);
        self.frames.push(Frame {
            closure,
            ip: 0,
            base,
            result_base,
            expected,
            varargs,
            top: base + params,
        });
        Ok(())
    }

    fn find_or_open_upvalue(&mut self, slot: usize) -> Upvalue {
        for (s, cell) in &self.open_upvalues {
            if *s == slot {
                return cell.clone();
            }
        }
        let cell = Upvalue::open(slot);
        self.open_upvalues.push((slot, cell.clone()));
        cell
    }

    /// Closes every open cell at or above `from`: the cell takes ownership
    /// of the register's current value and every alias sees the move.
    fn close_upvalues_from(&mut self, from: usize) {
        let mut i = 0;
        while i < self.open_upvalues.len() {
            if self.open_upvalues[i].0 >= from {
                let (slot, cell) = self.open_upvalues.swap_remove(i);
                let v = self.regs.get(slot).cloned().unwrap_or(Value::Nil);
                *cell.0.write().unwrap() = UpvalueState::Closed(v);
            } else {
                i += 1;
            }
        }
    }

    /// The arguments a call site provides, resolving `MULTI`.
    fn collect_args(&self, fi: usize, func_abs: usize, num_args: u8) -> Vec<Value> {
        if num_args == MULTI {
            let top = self.frames[fi].top.max(func_abs + 1);
            self.regs[func_abs + 1..top].to_vec()
        } else {
            self.regs[func_abs + 1..func_abs + 1 + num_args as usize].to_vec()
        }
    }

    /// Writes call results where the call site wants them, padding or
    /// truncating to the expected count.
    fn write_results(&mut self, dst: usize, results: Vec<Value>, expected: u8) {
        if expected == MULTI {
            let n = results.len();
            self.ensure_regs(dst + n);
            for (i, v) in results.into_iter().enumerate() {
                self.regs[dst + i] = v;
            }
            if let Some(f) = self.frames.last_mut() {
                f.top = dst + n;
            }
        } else {
            let want = expected as usize;
            self.ensure_regs(dst + want);
            for i in 0..want {
                self.regs[dst + i] = results.get(i).cloned().unwrap_or(Value::Nil);
            }
        }
    }

    /// Pops the running frame with its return values. Returns `Some` when
    /// that frame was the protected entry, handing the values to `run`'s
    /// caller; otherwise the values go to the caller's call site.
    fn finish_frame(&mut self, values: Vec<Value>, entry_frames: usize) -> Option<Vec<Value>> {
        let frame = self.frames.pop()?;
        self.close_upvalues_from(frame.base);
        self.regs.truncate(frame.base);
        if self.frames.len() == entry_frames {
            return Some(values);
        }
        self.write_results(frame.result_base, values, frame.expected);
        None
    }

    fn run(&mut self, entry_frames: usize) -> Result<Vec<Value>, LuaError> {
        loop {
            let fi = self.frames.len() - 1;
            let (op, base) = {
                let f = &mut self.frames[fi];
                let op = f.closure.proto.code.get(f.ip).copied().ok_or_else(|| {
                    LuaError::Internal("instruction pointer ran past the end".into())
                })?;
                f.ip += 1;
                (op, f.base)
            };
            match op {
                Op::LoadConst { dst, const_idx } => {
                    let v = self.frames[fi].closure.proto.constants[const_idx as usize].clone();
                    self.regs[base + dst as usize] = v;
                }
                Op::LoadNil { dst } => {
                    self.regs[base + dst as usize] = Value::Nil;
                }
                Op::LoadBool { dst, value, skip } => {
                    self.regs[base + dst as usize] = Value::Boolean(value);
                    if skip {
                        self.frames[fi].ip += 1;
                    }
                }
                Op::Move { dst, src } => {
                    self.regs[base + dst as usize] = self.regs[base + src as usize].clone();
                }
                Op::Add { dst, lhs, rhs } => self.arith_op(base, dst, lhs, rhs, "__add")?,
                Op::Sub { dst, lhs, rhs } => self.arith_op(base, dst, lhs, rhs, "__sub")?,
                Op::Mul { dst, lhs, rhs } => self.arith_op(base, dst, lhs, rhs, "__mul")?,
                Op::Div { dst, lhs, rhs } => self.arith_op(base, dst, lhs, rhs, "__div")?,
                Op::Mod { dst, lhs, rhs } => self.arith_op(base, dst, lhs, rhs, "__mod")?,
                Op::Pow { dst, lhs, rhs } => self.arith_op(base, dst, lhs, rhs, "__pow")?,
                Op::IDiv { dst, lhs, rhs } => self.arith_op(base, dst, lhs, rhs, "__idiv")?,
                Op::Unm { dst, src } => {
                    let v = self.regs[base + src as usize].clone();
                    let out = match coerce_number(&v) {
                        Some(Value::Integer(i)) => Value::Integer(i.wrapping_neg()),
                        Some(Value::Float(f)) => Value::Float(-f),
                        _ => match meta::binary_event(self, "__unm", &v, &v)? {
                            Some(r) => r,
                            None => {
                                return Err(self.rt_error(format!(
                                    "attempt to perform arithmetic on a {} value",
                                    v.type_name()
                                )))
                            }
                        },
                    };
                    self.regs[base + dst as usize] = out;
                }
                Op::Eq { dst, lhs, rhs } => {
                    let a = self.regs[base + lhs as usize].clone();
                    let b = self.regs[base + rhs as usize].clone();
                    let eq = meta::equals(self, &a, &b)?;
                    self.regs[base + dst as usize] = Value::Boolean(eq);
                }
                Op::Lt { dst, lhs, rhs } => {
                    let a = self.regs[base + lhs as usize].clone();
                    let b = self.regs[base + rhs as usize].clone();
                    let lt = self.less_than(&a, &b, false)?;
                    self.regs[base + dst as usize] = Value::Boolean(lt);
                }
                Op::Le { dst, lhs, rhs } => {
                    let a = self.regs[base + lhs as usize].clone();
                    let b = self.regs[base + rhs as usize].clone();
                    let le = self.less_than(&a, &b, true)?;
                    self.regs[base + dst as usize] = Value::Boolean(le);
                }
                Op::Not { dst, src } => {
                    let truthy = self.regs[base + src as usize].is_truthy();
                    self.regs[base + dst as usize] = Value::Boolean(!truthy);
                }
                Op::Jump { offset } => {
                    let f = &mut self.frames[fi];
                    f.ip = offset_ip(f.ip, offset);
                }
                Op::JumpIfFalse { src, offset } => {
                    if !self.regs[base + src as usize].is_truthy() {
                        let f = &mut self.frames[fi];
                        f.ip = offset_ip(f.ip, offset);
                    }
                }
                Op::JumpIfTrue { src, offset } => {
                    if self.regs[base + src as usize].is_truthy() {
                        let f = &mut self.frames[fi];
                        f.ip = offset_ip(f.ip, offset);
                    }
                }
                Op::Concat { dst, lhs, rhs } => {
                    let a = self.regs[base + lhs as usize].clone();
                    let b = self.regs[base + rhs as usize].clone();
                    let v = self.concat_values(a, b)?;
                    self.regs[base + dst as usize] = v;
                }
                Op::Len { dst, src } => {
                    let v = self.regs[base + src as usize].clone();
                    let len = meta::length(self, &v)?;
                    self.regs[base + dst as usize] = len;
                }
                Op::Call {
                    func,
                    num_args,
                    num_results,
                } => {
                    let fabs = base + func as usize;
                    let args = self.collect_args(fi, fabs, num_args);
                    let callee = self.regs[fabs].clone();
                    let (callee, args) = meta::resolve_call(self, callee, args)?;
                    match callee {
                        Value::Closure(c) => {
                            self.push_frame(c, args, fabs, num_results)?;
                        }
                        Value::Native(f) => {
                            let results = self.call_native(f, args)?;
                            self.write_results(fabs, results, num_results);
                        }
                        _ => return Err(LuaError::Internal("unresolved callee".into())),
                    }
                }
                Op::TailCall { func, num_args } => {
                    let fabs = base + func as usize;
                    let args = self.collect_args(fi, fabs, num_args);
                    let callee = self.regs[fabs].clone();
                    let (callee, args) = meta::resolve_call(self, callee, args)?;
                    self.close_upvalues_from(self.frames[fi].base);
                    match callee {
                        Value::Closure(c) => {
                            // reuse the slot of the returning frame
                            let frame = self
                                .frames
                                .pop()
                                .ok_or_else(|| LuaError::Internal("no frame to reuse".into()))?;
                            self.regs.truncate(frame.base);
                            self.push_frame(c, args, frame.result_base, frame.expected)?;
                        }
                        Value::Native(f) => {
                            let results = self.call_native(f, args)?;
                            if let Some(results) = self.finish_frame(results, entry_frames) {
                                return Ok(results);
                            }
                        }
                        _ => return Err(LuaError::Internal("unresolved callee".into())),
                    }
                }
                Op::Return { src, count } => {
                    let start = base + src as usize;
                    let values: Vec<Value> = if count == MULTI {
                        let top = self.frames[fi].top.max(start);
                        self.regs[start..top].to_vec()
                    } else {
                        self.regs[start..start + count as usize].to_vec()
                    };
                    if let Some(results) = self.finish_frame(values, entry_frames) {
                        return Ok(results);
                    }
                }
                Op::VarArg { dst, count } => {
                    let d = base + dst as usize;
                    let varargs = self.frames[fi].varargs.clone();
                    if count == MULTI {
                        let n = varargs.len();
                        self.ensure_regs(d + n);
                        for (i, v) in varargs.into_iter().enumerate() {
                            self.regs[d + i] = v;
                        }
                        self.frames[fi].top = d + n;
                    } else {
                        for i in 0..count as usize {
                            self.regs[d + i] = varargs.get(i).cloned().unwrap_or(Value::Nil);
                        }
                    }
                }
                Op::Method {
                    dst,
                    obj: obj_reg,
                    name_idx,
                } => {
                    let name = self.frames[fi].closure.proto.names[name_idx as usize].clone();
                    let obj = self.regs[base + obj_reg as usize].clone();
                    let method = meta::index(self, &obj, &Value::Str(name))?;
                    self.regs[base + dst as usize + 1] = obj;
                    self.regs[base + dst as usize] = method;
                }
                Op::GetGlobal { dst, name_idx } => {
                    let v = {
                        let name = &self.frames[fi].closure.proto.names[name_idx as usize];
                        self.globals.get(name.as_str()).cloned().unwrap_or(Value::Nil)
                    };
                    self.regs[base + dst as usize] = v;
                }
                Op::SetGlobal { src, name_idx } => {
                    let name = self.frames[fi].closure.proto.names[name_idx as usize].clone();
                    let v = self.regs[base + src as usize].clone();
                    self.set_global(&name, v);
                }
                Op::Closure { dst, proto_idx } => {
                    let (proto, parent_ups) = {
                        let f = &self.frames[fi];
                        (
                            f.closure.proto.protos[proto_idx as usize].clone(),
                            f.closure.upvalues.clone(),
                        )
                    };
                    let mut upvalues = Vec::with_capacity(proto.upvals.len());
                    for desc in &proto.upvals {
                        upvalues.push(match desc {
                            UpvalDesc::Local { index, .. } => {
                                self.find_or_open_upvalue(base + *index as usize)
                            }
                            UpvalDesc::Upval { index, .. } => parent_ups[*index as usize].clone(),
                        });
                    }
                    self.regs[base + dst as usize] =
                        Value::Closure(Arc::new(Closure { proto, upvalues }));
                }
                Op::GetUpvalue { dst, upval_idx } => {
                    let cell = self.frames[fi].closure.upvalues[upval_idx as usize].clone();
                    let v = {
                        let state = cell.0.read().unwrap();
                        match &*state {
                            UpvalueState::Open(slot) => self.regs[*slot].clone(),
                            UpvalueState::Closed(v) => v.clone(),
                        }
                    };
                    self.regs[base + dst as usize] = v;
                }
                Op::SetUpvalue { src, upval_idx } => {
                    let cell = self.frames[fi].closure.upvalues[upval_idx as usize].clone();
                    let v = self.regs[base + src as usize].clone();
                    let open_slot = {
                        let state = cell.0.read().unwrap();
                        match &*state {
                            UpvalueState::Open(slot) => Some(*slot),
                            UpvalueState::Closed(_) => None,
                        }
                    };
                    match open_slot {
                        Some(slot) => self.regs[slot] = v,
                        None => *cell.0.write().unwrap() = UpvalueState::Closed(v),
                    }
                }
                Op::CloseUpvalues { from_reg } => {
                    self.close_upvalues_from(base + from_reg as usize);
                }
                Op::NewTable { dst } => {
                    self.regs[base + dst as usize] = new_table();
                }
                Op::GetTable { dst, table, key } => {
                    let t = self.regs[base + table as usize].clone();
                    let k = self.regs[base + key as usize].clone();
                    let v = meta::index(self, &t, &k)?;
                    self.regs[base + dst as usize] = v;
                }
                Op::SetTable { table, key, val } => {
                    let t = self.regs[base + table as usize].clone();
                    let k = self.regs[base + key as usize].clone();
                    let v = self.regs[base + val as usize].clone();
                    meta::new_index(self, &t, &k, v)?;
                }
                Op::GetField {
                    dst,
                    table,
                    name_idx,
                } => {
                    let name = self.frames[fi].closure.proto.names[name_idx as usize].clone();
                    let t = self.regs[base + table as usize].clone();
                    let v = meta::index(self, &t, &Value::Str(name))?;
                    self.regs[base + dst as usize] = v;
                }
                Op::SetField {
                    table,
                    name_idx,
                    val,
                } => {
                    let name = self.frames[fi].closure.proto.names[name_idx as usize].clone();
                    let t = self.regs[base + table as usize].clone();
                    let v = self.regs[base + val as usize].clone();
                    meta::new_index(self, &t, &Value::Str(name), v)?;
                }
                Op::SetList { table, src, count } => {
                    let t = base + table as usize;
                    let s = base + src as usize;
                    let end = if count == MULTI {
                        self.frames[fi].top.max(s)
                    } else {
                        s + count as usize
                    };
                    let values: Vec<Value> = self.regs[s..end].to_vec();
                    match &self.regs[t] {
                        Value::Table(tr) => {
                            let mut tw = tr.write().unwrap();
                            for v in values {
                                tw.push(v);
                            }
                        }
                        _ => return Err(LuaError::Internal("list target is not a table".into())),
                    }
                }
                Op::ForPrep { base: fb, offset } => {
                    let b = base + fb as usize;
                    let init = self.check_loop_number(b, "'for' initial value must be a number")?;
                    let limit = self.check_loop_number(b + 1, "'for' limit must be a number")?;
                    let step = self.check_loop_number(b + 2, "'for' step must be a number")?;
                    let zero = matches!(step, Value::Integer(0))
                        || matches!(step, Value::Float(f) if f == 0.0);
                    if zero {
                        return Err(self.rt_error("'for' step is zero"));
                    }
                    self.regs[b] = numeric_sub(&init, &step);
                    self.regs[b + 1] = limit;
                    self.regs[b + 2] = step;
                    let f = &mut self.frames[fi];
                    f.ip = offset_ip(f.ip, offset);
                }
                Op::ForLoop { base: fb, offset } => {
                    let b = base + fb as usize;
                    let step = self.regs[b + 2].clone();
                    let next = match (&self.regs[b], &step) {
                        (Value::Integer(x), Value::Integer(s)) => {
                            x.checked_add(*s).map(Value::Integer)
                        }
                        (x, s) => Some(Value::Float(as_float(x) + as_float(s))),
                    };
                    if let Some(next) = next {
                        let keep = if step_positive(&step) {
                            num_le(&next, &self.regs[b + 1])
                        } else {
                            num_le(&self.regs[b + 1], &next)
                        };
                        if keep {
                            self.regs[b] = next.clone();
                            self.regs[b + 3] = next;
                            let f = &mut self.frames[fi];
                            f.ip = offset_ip(f.ip, offset);
                        }
                    }
                }
                Op::TForCall { base: fb, num_vars } => {
                    let b = base + fb as usize;
                    let iter = self.regs[b].clone();
                    let state = self.regs[b + 1].clone();
                    let control = self.regs[b + 2].clone();
                    let results = self.call_value(iter, vec![state, control])?;
                    self.ensure_regs(b + 3 + num_vars as usize);
                    for i in 0..num_vars as usize {
                        self.regs[b + 3 + i] = results.get(i).cloned().unwrap_or(Value::Nil);
                    }
                }
                Op::TForLoop { base: fb, offset } => {
                    let b = base + fb as usize;
                    let control = self.regs[b + 3].clone();
                    if !control.is_nil() {
                        self.regs[b + 2] = control;
                        let f = &mut self.frames[fi];
                        f.ip = offset_ip(f.ip, offset);
                    }
                }
                other => {
                    return Err(LuaError::Internal(format!(
                        "unhandled instruction {other:?}"
                    )))
                }
            }
        }
    }

    fn arith_op(
        &mut self,
        base: usize,
        dst: u8,
        lhs: u8,
        rhs: u8,
        event: &'static str,
    ) -> Result<(), LuaError> {
        let a = self.regs[base + lhs as usize].clone();
        let b = self.regs[base + rhs as usize].clone();
        let v = self.binary_arith(event, a, b)?;
        self.regs[base + dst as usize] = v;
        Ok(())
    }

    fn binary_arith(
        &mut self,
        event: &'static str,
        a: Value,
        b: Value,
    ) -> Result<Value, LuaError> {
        if let (Some(x), Some(y)) = (coerce_number(&a), coerce_number(&b)) {
            return self.numeric_arith(event, x, y);
        }
        match meta::binary_event(self, event, &a, &b)? {
            Some(v) => Ok(v),
            None => {
                let bad = if coerce_number(&a).is_none() { &a } else { &b };
                Err(self.rt_error(format!(
                    "attempt to perform arithmetic on a {} value",
                    bad.type_name()
                )))
            }
        }
    }

    fn numeric_arith(&self, event: &'static str, a: Value, b: Value) -> Result<Value, LuaError> {
        use Value::{Float, Integer};
        let v = match (event, &a, &b) {
            ("__add", Integer(x), Integer(y)) => Integer(x.wrapping_add(*y)),
            ("__sub", Integer(x), Integer(y)) => Integer(x.wrapping_sub(*y)),
            ("__mul", Integer(x), Integer(y)) => Integer(x.wrapping_mul(*y)),
            ("__idiv", Integer(x), Integer(y)) => {
                if *y == 0 {
                    return Err(self.rt_error("attempt to perform 'n//0'"));
                }
                Integer(floor_div(*x, *y))
            }
            ("__mod", Integer(x), Integer(y)) => {
                if *y == 0 {
                    return Err(self.rt_error("attempt to perform 'n%0'"));
                }
                Integer(floor_mod(*x, *y))
            }
            _ => {
                let (x, y) = (as_float(&a), as_float(&b));
                match event {
                    "__add" => Float(x + y),
                    "__sub" => Float(x - y),
                    "__mul" => Float(x * y),
                    "__div" => Float(x / y),
                    "__pow" => Float(x.powf(y)),
                    "__idiv" => Float((x / y).floor()),
                    "__mod" => Float(x - (x / y).floor() * y),
                    _ => {
                        return Err(LuaError::Internal(format!(
                            "unknown arithmetic event {event}"
                        )))
                    }
                }
            }
        };
        Ok(v)
    }

    fn less_than(&mut self, a: &Value, b: &Value, or_equal: bool) -> Result<bool, LuaError> {
        use Value::{Float, Integer, Str};
        match (a, b) {
            (Integer(x), Integer(y)) => Ok(if or_equal { x <= y } else { x < y }),
            (Integer(_) | Float(_), Integer(_) | Float(_)) => {
                let (x, y) = (as_float(a), as_float(b));
                Ok(if or_equal { x <= y } else { x < y })
            }
            (Str(x), Str(y)) => Ok(if or_equal { x <= y } else { x < y }),
            _ => {
                let event = if or_equal { "__le" } else { "__lt" };
                match meta::binary_event(self, event, a, b)? {
                    Some(v) => Ok(v.is_truthy()),
                    None => Err(self.rt_error(format!(
                        "attempt to compare {} with {}",
                        a.type_name(),
                        b.type_name()
                    ))),
                }
            }
        }
    }

    fn concat_values(&mut self, a: Value, b: Value) -> Result<Value, LuaError> {
        if let (Some(x), Some(y)) = (concat_str(&a), concat_str(&b)) {
            return Ok(Value::Str(x + &y));
        }
        match meta::binary_event(self, "__concat", &a, &b)? {
            Some(v) => Ok(v),
            None => {
                let bad = if concat_str(&a).is_none() { &a } else { &b };
                Err(self.rt_error(format!(
                    "attempt to concatenate a {} value",
                    bad.type_name()
                )))
            }
        }
    }

    fn check_loop_number(&self, slot: usize, message: &str) -> Result<Value, LuaError> {
        match &self.regs[slot] {
            v @ (Value::Integer(_) | Value::Float(_)) => Ok(v.clone()),
            _ => Err(self.rt_error(message)),
        }
    }
}

fn offset_ip(ip: usize, offset: i16) -> usize {
    (ip as i64 + offset as i64) as usize
}

/// Arithmetic coercion: numbers pass through, numeric strings convert.
fn coerce_number(v: &Value) -> Option<Value> {
    match v {
        Value::Integer(_) | Value::Float(_) => Some(v.clone()),
        Value::Str(s) => crate::api::str_to_value(s),
        _ => None,
    }
}

fn concat_str(v: &Value) -> Option<String> {
    match v {
        Value::Str(s) => Some(s.clone()),
        Value::Integer(_) | Value::Float(_) => Some(v.to_string()),
        _ => None,
    }
}

fn as_float(v: &Value) -> f64 {
    match v {
        Value::Integer(i) => *i as f64,
        Value::Float(f) => *f,
        _ => f64::NAN,
    }
}

fn numeric_sub(a: &Value, b: &Value) -> Value {
    match (a, b) {
        (Value::Integer(x), Value::Integer(y)) => Value::Integer(x.wrapping_sub(*y)),
        _ => Value::Float(as_float(a) - as_float(b)),
    }
}

fn step_positive(step: &Value) -> bool {
    match step {
        Value::Integer(s) => *s > 0,
        Value::Float(s) => *s > 0.0,
        _ => false,
    }
}

fn num_le(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Integer(x), Value::Integer(y)) => x <= y,
        _ => as_float(a) <= as_float(b),
    }
}

/// Floor division, the `//` operator on integers.
fn floor_div(x: i64, y: i64) -> i64 {
    let q = x.wrapping_div(y);
    let r = x.wrapping_rem(y);
    if r != 0 && (r < 0) != (y < 0) {
        q - 1
    } else {
        q
    }
}

/// Floor modulo: the result takes the divisor's sign.
fn floor_mod(x: i64, y: i64) -> i64 {
    let r = x.wrapping_rem(y);
    if r != 0 && (r < 0) != (y < 0) {
        r + y
    } else {
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn run_err(src: &str) -> LuaError {
        let chunk = luma_compiler::compile(src, "test").expect("compile error");
        Vm::new().execute(&chunk).unwrap_err()
    }

    #[test]
    fn arithmetic_subtypes() {
        assert_eq!(
            run("return 7 // 2, 7 % 3, 7 / 2, 2 ^ 10, -5 // 2"),
            vec![
                Value::Integer(3),
                Value::Integer(1),
                Value::Float(3.5),
                Value::Float(1024.0),
                Value::Integer(-3),
            ]
        );
    }

    #[test]
    fn integer_arithmetic_wraps() {
        assert_eq!(
            run1("return 9223372036854775807 + 1"),
            Value::Integer(i64::MIN)
        );
    }

    #[test]
    fn modulo_takes_divisor_sign() {
        assert_eq!(run("return 5 % -3, -5 % 3"), vec![
            Value::Integer(-1),
            Value::Integer(1),
        ]);
    }

    #[test]
    fn division_by_zero_integer() {
        let err = run_err("return 1 // 0");
        assert!(err.to_string().contains("n//0"));
        // float division yields an infinity instead
        assert_eq!(run1("return 1 / 0"), Value::Float(f64::INFINITY));
    }

    #[test]
    fn string_operands_coerce_in_arithmetic() {
        assert_eq!(run1("return '10' + 5"), Value::Integer(15));
        assert_eq!(run1("return '2.5' * 2"), Value::Float(5.0));
    }

    #[test]
    fn concatenation() {
        assert_eq!(run1("return 1 .. '-' .. 2.5"), Value::string("1-2.5"));
        let err = run_err("return {} .. 'x'");
        assert!(err.to_string().contains("attempt to concatenate a table value"));
    }

    #[test]
    fn comparisons() {
        assert_eq!(
            run("return 1 < 2, 'a' < 'b', 2 <= 2.0, nil == false"),
            vec![
                Value::Boolean(true),
                Value::Boolean(true),
                Value::Boolean(true),
                Value::Boolean(false),
            ]
        );
        let err = run_err("return 1 < 'x'");
        assert!(err.to_string().contains("attempt to compare number with string"));
    }

    #[test]
    fn numeric_for_sums() {
        assert_eq!(
            run1("local s = 0\nfor i = 1, 10 do s = s + i end\nreturn s"),
            Value::Integer(55)
        );
    }

    #[test]
    fn numeric_for_negative_and_float_steps() {
        assert_eq!(
            run1("local s = 0\nfor i = 5, 1, -2 do s = s + i end\nreturn s"),
            Value::Integer(9)
        );
        assert_eq!(
            run1("local n = 0\nfor i = 0.0, 1.0, 0.25 do n = n + 1 end\nreturn n"),
            Value::Integer(5)
        );
    }

    #[test]
    fn for_step_zero_is_an_error() {
        let err = run_err("for i = 1, 2, 0 do end");
        assert!(err.to_string().contains("'for' step is zero"));
    }

    #[test]
    fn generic_for_over_pairs() {
        let src = "local t = { a = 1, b = 2, c = 3 }\n\
                   local n = 0\n\
                   for k, v in pairs(t) do n = n + v end\n\
                   return n";
        assert_eq!(run1(src), Value::Integer(6));
    }

    #[test]
    fn generic_for_over_ipairs_stops_at_gap() {
        let src = "local t = { 10, 20, nil, 40 }\n\
                   local s = 0\n\
                   for i, v in ipairs(t) do s = s + v end\n\
                   return s";
        assert_eq!(run1(src), Value::Integer(30));
    }

    #[test]
    fn closures_share_one_cell() {
        let src = "local function make()\n\
                     local n = 0\n\
                     local function inc() n = n + 1 return n end\n\
                     local function get() return n end\n\
                     return inc, get\n\
                   end\n\
                   local inc, get = make()\n\
                   inc()\n\
                   inc()\n\
                   return get()";
        assert_eq!(run1(src), Value::Integer(2));
    }

    #[test]
    fn loop_variables_close_per_iteration() {
        let src = "local fs = {}\n\
                   for i = 1, 3 do\n\
                     fs[i] = function() return i end\n\
                   end\n\
                   return fs[1]() + fs[2]() + fs[3]()";
        assert_eq!(run1(src), Value::Integer(6));
    }

    #[test]
    fn generic_for_variables_close_per_iteration() {
        let src = "local fs = {}\n\
                   for i, v in ipairs({10, 20, 30}) do\n\
                     fs[i] = function() return v end\n\
                   end\n\
                   return fs[1]() + fs[2]() + fs[3]()";
        assert_eq!(run1(src), Value::Integer(60));
    }

    #[test]
    fn counters_are_independent() {
        let src = "local function counter()\n\
                     local n = 0\n\
                     return function() n = n + 1 return n end\n\
                   end\n\
                   local a, b = counter(), counter()\n\
                   a() a() a()\n\
                   b()\n\
                   return a(), b()";
        assert_eq!(run(src), vec![Value::Integer(4), Value::Integer(2)]);
    }

    #[test]
    fn vararg_arity_rules() {
        let src = "local function f(...) return ... end\n\
                   local a, b, c = f(1, 2)\n\
                   return a, b, c";
        assert_eq!(
            run(src),
            vec![Value::Integer(1), Value::Integer(2), Value::Nil]
        );
    }

    #[test]
    fn parentheses_truncate_to_one_value() {
        let src = "local function f() return 1, 2, 3 end\n\
                   local a, b = (f())\n\
                   return a, b";
        assert_eq!(run(src), vec![Value::Integer(1), Value::Nil]);
    }

    #[test]
    fn only_last_list_element_expands() {
        let src = "local function f() return 1, 2 end\n\
                   return f(), f()";
        assert_eq!(
            run(src),
            vec![Value::Integer(1), Value::Integer(1), Value::Integer(2)]
        );
    }

    #[test]
    fn select_counts_varargs() {
        let src = "local function n(...) return select('#', ...) end\n\
                   return n(1, nil, 3)";
        assert_eq!(run1(src), Value::Integer(3));
    }

    #[test]
    fn table_constructor_expands_trailing_call() {
        let src = "local function f() return 1, 2, 3 end\n\
                   local t = { 0, f() }\n\
                   return #t, t[4]";
        assert_eq!(run(src), vec![Value::Integer(4), Value::Integer(3)]);
    }

    #[test]
    fn self_tail_calls_are_bounded() {
        let src = "local function loop(n)\n\
                     if n == 0 then return 'done' end\n\
                     return loop(n - 1)\n\
                   end\n\
                   return loop(1000000)";
        assert_eq!(run1(src), Value::string("done"));
    }

    #[test]
    fn deep_recursion_overflows() {
        let src = "local function f(n) return 1 + f(n + 1) end\nreturn f(1)";
        assert_eq!(run_err(src), LuaError::StackOverflow);
    }

    #[test]
    fn stack_overflow_is_catchable() {
        let src = "local function f(n) return 1 + f(n + 1) end\n\
                   local ok, err = pcall(f, 1)\n\
                   return ok, err";
        assert_eq!(
            run(src),
            vec![Value::Boolean(false), Value::string("stack overflow")]
        );
    }

    #[test]
    fn pcall_returns_error_value_unchanged() {
        let src = "local ok, err = pcall(function() error({ code = 42 }) end)\n\
                   return ok, err.code";
        assert_eq!(run(src), vec![Value::Boolean(false), Value::Integer(42)]);
    }

    #[test]
    fn pcall_restores_the_caller() {
        let src = "local a, b = 1, 2\n\
                   local ok = pcall(function() error('x') end)\n\
                   return ok, a + b";
        assert_eq!(run(src), vec![Value::Boolean(false), Value::Integer(3)]);
    }

    #[test]
    fn errors_carry_source_and_line() {
        let err = run_err("local x\nerror('boom')");
        assert_eq!(err, LuaError::runtime("test:2: boom"));
    }

    #[test]
    fn arithmetic_type_errors_are_positioned() {
        let err = run_err("local t = {}\nreturn t + 1");
        assert_eq!(
            err.to_string(),
            "test:2: attempt to perform arithmetic on a table value"
        );
    }

    #[test]
    fn globals_round_trip() {
        assert_eq!(run1("x = 5\nreturn x + 1"), Value::Integer(6));
        assert_eq!(run1("return missing"), Value::Nil);
    }

    #[test]
    fn method_calls_pass_self() {
        let src = "local obj = { n = 10 }\n\
                   function obj:get() return self.n end\n\
                   return obj:get()";
        assert_eq!(run1(src), Value::Integer(10));
    }

    #[test]
    fn and_or_short_circuit() {
        assert_eq!(
            run("return nil or 'd', false and error('not reached')"),
            vec![Value::string("d"), Value::Boolean(false)]
        );
    }

    #[test]
    fn repeat_condition_sees_body_locals() {
        let src = "local i = 0\n\
                   repeat\n\
                     local done = i >= 3\n\
                     i = i + 1\n\
                   until done\n\
                   return i";
        assert_eq!(run1(src), Value::Integer(4));
    }

    #[test]
    fn goto_backward() {
        let src = "local i = 0\n\
                   ::top::\n\
                   i = i + 1\n\
                   if i < 3 then goto top end\n\
                   return i";
        assert_eq!(run1(src), Value::Integer(3));
    }

    #[test]
    fn break_leaves_the_loop() {
        let src = "local s = 0\n\
                   for i = 1, 10 do\n\
                     if i > 3 then break end\n\
                     s = s + i\n\
                   end\n\
                   return s";
        assert_eq!(run1(src), Value::Integer(6));
    }

    #[test]
    fn persisted_chunks_execute_identically() {
        let src = "local function fib(n)\n\
                     if n < 2 then return n end\n\
                     return fib(n - 1) + fib(n - 2)\n\
                   end\n\
                   return fib(12)";
        let chunk = luma_compiler::compile(src, "fib").unwrap();
        let direct = Vm::new().execute(&chunk).unwrap();
        let bytes = luma_compiler::encode_chunk(&chunk).unwrap();
        let reloaded = luma_compiler::decode_chunk(&bytes).unwrap();
        let via_bytes = Vm::new().execute(&reloaded).unwrap();
        assert_eq!(direct, via_bytes);
        assert_eq!(direct, vec![Value::Integer(144)]);
    }

    #[test]
    fn nested_calls_keep_registers_separate() {
        let src = "local function add(a, b) return a + b end\n\
                   local function twice(x) return add(x, x) end\n\
                   local keep = 99\n\
                   local r = twice(21)\n\
                   return r, keep";
        assert_eq!(run(src), vec![Value::Integer(42), Value::Integer(99)]);
    }

    #[test]
    fn table_index_nil_write_is_an_error() {
        let err = run_err("local t = {}\nlocal k\nt[k] = 1");
        assert!(err.to_string().contains("table index is nil"));
        assert!(err.to_string().starts_with("test:3:"));
    }

    #[test]
    fn host_call_through_value_api() {
        let mut vm = Vm::new();
        vm.run_source("function double(x) return x * 2 end", "host")
            .unwrap();
        let f = vm.get_global("double");
        let out = vm.call_value(f, vec![Value::Integer(8)]).unwrap();
        assert_eq!(out, vec![Value::Integer(16)]);
        // the register stack is back to empty between entries
        let out = vm
            .call_value(vm.get_global("double"), vec![Value::Integer(4)])
            .unwrap();
        assert_eq!(out, vec![Value::Integer(8)]);
    }
}
