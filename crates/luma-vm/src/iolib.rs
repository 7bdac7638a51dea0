//! The `io` library. Files are userdata wrapping a [`FileStream`]; the
//! standard streams are the same userdata kind backed by the interpreter's
//! configurable handles, so scripts cannot tell them apart. I/O failures
//! come back as `(nil, message)` pairs; misuse (closed files, closing a
//! standard stream) raises.

use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::{Arc, RwLock};

use luma_core::{LuaError, Table, Userdata, UserdataRef, Value};

use crate::api::{arg_error, type_error, Args};
use crate::stdlib::new_lib;
use crate::vm::{with_current_vm, Vm};

enum StreamKind {
    Owned(fs::File),
    Stdin,
    Stdout,
    Stderr,
}

/// Payload of a file userdata. `kind = None` means the file was closed.
struct FileStream {
    kind: Option<StreamKind>,
}

pub(crate) fn open(vm: &mut Vm) {
    let methods = new_lib(&[
        ("read", f_read),
        ("write", f_write),
        ("close", f_close),
        ("seek", f_seek),
        ("lines", f_lines),
    ]);
    let mt = Arc::new(RwLock::new(Table::new()));
    mt.write()
        .unwrap()
        .set(Value::string("__index"), Value::Table(methods))
        .unwrap();
    vm.set_registry("io.file_meta", Value::Table(mt));

    let stdin = make_file(vm, StreamKind::Stdin);
    let stdout = make_file(vm, StreamKind::Stdout);
    let stderr = make_file(vm, StreamKind::Stderr);
    vm.set_registry("io.input", stdin.clone());
    vm.set_registry("io.output", stdout.clone());

    let io = new_lib(&[
        ("open", io_open),
        ("read", io_read),
        ("write", io_write),
        ("lines", io_lines),
        ("input", io_input),
        ("output", io_output),
        ("close", io_close),
    ]);
    {
        let mut tw = io.write().unwrap();
        tw.set(Value::string("stdin"), stdin).unwrap();
        tw.set(Value::string("stdout"), stdout).unwrap();
        tw.set(Value::string("stderr"), stderr).unwrap();
    }
    vm.set_global("io", Value::Table(io));
}

fn make_file(vm: &Vm, kind: StreamKind) -> Value {
    let metatable = match vm.get_registry("io.file_meta") {
        Value::Table(t) => Some(t),
        _ => None,
    };
    Value::Userdata(Arc::new(RwLock::new(Userdata {
        data: Box::new(FileStream { kind: Some(kind) }),
        metatable,
    })))
}

fn closed_error() -> LuaError {
    LuaError::runtime("attempt to use a closed file")
}

/// Reads one item in the given format from a file userdata, routing the
/// standard input stream through the interpreter's handle.
fn read_from(vm: &mut Vm, ud: &UserdataRef, spec: &Value) -> Result<Value, LuaError> {
    let mut guard = ud.write().unwrap();
    let stream = guard
        .data
        .downcast_mut::<FileStream>()
        .ok_or_else(|| arg_error(1, "file expected"))?;
    match stream.kind.as_mut() {
        None => Err(closed_error()),
        Some(StreamKind::Owned(f)) => do_read(f, spec),
        Some(StreamKind::Stdin) => {
            let mut r: &mut (dyn io::BufRead + Send) = &mut *vm.stdin;
            do_read(&mut r, spec)
        }
        Some(_) => Err(LuaError::runtime("file is not opened for reading")),
    }
}

fn do_read(r: &mut dyn Read, spec: &Value) -> Result<Value, LuaError> {
    let out = match spec {
        Value::Nil => read_line(r, false),
        Value::Integer(n) => read_count(r, *n),
        Value::Float(f) if f.fract() == 0.0 => read_count(r, *f as i64),
        Value::Str(s) => {
            let fmt = s.strip_prefix('*').unwrap_or(s);
            match fmt {
                "l" | "line" => read_line(r, false),
                "L" => read_line(r, true),
                "a" | "all" => read_all(r),
                "n" | "number" => read_number(r),
                _ => return Err(arg_error(2, format!("invalid format '{s}'"))),
            }
        }
        other => return Err(type_error(2, "string or number", other.type_name())),
    };
    out.map_err(|e| LuaError::runtime(e.to_string()))
}

fn read_line(r: &mut dyn Read, keep_newline: bool) -> io::Result<Value> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if r.read(&mut byte)? == 0 {
            if buf.is_empty() {
                return Ok(Value::Nil);
            }
            break;
        }
        if byte[0] == b'\n' {
            if keep_newline {
                buf.push(b'\n');
            }
            break;
        }
        buf.push(byte[0]);
    }
    Ok(Value::Str(String::from_utf8_lossy(&buf).into_owned()))
}

fn read_all(r: &mut dyn Read) -> io::Result<Value> {
    let mut buf = Vec::new();
    r.read_to_end(&mut buf)?;
    Ok(Value::Str(String::from_utf8_lossy(&buf).into_owned()))
}

fn read_count(r: &mut dyn Read, n: i64) -> io::Result<Value> {
    if n <= 0 {
        return Ok(Value::string(""));
    }
    let mut buf = vec![0u8; n as usize];
    let mut total = 0;
    while total < buf.len() {
        let k = r.read(&mut buf[total..])?;
        if k == 0 {
            break;
        }
        total += k;
    }
    if total == 0 {
        return Ok(Value::Nil);
    }
    buf.truncate(total);
    Ok(Value::Str(String::from_utf8_lossy(&buf).into_owned()))
}

/// Skips whitespace, then consumes the longest number-shaped byte run. The
/// first delimiter byte after the number is consumed along the way.
fn read_number(r: &mut dyn Read) -> io::Result<Value> {
    let mut byte = [0u8; 1];
    loop {
        if r.read(&mut byte)? == 0 {
            return Ok(Value::Nil);
        }
        if !byte[0].is_ascii_whitespace() {
            break;
        }
    }
    let mut s = String::new();
    loop {
        let c = byte[0] as char;
        if c.is_ascii_hexdigit() || matches!(c, '+' | '-' | '.' | 'x' | 'X') {
            s.push(c);
        } else {
            break;
        }
        if r.read(&mut byte)? == 0 {
            break;
        }
    }
    Ok(crate::api::str_to_value(&s).unwrap_or(Value::Nil))
}

/// Writes the given values. Misuse (closed file, non-writable stream, bad
/// value type) raises; an I/O failure comes back as the inner `Err` so the
/// caller can turn it into a `(nil, message)` pair.
fn write_to(
    vm: &mut Vm,
    ud: &UserdataRef,
    vals: &[Value],
    first: usize,
) -> Result<Result<(), String>, LuaError> {
    let mut guard = ud.write().unwrap();
    let stream = guard
        .data
        .downcast_mut::<FileStream>()
        .ok_or_else(|| arg_error(1, "file expected"))?;
    let w: &mut dyn Write = match stream.kind.as_mut() {
        None => return Err(closed_error()),
        Some(StreamKind::Owned(f)) => f,
        Some(StreamKind::Stdout) => &mut *vm.stdout,
        Some(StreamKind::Stderr) => &mut *vm.stderr,
        Some(StreamKind::Stdin) => {
            return Err(LuaError::runtime("file is not opened for writing"))
        }
    };
    for (i, v) in vals.iter().enumerate().skip(first) {
        let written = match v {
            Value::Str(s) => w.write_all(s.as_bytes()),
            Value::Integer(_) | Value::Float(_) => w.write_all(v.to_string().as_bytes()),
            other => return Err(type_error(i + 1, "string", other.type_name())),
        };
        if let Err(e) = written {
            return Ok(Err(e.to_string()));
        }
    }
    Ok(w.flush().map_err(|e| e.to_string()))
}

fn close_stream(ud: &UserdataRef) -> Result<Vec<Value>, LuaError> {
    let mut guard = ud.write().unwrap();
    let stream = guard
        .data
        .downcast_mut::<FileStream>()
        .ok_or_else(|| arg_error(1, "file expected"))?;
    if stream.kind.is_none() {
        return Err(closed_error());
    }
    if matches!(stream.kind, Some(StreamKind::Owned(_))) {
        stream.kind = None;
        Ok(vec![Value::Boolean(true)])
    } else {
        Err(LuaError::runtime("cannot close standard file"))
    }
}

fn default_stream(vm: &Vm, key: &str) -> Result<UserdataRef, LuaError> {
    match vm.get_registry(key) {
        Value::Userdata(u) => Ok(u),
        _ => Err(LuaError::Internal(format!("default stream '{key}' missing"))),
    }
}

fn read_many(
    vm: &mut Vm,
    ud: &UserdataRef,
    args: &[Value],
    first: usize,
) -> Result<Vec<Value>, LuaError> {
    let a = Args::new(args);
    if args.len() < first {
        return Ok(vec![read_from(vm, ud, &Value::Nil)?]);
    }
    let mut out = Vec::new();
    for n in first..=args.len() {
        let v = read_from(vm, ud, &a.get(n))?;
        let done = v.is_nil();
        out.push(v);
        if done {
            break;
        }
    }
    Ok(out)
}

fn f_read(args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
    let ud = Args::new(&args).check_userdata(1)?;
    with_current_vm(move |vm| read_many(vm, &ud, &args, 2))
}

fn f_write(args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
    let ud = Args::new(&args).check_userdata(1)?;
    with_current_vm(move |vm| {
        match write_to(vm, &ud, &args, 1)? {
            Ok(()) => Ok(vec![Value::Userdata(ud.clone())]),
            Err(msg) => Ok(vec![Value::Nil, Value::string(msg)]),
        }
    })
}

fn f_close(args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
    close_stream(&Args::new(&args).check_userdata(1)?)
}

fn f_seek(args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
    let a = Args::new(&args);
    let ud = a.check_userdata(1)?;
    let whence = a.opt_string(2, "cur")?;
    let offset = a.opt_integer(3, 0)?;
    let mut guard = ud.write().unwrap();
    let stream = guard
        .data
        .downcast_mut::<FileStream>()
        .ok_or_else(|| arg_error(1, "file expected"))?;
    let file = match stream.kind.as_mut() {
        None => return Err(closed_error()),
        Some(StreamKind::Owned(f)) => f,
        Some(_) => {
            return Ok(vec![
                Value::Nil,
                Value::string("cannot seek on a standard stream"),
            ])
        }
    };
    let from = match whence.as_str() {
        "set" => {
            if offset < 0 {
                return Ok(vec![Value::Nil, Value::string("negative offset")]);
            }
            SeekFrom::Start(offset as u64)
        }
        "cur" => SeekFrom::Current(offset),
        "end" => SeekFrom::End(offset),
        other => return Err(arg_error(2, format!("invalid option '{other}'"))),
    };
    Ok(match file.seek(from) {
        Ok(pos) => vec![Value::Integer(pos as i64)],
        Err(e) => vec![Value::Nil, Value::Str(e.to_string())],
    })
}

fn f_lines(args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
    let ud = Args::new(&args).check_userdata(1)?;
    Ok(vec![make_lines_iterator(Value::Userdata(ud), false)])
}

fn io_open(args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
    let a = Args::new(&args);
    let name = a.check_string(1)?;
    let mode = a.opt_string(2, "r")?;
    let mut opts = fs::OpenOptions::new();
    match mode.trim_end_matches('b') {
        "r" => opts.read(true),
        "r+" => opts.read(true).write(true),
        "w" => opts.write(true).create(true).truncate(true),
        "w+" => opts.read(true).write(true).create(true).truncate(true),
        "a" => opts.append(true).create(true),
        "a+" => opts.read(true).append(true).create(true),
        _ => return Err(arg_error(2, "invalid mode")),
    };
    with_current_vm(move |vm| {
        let path = match vm.resolve_path(&name) {
            Ok(p) => p,
            Err(reason) => {
                return Ok(vec![
                    Value::Nil,
                    Value::Str(format!("cannot open file '{name}' ({reason})")),
                ])
            }
        };
        Ok(match opts.open(&path) {
            Ok(f) => vec![make_file(vm, StreamKind::Owned(f))],
            Err(e) => vec![
                Value::Nil,
                Value::Str(format!("cannot open file '{name}' ({e})")),
            ],
        })
    })
}

fn io_read(args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
    with_current_vm(move |vm| {
        let ud = default_stream(vm, "io.input")?;
        read_many(vm, &ud, &args, 1)
    })
}

fn io_write(args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
    with_current_vm(move |vm| {
        let ud = default_stream(vm, "io.output")?;
        match write_to(vm, &ud, &args, 0)? {
            Ok(()) => Ok(vec![Value::Userdata(ud)]),
            Err(msg) => Ok(vec![Value::Nil, Value::string(msg)]),
        }
    })
}

fn io_close(args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
    match Args::new(&args).get(1) {
        Value::Userdata(u) => close_stream(&u),
        Value::Nil => with_current_vm(|vm| close_stream(&default_stream(vm, "io.output")?)),
        other => Err(type_error(1, "file", other.type_name())),
    }
}

fn set_default(args: Vec<Value>, key: &'static str) -> Result<Vec<Value>, LuaError> {
    with_current_vm(move |vm| {
        let a = Args::new(&args);
        match a.get(1) {
            Value::Nil => Ok(vec![vm.get_registry(key)]),
            Value::Str(name) => {
                let path = vm.resolve_path(&name).map_err(|reason| {
                    LuaError::runtime(format!("cannot open file '{name}' ({reason})"))
                })?;
                let mode = if key == "io.input" { "read" } else { "write" };
                let file = if mode == "read" {
                    fs::File::open(&path)
                } else {
                    fs::File::create(&path)
                }
                .map_err(|e| LuaError::runtime(format!("cannot open file '{name}' ({e})")))?;
                let f = make_file(vm, StreamKind::Owned(file));
                vm.set_registry(key, f.clone());
                Ok(vec![f])
            }
            Value::Userdata(u) => {
                vm.set_registry(key, Value::Userdata(u.clone()));
                Ok(vec![Value::Userdata(u)])
            }
            other => Err(type_error(1, "string or file", other.type_name())),
        }
    })
}

fn io_input(args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
    set_default(args, "io.input")
}

fn io_output(args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
    set_default(args, "io.output")
}

fn io_lines(args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
    with_current_vm(move |vm| {
        let a = Args::new(&args);
        match a.get(1) {
            Value::Nil => Ok(vec![make_lines_iterator(vm.get_registry("io.input"), false)]),
            Value::Str(name) => {
                let path = vm.resolve_path(&name).map_err(|reason| {
                    LuaError::runtime(format!("cannot open file '{name}' ({reason})"))
                })?;
                let file = fs::File::open(&path).map_err(|e| {
                    LuaError::runtime(format!("cannot open file '{name}' ({e})"))
                })?;
                let ud = make_file(vm, StreamKind::Owned(file));
                Ok(vec![make_lines_iterator(ud, true)])
            }
            other => Err(type_error(1, "string", other.type_name())),
        }
    })
}

/// A callable table holding the stream; the generic-for loop drives it
/// through the ordinary `__call` path.
fn make_lines_iterator(file: Value, autoclose: bool) -> Value {
    let t = Arc::new(RwLock::new(Table::new()));
    {
        let mut tw = t.write().unwrap();
        tw.set(Value::string("file"), file).unwrap();
        tw.set(Value::string("autoclose"), Value::Boolean(autoclose))
            .unwrap();
    }
    let mt = Arc::new(RwLock::new(Table::new()));
    mt.write()
        .unwrap()
        .set(Value::string("__call"), Value::Native(lines_step))
        .unwrap();
    t.write().unwrap().metatable = Some(mt);
    Value::Table(t)
}

fn lines_step(args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
    let t = Args::new(&args).check_table(1)?;
    let (file, autoclose) = {
        let tr = t.read().unwrap();
        (
            tr.get(&Value::string("file")),
            tr.get(&Value::string("autoclose")).is_truthy(),
        )
    };
    let ud = match file {
        Value::Userdata(u) => u,
        _ => return Err(arg_error(1, "file expected")),
    };
    with_current_vm(move |vm| {
        let line = read_from(vm, &ud, &Value::string("l"))?;
        if line.is_nil() && autoclose {
            close_stream(&ud)?;
        }
        Ok(vec![line])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::SharedBuf;
    use crate::vm::Vm;
    use std::path::Path;

    fn vm_with_root(dir: &Path) -> Vm {
        let mut vm = Vm::new();
        vm.set_root(Some(dir.to_path_buf()));
        vm
    }

    fn run_in(vm: &mut Vm, src: &str) -> Vec<Value> {
        vm.run_source(src, "test").expect("runtime error")
    }

    #[test]
    fn write_then_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut vm = vm_with_root(dir.path());
        run_in(
            &mut vm,
            "local f = assert(io.open('out.txt', 'w'))\n\
             f:write('hello ', 42, '\\n')\n\
             f:close()",
        );
        let vals = run_in(
            &mut vm,
            "local f = assert(io.open('out.txt'))\n\
             local all = f:read('*a')\n\
             f:close()\n\
             return all",
        );
        assert_eq!(vals, vec![Value::string("hello 42\n")]);
    }

    #[test]
    fn read_formats() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data.txt"), "hello\n42.5\nrest").unwrap();
        let mut vm = vm_with_root(dir.path());
        let vals = run_in(
            &mut vm,
            "local f = assert(io.open('data.txt'))\n\
             local line = f:read('*l')\n\
             local n = f:read('*number')\n\
             local tail = f:read('*all')\n\
             f:close()\n\
             return line, n, tail",
        );
        assert_eq!(
            vals,
            vec![
                Value::string("hello"),
                Value::Float(42.5),
                Value::string("rest"),
            ]
        );
    }

    #[test]
    fn count_format_reads_exact_bytes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "hello world").unwrap();
        let mut vm = vm_with_root(dir.path());
        let vals = run_in(
            &mut vm,
            "local f = assert(io.open('b.txt'))\n\
             return f:read(5), f:read(3), f:read(100), f:read(1)",
        );
        assert_eq!(
            vals,
            vec![
                Value::string("hello"),
                Value::string(" wo"),
                Value::string("rld"),
                Value::Nil,
            ]
        );
    }

    #[test]
    fn line_format_keeps_newline_with_big_l() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("l.txt"), "one\ntwo").unwrap();
        let mut vm = vm_with_root(dir.path());
        let vals = run_in(
            &mut vm,
            "local f = assert(io.open('l.txt'))\n\
             return f:read('*L'), f:read('*L'), f:read('*L')",
        );
        assert_eq!(
            vals,
            vec![Value::string("one\n"), Value::string("two"), Value::Nil]
        );
    }

    #[test]
    fn lines_iterates_and_closes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("lines.txt"), "a\nbb\nccc\n").unwrap();
        let mut vm = vm_with_root(dir.path());
        let vals = run_in(
            &mut vm,
            "local n, last = 0, nil\n\
             for line in io.lines('lines.txt') do\n\
               n = n + 1\n\
               last = line\n\
             end\n\
             return n, last",
        );
        assert_eq!(vals, vec![Value::Integer(3), Value::string("ccc")]);
    }

    #[test]
    fn seek_moves_the_cursor() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("s.txt"), "abcdef").unwrap();
        let mut vm = vm_with_root(dir.path());
        let vals = run_in(
            &mut vm,
            "local f = assert(io.open('s.txt'))\n\
             local first = f:read(2)\n\
             local back = f:seek('set', 0)\n\
             local again = f:read(2)\n\
             local near_end = f:seek('end', -2)\n\
             local tail = f:read('*a')\n\
             local pos = f:seek()\n\
             return first, back, again, near_end, tail, pos",
        );
        assert_eq!(
            vals,
            vec![
                Value::string("ab"),
                Value::Integer(0),
                Value::string("ab"),
                Value::Integer(4),
                Value::string("ef"),
                Value::Integer(6),
            ]
        );
    }

    #[test]
    fn open_failure_is_a_nil_message_pair() {
        let dir = tempfile::tempdir().unwrap();
        let mut vm = vm_with_root(dir.path());
        let vals = run_in(&mut vm, "return io.open('missing.txt')");
        assert_eq!(vals[0], Value::Nil);
        assert!(vals[1].to_string().starts_with("cannot open file 'missing.txt'"));
    }

    #[test]
    fn failing_write_is_a_nil_message_pair() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ro.txt"), "data").unwrap();
        let mut vm = vm_with_root(dir.path());
        let vals = run_in(
            &mut vm,
            "local f = assert(io.open('ro.txt', 'r'))\n\
             return f:write('x')",
        );
        assert_eq!(vals[0], Value::Nil);
        assert!(!vals[1].to_string().is_empty());
    }

    #[test]
    fn root_blocks_escapes() {
        let dir = tempfile::tempdir().unwrap();
        let mut vm = vm_with_root(dir.path());
        let vals = run_in(&mut vm, "return io.open('../escape.txt')");
        assert_eq!(vals[0], Value::Nil);
        assert!(vals[1].to_string().contains("cannot open file"));
        let vals = run_in(&mut vm, "return io.open('/etc/passwd')");
        assert_eq!(vals[0], Value::Nil);
    }

    #[test]
    fn root_allows_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/x.txt"), "inside").unwrap();
        let mut vm = vm_with_root(dir.path());
        let vals = run_in(
            &mut vm,
            "local f = assert(io.open('sub/x.txt'))\nreturn f:read('*a')",
        );
        assert_eq!(vals, vec![Value::string("inside")]);
    }

    #[test]
    fn loadfile_and_dofile_are_confined() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("mod.lua"), "return 7").unwrap();
        let mut vm = vm_with_root(dir.path());
        assert_eq!(
            run_in(&mut vm, "return dofile('mod.lua')"),
            vec![Value::Integer(7)]
        );
        let vals = run_in(&mut vm, "return loadfile('../outside.lua')");
        assert_eq!(vals[0], Value::Nil);
        assert!(vals[1].to_string().contains("cannot open file"));
    }

    #[test]
    fn default_streams_are_redirectable() {
        let mut vm = Vm::new();
        vm.set_stdin(Box::new(io::Cursor::new(b"first line\n42\n".to_vec())));
        let out = SharedBuf::default();
        vm.set_stdout(Box::new(out.clone()));
        let vals = run_in(
            &mut vm,
            "io.write('x=', 1, '\\n')\n\
             return io.read('*l'), io.read('*n')",
        );
        assert_eq!(vals, vec![Value::string("first line"), Value::Integer(42)]);
        assert_eq!(out.contents(), "x=1\n");
    }

    #[test]
    fn closed_files_reject_use() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("c.txt"), "data").unwrap();
        let mut vm = vm_with_root(dir.path());
        let vals = run_in(
            &mut vm,
            "local f = assert(io.open('c.txt'))\n\
             f:close()\n\
             local ok, err = pcall(function() return f:read() end)\n\
             return ok, err",
        );
        assert_eq!(vals[0], Value::Boolean(false));
        assert!(vals[1].to_string().contains("closed file"));
    }

    #[test]
    fn standard_files_cannot_be_closed() {
        let mut vm = Vm::new();
        let vals = run_in(
            &mut vm,
            "local ok, err = pcall(function() io.stdout:close() end)\n\
             return ok, err",
        );
        assert_eq!(vals[0], Value::Boolean(false));
        assert!(vals[1].to_string().contains("cannot close standard file"));
    }

    #[test]
    fn input_redirects_reads() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("in.txt"), "redirected\n").unwrap();
        let mut vm = vm_with_root(dir.path());
        let vals = run_in(
            &mut vm,
            "io.input('in.txt')\nreturn io.read('*l')",
        );
        assert_eq!(vals, vec![Value::string("redirected")]);
    }
}
