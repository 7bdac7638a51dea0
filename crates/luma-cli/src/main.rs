//! The `luma` command: runs scripts and persisted chunks, hosts an
//! interactive shell, and exposes the compiler's disassembler and chunk
//! writer for offline use.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use luma_compiler::{compile, decode_chunk, disassemble, encode_chunk, Chunk, MAGIC};
use luma_core::{LuaError, Value};
use luma_vm::Vm;

const USAGE: &str = "usage: luma [options] [script]
options:
  -e <code>      execute <code> as a chunk
  -c <script>    compile <script> and print its disassembly
  -o <out>       with -c, write the persisted chunk to <out> instead
  --root <dir>   confine file access to <dir>
  -i             enter the shell after running the script
  -h, --help     print this message
with no script and no -e, the shell starts.";

#[derive(Default)]
struct Opts {
    root: Option<PathBuf>,
    eval: Option<String>,
    compile: Option<PathBuf>,
    output: Option<PathBuf>,
    script: Option<PathBuf>,
    interactive: bool,
    help: bool,
}

impl Opts {
    fn parse(args: &[String]) -> Result<Opts, String> {
        let mut opts = Opts::default();
        let mut it = args.iter();
        while let Some(arg) = it.next() {
            match arg.as_str() {
                "-e" => {
                    opts.eval =
                        Some(it.next().ok_or("'-e' needs an argument")?.clone());
                }
                "-c" => {
                    opts.compile =
                        Some(PathBuf::from(it.next().ok_or("'-c' needs an argument")?));
                }
                "-o" => {
                    opts.output =
                        Some(PathBuf::from(it.next().ok_or("'-o' needs an argument")?));
                }
                "--root" => {
                    opts.root =
                        Some(PathBuf::from(it.next().ok_or("'--root' needs an argument")?));
                }
                "-i" => opts.interactive = true,
                "-h" | "--help" => opts.help = true,
                other if other.starts_with('-') => {
                    return Err(format!("unrecognized option '{other}'"));
                }
                other => {
                    if opts.script.is_some() {
                        return Err("more than one script given".into());
                    }
                    opts.script = Some(PathBuf::from(other));
                }
            }
        }
        if opts.output.is_some() && opts.compile.is_none() {
            return Err("'-o' only makes sense with '-c'".into());
        }
        Ok(opts)
    }
}

fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();
    let opts = match Opts::parse(&args) {
        Ok(o) => o,
        Err(msg) => {
            eprintln!("luma: {msg}");
            eprintln!("{USAGE}");
            return ExitCode::from(2);
        }
    };
    if opts.help {
        println!("{USAGE}");
        return ExitCode::SUCCESS;
    }

    if let Some(path) = &opts.compile {
        return compile_file(path, opts.output.as_deref());
    }

    let mut vm = Vm::new();
    vm.set_root(opts.root.clone());

    if let Some(code) = &opts.eval {
        if let Err(e) = vm.run_source(code, "command line") {
            eprintln!("luma: {e}");
            return ExitCode::FAILURE;
        }
    }

    if let Some(path) = &opts.script {
        let chunk = match load_chunk(path) {
            Ok(c) => c,
            Err(msg) => {
                eprintln!("luma: {msg}");
                return ExitCode::FAILURE;
            }
        };
        if let Err(e) = vm.execute(&chunk) {
            eprintln!("luma: {e}");
            return ExitCode::FAILURE;
        }
    }

    let wants_shell = opts.interactive || (opts.script.is_none() && opts.eval.is_none());
    if wants_shell {
        if let Err(e) = repl(&mut vm) {
            eprintln!("luma: {e}");
            return ExitCode::FAILURE;
        }
    }
    ExitCode::SUCCESS
}

/// Reads a script or a persisted chunk, telling them apart by the magic
/// prefix.
fn load_chunk(path: &Path) -> Result<Chunk, String> {
    let bytes =
        fs::read(path).map_err(|e| format!("cannot open '{}': {e}", path.display()))?;
    if bytes.starts_with(MAGIC) {
        return decode_chunk(&bytes).map_err(|e| format!("'{}': {e}", path.display()));
    }
    let src = String::from_utf8(bytes)
        .map_err(|_| format!("'{}' is neither a script nor a chunk", path.display()))?;
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "chunk".into());
    compile(&src, &name).map_err(|e| e.to_string())
}

fn compile_file(path: &Path, output: Option<&Path>) -> ExitCode {
    let chunk = match load_chunk(path) {
        Ok(c) => c,
        Err(msg) => {
            eprintln!("luma: {msg}");
            return ExitCode::FAILURE;
        }
    };
    match output {
        Some(out) => {
            let bytes = match encode_chunk(&chunk) {
                Ok(b) => b,
                Err(e) => {
                    eprintln!("luma: {e}");
                    return ExitCode::FAILURE;
                }
            };
            if let Err(e) = fs::write(out, bytes) {
                eprintln!("luma: cannot write '{}': {e}", out.display());
                return ExitCode::FAILURE;
            }
        }
        None => print!("{}", disassemble(&chunk.proto)),
    }
    ExitCode::SUCCESS
}

enum ReplParse {
    Done(Chunk),
    /// The chunk stops mid-construct; keep reading lines.
    Incomplete,
    Bad(LuaError),
}

/// Compiles shell input, preferring the expression reading so `1 + 2`
/// prints its value without an explicit `return`.
fn parse_repl_input(src: &str) -> ReplParse {
    if let Ok(chunk) = compile(&format!("return {src}"), "stdin") {
        return ReplParse::Done(chunk);
    }
    match compile(src, "stdin") {
        Ok(chunk) => ReplParse::Done(chunk),
        Err(e) => {
            if e.to_string().ends_with("near <eof>") {
                ReplParse::Incomplete
            } else {
                ReplParse::Bad(e)
            }
        }
    }
}

fn print_values(vals: &[Value]) {
    if vals.is_empty() {
        return;
    }
    let line: Vec<String> = vals.iter().map(Value::to_string).collect();
    println!("{}", line.join("\t"));
}

fn repl(vm: &mut Vm) -> rustyline::Result<()> {
    let mut rl = DefaultEditor::new()?;
    println!("luma {} -- ctrl-d exits", env!("CARGO_PKG_VERSION"));
    let mut pending = String::new();
    loop {
        let prompt = if pending.is_empty() { "> " } else { ">> " };
        match rl.readline(prompt) {
            Ok(line) => {
                if pending.is_empty() && line.trim().is_empty() {
                    continue;
                }
                if !pending.is_empty() {
                    pending.push('\n');
                }
                pending.push_str(&line);
                match parse_repl_input(&pending) {
                    ReplParse::Incomplete => continue,
                    ReplParse::Done(chunk) => {
                        let src = std::mem::take(&mut pending);
                        let _ = rl.add_history_entry(src.as_str());
                        match vm.execute(&chunk) {
                            Ok(vals) => print_values(&vals),
                            Err(e) => eprintln!("{e}"),
                        }
                    }
                    ReplParse::Bad(e) => {
                        let _ = rl.add_history_entry(pending.as_str());
                        pending.clear();
                        eprintln!("{e}");
                    }
                }
            }
            Err(ReadlineError::Interrupted) => pending.clear(),
            Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
