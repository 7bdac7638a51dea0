//! Single-pass compiler for the luma language: source text in, a
//! [`Chunk`] (prototype tree) out, with no intermediate syntax tree.
//! Also home of the binary persisted chunk form and the disassembler.

mod chunk;
mod decode;
mod disasm;
mod encode;
mod func_state;
mod parser;

pub use chunk::Chunk;
pub use decode::decode_chunk;
pub use disasm::disassemble;
pub use encode::{encode_chunk, MAGIC};

use luma_core::LuaError;
use parser::Parser;

/// Compiles a chunk. `chunk_name` appears in error messages and debug info.
pub fn compile(src: &str, chunk_name: &str) -> Result<Chunk, LuaError> {
    let (chunk, _) = Parser::new(src, chunk_name)?.parse()?;
    Ok(chunk)
}

/// Fully parses `src` and reports the source line of each top-level
/// statement's first token, in order. Statements nested inside blocks,
/// loops or function bodies are not reported.
pub fn statement_lines(src: &str) -> Result<Vec<u32>, LuaError> {
    let (_, lines) = Parser::new(src, "chunk")?.parse()?;
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use luma_core::{Op, MULTI};

    fn lines(src: &str) -> Vec<u32> {
        statement_lines(src).expect("parse error")
    }

    fn lines_err(src: &str) -> String {
        statement_lines(src).unwrap_err().to_string()
    }

    #[test]
    fn single_assignment() {
        assert_eq!(lines("x = 10"), vec![1]);
    }

    #[test]
    fn two_assignments() {
        assert_eq!(lines("x = 10\ny = 20"), vec![1, 2]);
    }

    #[test]
    fn multiline_function_is_one_statement() {
        assert_eq!(lines("function foo()\n  x = 1\nend"), vec![1]);
    }

    #[test]
    fn function_then_call() {
        assert_eq!(lines("function foo()\n  x = 1\nend\nfoo()"), vec![1, 4]);
    }

    #[test]
    fn if_block_hides_inner_statements() {
        assert_eq!(
            lines("x = 10\nif x > 5 then\n  print(x)\nend\ny = 20"),
            vec![1, 2, 5]
        );
    }

    #[test]
    fn if_else_is_one_statement() {
        assert_eq!(lines("if x then\n  a = 1\nelse\n  a = 2\nend"), vec![1]);
    }

    #[test]
    fn while_loop() {
        assert_eq!(
            lines("i = 1\nwhile i < 10 do\n  i = i + 1\nend\nprint(i)"),
            vec![1, 2, 5]
        );
    }

    #[test]
    fn repeat_loop() {
        assert_eq!(lines("x = 0\nrepeat\n  x = x + 1\nuntil x > 5"), vec![1, 2]);
    }

    #[test]
    fn local_function() {
        assert_eq!(
            lines("local function helper()\n  return 1\nend\nhelper()"),
            vec![1, 4]
        );
    }

    #[test]
    fn nested_functions() {
        let src = "function outer()\n  local function inner()\n    return 2\n  end\n  return inner()\nend\nouter()";
        assert_eq!(lines(src), vec![1, 7]);
    }

    #[test]
    fn semicolons_share_a_line() {
        assert_eq!(lines("x = 1; y = 2; z = 3"), vec![1, 1, 1]);
    }

    #[test]
    fn return_statement_is_recorded() {
        assert_eq!(lines("x = 10\nreturn x"), vec![1, 2]);
    }

    #[test]
    fn do_block_is_one_statement() {
        assert_eq!(
            lines("x = 1\ndo\n  local y = 2\n  x = y\nend\nz = 3"),
            vec![1, 2, 6]
        );
    }

    #[test]
    fn empty_source() {
        assert_eq!(lines(""), Vec::<u32>::new());
        assert_eq!(lines("-- only a comment\n"), Vec::<u32>::new());
    }

    #[test]
    fn mixed_program() {
        let src = "local a = 1\n\
                   b = a + 1\n\
                   if b > 0 then\n\
                     c = 1\n\
                   end\n\
                   d = 2\n\
                   function f()\n\
                     local x = 1\n\
                     return x\n\
                   end\n\
                   \n\
                   f()";
        assert_eq!(lines(src), vec![1, 2, 3, 6, 7, 12]);
    }

    #[test]
    fn missing_end_is_a_syntax_error() {
        assert!(lines_err("if x > 5 then\nprint(x)\n").contains("'end' expected"));
        assert!(lines_err("function f()\nx = 1\n").contains("'end' expected"));
    }

    #[test]
    fn bare_expression_is_a_syntax_error() {
        assert!(lines_err("x + y").contains("syntax error"));
    }

    #[test]
    fn unexpected_symbol() {
        assert!(lines_err("x = )").contains("unexpected symbol"));
    }

    #[test]
    fn unfinished_string_propagates() {
        assert!(lines_err("x = \"unclosed").contains("unfinished string"));
    }

    #[test]
    fn compilation_is_deterministic() {
        let src = "local a = 1\nfunction f(x)\n  return x + a\nend\nreturn f(2)";
        let one = compile(src, "t").unwrap();
        let two = compile(src, "t").unwrap();
        assert_eq!(one.proto, two.proto);
    }

    #[test]
    fn last_call_in_list_expands() {
        // `local a, b, c = f()` widens the call to three results
        let chunk = compile("local function f() end\nlocal a, b, c = f()", "t").unwrap();
        let widened = chunk
            .proto
            .code
            .iter()
            .any(|op| matches!(op, Op::Call { num_results: 3, .. }));
        assert!(widened, "call should be widened to 3 results");
    }

    #[test]
    fn earlier_list_elements_stay_narrow() {
        // expansion applies only to the last element
        let chunk = compile("local function f() end\nlocal a, b = f(), f()", "t").unwrap();
        let calls: Vec<u8> = chunk
            .proto
            .code
            .iter()
            .filter_map(|op| match op {
                Op::Call { num_results, .. } => Some(*num_results),
                _ => None,
            })
            .collect();
        assert_eq!(calls, vec![1, 1]);
    }

    #[test]
    fn return_call_becomes_tail_call() {
        let chunk = compile("local function f() end\nlocal function g()\n  return f()\nend", "t")
            .unwrap();
        let g = &chunk.proto.protos[1];
        assert!(g.code.iter().any(|op| matches!(op, Op::TailCall { .. })));
    }

    #[test]
    fn return_vararg_expands() {
        let chunk = compile("return ...", "t").unwrap();
        assert!(chunk
            .proto
            .code
            .iter()
            .any(|op| matches!(op, Op::VarArg { count: MULTI, .. })));
        assert!(chunk
            .proto
            .code
            .iter()
            .any(|op| matches!(op, Op::Return { count: MULTI, .. })));
    }

    #[test]
    fn upvalue_threading_through_intermediate_function() {
        // `x` is defined two functions up; the middle literal must also
        // carry an upvalue descriptor for it
        let src = "local x = 1\n\
                   local function outer()\n\
                     local function inner()\n\
                       return x\n\
                     end\n\
                     return inner\n\
                   end";
        let chunk = compile(src, "t").unwrap();
        let outer = &chunk.proto.protos[0];
        let inner = &outer.protos[0];
        assert_eq!(outer.upvals.len(), 1, "outer threads the capture");
        assert_eq!(inner.upvals.len(), 1);
        assert!(matches!(inner.upvals[0], luma_core::UpvalDesc::Upval { .. }));
    }

    #[test]
    fn vararg_outside_vararg_function() {
        let err = compile("local function f()\n  return ...\nend", "t").unwrap_err();
        assert!(err.to_string().contains("outside a vararg function"));
    }

    #[test]
    fn break_outside_loop() {
        assert!(lines_err("break").contains("'break' outside a loop"));
    }

    #[test]
    fn goto_without_label() {
        assert!(lines_err("goto nowhere").contains("no visible label"));
    }

    #[test]
    fn line_info_matches_code_length() {
        let chunk = compile("x = 1\ny = 2\nreturn x + y", "t").unwrap();
        assert_eq!(chunk.proto.code.len(), chunk.proto.line_info.len());
    }

    #[test]
    fn function_line_span_is_recorded() {
        let chunk = compile("function f()\n  local a = 1\n  return a\nend", "t").unwrap();
        let f = &chunk.proto.protos[0];
        assert_eq!(f.line_defined, 1);
        assert_eq!(f.last_line_defined, 4);
    }
}
