//! Single-pass recursive-descent parser with direct code generation.
//!
//! There is no syntax tree: each grammar production emits instructions into
//! the [`FuncState`] of the function being compiled. Free registers above the
//! live locals form an expression-evaluation stack; every helper that
//! produces a value leaves it in the lowest free register and bumps the
//! allocator by exactly one.

use std::sync::Arc;

use luma_core::{LuaError, Op, UpvalDesc, Value, MULTI};
use luma_lexer::{Lexer, Token, TokenKind};

use crate::chunk::Chunk;
use crate::func_state::{FuncState, LoopCtx, PendingGoto};

const UNARY_PRIORITY: u8 = 12;

/// A just-compiled call or vararg instruction whose result count can still
/// be widened if it turns out to be the last element of an expression list.
#[derive(Debug, Clone, Copy)]
enum MultiPc {
    Call(usize),
    Vararg(usize),
}

/// A suffixed expression that has been parsed but not necessarily loaded
/// into a register: the assignable forms stay symbolic so assignments can
/// emit the matching store instruction.
#[derive(Debug, Clone, Copy)]
enum Suffixed {
    Value { reg: u8, multi: Option<MultiPc> },
    Local(u8),
    Upval(u8),
    Global(u16),
    Index { table: u8, key: u8 },
    Field { table: u8, name_idx: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    IDiv,
    Mod,
    Pow,
    Concat,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

/// (operator, left priority, right priority); right < left means
/// right-associative.
fn bin_priority(kind: &TokenKind) -> Option<(BinOp, u8, u8)> {
    Some(match kind {
        TokenKind::Or => (BinOp::Or, 1, 1),
        TokenKind::And => (BinOp::And, 2, 2),
        TokenKind::Lt => (BinOp::Lt, 3, 3),
        TokenKind::Gt => (BinOp::Gt, 3, 3),
        TokenKind::Le => (BinOp::Le, 3, 3),
        TokenKind::Ge => (BinOp::Ge, 3, 3),
        TokenKind::Ne => (BinOp::Ne, 3, 3),
        TokenKind::Eq => (BinOp::Eq, 3, 3),
        TokenKind::Concat => (BinOp::Concat, 9, 8),
        TokenKind::Plus => (BinOp::Add, 10, 10),
        TokenKind::Minus => (BinOp::Sub, 10, 10),
        TokenKind::Star => (BinOp::Mul, 11, 11),
        TokenKind::Slash => (BinOp::Div, 11, 11),
        TokenKind::DoubleSlash => (BinOp::IDiv, 11, 11),
        TokenKind::Percent => (BinOp::Mod, 11, 11),
        TokenKind::Caret => (BinOp::Pow, 14, 13),
        _ => return None,
    })
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    chunk: String,
    fs: Vec<FuncState>,
    stmt_lines: Vec<u32>,
}

impl Parser {
    pub fn new(src: &str, chunk_name: &str) -> Result<Parser, LuaError> {
        let tokens = Lexer::new(src, chunk_name).tokenize()?;
        let mut root = FuncState::new(chunk_name);
        root.builder.is_vararg = true;
        Ok(Parser {
            tokens,
            pos: 0,
            chunk: chunk_name.to_string(),
            fs: vec![root],
            stmt_lines: Vec::new(),
        })
    }

    /// Compiles the whole chunk into its root prototype.
    pub fn parse(mut self) -> Result<(Chunk, Vec<u32>), LuaError> {
        let fs = self.fs_mut();
        fs.enter_scope();
        self.block()?;
        if !self.check(&TokenKind::Eof) {
            return Err(self.syntax_error("'<eof>' expected"));
        }
        let line = self.line();
        let fs = self.fs_mut();
        fs.builder.emit(Op::Return { src: 0, count: 0 }, line);
        fs.leave_scope_quiet();
        self.resolve_pending_gotos()?;
        let fs = match self.fs.pop() {
            Some(fs) => fs,
            None => return Err(LuaError::Internal("function stack underflow".into())),
        };
        let chunk = Chunk {
            proto: Arc::new(fs.builder.finish()),
        };
        Ok((chunk, self.stmt_lines))
    }

    // ── token plumbing ───────────────────────────────────────────────────

    fn peek_kind(&self) -> &TokenKind {
        &self.tokens[self.pos].kind
    }

    fn peek_kind_at(&self, offset: usize) -> &TokenKind {
        let i = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[i].kind
    }

    fn line(&self) -> u32 {
        self.tokens[self.pos].line
    }

    fn advance(&mut self) -> TokenKind {
        let kind = self.tokens[self.pos].kind.clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        kind
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn accept(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<(), LuaError> {
        if self.accept(&kind) {
            Ok(())
        } else {
            Err(self.syntax_error(format!("{what} expected")))
        }
    }

    fn expect_name(&mut self) -> Result<String, LuaError> {
        match self.peek_kind() {
            TokenKind::Name(n) => {
                let n = n.clone();
                self.advance();
                Ok(n)
            }
            _ => Err(self.syntax_error("<name> expected")),
        }
    }

    fn syntax_error(&self, message: impl Into<String>) -> LuaError {
        LuaError::Syntax {
            chunk: self.chunk.clone(),
            line: self.line(),
            message: format!("{} near {}", message.into(), self.peek_kind().describe()),
        }
    }

    // ── function-state plumbing ──────────────────────────────────────────

    fn fs(&self) -> &FuncState {
        &self.fs[self.fs.len() - 1]
    }

    fn fs_mut(&mut self) -> &mut FuncState {
        let i = self.fs.len() - 1;
        &mut self.fs[i]
    }

    fn emit(&mut self, op: Op) -> usize {
        let line = self.line();
        self.fs_mut().builder.emit(op, line)
    }

    fn reserve(&mut self, n: u8) -> Result<u8, LuaError> {
        let line = self.line();
        let chunk = self.chunk.clone();
        self.fs_mut().reserve(n, line, &chunk)
    }

    fn patch_here(&mut self, pc: usize) -> Result<(), LuaError> {
        self.fs_mut().builder.patch_jump_here(pc)
    }

    fn add_constant(&mut self, v: Value) -> Result<u16, LuaError> {
        self.fs_mut().builder.add_constant(v)
    }

    fn add_name(&mut self, name: &str) -> Result<u16, LuaError> {
        self.fs_mut().builder.add_name(name)
    }

    fn is_temp(&self, reg: u8) -> bool {
        reg >= self.fs().active_top()
    }

    // ── statements ───────────────────────────────────────────────────────

    /// Parses statements until a block-closing token. The caller owns the
    /// scope; every statement leaves the expression stack empty.
    fn block(&mut self) -> Result<(), LuaError> {
        loop {
            match self.peek_kind() {
                TokenKind::End
                | TokenKind::Eof
                | TokenKind::Else
                | TokenKind::ElseIf
                | TokenKind::Until => return Ok(()),
                TokenKind::Semi => {
                    self.advance();
                }
                TokenKind::Return => {
                    self.record_statement_line();
                    self.ret_stmt()?;
                    let top = self.fs().active_top();
                    self.fs_mut().free_to(top);
                    // return ends the block
                    return Ok(());
                }
                _ => {
                    self.record_statement_line();
                    self.statement()?;
                    let top = self.fs().active_top();
                    self.fs_mut().free_to(top);
                }
            }
        }
    }

    /// Top-level executable statements record the line of their first token.
    fn record_statement_line(&mut self) {
        if self.fs.len() == 1 && self.fs[0].scopes.len() == 1 {
            let line = self.line();
            self.stmt_lines.push(line);
        }
    }

    fn statement(&mut self) -> Result<(), LuaError> {
        match self.peek_kind() {
            TokenKind::If => self.if_stmt(),
            TokenKind::While => self.while_stmt(),
            TokenKind::Do => {
                self.advance();
                self.scoped_block()?;
                self.expect(TokenKind::End, "'end'")
            }
            TokenKind::For => self.for_stmt(),
            TokenKind::Repeat => self.repeat_stmt(),
            TokenKind::Function => self.func_stmt(),
            TokenKind::Local => self.local_stmt(),
            TokenKind::Break => self.break_stmt(),
            TokenKind::Goto => self.goto_stmt(),
            TokenKind::DoubleColon => self.label_stmt(),
            _ => self.expr_stmt(),
        }
    }

    fn scoped_block(&mut self) -> Result<(), LuaError> {
        self.fs_mut().enter_scope();
        self.block()?;
        let line = self.line();
        self.fs_mut().leave_scope(line);
        Ok(())
    }

    fn if_stmt(&mut self) -> Result<(), LuaError> {
        self.advance();
        let mut escapes = Vec::new();
        loop {
            let (cond, _) = self.expr_one()?;
            self.expect(TokenKind::Then, "'then'")?;
            let jf = self.emit(Op::JumpIfFalse {
                src: cond,
                offset: 0,
            });
            let top = self.fs().active_top();
            self.fs_mut().free_to(top);
            self.scoped_block()?;
            match self.peek_kind() {
                TokenKind::ElseIf => {
                    escapes.push(self.emit(Op::Jump { offset: 0 }));
                    self.patch_here(jf)?;
                    self.advance();
                }
                TokenKind::Else => {
                    escapes.push(self.emit(Op::Jump { offset: 0 }));
                    self.patch_here(jf)?;
                    self.advance();
                    self.scoped_block()?;
                    self.expect(TokenKind::End, "'end'")?;
                    break;
                }
                _ => {
                    self.patch_here(jf)?;
                    self.expect(TokenKind::End, "'end'")?;
                    break;
                }
            }
        }
        for pc in escapes {
            self.patch_here(pc)?;
        }
        Ok(())
    }

    fn while_stmt(&mut self) -> Result<(), LuaError> {
        self.advance();
        let loop_start = self.fs().builder.here();
        let (cond, _) = self.expr_one()?;
        let exit = self.emit(Op::JumpIfFalse {
            src: cond,
            offset: 0,
        });
        let top = self.fs().active_top();
        self.fs_mut().free_to(top);
        self.expect(TokenKind::Do, "'do'")?;
        self.fs_mut().loops.push(LoopCtx::default());
        self.scoped_block()?;
        self.expect(TokenKind::End, "'end'")?;
        let back = self.emit(Op::Jump { offset: 0 });
        self.fs_mut().builder.patch_jump(back, loop_start)?;
        self.patch_here(exit)?;
        self.finish_loop()
    }

    fn repeat_stmt(&mut self) -> Result<(), LuaError> {
        self.advance();
        let loop_start = self.fs().builder.here();
        self.fs_mut().loops.push(LoopCtx::default());
        // the until-condition can see the body's locals, so the scope stays
        // open across it
        self.fs_mut().enter_scope();
        self.block()?;
        self.expect(TokenKind::Until, "'until'")?;
        let (cond, _) = self.expr_one()?;
        let back = self.emit(Op::JumpIfFalse {
            src: cond,
            offset: 0,
        });
        self.fs_mut().builder.patch_jump(back, loop_start)?;
        let line = self.line();
        self.fs_mut().leave_scope(line);
        self.finish_loop()
    }

    fn for_stmt(&mut self) -> Result<(), LuaError> {
        self.advance();
        let name = self.expect_name()?;
        match self.peek_kind() {
            TokenKind::Assign => self.numeric_for(name),
            TokenKind::Comma | TokenKind::In => self.generic_for(name),
            _ => Err(self.syntax_error("'=' or 'in' expected")),
        }
    }

    fn numeric_for(&mut self, var: String) -> Result<(), LuaError> {
        self.advance(); // '='
        self.fs_mut().enter_scope();
        let base = self.fs().free_reg;

        self.expr_one()?; // initial value
        self.expect(TokenKind::Comma, "','")?;
        self.expr_one()?; // limit
        if self.accept(&TokenKind::Comma) {
            self.expr_one()?; // step
        } else {
            let k = self.add_constant(Value::Integer(1))?;
            let dst = self.reserve(1)?;
            self.emit(Op::LoadConst { dst, const_idx: k });
        }
        self.fs_mut().declare_local("(for index)");
        self.fs_mut().declare_local("(for limit)");
        self.fs_mut().declare_local("(for step)");
        self.reserve(1)?;
        self.fs_mut().declare_local(&var);

        let prep = self.emit(Op::ForPrep { base, offset: 0 });
        self.expect(TokenKind::Do, "'do'")?;
        self.fs_mut().loops.push(LoopCtx::default());
        self.scoped_block()?;
        self.expect(TokenKind::End, "'end'")?;
        if self.loop_vars_captured(base + 3) {
            self.emit(Op::CloseUpvalues { from_reg: base + 3 });
        }
        let loop_pc = self.emit(Op::ForLoop { base, offset: 0 });
        self.fs_mut().builder.patch_jump(prep, loop_pc)?;
        self.fs_mut().builder.patch_jump(loop_pc, prep + 1)?;
        self.finish_loop()?;
        let line = self.line();
        self.fs_mut().leave_scope(line);
        Ok(())
    }

    fn generic_for(&mut self, first: String) -> Result<(), LuaError> {
        let mut vars = vec![first];
        while self.accept(&TokenKind::Comma) {
            vars.push(self.expect_name()?);
        }
        self.expect(TokenKind::In, "'in'")?;
        self.fs_mut().enter_scope();
        let base = self.fs().free_reg;

        // iterator function, invariant state, control variable
        self.exp_list(Some(3))?;
        self.fs_mut().declare_local("(for generator)");
        self.fs_mut().declare_local("(for state)");
        self.fs_mut().declare_local("(for control)");
        let num_vars = vars.len() as u8;
        self.reserve(num_vars)?;
        for v in &vars {
            let name = v.clone();
            self.fs_mut().declare_local(&name);
        }

        let prep = self.emit(Op::Jump { offset: 0 });
        let body_start = self.fs().builder.here();
        self.expect(TokenKind::Do, "'do'")?;
        self.fs_mut().loops.push(LoopCtx::default());
        self.scoped_block()?;
        self.expect(TokenKind::End, "'end'")?;
        if self.loop_vars_captured(base + 3) {
            self.emit(Op::CloseUpvalues { from_reg: base + 3 });
        }
        self.patch_here(prep)?;
        self.emit(Op::TForCall { base, num_vars });
        let lp = self.emit(Op::TForLoop { base, offset: 0 });
        self.fs_mut().builder.patch_jump(lp, body_start)?;
        self.finish_loop()?;
        let line = self.line();
        self.fs_mut().leave_scope(line);
        Ok(())
    }

    /// Whether any loop variable at or above `reg` was captured by a closure
    /// inside the body. Such a variable needs a fresh cell every iteration,
    /// so the loop closes it before taking the back edge.
    fn loop_vars_captured(&self, reg: u8) -> bool {
        self.fs().locals.iter().any(|l| l.reg >= reg && l.captured)
    }

    /// Patches every pending `break` of the innermost loop to jump here.
    fn finish_loop(&mut self) -> Result<(), LuaError> {
        let ctx = match self.fs_mut().loops.pop() {
            Some(c) => c,
            None => return Err(LuaError::Internal("loop stack underflow".into())),
        };
        for pc in ctx.breaks {
            self.patch_here(pc)?;
        }
        Ok(())
    }

    fn break_stmt(&mut self) -> Result<(), LuaError> {
        if self.fs().loops.is_empty() {
            return Err(self.syntax_error("'break' outside a loop"));
        }
        self.advance();
        let pc = self.emit(Op::Jump { offset: 0 });
        let i = self.fs.len() - 1;
        if let Some(ctx) = self.fs[i].loops.last_mut() {
            ctx.breaks.push(pc);
        }
        Ok(())
    }

    fn goto_stmt(&mut self) -> Result<(), LuaError> {
        self.advance();
        let line = self.line();
        let name = self.expect_name()?;
        let target = self.fs().labels.iter().find(|l| l.name == name).map(|l| l.pc);
        let pc = self.emit(Op::Jump { offset: 0 });
        match target {
            Some(dest) => self.fs_mut().builder.patch_jump(pc, dest),
            None => {
                self.fs_mut().gotos.push(PendingGoto { name, pc, line });
                Ok(())
            }
        }
    }

    fn label_stmt(&mut self) -> Result<(), LuaError> {
        self.advance();
        let name = self.expect_name()?;
        self.expect(TokenKind::DoubleColon, "'::'")?;
        if self.fs().labels.iter().any(|l| l.name == name) {
            return Err(self.syntax_error(format!("label '{name}' already defined")));
        }
        let pc = self.fs().builder.here();
        self.fs_mut().labels.push(crate::func_state::Label { name: name.clone(), pc });
        // resolve forward gotos aimed at this label
        let pending: Vec<usize> = {
            let fs = self.fs_mut();
            let (matched, rest): (Vec<_>, Vec<_>) =
                fs.gotos.drain(..).partition(|g| g.name == name);
            fs.gotos = rest;
            matched.into_iter().map(|g| g.pc).collect()
        };
        for jpc in pending {
            self.fs_mut().builder.patch_jump(jpc, pc)?;
        }
        Ok(())
    }

    fn resolve_pending_gotos(&mut self) -> Result<(), LuaError> {
        if let Some(g) = self.fs().gotos.first() {
            return Err(LuaError::Syntax {
                chunk: self.chunk.clone(),
                line: g.line,
                message: format!("no visible label '{}' for goto", g.name),
            });
        }
        Ok(())
    }

    fn local_stmt(&mut self) -> Result<(), LuaError> {
        self.advance();
        if self.accept(&TokenKind::Function) {
            let line = self.line();
            let name = self.expect_name()?;
            // declare first so the body can call itself
            let reg = self.reserve(1)?;
            self.fs_mut().declare_local(&name);
            let f = self.func_body(false, line)?;
            self.emit(Op::Move { dst: reg, src: f });
            return Ok(());
        }

        let mut names = vec![self.expect_name()?];
        while self.accept(&TokenKind::Comma) {
            names.push(self.expect_name()?);
        }
        let want = names.len() as u8;
        if self.accept(&TokenKind::Assign) {
            self.exp_list(Some(want))?;
        } else {
            for _ in 0..want {
                let dst = self.reserve(1)?;
                self.emit(Op::LoadNil { dst });
            }
        }
        for name in &names {
            let n = name.clone();
            self.fs_mut().declare_local(&n);
        }
        Ok(())
    }

    fn func_stmt(&mut self) -> Result<(), LuaError> {
        self.advance();
        let line = self.line();
        let name = self.expect_name()?;
        let mut cur = self.single_name(&name)?;
        let mut is_method = false;

        loop {
            match self.peek_kind() {
                TokenKind::Dot => {
                    self.advance();
                    let field = self.expect_name()?;
                    let table = self.to_reg_for_index(cur)?;
                    let name_idx = self.add_name(&field)?;
                    if matches!(self.peek_kind(), TokenKind::Dot | TokenKind::Colon) {
                        let reg = self.load_field(table, name_idx)?;
                        cur = Suffixed::Value { reg, multi: None };
                    } else {
                        cur = Suffixed::Field { table, name_idx };
                        break;
                    }
                }
                TokenKind::Colon => {
                    self.advance();
                    let field = self.expect_name()?;
                    let table = self.to_reg_for_index(cur)?;
                    let name_idx = self.add_name(&field)?;
                    cur = Suffixed::Field { table, name_idx };
                    is_method = true;
                    break;
                }
                _ => break,
            }
        }

        let f = self.func_body(is_method, line)?;
        self.store(&cur, f)
    }

    /// Compiles a function body (from `(` onward) in a fresh [`FuncState`];
    /// leaves the resulting closure in a new register of the enclosing
    /// function.
    fn func_body(&mut self, is_method: bool, line: u32) -> Result<u8, LuaError> {
        let mut fs = FuncState::new(&self.chunk);
        fs.builder.line_defined = line;
        self.fs.push(fs);
        self.fs_mut().enter_scope();

        if is_method {
            self.reserve(1)?;
            self.fs_mut().declare_local("self");
            self.fs_mut().builder.param_count = 1;
        }
        self.expect(TokenKind::LParen, "'('")?;
        if !self.check(&TokenKind::RParen) {
            loop {
                match self.peek_kind().clone() {
                    TokenKind::Name(param) => {
                        self.advance();
                        self.reserve(1)?;
                        self.fs_mut().declare_local(&param);
                        self.fs_mut().builder.param_count += 1;
                    }
                    TokenKind::Ellipsis => {
                        self.advance();
                        self.fs_mut().builder.is_vararg = true;
                        break;
                    }
                    _ => return Err(self.syntax_error("<name> expected")),
                }
                if !self.accept(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen, "')'")?;

        self.block()?;
        let end_line = self.line();
        self.expect(TokenKind::End, "'end'")?;
        let fs = self.fs_mut();
        fs.builder.last_line_defined = end_line;
        fs.builder.emit(Op::Return { src: 0, count: 0 }, end_line);
        fs.leave_scope_quiet();
        self.resolve_pending_gotos()?;

        let done = match self.fs.pop() {
            Some(fs) => fs,
            None => return Err(LuaError::Internal("function stack underflow".into())),
        };
        let proto = Arc::new(done.builder.finish());
        let proto_idx = self.fs_mut().builder.add_proto(proto)?;
        let dst = self.reserve(1)?;
        self.emit(Op::Closure { dst, proto_idx });
        Ok(dst)
    }

    fn ret_stmt(&mut self) -> Result<(), LuaError> {
        self.advance();
        if matches!(
            self.peek_kind(),
            TokenKind::End
                | TokenKind::Eof
                | TokenKind::Else
                | TokenKind::ElseIf
                | TokenKind::Until
                | TokenKind::Semi
        ) {
            self.emit(Op::Return { src: 0, count: 0 });
            self.accept(&TokenKind::Semi);
            return Ok(());
        }

        let base = self.fs().free_reg;
        let (first, multi) = self.expr_one()?;
        if !self.check(&TokenKind::Comma) {
            match multi {
                // `return f(...)` becomes a tail call that reuses this frame
                Some(MultiPc::Call(pc)) => {
                    let rewritten = match *self.fs_mut().builder.op_at_mut(pc) {
                        Op::Call { func, num_args, .. } => Op::TailCall { func, num_args },
                        other => {
                            return Err(LuaError::Internal(format!(
                                "expected call at {pc}, found {other:?}"
                            )))
                        }
                    };
                    *self.fs_mut().builder.op_at_mut(pc) = rewritten;
                    self.emit(Op::Return { src: 0, count: 0 });
                }
                Some(MultiPc::Vararg(pc)) => {
                    self.patch_multi(MultiPc::Vararg(pc), MULTI)?;
                    self.emit(Op::Return {
                        src: base,
                        count: MULTI,
                    });
                }
                None => {
                    self.emit(Op::Return {
                        src: first,
                        count: 1,
                    });
                }
            }
            self.accept(&TokenKind::Semi);
            return Ok(());
        }

        let mut count: u8 = 1;
        let mut last = multi;
        while self.accept(&TokenKind::Comma) {
            let (_, m) = self.expr_one()?;
            count += 1;
            last = m;
        }
        match last {
            Some(m) => {
                self.patch_multi(m, MULTI)?;
                self.emit(Op::Return {
                    src: base,
                    count: MULTI,
                });
            }
            None => {
                self.emit(Op::Return { src: base, count });
            }
        }
        self.accept(&TokenKind::Semi);
        Ok(())
    }

    fn expr_stmt(&mut self) -> Result<(), LuaError> {
        let first = self.suffixed_expr()?;
        if matches!(self.peek_kind(), TokenKind::Assign | TokenKind::Comma) {
            let mut targets = vec![self.into_target(first)?];
            while self.accept(&TokenKind::Comma) {
                let t = self.suffixed_expr()?;
                targets.push(self.into_target(t)?);
            }
            self.expect(TokenKind::Assign, "'='")?;
            let (base, _) = self.exp_list(Some(targets.len() as u8))?;
            for (i, target) in targets.iter().enumerate() {
                self.store(target, base + i as u8)?;
            }
            return Ok(());
        }
        match first {
            Suffixed::Value {
                multi: Some(MultiPc::Call(pc)),
                ..
            } => {
                // a bare call discards its results
                if let Op::Call { num_results, .. } = self.fs_mut().builder.op_at_mut(pc) {
                    *num_results = 0;
                }
                Ok(())
            }
            _ => Err(self.syntax_error("syntax error")),
        }
    }

    fn into_target(&mut self, s: Suffixed) -> Result<Suffixed, LuaError> {
        match s {
            Suffixed::Local(_)
            | Suffixed::Upval(_)
            | Suffixed::Global(_)
            | Suffixed::Index { .. }
            | Suffixed::Field { .. } => Ok(s),
            Suffixed::Value { .. } => Err(self.syntax_error("syntax error")),
        }
    }

    fn store(&mut self, target: &Suffixed, src: u8) -> Result<(), LuaError> {
        match *target {
            Suffixed::Local(dst) => {
                self.emit(Op::Move { dst, src });
            }
            Suffixed::Upval(upval_idx) => {
                self.emit(Op::SetUpvalue { src, upval_idx });
            }
            Suffixed::Global(name_idx) => {
                self.emit(Op::SetGlobal { src, name_idx });
            }
            Suffixed::Index { table, key } => {
                self.emit(Op::SetTable {
                    table,
                    key,
                    val: src,
                });
            }
            Suffixed::Field { table, name_idx } => {
                self.emit(Op::SetField {
                    table,
                    name_idx,
                    val: src,
                });
            }
            Suffixed::Value { .. } => {
                return Err(LuaError::Internal("store into non-target".into()))
            }
        }
        Ok(())
    }

    // ── expressions ──────────────────────────────────────────────────────

    /// One value in a fresh register at the top of the expression stack.
    fn expr_one(&mut self) -> Result<(u8, Option<MultiPc>), LuaError> {
        self.sub_expr(0)
    }

    fn sub_expr(&mut self, limit: u8) -> Result<(u8, Option<MultiPc>), LuaError> {
        let (mut reg, mut multi) = match self.peek_kind() {
            TokenKind::Not => {
                self.advance();
                let (src, _) = self.sub_expr(UNARY_PRIORITY)?;
                self.emit(Op::Not { dst: src, src });
                (src, None)
            }
            TokenKind::Hash => {
                self.advance();
                let (src, _) = self.sub_expr(UNARY_PRIORITY)?;
                self.emit(Op::Len { dst: src, src });
                (src, None)
            }
            TokenKind::Minus => {
                self.advance();
                // fold negation of a numeric literal, except before `^`
                // (which binds tighter than unary minus)
                let next_is_caret = *self.peek_kind_at(1) == TokenKind::Caret;
                match self.peek_kind().clone() {
                    TokenKind::Int(n) if !next_is_caret => {
                        self.advance();
                        let idx = self.add_constant(Value::Integer(n.wrapping_neg()))?;
                        let dst = self.reserve(1)?;
                        self.emit(Op::LoadConst {
                            dst,
                            const_idx: idx,
                        });
                        (dst, None)
                    }
                    TokenKind::Float(f) if !next_is_caret => {
                        self.advance();
                        let idx = self.add_constant(Value::Float(-f))?;
                        let dst = self.reserve(1)?;
                        self.emit(Op::LoadConst {
                            dst,
                            const_idx: idx,
                        });
                        (dst, None)
                    }
                    _ => {
                        let (src, _) = self.sub_expr(UNARY_PRIORITY)?;
                        self.emit(Op::Unm { dst: src, src });
                        (src, None)
                    }
                }
            }
            _ => self.simple_expr()?,
        };

        while let Some((op, left, right)) = bin_priority(self.peek_kind()) {
            if left <= limit {
                break;
            }
            self.advance();
            multi = None;
            match op {
                BinOp::And => {
                    let j = self.emit(Op::JumpIfFalse {
                        src: reg,
                        offset: 0,
                    });
                    self.fs_mut().free_to(reg);
                    let (rhs, _) = self.sub_expr(right)?;
                    if rhs != reg {
                        self.emit(Op::Move { dst: reg, src: rhs });
                        self.fs_mut().free_to(reg + 1);
                    }
                    self.patch_here(j)?;
                }
                BinOp::Or => {
                    let j = self.emit(Op::JumpIfTrue {
                        src: reg,
                        offset: 0,
                    });
                    self.fs_mut().free_to(reg);
                    let (rhs, _) = self.sub_expr(right)?;
                    if rhs != reg {
                        self.emit(Op::Move { dst: reg, src: rhs });
                        self.fs_mut().free_to(reg + 1);
                    }
                    self.patch_here(j)?;
                }
                _ => {
                    let (rhs, _) = self.sub_expr(right)?;
                    self.emit_binary(op, reg, rhs);
                    self.fs_mut().free_to(reg + 1);
                }
            }
        }
        Ok((reg, multi))
    }

    fn emit_binary(&mut self, op: BinOp, lhs: u8, rhs: u8) {
        let dst = lhs;
        match op {
            BinOp::Add => self.emit(Op::Add { dst, lhs, rhs }),
            BinOp::Sub => self.emit(Op::Sub { dst, lhs, rhs }),
            BinOp::Mul => self.emit(Op::Mul { dst, lhs, rhs }),
            BinOp::Div => self.emit(Op::Div { dst, lhs, rhs }),
            BinOp::IDiv => self.emit(Op::IDiv { dst, lhs, rhs }),
            BinOp::Mod => self.emit(Op::Mod { dst, lhs, rhs }),
            BinOp::Pow => self.emit(Op::Pow { dst, lhs, rhs }),
            BinOp::Concat => self.emit(Op::Concat { dst, lhs, rhs }),
            BinOp::Eq => self.emit(Op::Eq { dst, lhs, rhs }),
            BinOp::Lt => self.emit(Op::Lt { dst, lhs, rhs }),
            BinOp::Le => self.emit(Op::Le { dst, lhs, rhs }),
            // swapped-operand forms
            BinOp::Gt => self.emit(Op::Lt {
                dst,
                lhs: rhs,
                rhs: lhs,
            }),
            BinOp::Ge => self.emit(Op::Le {
                dst,
                lhs: rhs,
                rhs: lhs,
            }),
            BinOp::Ne => {
                self.emit(Op::Eq { dst, lhs, rhs });
                self.emit(Op::Not { dst, src: dst })
            }
            BinOp::And | BinOp::Or => unreachable!("handled via jumps"),
        };
    }

    fn simple_expr(&mut self) -> Result<(u8, Option<MultiPc>), LuaError> {
        match self.peek_kind().clone() {
            TokenKind::Nil => {
                self.advance();
                let dst = self.reserve(1)?;
                self.emit(Op::LoadNil { dst });
                Ok((dst, None))
            }
            TokenKind::True | TokenKind::False => {
                let value = self.accept(&TokenKind::True);
                if !value {
                    self.advance();
                }
                let dst = self.reserve(1)?;
                self.emit(Op::LoadBool {
                    dst,
                    value,
                    skip: false,
                });
                Ok((dst, None))
            }
            TokenKind::Int(n) => {
                self.advance();
                let idx = self.add_constant(Value::Integer(n))?;
                let dst = self.reserve(1)?;
                self.emit(Op::LoadConst {
                    dst,
                    const_idx: idx,
                });
                Ok((dst, None))
            }
            TokenKind::Float(f) => {
                self.advance();
                let idx = self.add_constant(Value::Float(f))?;
                let dst = self.reserve(1)?;
                self.emit(Op::LoadConst {
                    dst,
                    const_idx: idx,
                });
                Ok((dst, None))
            }
            TokenKind::Str(s) => {
                self.advance();
                let idx = self.add_constant(Value::Str(s))?;
                let dst = self.reserve(1)?;
                self.emit(Op::LoadConst {
                    dst,
                    const_idx: idx,
                });
                Ok((dst, None))
            }
            TokenKind::Ellipsis => {
                if !self.fs().builder.is_vararg {
                    return Err(self.syntax_error("cannot use '...' outside a vararg function"));
                }
                self.advance();
                let dst = self.reserve(1)?;
                let pc = self.emit(Op::VarArg { dst, count: 1 });
                Ok((dst, Some(MultiPc::Vararg(pc))))
            }
            TokenKind::Function => {
                let line = self.line();
                self.advance();
                let reg = self.func_body(false, line)?;
                Ok((reg, None))
            }
            TokenKind::LBrace => {
                let reg = self.table_ctor()?;
                Ok((reg, None))
            }
            _ => {
                let s = self.suffixed_expr()?;
                self.discharge(s)
            }
        }
    }

    fn primary_expr(&mut self) -> Result<Suffixed, LuaError> {
        match self.peek_kind().clone() {
            TokenKind::Name(name) => {
                self.advance();
                self.single_name(&name)
            }
            TokenKind::LParen => {
                self.advance();
                // parentheses truncate a multi-value expression to one value
                let (reg, _) = self.expr_one()?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(Suffixed::Value { reg, multi: None })
            }
            _ => Err(self.syntax_error("unexpected symbol")),
        }
    }

    fn suffixed_expr(&mut self) -> Result<Suffixed, LuaError> {
        let mut cur = self.primary_expr()?;
        loop {
            match self.peek_kind() {
                TokenKind::Dot => {
                    self.advance();
                    let name = self.expect_name()?;
                    let table = self.to_reg_for_index(cur)?;
                    let name_idx = self.add_name(&name)?;
                    cur = Suffixed::Field { table, name_idx };
                }
                TokenKind::LBracket => {
                    let table = self.to_reg_for_index(cur)?;
                    self.advance();
                    let (key, _) = self.expr_one()?;
                    self.expect(TokenKind::RBracket, "']'")?;
                    cur = Suffixed::Index { table, key };
                }
                TokenKind::Colon => {
                    self.advance();
                    let name = self.expect_name()?;
                    cur = self.method_call(cur, &name)?;
                }
                TokenKind::LParen | TokenKind::Str(_) | TokenKind::LBrace => {
                    cur = self.call_expr(cur)?;
                }
                _ => return Ok(cur),
            }
        }
    }

    /// Compiles `obj:name(args)`: one `Method` instruction materializes the
    /// function and the receiver in adjacent registers, then a regular call.
    fn method_call(&mut self, obj: Suffixed, name: &str) -> Result<Suffixed, LuaError> {
        let name_idx = self.add_name(name)?;
        let obj_reg = self.to_reg_for_index(obj)?;
        let dst = if self.is_temp(obj_reg) {
            // receiver already sits on top; reuse its slot and reserve one
            // more for `self`
            self.reserve(1)?;
            obj_reg
        } else {
            self.reserve(2)?
        };
        self.emit(Op::Method {
            dst,
            obj: obj_reg,
            name_idx,
        });
        let num_args = self.call_args(dst, 1)?;
        let pc = self.emit(Op::Call {
            func: dst,
            num_args,
            num_results: 1,
        });
        self.fs_mut().free_to(dst + 1);
        Ok(Suffixed::Value {
            reg: dst,
            multi: Some(MultiPc::Call(pc)),
        })
    }

    fn call_expr(&mut self, func: Suffixed) -> Result<Suffixed, LuaError> {
        let (f, _) = self.discharge(func)?;
        let num_args = self.call_args(f, 0)?;
        let pc = self.emit(Op::Call {
            func: f,
            num_args,
            num_results: 1,
        });
        self.fs_mut().free_to(f + 1);
        Ok(Suffixed::Value {
            reg: f,
            multi: Some(MultiPc::Call(pc)),
        })
    }

    /// Parses call arguments (`(explist)`, a string literal, or a table
    /// constructor); returns the argument count including `implicit` leading
    /// arguments already in place (the receiver of a method call).
    fn call_args(&mut self, _func: u8, implicit: u8) -> Result<u8, LuaError> {
        match self.peek_kind().clone() {
            TokenKind::LParen => {
                self.advance();
                if self.accept(&TokenKind::RParen) {
                    return Ok(implicit);
                }
                let (_, count) = self.exp_list(None)?;
                self.expect(TokenKind::RParen, "')'")?;
                if count == MULTI {
                    Ok(MULTI)
                } else {
                    Ok(implicit + count)
                }
            }
            TokenKind::Str(s) => {
                self.advance();
                let idx = self.add_constant(Value::Str(s))?;
                let dst = self.reserve(1)?;
                self.emit(Op::LoadConst {
                    dst,
                    const_idx: idx,
                });
                Ok(implicit + 1)
            }
            TokenKind::LBrace => {
                self.table_ctor()?;
                Ok(implicit + 1)
            }
            _ => Err(self.syntax_error("function arguments expected")),
        }
    }

    /// Compiles a comma-separated expression list into consecutive registers
    /// starting at the current stack top.
    ///
    /// With `want = Some(n)` the list is adjusted to exactly `n` values:
    /// a trailing call/vararg is widened, missing values become nil, excess
    /// values are dropped. With `want = None` the natural count is kept and
    /// a trailing call/vararg expands to all its values (`MULTI`).
    fn exp_list(&mut self, want: Option<u8>) -> Result<(u8, u8), LuaError> {
        let base = self.fs().free_reg;
        let mut count: u8 = 0;
        let mut last_multi;
        loop {
            let (_, m) = self.expr_one()?;
            count += 1;
            last_multi = m;
            if !self.accept(&TokenKind::Comma) {
                break;
            }
        }
        match want {
            Some(w) => {
                if count < w {
                    match last_multi {
                        Some(m) => {
                            self.patch_multi(m, w - count + 1)?;
                            self.reserve(w - count)?;
                        }
                        None => {
                            for _ in count..w {
                                let dst = self.reserve(1)?;
                                self.emit(Op::LoadNil { dst });
                            }
                        }
                    }
                } else if count > w {
                    self.fs_mut().free_to(base + w);
                }
                Ok((base, w))
            }
            None => match last_multi {
                Some(m) => {
                    self.patch_multi(m, MULTI)?;
                    Ok((base, MULTI))
                }
                None => Ok((base, count)),
            },
        }
    }

    fn patch_multi(&mut self, m: MultiPc, want: u8) -> Result<(), LuaError> {
        match m {
            MultiPc::Call(pc) => match self.fs_mut().builder.op_at_mut(pc) {
                Op::Call { num_results, .. } => {
                    *num_results = want;
                    Ok(())
                }
                other => Err(LuaError::Internal(format!(
                    "expected call at {pc}, found {other:?}"
                ))),
            },
            MultiPc::Vararg(pc) => match self.fs_mut().builder.op_at_mut(pc) {
                Op::VarArg { count, .. } => {
                    *count = want;
                    Ok(())
                }
                other => Err(LuaError::Internal(format!(
                    "expected vararg at {pc}, found {other:?}"
                ))),
            },
        }
    }

    fn table_ctor(&mut self) -> Result<u8, LuaError> {
        self.expect(TokenKind::LBrace, "'{'")?;
        let t = self.reserve(1)?;
        self.emit(Op::NewTable { dst: t });
        let items_base = t + 1;
        let mut pending: u8 = 0;
        let mut last_multi: Option<MultiPc> = None;

        loop {
            if self.check(&TokenKind::RBrace) {
                break;
            }
            match self.peek_kind().clone() {
                TokenKind::Name(name) if *self.peek_kind_at(1) == TokenKind::Assign => {
                    self.flush_list(t, items_base, &mut pending)?;
                    self.advance();
                    self.advance();
                    let name_idx = self.add_name(&name)?;
                    let (val, _) = self.expr_one()?;
                    self.emit(Op::SetField {
                        table: t,
                        name_idx,
                        val,
                    });
                    self.fs_mut().free_to(items_base);
                }
                TokenKind::LBracket => {
                    self.flush_list(t, items_base, &mut pending)?;
                    self.advance();
                    let (key, _) = self.expr_one()?;
                    self.expect(TokenKind::RBracket, "']'")?;
                    self.expect(TokenKind::Assign, "'='")?;
                    let (val, _) = self.expr_one()?;
                    self.emit(Op::SetTable { table: t, key, val });
                    self.fs_mut().free_to(items_base);
                }
                _ => {
                    // bound the register window for long literal lists
                    if pending >= 50 {
                        self.flush_list(t, items_base, &mut pending)?;
                    }
                    let (_, m) = self.expr_one()?;
                    pending += 1;
                    last_multi = m;
                }
            }
            if self.accept(&TokenKind::Comma) || self.accept(&TokenKind::Semi) {
                last_multi = None;
                continue;
            }
            break;
        }
        self.expect(TokenKind::RBrace, "'}'")?;

        if pending > 0 {
            match last_multi {
                Some(m) => {
                    self.patch_multi(m, MULTI)?;
                    self.emit(Op::SetList {
                        table: t,
                        src: items_base,
                        count: MULTI,
                    });
                }
                None => {
                    self.emit(Op::SetList {
                        table: t,
                        src: items_base,
                        count: pending,
                    });
                }
            }
        }
        self.fs_mut().free_to(t + 1);
        Ok(t)
    }

    fn flush_list(&mut self, table: u8, items_base: u8, pending: &mut u8) -> Result<(), LuaError> {
        if *pending > 0 {
            self.emit(Op::SetList {
                table,
                src: items_base,
                count: *pending,
            });
            *pending = 0;
        }
        self.fs_mut().free_to(items_base);
        Ok(())
    }

    // ── name resolution ──────────────────────────────────────────────────

    fn single_name(&mut self, name: &str) -> Result<Suffixed, LuaError> {
        let level = self.fs.len() - 1;
        if let Some(slot) = self.fs[level].resolve_local(name) {
            return Ok(Suffixed::Local(slot.reg));
        }
        if let Some(idx) = self.resolve_upvalue(level, name)? {
            return Ok(Suffixed::Upval(idx));
        }
        Ok(Suffixed::Global(self.add_name(name)?))
    }

    /// Captures `name` as an upvalue of the function at `level`, threading
    /// the capture through every function literal between the defining scope
    /// and the use site. Returns the upvalue index at `level`.
    fn resolve_upvalue(&mut self, level: usize, name: &str) -> Result<Option<u8>, LuaError> {
        if let Some(i) = self.fs[level]
            .builder
            .upvals()
            .iter()
            .position(|d| upval_name(d) == name)
        {
            return Ok(Some(i as u8));
        }
        if level == 0 {
            return Ok(None);
        }

        let mut parent_local = None;
        if let Some(slot) = self.fs[level - 1].resolve_local_mut(name) {
            slot.captured = true;
            parent_local = Some(slot.reg);
        }
        if let Some(reg) = parent_local {
            let idx = self.fs[level].builder.add_upval(UpvalDesc::Local {
                index: reg,
                name: name.to_string(),
            })?;
            return Ok(Some(idx));
        }

        match self.resolve_upvalue(level - 1, name)? {
            Some(parent_idx) => {
                let idx = self.fs[level].builder.add_upval(UpvalDesc::Upval {
                    index: parent_idx,
                    name: name.to_string(),
                })?;
                Ok(Some(idx))
            }
            None => Ok(None),
        }
    }

    // ── register discharge helpers ───────────────────────────────────────

    /// Loads a suffixed expression into a register at the stack top.
    fn discharge(&mut self, s: Suffixed) -> Result<(u8, Option<MultiPc>), LuaError> {
        match s {
            Suffixed::Value { reg, multi } => Ok((reg, multi)),
            Suffixed::Local(src) => {
                let dst = self.reserve(1)?;
                self.emit(Op::Move { dst, src });
                Ok((dst, None))
            }
            Suffixed::Upval(upval_idx) => {
                let dst = self.reserve(1)?;
                self.emit(Op::GetUpvalue { dst, upval_idx });
                Ok((dst, None))
            }
            Suffixed::Global(name_idx) => {
                let dst = self.reserve(1)?;
                self.emit(Op::GetGlobal { dst, name_idx });
                Ok((dst, None))
            }
            Suffixed::Index { table, key } => {
                let dst = if self.is_temp(table) {
                    table
                } else if self.is_temp(key) {
                    key
                } else {
                    self.reserve(1)?
                };
                self.emit(Op::GetTable { dst, table, key });
                self.fs_mut().free_to(dst + 1);
                Ok((dst, None))
            }
            Suffixed::Field { table, name_idx } => {
                let dst = self.load_field(table, name_idx)?;
                Ok((dst, None))
            }
        }
    }

    fn load_field(&mut self, table: u8, name_idx: u16) -> Result<u8, LuaError> {
        let dst = if self.is_temp(table) {
            table
        } else {
            self.reserve(1)?
        };
        self.emit(Op::GetField {
            dst,
            table,
            name_idx,
        });
        self.fs_mut().free_to(dst + 1);
        Ok(dst)
    }

    /// A register usable as a table/receiver operand: locals are used in
    /// place, everything else is loaded onto the stack.
    fn to_reg_for_index(&mut self, s: Suffixed) -> Result<u8, LuaError> {
        match s {
            Suffixed::Local(reg) => Ok(reg),
            other => Ok(self.discharge(other)?.0),
        }
    }
}

fn upval_name(d: &UpvalDesc) -> &str {
    match d {
        UpvalDesc::Local { name, .. } | UpvalDesc::Upval { name, .. } => name,
    }
}
