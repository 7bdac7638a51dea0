use luma_core::{LocalVar, LuaError, Op};

use crate::chunk::ProtoBuilder;

/// Registers above this are reserved for internal shuffling.
const MAX_REGS: u8 = 250;

/// One declared local variable of the function under compilation.
/// Locals occupy registers `0..locals.len()` in declaration order.
#[derive(Debug)]
pub struct LocalSlot {
    pub name: String,
    pub reg: u8,
    pub captured: bool,
    pub start_pc: u32,
}

/// A lexical block: remembers how many locals were live when it opened.
#[derive(Debug)]
pub struct Scope {
    pub first_local: usize,
}

/// An open loop, collecting `break` jumps to patch at loop exit.
#[derive(Debug, Default)]
pub struct LoopCtx {
    pub breaks: Vec<usize>,
}

#[derive(Debug)]
pub struct Label {
    pub name: String,
    pub pc: usize,
}

#[derive(Debug)]
pub struct PendingGoto {
    pub name: String,
    pub pc: usize,
    pub line: u32,
}

/// Mutable state for one function while the parser walks its body: the
/// register allocator (free registers above live locals form the expression
/// stack), scope and loop stacks, label bookkeeping, and the prototype under
/// construction.
#[derive(Debug)]
pub struct FuncState {
    pub builder: ProtoBuilder,
    pub free_reg: u8,
    pub locals: Vec<LocalSlot>,
    pub scopes: Vec<Scope>,
    pub loops: Vec<LoopCtx>,
    pub labels: Vec<Label>,
    pub gotos: Vec<PendingGoto>,
}

impl FuncState {
    pub fn new(source: &str) -> FuncState {
        FuncState {
            builder: ProtoBuilder::new(source),
            free_reg: 0,
            locals: Vec::new(),
            scopes: Vec::new(),
            loops: Vec::new(),
            labels: Vec::new(),
            gotos: Vec::new(),
        }
    }

    /// Allocates `n` consecutive registers; returns the first.
    pub fn reserve(&mut self, n: u8, line: u32, chunk: &str) -> Result<u8, LuaError> {
        let first = self.free_reg;
        let top = self.free_reg as usize + n as usize;
        if top > MAX_REGS as usize {
            return Err(LuaError::Syntax {
                chunk: chunk.to_string(),
                line,
                message: "function or expression too complex".into(),
            });
        }
        self.free_reg = top as u8;
        self.builder.note_stack(self.free_reg);
        Ok(first)
    }

    /// Releases every register at or above `reg` back to the expression
    /// stack. Never drops below the live locals.
    pub fn free_to(&mut self, reg: u8) {
        debug_assert!(reg as usize >= self.locals.len());
        self.free_reg = reg;
    }

    /// Register holding the next value above all live locals.
    pub fn active_top(&self) -> u8 {
        self.locals.len() as u8
    }

    /// Binds `name` to an already-reserved register. Locals are declared in
    /// register order, so the new slot is always `locals.len()`.
    pub fn declare_local(&mut self, name: &str) {
        let reg = self.locals.len() as u8;
        self.locals.push(LocalSlot {
            name: name.to_string(),
            reg,
            captured: false,
            start_pc: self.builder.here() as u32,
        });
    }

    /// Innermost local with this name, if any.
    pub fn resolve_local(&self, name: &str) -> Option<&LocalSlot> {
        self.locals.iter().rev().find(|l| l.name == name)
    }

    pub fn resolve_local_mut(&mut self, name: &str) -> Option<&mut LocalSlot> {
        self.locals.iter_mut().rev().find(|l| l.name == name)
    }

    pub fn enter_scope(&mut self) {
        self.scopes.push(Scope {
            first_local: self.locals.len(),
        });
    }

    /// Closes the innermost scope: records debug ranges, emits
    /// `CloseUpvalues` if any dying local was captured, and releases the
    /// locals' registers.
    pub fn leave_scope(&mut self, line: u32) {
        let scope = match self.scopes.pop() {
            Some(s) => s,
            None => return,
        };
        let end_pc = self.builder.here() as u32;
        let mut close_from: Option<u8> = None;
        while self.locals.len() > scope.first_local {
            if let Some(slot) = self.locals.pop() {
                if slot.captured {
                    close_from = Some(slot.reg);
                }
                self.builder.add_local_debug(LocalVar {
                    name: slot.name,
                    start_pc: slot.start_pc,
                    end_pc,
                });
            }
        }
        if let Some(from_reg) = close_from {
            self.builder.emit(Op::CloseUpvalues { from_reg }, line);
        }
        self.free_reg = self.locals.len() as u8;
    }

    /// Like [`leave_scope`] but without emitting `CloseUpvalues`; used at
    /// function end, where the VM closes everything when the frame returns.
    pub fn leave_scope_quiet(&mut self) {
        let scope = match self.scopes.pop() {
            Some(s) => s,
            None => return,
        };
        let end_pc = self.builder.here() as u32;
        while self.locals.len() > scope.first_local {
            if let Some(slot) = self.locals.pop() {
                self.builder.add_local_debug(LocalVar {
                    name: slot.name,
                    start_pc: slot.start_pc,
                    end_pc,
                });
            }
        }
        self.free_reg = self.locals.len() as u8;
    }
}
