use std::sync::Arc;

use luma_core::{LocalVar, LuaError, Op, Prototype, UpvalDesc, Value};

/// A compiled top-level chunk, ready to be wrapped in a closure.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub proto: Arc<Prototype>,
}

/// Accumulates one [`Prototype`] while the parser walks a function body.
#[derive(Debug)]
pub struct ProtoBuilder {
    code: Vec<Op>,
    line_info: Vec<u32>,
    constants: Vec<Value>,
    names: Vec<String>,
    protos: Vec<Arc<Prototype>>,
    upvals: Vec<UpvalDesc>,
    locals: Vec<LocalVar>,
    pub param_count: u8,
    pub is_vararg: bool,
    max_stack_size: u8,
    source: String,
    pub line_defined: u32,
    pub last_line_defined: u32,
}

impl ProtoBuilder {
    pub fn new(source: &str) -> ProtoBuilder {
        ProtoBuilder {
            code: Vec::new(),
            line_info: Vec::new(),
            constants: Vec::new(),
            names: Vec::new(),
            protos: Vec::new(),
            upvals: Vec::new(),
            locals: Vec::new(),
            param_count: 0,
            is_vararg: false,
            max_stack_size: 2,
            source: source.to_string(),
            line_defined: 0,
            last_line_defined: 0,
        }
    }

    /// Appends an instruction tagged with its source line; returns its pc.
    pub fn emit(&mut self, op: Op, line: u32) -> usize {
        self.code.push(op);
        self.line_info.push(line);
        self.code.len() - 1
    }

    /// Next instruction address.
    pub fn here(&self) -> usize {
        self.code.len()
    }

    pub fn op_at_mut(&mut self, pc: usize) -> &mut Op {
        &mut self.code[pc]
    }

    /// Records that registers up to `top` (exclusive) are in use.
    pub fn note_stack(&mut self, top: u8) {
        if top > self.max_stack_size {
            self.max_stack_size = top;
        }
    }

    /// Interns a constant, reusing an existing pool slot for an identical
    /// value. Comparison is subtype-exact so `1` and `1.0` keep separate
    /// slots.
    pub fn add_constant(&mut self, value: Value) -> Result<u16, LuaError> {
        let same = |a: &Value, b: &Value| -> bool {
            match (a, b) {
                (Value::Integer(_), Value::Float(_)) | (Value::Float(_), Value::Integer(_)) => {
                    false
                }
                _ => a == b,
            }
        };
        if let Some(i) = self.constants.iter().position(|c| same(c, &value)) {
            return Ok(i as u16);
        }
        if self.constants.len() >= u16::MAX as usize {
            return Err(LuaError::Internal("constant pool overflow".into()));
        }
        self.constants.push(value);
        Ok((self.constants.len() - 1) as u16)
    }

    /// Interns a global/field name.
    pub fn add_name(&mut self, name: &str) -> Result<u16, LuaError> {
        if let Some(i) = self.names.iter().position(|n| n == name) {
            return Ok(i as u16);
        }
        if self.names.len() >= u16::MAX as usize {
            return Err(LuaError::Internal("name pool overflow".into()));
        }
        self.names.push(name.to_string());
        Ok((self.names.len() - 1) as u16)
    }

    pub fn add_proto(&mut self, proto: Arc<Prototype>) -> Result<u16, LuaError> {
        if self.protos.len() >= u16::MAX as usize {
            return Err(LuaError::Internal("nested prototype overflow".into()));
        }
        self.protos.push(proto);
        Ok((self.protos.len() - 1) as u16)
    }

    pub fn upvals(&self) -> &[UpvalDesc] {
        &self.upvals
    }

    pub fn add_upval(&mut self, desc: UpvalDesc) -> Result<u8, LuaError> {
        if self.upvals.len() >= u8::MAX as usize {
            return Err(LuaError::Internal("too many upvalues".into()));
        }
        self.upvals.push(desc);
        Ok((self.upvals.len() - 1) as u8)
    }

    pub fn add_local_debug(&mut self, var: LocalVar) {
        self.locals.push(var);
    }

    /// Points the jump at `pc` to the current instruction address.
    pub fn patch_jump_here(&mut self, pc: usize) -> Result<(), LuaError> {
        let target = self.here();
        self.patch_jump(pc, target)
    }

    pub fn patch_jump(&mut self, pc: usize, target: usize) -> Result<(), LuaError> {
        let offset = target as i64 - (pc as i64 + 1);
        let offset =
            i16::try_from(offset).map_err(|_| LuaError::Internal("jump too long".into()))?;
        match &mut self.code[pc] {
            Op::Jump { offset: o }
            | Op::JumpIfFalse { offset: o, .. }
            | Op::JumpIfTrue { offset: o, .. }
            | Op::ForPrep { offset: o, .. }
            | Op::ForLoop { offset: o, .. }
            | Op::TForLoop { offset: o, .. } => {
                *o = offset;
                Ok(())
            }
            other => Err(LuaError::Internal(format!(
                "patch target {pc} is not a jump: {other:?}"
            ))),
        }
    }

    pub fn finish(self) -> Prototype {
        Prototype {
            code: self.code,
            constants: self.constants,
            names: self.names,
            line_info: self.line_info,
            protos: self.protos,
            upvals: self.upvals,
            locals: self.locals,
            param_count: self.param_count,
            is_vararg: self.is_vararg,
            max_stack_size: self.max_stack_size,
            source: self.source,
            line_defined: self.line_defined,
            last_line_defined: self.last_line_defined,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_are_deduplicated() {
        let mut b = ProtoBuilder::new("test");
        let a = b.add_constant(Value::Integer(7)).unwrap();
        let c = b.add_constant(Value::string("x")).unwrap();
        let d = b.add_constant(Value::Integer(7)).unwrap();
        assert_eq!(a, d);
        assert_ne!(a, c);
    }

    #[test]
    fn int_and_float_constants_stay_separate() {
        let mut b = ProtoBuilder::new("test");
        let i = b.add_constant(Value::Integer(1)).unwrap();
        let f = b.add_constant(Value::Float(1.0)).unwrap();
        assert_ne!(i, f);
    }

    #[test]
    fn jump_patching() {
        let mut b = ProtoBuilder::new("test");
        let j = b.emit(Op::Jump { offset: 0 }, 1);
        b.emit(Op::LoadNil { dst: 0 }, 1);
        b.emit(Op::LoadNil { dst: 1 }, 1);
        b.patch_jump_here(j).unwrap();
        let proto = b.finish();
        assert_eq!(proto.code[j], Op::Jump { offset: 2 });
    }
}
