//! Loader for the binary chunk form. Operand indices are validated against
//! their owning prototype's pools here, so the interpreter never has to.

use std::sync::Arc;

use luma_core::{LocalVar, LuaError, Op, Prototype, UpvalDesc, Value, MULTI};

use crate::chunk::Chunk;
use crate::encode::MAGIC;

pub fn decode_chunk(bytes: &[u8]) -> Result<Chunk, LuaError> {
    if !bytes.starts_with(MAGIC) {
        return Err(bad("missing or unknown chunk header"));
    }
    let mut r = Reader {
        bytes,
        pos: MAGIC.len(),
    };
    let proto = decode_proto(&mut r)?;
    if r.pos != bytes.len() {
        return Err(bad("trailing bytes after chunk"));
    }
    validate(&proto)?;
    Ok(Chunk {
        proto: Arc::new(proto),
    })
}

fn bad(msg: impl Into<String>) -> LuaError {
    LuaError::Internal(format!("bad bytecode: {}", msg.into()))
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn take(&mut self, n: usize) -> Result<&[u8], LuaError> {
        if self.pos + n > self.bytes.len() {
            return Err(bad("unexpected end of input"));
        }
        let s = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8, LuaError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, LuaError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, LuaError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i16(&mut self) -> Result<i16, LuaError> {
        let b = self.take(2)?;
        Ok(i16::from_le_bytes([b[0], b[1]]))
    }

    fn i64(&mut self) -> Result<i64, LuaError> {
        let b = self.take(8)?;
        let mut a = [0u8; 8];
        a.copy_from_slice(b);
        Ok(i64::from_le_bytes(a))
    }

    fn f64(&mut self) -> Result<f64, LuaError> {
        let b = self.take(8)?;
        let mut a = [0u8; 8];
        a.copy_from_slice(b);
        Ok(f64::from_le_bytes(a))
    }

    fn str(&mut self) -> Result<String, LuaError> {
        let len = self.u16()? as usize;
        let b = self.take(len)?;
        String::from_utf8(b.to_vec()).map_err(|_| bad("invalid UTF-8 string"))
    }

    fn bool(&mut self) -> Result<bool, LuaError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(bad("invalid boolean")),
        }
    }
}

fn decode_proto(r: &mut Reader<'_>) -> Result<Prototype, LuaError> {
    let source = r.str()?;
    let line_defined = r.u32()?;
    let last_line_defined = r.u32()?;
    let param_count = r.u8()?;
    let is_vararg = r.bool()?;
    let max_stack_size = r.u8()?;

    let n = r.u16()? as usize;
    let mut constants = Vec::with_capacity(n);
    for _ in 0..n {
        constants.push(match r.u8()? {
            0 => Value::Nil,
            1 => Value::Boolean(r.bool()?),
            2 => Value::Integer(r.i64()?),
            3 => Value::Float(r.f64()?),
            4 => Value::Str(r.str()?),
            _ => return Err(bad("unknown constant tag")),
        });
    }

    let n = r.u16()? as usize;
    let mut names = Vec::with_capacity(n);
    for _ in 0..n {
        names.push(r.str()?);
    }

    let n = r.u8()? as usize;
    let mut upvals = Vec::with_capacity(n);
    for _ in 0..n {
        let tag = r.u8()?;
        let index = r.u8()?;
        let name = r.str()?;
        upvals.push(match tag {
            0 => UpvalDesc::Local { index, name },
            1 => UpvalDesc::Upval { index, name },
            _ => return Err(bad("unknown upvalue tag")),
        });
    }

    let n = r.u16()? as usize;
    let mut locals = Vec::with_capacity(n);
    for _ in 0..n {
        locals.push(LocalVar {
            name: r.str()?,
            start_pc: r.u32()?,
            end_pc: r.u32()?,
        });
    }

    let n = r.u16()? as usize;
    let mut protos = Vec::with_capacity(n);
    for _ in 0..n {
        protos.push(Arc::new(decode_proto(r)?));
    }

    let n = r.u32()? as usize;
    let mut code = Vec::with_capacity(n);
    for _ in 0..n {
        code.push(decode_op(r)?);
    }
    let n = r.u32()? as usize;
    let mut line_info = Vec::with_capacity(n);
    for _ in 0..n {
        line_info.push(r.u32()?);
    }

    Ok(Prototype {
        code,
        constants,
        names,
        line_info,
        protos,
        upvals,
        locals,
        param_count,
        is_vararg,
        max_stack_size,
        source,
        line_defined,
        last_line_defined,
    })
}

fn decode_op(r: &mut Reader<'_>) -> Result<Op, LuaError> {
    let tag = r.u8()?;
    Ok(match tag {
        0 => Op::LoadConst {
            dst: r.u8()?,
            const_idx: r.u16()?,
        },
        1 => Op::LoadNil { dst: r.u8()? },
        2 => Op::LoadBool {
            dst: r.u8()?,
            value: r.bool()?,
            skip: r.bool()?,
        },
        3 => Op::Move {
            dst: r.u8()?,
            src: r.u8()?,
        },
        4 => Op::Add {
            dst: r.u8()?,
            lhs: r.u8()?,
            rhs: r.u8()?,
        },
        5 => Op::Sub {
            dst: r.u8()?,
            lhs: r.u8()?,
            rhs: r.u8()?,
        },
        6 => Op::Mul {
            dst: r.u8()?,
            lhs: r.u8()?,
            rhs: r.u8()?,
        },
        7 => Op::Div {
            dst: r.u8()?,
            lhs: r.u8()?,
            rhs: r.u8()?,
        },
        8 => Op::Mod {
            dst: r.u8()?,
            lhs: r.u8()?,
            rhs: r.u8()?,
        },
        9 => Op::Pow {
            dst: r.u8()?,
            lhs: r.u8()?,
            rhs: r.u8()?,
        },
        10 => Op::IDiv {
            dst: r.u8()?,
            lhs: r.u8()?,
            rhs: r.u8()?,
        },
        11 => Op::Unm {
            dst: r.u8()?,
            src: r.u8()?,
        },
        12 => Op::Eq {
            dst: r.u8()?,
            lhs: r.u8()?,
            rhs: r.u8()?,
        },
        13 => Op::Lt {
            dst: r.u8()?,
            lhs: r.u8()?,
            rhs: r.u8()?,
        },
        14 => Op::Le {
            dst: r.u8()?,
            lhs: r.u8()?,
            rhs: r.u8()?,
        },
        15 => Op::Not {
            dst: r.u8()?,
            src: r.u8()?,
        },
        16 => Op::Jump { offset: r.i16()? },
        17 => Op::JumpIfFalse {
            src: r.u8()?,
            offset: r.i16()?,
        },
        18 => Op::JumpIfTrue {
            src: r.u8()?,
            offset: r.i16()?,
        },
        19 => Op::Concat {
            dst: r.u8()?,
            lhs: r.u8()?,
            rhs: r.u8()?,
        },
        20 => Op::Len {
            dst: r.u8()?,
            src: r.u8()?,
        },
        21 => Op::Call {
            func: r.u8()?,
            num_args: r.u8()?,
            num_results: r.u8()?,
        },
        22 => Op::TailCall {
            func: r.u8()?,
            num_args: r.u8()?,
        },
        23 => Op::Return {
            src: r.u8()?,
            count: r.u8()?,
        },
        24 => Op::VarArg {
            dst: r.u8()?,
            count: r.u8()?,
        },
        25 => Op::Method {
            dst: r.u8()?,
            obj: r.u8()?,
            name_idx: r.u16()?,
        },
        26 => Op::GetGlobal {
            dst: r.u8()?,
            name_idx: r.u16()?,
        },
        27 => Op::SetGlobal {
            src: r.u8()?,
            name_idx: r.u16()?,
        },
        28 => Op::Closure {
            dst: r.u8()?,
            proto_idx: r.u16()?,
        },
        29 => Op::GetUpvalue {
            dst: r.u8()?,
            upval_idx: r.u8()?,
        },
        30 => Op::SetUpvalue {
            src: r.u8()?,
            upval_idx: r.u8()?,
        },
        31 => Op::CloseUpvalues { from_reg: r.u8()? },
        32 => Op::NewTable { dst: r.u8()? },
        33 => Op::GetTable {
            dst: r.u8()?,
            table: r.u8()?,
            key: r.u8()?,
        },
        34 => Op::SetTable {
            table: r.u8()?,
            key: r.u8()?,
            val: r.u8()?,
        },
        35 => Op::GetField {
            dst: r.u8()?,
            table: r.u8()?,
            name_idx: r.u16()?,
        },
        36 => Op::SetField {
            table: r.u8()?,
            name_idx: r.u16()?,
            val: r.u8()?,
        },
        37 => Op::SetList {
            table: r.u8()?,
            src: r.u8()?,
            count: r.u8()?,
        },
        38 => Op::ForPrep {
            base: r.u8()?,
            offset: r.i16()?,
        },
        39 => Op::ForLoop {
            base: r.u8()?,
            offset: r.i16()?,
        },
        40 => Op::TForCall {
            base: r.u8()?,
            num_vars: r.u8()?,
        },
        41 => Op::TForLoop {
            base: r.u8()?,
            offset: r.i16()?,
        },
        _ => return Err(bad(format!("unknown opcode tag {tag}"))),
    })
}

/// The highest register an instruction touches, or `None` for ops that name
/// no registers. [`MULTI`] counts reach only their base slot; the interpreter
/// grows the stack for the variable stretch itself.
fn highest_register(op: &Op) -> Option<usize> {
    // first..first+count-1, where count MULTI (or 0) means just the base
    fn counted(first: u8, count: u8) -> usize {
        if count == MULTI || count == 0 {
            first as usize
        } else {
            first as usize + count as usize - 1
        }
    }
    Some(match *op {
        Op::LoadConst { dst, .. }
        | Op::LoadNil { dst }
        | Op::LoadBool { dst, .. }
        | Op::NewTable { dst }
        | Op::GetGlobal { dst, .. }
        | Op::Closure { dst, .. }
        | Op::GetUpvalue { dst, .. } => dst as usize,
        Op::Move { dst, src }
        | Op::Unm { dst, src }
        | Op::Not { dst, src }
        | Op::Len { dst, src } => (dst as usize).max(src as usize),
        Op::Add { dst, lhs, rhs }
        | Op::Sub { dst, lhs, rhs }
        | Op::Mul { dst, lhs, rhs }
        | Op::Div { dst, lhs, rhs }
        | Op::Mod { dst, lhs, rhs }
        | Op::Pow { dst, lhs, rhs }
        | Op::IDiv { dst, lhs, rhs }
        | Op::Eq { dst, lhs, rhs }
        | Op::Lt { dst, lhs, rhs }
        | Op::Le { dst, lhs, rhs }
        | Op::Concat { dst, lhs, rhs } => (dst as usize).max(lhs as usize).max(rhs as usize),
        Op::GetTable { dst, table, key } => (dst as usize).max(table as usize).max(key as usize),
        Op::SetTable { table, key, val } => (table as usize).max(key as usize).max(val as usize),
        Op::GetField { dst, table, .. } => (dst as usize).max(table as usize),
        Op::SetField { table, val, .. } => (table as usize).max(val as usize),
        Op::SetGlobal { src, .. }
        | Op::SetUpvalue { src, .. }
        | Op::JumpIfFalse { src, .. }
        | Op::JumpIfTrue { src, .. } => src as usize,
        Op::CloseUpvalues { from_reg } => from_reg as usize,
        Op::Method { dst, obj, .. } => (dst as usize + 1).max(obj as usize),
        Op::Call {
            func,
            num_args,
            num_results,
        } => counted(func, num_args.saturating_add(1)).max(counted(func, num_results)),
        Op::TailCall { func, num_args } => counted(func, num_args.saturating_add(1)),
        // a zero-count return reads nothing; the src operand is inert
        Op::Return { count: 0, .. } => return None,
        Op::Return { src, count } => counted(src, count),
        Op::VarArg { dst, count } => counted(dst, count),
        Op::SetList { table, src, count } => (table as usize).max(counted(src, count)),
        Op::ForPrep { base, .. } | Op::ForLoop { base, .. } | Op::TForLoop { base, .. } => {
            base as usize + 3
        }
        Op::TForCall { base, num_vars } => base as usize + 2 + (num_vars.max(1) as usize),
        Op::Jump { .. } => return None,
    })
}

/// Checks that every pool index and register in the code is in range,
/// recursively.
fn validate(proto: &Prototype) -> Result<(), LuaError> {
    let n_const = proto.constants.len();
    let n_names = proto.names.len();
    let n_protos = proto.protos.len();
    let n_upvals = proto.upvals.len();

    for op in &proto.code {
        let ok = match *op {
            Op::LoadConst { const_idx, .. } => (const_idx as usize) < n_const,
            Op::GetGlobal { name_idx, .. }
            | Op::SetGlobal { name_idx, .. }
            | Op::GetField { name_idx, .. }
            | Op::SetField { name_idx, .. }
            | Op::Method { name_idx, .. } => (name_idx as usize) < n_names,
            Op::Closure { proto_idx, .. } => (proto_idx as usize) < n_protos,
            Op::GetUpvalue { upval_idx, .. } | Op::SetUpvalue { upval_idx, .. } => {
                (upval_idx as usize) < n_upvals
            }
            _ => true,
        };
        if !ok {
            return Err(bad(format!("operand out of range in {op:?}")));
        }
        if let Some(top) = highest_register(op) {
            if top >= proto.max_stack_size as usize {
                return Err(bad(format!("register out of range in {op:?}")));
            }
        }
    }
    if proto.line_info.len() != proto.code.len() {
        return Err(bad("line info length mismatch"));
    }
    for p in &proto.protos {
        validate(p)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode_chunk;

    #[test]
    fn out_of_range_constant_is_rejected() {
        // hand-built prototype referencing a constant that does not exist
        let proto = Prototype {
            code: vec![
                Op::LoadConst {
                    dst: 0,
                    const_idx: 5,
                },
                Op::Return { src: 0, count: 0 },
            ],
            line_info: vec![1, 1],
            source: "bad.lua".into(),
            max_stack_size: 2,
            ..Default::default()
        };
        let chunk = Chunk {
            proto: Arc::new(proto),
        };
        let bytes = encode_chunk(&chunk).unwrap();
        let err = decode_chunk(&bytes).unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn out_of_range_register_is_rejected() {
        // register 200 with a declared stack of 2 must not reach the
        // interpreter
        let proto = Prototype {
            code: vec![Op::LoadNil { dst: 200 }, Op::Return { src: 0, count: 0 }],
            line_info: vec![1, 1],
            source: "bad.lua".into(),
            max_stack_size: 2,
            ..Default::default()
        };
        let chunk = Chunk {
            proto: Arc::new(proto),
        };
        let bytes = encode_chunk(&chunk).unwrap();
        let err = decode_chunk(&bytes).unwrap_err();
        assert!(err.to_string().contains("register out of range"));
    }

    #[test]
    fn header_is_required() {
        assert!(decode_chunk(b"").is_err());
        assert!(decode_chunk(b"\x1bLua").is_err());
    }
}
