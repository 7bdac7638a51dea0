//! Binary persisted form of a compiled chunk: a magic header followed by
//! the root prototype, encoded recursively field-for-field.

use luma_core::{LuaError, Op, Prototype, UpvalDesc, Value};

use crate::chunk::Chunk;

/// Header identifying a precompiled chunk (and its format version).
pub const MAGIC: &[u8] = b"\x1bLuma\x01";

pub fn encode_chunk(chunk: &Chunk) -> Result<Vec<u8>, LuaError> {
    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);
    encode_proto(&chunk.proto, &mut out)?;
    Ok(out)
}

fn w_u8(out: &mut Vec<u8>, v: u8) {
    out.push(v);
}

fn w_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn w_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn w_i16(out: &mut Vec<u8>, v: i16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn w_i64(out: &mut Vec<u8>, v: i64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn w_f64(out: &mut Vec<u8>, v: f64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn w_str(out: &mut Vec<u8>, s: &str) -> Result<(), LuaError> {
    let len = u16::try_from(s.len())
        .map_err(|_| LuaError::Internal("string too long to encode".into()))?;
    w_u16(out, len);
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

fn encode_proto(proto: &Prototype, out: &mut Vec<u8>) -> Result<(), LuaError> {
    w_str(out, &proto.source)?;
    w_u32(out, proto.line_defined);
    w_u32(out, proto.last_line_defined);
    w_u8(out, proto.param_count);
    w_u8(out, proto.is_vararg as u8);
    w_u8(out, proto.max_stack_size);

    w_u16(out, proto.constants.len() as u16);
    for c in &proto.constants {
        match c {
            Value::Nil => w_u8(out, 0),
            Value::Boolean(b) => {
                w_u8(out, 1);
                w_u8(out, *b as u8);
            }
            Value::Integer(n) => {
                w_u8(out, 2);
                w_i64(out, *n);
            }
            Value::Float(f) => {
                w_u8(out, 3);
                w_f64(out, *f);
            }
            Value::Str(s) => {
                w_u8(out, 4);
                w_str(out, s)?;
            }
            other => {
                return Err(LuaError::Internal(format!(
                    "non-serializable constant: {other:?}"
                )))
            }
        }
    }

    w_u16(out, proto.names.len() as u16);
    for n in &proto.names {
        w_str(out, n)?;
    }

    w_u8(out, proto.upvals.len() as u8);
    for d in &proto.upvals {
        match d {
            UpvalDesc::Local { index, name } => {
                w_u8(out, 0);
                w_u8(out, *index);
                w_str(out, name)?;
            }
            UpvalDesc::Upval { index, name } => {
                w_u8(out, 1);
                w_u8(out, *index);
                w_str(out, name)?;
            }
        }
    }

    w_u16(out, proto.locals.len() as u16);
    for l in &proto.locals {
        w_str(out, &l.name)?;
        w_u32(out, l.start_pc);
        w_u32(out, l.end_pc);
    }

    w_u16(out, proto.protos.len() as u16);
    for p in &proto.protos {
        encode_proto(p, out)?;
    }

    w_u32(out, proto.code.len() as u32);
    for op in &proto.code {
        encode_op(op, out)?;
    }
    w_u32(out, proto.line_info.len() as u32);
    for line in &proto.line_info {
        w_u32(out, *line);
    }
    Ok(())
}

fn encode_op(op: &Op, out: &mut Vec<u8>) -> Result<(), LuaError> {
    match *op {
        Op::LoadConst { dst, const_idx } => {
            w_u8(out, 0);
            w_u8(out, dst);
            w_u16(out, const_idx);
        }
        Op::LoadNil { dst } => {
            w_u8(out, 1);
            w_u8(out, dst);
        }
        Op::LoadBool { dst, value, skip } => {
            w_u8(out, 2);
            w_u8(out, dst);
            w_u8(out, value as u8);
            w_u8(out, skip as u8);
        }
        Op::Move { dst, src } => {
            w_u8(out, 3);
            w_u8(out, dst);
            w_u8(out, src);
        }
        Op::Add { dst, lhs, rhs } => abc(out, 4, dst, lhs, rhs),
        Op::Sub { dst, lhs, rhs } => abc(out, 5, dst, lhs, rhs),
        Op::Mul { dst, lhs, rhs } => abc(out, 6, dst, lhs, rhs),
        Op::Div { dst, lhs, rhs } => abc(out, 7, dst, lhs, rhs),
        Op::Mod { dst, lhs, rhs } => abc(out, 8, dst, lhs, rhs),
        Op::Pow { dst, lhs, rhs } => abc(out, 9, dst, lhs, rhs),
        Op::IDiv { dst, lhs, rhs } => abc(out, 10, dst, lhs, rhs),
        Op::Unm { dst, src } => {
            w_u8(out, 11);
            w_u8(out, dst);
            w_u8(out, src);
        }
        Op::Eq { dst, lhs, rhs } => abc(out, 12, dst, lhs, rhs),
        Op::Lt { dst, lhs, rhs } => abc(out, 13, dst, lhs, rhs),
        Op::Le { dst, lhs, rhs } => abc(out, 14, dst, lhs, rhs),
        Op::Not { dst, src } => {
            w_u8(out, 15);
            w_u8(out, dst);
            w_u8(out, src);
        }
        Op::Jump { offset } => {
            w_u8(out, 16);
            w_i16(out, offset);
        }
        Op::JumpIfFalse { src, offset } => {
            w_u8(out, 17);
            w_u8(out, src);
            w_i16(out, offset);
        }
        Op::JumpIfTrue { src, offset } => {
            w_u8(out, 18);
            w_u8(out, src);
            w_i16(out, offset);
        }
        Op::Concat { dst, lhs, rhs } => abc(out, 19, dst, lhs, rhs),
        Op::Len { dst, src } => {
            w_u8(out, 20);
            w_u8(out, dst);
            w_u8(out, src);
        }
        Op::Call {
            func,
            num_args,
            num_results,
        } => abc(out, 21, func, num_args, num_results),
        Op::TailCall { func, num_args } => {
            w_u8(out, 22);
            w_u8(out, func);
            w_u8(out, num_args);
        }
        Op::Return { src, count } => {
            w_u8(out, 23);
            w_u8(out, src);
            w_u8(out, count);
        }
        Op::VarArg { dst, count } => {
            w_u8(out, 24);
            w_u8(out, dst);
            w_u8(out, count);
        }
        Op::Method { dst, obj, name_idx } => {
            w_u8(out, 25);
            w_u8(out, dst);
            w_u8(out, obj);
            w_u16(out, name_idx);
        }
        Op::GetGlobal { dst, name_idx } => {
            w_u8(out, 26);
            w_u8(out, dst);
            w_u16(out, name_idx);
        }
        Op::SetGlobal { src, name_idx } => {
            w_u8(out, 27);
            w_u8(out, src);
            w_u16(out, name_idx);
        }
        Op::Closure { dst, proto_idx } => {
            w_u8(out, 28);
            w_u8(out, dst);
            w_u16(out, proto_idx);
        }
        Op::GetUpvalue { dst, upval_idx } => {
            w_u8(out, 29);
            w_u8(out, dst);
            w_u8(out, upval_idx);
        }
        Op::SetUpvalue { src, upval_idx } => {
            w_u8(out, 30);
            w_u8(out, src);
            w_u8(out, upval_idx);
        }
        Op::CloseUpvalues { from_reg } => {
            w_u8(out, 31);
            w_u8(out, from_reg);
        }
        Op::NewTable { dst } => {
            w_u8(out, 32);
            w_u8(out, dst);
        }
        Op::GetTable { dst, table, key } => abc(out, 33, dst, table, key),
        Op::SetTable { table, key, val } => abc(out, 34, table, key, val),
        Op::GetField {
            dst,
            table,
            name_idx,
        } => {
            w_u8(out, 35);
            w_u8(out, dst);
            w_u8(out, table);
            w_u16(out, name_idx);
        }
        Op::SetField {
            table,
            name_idx,
            val,
        } => {
            w_u8(out, 36);
            w_u8(out, table);
            w_u16(out, name_idx);
            w_u8(out, val);
        }
        Op::SetList { table, src, count } => abc(out, 37, table, src, count),
        Op::ForPrep { base, offset } => {
            w_u8(out, 38);
            w_u8(out, base);
            w_i16(out, offset);
        }
        Op::ForLoop { base, offset } => {
            w_u8(out, 39);
            w_u8(out, base);
            w_i16(out, offset);
        }
        Op::TForCall { base, num_vars } => {
            w_u8(out, 40);
            w_u8(out, base);
            w_u8(out, num_vars);
        }
        Op::TForLoop { base, offset } => {
            w_u8(out, 41);
            w_u8(out, base);
            w_i16(out, offset);
        }
        ref other => {
            return Err(LuaError::Internal(format!(
                "non-serializable instruction: {other:?}"
            )))
        }
    }
    Ok(())
}

fn abc(out: &mut Vec<u8>, tag: u8, a: u8, b: u8, c: u8) {
    w_u8(out, tag);
    w_u8(out, a);
    w_u8(out, b);
    w_u8(out, c);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode_chunk;

    #[test]
    fn round_trip_reproduces_the_prototype_tree() {
        let src = "local a = 1.5\n\
                   local t = { a, name = 'x' }\n\
                   function f(n, ...)\n\
                     local function g() return n end\n\
                     return g() + select('#', ...)\n\
                   end\n\
                   return f(a)";
        let chunk = crate::compile(src, "round.lua").unwrap();
        let bytes = encode_chunk(&chunk).unwrap();
        assert!(bytes.starts_with(MAGIC));
        let back = decode_chunk(&bytes).unwrap();
        assert_eq!(chunk.proto, back.proto);
    }

    #[test]
    fn encoding_is_deterministic() {
        let src = "for i = 1, 10 do x = (x or 0) + i end";
        let a = encode_chunk(&crate::compile(src, "d.lua").unwrap()).unwrap();
        let b = encode_chunk(&crate::compile(src, "d.lua").unwrap()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn truncated_input_is_rejected() {
        let chunk = crate::compile("return 1", "t.lua").unwrap();
        let bytes = encode_chunk(&chunk).unwrap();
        assert!(decode_chunk(&bytes[..bytes.len() - 2]).is_err());
        assert!(decode_chunk(b"not a chunk").is_err());
    }
}
