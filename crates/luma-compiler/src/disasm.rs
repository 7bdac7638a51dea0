use luma_core::{Op, Prototype, UpvalDesc, Value};

/// Renders a prototype tree as human-readable text, one nested function
/// after another.
pub fn disassemble(proto: &Prototype) -> String {
    let mut out = String::new();
    disasm_proto(proto, &mut out);
    out
}

fn disasm_proto(proto: &Prototype, out: &mut String) {
    let name = if proto.source.is_empty() {
        "<?>"
    } else {
        &proto.source
    };
    out.push_str(&format!(
        "== {} ==  (lines {}-{}, params={}, vararg={}, stack={})\n",
        name,
        proto.line_defined,
        proto.last_line_defined,
        proto.param_count,
        proto.is_vararg,
        proto.max_stack_size
    ));

    if !proto.constants.is_empty() {
        out.push_str("constants:\n");
        for (i, c) in proto.constants.iter().enumerate() {
            out.push_str(&format!("  [K{i}]  {}\n", fmt_value(c)));
        }
    }

    if !proto.names.is_empty() {
        out.push_str("names:\n");
        for (i, n) in proto.names.iter().enumerate() {
            out.push_str(&format!("  [N{i}]  {n}\n"));
        }
    }

    if !proto.upvals.is_empty() {
        out.push_str("upvalues:\n");
        for (i, uv) in proto.upvals.iter().enumerate() {
            let desc = match uv {
                UpvalDesc::Local { index, name } => format!("{name} <- parent local r{index}"),
                UpvalDesc::Upval { index, name } => format!("{name} <- parent upvalue {index}"),
            };
            out.push_str(&format!("  [U{i}]  {desc}\n"));
        }
    }

    out.push_str("instructions:\n");
    for (i, op) in proto.code.iter().enumerate() {
        let line = proto.line_info.get(i).copied().unwrap_or(0);
        out.push_str(&format!("  {i:04}  [{line:>3}]  {}\n", fmt_op(op, proto)));
    }

    for (i, sub) in proto.protos.iter().enumerate() {
        out.push('\n');
        out.push_str(&format!("-- function {i} of {} --\n", proto.source));
        disasm_proto(sub, out);
    }
}

fn fmt_value(v: &Value) -> String {
    match v {
        Value::Str(s) => format!("{s:?}"),
        other => other.to_string(),
    }
}

fn name_of(proto: &Prototype, idx: u16) -> &str {
    proto.names.get(idx as usize).map(String::as_str).unwrap_or("?")
}

fn fmt_op(op: &Op, proto: &Prototype) -> String {
    match *op {
        Op::LoadConst { dst, const_idx } => {
            let val = proto
                .constants
                .get(const_idx as usize)
                .map(fmt_value)
                .unwrap_or_else(|| "?".into());
            format!("LoadConst     r{dst} = K{const_idx} ({val})")
        }
        Op::LoadNil { dst } => format!("LoadNil       r{dst}"),
        Op::LoadBool { dst, value, skip } => format!("LoadBool      r{dst} = {value} skip={skip}"),
        Op::Move { dst, src } => format!("Move          r{dst} = r{src}"),
        Op::Add { dst, lhs, rhs } => format!("Add           r{dst} = r{lhs} + r{rhs}"),
        Op::Sub { dst, lhs, rhs } => format!("Sub           r{dst} = r{lhs} - r{rhs}"),
        Op::Mul { dst, lhs, rhs } => format!("Mul           r{dst} = r{lhs} * r{rhs}"),
        Op::Div { dst, lhs, rhs } => format!("Div           r{dst} = r{lhs} / r{rhs}"),
        Op::Mod { dst, lhs, rhs } => format!("Mod           r{dst} = r{lhs} % r{rhs}"),
        Op::Pow { dst, lhs, rhs } => format!("Pow           r{dst} = r{lhs} ^ r{rhs}"),
        Op::IDiv { dst, lhs, rhs } => format!("IDiv          r{dst} = r{lhs} // r{rhs}"),
        Op::Unm { dst, src } => format!("Unm           r{dst} = -r{src}"),
        Op::Eq { dst, lhs, rhs } => format!("Eq            r{dst} = r{lhs} == r{rhs}"),
        Op::Lt { dst, lhs, rhs } => format!("Lt            r{dst} = r{lhs} < r{rhs}"),
        Op::Le { dst, lhs, rhs } => format!("Le            r{dst} = r{lhs} <= r{rhs}"),
        Op::Not { dst, src } => format!("Not           r{dst} = not r{src}"),
        Op::Jump { offset } => format!("Jump          {offset:+}"),
        Op::JumpIfFalse { src, offset } => format!("JumpIfFalse   r{src} {offset:+}"),
        Op::JumpIfTrue { src, offset } => format!("JumpIfTrue    r{src} {offset:+}"),
        Op::Concat { dst, lhs, rhs } => format!("Concat        r{dst} = r{lhs} .. r{rhs}"),
        Op::Len { dst, src } => format!("Len           r{dst} = #r{src}"),
        Op::Call {
            func,
            num_args,
            num_results,
        } => format!("Call          r{func} args={num_args} results={num_results}"),
        Op::TailCall { func, num_args } => format!("TailCall      r{func} args={num_args}"),
        Op::Return { src, count } => format!("Return        r{src} count={count}"),
        Op::VarArg { dst, count } => format!("VarArg        r{dst} count={count}"),
        Op::Method { dst, obj, name_idx } => format!(
            "Method        r{dst} = r{obj}:{} (self in r{})",
            name_of(proto, name_idx),
            dst + 1
        ),
        Op::GetGlobal { dst, name_idx } => {
            format!("GetGlobal     r{dst} = {}", name_of(proto, name_idx))
        }
        Op::SetGlobal { src, name_idx } => {
            format!("SetGlobal     {} = r{src}", name_of(proto, name_idx))
        }
        Op::Closure { dst, proto_idx } => format!("Closure       r{dst} = function {proto_idx}"),
        Op::GetUpvalue { dst, upval_idx } => format!("GetUpvalue    r{dst} = U{upval_idx}"),
        Op::SetUpvalue { src, upval_idx } => format!("SetUpvalue    U{upval_idx} = r{src}"),
        Op::CloseUpvalues { from_reg } => format!("CloseUpvalues from r{from_reg}"),
        Op::NewTable { dst } => format!("NewTable      r{dst}"),
        Op::GetTable { dst, table, key } => format!("GetTable      r{dst} = r{table}[r{key}]"),
        Op::SetTable { table, key, val } => format!("SetTable      r{table}[r{key}] = r{val}"),
        Op::GetField {
            dst,
            table,
            name_idx,
        } => format!(
            "GetField      r{dst} = r{table}.{}",
            name_of(proto, name_idx)
        ),
        Op::SetField {
            table,
            name_idx,
            val,
        } => format!(
            "SetField      r{table}.{} = r{val}",
            name_of(proto, name_idx)
        ),
        Op::SetList { table, src, count } => {
            format!("SetList       r{table} <- r{src}.. count={count}")
        }
        Op::ForPrep { base, offset } => format!("ForPrep       base=r{base} {offset:+}"),
        Op::ForLoop { base, offset } => format!("ForLoop       base=r{base} {offset:+}"),
        Op::TForCall { base, num_vars } => format!("TForCall      base=r{base} vars={num_vars}"),
        Op::TForLoop { base, offset } => format!("TForLoop      base=r{base} {offset:+}"),
        ref other => format!("{other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_nested_functions() {
        let chunk = crate::compile("function f()\n  return 1\nend\nreturn f()", "d.lua").unwrap();
        let text = disassemble(&chunk.proto);
        assert!(text.contains("== d.lua =="));
        assert!(text.contains("-- function 0 of d.lua --"));
        assert!(text.contains("TailCall"));
    }
}
