/// Marker for "as many values as are available": used as an argument count,
/// result count or return count to mean "everything up to the frame top".
pub const MULTI: u8 = 255;

/// One VM instruction.
///
/// Register operands are frame-relative. Jump offsets are relative to the
/// instruction *after* the jump, so `offset = 0` falls through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    // constants & moves
    LoadConst { dst: u8, const_idx: u16 },
    LoadNil { dst: u8 },
    LoadBool { dst: u8, value: bool, skip: bool },
    Move { dst: u8, src: u8 },

    // arithmetic
    Add { dst: u8, lhs: u8, rhs: u8 },
    Sub { dst: u8, lhs: u8, rhs: u8 },
    Mul { dst: u8, lhs: u8, rhs: u8 },
    Div { dst: u8, lhs: u8, rhs: u8 },
    Mod { dst: u8, lhs: u8, rhs: u8 },
    Pow { dst: u8, lhs: u8, rhs: u8 },
    IDiv { dst: u8, lhs: u8, rhs: u8 },
    Unm { dst: u8, src: u8 },

    // comparison & logic
    Eq { dst: u8, lhs: u8, rhs: u8 },
    Lt { dst: u8, lhs: u8, rhs: u8 },
    Le { dst: u8, lhs: u8, rhs: u8 },
    Not { dst: u8, src: u8 },

    // control flow
    Jump { offset: i16 },
    JumpIfFalse { src: u8, offset: i16 },
    JumpIfTrue { src: u8, offset: i16 },

    // strings
    Concat { dst: u8, lhs: u8, rhs: u8 },
    Len { dst: u8, src: u8 },

    // calls
    Call { func: u8, num_args: u8, num_results: u8 },
    TailCall { func: u8, num_args: u8 },
    Return { src: u8, count: u8 },
    VarArg { dst: u8, count: u8 },
    /// `dst = obj[name]; dst+1 = obj` — sets up a method call in one step.
    Method { dst: u8, obj: u8, name_idx: u16 },

    // globals
    GetGlobal { dst: u8, name_idx: u16 },
    SetGlobal { src: u8, name_idx: u16 },

    // closures & upvalues
    Closure { dst: u8, proto_idx: u16 },
    GetUpvalue { dst: u8, upval_idx: u8 },
    SetUpvalue { src: u8, upval_idx: u8 },
    CloseUpvalues { from_reg: u8 },

    // tables
    NewTable { dst: u8 },
    GetTable { dst: u8, table: u8, key: u8 },
    SetTable { table: u8, key: u8, val: u8 },
    GetField { dst: u8, table: u8, name_idx: u16 },
    SetField { table: u8, name_idx: u16, val: u8 },
    SetList { table: u8, src: u8, count: u8 },

    // numeric for: control block at base = {init, limit, step}, user var at base+3
    ForPrep { base: u8, offset: i16 },
    ForLoop { base: u8, offset: i16 },
    // generic for: control block at base = {iterator, state, control}, vars at base+3
    TForCall { base: u8, num_vars: u8 },
    TForLoop { base: u8, offset: i16 },
}
