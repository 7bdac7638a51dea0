use std::sync::{Arc, RwLock};

use crate::opcode::Op;
use crate::value::Value;

/// Where a closure's captured variable lives, from the perspective of the
/// enclosing function: a register of the enclosing frame, or an entry of the
/// enclosing closure's own upvalue array.
#[derive(Debug, Clone, PartialEq)]
pub enum UpvalDesc {
    /// Captures a local of the directly enclosing function.
    Local { index: u8, name: String },
    /// Threads through an upvalue of the directly enclosing function.
    Upval { index: u8, name: String },
}

/// Debug range of one local variable: live between `start_pc` (inclusive)
/// and `end_pc` (exclusive).
#[derive(Debug, Clone, PartialEq)]
pub struct LocalVar {
    pub name: String,
    pub start_pc: u32,
    pub end_pc: u32,
}

/// One compiled function. Immutable once built; shared read-only between
/// closures and across VM instances. Structural equality is field-for-field
/// and recursive through `protos`, which is what the persisted-form tests
/// compare.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Prototype {
    pub code: Vec<Op>,
    pub constants: Vec<Value>,
    /// Global/field names referenced by `name_idx` operands.
    pub names: Vec<String>,
    /// Source line of each instruction, parallel to `code`.
    pub line_info: Vec<u32>,
    pub protos: Vec<Arc<Prototype>>,
    pub upvals: Vec<UpvalDesc>,
    pub locals: Vec<LocalVar>,
    pub param_count: u8,
    pub is_vararg: bool,
    pub max_stack_size: u8,
    pub source: String,
    pub line_defined: u32,
    pub last_line_defined: u32,
}

/// A captured variable cell. While the defining frame is live the cell is
/// *open*: an index into the VM's shared register stack. When that frame
/// returns the cell is *closed*: it owns the value. Every closure capturing
/// the same variable instance holds the same cell, open or closed.
#[derive(Debug)]
pub enum UpvalueState {
    Open(usize),
    Closed(Value),
}

#[derive(Debug, Clone)]
pub struct Upvalue(pub Arc<RwLock<UpvalueState>>);

impl Upvalue {
    pub fn open(slot: usize) -> Upvalue {
        Upvalue(Arc::new(RwLock::new(UpvalueState::Open(slot))))
    }

    pub fn closed(value: Value) -> Upvalue {
        Upvalue(Arc::new(RwLock::new(UpvalueState::Closed(value))))
    }

    /// Same cell, by identity.
    pub fn ptr_eq(&self, other: &Upvalue) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// A prototype bound to its captured upvalue cells.
#[derive(Debug)]
pub struct Closure {
    pub proto: Arc<Prototype>,
    pub upvalues: Vec<Upvalue>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upvalue_cells_share_by_identity() {
        let cell = Upvalue::open(4);
        let alias = cell.clone();
        assert!(cell.ptr_eq(&alias));
        assert!(!cell.ptr_eq(&Upvalue::open(4)));
    }

    #[test]
    fn closing_is_visible_through_aliases() {
        let cell = Upvalue::open(2);
        let alias = cell.clone();
        *cell.0.write().unwrap() = UpvalueState::Closed(Value::Integer(7));
        let state = alias.0.read().unwrap();
        match &*state {
            UpvalueState::Closed(Value::Integer(7)) => {}
            other => panic!("expected closed cell, got {other:?}"),
        }
    }

    #[test]
    fn prototype_structural_equality() {
        let mut a = Prototype {
            source: "chunk".into(),
            param_count: 2,
            ..Default::default()
        };
        let b = a.clone();
        assert_eq!(a, b);
        a.code.push(Op::LoadNil { dst: 0 });
        assert_ne!(a, b);
    }
}
