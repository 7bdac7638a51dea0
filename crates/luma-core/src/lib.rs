//! Core data model shared by the compiler and the VM: values, errors,
//! tables, function prototypes/closures/upvalues and the instruction set.

pub mod error;
pub mod opcode;
pub mod proto;
pub mod table;
pub mod value;

pub use error::LuaError;
pub use opcode::{Op, MULTI};
pub use proto::{Closure, LocalVar, Prototype, UpvalDesc, Upvalue, UpvalueState};
pub use table::{Table, TableKey};
pub use value::{NativeFn, TableRef, Userdata, UserdataRef, Value};
