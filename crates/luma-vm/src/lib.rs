//! The bytecode interpreter and runtime environment.
//!
//! [`Vm`] executes compiled chunks over a register stack shared by all call
//! frames. The standard libraries are plain native functions registered at
//! startup; hosts can add their own through the same [`NativeFn`] shape and
//! the argument helpers in [`Args`].
//!
//! ```no_run
//! use luma_vm::Vm;
//!
//! let mut vm = Vm::new();
//! let results = vm.run_source("return 1 + 2", "demo")?;
//! # Ok::<(), luma_core::LuaError>(())
//! ```
//!
//! [`NativeFn`]: luma_core::NativeFn

mod api;
mod iolib;
mod mathlib;
mod meta;
mod oslib;
mod sandbox;
mod stdlib;
mod strlib;
mod vm;

pub use api::{arg_error, type_error, Args};
pub use vm::{with_current_vm, Vm, MAX_CALL_DEPTH};

#[cfg(test)]
pub(crate) mod testutil {
    use std::io::{self, Write};
    use std::sync::{Arc, Mutex};

    /// An output sink tests can hand to the interpreter and inspect later.
    #[derive(Clone, Default)]
    pub struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        pub fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}
