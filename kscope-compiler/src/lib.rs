//! Expression lowering for kscope probes.
//!
//! The compiler core takes typed expression nodes (numeric and string
//! literals, bare identifiers, the implicit probe context) and lowers them
//! to BPF bytecode through a small instruction builder. Parsing and the
//! full type checker live outside this crate; only the built-in resolution
//! and emission rules are here.

pub mod ast;
pub mod builtin;
pub mod ir;
pub mod probe;
pub mod sym;
pub mod types;

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("unknown function: {0}")]
    UnknownBuiltin(String),

    #[error("{func} expects {expected} argument(s), got {got}")]
    BadArity {
        func: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("out of scratch registers")]
    RegisterExhausted,

    #[error("probe stack overflow: {need} bytes requested, {avail} available")]
    StackExhausted { need: u64, avail: u64 },

    #[error("argument {0} is not passed in a register on this architecture")]
    UnknownArgRegister(u8),
}

pub type Result<T> = std::result::Result<T, CompileError>;

pub use ast::{Expr, IntWidth, NumLit, StrLit};
pub use builtin::{Builtin, BuiltinProvider, Provider};
pub use ir::{Insn, Ir, Reg};
pub use probe::ProbeProgram;
pub use sym::{Scope, Storage, Sym, SymId, SymRef, SymTable};
pub use types::{IntClass, Type};
