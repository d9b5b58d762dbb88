//! The built-in type model.
//!
//! Numeric literals resolve to C-style integer classes so that inferred
//! widths follow the host ABI the traced kernel uses; strings become
//! fixed byte arrays padded to the VM's word size.

use crate::ast::{IntWidth, NumLit, StrLit};

/// Width of the host `long`, which the inference ladder threads through.
const LONG_SIZE: u64 = std::mem::size_of::<libc::c_long>() as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntClass {
    Int,
    UInt,
    Long,
    ULong,
    LLong,
    ULLong,
    S32,
    U32,
    S64,
    U64,
}

impl IntClass {
    pub fn size(self) -> u64 {
        match self {
            IntClass::Int | IntClass::UInt | IntClass::S32 | IntClass::U32 => 4,
            IntClass::Long | IntClass::ULong => LONG_SIZE,
            IntClass::LLong | IntClass::ULLong | IntClass::S64 | IntClass::U64 => 8,
        }
    }

    pub fn signed(self) -> bool {
        matches!(
            self,
            IntClass::Int | IntClass::Long | IntClass::LLong | IntClass::S32 | IntClass::S64
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            IntClass::Int => "int",
            IntClass::UInt => "unsigned int",
            IntClass::Long => "long",
            IntClass::ULong => "unsigned long",
            IntClass::LLong => "long long",
            IntClass::ULLong => "unsigned long long",
            IntClass::S32 => "s32",
            IntClass::U32 => "u32",
            IntClass::S64 => "s64",
            IntClass::U64 => "u64",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pointee {
    Void,
    PtRegs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    Void,
    Int(IntClass),
    /// Fixed-length byte array (string storage).
    Array { len: u64 },
    Ptr {
        pointee: Pointee,
        /// The in-kernel verifier marks sub-64-bit accesses to the probe
        /// context pointer as invalid even on 32-bit ISAs, so a pointer
        /// with this flag is always 8 bytes wide. Never derive it from
        /// the host pointer width.
        bpf: bool,
    },
}

impl Type {
    pub fn size(&self) -> u64 {
        match self {
            Type::Void => 0,
            Type::Int(c) => c.size(),
            Type::Array { len } => *len,
            Type::Ptr { bpf: true, .. } => 8,
            Type::Ptr { .. } => std::mem::size_of::<usize>() as u64,
        }
    }

    /// True for types that only make sense in probe stack storage.
    pub fn is_aggregate(&self) -> bool {
        matches!(self, Type::Array { .. })
    }
}

/// The implicit probe context: an opaque pointer to whatever register
/// snapshot the kernel handed the program.
pub fn ctx_type() -> Type {
    Type::Ptr {
        pointee: Pointee::Void,
        bpf: true,
    }
}

pub fn pt_regs_type() -> Type {
    Type::Ptr {
        pointee: Pointee::PtRegs,
        bpf: false,
    }
}

fn long_max() -> u64 {
    if LONG_SIZE == 8 {
        i64::MAX as u64
    } else {
        i32::MAX as u64
    }
}

fn ulong_max() -> u64 {
    if LONG_SIZE == 8 {
        u64::MAX
    } else {
        u32::MAX as u64
    }
}

fn in_long_range(v: i64) -> bool {
    if LONG_SIZE == 8 {
        true
    } else {
        v >= i32::MIN as i64 && v <= i32::MAX as i64
    }
}

/// Narrowest built-in integer class that can hold the literal. Explicit
/// widths short-circuit; otherwise the ladder prefers `int`, then `long`,
/// then `long long` (and their unsigned variants when the value demands
/// it), always resolving ties toward the smallest adequate width.
pub fn num_type(n: &NumLit) -> Type {
    match n.width {
        Some(IntWidth::W64) => {
            return Type::Int(if n.unsigned { IntClass::U64 } else { IntClass::S64 })
        }
        Some(IntWidth::W32) => {
            return Type::Int(if n.unsigned { IntClass::U32 } else { IntClass::S32 })
        }
        None => {}
    }

    if n.unsigned {
        let v = n.value as u64;
        if v <= i32::MAX as u64 {
            Type::Int(IntClass::Int)
        } else if v <= u32::MAX as u64 {
            Type::Int(IntClass::UInt)
        } else if v <= long_max() {
            Type::Int(IntClass::Long)
        } else if v <= ulong_max() {
            Type::Int(IntClass::ULong)
        } else if v <= i64::MAX as u64 {
            Type::Int(IntClass::LLong)
        } else {
            Type::Int(IntClass::ULLong)
        }
    } else {
        let v = n.value;
        if v >= i32::MIN as i64 && v <= i32::MAX as i64 {
            Type::Int(IntClass::Int)
        } else if in_long_range(v) {
            Type::Int(IntClass::Long)
        } else {
            Type::Int(IntClass::LLong)
        }
    }
}

/// String storage: `max(1, len)` rounded up to the VM's 8-byte word.
pub fn string_type(s: &StrLit) -> Type {
    let len = (s.bytes.len().max(1) as u64 + 7) & !7;
    Type::Array { len }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Expr;

    fn num_lit(e: Expr) -> NumLit {
        match e {
            Expr::Num(n) => n,
            _ => unreachable!(),
        }
    }

    #[test]
    fn signed_ladder_prefers_int() {
        assert_eq!(num_type(&num_lit(Expr::num(0))), Type::Int(IntClass::Int));
        assert_eq!(
            num_type(&num_lit(Expr::num(i32::MAX as i64))),
            Type::Int(IntClass::Int)
        );
        assert_eq!(
            num_type(&num_lit(Expr::num(i32::MIN as i64))),
            Type::Int(IntClass::Int)
        );
    }

    #[test]
    fn signed_ladder_widens_past_int() {
        let t = num_type(&num_lit(Expr::num(i32::MAX as i64 + 1)));
        assert_eq!(t.size(), 8);
        assert!(matches!(t, Type::Int(c) if c.signed()));
    }

    #[test]
    fn unsigned_ladder_starts_signed() {
        // An unsigned-tagged literal still types as plain int while it
        // fits the signed range.
        assert_eq!(num_type(&num_lit(Expr::unum(7))), Type::Int(IntClass::Int));
        assert_eq!(
            num_type(&num_lit(Expr::unum(i32::MAX as u64 + 1))),
            Type::Int(IntClass::UInt)
        );
        assert_eq!(
            num_type(&num_lit(Expr::unum(u64::MAX))),
            Type::Int(if LONG_SIZE == 8 {
                IntClass::ULong
            } else {
                IntClass::ULLong
            })
        );
    }

    #[test]
    fn explicit_width_wins() {
        let e = Expr::num_sized(1, true, IntWidth::W64);
        assert_eq!(num_type(&num_lit(e)), Type::Int(IntClass::U64));
        let e = Expr::num_sized(-1, false, IntWidth::W32);
        assert_eq!(num_type(&num_lit(e)), Type::Int(IntClass::S32));
    }

    #[test]
    fn string_length_rounds_to_words() {
        let ty = |s: &str| match Expr::string(s) {
            Expr::Str(lit) => string_type(&lit),
            _ => unreachable!(),
        };
        assert_eq!(ty(""), Type::Array { len: 8 });
        assert_eq!(ty("a"), Type::Array { len: 8 });
        assert_eq!(ty("12345678"), Type::Array { len: 8 });
        assert_eq!(ty("0123456789"), Type::Array { len: 16 });
    }

    #[test]
    fn ctx_pointer_is_always_wide() {
        assert_eq!(ctx_type().size(), 8);
    }
}
