//! Expression nodes handed to the resolver.
//!
//! These are the leaves of a compiled probe's syntax tree. The surrounding
//! parser produces them; this crate only binds them to symbols and emits
//! their values.

/// Explicit integer width attached to a numeric literal by the parser
/// (`5u32`-style suffixes). Absent means "infer from magnitude".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntWidth {
    W32,
    W64,
}

#[derive(Debug, Clone, Copy)]
pub struct NumLit {
    /// Two's-complement bits of the literal; reinterpret as `u64` when
    /// `unsigned` is set.
    pub value: i64,
    pub unsigned: bool,
    pub width: Option<IntWidth>,
}

#[derive(Debug, Clone)]
pub struct StrLit {
    pub bytes: Vec<u8>,
    /// The backing bytes already live in kernel memory; no copy onto the
    /// probe stack is emitted for a virtual string.
    pub virtual_: bool,
}

#[derive(Debug, Clone)]
pub enum Expr {
    Num(NumLit),
    Str(StrLit),
    /// A named expression. With no arguments and no built-in match it
    /// degrades to a bare-identifier placeholder for the outer resolver.
    Call { name: String, args: Vec<Expr> },
}

impl Expr {
    pub fn num(value: i64) -> Self {
        Expr::Num(NumLit {
            value,
            unsigned: false,
            width: None,
        })
    }

    pub fn unum(value: u64) -> Self {
        Expr::Num(NumLit {
            value: value as i64,
            unsigned: true,
            width: None,
        })
    }

    pub fn num_sized(value: i64, unsigned: bool, width: IntWidth) -> Self {
        Expr::Num(NumLit {
            value,
            unsigned,
            width: Some(width),
        })
    }

    pub fn string(s: &str) -> Self {
        Expr::Str(StrLit {
            bytes: s.as_bytes().to_vec(),
            virtual_: false,
        })
    }

    pub fn ident(name: &str) -> Self {
        Expr::Call {
            name: name.to_string(),
            args: Vec::new(),
        }
    }
}
