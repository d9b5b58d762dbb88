//! Symbol tables.
//!
//! A symbol binds a resolved expression node to its type and storage.
//! Locals are scoped to one probe activation (the context snapshot);
//! everything else lives in the session-global table. Tables own their
//! symbols; the emitter only reads and annotates them through ids.

use crate::ast::{NumLit, StrLit};
use crate::builtin::Builtin;
use crate::ir::Reg;
use crate::types::Type;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Local,
    Global,
}

/// Table-qualified symbol id, the handle the emitter works with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymRef {
    pub scope: Scope,
    pub id: SymId,
}

/// Where a symbol's value lives at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Storage {
    #[default]
    Unallocated,
    /// Folded into consuming instructions as an immediate operand.
    Imm,
    Reg,
    Stack,
}

/// Emission state attached to a symbol by the IR passes.
#[derive(Debug, Clone, Copy, Default)]
pub struct IrState {
    pub loc: Storage,
    pub imm: i64,
    pub size: u64,
    pub reg: Option<Reg>,
    /// Frame-pointer-relative offset of the stack slot, when `loc` is
    /// `Stack`.
    pub stack: i16,
    /// Upstream advice to keep the value in stack storage. Emission may
    /// override it when the value cannot live there.
    pub stack_hint: bool,
}

/// Literal payload carried over from the node for emission.
#[derive(Debug, Clone, Default)]
pub enum SymValue {
    #[default]
    None,
    Num(NumLit),
    Str(StrLit),
}

#[derive(Debug)]
pub struct Sym {
    pub name: Option<String>,
    pub builtin: &'static Builtin,
    pub ty: Type,
    pub value: SymValue,
    pub irs: IrState,
}

#[derive(Debug, Default)]
pub struct SymTable {
    syms: Vec<Sym>,
}

impl SymTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(
        &mut self,
        name: Option<String>,
        builtin: &'static Builtin,
        ty: Type,
        value: SymValue,
    ) -> SymId {
        self.syms.push(Sym {
            name,
            builtin,
            ty,
            value,
            irs: IrState::default(),
        });
        SymId(self.syms.len() - 1)
    }

    pub fn get(&self, id: SymId) -> &Sym {
        &self.syms[id.0]
    }

    pub fn get_mut(&mut self, id: SymId) -> &mut Sym {
        &mut self.syms[id.0]
    }

    pub fn iter(&self) -> impl Iterator<Item = (SymId, &Sym)> {
        self.syms.iter().enumerate().map(|(i, s)| (SymId(i), s))
    }

    pub fn len(&self) -> usize {
        self.syms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.syms.is_empty()
    }
}
