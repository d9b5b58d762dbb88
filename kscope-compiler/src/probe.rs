//! Per-probe compilation state.
//!
//! A `ProbeProgram` owns the probe-local symbol table and the instruction
//! stream while one probe compiles, and borrows the session-global table
//! so literals land in program-wide scope. Resolution walks the
//! expression trees post-order through a provider chain; emission runs
//! the provider pre-passes (context capture) and then each symbol's
//! emitter in the same post-order.

use tracing::debug;

use crate::ast::Expr;
use crate::builtin::Provider;
use crate::ir::Ir;
use crate::sym::{Scope, Sym, SymRef, SymTable, SymValue};
use crate::types::Type;
use crate::{Builtin, CompileError, Result};

pub struct ProbeProgram<'g> {
    pub globals: &'g mut SymTable,
    pub locals: SymTable,
    pub ir: Ir,
    /// Post-order emission schedule filled in during resolution.
    emit_order: Vec<SymRef>,
}

impl<'g> ProbeProgram<'g> {
    pub fn new(globals: &'g mut SymTable) -> Self {
        ProbeProgram {
            globals,
            locals: SymTable::new(),
            ir: Ir::new(),
            emit_order: Vec::new(),
        }
    }

    pub fn sym(&self, r: SymRef) -> &Sym {
        match r.scope {
            Scope::Local => self.locals.get(r.id),
            Scope::Global => self.globals.get(r.id),
        }
    }

    pub fn sym_mut(&mut self, r: SymRef) -> &mut Sym {
        match r.scope {
            Scope::Local => self.locals.get_mut(r.id),
            Scope::Global => self.globals.get_mut(r.id),
        }
    }

    pub fn alloc_local(
        &mut self,
        name: Option<String>,
        builtin: &'static Builtin,
        ty: Type,
        value: SymValue,
    ) -> SymRef {
        SymRef {
            scope: Scope::Local,
            id: self.locals.alloc(name, builtin, ty, value),
        }
    }

    pub fn alloc_global(
        &mut self,
        name: Option<String>,
        builtin: &'static Builtin,
        ty: Type,
        value: SymValue,
    ) -> SymRef {
        SymRef {
            scope: Scope::Global,
            id: self.globals.alloc(name, builtin, ty, value),
        }
    }

    /// Allocate run-time storage for a resolved symbol.
    pub fn init_sym(&mut self, r: SymRef) -> Result<()> {
        match r.scope {
            Scope::Local => self.ir.init_sym(self.locals.get_mut(r.id)),
            Scope::Global => self.ir.init_sym(self.globals.get_mut(r.id)),
        }
    }

    /// Bind one expression tree to symbols, arguments first. Every node
    /// resolves to exactly one symbol or the walk fails.
    pub fn resolve(&mut self, providers: &[&dyn Provider], expr: &Expr) -> Result<SymRef> {
        if let Expr::Call { args, .. } = expr {
            for arg in args {
                self.resolve(providers, arg)?;
            }
        }
        for p in providers {
            if let Some(r) = p.sym_alloc(self, expr)? {
                self.emit_order.push(r);
                return Ok(r);
            }
        }
        match expr {
            Expr::Call { name, .. } => Err(CompileError::UnknownBuiltin(name.clone())),
            _ => unreachable!("literal nodes always resolve"),
        }
    }

    /// Resolve and emit a probe body: resolution over the provider
    /// chain, provider pre-passes (context capture comes first so the
    /// entry register is snapshotted before anything clobbers it), then
    /// post-order emission.
    pub fn compile(&mut self, providers: &[&dyn Provider], exprs: &[Expr]) -> Result<Vec<SymRef>> {
        let mut roots = Vec::with_capacity(exprs.len());
        for expr in exprs {
            roots.push(self.resolve(providers, expr)?);
        }
        for p in providers {
            p.ir_pre(self)?;
        }
        for r in self.emit_order.clone() {
            if let Some(emit) = self.sym(r).builtin.ir_post {
                emit(self, r)?;
            }
        }
        debug!(
            symbols = self.emit_order.len(),
            insns = self.ir.insns().len(),
            "probe body emitted"
        );
        Ok(roots)
    }

    /// Tear the program apart once compilation is done; the caller keeps
    /// the locals (for the scheduler) and the finished instruction
    /// stream.
    pub fn finish(self) -> (SymTable, Ir) {
        (self.locals, self.ir)
    }
}
