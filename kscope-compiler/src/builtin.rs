//! Built-in resolution and emission.
//!
//! Literals, bare identifiers and the implicit probe context are resolved
//! here; probe-kind providers chain in front of this one for their own
//! names. Emission follows the storage model: small constants fold into
//! consuming instructions, wide constants get the two-slot register load,
//! strings are copied onto the probe stack, and the context is snapshotted
//! out of the entry register before anything else runs.

use std::ptr;

use crate::ast::Expr;
use crate::ir::Reg;
use crate::probe::ProbeProgram;
use crate::sym::{Scope, Storage, SymRef, SymValue};
use crate::types::{self, Type};
use crate::{CompileError, Result};

/// Emission callback run once per resolved symbol during the post-order
/// code-generation pass.
pub type EmitFn = fn(&mut ProbeProgram<'_>, SymRef) -> Result<()>;

#[derive(Debug)]
pub struct Builtin {
    pub name: &'static str,
    /// Exact argument count accepted; `None` skips the static check.
    pub arity: Option<usize>,
    pub ir_post: Option<EmitFn>,
}

/// The implicit probe context. Its value is only meaningful per
/// activation, so its symbol always lands in the probe-local table.
pub static CTX: Builtin = Builtin {
    name: "ctx",
    arity: Some(0),
    ir_post: None,
};

pub static NUM: Builtin = Builtin {
    name: ":num",
    arity: Some(0),
    ir_post: Some(num_ir_post),
};

pub static STRING: Builtin = Builtin {
    name: ":string",
    arity: Some(0),
    ir_post: Some(string_ir_post),
};

pub static IDENT: Builtin = Builtin {
    name: ":ident",
    arity: None,
    ir_post: None,
};

/// Named built-ins addressable from probe scripts; new ones register
/// here explicitly.
static REGISTRY: &[&Builtin] = &[&CTX];

/// Validate a call against its built-in's signature before any symbol is
/// allocated.
pub fn static_validate(builtin: &'static Builtin, got: usize) -> Result<()> {
    if let Some(expected) = builtin.arity {
        if got != expected {
            return Err(CompileError::BadArity {
                func: builtin.name,
                expected,
                got,
            });
        }
    }
    Ok(())
}

/// A resolution stage in the provider chain. `sym_alloc` returning
/// `Ok(None)` defers the node to the next stage.
pub trait Provider {
    fn sym_alloc(&self, prog: &mut ProbeProgram<'_>, expr: &Expr) -> Result<Option<SymRef>>;

    /// Emission hook run once per probe, before any symbol emitter.
    fn ir_pre(&self, _prog: &mut ProbeProgram<'_>) -> Result<()> {
        Ok(())
    }
}

pub struct BuiltinProvider;

impl Provider for BuiltinProvider {
    fn sym_alloc(&self, prog: &mut ProbeProgram<'_>, expr: &Expr) -> Result<Option<SymRef>> {
        match expr {
            Expr::Num(n) => {
                let ty = types::num_type(n);
                Ok(Some(prog.alloc_global(None, &NUM, ty, SymValue::Num(*n))))
            }
            Expr::Str(s) => {
                let ty = types::string_type(s);
                Ok(Some(prog.alloc_global(
                    None,
                    &STRING,
                    ty,
                    SymValue::Str(s.clone()),
                )))
            }
            Expr::Call { name, args } => {
                if let Some(builtin) = REGISTRY.iter().find(|b| b.name == name) {
                    static_validate(builtin, args.len())?;
                    if ptr::eq(*builtin, &CTX) {
                        return Ok(Some(prog.alloc_local(
                            Some(name.clone()),
                            builtin,
                            types::ctx_type(),
                            SymValue::None,
                        )));
                    }
                    return Ok(Some(prog.alloc_global(
                        Some(name.clone()),
                        builtin,
                        Type::Void,
                        SymValue::None,
                    )));
                }
                if args.is_empty() {
                    // Bare identifier, left for the outer resolver.
                    return Ok(Some(prog.alloc_global(
                        Some(name.clone()),
                        &IDENT,
                        Type::Void,
                        SymValue::None,
                    )));
                }
                // A non-built-in call belongs to an outer resolution
                // stage.
                Ok(None)
            }
        }
    }

    /// Snapshot the kernel-supplied entry register into every context
    /// symbol before the first instruction can clobber it.
    fn ir_pre(&self, prog: &mut ProbeProgram<'_>) -> Result<()> {
        let ids: Vec<_> = prog
            .locals
            .iter()
            .filter(|(_, s)| s.name.is_some() && ptr::eq(s.builtin, &CTX))
            .map(|(id, _)| id)
            .collect();
        for id in ids {
            let r = SymRef {
                scope: Scope::Local,
                id,
            };
            prog.init_sym(r)?;
            prog.ir.emit_reg_to_sym(prog.locals.get(id), Reg::R1);
        }
        Ok(())
    }
}

fn num_ir_post(prog: &mut ProbeProgram<'_>, r: SymRef) -> Result<()> {
    let (lit, size) = {
        let sym = prog.sym(r);
        match &sym.value {
            SymValue::Num(n) => (*n, sym.ty.size()),
            _ => unreachable!("numeric symbol without literal"),
        }
    };

    let fits_imm = if lit.unsigned {
        (lit.value as u64) <= i32::MAX as u64
    } else {
        lit.value >= i32::MIN as i64 && lit.value <= i32::MAX as i64
    };
    if fits_imm {
        let irs = &mut prog.sym_mut(r).irs;
        irs.loc = Storage::Imm;
        irs.imm = lit.value;
        irs.size = size;
        return Ok(());
    }

    // A 64-bit constant has to be loaded into a register, so stack
    // advice does not apply.
    prog.sym_mut(r).irs.stack_hint = false;
    prog.init_sym(r)?;
    let dst = prog
        .sym(r)
        .irs
        .reg
        .expect("register symbol without register");
    prog.ir.emit_lddw(dst, lit.value as u64);
    Ok(())
}

fn string_ir_post(prog: &mut ProbeProgram<'_>, r: SymRef) -> Result<()> {
    let (mut data, virtual_, size) = {
        let sym = prog.sym(r);
        match &sym.value {
            SymValue::Str(s) => (s.bytes.clone(), s.virtual_, sym.ty.size()),
            _ => unreachable!("string symbol without literal"),
        }
    };
    if virtual_ {
        return Ok(());
    }

    prog.sym_mut(r).irs.stack_hint = true;
    prog.init_sym(r)?;
    data.resize(size as usize, 0);
    let off = prog.sym(r).irs.stack;
    prog.ir.emit_data(off, &data);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::opcode;
    use crate::sym::SymTable;

    fn compile(exprs: &[Expr]) -> (SymTable, ProbeOutput) {
        let mut globals = SymTable::new();
        let mut prog = ProbeProgram::new(&mut globals);
        let roots = prog
            .compile(&[&BuiltinProvider], exprs)
            .expect("compilation failed");
        let (locals, ir) = prog.finish();
        (globals, ProbeOutput { roots, locals, ir })
    }

    struct ProbeOutput {
        roots: Vec<SymRef>,
        locals: SymTable,
        ir: crate::ir::Ir,
    }

    #[test]
    fn small_numeric_folds_to_immediate() {
        let (globals, out) = compile(&[Expr::num(i32::MAX as i64)]);
        let sym = globals.get(out.roots[0].id);
        assert_eq!(sym.irs.loc, Storage::Imm);
        assert_eq!(sym.irs.imm, i32::MAX as i64);
        assert!(out.ir.insns().is_empty());
    }

    #[test]
    fn wide_numeric_needs_the_two_slot_load() {
        let value = i32::MAX as i64 + 1;
        let (globals, out) = compile(&[Expr::num(value)]);
        let sym = globals.get(out.roots[0].id);
        assert_eq!(sym.irs.loc, Storage::Reg);

        let insns = out.ir.insns();
        assert_eq!(insns.len(), 2);
        let lo = insns[0].imm as u32 as u64;
        let hi = insns[1].imm as u32 as u64;
        assert_eq!(((hi << 32) | lo) as i64, value);
    }

    #[test]
    fn unsigned_above_signed_range_is_register_loaded() {
        let (globals, out) = compile(&[Expr::unum(i32::MAX as u64 + 1)]);
        let sym = globals.get(out.roots[0].id);
        assert_eq!(sym.irs.loc, Storage::Reg);
        assert_eq!(out.ir.insns().len(), 2);
    }

    #[test]
    fn string_copies_onto_the_stack() {
        let (globals, out) = compile(&[Expr::string("0123456789")]);
        let sym = globals.get(out.roots[0].id);
        assert_eq!(sym.ty, Type::Array { len: 16 });
        assert_eq!(sym.irs.loc, Storage::Stack);
        // 16 bytes in 4-byte words.
        assert_eq!(out.ir.insns().len(), 4);
    }

    #[test]
    fn virtual_string_emits_nothing() {
        let expr = Expr::Str(crate::ast::StrLit {
            bytes: b"resident".to_vec(),
            virtual_: true,
        });
        let (_, out) = compile(&[expr]);
        assert!(out.ir.insns().is_empty());
    }

    #[test]
    fn context_is_local_and_captured_first() {
        let (_, out) = compile(&[Expr::ident("ctx"), Expr::num(i64::MAX)]);
        let ctx = out.locals.get(out.roots[0].id);
        assert_eq!(out.roots[0].scope, Scope::Local);
        assert_eq!(ctx.ty.size(), 8);
        assert_eq!(ctx.irs.loc, Storage::Reg);

        // The capture precedes the constant load.
        let insns = out.ir.insns();
        assert_eq!(insns[0].code, opcode::BPF_ALU64 | opcode::BPF_MOV | opcode::BPF_X);
        assert_eq!(insns[0].src(), Reg::R1 as u8);
    }

    #[test]
    fn bare_identifier_becomes_placeholder() {
        let (globals, out) = compile(&[Expr::ident("pid")]);
        let sym = globals.get(out.roots[0].id);
        assert!(ptr::eq(sym.builtin, &IDENT));
        assert_eq!(sym.ty, Type::Void);
    }

    #[test]
    fn unknown_call_with_args_defers() {
        let mut globals = SymTable::new();
        let mut prog = ProbeProgram::new(&mut globals);
        let expr = Expr::Call {
            name: "quantize".into(),
            args: vec![Expr::num(1)],
        };
        let err = prog.compile(&[&BuiltinProvider], &[expr]).unwrap_err();
        assert!(matches!(err, CompileError::UnknownBuiltin(name) if name == "quantize"));
    }

    #[test]
    fn ctx_rejects_arguments() {
        let mut globals = SymTable::new();
        let mut prog = ProbeProgram::new(&mut globals);
        let expr = Expr::Call {
            name: "ctx".into(),
            args: vec![Expr::num(1)],
        };
        let err = prog.compile(&[&BuiltinProvider], &[expr]).unwrap_err();
        assert!(matches!(err, CompileError::BadArity { func: "ctx", .. }));
    }
}
