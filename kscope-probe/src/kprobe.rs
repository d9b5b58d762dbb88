//! Kprobe provider: function entry and return probes.
//!
//! Supplies the probe-kind parameters of the lifecycle manager (kind
//! character and control file) and resolves the kind-specific built-ins:
//! `regs`, the typed register snapshot, and `arg0`..`arg9`, the function
//! arguments read out of the snapshot at architecture-specific offsets.

use std::ptr;

use kscope_compiler::ir::{opcode, Insn, Reg};
use kscope_compiler::sym::{Scope, SymRef, SymValue};
use kscope_compiler::types::pt_regs_type;
use kscope_compiler::{
    builtin, Builtin, CompileError, Expr, ProbeProgram, Provider, Type,
};
use kscope_platform::arg_offset;

use crate::tracefs::TraceFs;
use crate::xprobe::XProbe;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KprobeKind {
    Entry,
    Return,
}

impl KprobeKind {
    /// Kind character the control-file protocol uses.
    pub fn kind_char(self) -> char {
        match self {
            KprobeKind::Entry => 'p',
            KprobeKind::Return => 'r',
        }
    }
}

/// The register snapshot the kernel hands a kprobe program.
pub static REGS: Builtin = Builtin {
    name: "regs",
    arity: Some(0),
    ir_post: None,
};

/// Function arguments, resolved by name (`arg0`..`arg9`).
pub static ARG: Builtin = Builtin {
    name: ":arg",
    arity: Some(0),
    ir_post: Some(arg_ir_post),
};

fn is_arg(name: &str) -> bool {
    name.len() == 4 && name.starts_with("arg") && name.as_bytes()[3].is_ascii_digit()
}

pub struct KprobeProvider {
    pub kind: KprobeKind,
}

impl KprobeProvider {
    pub fn new(kind: KprobeKind) -> Self {
        KprobeProvider { kind }
    }

    /// Split a probe spec like `kprobe:sys_*` or `kretprobe:vfs_read`
    /// into provider and target pattern.
    pub fn parse(spec: &str) -> Option<(KprobeKind, &str)> {
        let (provider, pattern) = spec.split_once(':')?;
        let kind = match provider {
            "kprobe" | "k" => KprobeKind::Entry,
            "kretprobe" | "kr" => KprobeKind::Return,
            _ => return None,
        };
        Some((kind, pattern))
    }

    /// Build the lifecycle instance for one target pattern.
    pub fn instance(&self, tracefs: TraceFs, group: &str, pattern: &str) -> XProbe {
        XProbe::new(
            tracefs,
            self.kind.kind_char(),
            "kprobe_events",
            group,
            pattern,
        )
    }

    /// The `regs` local for this probe, allocating it on first use so
    /// `argN` works without the script naming `regs` itself.
    fn regs_sym(&self, prog: &mut ProbeProgram<'_>) -> SymRef {
        let existing = prog
            .locals
            .iter()
            .find(|(_, s)| s.name.as_deref() == Some("regs") && ptr::eq(s.builtin, &REGS))
            .map(|(id, _)| id);
        match existing {
            Some(id) => SymRef {
                scope: Scope::Local,
                id,
            },
            None => prog.alloc_local(
                Some("regs".to_string()),
                &REGS,
                pt_regs_type(),
                SymValue::None,
            ),
        }
    }
}

impl Provider for KprobeProvider {
    fn sym_alloc(
        &self,
        prog: &mut ProbeProgram<'_>,
        expr: &Expr,
    ) -> kscope_compiler::Result<Option<SymRef>> {
        let Expr::Call { name, args } = expr else {
            return Ok(None);
        };

        if name == "regs" {
            builtin::static_validate(&REGS, args.len())?;
            return Ok(Some(self.regs_sym(prog)));
        }

        if is_arg(name) {
            builtin::static_validate(&ARG, args.len())?;
            let index = name.as_bytes()[3] - b'0';
            if arg_offset(index).is_none() {
                return Err(CompileError::UnknownArgRegister(index));
            }
            // argN reads through the snapshot, so make sure it exists.
            self.regs_sym(prog);
            return Ok(Some(prog.alloc_local(
                Some(name.clone()),
                &ARG,
                Type::Int(kscope_compiler::IntClass::ULong),
                SymValue::None,
            )));
        }

        Ok(None)
    }

    /// Capture the register snapshot out of r1 before anything clobbers
    /// it; the entry register only holds it until the first call.
    fn ir_pre(&self, prog: &mut ProbeProgram<'_>) -> kscope_compiler::Result<()> {
        let ids: Vec<_> = prog
            .locals
            .iter()
            .filter(|(_, s)| s.name.is_some() && ptr::eq(s.builtin, &REGS))
            .map(|(id, _)| id)
            .collect();
        for id in ids {
            let r = SymRef {
                scope: Scope::Local,
                id,
            };
            prog.init_sym(r)?;
            let dst = prog
                .sym(r)
                .irs
                .reg
                .expect("register symbol without register");
            prog.ir.emit(Insn::mov_reg(dst, Reg::R1));
        }
        Ok(())
    }
}

/// Load the argument value out of the captured snapshot.
fn arg_ir_post(prog: &mut ProbeProgram<'_>, r: SymRef) -> kscope_compiler::Result<()> {
    let index = {
        let name = prog.sym(r).name.as_deref().expect("argN symbol is named");
        name.as_bytes()[3] - b'0'
    };
    let off = arg_offset(index).ok_or(CompileError::UnknownArgRegister(index))?;

    let regs_reg = prog
        .locals
        .iter()
        .find(|(_, s)| ptr::eq(s.builtin, &REGS))
        .and_then(|(_, s)| s.irs.reg)
        .expect("regs captured before argument emission");

    prog.sym_mut(r).irs.stack_hint = false;
    prog.init_sym(r)?;
    let dst = prog
        .sym(r)
        .irs
        .reg
        .expect("register symbol without register");
    prog.ir
        .emit(Insn::ldx_mem(opcode::BPF_DW, dst, regs_reg, off));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kscope_compiler::sym::Storage;
    use kscope_compiler::{BuiltinProvider, SymTable};

    fn compile(exprs: &[Expr]) -> (SymTable, kscope_compiler::Ir) {
        let mut globals = SymTable::new();
        let provider = KprobeProvider::new(KprobeKind::Entry);
        let mut prog = ProbeProgram::new(&mut globals);
        prog.compile(&[&provider, &BuiltinProvider], exprs)
            .expect("compilation failed");
        let (locals, ir) = prog.finish();
        drop(globals);
        (locals, ir)
    }

    #[test]
    fn spec_parsing() {
        assert_eq!(
            KprobeProvider::parse("kprobe:sys_*"),
            Some((KprobeKind::Entry, "sys_*"))
        );
        assert_eq!(
            KprobeProvider::parse("kretprobe:vfs_read"),
            Some((KprobeKind::Return, "vfs_read"))
        );
        assert_eq!(KprobeProvider::parse("tracepoint:sched:switch"), None);
        assert_eq!(KprobeProvider::parse("sys_read"), None);
    }

    #[test]
    fn regs_is_a_captured_local() {
        let (locals, ir) = compile(&[Expr::ident("regs")]);
        let (_, sym) = locals.iter().next().unwrap();
        assert_eq!(sym.irs.loc, Storage::Reg);

        let insns = ir.insns();
        assert_eq!(insns.len(), 1);
        assert_eq!(insns[0].src(), Reg::R1 as u8);
    }

    #[test]
    fn arg_loads_through_the_snapshot() {
        let (locals, ir) = compile(&[Expr::ident("arg1")]);
        // Implicit regs local plus the argument itself.
        assert_eq!(locals.len(), 2);

        let insns = ir.insns();
        // Capture, then the load.
        assert_eq!(insns.len(), 2);
        assert_eq!(
            insns[1].code,
            opcode::BPF_LDX | opcode::BPF_DW | opcode::BPF_MEM
        );
        assert_eq!(insns[1].off, arg_offset(1).unwrap());
    }

    #[test]
    fn out_of_range_argument_is_an_error() {
        let mut globals = SymTable::new();
        let provider = KprobeProvider::new(KprobeKind::Entry);
        let mut prog = ProbeProgram::new(&mut globals);
        let err = prog
            .compile(&[&provider, &BuiltinProvider], &[Expr::ident("arg9")])
            .unwrap_err();
        assert!(matches!(err, CompileError::UnknownArgRegister(9)));
    }

    #[test]
    fn kind_characters() {
        assert_eq!(KprobeKind::Entry.kind_char(), 'p');
        assert_eq!(KprobeKind::Return.kind_char(), 'r');
    }
}
