//! BPF instruction builder.
//!
//! Owns the instruction stream, the scratch register pool and the probe
//! stack while a probe compiles. The storage model is deliberately small:
//! scratch values live in the callee-saved registers r6-r9, aggregates in
//! frame-pointer-relative stack slots.

use crate::sym::{Storage, Sym};
use crate::{CompileError, Result};

/// Kernel-imposed probe stack limit, in bytes below the frame pointer.
const STACK_LIMIT: i16 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    R0 = 0,
    R1 = 1,
    R2 = 2,
    R3 = 3,
    R4 = 4,
    R5 = 5,
    R6 = 6,
    R7 = 7,
    R8 = 8,
    R9 = 9,
    /// Frame pointer, read-only.
    R10 = 10,
}

pub mod opcode {
    pub const BPF_LD: u8 = 0x00;
    pub const BPF_LDX: u8 = 0x01;
    pub const BPF_ST: u8 = 0x02;
    pub const BPF_STX: u8 = 0x03;
    pub const BPF_ALU64: u8 = 0x07;
    pub const BPF_JMP: u8 = 0x05;

    pub const BPF_W: u8 = 0x00;
    pub const BPF_H: u8 = 0x08;
    pub const BPF_B: u8 = 0x10;
    pub const BPF_DW: u8 = 0x18;

    pub const BPF_IMM: u8 = 0x00;
    pub const BPF_MEM: u8 = 0x60;

    pub const BPF_K: u8 = 0x00;
    pub const BPF_X: u8 = 0x08;

    pub const BPF_MOV: u8 = 0xb0;
    pub const BPF_EXIT: u8 = 0x90;
}

/// One 8-byte VM instruction. `regs` packs the destination register in
/// the low nibble and the source register in the high nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct Insn {
    pub code: u8,
    pub regs: u8,
    pub off: i16,
    pub imm: i32,
}

impl Insn {
    pub fn new(code: u8, dst: Reg, src: Reg, off: i16, imm: i32) -> Self {
        Insn {
            code,
            regs: ((src as u8) << 4) | (dst as u8),
            off,
            imm,
        }
    }

    pub fn dst(&self) -> u8 {
        self.regs & 0x0f
    }

    pub fn src(&self) -> u8 {
        self.regs >> 4
    }

    /// `dst = src` (64-bit register move).
    pub fn mov_reg(dst: Reg, src: Reg) -> Self {
        Insn::new(
            opcode::BPF_ALU64 | opcode::BPF_MOV | opcode::BPF_X,
            dst,
            src,
            0,
            0,
        )
    }

    /// `dst = imm` (sign-extended 32-bit immediate).
    pub fn mov_imm(dst: Reg, imm: i32) -> Self {
        Insn::new(
            opcode::BPF_ALU64 | opcode::BPF_MOV | opcode::BPF_K,
            dst,
            Reg::R0,
            0,
            imm,
        )
    }

    /// `dst = *(size *)(src + off)`.
    pub fn ldx_mem(size: u8, dst: Reg, src: Reg, off: i16) -> Self {
        Insn::new(opcode::BPF_LDX | size | opcode::BPF_MEM, dst, src, off, 0)
    }

    /// `*(size *)(dst + off) = src`.
    pub fn stx_mem(size: u8, dst: Reg, src: Reg, off: i16) -> Self {
        Insn::new(opcode::BPF_STX | size | opcode::BPF_MEM, dst, src, off, 0)
    }

    /// `*(size *)(dst + off) = imm`.
    pub fn st_mem(size: u8, dst: Reg, off: i16, imm: i32) -> Self {
        Insn::new(opcode::BPF_ST | size | opcode::BPF_MEM, dst, Reg::R0, off, imm)
    }

    pub fn exit() -> Self {
        Insn::new(opcode::BPF_JMP | opcode::BPF_EXIT, Reg::R0, Reg::R0, 0, 0)
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let mut b = [0u8; 8];
        b[0] = self.code;
        b[1] = self.regs;
        b[2..4].copy_from_slice(&self.off.to_le_bytes());
        b[4..8].copy_from_slice(&self.imm.to_le_bytes());
        b
    }
}

#[derive(Debug, Default)]
pub struct Ir {
    insns: Vec<Insn>,
    /// Next free frame-pointer-relative stack offset; grows down from 0.
    sp: i16,
    /// Scratch pool r6-r9; r0-r5 are clobbered by calls and r10 is the
    /// frame pointer.
    next_reg: u8,
}

impl Ir {
    pub fn new() -> Self {
        Ir {
            insns: Vec::new(),
            sp: 0,
            next_reg: Reg::R6 as u8,
        }
    }

    pub fn insns(&self) -> &[Insn] {
        &self.insns
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.insns.len() * 8);
        for insn in &self.insns {
            out.extend_from_slice(&insn.to_bytes());
        }
        out
    }

    pub fn alloc_reg(&mut self) -> Result<Reg> {
        let reg = match self.next_reg {
            6 => Reg::R6,
            7 => Reg::R7,
            8 => Reg::R8,
            9 => Reg::R9,
            _ => return Err(CompileError::RegisterExhausted),
        };
        self.next_reg += 1;
        Ok(reg)
    }

    /// Reserve a stack slot of `size` bytes, 8-byte aligned, and return
    /// its frame-pointer-relative offset.
    pub fn alloc_stack(&mut self, size: u64) -> Result<i16> {
        let aligned = (size + 7) & !7;
        let avail = (STACK_LIMIT + self.sp) as u64;
        if aligned > avail {
            return Err(CompileError::StackExhausted {
                need: aligned,
                avail,
            });
        }
        self.sp -= aligned as i16;
        Ok(self.sp)
    }

    /// Allocate storage for a symbol according to its type and hints.
    /// Aggregates and stack-hinted values get a slot; everything else a
    /// scratch register. Idempotent for already-placed symbols.
    pub fn init_sym(&mut self, sym: &mut Sym) -> Result<()> {
        if sym.irs.loc != Storage::Unallocated {
            return Ok(());
        }
        sym.irs.size = sym.ty.size();
        if sym.irs.stack_hint || sym.ty.is_aggregate() {
            sym.irs.stack = self.alloc_stack(sym.irs.size)?;
            sym.irs.loc = Storage::Stack;
        } else {
            sym.irs.reg = Some(self.alloc_reg()?);
            sym.irs.loc = Storage::Reg;
        }
        Ok(())
    }

    pub fn emit(&mut self, insn: Insn) {
        self.insns.push(insn);
    }

    /// Load a full 64-bit constant into `dst` using the VM's two-slot
    /// encoding: the `lddw` instruction carries the low 32 bits and is
    /// structurally paired with a continuation slot whose only meaningful
    /// field is the high 32 bits. The pair must never be separated or
    /// reordered.
    pub fn emit_lddw(&mut self, dst: Reg, value: u64) {
        self.emit(Insn::new(
            opcode::BPF_LD | opcode::BPF_DW | opcode::BPF_IMM,
            dst,
            Reg::R0,
            0,
            value as u32 as i32,
        ));
        self.emit(Insn {
            code: 0,
            regs: 0,
            off: 0,
            imm: (value >> 32) as u32 as i32,
        });
    }

    /// Store a static data blob into the stack slot at `off`, word by
    /// word. Callers hand in storage-sized buffers (zero padded), so the
    /// blob always covers whole words.
    pub fn emit_data(&mut self, off: i16, data: &[u8]) {
        let mut pos = 0usize;
        for chunk in data.chunks(4) {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            self.emit(Insn::st_mem(
                opcode::BPF_W,
                Reg::R10,
                off + pos as i16,
                i32::from_le_bytes(word),
            ));
            pos += 4;
        }
    }

    /// Snapshot `src` into the symbol's storage.
    pub fn emit_reg_to_sym(&mut self, sym: &Sym, src: Reg) {
        match sym.irs.loc {
            Storage::Reg => {
                let dst = sym.irs.reg.expect("register symbol without register");
                self.emit(Insn::mov_reg(dst, src));
            }
            Storage::Stack => {
                self.emit(Insn::stx_mem(opcode::BPF_DW, Reg::R10, src, sym.irs.stack));
            }
            Storage::Unallocated | Storage::Imm => {
                unreachable!("register copy into unallocated storage")
            }
        }
    }

    /// Close the instruction stream: programs return 0.
    pub fn finalize(&mut self) {
        self.emit(Insn::mov_imm(Reg::R0, 0));
        self.emit(Insn::exit());
    }
}
