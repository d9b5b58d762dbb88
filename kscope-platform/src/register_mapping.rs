//! pt_regs byte offsets per architecture.

/// x86_64 System V: integer arguments arrive in rdi, rsi, rdx, rcx, r8,
/// r9. Offsets are computed from the kernel's pt_regs layout rather than
/// hard-coded.
#[cfg(target_arch = "x86_64")]
mod arch {
    use aya_ebpf_bindings::bindings::pt_regs;
    use core::mem::offset_of;

    pub const MAX_REG_ARGS: u8 = 6;

    const ARG_OFFSETS: [usize; 6] = [
        offset_of!(pt_regs, rdi),
        offset_of!(pt_regs, rsi),
        offset_of!(pt_regs, rdx),
        offset_of!(pt_regs, rcx),
        offset_of!(pt_regs, r8),
        offset_of!(pt_regs, r9),
    ];

    pub fn arg_offset(n: u8) -> Option<i16> {
        ARG_OFFSETS.get(n as usize).map(|&off| off as i16)
    }

    pub fn pc_offset() -> i16 {
        offset_of!(pt_regs, rip) as i16
    }
}

/// aarch64: x0-x7 carry the integer arguments and live in the regs array
/// at the head of pt_regs; pc sits behind the 31 general registers and
/// sp.
#[cfg(target_arch = "aarch64")]
mod arch {
    pub const MAX_REG_ARGS: u8 = 8;

    pub fn arg_offset(n: u8) -> Option<i16> {
        if n < MAX_REG_ARGS {
            Some(n as i16 * 8)
        } else {
            None
        }
    }

    pub fn pc_offset() -> i16 {
        32 * 8
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
mod arch {
    pub const MAX_REG_ARGS: u8 = 0;

    pub fn arg_offset(_n: u8) -> Option<i16> {
        None
    }

    pub fn pc_offset() -> i16 {
        0
    }
}

pub use arch::MAX_REG_ARGS;

/// Byte offset of the Nth argument register inside pt_regs, or `None`
/// when the argument is not passed in a register on this architecture.
pub fn arg_offset(n: u8) -> Option<i16> {
    arch::arg_offset(n)
}

/// Byte offset of the program counter inside pt_regs.
pub fn pc_offset() -> i16 {
    arch::pc_offset()
}
