//! Platform-specific register layout for probe argument access.
//!
//! Probes receive a pointer to the kernel's register snapshot; this crate
//! maps "the Nth function argument" and "the program counter" to byte
//! offsets inside that snapshot for the supported architectures.
pub mod register_mapping;

pub use register_mapping::{arg_offset, pc_offset, MAX_REG_ARGS};
