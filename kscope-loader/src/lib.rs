//! Kernel syscall gateway.
//!
//! Owns no state: every call is synchronous, returns a descriptor or the
//! underlying OS error, and each successful call hands the caller one
//! kernel resource to close. The program front-end adds a single
//! convenience on top of the raw wrappers: a failed load is retried once
//! with a verifier log buffer so the rejection reason can travel with the
//! error.

pub mod map;
pub mod syscall;

use std::os::fd::OwnedFd;

use tracing::{debug, error};

pub use map::Map;
pub use syscall::{kernel_version, MapType, ProgType};

/// Verifier log capacity for diagnosing rejected programs.
const VLOG_SIZE: usize = 1 << 20;

#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error("bpf syscall failed: {0}")]
    Os(#[from] std::io::Error),

    #[error("program rejected by verifier: {log}")]
    Verifier {
        log: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, LoaderError>;

/// Load a finished instruction stream and return the program descriptor.
pub fn load_program(prog_type: ProgType, insns: &[u8]) -> Result<OwnedFd> {
    let kver = syscall::kernel_version();
    debug!(
        insn_cnt = insns.len() / 8,
        ?prog_type,
        "loading probe program"
    );

    match syscall::bpf_prog_load(prog_type, insns, kver, None) {
        Ok(fd) => Ok(fd),
        Err(first_err) => {
            // Reload with a log buffer so the verifier can tell us why.
            let mut vlog = vec![0u8; VLOG_SIZE];
            match syscall::bpf_prog_load(prog_type, insns, kver, Some(&mut vlog)) {
                Ok(fd) => Ok(fd),
                Err(_) => {
                    let end = vlog.iter().position(|&b| b == 0).unwrap_or(vlog.len());
                    let log = String::from_utf8_lossy(&vlog[..end]).into_owned();
                    error!(%first_err, "program load failed");
                    Err(LoaderError::Verifier {
                        log,
                        source: first_err,
                    })
                }
            }
        }
    }
}
