//! Dynamic probe lifecycle management.
//!
//! A probe instance turns a user pattern into concrete kernel probe
//! definitions through the tracefs control file, recovers the resulting
//! event set by globbing the events tree, and binds each event to a
//! monitored stream. Teardown runs the same path in reverse: streams
//! close before the definitions are removed.

pub mod attach;
pub mod ctrl;
pub mod kprobe;
pub mod ksyms;
pub mod tracefs;
pub mod xprobe;

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad probe pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    #[error("event glob failed: {0}")]
    Glob(#[from] glob::PatternError),

    /// The kernel exposed a different event set than this instance
    /// defined. There is no safe way to continue operating on the probe;
    /// callers must treat this as fatal.
    #[error("kernel exposed {found} events for a probe that defined {expected}")]
    EventCountMismatch { expected: usize, found: usize },
}

pub type Result<T> = std::result::Result<T, ProbeError>;

pub use attach::{EventOpener, PerfOpener};
pub use ctrl::ControlWriter;
pub use kprobe::{KprobeKind, KprobeProvider};
pub use ksyms::KernelSymbols;
pub use tracefs::TraceFs;
pub use xprobe::XProbe;
