//! kscope: compile tiny trace programs and drive kernel probes with
//! them.
//!
//! The session owns what outlives any single probe: the global symbol
//! table literals land in, the probe group name, and the kernel symbol
//! view used for wildcard expansion. Probes are compiled up front and
//! then attached and detached as a set.

pub mod config;
pub mod logging;
pub mod session;

pub use config::{LogLevel, Settings};
pub use session::{Session, TraceProbe};
