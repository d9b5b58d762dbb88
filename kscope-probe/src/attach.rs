//! Binding concrete kernel events to monitored streams.

use std::fs;
use std::io;
use std::os::fd::{AsFd, OwnedFd};
use std::path::Path;

use tracing::debug;

use kscope_loader::syscall::{
    perf_event_enable, perf_event_open, perf_event_set_bpf, PerfEventAttr, PERF_FLAG_FD_CLOEXEC,
    PERF_TYPE_TRACEPOINT,
};

/// Seam between the lifecycle state machine and the perf layer. One call
/// per concrete event, in glob order.
pub trait EventOpener {
    fn open(&mut self, event_dir: &Path) -> io::Result<OwnedFd>;
}

/// Production opener: reads the tracepoint id the kernel assigned to the
/// event, opens a monitored stream for it, installs the compiled program
/// and enables the event.
pub struct PerfOpener<'p> {
    prog: std::os::fd::BorrowedFd<'p>,
    pid: libc::pid_t,
    cpu: libc::c_int,
}

impl<'p> PerfOpener<'p> {
    /// Monitor every process on every CPU.
    pub fn new(prog: std::os::fd::BorrowedFd<'p>) -> Self {
        PerfOpener {
            prog,
            pid: -1,
            cpu: 0,
        }
    }

    pub fn with_target(prog: std::os::fd::BorrowedFd<'p>, pid: libc::pid_t) -> Self {
        PerfOpener { prog, pid, cpu: 0 }
    }
}

impl EventOpener for PerfOpener<'_> {
    fn open(&mut self, event_dir: &Path) -> io::Result<OwnedFd> {
        let id_path = event_dir.join("id");
        let id: u64 = fs::read_to_string(&id_path)?
            .trim()
            .parse()
            .map_err(|e| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("bad event id in {}: {e}", id_path.display()),
                )
            })?;

        let mut attr = PerfEventAttr::zeroed();
        attr.type_ = PERF_TYPE_TRACEPOINT;
        attr.config = id;
        attr.sample_period = 1;
        attr.wakeup_events = 1;

        let event = perf_event_open(&attr, self.pid, self.cpu, -1, PERF_FLAG_FD_CLOEXEC)?;
        perf_event_set_bpf(event.as_fd(), self.prog)?;
        perf_event_enable(event.as_fd())?;
        debug!(event = %event_dir.display(), id, "event stream opened");
        Ok(event)
    }
}
