//! Tracefs paths: the control files and the events tree.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::Result;

/// Well-known tracefs mount points, newest first.
const ROOTS: &[&str] = &["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];

#[derive(Debug, Clone)]
pub struct TraceFs {
    root: PathBuf,
}

impl TraceFs {
    /// First mounted tracefs root on this system.
    pub fn discover() -> io::Result<Self> {
        for root in ROOTS {
            if Path::new(root).is_dir() {
                debug!(root, "using tracefs");
                return Ok(TraceFs { root: root.into() });
            }
        }
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            "no tracefs mount found",
        ))
    }

    /// Use an explicit root (configuration override, tests).
    pub fn at(root: impl Into<PathBuf>) -> Self {
        TraceFs { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Open a dynamic-probe control file in append mode.
    pub fn open_ctrl(&self, name: &str) -> io::Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.root.join(name))
    }

    /// Expand `events/<group>/<prefix>*`. The sorted expansion order is
    /// the sole source of index alignment between probe definitions and
    /// their event streams.
    pub fn glob_events(&self, group: &str, prefix: &str) -> Result<Vec<PathBuf>> {
        let pattern = format!(
            "{}/events/{}/{}*",
            self.root.display(),
            group,
            prefix
        );
        let mut paths = Vec::new();
        for entry in glob::glob(&pattern)? {
            paths.push(entry.map_err(|e| e.into_error())?);
        }
        Ok(paths)
    }

    /// `events/<group>/<name>` path back to the `<group>/<name>` form the
    /// control file expects in removal lines.
    pub fn event_name(&self, path: &Path) -> String {
        let events = self.root.join("events");
        let rel = path.strip_prefix(&events).unwrap_or(path);
        rel.to_string_lossy().into_owned()
    }
}
