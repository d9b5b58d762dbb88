//! The probe instance state machine.
//!
//! One `XProbe` is one activation of a user pattern:
//! open the control file, write one definition line per concrete target,
//! glob the kernel-created events back out of the tracefs tree, and open
//! one monitored stream per event. Detach reverses the sequence: streams
//! close first, then a removal line per still-registered event, then the
//! control file.

use std::fs::File;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicU64, Ordering};

use globset::GlobBuilder;
use tracing::{debug, info, warn};

use crate::attach::EventOpener;
use crate::ctrl::ControlWriter;
use crate::ksyms::KernelSymbols;
use crate::tracefs::TraceFs;
use crate::{ProbeError, Result};

/// Process-wide instance sequence. Concurrent probe instances share the
/// kernel control file, so stems must be collision-free without any
/// coordination between them.
static INSTANCE_SEQ: AtomicU64 = AtomicU64::new(1);

/// Characters that trigger expansion against the kernel symbol table.
const GLOB_META: &[char] = &['?', '*', '[', '!', '@'];

pub struct XProbe {
    kind: char,
    ctrl_name: &'static str,
    pattern: String,
    group: String,
    tracefs: TraceFs,
    /// `<kind>:<group>/p<id>_`, unique to this instance.
    stem: String,
    /// `p<id>_`, the event-directory prefix the stem produces.
    prefix: String,
    ctrl: Option<ControlWriter<File>>,
    n_evs: usize,
    ev_fds: Vec<OwnedFd>,
}

impl XProbe {
    pub fn new(
        tracefs: TraceFs,
        kind: char,
        ctrl_name: &'static str,
        group: &str,
        pattern: &str,
    ) -> Self {
        let id = INSTANCE_SEQ.fetch_add(1, Ordering::Relaxed);
        let prefix = format!("p{id:x}_");
        let stem = format!("{kind}:{group}/{prefix}");
        XProbe {
            kind,
            ctrl_name,
            pattern: pattern.to_string(),
            group: group.to_string(),
            tracefs,
            stem,
            prefix,
            ctrl: None,
            n_evs: 0,
            ev_fds: Vec::new(),
        }
    }

    pub fn stem(&self) -> &str {
        &self.stem
    }

    pub fn kind(&self) -> char {
        self.kind
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Number of concrete kernel events this instance expanded into.
    pub fn event_count(&self) -> usize {
        self.n_evs
    }

    /// Open event streams, index-aligned with the glob-sorted event
    /// list.
    pub fn streams(&self) -> &[OwnedFd] {
        &self.ev_fds
    }

    pub fn attached(&self) -> bool {
        !self.ev_fds.is_empty()
    }

    /// Drive the instance to the attached state: open the control file,
    /// write the probe definitions, recover the kernel's event list and
    /// open one stream per event.
    ///
    /// On failure after the control file opened, already-created
    /// definitions and streams are left in place; call `detach` to clean
    /// them up.
    pub fn attach(
        &mut self,
        ksyms: Option<&KernelSymbols>,
        opener: &mut dyn EventOpener,
    ) -> Result<()> {
        let file = self.tracefs.open_ctrl(self.ctrl_name)?;
        self.ctrl = Some(ControlWriter::new(file));

        self.create(ksyms)?;
        self.open_streams(opener)?;

        info!(
            stem = %self.stem,
            events = self.n_evs,
            "probe attached"
        );
        Ok(())
    }

    /// Write one definition line per concrete probe target. A wildcard
    /// pattern expands against the symbol table; otherwise the raw
    /// pattern is both the generated name and the target.
    fn create(&mut self, ksyms: Option<&KernelSymbols>) -> Result<()> {
        let ctrl = self.ctrl.as_mut().expect("control file not open");

        match ksyms {
            Some(ksyms) if self.pattern.contains(GLOB_META) => {
                let matcher = GlobBuilder::new(&self.pattern)
                    .build()
                    .map_err(|source| ProbeError::Pattern {
                        pattern: self.pattern.clone(),
                        source,
                    })?
                    .compile_matcher();

                for sym in ksyms.iter() {
                    if !matcher.is_match(sym) {
                        continue;
                    }
                    ctrl.write_line(&format!("{}{sym} {sym}\n", self.stem))?;
                    self.n_evs += 1;
                }
                debug!(
                    pattern = %self.pattern,
                    matches = self.n_evs,
                    "expanded wildcard pattern"
                );
            }
            _ => {
                ctrl.write_line(&format!("{}{} {}\n", self.stem, self.pattern, self.pattern))?;
                self.n_evs += 1;
            }
        }

        ctrl.flush()?;
        Ok(())
    }

    /// Glob the events the kernel created for this stem and open a
    /// stream per event, in glob order. The expansion count must equal
    /// the definition count; the kernel is the sole event-name
    /// authority, so a disagreement means we would be operating on the
    /// wrong event set.
    fn open_streams(&mut self, opener: &mut dyn EventOpener) -> Result<()> {
        let paths = self.tracefs.glob_events(&self.group, &self.prefix)?;
        if paths.len() != self.n_evs {
            return Err(ProbeError::EventCountMismatch {
                expected: self.n_evs,
                found: paths.len(),
            });
        }

        for path in &paths {
            let fd = opener.open(path)?;
            self.ev_fds.push(fd);
        }
        Ok(())
    }

    /// Tear the instance down: close every stream, re-glob the
    /// authoritative event list, write one removal line per event, close
    /// the control file last. A probe that never opened the control file
    /// detaches as a successful no-op, so calling this twice is safe.
    pub fn detach(&mut self) -> Result<()> {
        if self.ctrl.is_none() {
            return Ok(());
        }

        // Streams first; a monitored stream holds the event live.
        self.ev_fds.clear();

        let paths = self.tracefs.glob_events(&self.group, &self.prefix)?;
        if paths.len() != self.n_evs {
            warn!(
                stem = %self.stem,
                expected = self.n_evs,
                found = paths.len(),
                "event set changed underneath the probe"
            );
            return Err(ProbeError::EventCountMismatch {
                expected: self.n_evs,
                found: paths.len(),
            });
        }

        let ctrl = self.ctrl.as_mut().expect("control file not open");
        for path in &paths {
            ctrl.write_line(&format!("-:{}\n", self.tracefs.event_name(path)))?;
        }
        ctrl.flush()?;

        self.ctrl = None;
        info!(stem = %self.stem, "probe detached");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io;
    use std::path::{Path, PathBuf};

    /// Opens the event directory itself; good enough to hold a real
    /// descriptor per event without a kernel.
    struct DirOpener {
        opened: Vec<PathBuf>,
        fail_at: Option<usize>,
    }

    impl DirOpener {
        fn new() -> Self {
            DirOpener {
                opened: Vec::new(),
                fail_at: None,
            }
        }
    }

    impl EventOpener for DirOpener {
        fn open(&mut self, event_dir: &Path) -> io::Result<OwnedFd> {
            if self.fail_at == Some(self.opened.len()) {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "injected"));
            }
            self.opened.push(event_dir.to_path_buf());
            Ok(File::open(event_dir)?.into())
        }
    }

    const GROUP: &str = "kscope_test";

    fn fake_tracefs() -> (tempfile::TempDir, TraceFs) {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("events").join(GROUP)).unwrap();
        fs::write(tmp.path().join("kprobe_events"), b"").unwrap();
        let tfs = TraceFs::at(tmp.path());
        (tmp, tfs)
    }

    /// Stand in for the kernel: create the event directory each
    /// definition line would produce.
    fn materialize_events(tfs: &TraceFs, probe: &XProbe, names: &[&str]) {
        for name in names {
            let stem_name = format!("{}{}", probe.stem().split('/').nth(1).unwrap(), name);
            fs::create_dir_all(
                tfs.root()
                    .join("events")
                    .join(GROUP)
                    .join(stem_name),
            )
            .unwrap();
        }
    }

    fn ctrl_contents(tfs: &TraceFs) -> String {
        fs::read_to_string(tfs.root().join("kprobe_events")).unwrap()
    }

    #[test]
    fn plain_pattern_creates_one_event() {
        let (_tmp, tfs) = fake_tracefs();
        let mut probe = XProbe::new(tfs.clone(), 'p', "kprobe_events", GROUP, "sys_close");
        materialize_events(&tfs, &probe, &["sys_close"]);

        let mut opener = DirOpener::new();
        probe.attach(None, &mut opener).unwrap();

        assert_eq!(probe.event_count(), 1);
        assert_eq!(probe.streams().len(), 1);
        assert_eq!(
            ctrl_contents(&tfs),
            format!("{}sys_close sys_close\n", probe.stem())
        );
    }

    #[test]
    fn wildcard_expands_against_the_symbol_table() {
        let (_tmp, tfs) = fake_tracefs();
        let ksyms = KernelSymbols::new(["sys_open", "sys_openat", "sys_close"]);
        let mut probe = XProbe::new(tfs.clone(), 'p', "kprobe_events", GROUP, "sys_*open*");
        materialize_events(&tfs, &probe, &["sys_open", "sys_openat"]);

        let mut opener = DirOpener::new();
        probe.attach(Some(&ksyms), &mut opener).unwrap();

        assert_eq!(probe.event_count(), 2);
        assert_eq!(probe.streams().len(), 2);
        // Streams are bound in glob (lexicographic) order.
        let opened: Vec<String> = opener
            .opened
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(opened[0].ends_with("sys_open"));
        assert!(opened[1].ends_with("sys_openat"));
    }

    #[test]
    fn wildcard_without_symbols_falls_back_to_a_single_line() {
        let (_tmp, tfs) = fake_tracefs();
        let mut probe = XProbe::new(tfs.clone(), 'p', "kprobe_events", GROUP, "sys_*");
        materialize_events(&tfs, &probe, &["sys_*"]);

        let mut opener = DirOpener::new();
        probe.attach(None, &mut opener).unwrap();
        assert_eq!(probe.event_count(), 1);
    }

    #[test]
    fn event_count_mismatch_is_fatal() {
        let (_tmp, tfs) = fake_tracefs();
        let ksyms = KernelSymbols::new(["sys_open", "sys_openat"]);
        let mut probe = XProbe::new(tfs.clone(), 'p', "kprobe_events", GROUP, "sys_open*");
        // The kernel "created" only one of the two requested events.
        materialize_events(&tfs, &probe, &["sys_open"]);

        let mut opener = DirOpener::new();
        let err = probe.attach(Some(&ksyms), &mut opener).unwrap_err();
        assert!(matches!(
            err,
            ProbeError::EventCountMismatch {
                expected: 2,
                found: 1
            }
        ));
    }

    #[test]
    fn failed_stream_open_leaves_earlier_streams_for_detach() {
        let (_tmp, tfs) = fake_tracefs();
        let ksyms = KernelSymbols::new(["sys_open", "sys_openat"]);
        let mut probe = XProbe::new(tfs.clone(), 'p', "kprobe_events", GROUP, "sys_open*");
        materialize_events(&tfs, &probe, &["sys_open", "sys_openat"]);

        let mut opener = DirOpener::new();
        opener.fail_at = Some(1);
        let err = probe.attach(Some(&ksyms), &mut opener).unwrap_err();
        assert!(matches!(err, ProbeError::Io(_)));
        assert_eq!(probe.streams().len(), 1);

        // Cleanup path still works.
        probe.detach().unwrap();
        assert!(probe.streams().is_empty());
    }

    #[test]
    fn detach_round_trip_removes_every_definition() {
        let (_tmp, tfs) = fake_tracefs();
        let ksyms = KernelSymbols::new(["sys_open", "sys_openat", "sys_close"]);
        let mut probe = XProbe::new(tfs.clone(), 'p', "kprobe_events", GROUP, "sys_*open*");
        materialize_events(&tfs, &probe, &["sys_open", "sys_openat"]);

        let mut opener = DirOpener::new();
        probe.attach(Some(&ksyms), &mut opener).unwrap();
        probe.detach().unwrap();

        assert!(probe.streams().is_empty());
        let contents = ctrl_contents(&tfs);
        let removals: Vec<&str> = contents
            .lines()
            .filter(|l| l.starts_with("-:"))
            .collect();
        assert_eq!(removals.len(), 2);
        for line in &removals {
            assert!(line.starts_with(&format!("-:{GROUP}/")));
        }

        // Apply the removals the way the kernel would, then verify the
        // stem has no residual events.
        for line in removals {
            let name = line.trim_start_matches("-:");
            fs::remove_dir_all(tfs.root().join("events").join(name)).unwrap();
        }
        let leftover = tfs
            .glob_events(GROUP, probe.stem().split('/').nth(1).unwrap())
            .unwrap();
        assert!(leftover.is_empty());
    }

    #[test]
    fn detach_is_idempotent() {
        let (_tmp, tfs) = fake_tracefs();
        let mut probe = XProbe::new(tfs.clone(), 'p', "kprobe_events", GROUP, "sys_close");
        materialize_events(&tfs, &probe, &["sys_close"]);

        let mut opener = DirOpener::new();
        probe.attach(None, &mut opener).unwrap();
        probe.detach().unwrap();
        // Second detach: control file already closed, no-op success.
        probe.detach().unwrap();
    }

    #[test]
    fn detach_before_attach_is_a_no_op() {
        let (_tmp, tfs) = fake_tracefs();
        let mut probe = XProbe::new(tfs, 'p', "kprobe_events", GROUP, "sys_close");
        probe.detach().unwrap();
    }

    #[test]
    fn stems_are_collision_free() {
        let (_tmp, tfs) = fake_tracefs();
        let a = XProbe::new(tfs.clone(), 'p', "kprobe_events", GROUP, "sys_open");
        let b = XProbe::new(tfs, 'p', "kprobe_events", GROUP, "sys_open");
        assert_ne!(a.stem(), b.stem());
    }
}
