//! Session: probe orchestration across the compiler, loader and
//! lifecycle manager.

use std::os::fd::{AsFd, OwnedFd};

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

use kscope_compiler::{BuiltinProvider, Expr, Ir, ProbeProgram, SymTable};
use kscope_loader::{load_program, Map, ProgType};
use kscope_probe::{KernelSymbols, KprobeKind, KprobeProvider, PerfOpener, TraceFs, XProbe};

/// One compiled probe: its lifecycle instance, its finished instruction
/// stream, and (after attach) the loaded program descriptor.
pub struct TraceProbe {
    spec: String,
    kind: KprobeKind,
    xprobe: XProbe,
    locals: SymTable,
    ir: Ir,
    prog: Option<OwnedFd>,
}

impl TraceProbe {
    pub fn spec(&self) -> &str {
        &self.spec
    }

    pub fn kind(&self) -> KprobeKind {
        self.kind
    }

    pub fn xprobe(&self) -> &XProbe {
        &self.xprobe
    }

    /// Mutable lifecycle access for schedulers that drive attach and
    /// detach per probe instead of through the session.
    pub fn xprobe_mut(&mut self) -> &mut XProbe {
        &mut self.xprobe
    }

    pub fn locals(&self) -> &SymTable {
        &self.locals
    }

    pub fn ir(&self) -> &Ir {
        &self.ir
    }
}

pub struct Session {
    group: String,
    tracefs: TraceFs,
    ksyms: Option<KernelSymbols>,
    pub globals: SymTable,
    probes: Vec<TraceProbe>,
    /// Per-CPU event transport the scheduler drains; created at attach.
    events: Option<Map>,
}

impl Session {
    pub fn new(tracefs: TraceFs) -> Self {
        // One group per process; stems disambiguate instances within it.
        let group = format!("kscope{}", std::process::id());
        Session {
            group,
            tracefs,
            ksyms: None,
            globals: SymTable::new(),
            probes: Vec::new(),
            events: None,
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Install the pre-built kernel symbol view used for wildcard
    /// expansion. Without it, wildcard patterns fall back to verbatim
    /// definitions.
    pub fn with_ksyms(mut self, ksyms: KernelSymbols) -> Self {
        self.ksyms = Some(ksyms);
        self
    }

    /// Compile one probe: parse the spec into a provider, resolve and
    /// emit the expressions, and stage the lifecycle instance.
    pub fn add_probe(&mut self, spec: &str, exprs: &[Expr]) -> Result<usize> {
        let (kind, pattern) =
            KprobeProvider::parse(spec).with_context(|| format!("unsupported probe spec {spec:?}"))?;
        let provider = KprobeProvider::new(kind);

        let mut prog = ProbeProgram::new(&mut self.globals);
        prog.compile(&[&provider, &BuiltinProvider], exprs)
            .with_context(|| format!("compiling probe {spec:?}"))?;
        let (locals, mut ir) = prog.finish();
        ir.finalize();

        let xprobe = provider.instance(self.tracefs.clone(), &self.group, pattern);
        debug!(spec, stem = xprobe.stem(), "probe compiled");

        self.probes.push(TraceProbe {
            spec: spec.to_string(),
            kind,
            xprobe,
            locals,
            ir,
            prog: None,
        });
        Ok(self.probes.len() - 1)
    }

    pub fn probes(&self) -> &[TraceProbe] {
        &self.probes
    }

    pub fn probe_mut(&mut self, index: usize) -> &mut TraceProbe {
        &mut self.probes[index]
    }

    /// The per-CPU event transport, once the session is attached.
    pub fn event_map(&self) -> Option<&Map> {
        self.events.as_ref()
    }

    /// Load every compiled program and attach every probe. On failure
    /// the session is left partially attached; `detach` cleans up
    /// whatever got as far as the control file.
    pub fn attach(&mut self) -> Result<()> {
        if self.events.is_none() {
            let nr_cpus = possible_cpus();
            self.events = Some(
                Map::perf_event_array(nr_cpus).context("creating the event transport map")?,
            );
        }

        for probe in &mut self.probes {
            let fd = load_program(ProgType::Kprobe, &probe.ir.to_bytes())
                .with_context(|| format!("loading program for {:?}", probe.spec))?;

            let mut opener = PerfOpener::new(fd.as_fd());
            probe
                .xprobe
                .attach(self.ksyms.as_ref(), &mut opener)
                .with_context(|| format!("attaching {:?}", probe.spec))?;
            probe.prog = Some(fd);
        }

        info!(probes = self.probes.len(), group = %self.group, "session attached");
        Ok(())
    }

    /// Detach every probe, keeping going past failures so one stuck
    /// probe cannot leak the others' definitions, then drop the loaded
    /// programs.
    pub fn detach(&mut self) -> Result<()> {
        let mut first_err = None;
        for probe in &mut self.probes {
            if let Err(e) = probe.xprobe.detach() {
                first_err.get_or_insert(e);
            }
            probe.prog = None;
        }
        self.events = None;

        if let Some(e) = first_err {
            bail!("detach left kernel state behind: {e}");
        }
        info!(group = %self.group, "session detached");
        Ok(())
    }
}

fn possible_cpus() -> u32 {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
    if n > 0 {
        n as u32
    } else {
        1
    }
}
