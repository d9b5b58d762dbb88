//! Thin, allocation-free wrappers around the raw kernel calls.
//!
//! Every request structure here is built from all-zero bytes before its
//! fields are populated: kernel-side validation rejects requests whose
//! unused fields or padding are non-zero. Failures surface as the raw OS
//! error; retry policy belongs to callers.

use std::io;
use std::os::fd::{BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::OnceLock;

use tracing::debug;

/// bpf(2) command numbers.
const BPF_MAP_CREATE: libc::c_int = 0;
const BPF_MAP_LOOKUP_ELEM: libc::c_int = 1;
const BPF_MAP_UPDATE_ELEM: libc::c_int = 2;
const BPF_MAP_DELETE_ELEM: libc::c_int = 3;
const BPF_MAP_GET_NEXT_KEY: libc::c_int = 4;
const BPF_PROG_LOAD: libc::c_int = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ProgType {
    SocketFilter = 1,
    Kprobe = 2,
    Tracepoint = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MapType {
    Hash = 1,
    Array = 2,
    PerfEventArray = 4,
}

/// Program-load arm of the bpf(2) request union.
#[repr(C)]
#[derive(Clone, Copy)]
struct ProgLoadAttr {
    prog_type: u32,
    insn_cnt: u32,
    insns: u64,
    license: u64,
    log_level: u32,
    log_size: u32,
    log_buf: u64,
    kern_version: u32,
    prog_flags: u32,
}

/// Map-create arm of the bpf(2) request union.
#[repr(C)]
#[derive(Clone, Copy)]
struct MapCreateAttr {
    map_type: u32,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
}

/// Map-element arm of the bpf(2) request union. `value` doubles as the
/// next-key pointer for BPF_MAP_GET_NEXT_KEY.
#[repr(C)]
#[derive(Clone, Copy)]
struct MapElemAttr {
    map_fd: u32,
    _pad: u32,
    key: u64,
    value: u64,
    flags: u64,
}

fn ptr_to_u64<T>(ptr: *const T) -> u64 {
    ptr as usize as u64
}

unsafe fn sys_bpf<T>(cmd: libc::c_int, attr: &T) -> libc::c_long {
    libc::syscall(
        libc::SYS_bpf,
        cmd,
        attr as *const T,
        std::mem::size_of::<T>(),
    )
}

fn fd_result(ret: libc::c_long) -> io::Result<OwnedFd> {
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(ret as RawFd) })
}

fn unit_result(ret: libc::c_long) -> io::Result<()> {
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

static LICENSE: &[u8] = b"GPL\0";

/// Load a bytecode program. `insns` is the raw instruction stream, eight
/// bytes per instruction. On success the verifier log (if a buffer was
/// supplied) is left in `log`.
pub fn bpf_prog_load(
    prog_type: ProgType,
    insns: &[u8],
    kern_version: u32,
    log: Option<&mut [u8]>,
) -> io::Result<OwnedFd> {
    debug_assert!(insns.len() % 8 == 0);

    let mut attr: ProgLoadAttr = unsafe { std::mem::zeroed() };
    attr.prog_type = prog_type as u32;
    attr.insns = ptr_to_u64(insns.as_ptr());
    attr.insn_cnt = (insns.len() / 8) as u32;
    attr.license = ptr_to_u64(LICENSE.as_ptr());
    attr.kern_version = kern_version;
    if let Some(buf) = log {
        buf.fill(0);
        attr.log_buf = ptr_to_u64(buf.as_ptr());
        attr.log_size = buf.len() as u32;
        attr.log_level = 1;
    }

    fd_result(unsafe { sys_bpf(BPF_PROG_LOAD, &attr) })
}

pub fn bpf_map_create(
    map_type: MapType,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
) -> io::Result<OwnedFd> {
    let mut attr: MapCreateAttr = unsafe { std::mem::zeroed() };
    attr.map_type = map_type as u32;
    attr.key_size = key_size;
    attr.value_size = value_size;
    attr.max_entries = max_entries;

    fd_result(unsafe { sys_bpf(BPF_MAP_CREATE, &attr) })
}

fn bpf_map_op(
    cmd: libc::c_int,
    fd: BorrowedFd<'_>,
    key: *const u8,
    value_or_next: *const u8,
    flags: u64,
) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let mut attr: MapElemAttr = unsafe { std::mem::zeroed() };
    attr.map_fd = fd.as_raw_fd() as u32;
    attr.key = ptr_to_u64(key);
    attr.value = ptr_to_u64(value_or_next);
    attr.flags = flags;

    unit_result(unsafe { sys_bpf(cmd, &attr) })
}

pub fn bpf_map_lookup(fd: BorrowedFd<'_>, key: &[u8], value: &mut [u8]) -> io::Result<()> {
    bpf_map_op(BPF_MAP_LOOKUP_ELEM, fd, key.as_ptr(), value.as_ptr(), 0)
}

pub fn bpf_map_update(fd: BorrowedFd<'_>, key: &[u8], value: &[u8], flags: u64) -> io::Result<()> {
    bpf_map_op(BPF_MAP_UPDATE_ELEM, fd, key.as_ptr(), value.as_ptr(), flags)
}

pub fn bpf_map_delete(fd: BorrowedFd<'_>, key: &[u8]) -> io::Result<()> {
    bpf_map_op(BPF_MAP_DELETE_ELEM, fd, key.as_ptr(), std::ptr::null(), 0)
}

pub fn bpf_map_next(fd: BorrowedFd<'_>, key: &[u8], next_key: &mut [u8]) -> io::Result<()> {
    bpf_map_op(BPF_MAP_GET_NEXT_KEY, fd, key.as_ptr(), next_key.as_ptr(), 0)
}

pub const PERF_TYPE_TRACEPOINT: u32 = 2;
pub const PERF_FLAG_FD_CLOEXEC: libc::c_ulong = 1 << 3;

/// _IO('$', 0)
const PERF_EVENT_IOC_ENABLE: libc::c_ulong = 0x2400;
/// _IOW('$', 8, __u32)
const PERF_EVENT_IOC_SET_BPF: libc::c_ulong = 0x4004_2408;

/// Leading fields of the perf_event_attr request; the kernel accepts any
/// size at least PERF_ATTR_SIZE_VER0 with a zeroed tail.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct PerfEventAttr {
    pub type_: u32,
    pub size: u32,
    pub config: u64,
    pub sample_period: u64,
    pub sample_type: u64,
    pub read_format: u64,
    /// Bitfield block (disabled, inherit, ...); all clear here.
    pub flags: u64,
    pub wakeup_events: u32,
    pub bp_type: u32,
    pub config1: u64,
    pub config2: u64,
}

impl PerfEventAttr {
    pub fn zeroed() -> Self {
        let mut attr: Self = unsafe { std::mem::zeroed() };
        attr.size = std::mem::size_of::<Self>() as u32;
        attr
    }
}

pub fn perf_event_open(
    attr: &PerfEventAttr,
    pid: libc::pid_t,
    cpu: libc::c_int,
    group_fd: libc::c_int,
    flags: libc::c_ulong,
) -> io::Result<OwnedFd> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            attr as *const PerfEventAttr,
            pid,
            cpu,
            group_fd,
            flags,
        )
    };
    fd_result(ret)
}

pub fn perf_event_set_bpf(event: BorrowedFd<'_>, prog: BorrowedFd<'_>) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let ret = unsafe {
        libc::ioctl(
            event.as_raw_fd(),
            PERF_EVENT_IOC_SET_BPF,
            prog.as_raw_fd() as libc::c_uint,
        )
    };
    unit_result(ret as libc::c_long)
}

pub fn perf_event_enable(event: BorrowedFd<'_>) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let ret = unsafe { libc::ioctl(event.as_raw_fd(), PERF_EVENT_IOC_ENABLE, 0) };
    unit_result(ret as libc::c_long)
}

static KERNEL_VERSION: OnceLock<u32> = OnceLock::new();

/// `KERNEL_VERSION(major, minor, patch)` encoding of the running kernel,
/// read once from uname. Probe program loads are rejected without a
/// matching version code on older kernels.
pub fn kernel_version() -> u32 {
    *KERNEL_VERSION.get_or_init(|| {
        let mut utsname: libc::utsname = unsafe { std::mem::zeroed() };
        if unsafe { libc::uname(&mut utsname) } != 0 {
            return 0;
        }
        let release: Vec<u8> = utsname
            .release
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8)
            .collect();
        let version = parse_kernel_release(&String::from_utf8_lossy(&release)).unwrap_or(0);
        debug!(version, "detected kernel version code");
        version
    })
}

/// Parse a `major.minor.patch[-extra]` release string into the kernel's
/// version code. The patch level saturates at 255, as the kernel's own
/// encoding does.
fn parse_kernel_release(release: &str) -> Option<u32> {
    let mut parts = release.splitn(3, '.');
    let major: u32 = parts.next()?.parse().ok()?;
    let minor: u32 = parts.next()?.parse().ok()?;
    let patch: u32 = parts
        .next()
        .map(|p| {
            let digits: String = p.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse().unwrap_or(0)
        })
        .unwrap_or(0)
        .min(255);
    Some((major << 16) | (minor << 8) | patch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_parsing() {
        assert_eq!(parse_kernel_release("6.8.0-41-generic"), Some(0x060800));
        assert_eq!(parse_kernel_release("5.15.300"), Some(0x050fff));
        assert_eq!(parse_kernel_release("4.19.0"), Some(0x041300));
        assert_eq!(parse_kernel_release("bogus"), None);
    }

    #[test]
    fn attr_sizes_match_the_abi() {
        assert_eq!(std::mem::size_of::<MapCreateAttr>(), 16);
        assert_eq!(std::mem::size_of::<MapElemAttr>(), 32);
        assert_eq!(std::mem::size_of::<ProgLoadAttr>(), 48);
        // PERF_ATTR_SIZE_VER0 is the floor the kernel accepts.
        assert!(std::mem::size_of::<PerfEventAttr>() >= 64);
    }
}
