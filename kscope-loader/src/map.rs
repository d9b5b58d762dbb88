//! Typed handle over the map syscalls.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use crate::syscall;
use crate::{MapType, Result};

/// One kernel-side key-value map. The wider storage subsystem sits above
/// this; the handle only carries the geometry needed to call through the
/// gateway safely.
#[derive(Debug)]
pub struct Map {
    fd: OwnedFd,
    key_size: u32,
    value_size: u32,
}

impl Map {
    pub fn create(
        map_type: MapType,
        key_size: u32,
        value_size: u32,
        max_entries: u32,
    ) -> Result<Self> {
        let fd = syscall::bpf_map_create(map_type, key_size, value_size, max_entries)?;
        Ok(Map {
            fd,
            key_size,
            value_size,
        })
    }

    /// Per-CPU event transport map, one slot per possible CPU.
    pub fn perf_event_array(nr_cpus: u32) -> Result<Self> {
        Self::create(MapType::PerfEventArray, 4, 4, nr_cpus)
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    pub fn key_size(&self) -> u32 {
        self.key_size
    }

    pub fn value_size(&self) -> u32 {
        self.value_size
    }

    pub fn lookup(&self, key: &[u8], value: &mut [u8]) -> Result<()> {
        debug_assert_eq!(key.len(), self.key_size as usize);
        debug_assert_eq!(value.len(), self.value_size as usize);
        Ok(syscall::bpf_map_lookup(self.fd(), key, value)?)
    }

    pub fn update(&self, key: &[u8], value: &[u8], flags: u64) -> Result<()> {
        debug_assert_eq!(key.len(), self.key_size as usize);
        debug_assert_eq!(value.len(), self.value_size as usize);
        Ok(syscall::bpf_map_update(self.fd(), key, value, flags)?)
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        debug_assert_eq!(key.len(), self.key_size as usize);
        Ok(syscall::bpf_map_delete(self.fd(), key)?)
    }

    pub fn next_key(&self, key: &[u8], next_key: &mut [u8]) -> Result<()> {
        debug_assert_eq!(next_key.len(), self.key_size as usize);
        Ok(syscall::bpf_map_next(self.fd(), key, next_key)?)
    }
}
