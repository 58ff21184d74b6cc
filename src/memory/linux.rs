//! Linux process backend
//!
//! Reads and writes go through process_vm_readv/process_vm_writev. Remote
//! allocation and execution are not available, so the code operations of the
//! hook fail with an allocation or execution error on this platform.

#![cfg(target_os = "linux")]

use std::time::Duration;

use super::process::{self, ProcessInfo};
use super::traits::{
    MemoryRegion, ProcessFinder, ProcessMemory, RegionState, MAX_USER_ADDRESS, MIN_USER_ADDRESS,
};

/// A process addressed by PID
pub struct LinuxProcess {
    pid: i32,
    info: ProcessInfo,
}

impl LinuxProcess {
    /// Capture the main module of a running process
    pub fn open(pid: u32) -> Option<Self> {
        let module = process::main_module_info(pid)?;

        log::debug!(
            "Opened process {} ({}) at 0x{:X}",
            pid,
            module.name,
            module.base_address
        );

        Some(Self {
            pid: pid as i32,
            info: ProcessInfo {
                pid,
                base_address: module.base_address,
                module_size: module.size,
                is_64_bit: std::mem::size_of::<usize>() == 8,
            },
        })
    }
}

impl ProcessMemory for LinuxProcess {
    fn read_bytes(&self, address: usize, size: usize) -> Option<Vec<u8>> {
        let mut buffer = vec![0u8; size];

        let local_iov = libc::iovec {
            iov_base: buffer.as_mut_ptr() as *mut _,
            iov_len: size,
        };

        let remote_iov = libc::iovec {
            iov_base: address as *mut _,
            iov_len: size,
        };

        let result = unsafe { libc::process_vm_readv(self.pid, &local_iov, 1, &remote_iov, 1, 0) };

        if result == size as isize {
            Some(buffer)
        } else {
            None
        }
    }

    fn write_bytes(&self, address: usize, data: &[u8]) -> bool {
        let local_iov = libc::iovec {
            iov_base: data.as_ptr() as *mut _,
            iov_len: data.len(),
        };

        let remote_iov = libc::iovec {
            iov_base: address as *mut _,
            iov_len: data.len(),
        };

        let result = unsafe { libc::process_vm_writev(self.pid, &local_iov, 1, &remote_iov, 1, 0) };

        result == data.len() as isize
    }

    fn is_valid(&self) -> bool {
        process::is_process_running(self.info.pid)
    }

    fn process_id(&self) -> u32 {
        self.info.pid
    }

    fn base_address(&self) -> usize {
        self.info.base_address
    }

    fn module_size(&self) -> usize {
        self.info.module_size
    }

    fn is_64_bit(&self) -> bool {
        self.info.is_64_bit
    }

    fn uptime(&self) -> Option<Duration> {
        process::process_uptime(self.info.pid)
    }

    fn query_region(&self, address: usize) -> Option<MemoryRegion> {
        if !(MIN_USER_ADDRESS..=MAX_USER_ADDRESS).contains(&address) {
            return None;
        }

        let maps = process::read_maps(self.info.pid);
        if let Some(entry) = maps.iter().find(|m| (m.start..m.end).contains(&address)) {
            return Some(MemoryRegion {
                base: entry.start,
                size: entry.end - entry.start,
                state: RegionState::Committed,
            });
        }

        let start = maps
            .iter()
            .filter(|m| m.end <= address)
            .map(|m| m.end)
            .max()
            .unwrap_or(MIN_USER_ADDRESS);
        let end = maps
            .iter()
            .filter(|m| m.start > address)
            .map(|m| m.start)
            .min()
            .unwrap_or(MAX_USER_ADDRESS + 1);

        Some(MemoryRegion {
            base: start,
            size: end - start,
            state: RegionState::Free,
        })
    }

    fn allocation_granularity(&self) -> usize {
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if page > 0 {
            page as usize
        } else {
            0x1000
        }
    }
}

/// Finds processes by command or executable name
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxProcessFinder;

impl ProcessFinder for LinuxProcessFinder {
    fn find_process(&self, window_title: &str) -> Option<u32> {
        process::find_process_by_name(window_title)
    }

    fn open_process(&self, pid: u32) -> Option<Box<dyn ProcessMemory>> {
        LinuxProcess::open(pid).map(|p| Box::new(p) as Box<dyn ProcessMemory>)
    }

    fn foreground_process_id(&self) -> Option<u32> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_own_memory() {
        let value: u64 = 0x1122_3344_5566_7788;
        let process = LinuxProcess::open(std::process::id()).unwrap();

        let address = &value as *const u64 as usize;
        assert_eq!(process.read_u64(address), Some(value));
        assert!(process.is_valid());
    }

    #[test]
    fn test_query_own_module() {
        let process = LinuxProcess::open(std::process::id()).unwrap();
        let region = process.query_region(process.base_address()).unwrap();
        assert_eq!(region.state, RegionState::Committed);
        assert_eq!(region.base, process.base_address());
    }

    #[test]
    fn test_no_remote_allocation() {
        let process = LinuxProcess::open(std::process::id()).unwrap();
        assert!(process
            .allocate(None, 0x100, crate::memory::Protection::ReadWrite)
            .is_none());
        assert!(!process.execute(0x1000));
    }
}
