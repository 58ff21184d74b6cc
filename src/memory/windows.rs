//! Windows process backend

#![cfg(target_os = "windows")]

use std::ffi::c_void;
use std::time::Duration;

use windows::Win32::Foundation::{CloseHandle, FILETIME, HANDLE};
use windows::Win32::System::Diagnostics::Debug::{ReadProcessMemory, WriteProcessMemory};
use windows::Win32::System::Memory::{
    VirtualAllocEx, VirtualFreeEx, VirtualQueryEx, MEMORY_BASIC_INFORMATION, MEM_COMMIT,
    MEM_FREE, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READWRITE, PAGE_READWRITE,
};
use windows::Win32::System::SystemInformation::{GetSystemInfo, GetSystemTimeAsFileTime, SYSTEM_INFO};
use windows::Win32::System::Threading::{
    CreateRemoteThread, GetProcessTimes, OpenProcess, WaitForSingleObject, INFINITE,
    LPTHREAD_START_ROUTINE, PROCESS_ALL_ACCESS,
};

use super::process::{self, ProcessInfo};
use super::traits::{MemoryRegion, ProcessFinder, ProcessMemory, Protection, RegionState};

/// An opened process, closed on drop
pub struct WindowsProcess {
    handle: HANDLE,
    info: ProcessInfo,
    granularity: usize,
}

impl WindowsProcess {
    /// Open a process with full access and capture its main module
    pub fn open(pid: u32) -> Option<Self> {
        let handle = unsafe { OpenProcess(PROCESS_ALL_ACCESS, false, pid) }.ok()?;

        let Some(module) = process::main_module_info(pid) else {
            unsafe {
                let _ = CloseHandle(handle);
            }
            return None;
        };

        let granularity = unsafe {
            let mut info = SYSTEM_INFO::default();
            GetSystemInfo(&mut info);
            info.dwAllocationGranularity as usize
        };

        log::debug!(
            "Opened process {} ({}) at 0x{:X}",
            pid,
            module.name,
            module.base_address
        );

        Some(Self {
            handle,
            info: ProcessInfo {
                pid,
                base_address: module.base_address,
                module_size: module.size,
                is_64_bit: process::check_is_64_bit(handle),
            },
            granularity,
        })
    }

    /// Get the underlying handle
    pub fn handle(&self) -> HANDLE {
        self.handle
    }
}

impl Drop for WindowsProcess {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.handle);
        }
    }
}

fn filetime_to_u64(time: FILETIME) -> u64 {
    ((time.dwHighDateTime as u64) << 32) | time.dwLowDateTime as u64
}

impl ProcessMemory for WindowsProcess {
    fn read_bytes(&self, address: usize, size: usize) -> Option<Vec<u8>> {
        let mut buffer = vec![0u8; size];
        let mut bytes_read = 0;

        let result = unsafe {
            ReadProcessMemory(
                self.handle,
                address as *const c_void,
                buffer.as_mut_ptr() as *mut c_void,
                size,
                Some(&mut bytes_read),
            )
        };

        if result.is_ok() && bytes_read == size {
            Some(buffer)
        } else {
            None
        }
    }

    fn write_bytes(&self, address: usize, data: &[u8]) -> bool {
        let mut bytes_written = 0;

        let result = unsafe {
            WriteProcessMemory(
                self.handle,
                address as *const c_void,
                data.as_ptr() as *const c_void,
                data.len(),
                Some(&mut bytes_written),
            )
        };

        result.is_ok() && bytes_written == data.len()
    }

    fn is_valid(&self) -> bool {
        process::is_process_running_by_handle(self.handle)
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
        let mut creation = FILETIME::default();
        let mut exit = FILETIME::default();
        let mut kernel = FILETIME::default();
        let mut user = FILETIME::default();

        unsafe { GetProcessTimes(self.handle, &mut creation, &mut exit, &mut kernel, &mut user) }
            .ok()?;
        let now = unsafe { GetSystemTimeAsFileTime() };

        // FILETIME counts 100ns intervals
        let elapsed = filetime_to_u64(now).saturating_sub(filetime_to_u64(creation));
        Some(Duration::from_nanos(elapsed.saturating_mul(100)))
    }

    fn query_region(&self, address: usize) -> Option<MemoryRegion> {
        let mut info = MEMORY_BASIC_INFORMATION::default();
        let written = unsafe {
            VirtualQueryEx(
                self.handle,
                Some(address as *const c_void),
                &mut info,
                std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        if written == 0 {
            return None;
        }

        let state = if info.State == MEM_FREE {
            RegionState::Free
        } else if info.State == MEM_RESERVE {
            RegionState::Reserved
        } else {
            RegionState::Committed
        };

        Some(MemoryRegion {
            base: info.BaseAddress as usize,
            size: info.RegionSize,
            state,
        })
    }

    fn allocate(&self, address: Option<usize>, size: usize, protection: Protection) -> Option<usize> {
        let flags = match protection {
            Protection::ReadWrite => PAGE_READWRITE,
            Protection::ReadWriteExecute => PAGE_EXECUTE_READWRITE,
        };

        let allocated = unsafe {
            VirtualAllocEx(
                self.handle,
                address.map(|a| a as *const c_void),
                size,
                MEM_COMMIT | MEM_RESERVE,
                flags,
            )
        };

        if allocated.is_null() {
            None
        } else {
            Some(allocated as usize)
        }
    }

    fn free(&self, address: usize) -> bool {
        unsafe { VirtualFreeEx(self.handle, address as *mut c_void, 0, MEM_RELEASE) }.is_ok()
    }

    fn execute(&self, address: usize) -> bool {
        let thread = unsafe {
            CreateRemoteThread(
                self.handle,
                None,
                0,
                std::mem::transmute::<usize, LPTHREAD_START_ROUTINE>(address),
                None,
                0,
                None,
            )
        };

        match thread {
            Ok(thread) => {
                unsafe {
                    WaitForSingleObject(thread, INFINITE);
                    let _ = CloseHandle(thread);
                }
                true
            }
            Err(e) => {
                log::warn!("CreateRemoteThread at 0x{:X} failed: {}", address, e);
                false
            }
        }
    }

    fn allocation_granularity(&self) -> usize {
        self.granularity
    }
}

// HANDLE is not Send/Sync by default; callers serialize use of the process
unsafe impl Send for WindowsProcess {}
unsafe impl Sync for WindowsProcess {}

/// Finds processes by main window title
#[derive(Debug, Default, Clone, Copy)]
pub struct WindowsProcessFinder;

impl ProcessFinder for WindowsProcessFinder {
    fn find_process(&self, window_title: &str) -> Option<u32> {
        process::find_process_by_window_title(window_title)
    }

    fn open_process(&self, pid: u32) -> Option<Box<dyn ProcessMemory>> {
        WindowsProcess::open(pid).map(|p| Box::new(p) as Box<dyn ProcessMemory>)
    }

    fn foreground_process_id(&self) -> Option<u32> {
        process::foreground_process_id()
    }
}
