//! Cross-platform process memory access
//!
//! [`ProcessMemory`] abstracts an opened process, with Windows and Linux
//! implementations and an in-memory [`MockProcess`] for tests. On top of it,
//! [`PointerChain`] locates values and [`MemoryAccessor`] reads and writes them.

#[cfg(target_os = "windows")]
mod windows;

#[cfg(target_os = "linux")]
mod linux;

mod accessor;
mod pattern;
mod pointer;
mod process;
mod remote;
mod traits;

pub use accessor::MemoryAccessor;
pub use pattern::{bytes_to_pattern, parse_pattern, scan_module, scan_pattern};
pub use pointer::{is_canonical, ChainRoot, PointerChain};
pub use process::{ModuleInfo, ProcessInfo};
pub use remote::RemotePointer;
pub use traits::{
    MemoryRegion, MockProcess, MockProcessFinder, ProcessFinder, ProcessMemory, Protection,
    RegionState, MAX_USER_ADDRESS, MIN_USER_ADDRESS,
};

#[cfg(target_os = "windows")]
pub use self::windows::{WindowsProcess, WindowsProcessFinder};

#[cfg(target_os = "linux")]
pub use self::linux::{LinuxProcess, LinuxProcessFinder};

/// Process finder for the current platform
#[cfg(target_os = "windows")]
pub fn platform_finder() -> Box<dyn ProcessFinder> {
    Box::new(WindowsProcessFinder)
}

/// Process finder for the current platform
#[cfg(target_os = "linux")]
pub fn platform_finder() -> Box<dyn ProcessFinder> {
    Box::new(LinuxProcessFinder)
}

/// Process finder for the current platform
///
/// No backend exists here, so nothing is ever found.
#[cfg(not(any(target_os = "windows", target_os = "linux")))]
pub fn platform_finder() -> Box<dyn ProcessFinder> {
    Box::new(MockProcessFinder::new())
}
