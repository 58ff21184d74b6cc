//! NYA Core Hook
//!
//! Attaches to a running game process, tracks whether the game is loaded,
//! reads and writes its memory through pointer chains, and assembles code at
//! runtime to run inside it or patch it in place.
//!
//! ```no_run
//! use nyacore_hook::{HookConfig, PointerChain, PointerLoadedCheck, ProcessHook};
//!
//! let config = HookConfig::new("DARK SOULS III").with_refresh_interval(100);
//! let check = PointerLoadedCheck::new(PointerChain::module_offset(0x4768E78, &[0x80]));
//! let mut hook = ProcessHook::new(config, check).unwrap();
//!
//! for event in hook.refresh() {
//!     println!("{:?}", event);
//! }
//! ```

pub mod asm;
pub mod config;
pub mod error;
pub mod hook;
pub mod inject;
pub mod memory;

// Re-export commonly used types
pub use asm::{Assemble, AsmError, AsmErrorKind, AssembledProgram, IcedAssembler};
pub use config::{HookConfig, PointerChainConfig};
pub use error::{ConfigError, InjectError};
pub use hook::{
    HookEvent, HookState, HookStatus, LoadTracker, LoadTransition, LoadedCheck,
    PointerLoadedCheck, ProcessHook,
};
pub use inject::{Allocation, AllocationGuard, CodeInjector, InjectionAllocator};
pub use memory::{
    MemoryAccessor, MockProcess, MockProcessFinder, PointerChain, ProcessFinder, ProcessMemory,
    Protection, RemotePointer,
};
