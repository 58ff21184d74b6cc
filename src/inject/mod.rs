//! Code injection
//!
//! [`InjectionAllocator`] finds memory close enough to a reference address for
//! rel32 branches to reach it, and [`CodeInjector`] drives the two-pass
//! assemble/allocate/write protocol on top of it.

mod allocator;
mod pipeline;

pub use allocator::{Allocation, AllocationGuard, InjectionAllocator};
pub use pipeline::CodeInjector;
