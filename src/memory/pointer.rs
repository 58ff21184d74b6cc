//! Pointer chain resolution
//!
//! A chain starts at a root address and follows its offsets one hop at a time:
//! every offset is added to the current address and the pointer stored there
//! is read. The resolved address is the result of the last hop; typed reads
//! and writes then apply their own offset to it without dereferencing.

use super::traits::{ProcessMemory, MAX_USER_ADDRESS};

/// Where a [`PointerChain`] starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainRoot {
    /// Main module base plus a signed offset
    ModuleOffset(i64),
    /// A fixed address
    Absolute(usize),
    /// The resolved address of another chain
    Chain(Box<PointerChain>),
}

/// Immutable description of how to find a value in the target process
///
/// Chains are re-resolved on every access, so one chain stays usable while the
/// game moves objects around.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointerChain {
    root: ChainRoot,
    offsets: Vec<i64>,
}

/// Whether `address` can be dereferenced in a user-mode x64 process
pub fn is_canonical(address: usize) -> bool {
    address != 0 && address <= MAX_USER_ADDRESS
}

/// Apply a signed offset, rejecting overflow and non-canonical results
pub(crate) fn offset_address(address: usize, offset: i64) -> Option<usize> {
    let target = if offset >= 0 {
        address.checked_add(offset as usize)?
    } else {
        address.checked_sub(offset.unsigned_abs() as usize)?
    };
    is_canonical(target).then_some(target)
}

impl PointerChain {
    /// Chain rooted at `module base + offset`
    pub fn module_offset(offset: i64, offsets: &[i64]) -> Self {
        Self {
            root: ChainRoot::ModuleOffset(offset),
            offsets: offsets.to_vec(),
        }
    }

    /// Chain rooted at a fixed address
    pub fn absolute(address: usize, offsets: &[i64]) -> Self {
        Self {
            root: ChainRoot::Absolute(address),
            offsets: offsets.to_vec(),
        }
    }

    /// New chain rooted at the resolved address of this one
    ///
    /// Does not touch the process.
    pub fn child(&self, offsets: &[i64]) -> Self {
        Self {
            root: ChainRoot::Chain(Box::new(self.clone())),
            offsets: offsets.to_vec(),
        }
    }

    pub fn root(&self) -> &ChainRoot {
        &self.root
    }

    pub fn offsets(&self) -> &[i64] {
        &self.offsets
    }

    /// Resolve the chain to a concrete address
    ///
    /// Returns `None` when the root is zero or invalid (without reading
    /// anything), when a hop lands on a non-canonical address, when a read
    /// fails, or when a hop reads a null pointer.
    pub fn resolve(&self, memory: &dyn ProcessMemory) -> Option<usize> {
        let mut address = self.resolve_root(memory)?;

        for &offset in &self.offsets {
            let slot = offset_address(address, offset)?;
            address = memory.read_ptr(slot)?;
            if !is_canonical(address) {
                return None;
            }
        }

        Some(address)
    }

    fn resolve_root(&self, memory: &dyn ProcessMemory) -> Option<usize> {
        let root = match &self.root {
            ChainRoot::ModuleOffset(offset) => {
                let base = memory.base_address();
                if base == 0 {
                    return None;
                }
                offset_address(base, *offset)?
            }
            ChainRoot::Absolute(address) => *address,
            ChainRoot::Chain(parent) => parent.resolve(memory)?,
        };
        is_canonical(root).then_some(root)
    }
}
