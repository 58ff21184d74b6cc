//! Near allocation inside the target process

use crate::config::DEFAULT_ALLOCATION_RADIUS;
use crate::error::InjectError;
use crate::memory::{ProcessMemory, Protection, MAX_USER_ADDRESS, MIN_USER_ADDRESS};

/// A block of memory allocated in the target process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub address: usize,
    pub size: usize,
    pub protection: Protection,
    /// Reference address the block was placed close to
    pub near: usize,
}

impl Allocation {
    pub fn end(&self) -> usize {
        self.address + self.size
    }

    /// Largest distance from the reference address to any byte of the block
    pub fn distance(&self) -> usize {
        if self.address >= self.near {
            self.end() - self.near
        } else {
            self.near - self.address
        }
    }
}

/// Frees an allocation when dropped unless it is persisted
pub struct AllocationGuard<'a> {
    process: &'a dyn ProcessMemory,
    allocation: Option<Allocation>,
}

impl<'a> AllocationGuard<'a> {
    pub fn new(process: &'a dyn ProcessMemory, allocation: Allocation) -> Self {
        Self {
            process,
            allocation: Some(allocation),
        }
    }

    pub fn address(&self) -> usize {
        self.allocation.map(|a| a.address).unwrap_or(0)
    }

    pub fn allocation(&self) -> Option<&Allocation> {
        self.allocation.as_ref()
    }

    /// Keep the allocation alive and hand it to the caller
    pub fn persist(mut self) -> Option<Allocation> {
        self.allocation.take()
    }
}

impl Drop for AllocationGuard<'_> {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            if self.process.free(allocation.address) {
                log::debug!("Released allocation at 0x{:X}", allocation.address);
            } else {
                log::warn!("Failed to release allocation at 0x{:X}", allocation.address);
            }
        }
    }
}

/// Finds free regions close to a reference address and allocates there
///
/// The search walks the region map downwards from the reference address and
/// then upwards, trying the closest granularity-aligned slot of each free
/// region once. It gives up once it leaves the radius.
pub struct InjectionAllocator<'a> {
    process: &'a dyn ProcessMemory,
    radius: usize,
}

impl<'a> InjectionAllocator<'a> {
    pub fn new(process: &'a dyn ProcessMemory) -> Self {
        Self {
            process,
            radius: DEFAULT_ALLOCATION_RADIUS,
        }
    }

    pub fn with_radius(mut self, radius: usize) -> Self {
        self.radius = radius;
        self
    }

    pub fn radius(&self) -> usize {
        self.radius
    }

    /// Allocate `size` bytes within the radius of `near`
    pub fn allocate(
        &self,
        size: usize,
        near: usize,
        protection: Protection,
    ) -> Result<Allocation, InjectError> {
        let failed = InjectError::AllocationFailed { size, near };
        if size == 0 || size > self.radius {
            return Err(failed);
        }

        let found = self
            .search_down(size, near, protection)
            .or_else(|| self.search_up(size, near, protection));

        match found {
            Some(address) => {
                let allocation = Allocation {
                    address,
                    size,
                    protection,
                    near,
                };
                log::debug!(
                    "Allocated {} bytes at 0x{:X} ({:?}, 0x{:X} from 0x{:X})",
                    size,
                    address,
                    protection,
                    allocation.distance(),
                    near
                );
                Ok(allocation)
            }
            None => {
                log::warn!("No free region for {} bytes near 0x{:X}", size, near);
                Err(failed)
            }
        }
    }

    /// Allocate and wrap the result in a guard
    pub fn allocate_guarded(
        &self,
        size: usize,
        near: usize,
        protection: Protection,
    ) -> Result<AllocationGuard<'a>, InjectError> {
        let allocation = self.allocate(size, near, protection)?;
        Ok(AllocationGuard::new(self.process, allocation))
    }

    fn granularity(&self) -> usize {
        self.process.allocation_granularity().max(1)
    }

    fn search_down(&self, size: usize, near: usize, protection: Protection) -> Option<usize> {
        let granularity = self.granularity();
        let lowest = near.saturating_sub(self.radius).max(MIN_USER_ADDRESS);
        let mut cursor = align_down(near.min(MAX_USER_ADDRESS), granularity);

        while cursor >= lowest {
            let region = self.process.query_region(cursor)?;
            let next = region.base.checked_sub(1).map(|a| align_down(a, granularity));

            if region.is_free() {
                if let Some(top) = region.end().checked_sub(size) {
                    let candidate = align_down(top.min(cursor), granularity);
                    if candidate >= region.base && candidate >= lowest {
                        if let Some(address) = self.try_allocate(candidate, size, near, protection) {
                            return Some(address);
                        }
                    }
                }
            }

            cursor = next?;
        }
        None
    }

    fn search_up(&self, size: usize, near: usize, protection: Protection) -> Option<usize> {
        let granularity = self.granularity();
        let highest = near.saturating_add(self.radius).min(MAX_USER_ADDRESS + 1);
        let mut cursor = align_up(near.max(MIN_USER_ADDRESS), granularity)?;

        while cursor.checked_add(size)? <= highest {
            let region = self.process.query_region(cursor)?;
            let next = align_up(region.end(), granularity);

            if region.is_free() {
                let candidate = align_up(cursor.max(region.base), granularity)?;
                let end = candidate.checked_add(size)?;
                if end <= region.end() && end <= highest {
                    if let Some(address) = self.try_allocate(candidate, size, near, protection) {
                        return Some(address);
                    }
                }
            }

            cursor = next?;
        }
        None
    }

    fn try_allocate(
        &self,
        candidate: usize,
        size: usize,
        near: usize,
        protection: Protection,
    ) -> Option<usize> {
        let address = self.process.allocate(Some(candidate), size, protection)?;
        let allocation = Allocation {
            address,
            size,
            protection,
            near,
        };
        if allocation.distance() > self.radius {
            log::debug!("Allocation at 0x{:X} is out of range, releasing", address);
            self.process.free(address);
            return None;
        }
        Some(address)
    }
}

fn align_down(value: usize, align: usize) -> usize {
    value / align * align
}

fn align_up(value: usize, align: usize) -> Option<usize> {
    Some(value.checked_add(align - 1)? / align * align)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MockProcess;

    const BASE: usize = 0x140000000;

    #[test]
    fn test_allocates_below_module() {
        let process = MockProcess::new();
        let allocator = InjectionAllocator::new(&process);

        let allocation = allocator
            .allocate(0x40, BASE, Protection::ReadWriteExecute)
            .unwrap();
        assert_eq!(allocation.address, BASE - 0x10000);
        assert_eq!(allocation.size, 0x40);
        assert_eq!(allocation.near, BASE);
        assert!(allocation.distance() <= allocator.radius());
        assert_eq!(
            process.live_allocations(),
            vec![(BASE - 0x10000, 0x40, Protection::ReadWriteExecute)]
        );
    }

    #[test]
    fn test_skips_reserved_regions() {
        let process = MockProcess::new();
        process.reserve(BASE - 0x30000, 0x30000);
        let allocator = InjectionAllocator::new(&process);

        let allocation = allocator.allocate(0x100, BASE, Protection::ReadWrite).unwrap();
        assert_eq!(allocation.address, BASE - 0x40000);
    }

    #[test]
    fn test_falls_back_above_module() {
        let process = MockProcess::new().with_size(0x20000);
        let radius = 0x100000;
        process.reserve(BASE - radius, radius);
        let allocator = InjectionAllocator::new(&process).with_radius(radius);

        let allocation = allocator.allocate(0x10, BASE, Protection::ReadWrite).unwrap();
        assert_eq!(allocation.address, BASE + 0x20000);
    }

    #[test]
    fn test_fails_when_nothing_in_range() {
        let process = MockProcess::new();
        let radius = 0x100000;
        process.reserve(BASE - radius, radius);
        let allocator = InjectionAllocator::new(&process).with_radius(radius);

        // the module itself fills the space above
        let err = allocator
            .allocate(0x10, BASE + 0x1000, Protection::ReadWrite)
            .unwrap_err();
        assert!(matches!(
            err,
            InjectError::AllocationFailed { size: 0x10, near } if near == BASE + 0x1000
        ));
        assert!(process.live_allocations().is_empty());
    }

    #[test]
    fn test_denied_allocation_fails() {
        let process = MockProcess::new();
        process.deny_allocations();
        let allocator = InjectionAllocator::new(&process).with_radius(0x200000);

        assert!(allocator.allocate(0x10, BASE, Protection::ReadWrite).is_err());
    }

    #[test]
    fn test_zero_size_fails() {
        let process = MockProcess::new();
        let allocator = InjectionAllocator::new(&process);
        assert!(allocator.allocate(0, BASE, Protection::ReadWrite).is_err());
    }

    #[test]
    fn test_guard_frees_on_drop() {
        let process = MockProcess::new();
        let allocator = InjectionAllocator::new(&process);

        let address = {
            let guard = allocator
                .allocate_guarded(0x20, BASE, Protection::ReadWriteExecute)
                .unwrap();
            assert_eq!(process.live_allocations().len(), 1);
            guard.address()
        };

        assert!(process.live_allocations().is_empty());
        assert_eq!(process.freed(), vec![address]);
    }

    #[test]
    fn test_guard_persist_keeps_allocation() {
        let process = MockProcess::new();
        let allocator = InjectionAllocator::new(&process);

        let guard = allocator
            .allocate_guarded(0x20, BASE, Protection::ReadWrite)
            .unwrap();
        let allocation = guard.persist().unwrap();

        assert_eq!(process.live_allocations().len(), 1);
        assert!(process.freed().is_empty());
        assert!(process.free(allocation.address));
    }

    #[test]
    fn test_alignment_helpers() {
        assert_eq!(align_down(0x12345, 0x10000), 0x10000);
        assert_eq!(align_up(0x12345, 0x10000), Some(0x20000));
        assert_eq!(align_up(0x20000, 0x10000), Some(0x20000));
        assert_eq!(align_up(usize::MAX, 0x10000), None);
    }
}
