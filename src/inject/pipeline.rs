//! Assemble, place and run code in the target process

use crate::asm::Assemble;
use crate::config::DEFAULT_ALLOCATION_RADIUS;
use crate::error::InjectError;
use crate::memory::{ProcessMemory, Protection};

use super::allocator::{Allocation, AllocationGuard, InjectionAllocator};

/// Runs the two-pass assemble/allocate/write protocol against one process
pub struct CodeInjector<'a> {
    process: &'a dyn ProcessMemory,
    assembler: &'a dyn Assemble,
    radius: usize,
}

impl<'a> CodeInjector<'a> {
    pub fn new(process: &'a dyn ProcessMemory, assembler: &'a dyn Assemble) -> Self {
        Self {
            process,
            assembler,
            radius: DEFAULT_ALLOCATION_RADIUS,
        }
    }

    pub fn with_radius(mut self, radius: usize) -> Self {
        self.radius = radius;
        self
    }

    fn allocator(&self) -> InjectionAllocator<'a> {
        InjectionAllocator::new(self.process).with_radius(self.radius)
    }

    fn assemble(&self, source: &str, address: usize) -> Result<Vec<u8>, InjectError> {
        Ok(self.assembler.assemble(source, address as u64)?)
    }

    /// Assemble near `near`, write the code into a fresh allocation and return
    /// the guard that owns it
    fn place(
        &self,
        source: &str,
        near: usize,
        protection: Protection,
    ) -> Result<Option<AllocationGuard<'a>>, InjectError> {
        let sizing = self.assemble(source, near)?;
        if sizing.is_empty() {
            return Ok(None);
        }

        let guard = self
            .allocator()
            .allocate_guarded(sizing.len(), near, protection)?;
        let address = guard.address();

        let code = self.assemble(source, address)?;
        if code.len() > sizing.len() {
            return Err(InjectError::PatchLengthMismatch {
                expected: sizing.len(),
                actual: code.len(),
            });
        }

        if !self.process.write_bytes(address, &code) {
            return Err(InjectError::WriteFailed {
                address,
                len: code.len(),
            });
        }

        log::debug!("Wrote {} bytes of code at 0x{:X}", code.len(), address);
        Ok(Some(guard))
    }

    /// Assemble, run on a remote thread and release the code again
    ///
    /// Blocks until the remote thread exits. The allocation is released on
    /// every path.
    pub fn assemble_and_execute(&self, source: &str) -> Result<(), InjectError> {
        let base = self.process.base_address();
        let Some(guard) = self.place(source, base, Protection::ReadWriteExecute)? else {
            log::debug!("Nothing to execute");
            return Ok(());
        };

        let address = guard.address();
        if !self.process.execute(address) {
            return Err(InjectError::ExecuteFailed { address });
        }

        log::debug!("Executed injected code at 0x{:X}", address);
        Ok(())
    }

    /// Overwrite `site_len` bytes at `address` with assembled code
    ///
    /// Shorter code is padded with `nop` so the site is fully covered. Code
    /// that does not fit is rejected before anything is written. Returns the
    /// bytes written.
    pub fn assemble_and_inject(
        &self,
        source: &str,
        address: usize,
        site_len: usize,
    ) -> Result<Vec<u8>, InjectError> {
        let code = self.assemble(source, address)?;
        if code.len() > site_len {
            return Err(InjectError::PatchSiteTooSmall {
                address,
                site_len,
                code_len: code.len(),
            });
        }

        let code = match site_len - code.len() {
            0 => code,
            padding => {
                let padded = format!("{}{}", source, "\nnop".repeat(padding));
                self.assemble(&padded, address)?
            }
        };
        if code.len() != site_len {
            return Err(InjectError::PatchLengthMismatch {
                expected: site_len,
                actual: code.len(),
            });
        }

        if !self.process.write_bytes(address, &code) {
            return Err(InjectError::WriteFailed {
                address,
                len: code.len(),
            });
        }

        log::debug!("Patched {} bytes at 0x{:X}", code.len(), address);
        Ok(code)
    }

    /// Assemble into a persistent allocation near `near` (module base when
    /// `None`) and hand the allocation to the caller
    pub fn assemble_allocate_write(
        &self,
        source: &str,
        near: Option<usize>,
        executable: bool,
    ) -> Result<Allocation, InjectError> {
        let near = near.unwrap_or_else(|| self.process.base_address());
        let protection = if executable {
            Protection::ReadWriteExecute
        } else {
            Protection::ReadWrite
        };

        let guard = self
            .place(source, near, protection)?
            .ok_or(InjectError::AllocationFailed { size: 0, near })?;
        guard
            .persist()
            .ok_or(InjectError::AllocationFailed { size: 0, near })
    }

    /// Release an allocation from [`Self::assemble_allocate_write`]
    pub fn free(&self, allocation: Allocation) -> bool {
        let freed = self.process.free(allocation.address);
        if freed {
            log::debug!("Freed allocation at 0x{:X}", allocation.address);
        }
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::IcedAssembler;
    use crate::memory::MockProcess;

    const BASE: usize = 0x140000000;

    #[test]
    fn test_execute_releases_allocation() {
        let process = MockProcess::new();
        let assembler = IcedAssembler::new();
        let injector = CodeInjector::new(&process, &assembler);

        injector.assemble_and_execute("mov eax, 1\nret").unwrap();

        let executed = process.executed();
        assert_eq!(executed.len(), 1);
        assert_eq!(process.freed(), executed);
        assert!(process.live_allocations().is_empty());
    }

    #[test]
    fn test_execute_failure_releases_allocation() {
        let process = MockProcess::new();
        process.fail_execution();
        let assembler = IcedAssembler::new();
        let injector = CodeInjector::new(&process, &assembler);

        let err = injector.assemble_and_execute("ret").unwrap_err();
        assert!(matches!(err, InjectError::ExecuteFailed { .. }));
        assert_eq!(process.freed().len(), 1);
        assert!(process.live_allocations().is_empty());
    }

    #[test]
    fn test_assembly_error_allocates_nothing() {
        let process = MockProcess::new();
        let assembler = IcedAssembler::new();
        let injector = CodeInjector::new(&process, &assembler);

        let err = injector.assemble_and_execute("mov eax,\nret").unwrap_err();
        assert!(matches!(err, InjectError::Assembly(_)));
        assert!(process.freed().is_empty());
        assert!(process.executed().is_empty());
    }

    #[test]
    fn test_empty_program_is_a_no_op() {
        let process = MockProcess::new();
        let assembler = IcedAssembler::new();
        let injector = CodeInjector::new(&process, &assembler);

        injector.assemble_and_execute("").unwrap();
        assert!(process.executed().is_empty());
    }

    #[test]
    fn test_inject_exact_fit() {
        let process = MockProcess::new();
        let assembler = IcedAssembler::new();
        let injector = CodeInjector::new(&process, &assembler);

        let written = injector.assemble_and_inject("mov eax, 1", BASE + 0x100, 5).unwrap();
        assert_eq!(written, vec![0xB8, 0x01, 0x00, 0x00, 0x00]);
        assert_eq!(process.peek(BASE + 0x100, 5), Some(written));
    }

    #[test]
    fn test_allocate_write_persists() {
        let process = MockProcess::new();
        let assembler = IcedAssembler::new();
        let injector = CodeInjector::new(&process, &assembler);

        let allocation = injector
            .assemble_allocate_write("db 1, 2, 3, 4", None, false)
            .unwrap();
        assert_eq!(allocation.protection, Protection::ReadWrite);
        assert_eq!(allocation.near, BASE);
        assert_eq!(allocation.size, 4);
        assert_eq!(process.peek(allocation.address, 4), Some(vec![1, 2, 3, 4]));

        assert!(injector.free(allocation));
        assert!(process.live_allocations().is_empty());
        assert!(!injector.free(allocation));
    }
}
