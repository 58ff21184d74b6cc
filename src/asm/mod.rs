//! Runtime x86-64 assembler
//!
//! Turns Intel-syntax text into machine code positioned at a given address.
//! Output is a pure function of `(source, address)`; the injection pipeline
//! relies on that to assemble once for sizing and again at the final address.
//!
//! Supported syntax:
//! - statements separated by newlines or `;`
//! - labels (`name:`) and `db` byte lists
//! - `byte`/`word`/`dword`/`qword`/`xmmword` `ptr [base + index*scale + disp]`, `[label]`,
//!   `[rip + disp]` and absolute `[address]`; address registers match the bitness
//! - a `lock` prefix on read-modify-write instructions with a memory destination
//! - `short` branches; other branches are always near

mod encoder;
mod error;
mod parser;

pub use error::{AsmError, AsmErrorKind, AsmResult};

/// Assembles text into bytes placed at `address`
pub trait Assemble: Send + Sync {
    fn assemble(&self, source: &str, address: u64) -> AsmResult<Vec<u8>>;
}

/// Code assembled for one address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledProgram {
    pub source: String,
    /// Address the code was assembled against; the bytes are only valid there
    pub address: u64,
    pub bytes: Vec<u8>,
}

impl AssembledProgram {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Assembler backed by iced-x86
#[derive(Debug, Clone, Copy)]
pub struct IcedAssembler {
    bitness: u32,
}

impl Default for IcedAssembler {
    fn default() -> Self {
        Self { bitness: 64 }
    }
}

impl IcedAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assembler for 16, 32 or 64-bit code
    pub fn with_bitness(bitness: u32) -> AsmResult<Self> {
        match bitness {
            16 | 32 | 64 => Ok(Self { bitness }),
            _ => Err(AsmError::encoding(format!("unsupported bitness {}", bitness))),
        }
    }

    pub fn bitness(&self) -> u32 {
        self.bitness
    }

    /// Assemble and keep the source and address alongside the bytes
    pub fn assemble_program(&self, source: &str, address: u64) -> AsmResult<AssembledProgram> {
        Ok(AssembledProgram {
            source: source.to_string(),
            address,
            bytes: self.assemble(source, address)?,
        })
    }
}

impl Assemble for IcedAssembler {
    fn assemble(&self, source: &str, address: u64) -> AsmResult<Vec<u8>> {
        let statements = parser::parse_program(source)?;
        let bytes = encoder::encode(&statements, self.bitness, address)?;
        log::trace!(
            "Assembled {} statements into {} bytes at 0x{:X}",
            statements.len(),
            bytes.len(),
            address
        );
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_bitness() {
        assert_eq!(IcedAssembler::new().bitness(), 64);
        assert!(IcedAssembler::with_bitness(32).is_ok());
        assert_eq!(
            IcedAssembler::with_bitness(8).unwrap_err().kind,
            AsmErrorKind::Encoding
        );
    }

    #[test]
    fn test_assemble_program() {
        let program = IcedAssembler::new()
            .assemble_program("mov eax, 1\nret", 0x140000000)
            .unwrap();
        assert_eq!(program.address, 0x140000000);
        assert_eq!(program.bytes, vec![0xB8, 0x01, 0x00, 0x00, 0x00, 0xC3]);
        assert_eq!(program.len(), 6);
        assert_eq!(program.source, "mov eax, 1\nret");
    }

    #[test]
    fn test_position_independent_length_is_stable() {
        let source = "push rbx\nmov rbx, rcx\nmov eax, dword ptr [rbx + 0x10]\npop rbx\nret";
        let assembler = IcedAssembler::new();
        let sizing = assembler.assemble(source, 0x140000000).unwrap();
        let placed = assembler.assemble(source, 0x13FFE0000).unwrap();
        assert_eq!(sizing, placed);
    }

    #[test]
    fn test_relative_branch_only_displacement_changes() {
        let source = "mov rcx, rax\njmp 0x140123456\nnop";
        let assembler = IcedAssembler::new();
        let sizing = assembler.assemble(source, 0x140000000).unwrap();
        let placed = assembler.assemble(source, 0x13FFE0000).unwrap();

        assert_eq!(sizing.len(), placed.len());
        // mov rcx, rax | E9 rel32 | nop
        assert_eq!(sizing[..4], placed[..4]);
        assert_ne!(sizing[4..8], placed[4..8]);
        assert_eq!(sizing[8], 0x90);
        assert_eq!(placed[8], 0x90);
    }

    #[test]
    fn test_32_bit_assembler_accepts_memory_operands() {
        let assembler = IcedAssembler::with_bitness(32).unwrap();
        let bytes = assembler
            .assemble("mov ecx, dword ptr [eax]\nmov edx, dword ptr [ecx + 0x10]\nret", 0x401000)
            .unwrap();
        assert_eq!(bytes, vec![0x8B, 0x08, 0x8B, 0x51, 0x10, 0xC3]);
    }

    #[test]
    fn test_error_from_trait() {
        let assembler: &dyn Assemble = &IcedAssembler::new();
        let err = assembler.assemble("mov eax,", 0).unwrap_err();
        assert_eq!(err.kind, AsmErrorKind::Syntax);
        assert_eq!(err.line, Some(1));
    }
}
