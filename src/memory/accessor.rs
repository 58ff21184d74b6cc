//! Typed reads and writes through pointer chains

use std::sync::Arc;

use encoding_rs::{Encoding, UTF_16BE, UTF_16LE};

use super::pointer::{offset_address, PointerChain};
use super::traits::ProcessMemory;

/// Generates a read/write pair for each fixed-width numeric type
macro_rules! typed_access {
    ($($read:ident, $write:ident => $ty:ty;)*) => {
        $(
            #[doc = concat!("Read a `", stringify!($ty), "` at `offset` from the chain's address")]
            pub fn $read(&self, chain: &PointerChain, offset: i64) -> Option<$ty> {
                let bytes = self.read_bytes(chain, offset, std::mem::size_of::<$ty>())?;
                Some(<$ty>::from_ne_bytes(bytes.try_into().ok()?))
            }

            #[doc = concat!("Write a `", stringify!($ty), "` at `offset` from the chain's address")]
            pub fn $write(&self, chain: &PointerChain, offset: i64, value: $ty) -> bool {
                self.write_bytes(chain, offset, &value.to_ne_bytes())
            }
        )*
    };
}

/// Typed memory I/O against the attached process
///
/// Every call resolves the chain again; a chain that fails to resolve makes
/// reads return `None` and writes return `false` without touching the target.
#[derive(Clone)]
pub struct MemoryAccessor {
    process: Arc<dyn ProcessMemory>,
}

impl MemoryAccessor {
    pub fn new(process: Arc<dyn ProcessMemory>) -> Self {
        Self { process }
    }

    /// The underlying process handle
    pub fn process(&self) -> &dyn ProcessMemory {
        &*self.process
    }

    /// Resolve a chain against the live process
    pub fn resolve(&self, chain: &PointerChain) -> Option<usize> {
        chain.resolve(&*self.process)
    }

    /// Chain rooted at the resolved address of `chain`
    pub fn child(&self, chain: &PointerChain, offsets: &[i64]) -> PointerChain {
        chain.child(offsets)
    }

    fn address(&self, chain: &PointerChain, offset: i64) -> Option<usize> {
        offset_address(self.resolve(chain)?, offset)
    }

    /// Read `length` bytes at `offset` from the chain's address
    pub fn read_bytes(&self, chain: &PointerChain, offset: i64, length: usize) -> Option<Vec<u8>> {
        let address = self.address(chain, offset)?;
        self.process.read_bytes(address, length)
    }

    /// Write `bytes` at `offset` from the chain's address
    pub fn write_bytes(&self, chain: &PointerChain, offset: i64, bytes: &[u8]) -> bool {
        match self.address(chain, offset) {
            Some(address) => self.process.write_bytes(address, bytes),
            None => false,
        }
    }

    typed_access! {
        read_i8, write_i8 => i8;
        read_u8, write_u8 => u8;
        read_i16, write_i16 => i16;
        read_u16, write_u16 => u16;
        read_i32, write_i32 => i32;
        read_u32, write_u32 => u32;
        read_i64, write_i64 => i64;
        read_u64, write_u64 => u64;
        read_f32, write_f32 => f32;
        read_f64, write_f64 => f64;
    }

    /// Read a one-byte boolean (non-zero = true)
    pub fn read_bool(&self, chain: &PointerChain, offset: i64) -> Option<bool> {
        self.read_u8(chain, offset).map(|v| v != 0)
    }

    /// Write a one-byte boolean
    pub fn write_bool(&self, chain: &PointerChain, offset: i64, value: bool) -> bool {
        self.write_u8(chain, offset, value as u8)
    }

    /// Read an address. There is no write counterpart.
    pub fn read_ptr(&self, chain: &PointerChain, offset: i64) -> Option<usize> {
        let address = self.address(chain, offset)?;
        self.process.read_ptr(address)
    }

    /// Whether any bit of `mask` is set in the 32-bit field at `offset`
    pub fn read_flag32(&self, chain: &PointerChain, offset: i64, mask: u32) -> Option<bool> {
        self.read_u32(chain, offset).map(|field| field & mask != 0)
    }

    /// Set or clear the bits of `mask` in the 32-bit field at `offset`
    ///
    /// Read-modify-write; a concurrent writer in the target can be lost.
    pub fn write_flag32(&self, chain: &PointerChain, offset: i64, mask: u32, state: bool) -> bool {
        let Some(field) = self.read_u32(chain, offset) else {
            return false;
        };
        let field = if state { field | mask } else { field & !mask };
        self.write_u32(chain, offset, field)
    }

    /// Read a fixed-length string of `byte_count` bytes
    ///
    /// With `trim`, the text is cut at the first NUL character.
    pub fn read_string(
        &self,
        chain: &PointerChain,
        offset: i64,
        encoding: &'static Encoding,
        byte_count: usize,
        trim: bool,
    ) -> Option<String> {
        let bytes = self.read_bytes(chain, offset, byte_count)?;
        Some(decode_text(encoding, &bytes, trim))
    }

    /// Write a string into a fixed-length field of `byte_count` bytes
    ///
    /// Encoded output longer than the field is cut at the byte level, which can
    /// split a multi-byte character; shorter output is padded with zeros so the
    /// whole field is always written.
    pub fn write_string(
        &self,
        chain: &PointerChain,
        offset: i64,
        encoding: &'static Encoding,
        byte_count: usize,
        value: &str,
    ) -> bool {
        let mut bytes = encode_text(encoding, value);
        bytes.resize(byte_count, 0);
        self.write_bytes(chain, offset, &bytes)
    }
}

pub(crate) fn decode_text(encoding: &'static Encoding, bytes: &[u8], trim: bool) -> String {
    let (decoded, _) = encoding.decode_without_bom_handling(bytes);
    let mut text = decoded.into_owned();
    if trim {
        if let Some(end) = text.find('\0') {
            text.truncate(end);
        }
    }
    text
}

pub(crate) fn encode_text(encoding: &'static Encoding, value: &str) -> Vec<u8> {
    // encoding_rs only encodes to ASCII-compatible encodings
    if encoding == UTF_16LE {
        value.encode_utf16().flat_map(u16::to_le_bytes).collect()
    } else if encoding == UTF_16BE {
        value.encode_utf16().flat_map(u16::to_be_bytes).collect()
    } else {
        let (encoded, _, _) = encoding.encode(value);
        encoded.into_owned()
    }
}
