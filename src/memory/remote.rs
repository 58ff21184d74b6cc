//! Handle to an object living in the target process
//!
//! Game object types wrap a [`RemotePointer`] and expose fields as offsets
//! from it, so they never deal with chains or the process handle directly.

use encoding_rs::Encoding;

use super::accessor::MemoryAccessor;
use super::pointer::PointerChain;

/// Forwards offset-only typed operations to the accessor
macro_rules! delegate_typed {
    ($($read:ident, $write:ident => $ty:ty;)*) => {
        $(
            pub fn $read(&self, offset: i64) -> Option<$ty> {
                self.accessor.$read(&self.chain, offset)
            }

            pub fn $write(&self, offset: i64, value: $ty) -> bool {
                self.accessor.$write(&self.chain, offset, value)
            }
        )*
    };
}

/// A chain bound to the process it should be resolved against
#[derive(Clone)]
pub struct RemotePointer {
    accessor: MemoryAccessor,
    chain: PointerChain,
}

impl RemotePointer {
    pub fn new(accessor: MemoryAccessor, chain: PointerChain) -> Self {
        Self { accessor, chain }
    }

    pub fn chain(&self) -> &PointerChain {
        &self.chain
    }

    pub fn accessor(&self) -> &MemoryAccessor {
        &self.accessor
    }

    /// Current address of the object, if the chain resolves
    pub fn address(&self) -> Option<usize> {
        self.accessor.resolve(&self.chain)
    }

    /// Whether the chain currently resolves to a non-null address
    pub fn is_valid(&self) -> bool {
        self.address().is_some()
    }

    /// Pointer to an object reached through this one
    pub fn child(&self, offsets: &[i64]) -> RemotePointer {
        Self {
            accessor: self.accessor.clone(),
            chain: self.chain.child(offsets),
        }
    }

    pub fn read_bytes(&self, offset: i64, length: usize) -> Option<Vec<u8>> {
        self.accessor.read_bytes(&self.chain, offset, length)
    }

    pub fn write_bytes(&self, offset: i64, bytes: &[u8]) -> bool {
        self.accessor.write_bytes(&self.chain, offset, bytes)
    }

    delegate_typed! {
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
        read_bool, write_bool => bool;
    }

    /// Read an address stored at `offset`
    pub fn read_ptr(&self, offset: i64) -> Option<usize> {
        self.accessor.read_ptr(&self.chain, offset)
    }

    pub fn read_flag32(&self, offset: i64, mask: u32) -> Option<bool> {
        self.accessor.read_flag32(&self.chain, offset, mask)
    }

    pub fn write_flag32(&self, offset: i64, mask: u32, state: bool) -> bool {
        self.accessor.write_flag32(&self.chain, offset, mask, state)
    }

    pub fn read_string(
        &self,
        offset: i64,
        encoding: &'static Encoding,
        byte_count: usize,
        trim: bool,
    ) -> Option<String> {
        self.accessor
            .read_string(&self.chain, offset, encoding, byte_count, trim)
    }

    pub fn write_string(
        &self,
        offset: i64,
        encoding: &'static Encoding,
        byte_count: usize,
        value: &str,
    ) -> bool {
        self.accessor
            .write_string(&self.chain, offset, encoding, byte_count, value)
    }
}
