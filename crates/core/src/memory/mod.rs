//! Code memory access
//!
//! Everything the engine does to code goes through [`CodeMemory`]:
//! - [`ProcessMemory`] reads and writes the live process, changing page
//!   protection only for the duration of each write
//! - [`ImageMemory`] is an owned, bounds-checked byte buffer mapped at a fixed
//!   base address (offline images and tests)

mod alloc;
pub mod image;
pub mod pe;
pub mod process;

pub use image::ImageMemory;
pub use process::ProcessMemory;

use crate::address::Address;

/// Errors from reading, writing or allocating code memory
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("Memory at {address:#x} ({len} bytes) is not mapped")]
    Unmapped { address: Address, len: usize },

    #[error("Memory at {address:#x} is not readable")]
    NotReadable { address: Address },

    #[error("Failed to change protection at {address:#x}: {reason}")]
    Protection { address: Address, reason: String },

    #[error("Access at {address:#x} ({len} bytes) is outside the image")]
    OutOfBounds { address: Address, len: usize },

    #[error("No executable memory available within branch range of {near:#x}")]
    AllocationFailed { near: Address },

    #[error("Invalid PE image at {base:#x}: {reason}")]
    InvalidImage { base: Address, reason: String },
}

/// Backend the engine reads, writes and allocates code memory through
pub trait CodeMemory: Send + Sync {
    /// Fill `buf` with the bytes currently at `address`
    fn read(&self, address: Address, buf: &mut [u8]) -> Result<(), MemoryError>;

    /// Overwrite the bytes at `address`.
    ///
    /// Implementations must leave page protection exactly as they found it,
    /// whether or not the write succeeds.
    fn write(&self, address: Address, bytes: &[u8]) -> Result<(), MemoryError>;

    /// Allocate `size` bytes of executable memory within rel32 reach of `near`.
    ///
    /// Allocations live as long as the backend.
    fn allocate_near(&self, near: Address, size: usize) -> Result<Address, MemoryError>;

    /// Read `len` bytes into a new buffer
    fn read_vec(&self, address: Address, len: usize) -> Result<Vec<u8>, MemoryError> {
        let mut buf = vec![0u8; len];
        self.read(address, &mut buf)?;
        Ok(buf)
    }

    fn read_u16(&self, address: Address) -> Result<u16, MemoryError> {
        let mut buf = [0u8; 2];
        self.read(address, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32(&self, address: Address) -> Result<u32, MemoryError> {
        let mut buf = [0u8; 4];
        self.read(address, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }
}
