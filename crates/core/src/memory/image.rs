//! Byte-buffer backed code memory
//!
//! An [`ImageMemory`] maps an owned buffer at a fixed base address, so code
//! can be scanned and patched with real address arithmetic without touching
//! the live process. An optional scratch area after the image serves glue
//! allocations.

use parking_lot::{Mutex, RwLock};

use super::{CodeMemory, MemoryError};
use crate::address::Address;

/// Filler for unused scratch bytes (`int3`)
const SCRATCH_FILL: u8 = 0xCC;

pub struct ImageMemory {
    base: Address,
    bytes: RwLock<Vec<u8>>,
    image_len: usize,
    scratch_used: Mutex<usize>,
}

impl ImageMemory {
    /// Map `bytes` at `base` with no scratch area
    pub fn new(base: Address, bytes: Vec<u8>) -> Self {
        Self::with_scratch(base, bytes, 0)
    }

    /// Map `bytes` at `base` followed by `scratch_len` bytes for glue blocks
    pub fn with_scratch(base: Address, mut bytes: Vec<u8>, scratch_len: usize) -> Self {
        let image_len = bytes.len();
        bytes.resize(image_len + scratch_len, SCRATCH_FILL);
        Self {
            base,
            bytes: RwLock::new(bytes),
            image_len,
            scratch_used: Mutex::new(0),
        }
    }

    pub fn base(&self) -> Address {
        self.base
    }

    /// One past the last image byte (scratch excluded)
    pub fn end(&self) -> Address {
        Address::new(self.base.get() + self.image_len)
    }

    pub fn len(&self) -> usize {
        self.image_len
    }

    pub fn is_empty(&self) -> bool {
        self.image_len == 0
    }

    /// Copy of the current image bytes (scratch excluded)
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.read()[..self.image_len].to_vec()
    }

    /// Translate an address range into a buffer range
    fn span(&self, address: Address, len: usize) -> Result<std::ops::Range<usize>, MemoryError> {
        let total = self.bytes.read().len();
        address
            .get()
            .checked_sub(self.base.get())
            .and_then(|start| Some(start..start.checked_add(len)?))
            .filter(|range| range.end <= total)
            .ok_or(MemoryError::OutOfBounds { address, len })
    }
}

impl CodeMemory for ImageMemory {
    fn read(&self, address: Address, buf: &mut [u8]) -> Result<(), MemoryError> {
        let span = self.span(address, buf.len())?;
        buf.copy_from_slice(&self.bytes.read()[span]);
        Ok(())
    }

    fn write(&self, address: Address, bytes: &[u8]) -> Result<(), MemoryError> {
        let span = self.span(address, bytes.len())?;
        self.bytes.write()[span].copy_from_slice(bytes);
        Ok(())
    }

    fn allocate_near(&self, near: Address, size: usize) -> Result<Address, MemoryError> {
        let scratch_len = self.bytes.read().len() - self.image_len;
        let mut used = self.scratch_used.lock();
        let size = size.max(1).next_multiple_of(16);

        if *used + size > scratch_len {
            return Err(MemoryError::AllocationFailed { near });
        }

        let address = Address::new(self.base.get() + self.image_len + *used);
        *used += size;
        Ok(address)
    }
}
