//! Live process memory
//!
//! Reads are checked against the OS mapping first so scanning a bad range
//! reports an error instead of faulting. Writes make the target pages
//! read/write/execute through a `region` guard that restores the previous
//! protection when it drops, on success and failure alike.

use parking_lot::Mutex;

use super::alloc::GlueAllocator;
use super::{CodeMemory, MemoryError};
use crate::address::Address;

/// Memory of the current process
pub struct ProcessMemory {
    allocator: Mutex<GlueAllocator>,
}

impl ProcessMemory {
    pub fn new() -> Self {
        Self {
            allocator: Mutex::new(GlueAllocator::new()),
        }
    }

    /// Check that `[address, address + len)` is mapped and readable
    fn check_readable(address: Address, len: usize) -> Result<(), MemoryError> {
        let end = address
            .checked_add(len)
            .ok_or(MemoryError::Unmapped { address, len })?
            .get();

        let regions = region::query_range(address.as_ptr(), len)
            .map_err(|_| MemoryError::Unmapped { address, len })?;

        let mut cursor = address.get();
        for region in regions {
            let region = region.map_err(|_| MemoryError::Unmapped { address, len })?;
            let range = region.as_range();
            if range.start > cursor {
                return Err(MemoryError::Unmapped {
                    address: Address::new(cursor),
                    len: end - cursor,
                });
            }
            if !region.is_readable() {
                return Err(MemoryError::NotReadable {
                    address: Address::new(range.start.max(address.get())),
                });
            }
            cursor = cursor.max(range.end);
            if cursor >= end {
                return Ok(());
            }
        }

        Err(MemoryError::Unmapped {
            address: Address::new(cursor),
            len: end - cursor,
        })
    }
}

impl Default for ProcessMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeMemory for ProcessMemory {
    fn read(&self, address: Address, buf: &mut [u8]) -> Result<(), MemoryError> {
        if buf.is_empty() {
            return Ok(());
        }
        Self::check_readable(address, buf.len())?;

        // SAFETY: the whole range was just verified to be mapped and readable
        unsafe {
            std::ptr::copy_nonoverlapping(address.as_ptr(), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    fn write(&self, address: Address, bytes: &[u8]) -> Result<(), MemoryError> {
        if bytes.is_empty() {
            return Ok(());
        }

        // The guard restores the previous protection of every page it touched
        let _guard = unsafe {
            region::protect_with_handle(
                address.as_ptr(),
                bytes.len(),
                region::Protection::READ_WRITE_EXECUTE,
            )
        }
        .map_err(|e| match e {
            region::Error::UnmappedRegion => MemoryError::Unmapped {
                address,
                len: bytes.len(),
            },
            other => MemoryError::Protection {
                address,
                reason: other.to_string(),
            },
        })?;

        // SAFETY: the range is mapped and writable while `_guard` is alive
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), address.as_mut_ptr(), bytes.len());
        }

        tracing::trace!("Wrote {} bytes at {:#x}", bytes.len(), address);
        Ok(())
    }

    fn allocate_near(&self, near: Address, size: usize) -> Result<Address, MemoryError> {
        self.allocator
            .lock()
            .alloc_near(near.get(), size)
            .map(|ptr| Address::from_ptr(ptr.as_ptr()))
            .ok_or(MemoryError::AllocationFailed { near })
    }
}
