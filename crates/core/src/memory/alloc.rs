//! Glue block allocation
//!
//! Allocates executable memory within ±2GB of target addresses so that cave
//! redirects and continuation jumps can use rel32 encodings. Pages are mapped
//! read/execute; glue is written through [`CodeMemory::write`], which makes
//! them writable only for the duration of the write. Pages are released when
//! the owning allocator drops.
//!
//! [`CodeMemory::write`]: super::CodeMemory::write

use std::collections::BTreeMap;
use std::ptr::NonNull;

/// Maximum search distance for near allocation (2GB minus slack)
const MAX_RANGE: usize = 0x7FFF_0000;

/// Hint stride while probing for free pages
const PROBE_STEP_PAGES: usize = 64;

/// Granularity of a single allocation
const ALIGNMENT: usize = 16;

pub(super) struct GlueAllocator {
    /// Pages allocated, keyed by base address
    pages: BTreeMap<usize, PageInfo>,
    page_size: usize,
}

struct PageInfo {
    mapping: Mapping,
    used: usize,
}

/// An anonymous read/execute mapping, unmapped on drop
struct Mapping {
    #[cfg(unix)]
    base: NonNull<std::ffi::c_void>,
    #[cfg(unix)]
    len: usize,
    #[cfg(not(unix))]
    allocation: region::Allocation,
}

// SAFETY: mappings are only touched through the owning allocator, which is behind a mutex
unsafe impl Send for Mapping {}

impl Mapping {
    #[cfg(unix)]
    fn new(hint: usize, len: usize) -> Option<Self> {
        use nix::sys::mman::{mmap_anonymous, MapFlags, ProtFlags};
        use std::num::NonZeroUsize;

        let base = unsafe {
            mmap_anonymous(
                NonZeroUsize::new(hint),
                NonZeroUsize::new(len)?,
                ProtFlags::PROT_READ | ProtFlags::PROT_EXEC,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            )
        }
        .ok()?;

        Some(Self { base, len })
    }

    #[cfg(not(unix))]
    fn new(hint: usize, len: usize) -> Option<Self> {
        let allocation = unsafe {
            region::alloc_at(hint as *const u8, len, region::Protection::READ_EXECUTE)
        }
        .ok()?;
        Some(Self { allocation })
    }

    #[cfg(unix)]
    fn base(&self) -> usize {
        self.base.as_ptr() as usize
    }

    #[cfg(not(unix))]
    fn base(&self) -> usize {
        self.allocation.as_ptr::<u8>() as usize
    }

    #[cfg(unix)]
    fn len(&self) -> usize {
        self.len
    }

    #[cfg(not(unix))]
    fn len(&self) -> usize {
        self.allocation.len()
    }
}

#[cfg(unix)]
impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: the range was mapped by `Mapping::new` and nothing refers to it any more
        if let Err(e) = unsafe { nix::sys::mman::munmap(self.base, self.len) } {
            tracing::warn!("Failed to unmap glue page at {:p}: {}", self.base, e);
        }
    }
}

fn distance(a: usize, b: usize) -> usize {
    a.abs_diff(b)
}

impl GlueAllocator {
    pub(super) fn new() -> Self {
        Self {
            pages: BTreeMap::new(),
            page_size: region::page::size(),
        }
    }

    /// Allocate `size` bytes of executable memory near `target`
    pub(super) fn alloc_near(&mut self, target: usize, size: usize) -> Option<NonNull<u8>> {
        let size = size.max(1).next_multiple_of(ALIGNMENT);

        // Reuse an existing page within range first. The whole allocation has
        // to be reachable, so measure from both of its ends.
        for page in self.pages.values_mut() {
            let start = page.mapping.base() + page.used;
            if page.used + size <= page.mapping.len()
                && distance(start, target) < MAX_RANGE
                && distance(start + size, target) < MAX_RANGE
            {
                page.used += size;
                return NonNull::new(start as *mut u8);
            }
        }

        let len = size.next_multiple_of(self.page_size);
        let mapping = self.map_near(target, len)?;
        let base = mapping.base();
        self.pages.insert(base, PageInfo { mapping, used: size });
        NonNull::new(base as *mut u8)
    }

    /// Search outward from the target, alternating below and above it
    fn map_near(&self, target: usize, len: usize) -> Option<Mapping> {
        let step = self.page_size * PROBE_STEP_PAGES;
        let aligned = target - target % self.page_size;

        for i in 0..(MAX_RANGE / step) {
            let delta = i * step;
            for hint in [aligned.checked_sub(delta), aligned.checked_add(delta + step)] {
                let Some(hint) = hint.filter(|&h| h != 0) else {
                    continue;
                };
                let Some(mapping) = Mapping::new(hint, len) else {
                    continue;
                };
                let base = mapping.base();
                if distance(base, target) < MAX_RANGE && distance(base + mapping.len(), target) < MAX_RANGE {
                    return Some(mapping);
                }
                // Mapped too far away to be useful; dropping it unmaps it
            }
        }

        tracing::error!("Failed to allocate glue page near {:#x}", target);
        None
    }
}
