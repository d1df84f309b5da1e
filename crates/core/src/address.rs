//! Code addresses
//!
//! Addresses are kept distinct from plain integers so that offsets, sizes and
//! displacements can't be mixed up with locations by accident.

use std::fmt;

/// A location in the host process's address space
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Address(usize);

impl Address {
    /// The null address, used by the host to mean "unset"
    pub const NULL: Address = Address(0);

    pub const fn new(value: usize) -> Self {
        Self(value)
    }

    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    pub const fn get(self) -> usize {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn as_ptr(self) -> *const u8 {
        self.0 as *const u8
    }

    pub fn as_mut_ptr(self) -> *mut u8 {
        self.0 as *mut u8
    }

    /// Move forward by `len` bytes, `None` on overflow
    pub fn checked_add(self, len: usize) -> Option<Address> {
        self.0.checked_add(len).map(Address)
    }

    /// Move by a signed byte offset, `None` if the result leaves the address space
    pub fn checked_offset(self, offset: isize) -> Option<Address> {
        self.0.checked_add_signed(offset).map(Address)
    }

    /// Number of bytes from `self` up to `end`, `None` if `end` lies below
    pub fn distance_to(self, end: Address) -> Option<usize> {
        end.0.checked_sub(self.0)
    }

    /// Relative displacement from `self` to `target` as encoded by x86 rel32
    /// branches, where `self` is the address of the *next* instruction.
    ///
    /// Returns `None` if the distance doesn't fit in 32 signed bits.
    pub fn rel32_to(self, target: Address) -> Option<i32> {
        let delta = (target.0 as i128) - (self.0 as i128);
        i32::try_from(delta).ok()
    }
}

impl From<usize> for Address {
    fn from(value: usize) -> Self {
        Self(value)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({:#x})", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::LowerHex for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}
