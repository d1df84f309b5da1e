//! Legal search/patch range
//!
//! Set once during init, before the first signature is resolved. Bounds
//! that are never set fall back to a default range supplied by the caller
//! (config override or the host image's code section).

use crate::address::Address;
use crate::error::{EngineError, EngineResult};

/// Half-open `[lowest, highest)` range of code memory
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddressRange {
    lowest: Option<Address>,
    highest: Option<Address>,
    locked: bool,
}

impl AddressRange {
    /// A fully specified, unlocked range
    pub fn new(lowest: Address, highest: Address) -> EngineResult<Self> {
        let mut range = Self::default();
        range.set_lowest(lowest)?;
        range.set_highest(highest)?;
        Ok(range)
    }

    pub fn lowest(&self) -> Option<Address> {
        self.lowest
    }

    pub fn highest(&self) -> Option<Address> {
        self.highest
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Set the lowest permitted address. A null address clears the bound.
    pub fn set_lowest(&mut self, address: Address) -> EngineResult<()> {
        self.ensure_unlocked()?;
        let lowest = Some(address).filter(|a| !a.is_null());
        Self::validate(lowest, self.highest)?;
        self.lowest = lowest;
        Ok(())
    }

    /// Set the highest permitted address (exclusive). A null address clears the bound.
    pub fn set_highest(&mut self, address: Address) -> EngineResult<()> {
        self.ensure_unlocked()?;
        let highest = Some(address).filter(|a| !a.is_null());
        Self::validate(self.lowest, highest)?;
        self.highest = highest;
        Ok(())
    }

    /// Freeze the range; called when scanning starts
    pub(crate) fn lock(&mut self) {
        if !self.locked {
            tracing::debug!(
                "Address range locked: {:?}..{:?}",
                self.lowest,
                self.highest
            );
        }
        self.locked = true;
    }

    /// Concrete bounds, filling unset ones from `default`
    pub fn effective(&self, default: Option<(Address, Address)>) -> EngineResult<(Address, Address)> {
        let lowest = self.lowest.or(default.map(|d| d.0));
        let highest = self.highest.or(default.map(|d| d.1));

        match (lowest, highest) {
            (Some(lowest), Some(highest)) if lowest < highest => Ok((lowest, highest)),
            (Some(lowest), Some(highest)) => Err(EngineError::InvalidRange { lowest, highest }),
            _ => Err(EngineError::RangeNotConfigured),
        }
    }

    /// Whether `[address, address + len)` lies inside the effective range
    pub fn contains(&self, default: Option<(Address, Address)>, address: Address, len: usize) -> bool {
        let Ok((lowest, highest)) = self.effective(default) else {
            return false;
        };
        let Some(end) = address.checked_add(len) else {
            return false;
        };
        address >= lowest && end <= highest
    }

    fn ensure_unlocked(&self) -> EngineResult<()> {
        if self.locked {
            Err(EngineError::RangeLocked)
        } else {
            Ok(())
        }
    }

    fn validate(lowest: Option<Address>, highest: Option<Address>) -> EngineResult<()> {
        match (lowest, highest) {
            (Some(lowest), Some(highest)) if lowest >= highest => {
                Err(EngineError::InvalidRange { lowest, highest })
            }
            _ => Ok(()),
        }
    }
}
