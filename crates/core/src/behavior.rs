//! Behavior slots
//!
//! Some host behaviors are swapped rather than patched: a slot holds the
//! original implementation and, optionally, a replacement installed by a
//! feature module. Callers always go through [`BehaviorTable::current`].

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

/// Error type for behavior slot operations
#[derive(Debug, thiserror::Error)]
pub enum BehaviorError {
    #[error("Unknown behavior slot: {0}")]
    UnknownSlot(String),

    #[error("Behavior slot already registered: {0}")]
    SlotAlreadyRegistered(String),
}

struct SlotEntry<F> {
    original: F,
    replacement: Option<F>,
}

/// Table from slot identifiers to the active implementation of each
pub struct BehaviorTable<S, F> {
    slots: HashMap<S, SlotEntry<F>>,
}

impl<S, F> Default for BehaviorTable<S, F> {
    fn default() -> Self {
        Self {
            slots: HashMap::new(),
        }
    }
}

impl<S, F> BehaviorTable<S, F>
where
    S: Copy + Eq + Hash + Debug,
    F: Copy,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a slot with its original implementation
    pub fn register(&mut self, slot: S, original: F) -> Result<(), BehaviorError> {
        if self.slots.contains_key(&slot) {
            return Err(BehaviorError::SlotAlreadyRegistered(format!("{:?}", slot)));
        }
        self.slots.insert(
            slot,
            SlotEntry {
                original,
                replacement: None,
            },
        );
        tracing::debug!("Registered behavior slot {:?}", slot);
        Ok(())
    }

    /// Install `replacement`, returning the implementation it displaces
    pub fn install(&mut self, slot: S, replacement: F) -> Result<F, BehaviorError> {
        let entry = self.entry_mut(slot)?;
        let previous = entry.replacement.unwrap_or(entry.original);
        entry.replacement = Some(replacement);
        tracing::info!("Installed behavior for slot {:?}", slot);
        Ok(previous)
    }

    /// Restore the original. Returns `false` if nothing was installed.
    pub fn uninstall(&mut self, slot: S) -> Result<bool, BehaviorError> {
        let removed = self.entry_mut(slot)?.replacement.take().is_some();
        if removed {
            tracing::info!("Uninstalled behavior for slot {:?}", slot);
        }
        Ok(removed)
    }

    /// The implementation callers should use
    pub fn current(&self, slot: S) -> Result<F, BehaviorError> {
        let entry = self.entry(slot)?;
        Ok(entry.replacement.unwrap_or(entry.original))
    }

    pub fn original(&self, slot: S) -> Result<F, BehaviorError> {
        Ok(self.entry(slot)?.original)
    }

    pub fn is_installed(&self, slot: S) -> bool {
        self.slots
            .get(&slot)
            .is_some_and(|entry| entry.replacement.is_some())
    }

    pub fn is_registered(&self, slot: S) -> bool {
        self.slots.contains_key(&slot)
    }

    /// Restore every original, returning how many slots changed
    pub fn uninstall_all(&mut self) -> usize {
        self.slots
            .values_mut()
            .filter_map(|entry| entry.replacement.take())
            .count()
    }

    fn entry(&self, slot: S) -> Result<&SlotEntry<F>, BehaviorError> {
        self.slots
            .get(&slot)
            .ok_or_else(|| BehaviorError::UnknownSlot(format!("{:?}", slot)))
    }

    fn entry_mut(&mut self, slot: S) -> Result<&mut SlotEntry<F>, BehaviorError> {
        self.slots
            .get_mut(&slot)
            .ok_or_else(|| BehaviorError::UnknownSlot(format!("{:?}", slot)))
    }
}
