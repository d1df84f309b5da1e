//! Code patches
//!
//! A [`CodePatch`] owns one contiguous region of code: where it is, what was
//! there before, and what replaces it. Patches move through
//! `Unbuilt -> Reverted <-> Applied`; every transition that is already
//! satisfied is a no-op.

pub mod encoder;

pub use encoder::{
    branch_target, encode, retarget_branch, Condition, Payload, PatchBytes, PatchKind,
};

use crate::address::Address;
use crate::context::SignatureKey;
use crate::error::{EngineError, EngineResult};
use crate::memory::CodeMemory;

/// Where a patch goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchTarget {
    /// Resolved signature address plus a signed offset
    Signature { signature: SignatureKey, offset: isize },
    /// A fixed address
    Address(Address),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchState {
    Unbuilt,
    Reverted,
    Applied,
}

/// Result of comparing live code with what a patch expects to find there
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityStatus {
    Intact,
    /// Live bytes differ from the expected state at `offset`
    Mismatch { offset: usize, expected: u8, found: u8 },
    NotBuilt,
}

impl IntegrityStatus {
    pub fn is_intact(&self) -> bool {
        matches!(self, IntegrityStatus::Intact)
    }
}

#[derive(Debug, Clone)]
pub struct CodePatch {
    name: String,
    target: PatchTarget,
    size: usize,
    kind: PatchKind,
    payload: Option<Payload>,
    required: bool,
    state: PatchState,
    address: Address,
    end: Address,
    original: PatchBytes,
    patched: PatchBytes,
}

impl CodePatch {
    pub fn new(name: impl Into<String>, target: PatchTarget, size: usize, kind: PatchKind) -> Self {
        Self {
            name: name.into(),
            target,
            size,
            kind,
            payload: None,
            required: true,
            state: PatchState::Unbuilt,
            address: Address::NULL,
            end: Address::NULL,
            original: PatchBytes::default(),
            patched: PatchBytes::default(),
        }
    }

    /// Patch `size` bytes at `offset` from a signature's match
    pub fn at_signature(
        name: impl Into<String>,
        signature: SignatureKey,
        offset: isize,
        size: usize,
        kind: PatchKind,
    ) -> Self {
        Self::new(name, PatchTarget::Signature { signature, offset }, size, kind)
    }

    /// Patch `size` bytes at a fixed address
    pub fn at_address(name: impl Into<String>, address: Address, size: usize, kind: PatchKind) -> Self {
        Self::new(name, PatchTarget::Address(address), size, kind)
    }

    /// Destination for `Call`, `Jump` and `ConditionalJump`
    pub fn with_redirect(mut self, target: Address) -> Self {
        self.payload = Some(Payload::Redirect(target));
        self
    }

    /// Bytes for `Manual`
    pub fn with_bytes(mut self, bytes: impl Into<PatchBytes>) -> Self {
        self.payload = Some(Payload::Bytes(bytes.into()));
        self
    }

    /// Failures of an optional patch disable it instead of aborting the load
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub(crate) fn set_redirect(&mut self, target: Address) {
        self.payload = Some(Payload::Redirect(target));
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> PatchTarget {
        self.target
    }

    pub fn kind(&self) -> PatchKind {
        self.kind
    }

    pub fn payload(&self) -> Option<&Payload> {
        self.payload.as_ref()
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn state(&self) -> PatchState {
        self.state
    }

    pub fn is_built(&self) -> bool {
        self.state != PatchState::Unbuilt
    }

    pub fn is_applied(&self) -> bool {
        self.state == PatchState::Applied
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Patched address; null until built
    pub fn address(&self) -> Address {
        self.address
    }

    /// First address after the patched region; null until built
    pub fn return_address(&self) -> Address {
        self.end
    }

    pub fn original_bytes(&self) -> &PatchBytes {
        &self.original
    }

    pub fn patched_bytes(&self) -> &PatchBytes {
        &self.patched
    }

    /// The bytes currently in memory over the patched region
    pub fn live_bytes(&self, memory: &dyn CodeMemory) -> EngineResult<PatchBytes> {
        Ok(memory.read_vec(self.address, self.size)?.into())
    }

    /// Where the patch lands given the address its target resolved to.
    /// For signature targets `anchor` is the match; for fixed ones it is
    /// the address itself.
    pub fn locate(&self, anchor: Address) -> EngineResult<Address> {
        match self.target {
            PatchTarget::Address(address) => Ok(address),
            PatchTarget::Signature { offset, .. } => {
                anchor
                    .checked_offset(offset)
                    .ok_or(EngineError::AddressOverflow {
                        base: anchor,
                        offset,
                    })
            }
        }
    }

    /// Capture the original bytes and encode the replacement.
    ///
    /// Building an already built patch does nothing.
    pub fn build(&mut self, memory: &dyn CodeMemory, anchor: Address) -> EngineResult<()> {
        if self.is_built() {
            return Ok(());
        }

        let address = self.locate(anchor)?;
        let end = address
            .checked_add(self.size)
            .ok_or(EngineError::AddressOverflow {
                base: address,
                offset: self.size as isize,
            })?;
        let patched = encode(&self.name, self.kind, address, self.size, self.payload.as_ref())?;

        let original = memory
            .read_vec(address, self.size)
            .map_err(|source| EngineError::MemoryReadFailed {
                name: self.name.clone(),
                address,
                source,
            })?;

        self.address = address;
        self.end = end;
        self.original = original.into();
        self.patched = patched;
        self.state = PatchState::Reverted;

        tracing::debug!(
            "Built patch '{}' ({:?}, {} bytes) at {:#x}",
            self.name,
            self.kind,
            self.size,
            self.address
        );
        Ok(())
    }

    /// Write the patched bytes
    pub fn apply(&mut self, memory: &dyn CodeMemory) -> EngineResult<()> {
        match self.state {
            PatchState::Unbuilt => {
                tracing::debug!("Patch '{}' not built, nothing to apply", self.name);
                return Ok(());
            }
            PatchState::Applied => return Ok(()),
            PatchState::Reverted => {}
        }

        self.write(memory, PatchState::Applied)?;
        tracing::info!("Applied patch '{}' at {:#x}", self.name, self.address);
        Ok(())
    }

    /// Restore the original bytes
    pub fn revert(&mut self, memory: &dyn CodeMemory) -> EngineResult<()> {
        if self.state != PatchState::Applied {
            return Ok(());
        }

        self.write(memory, PatchState::Reverted)?;
        tracing::info!("Reverted patch '{}' at {:#x}", self.name, self.address);
        Ok(())
    }

    fn write(&mut self, memory: &dyn CodeMemory, next: PatchState) -> EngineResult<()> {
        let bytes = match next {
            PatchState::Applied => &self.patched,
            _ => &self.original,
        };

        if let Err(source) = memory.write(self.address, bytes) {
            if self.required {
                tracing::error!("Patch '{}' write failed: {}", self.name, source);
            } else {
                tracing::warn!("Optional patch '{}' write failed: {}", self.name, source);
            }
            return Err(EngineError::MemoryWriteDenied {
                name: self.name.clone(),
                address: self.address,
                required: self.required,
                source,
            });
        }

        self.state = next;
        Ok(())
    }

    /// Compare live code with the bytes expected in the current state.
    ///
    /// Only reports; never rewrites anything.
    pub fn check_integrity(&self, memory: &dyn CodeMemory) -> EngineResult<IntegrityStatus> {
        let expected = match self.state {
            PatchState::Unbuilt => return Ok(IntegrityStatus::NotBuilt),
            PatchState::Applied => &self.patched,
            PatchState::Reverted => &self.original,
        };

        let live = self.live_bytes(memory)?;
        let Some(offset) = expected.first_difference(&live) else {
            return Ok(IntegrityStatus::Intact);
        };

        let status = IntegrityStatus::Mismatch {
            offset,
            expected: expected[offset],
            found: live[offset],
        };
        tracing::warn!(
            "Patch '{}' integrity mismatch at {:#x}+{}: expected {:02X}, found {:02X}",
            self.name,
            self.address,
            offset,
            expected[offset],
            live[offset]
        );
        Ok(status)
    }

    /// Whether `[address, address + len)` intersects this built patch
    pub fn overlaps(&self, address: Address, len: usize) -> bool {
        self.is_built()
            && address < self.end
            && self.address.get() < address.get().saturating_add(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ImageMemory, MemoryError};

    const BASE: Address = Address::new(0x40_1000);

    fn image() -> ImageMemory {
        let mut code = vec![0x55, 0x8B, 0xEC, 0x83, 0xEC, 0x08, 0x33, 0xC0, 0xC3];
        code.resize(0x20, 0xCC);
        ImageMemory::new(BASE, code)
    }

    #[test]
    fn test_build_apply_revert() {
        let memory = image();
        let before = memory.snapshot();

        let mut patch = CodePatch::at_address("nop", Address::new(0x40_1003), 3, PatchKind::Nop);
        patch.build(&memory, Address::NULL).unwrap();
        assert_eq!(patch.original_bytes().as_slice(), &[0x83, 0xEC, 0x08]);
        assert_eq!(patch.return_address(), Address::new(0x40_1006));
        assert!(!patch.is_applied());

        patch.apply(&memory).unwrap();
        assert_eq!(patch.live_bytes(&memory).unwrap().as_slice(), &[0x90; 3]);
        assert!(patch.check_integrity(&memory).unwrap().is_intact());

        patch.revert(&memory).unwrap();
        assert_eq!(memory.snapshot(), before);
    }

    #[test]
    fn test_transitions_are_idempotent() {
        let memory = image();
        let mut patch = CodePatch::at_address("int3", BASE, 2, PatchKind::Interrupt);

        patch.apply(&memory).unwrap();
        assert_eq!(patch.state(), PatchState::Unbuilt);

        patch.build(&memory, Address::NULL).unwrap();
        patch.apply(&memory).unwrap();
        patch.apply(&memory).unwrap();
        assert_eq!(memory.read_vec(BASE, 3).unwrap(), vec![0xCC, 0xCC, 0xEC]);

        // a second build must not capture the patched bytes as original
        patch.build(&memory, Address::NULL).unwrap();
        patch.revert(&memory).unwrap();
        patch.revert(&memory).unwrap();
        assert_eq!(memory.read_vec(BASE, 3).unwrap(), vec![0x55, 0x8B, 0xEC]);
    }

    #[test]
    fn test_tampering_is_reported_and_revert_restores() {
        let memory = image();
        let mut patch = CodePatch::at_address("nop", BASE, 3, PatchKind::Nop);
        patch.build(&memory, Address::NULL).unwrap();
        patch.apply(&memory).unwrap();

        memory.write(Address::new(0x40_1001), &[0xAB]).unwrap();
        assert_eq!(
            patch.check_integrity(&memory).unwrap(),
            IntegrityStatus::Mismatch {
                offset: 1,
                expected: 0x90,
                found: 0xAB
            }
        );

        patch.revert(&memory).unwrap();
        assert_eq!(memory.read_vec(BASE, 3).unwrap(), vec![0x55, 0x8B, 0xEC]);
        assert!(patch.check_integrity(&memory).unwrap().is_intact());
    }

    #[test]
    fn test_unbuilt_integrity() {
        let memory = image();
        let patch = CodePatch::at_address("nop", BASE, 1, PatchKind::Nop);
        assert_eq!(patch.check_integrity(&memory).unwrap(), IntegrityStatus::NotBuilt);
        assert_eq!(patch.return_address(), Address::NULL);
    }

    #[test]
    fn test_out_of_image_write_is_denied() {
        let memory = image();
        let mut patch = CodePatch::at_address("far", Address::new(0x40_101E), 4, PatchKind::Nop).optional();

        let err = patch.build(&memory, Address::NULL).unwrap_err();
        assert!(matches!(err, EngineError::MemoryReadFailed { .. }));
        assert!(!patch.is_built());
    }

    /// Image whose writes are always refused
    struct ReadOnly(ImageMemory);

    impl CodeMemory for ReadOnly {
        fn read(&self, address: Address, buf: &mut [u8]) -> Result<(), MemoryError> {
            self.0.read(address, buf)
        }

        fn write(&self, address: Address, _bytes: &[u8]) -> Result<(), MemoryError> {
            Err(MemoryError::Protection {
                address,
                reason: "read-only".to_string(),
            })
        }

        fn allocate_near(&self, near: Address, size: usize) -> Result<Address, MemoryError> {
            self.0.allocate_near(near, size)
        }
    }

    #[test]
    fn test_denied_write_leaves_state_unchanged() {
        let memory = ReadOnly(image());

        let mut required = CodePatch::at_address("required", BASE, 3, PatchKind::Nop);
        required.build(&memory, Address::NULL).unwrap();
        let err = required.apply(&memory).unwrap_err();
        assert!(matches!(
            err,
            EngineError::MemoryWriteDenied { required: true, .. }
        ));
        assert!(err.is_fatal());
        assert_eq!(required.state(), PatchState::Reverted);
        assert!(!required.is_applied());

        let mut optional = CodePatch::at_address("optional", BASE, 3, PatchKind::Nop).optional();
        optional.build(&memory, Address::NULL).unwrap();
        let err = optional.apply(&memory).unwrap_err();
        assert!(!err.is_fatal());
        assert!(!optional.is_applied());
        assert_eq!(memory.0.read_vec(BASE, 3).unwrap(), vec![0x55, 0x8B, 0xEC]);
    }

    #[test]
    fn test_denied_revert_keeps_patch_applied() {
        let image = image();
        let mut patch = CodePatch::at_address("nop", BASE, 2, PatchKind::Nop);
        patch.build(&image, Address::NULL).unwrap();
        patch.apply(&image).unwrap();

        let memory = ReadOnly(image);
        assert!(matches!(
            patch.revert(&memory),
            Err(EngineError::MemoryWriteDenied { .. })
        ));
        assert!(patch.is_applied());
    }

    #[test]
    fn test_region_past_address_space_end() {
        let memory = image();
        let mut patch = CodePatch::at_address("wrap", Address::new(usize::MAX - 1), 4, PatchKind::Nop);

        assert!(matches!(
            patch.build(&memory, Address::NULL),
            Err(EngineError::AddressOverflow { .. })
        ));
        assert!(!patch.is_built());
        assert_eq!(patch.return_address(), Address::NULL);
    }

    #[test]
    fn test_signature_offset() {
        let mut keys = slotmap::SlotMap::<SignatureKey, ()>::with_key();
        let key = keys.insert(());

        let patch = CodePatch::at_signature("sig", key, -2, 1, PatchKind::Nop);
        assert_eq!(patch.locate(Address::new(0x40_1005)).unwrap(), Address::new(0x40_1003));
        assert!(patch.locate(Address::new(1)).is_err());
    }

    #[test]
    fn test_overlap() {
        let memory = image();
        let mut patch = CodePatch::at_address("nop", Address::new(0x40_1004), 4, PatchKind::Nop);
        assert!(!patch.overlaps(BASE, 0x20));

        patch.build(&memory, Address::NULL).unwrap();
        assert!(patch.overlaps(Address::new(0x40_1007), 1));
        assert!(patch.overlaps(Address::new(0x40_1000), 5));
        assert!(!patch.overlaps(Address::new(0x40_1008), 4));
        assert!(!patch.overlaps(Address::new(0x40_1000), 4));
    }
}
