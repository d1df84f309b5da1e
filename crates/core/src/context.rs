//! Engine context
//!
//! One [`EngineContext`] owns everything a load cycle creates: the memory
//! backend, the address range, signatures, patches, caves and hook lists.
//! Dropping it reverts every applied patch in reverse build order.

use std::collections::BTreeMap;
use std::sync::Arc;

use slotmap::{new_key_type, SlotMap};

use crate::address::Address;
use crate::cave::CodeCave;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::gamedata::{Gamedata, GamedataError};
use crate::hooks::HookRegistry;
use crate::memory::CodeMemory;
use crate::patch::{CodePatch, IntegrityStatus, PatchTarget};
use crate::range::AddressRange;
use crate::signature::{Pattern, Signature};

new_key_type! {
    /// Handle for a registered signature
    pub struct SignatureKey;

    /// Handle for a registered patch
    pub struct PatchKey;

    /// Handle for a registered cave
    pub struct CaveKey;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Item {
    Patch(PatchKey),
    Cave(CaveKey),
}

/// Outcome of [`EngineContext::init_all`]
#[derive(Debug, Default)]
pub struct InitReport {
    /// Patches and caves that were built and applied
    pub applied: usize,
    /// Optional items that failed and were left disabled
    pub disabled: Vec<(String, EngineError)>,
}

pub struct EngineContext {
    memory: Box<dyn CodeMemory>,
    config: EngineConfig,
    range: AddressRange,
    discovered_range: Option<(Address, Address)>,
    signatures: SlotMap<SignatureKey, Signature>,
    patches: SlotMap<PatchKey, CodePatch>,
    caves: SlotMap<CaveKey, CodeCave>,
    hooks: Arc<HookRegistry>,
    declared: Vec<Item>,
    built: Vec<Item>,
}

impl EngineContext {
    pub fn new(memory: Box<dyn CodeMemory>, config: EngineConfig) -> Self {
        Self {
            memory,
            config,
            range: AddressRange::default(),
            discovered_range: None,
            signatures: SlotMap::with_key(),
            patches: SlotMap::with_key(),
            caves: SlotMap::with_key(),
            hooks: Arc::new(HookRegistry::new()),
            declared: Vec::new(),
            built: Vec::new(),
        }
    }

    /// Code range of the host image, used where neither the address range
    /// nor the config sets a bound
    pub fn with_discovered_range(mut self, lowest: Address, highest: Address) -> Self {
        self.discovered_range = Some((lowest, highest));
        self
    }

    pub fn memory(&self) -> &dyn CodeMemory {
        self.memory.as_ref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn hooks(&self) -> Arc<HookRegistry> {
        Arc::clone(&self.hooks)
    }

    // ---- Address range ----

    pub fn range(&self) -> &AddressRange {
        &self.range
    }

    pub fn set_lowest(&mut self, address: Address) -> EngineResult<()> {
        self.range.set_lowest(address)
    }

    pub fn set_highest(&mut self, address: Address) -> EngineResult<()> {
        self.range.set_highest(address)
    }

    /// Fallback for unset bounds: config first, then the discovered image range
    pub fn default_range(&self) -> Option<(Address, Address)> {
        self.config.range().or(self.discovered_range)
    }

    pub fn effective_range(&self) -> EngineResult<(Address, Address)> {
        self.range.effective(self.default_range())
    }

    // ---- Signatures ----

    pub fn add_signature(&mut self, signature: Signature) -> SignatureKey {
        tracing::debug!("Registered signature '{}'", signature.name());
        self.signatures.insert(signature)
    }

    /// Parse `pattern` and register it as a signature
    pub fn add_pattern(
        &mut self,
        name: &str,
        required: bool,
        pattern: &str,
    ) -> EngineResult<SignatureKey> {
        let pattern = Pattern::parse(pattern)?;
        Ok(self.add_signature(Signature::new(name, required, pattern)))
    }

    /// Register every gamedata signature, returning name -> key
    pub fn register_gamedata(
        &mut self,
        gamedata: &Gamedata,
    ) -> Result<BTreeMap<String, SignatureKey>, GamedataError> {
        let mut keys = BTreeMap::new();
        for name in gamedata.names() {
            let signature = gamedata.signature(name)?;
            keys.insert(name.to_string(), self.add_signature(signature));
        }
        Ok(keys)
    }

    pub fn signature(&self, key: SignatureKey) -> Option<&Signature> {
        self.signatures.get(key)
    }

    /// Resolve a signature, scanning on first use. Locks the address range.
    pub fn resolve(&mut self, key: SignatureKey) -> EngineResult<Address> {
        let default = self.default_range();
        let signature = self
            .signatures
            .get_mut(key)
            .ok_or(EngineError::UnknownHandle("signature"))?;

        self.range.lock();
        let range = match self.range.effective(default) {
            Ok(range) => range,
            Err(e) => match (signature.lowest(), signature.highest()) {
                (Some(lowest), Some(highest)) => (lowest, highest),
                _ => return Err(e),
            },
        };

        signature.resolve(self.memory.as_ref(), range, self.config.match_policy())
    }

    /// Forget a signature's cached result
    pub fn invalidate(&mut self, key: SignatureKey) -> EngineResult<()> {
        self.signatures
            .get_mut(key)
            .ok_or(EngineError::UnknownHandle("signature"))?
            .invalidate();
        Ok(())
    }

    fn anchor(&mut self, target: PatchTarget) -> EngineResult<Address> {
        match target {
            PatchTarget::Address(address) => Ok(address),
            PatchTarget::Signature { signature, .. } => self.resolve(signature),
        }
    }

    fn check_bounds(&self, name: &str, address: Address, size: usize, required: bool) -> EngineResult<()> {
        // Without any range there is nothing to enforce for fixed addresses
        if self.effective_range().is_err() {
            return Ok(());
        }
        if self.range.contains(self.default_range(), address, size) {
            return Ok(());
        }
        Err(EngineError::OutsideRange {
            name: name.to_string(),
            address,
            size,
            required,
        })
    }

    fn warn_overlaps(&self, item: Item, name: &str, address: Address, size: usize) {
        let patches = self
            .patches
            .iter()
            .filter(|(key, _)| item != Item::Patch(*key))
            .map(|(_, patch)| patch);
        let caves = self
            .caves
            .iter()
            .filter(|(key, _)| item != Item::Cave(*key))
            .map(|(_, cave)| cave.redirect());

        for other in patches.chain(caves) {
            if other.overlaps(address, size) {
                tracing::warn!(
                    "'{}' at {:#x}+{} overlaps '{}' at {:#x}+{}",
                    name,
                    address,
                    size,
                    other.name(),
                    other.address(),
                    other.size()
                );
            }
        }
    }

    // ---- Patches ----

    pub fn add_patch(&mut self, patch: CodePatch) -> PatchKey {
        let key = self.patches.insert(patch);
        self.declared.push(Item::Patch(key));
        key
    }

    pub fn patch(&self, key: PatchKey) -> Option<&CodePatch> {
        self.patches.get(key)
    }

    fn patch_entry(&self, key: PatchKey) -> EngineResult<&CodePatch> {
        self.patches.get(key).ok_or(EngineError::UnknownHandle("patch"))
    }

    pub fn build_patch(&mut self, key: PatchKey) -> EngineResult<()> {
        let patch = self.patch_entry(key)?;
        if patch.is_built() {
            return Ok(());
        }

        let target = patch.target();
        let anchor = self.anchor(target)?;

        let patch = self.patch_entry(key)?;
        let address = patch.locate(anchor)?;
        let (name, size, required) = (patch.name().to_string(), patch.size(), patch.is_required());
        self.check_bounds(&name, address, size, required)?;

        let memory = self.memory.as_ref();
        self.patches
            .get_mut(key)
            .ok_or(EngineError::UnknownHandle("patch"))?
            .build(memory, anchor)?;

        self.warn_overlaps(Item::Patch(key), &name, address, size);
        self.built.push(Item::Patch(key));
        Ok(())
    }

    pub fn apply_patch(&mut self, key: PatchKey) -> EngineResult<()> {
        let memory = self.memory.as_ref();
        self.patches
            .get_mut(key)
            .ok_or(EngineError::UnknownHandle("patch"))?
            .apply(memory)
    }

    /// Restore a patch's original bytes. With `check_integrity_before_revert`
    /// a tampered region is reported first; the revert happens regardless.
    pub fn revert_patch(&mut self, key: PatchKey) -> EngineResult<()> {
        if self.config.check_integrity_before_revert && self.patch_entry(key)?.is_applied() {
            self.check_patch(key)?;
        }
        let memory = self.memory.as_ref();
        self.patches
            .get_mut(key)
            .ok_or(EngineError::UnknownHandle("patch"))?
            .revert(memory)
    }

    pub fn check_patch(&self, key: PatchKey) -> EngineResult<IntegrityStatus> {
        self.patch_entry(key)?.check_integrity(self.memory.as_ref())
    }

    // ---- Caves ----

    pub fn add_cave(&mut self, cave: CodeCave) -> CaveKey {
        let key = self.caves.insert(cave);
        self.declared.push(Item::Cave(key));
        key
    }

    pub fn cave(&self, key: CaveKey) -> Option<&CodeCave> {
        self.caves.get(key)
    }

    fn cave_entry(&self, key: CaveKey) -> EngineResult<&CodeCave> {
        self.caves.get(key).ok_or(EngineError::UnknownHandle("cave"))
    }

    pub fn build_cave(&mut self, key: CaveKey) -> EngineResult<()> {
        let cave = self.cave_entry(key)?;
        if cave.is_built() {
            return Ok(());
        }

        let target = cave.redirect().target();
        let anchor = self.anchor(target)?;

        let redirect = self.cave_entry(key)?.redirect();
        let address = redirect.locate(anchor)?;
        let (name, size, required) = (
            redirect.name().to_string(),
            redirect.size(),
            redirect.is_required(),
        );
        self.check_bounds(&name, address, size, required)?;

        let memory = self.memory.as_ref();
        self.caves
            .get_mut(key)
            .ok_or(EngineError::UnknownHandle("cave"))?
            .build(memory, anchor)?;

        self.warn_overlaps(Item::Cave(key), &name, address, size);
        self.built.push(Item::Cave(key));
        Ok(())
    }

    pub fn apply_cave(&mut self, key: CaveKey) -> EngineResult<()> {
        let memory = self.memory.as_ref();
        self.caves
            .get_mut(key)
            .ok_or(EngineError::UnknownHandle("cave"))?
            .apply(memory)
    }

    pub fn revert_cave(&mut self, key: CaveKey) -> EngineResult<()> {
        if self.config.check_integrity_before_revert && self.cave_entry(key)?.is_applied() {
            self.cave_entry(key)?.check_integrity(self.memory.as_ref())?;
        }
        let memory = self.memory.as_ref();
        self.caves
            .get_mut(key)
            .ok_or(EngineError::UnknownHandle("cave"))?
            .revert(memory)
    }

    // ---- Whole-context operations ----

    fn item_name(&self, item: Item) -> String {
        match item {
            Item::Patch(key) => self.patches.get(key).map(|p| p.name().to_string()),
            Item::Cave(key) => self.caves.get(key).map(|c| c.name().to_string()),
        }
        .unwrap_or_default()
    }

    fn init_item(&mut self, item: Item) -> EngineResult<()> {
        match item {
            Item::Patch(key) => {
                self.build_patch(key)?;
                self.apply_patch(key)
            }
            Item::Cave(key) => {
                self.build_cave(key)?;
                self.apply_cave(key)
            }
        }
    }

    /// Build and apply every declared patch and cave, in declaration order.
    ///
    /// Optional failures are collected in the report; the first fatal one
    /// stops the run and is returned. Already applied items are left alone,
    /// and the caller decides whether to [`teardown`](Self::teardown).
    pub fn init_all(&mut self) -> EngineResult<InitReport> {
        let mut report = InitReport::default();

        for item in self.declared.clone() {
            match self.init_item(item) {
                Ok(()) => report.applied += 1,
                Err(e) if e.is_fatal() => {
                    tracing::error!("Failed to initialize '{}': {}", self.item_name(item), e);
                    return Err(e);
                }
                Err(e) => {
                    let name = self.item_name(item);
                    tracing::warn!("'{}' disabled: {}", name, e);
                    report.disabled.push((name, e));
                }
            }
        }

        tracing::info!(
            "Initialized {} patches ({} disabled)",
            report.applied,
            report.disabled.len()
        );
        Ok(report)
    }

    /// Integrity of every built patch and cave, by name
    pub fn check_all(&self) -> Vec<(String, IntegrityStatus)> {
        let memory = self.memory.as_ref();
        let mut results = Vec::with_capacity(self.built.len());

        for &item in &self.built {
            let status = match item {
                Item::Patch(key) => self.patches.get(key).map(|p| p.check_integrity(memory)),
                Item::Cave(key) => self.caves.get(key).map(|c| c.check_integrity(memory)),
            };
            match status {
                Some(Ok(status)) => results.push((self.item_name(item), status)),
                Some(Err(e)) => {
                    tracing::warn!("Integrity check of '{}' failed: {}", self.item_name(item), e)
                }
                None => {}
            }
        }

        results
    }

    /// Revert everything in reverse build order and clear the hook lists.
    /// Returns how many reverts failed. Safe to call more than once.
    pub fn teardown(&mut self) -> usize {
        let mut failures = 0;

        for item in self.built.clone().into_iter().rev() {
            let result = match item {
                Item::Patch(key) => self.revert_patch(key),
                Item::Cave(key) => self.revert_cave(key),
            };
            if let Err(e) = result {
                tracing::warn!("Failed to revert '{}': {}", self.item_name(item), e);
                failures += 1;
            }
        }

        self.hooks.clear();
        tracing::debug!("Engine context torn down ({} failures)", failures);
        failures
    }
}

impl Drop for EngineContext {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("range", &self.range)
            .field("signatures", &self.signatures.len())
            .field("patches", &self.patches.len())
            .field("caves", &self.caves.len())
            .finish()
    }
}
