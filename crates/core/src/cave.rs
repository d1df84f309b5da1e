//! Code caves
//!
//! A cave diverts execution at a patch site into a generated glue block:
//!
//! ```text
//! target:  jmp glue
//! glue:    save; call before; restore
//!          [jz skip]                     SkipOriginalOnFalse only
//!          <relocated original bytes>
//! skip:    save; call after; restore
//!          jmp target + size
//! ```
//!
//! The relocated bytes see exactly the registers and flags the host had at
//! the patch site. Each callback runs inside a frame that saves the flags and
//! every caller-saved register, aligns the stack to 16 bytes and, on x86-64,
//! leaves the red zone and shadow space alone. Callbacks are reached through
//! an absolute address, so they may live anywhere in the address space; only
//! the glue itself has to sit within rel32 reach of the target.

use crate::address::Address;
use crate::error::{EngineError, EngineResult};
use crate::memory::CodeMemory;
use crate::patch::encoder::{self, JMP_REL32, JMP_REL8, JCC_REL32_LEN, REL32_LEN, REL8_LEN};
use crate::patch::{Condition, CodePatch, IntegrityStatus, PatchKind, PatchTarget};

#[cfg(target_pointer_width = "64")]
mod frame {
    /// lea rsp, [rsp-0x80]; pushfq; push rax, rcx, rdx, rsi, rdi, r8-r11;
    /// push rbx; mov rbx, rsp; and rsp, -16; sub rsp, 0x20
    pub const SAVE: &[u8] = &[
        0x48, 0x8D, 0x64, 0x24, 0x80, //
        0x9C, //
        0x50, 0x51, 0x52, 0x56, 0x57, //
        0x41, 0x50, 0x41, 0x51, 0x41, 0x52, 0x41, 0x53, //
        0x53, //
        0x48, 0x89, 0xE3, //
        0x48, 0x83, 0xE4, 0xF0, //
        0x48, 0x83, 0xEC, 0x20,
    ];

    /// mov rax, imm64
    pub const LOAD_CALLEE: &[u8] = &[0x48, 0xB8];

    /// mov rsp, rbx; pop rbx; pop r11-r8, rdi, rsi, rdx, rcx, rax
    pub const RESTORE_REGS: &[u8] = &[
        0x48, 0x89, 0xDC, //
        0x5B, //
        0x41, 0x5B, 0x41, 0x5A, 0x41, 0x59, 0x41, 0x58, //
        0x5F, 0x5E, 0x5A, 0x59, 0x58,
    ];

    /// popfq; lea rsp, [rsp+0x80]
    pub const RESTORE_FLAGS: &[u8] = &[0x9D, 0x48, 0x8D, 0xA4, 0x24, 0x80, 0x00, 0x00, 0x00];
}

#[cfg(not(target_pointer_width = "64"))]
mod frame {
    /// pushfd; pushad; mov ebx, esp; and esp, -16
    pub const SAVE: &[u8] = &[0x9C, 0x60, 0x89, 0xE3, 0x83, 0xE4, 0xF0];

    /// mov eax, imm32
    pub const LOAD_CALLEE: &[u8] = &[0xB8];

    /// mov esp, ebx; popad
    pub const RESTORE_REGS: &[u8] = &[0x89, 0xDC, 0x61];

    /// popfd
    pub const RESTORE_FLAGS: &[u8] = &[0x9D];
}

use frame::{LOAD_CALLEE, RESTORE_FLAGS, RESTORE_REGS, SAVE};

/// call rax / call eax
const CALL_ACCUMULATOR: &[u8] = &[0xFF, 0xD0];

const TEST_AL_AL: &[u8] = &[0x84, 0xC0];

/// Callback run before the relocated code. Its return value only matters
/// under [`CavePolicy::SkipOriginalOnFalse`].
pub type BeforeFn = extern "C" fn() -> bool;

/// Callback run after the relocated code
pub type AfterFn = extern "C" fn();

/// Whether the "before" callback can suppress the original code
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CavePolicy {
    #[default]
    AlwaysRunOriginal,
    /// Skip the relocated code when "before" returns `false`
    SkipOriginalOnFalse,
}

#[derive(Debug, Clone)]
pub struct CodeCave {
    name: String,
    redirect: CodePatch,
    before: Address,
    after: Address,
    policy: CavePolicy,
    glue: Address,
    glue_len: usize,
}

impl CodeCave {
    /// Cave over `size` bytes at `target`, calling `before` and `after`
    /// around the displaced code
    pub fn new(
        name: impl Into<String>,
        target: PatchTarget,
        size: usize,
        before: Address,
        after: Address,
    ) -> Self {
        let name = name.into();
        Self {
            redirect: CodePatch::new(format!("{}::redirect", name), target, size, PatchKind::Jump),
            name,
            before,
            after,
            policy: CavePolicy::default(),
            glue: Address::NULL,
            glue_len: 0,
        }
    }

    /// Cave with typed callbacks
    pub fn with_callbacks(
        name: impl Into<String>,
        target: PatchTarget,
        size: usize,
        before: BeforeFn,
        after: AfterFn,
    ) -> Self {
        Self::new(
            name,
            target,
            size,
            Address::new(before as usize),
            Address::new(after as usize),
        )
    }

    pub fn with_policy(mut self, policy: CavePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn optional(mut self) -> Self {
        self.redirect = self.redirect.optional();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> CavePolicy {
        self.policy
    }

    pub fn before(&self) -> Address {
        self.before
    }

    pub fn after(&self) -> Address {
        self.after
    }

    /// The jump written over the target
    pub fn redirect(&self) -> &CodePatch {
        &self.redirect
    }

    pub fn is_built(&self) -> bool {
        self.redirect.is_built()
    }

    pub fn is_applied(&self) -> bool {
        self.redirect.is_applied()
    }

    /// Start of the glue block; null until built
    pub fn glue_address(&self) -> Address {
        self.glue
    }

    pub fn glue_len(&self) -> usize {
        self.glue_len
    }

    /// Where execution resumes in the original code
    pub fn continuation(&self) -> Address {
        self.redirect.return_address()
    }

    /// Allocate and write the glue block, then build the redirect to it.
    /// Building twice is a no-op.
    pub fn build(&mut self, memory: &dyn CodeMemory, anchor: Address) -> EngineResult<()> {
        if self.is_built() {
            return Ok(());
        }

        let size = self.redirect.size();
        let minimum = PatchKind::Jump.minimum_size();
        if size < minimum {
            return Err(EngineError::PatchSizeTooSmall {
                name: self.name.clone(),
                kind: PatchKind::Jump,
                size,
                minimum,
            });
        }

        let target = self.redirect.locate(anchor)?;
        let original = memory
            .read_vec(target, size)
            .map_err(|source| EngineError::MemoryReadFailed {
                name: self.name.clone(),
                address: target,
                source,
            })?;

        let glue_len = glue_len(size, self.policy);
        let glue = memory
            .allocate_near(target, glue_len)
            .map_err(|source| EngineError::CaveAllocation {
                name: self.name.clone(),
                near: target,
                source,
            })?;

        let layout = GlueLayout {
            glue,
            target,
            original: &original,
            before: self.before,
            after: self.after,
            policy: self.policy,
        };
        let code = layout.assemble(&self.name)?;

        memory
            .write(glue, &code)
            .map_err(|source| EngineError::MemoryWriteDenied {
                name: self.name.clone(),
                address: glue,
                required: self.redirect.is_required(),
                source,
            })?;

        self.redirect.set_redirect(glue);
        self.redirect.build(memory, anchor)?;
        self.glue = glue;
        self.glue_len = code.len();

        tracing::debug!(
            "Built cave '{}': {:#x} -> glue {:#x} ({} bytes), resumes at {:#x}",
            self.name,
            target,
            glue,
            code.len(),
            self.continuation()
        );
        Ok(())
    }

    pub fn apply(&mut self, memory: &dyn CodeMemory) -> EngineResult<()> {
        self.redirect.apply(memory)
    }

    pub fn revert(&mut self, memory: &dyn CodeMemory) -> EngineResult<()> {
        self.redirect.revert(memory)
    }

    pub fn check_integrity(&self, memory: &dyn CodeMemory) -> EngineResult<IntegrityStatus> {
        self.redirect.check_integrity(memory)
    }
}

/// Bytes needed for the glue around `size` relocated bytes
pub fn glue_len(size: usize, policy: CavePolicy) -> usize {
    let call = SAVE.len() + LOAD_CALLEE.len() + std::mem::size_of::<usize>() + CALL_ACCUMULATOR.len();
    let restore = RESTORE_REGS.len() + RESTORE_FLAGS.len();
    let skip = match policy {
        CavePolicy::AlwaysRunOriginal => 0,
        CavePolicy::SkipOriginalOnFalse => {
            TEST_AL_AL.len() + JCC_REL32_LEN + REL8_LEN + RESTORE_FLAGS.len()
        }
    };
    2 * (call + restore) + skip + size + REL32_LEN
}

struct GlueLayout<'a> {
    glue: Address,
    target: Address,
    original: &'a [u8],
    before: Address,
    after: Address,
    policy: CavePolicy,
}

impl GlueLayout<'_> {
    fn assemble(&self, name: &str) -> EngineResult<Vec<u8>> {
        let mut code = Vec::with_capacity(glue_len(self.original.len(), self.policy));

        push_call(&mut code, self.before);
        match self.policy {
            CavePolicy::AlwaysRunOriginal => {
                code.extend_from_slice(RESTORE_REGS);
                code.extend_from_slice(RESTORE_FLAGS);
                self.push_original(&mut code, name)?;
            }
            CavePolicy::SkipOriginalOnFalse => {
                // ZF comes from the callback's result; the register pops leave
                // it alone, so the flags are restored on both paths after the jz
                code.extend_from_slice(TEST_AL_AL);
                code.extend_from_slice(RESTORE_REGS);
                let fixup = code.len();
                code.extend_from_slice(&[0; JCC_REL32_LEN]);

                code.extend_from_slice(RESTORE_FLAGS);
                self.push_original(&mut code, name)?;
                code.extend_from_slice(&[JMP_REL8, RESTORE_FLAGS.len() as u8]);

                let jz = encoder::encode_branch(
                    name,
                    &Condition::Equal.opcode(),
                    self.offset(fixup),
                    self.here(&code),
                )?;
                code[fixup..fixup + JCC_REL32_LEN].copy_from_slice(&jz);
                code.extend_from_slice(RESTORE_FLAGS);
            }
        }

        push_call(&mut code, self.after);
        code.extend_from_slice(RESTORE_REGS);
        code.extend_from_slice(RESTORE_FLAGS);

        let resume = self
            .target
            .checked_add(self.original.len())
            .ok_or(EngineError::AddressOverflow {
                base: self.target,
                offset: self.original.len() as isize,
            })?;
        let jmp = encoder::encode_branch(name, &[JMP_REL32], self.here(&code), resume)?;
        code.extend_from_slice(&jmp);
        Ok(code)
    }

    fn push_original(&self, code: &mut Vec<u8>, name: &str) -> EngineResult<()> {
        let relocated = encoder::relocate(name, self.original, self.target, self.here(code))?;
        code.extend_from_slice(&relocated);
        Ok(())
    }

    fn here(&self, code: &[u8]) -> Address {
        self.offset(code.len())
    }

    fn offset(&self, at: usize) -> Address {
        Address::new(self.glue.get() + at)
    }
}

/// Save the host's state, then call `callee` through its absolute address
fn push_call(code: &mut Vec<u8>, callee: Address) {
    code.extend_from_slice(SAVE);
    code.extend_from_slice(LOAD_CALLEE);
    code.extend_from_slice(&callee.get().to_le_bytes());
    code.extend_from_slice(CALL_ACCUMULATOR);
}
