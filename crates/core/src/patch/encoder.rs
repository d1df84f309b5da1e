//! Patch byte encoding
//!
//! Pure functions from a patch description to the bytes it writes. The only
//! instructions understood here are the fixed-width ones the engine emits
//! itself: `nop`, `int3`, short `jmp`, and rel32 `call`/`jmp`/`jcc`.

use std::ops::Deref;

use crate::address::Address;
use crate::error::{EngineError, EngineResult};
use crate::memory::CodeMemory;

pub const NOP: u8 = 0x90;
pub const INT3: u8 = 0xCC;
pub const CALL_REL32: u8 = 0xE8;
pub const JMP_REL32: u8 = 0xE9;
pub const JMP_REL8: u8 = 0xEB;
pub const JCC_PREFIX: u8 = 0x0F;

/// Width of a rel32 `call`/`jmp`
pub const REL32_LEN: usize = 5;
/// Width of a rel32 `jcc`
pub const JCC_REL32_LEN: usize = 6;
/// Width of a short `jmp`
pub const REL8_LEN: usize = 2;

/// Condition code of a near conditional jump (`0F 8x`)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Condition {
    Overflow = 0x80,
    NoOverflow = 0x81,
    Below = 0x82,
    AboveOrEqual = 0x83,
    Equal = 0x84,
    NotEqual = 0x85,
    BelowOrEqual = 0x86,
    #[default]
    Above = 0x87,
    Sign = 0x88,
    NoSign = 0x89,
    Parity = 0x8A,
    NoParity = 0x8B,
    Less = 0x8C,
    GreaterOrEqual = 0x8D,
    LessOrEqual = 0x8E,
    Greater = 0x8F,
}

impl Condition {
    pub fn opcode(self) -> [u8; 2] {
        [JCC_PREFIX, self as u8]
    }
}

/// What a patch writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatchKind {
    /// Fill with `nop`
    Nop,
    /// `call` the redirect target
    Call,
    /// `jmp` to the redirect target
    Jump,
    /// Conditionally jump to the redirect target
    ConditionalJump(Condition),
    /// Jump over the patched region
    Skip,
    /// Fill with `int3`
    Interrupt,
    /// Write caller-supplied bytes
    Manual,
}

impl PatchKind {
    /// Smallest region the kind can be encoded into
    pub fn minimum_size(self) -> usize {
        match self {
            PatchKind::Nop | PatchKind::Interrupt | PatchKind::Manual => 1,
            PatchKind::Call | PatchKind::Jump => REL32_LEN,
            PatchKind::ConditionalJump(_) => JCC_REL32_LEN,
            PatchKind::Skip => REL8_LEN,
        }
    }

    pub fn needs_redirect(self) -> bool {
        matches!(
            self,
            PatchKind::Call | PatchKind::Jump | PatchKind::ConditionalJump(_)
        )
    }
}

/// Owned byte buffer for original and patched code
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchBytes(Vec<u8>);

impl PatchBytes {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }

    /// Offset of the first byte that differs from `other`
    pub fn first_difference(&self, other: &[u8]) -> Option<usize> {
        if self.0.len() != other.len() {
            return Some(self.0.len().min(other.len()));
        }
        self.0.iter().zip(other).position(|(a, b)| a != b)
    }
}

impl Deref for PatchBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for PatchBytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for PatchBytes {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

/// Kind-specific patch argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Destination of a `Call`, `Jump` or `ConditionalJump`
    Redirect(Address),
    /// Bytes of a `Manual` patch
    Bytes(PatchBytes),
}

/// Append a rel32 branch located at `at` targeting `target`
fn push_rel32(
    out: &mut Vec<u8>,
    name: &str,
    opcode: &[u8],
    at: Address,
    target: Address,
) -> EngineResult<()> {
    let out_of_range = || EngineError::DisplacementOutOfRange {
        name: name.to_string(),
        from: at,
        to: target,
    };
    let next = at
        .checked_add(opcode.len() + 4)
        .ok_or_else(out_of_range)?;
    let displacement = next.rel32_to(target).ok_or_else(out_of_range)?;

    out.extend_from_slice(opcode);
    out.extend_from_slice(&displacement.to_le_bytes());
    Ok(())
}

/// Encode a rel32 branch instruction at `at`
pub fn encode_branch(
    name: &str,
    opcode: &[u8],
    at: Address,
    target: Address,
) -> EngineResult<Vec<u8>> {
    let mut out = Vec::with_capacity(opcode.len() + 4);
    push_rel32(&mut out, name, opcode, at, target)?;
    Ok(out)
}

/// Compute the bytes a patch of `kind` writes at `address`.
///
/// Deterministic and side-effect free. A region smaller than the kind's
/// minimum width is an error, never silently truncated.
pub fn encode(
    name: &str,
    kind: PatchKind,
    address: Address,
    size: usize,
    payload: Option<&Payload>,
) -> EngineResult<PatchBytes> {
    let minimum = kind.minimum_size();
    if size < minimum {
        return Err(EngineError::PatchSizeTooSmall {
            name: name.to_string(),
            kind,
            size,
            minimum,
        });
    }

    let redirect = || match payload {
        Some(Payload::Redirect(target)) => Ok(*target),
        _ => Err(EngineError::MissingPayload {
            name: name.to_string(),
            kind,
            expected: "redirect target",
        }),
    };

    let mut out = Vec::with_capacity(size);
    match kind {
        PatchKind::Nop => {}
        PatchKind::Interrupt => out.resize(size, INT3),
        PatchKind::Call => push_rel32(&mut out, name, &[CALL_REL32], address, redirect()?)?,
        PatchKind::Jump => push_rel32(&mut out, name, &[JMP_REL32], address, redirect()?)?,
        PatchKind::ConditionalJump(condition) => {
            push_rel32(&mut out, name, &condition.opcode(), address, redirect()?)?
        }
        PatchKind::Skip => {
            let end = address.checked_add(size).ok_or(EngineError::AddressOverflow {
                base: address,
                offset: size as isize,
            })?;
            match i8::try_from(size - REL8_LEN) {
                Ok(short) => {
                    out.push(JMP_REL8);
                    out.push(short as u8);
                }
                Err(_) => push_rel32(&mut out, name, &[JMP_REL32], address, end)?,
            }
        }
        PatchKind::Manual => {
            let bytes = match payload {
                Some(Payload::Bytes(bytes)) => bytes,
                _ => {
                    return Err(EngineError::MissingPayload {
                        name: name.to_string(),
                        kind,
                        expected: "byte",
                    })
                }
            };
            if bytes.len() != size {
                return Err(EngineError::ManualSizeMismatch {
                    name: name.to_string(),
                    size,
                    actual: bytes.len(),
                });
            }
            out.extend_from_slice(bytes);
        }
    }

    out.resize(size, NOP);
    Ok(PatchBytes(out))
}

/// Opcode length and displacement of a rel32 branch at the start of `code`
fn decode_branch(code: &[u8]) -> Option<(usize, i32)> {
    let opcode_len = match code {
        [CALL_REL32 | JMP_REL32, ..] => 1,
        [JCC_PREFIX, 0x80..=0x8F, ..] => 2,
        _ => return None,
    };
    let disp = code.get(opcode_len..opcode_len + 4)?;
    Some((
        opcode_len,
        i32::from_le_bytes([disp[0], disp[1], disp[2], disp[3]]),
    ))
}

fn branch_destination(at: Address, opcode_len: usize, displacement: i32) -> Option<Address> {
    at.checked_add(opcode_len + 4)?
        .checked_offset(displacement as isize)
}

/// Absolute destination of the rel32 `call`/`jmp`/`jcc` at `at`
pub fn branch_target(memory: &dyn CodeMemory, at: Address) -> EngineResult<Address> {
    let code = memory.read_vec(at, JCC_REL32_LEN)
        .or_else(|_| memory.read_vec(at, REL32_LEN))?;
    let (opcode_len, displacement) =
        decode_branch(&code).ok_or(EngineError::NotABranch { address: at })?;
    branch_destination(at, opcode_len, displacement).ok_or(EngineError::AddressOverflow {
        base: at,
        offset: displacement as isize,
    })
}

/// Point the rel32 `call`/`jmp`/`jcc` at `at` to `target`, returning the
/// previous destination. Only the displacement is rewritten.
pub fn retarget_branch(
    memory: &dyn CodeMemory,
    at: Address,
    target: Address,
) -> EngineResult<Address> {
    let previous = branch_target(memory, at)?;
    let code = memory.read_vec(at, 2)?;
    let opcode_len = if code[0] == JCC_PREFIX { 2 } else { 1 };

    let encoded = encode_branch("retarget", &code[..opcode_len], at, target)?;
    let disp_at = Address::new(at.get() + opcode_len);
    memory.write(disp_at, &encoded[opcode_len..])?;

    tracing::debug!(
        "Retargeted branch at {:#x}: {:#x} -> {:#x}",
        at,
        previous,
        target
    );
    Ok(previous)
}

/// Copy `code` from `from` to `to`, fixing up a leading rel32 branch so it
/// keeps its absolute destination. Anything else is copied verbatim.
pub fn relocate(name: &str, code: &[u8], from: Address, to: Address) -> EngineResult<Vec<u8>> {
    let mut out = code.to_vec();
    let Some((opcode_len, displacement)) = decode_branch(code) else {
        return Ok(out);
    };

    let destination = branch_destination(from, opcode_len, displacement).ok_or(
        EngineError::AddressOverflow {
            base: from,
            offset: displacement as isize,
        },
    )?;
    let encoded = encode_branch(name, &code[..opcode_len], to, destination)?;
    out[..encoded.len()].copy_from_slice(&encoded);
    Ok(out)
}
