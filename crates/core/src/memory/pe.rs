//! PE section discovery
//!
//! The legal search range for signatures is the host executable's `.text`
//! section. It is read straight out of the loaded image's section table.

use super::{CodeMemory, MemoryError};
use crate::address::Address;

const DOS_MAGIC: u16 = 0x5A4D; // "MZ"
const NT_SIGNATURE: u32 = 0x0000_4550; // "PE\0\0"
const LFANEW_OFFSET: usize = 0x3C;
const FILE_HEADER_LEN: usize = 20;
const SECTION_HEADER_LEN: usize = 40;

/// A section of a loaded image, in absolute addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Section {
    pub start: Address,
    pub end: Address,
}

fn invalid(base: Address, reason: impl Into<String>) -> MemoryError {
    MemoryError::InvalidImage {
        base,
        reason: reason.into(),
    }
}

fn at(base: Address, offset: usize) -> Result<Address, MemoryError> {
    base.checked_add(offset)
        .ok_or_else(|| invalid(base, format!("offset {:#x} overflows", offset)))
}

/// Find a section by name in the image loaded at `base`
pub fn find_section(
    memory: &dyn CodeMemory,
    base: Address,
    name: &str,
) -> Result<Section, MemoryError> {
    if name.len() > 8 {
        return Err(invalid(base, format!("section name '{}' is too long", name)));
    }

    if memory.read_u16(base)? != DOS_MAGIC {
        return Err(invalid(base, "missing MZ header"));
    }

    let nt_offset = memory.read_u32(at(base, LFANEW_OFFSET)?)? as usize;
    let nt = at(base, nt_offset)?;
    if memory.read_u32(nt)? != NT_SIGNATURE {
        return Err(invalid(base, "missing PE signature"));
    }

    let file_header = at(nt, 4)?;
    let section_count = memory.read_u16(at(file_header, 2)?)? as usize;
    let optional_len = memory.read_u16(at(file_header, 16)?)? as usize;
    let table = at(file_header, FILE_HEADER_LEN + optional_len)?;

    let mut wanted = [0u8; 8];
    wanted[..name.len()].copy_from_slice(name.as_bytes());

    for index in 0..section_count {
        let header = memory.read_vec(at(table, index * SECTION_HEADER_LEN)?, SECTION_HEADER_LEN)?;
        if header[..8] != wanted {
            continue;
        }

        let virtual_size = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
        let virtual_address = u32::from_le_bytes([header[12], header[13], header[14], header[15]]);

        let start = at(base, virtual_address as usize)?;
        let end = at(start, virtual_size as usize)?;
        if start >= end {
            return Err(invalid(base, format!("section '{}' is empty", name)));
        }

        tracing::debug!("Section '{}' spans {:#x}..{:#x}", name, start, end);
        return Ok(Section { start, end });
    }

    Err(invalid(base, format!("no '{}' section", name)))
}

/// The code section of the image loaded at `base`
pub fn text_section(memory: &dyn CodeMemory, base: Address) -> Result<Section, MemoryError> {
    find_section(memory, base, ".text")
}
