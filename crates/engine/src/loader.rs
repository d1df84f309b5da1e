//! Host image discovery and context construction
//!
//! The default search range for signatures is the code of the host
//! executable. On Linux it is the executable `PT_LOAD` segment of the main
//! program as reported by `dl_iterate_phdr`; elsewhere the `.text` section
//! of the PE image at the configured `image_base`.

use vulpes_core::memory::pe;
use vulpes_core::{Address, CodeMemory, EngineConfig, EngineContext, Gamedata, ProcessMemory};

use crate::error::LoaderError;

/// Code range of the host executable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostImage {
    pub base: Address,
    pub code_start: Address,
    pub code_end: Address,
}

impl HostImage {
    pub fn contains(&self, address: Address) -> bool {
        address >= self.code_start && address < self.code_end
    }
}

#[cfg(target_os = "linux")]
mod elf {
    use std::ffi::c_void;

    use libc::{c_int, dl_iterate_phdr, dl_phdr_info, PF_X, PT_LOAD};

    use super::HostImage;
    use vulpes_core::Address;

    unsafe extern "C" fn first_object(
        info: *mut dl_phdr_info,
        _size: usize,
        data: *mut c_void,
    ) -> c_int {
        let out = &mut *(data as *mut Option<HostImage>);
        let info = &*info;

        let headers = std::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize);
        let base = info.dlpi_addr as usize;

        *out = headers
            .iter()
            .find(|h| h.p_type == PT_LOAD && h.p_flags & PF_X != 0)
            .map(|h| {
                let start = base + h.p_vaddr as usize;
                HostImage {
                    base: Address::new(base),
                    code_start: Address::new(start),
                    code_end: Address::new(start + h.p_memsz as usize),
                }
            });

        // The main program is always reported first
        1
    }

    pub fn main_program() -> Option<HostImage> {
        let mut image: Option<HostImage> = None;
        // SAFETY: the callback only reads the headers it is handed and writes
        // through `data`, which outlives the call
        unsafe {
            dl_iterate_phdr(Some(first_object), &mut image as *mut _ as *mut c_void);
        }
        image
    }
}

/// Find the code range of the host executable
pub fn discover_host_image(
    memory: &dyn CodeMemory,
    config: &EngineConfig,
) -> Result<HostImage, LoaderError> {
    #[cfg(target_os = "linux")]
    {
        let _ = (memory, config);
        elf::main_program().ok_or_else(|| {
            LoaderError::HostImageNotFound("no executable segment in main program".to_string())
        })
    }

    #[cfg(not(target_os = "linux"))]
    {
        let base = config
            .image_base()
            .ok_or_else(|| LoaderError::HostImageNotFound("image_base not configured".to_string()))?;
        let text = pe::text_section(memory, base)?;
        Ok(HostImage {
            base,
            code_start: text.start,
            code_end: text.end,
        })
    }
}

/// Find the code range of a PE image mapped at `base` in `memory`
pub fn pe_image(memory: &dyn CodeMemory, base: Address) -> Result<HostImage, LoaderError> {
    let text = pe::text_section(memory, base)?;
    Ok(HostImage {
        base,
        code_start: text.start,
        code_end: text.end,
    })
}

/// Build the context for one load cycle: live process memory, the host's
/// code range as default search range, and the gamedata signatures if a
/// gamedata file exists.
#[tracing::instrument(skip_all)]
pub fn load_context(config: EngineConfig) -> Result<EngineContext, LoaderError> {
    let memory = ProcessMemory::new();

    let image = match discover_host_image(&memory, &config) {
        Ok(image) => {
            tracing::info!(
                "Host image at {:#x}, code {:#x}..{:#x}",
                image.base,
                image.code_start,
                image.code_end
            );
            Some(image)
        }
        Err(e) if config.range().is_some() => {
            tracing::warn!("{}; using configured range", e);
            None
        }
        Err(e) => return Err(e),
    };

    let gamedata_path = vulpes_core::config::resolve(&config.gamedata)?;
    let mut context = EngineContext::new(Box::new(memory), config);
    if let Some(image) = image {
        context = context.with_discovered_range(image.code_start, image.code_end);
    }

    if gamedata_path.exists() {
        let gamedata = Gamedata::load_from_file(&gamedata_path)?;
        let keys = context.register_gamedata(&gamedata)?;
        tracing::debug!("Registered {} gamedata signatures", keys.len());
    } else {
        tracing::debug!("No gamedata at {:?}", gamedata_path);
    }

    Ok(context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vulpes_core::ImageMemory;

    #[cfg(target_os = "linux")]
    #[test]
    fn test_discovers_own_executable() {
        let memory = ProcessMemory::new();
        let image = discover_host_image(&memory, &EngineConfig::default()).unwrap();

        let here = Address::new(test_discovers_own_executable as usize);
        assert!(image.contains(here));
        assert!(image.code_start < image.code_end);
    }

    #[test]
    fn test_pe_image_range() {
        let base = Address::new(0x40_0000);
        let mut headers = vec![0u8; 0x400];
        headers[0..2].copy_from_slice(b"MZ");
        headers[0x3C..0x40].copy_from_slice(&0x80u32.to_le_bytes());
        headers[0x80..0x84].copy_from_slice(b"PE\0\0");
        headers[0x86..0x88].copy_from_slice(&1u16.to_le_bytes());
        headers[0x94..0x96].copy_from_slice(&0xE0u16.to_le_bytes());
        let section = 0x80 + 4 + 20 + 0xE0;
        headers[section..section + 5].copy_from_slice(b".text");
        headers[section + 8..section + 12].copy_from_slice(&0x1_DE00u32.to_le_bytes());
        headers[section + 12..section + 16].copy_from_slice(&0x1000u32.to_le_bytes());

        let memory = ImageMemory::new(base, headers);
        let image = pe_image(&memory, base).unwrap();
        assert_eq!(image.code_start, Address::new(0x40_1000));
        assert_eq!(image.code_end, Address::new(0x41_EE00));
        assert!(!image.contains(image.code_end));
    }

    #[test]
    fn test_pe_image_rejects_garbage() {
        let memory = ImageMemory::new(Address::new(0x1000), vec![0u8; 0x40]);
        assert!(matches!(
            pe_image(&memory, Address::new(0x1000)),
            Err(LoaderError::InvalidImage(_))
        ));
    }
}
