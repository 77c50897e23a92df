//! Import resolution against the host loader.
//!
//! Each import descriptor names a dependency DLL and two parallel thunk
//! arrays: the lookup table (`OriginalFirstThunk`) describing *what* to
//! import and the IAT (`FirstThunk`) receiving the resolved addresses. The
//! dependency handles are deliberately never released: the host loader
//! reference-counts repeat loads, and dropping them out from under resolved
//! IAT entries would be worse than the pin.

use std::mem;

use log::{debug, trace};

use crate::error::{LoaderError, Result};
use crate::image::{HeaderView, MappedImage};
use crate::pe::{DataDirectoryIndex, ImportDescriptor, IMAGE_ORDINAL_FLAG};

const THUNK_SIZE: u32 = mem::size_of::<usize>() as u32;
const DESCRIPTOR_SIZE: u32 = mem::size_of::<ImportDescriptor>() as u32;

/// What one lookup-table entry asks for.
enum ImportRequest {
    Ordinal(u16),
    Name(String),
}

impl ImportRequest {
    fn describe(&self) -> String {
        match self {
            Self::Ordinal(ordinal) => format!("#{ordinal}"),
            Self::Name(name) => name.clone(),
        }
    }
}

/// Resolves every import descriptor and rewrites the IAT in place.
pub fn resolve(image: &MappedImage, view: &HeaderView) -> Result<()> {
    let directory = view.data_directory(image, DataDirectoryIndex::Import);
    if directory.virtual_address == 0 {
        return Ok(());
    }

    let mut descriptor_rva = directory.virtual_address;
    loop {
        if !image.contains(descriptor_rva, DESCRIPTOR_SIZE as usize) {
            return Err(LoaderError::malformed_section(
                "import descriptor exceeds the image",
            ));
        }
        // SAFETY: checked directly above.
        let descriptor: ImportDescriptor = unsafe { image.read_at(descriptor_rva) };
        if descriptor.name == 0 {
            break;
        }

        let library = image.cstr_at(descriptor.name).ok_or_else(|| {
            LoaderError::malformed_section("import descriptor name exceeds the image")
        })?;
        let handle = host::load_library(&library)?;

        // A zero lookup table means the IAT doubles as the lookup table.
        let lookup_rva = if descriptor.original_first_thunk != 0 {
            descriptor.original_first_thunk
        } else {
            descriptor.first_thunk
        };
        let iat_rva = descriptor.first_thunk;

        let mut index = 0u32;
        loop {
            let entry_rva = index
                .checked_mul(THUNK_SIZE)
                .and_then(|offset| lookup_rva.checked_add(offset))
                .filter(|&rva| image.contains(rva, THUNK_SIZE as usize))
                .ok_or_else(|| {
                    LoaderError::malformed_section(format!(
                        "import lookup table of {library} exceeds the image"
                    ))
                })?;
            // SAFETY: checked directly above.
            let entry: usize = unsafe { image.read_at(entry_rva) };
            if entry == 0 {
                break;
            }

            let request = if entry & IMAGE_ORDINAL_FLAG != 0 {
                ImportRequest::Ordinal((entry & 0xFFFF) as u16)
            } else {
                // The entry is an RVA to a { hint: u16, name: cstr } record.
                let name_rva = (entry as u32).wrapping_add(2);
                let name = image.cstr_at(name_rva).ok_or_else(|| {
                    LoaderError::malformed_section(format!(
                        "import name record of {library} exceeds the image"
                    ))
                })?;
                ImportRequest::Name(name)
            };

            let address =
                host::resolve_proc(handle, &request)?.ok_or(LoaderError::ImportSymbolNotFound {
                    library: library.clone(),
                    symbol: request.describe(),
                })?;

            let iat_entry_rva = index
                .checked_mul(THUNK_SIZE)
                .and_then(|offset| iat_rva.checked_add(offset))
                .filter(|&rva| image.contains(rva, THUNK_SIZE as usize))
                .ok_or_else(|| {
                    LoaderError::malformed_section(format!(
                        "import address table of {library} exceeds the image"
                    ))
                })?;
            // SAFETY: checked directly above; pages are still read-write
            // because imports resolve before section finalization.
            unsafe { image.write_at(iat_entry_rva, address) };

            trace!("{library}!{} -> {address:#x}", request.describe());
            index += 1;
        }

        debug!("resolved {index} imports from {library}");
        descriptor_rva = descriptor_rva.checked_add(DESCRIPTOR_SIZE).ok_or_else(|| {
            LoaderError::malformed_section("import directory wraps around")
        })?;
    }

    Ok(())
}

#[cfg(windows)]
mod host {
    //! Thin wrappers over the host loader, pinned-handle semantics included.

    use super::{ImportRequest, LoaderError, Result};
    use crate::error::Win32Error;
    use std::ffi::CString;
    use windows_sys::Win32::Foundation::HMODULE;
    use windows_sys::Win32::System::LibraryLoader::{GetProcAddress, LoadLibraryA};

    pub(super) fn load_library(name: &str) -> Result<HMODULE> {
        let c_name = CString::new(name)?;
        // SAFETY: the string is NUL-terminated; the handle is intentionally
        // leaked so resolved IAT entries stay valid for the process lifetime.
        let handle = unsafe { LoadLibraryA(c_name.as_ptr() as *const u8) };
        if handle.is_null() {
            return Err(LoaderError::ImportLibraryNotFound {
                library: name.to_string(),
                code: Win32Error::last(),
            });
        }
        Ok(handle)
    }

    pub(super) fn resolve_proc(handle: HMODULE, request: &ImportRequest) -> Result<Option<usize>> {
        let proc = match request {
            ImportRequest::Ordinal(ordinal) => {
                // The low word carries the ordinal when the name pointer is
                // below 64 KiB, per the GetProcAddress contract.
                unsafe { GetProcAddress(handle, *ordinal as usize as *const u8) }
            }
            ImportRequest::Name(name) => {
                let c_name = CString::new(name.as_str())?;
                unsafe { GetProcAddress(handle, c_name.as_ptr() as *const u8) }
            }
        };
        Ok(proc.map(|f| f as usize))
    }
}

#[cfg(not(windows))]
mod host {
    //! Non-Windows stand-in; the pipeline cannot reach this far off-Windows
    //! because allocation already failed, but the crate must still compile.

    use super::{ImportRequest, LoaderError, Result};

    pub(super) type Handle = *mut core::ffi::c_void;

    pub(super) fn load_library(_name: &str) -> Result<Handle> {
        Err(LoaderError::UnsupportedPlatform)
    }

    pub(super) fn resolve_proc(_handle: Handle, _request: &ImportRequest) -> Result<Option<usize>> {
        Err(LoaderError::UnsupportedPlatform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_description() {
        assert_eq!(ImportRequest::Ordinal(42).describe(), "#42");
        assert_eq!(
            ImportRequest::Name("GetTickCount".into()).describe(),
            "GetTickCount"
        );
    }

    #[test]
    fn test_ordinal_flag_is_high_bit() {
        assert_eq!(IMAGE_ORDINAL_FLAG.count_ones(), 1);
        assert_eq!(IMAGE_ORDINAL_FLAG.leading_zeros(), 0);
    }
}
