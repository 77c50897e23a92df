//! Handle-based C interface over [`MemoryModule`].
//!
//! Every function tolerates a null handle; errors collapse to `false`/null/
//! zero at this boundary. The handle owns the mapped image; destroying it
//! implies unload. Callers must serialize `memdll_load`/`memdll_unload`
//! against all other calls on the same handle, mirroring the Rust API's
//! single-writer contract.

use std::ffi::{c_char, c_void, CStr};
use std::ptr;
use std::slice;

use crate::exports::Export;
use crate::module::MemoryModule;

/// One export record as copied across the C boundary.
///
/// `name` is NUL-terminated and truncated to the buffer size.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RawExport {
    /// Biased ordinal.
    pub ordinal: u32,
    /// Function RVA.
    pub rva: u32,
    /// Ordinal bias of the export directory.
    pub ordinal_base: u16,
    /// Low 32 bits of the absolute address.
    pub va: u32,
    /// Export name, NUL-terminated.
    pub name: [c_char; RawExport::NAME_CAPACITY],
    /// Directly callable absolute address.
    pub address: *const c_void,
}

impl RawExport {
    /// Size of the inline name buffer, terminator included.
    pub const NAME_CAPACITY: usize = 256;

    fn from_export(export: &Export) -> Self {
        let mut name = [0 as c_char; Self::NAME_CAPACITY];
        for (dst, src) in name
            .iter_mut()
            .zip(export.name.bytes().take(Self::NAME_CAPACITY - 1))
        {
            *dst = src as c_char;
        }
        Self {
            ordinal: export.ordinal,
            rva: export.rva,
            ordinal_base: export.ordinal_base,
            va: export.va,
            name,
            address: export.address,
        }
    }
}

/// Allocates a fresh empty module. Release with [`memdll_destroy`].
#[no_mangle]
pub extern "C" fn memdll_create() -> *mut MemoryModule {
    Box::into_raw(Box::new(MemoryModule::new()))
}

/// Destroys a module, unloading any resident image.
///
/// # Safety
///
/// `module` must be null or a pointer returned by [`memdll_create`] that has
/// not been destroyed yet.
#[no_mangle]
pub unsafe extern "C" fn memdll_destroy(module: *mut MemoryModule) {
    if !module.is_null() {
        drop(Box::from_raw(module));
    }
}

/// Loads a PE image from `data`. Returns `true` on success.
///
/// # Safety
///
/// `module` must come from [`memdll_create`]; `data` must be readable for
/// `size` bytes. The caller holds the single-writer lock by convention.
#[no_mangle]
pub unsafe extern "C" fn memdll_load(
    module: *mut MemoryModule,
    data: *const u8,
    size: usize,
) -> bool {
    let Some(module) = module.as_mut() else {
        return false;
    };
    if data.is_null() || size == 0 {
        return false;
    }
    let bytes = slice::from_raw_parts(data, size);
    module.load(bytes).is_ok()
}

/// Unloads the resident image, if any. Always succeeds.
///
/// # Safety
///
/// As for [`memdll_load`].
#[no_mangle]
pub unsafe extern "C" fn memdll_unload(module: *mut MemoryModule) -> bool {
    let Some(module) = module.as_mut() else {
        return false;
    };
    module.unload();
    true
}

/// Looks up an export by name (digit strings fall back to ordinals).
///
/// # Safety
///
/// `module` as for [`memdll_load`]; `name` must be a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn memdll_proc_address(
    module: *const MemoryModule,
    name: *const c_char,
) -> *const c_void {
    let Some(module) = module.as_ref() else {
        return ptr::null();
    };
    if name.is_null() {
        return ptr::null();
    }
    let name = CStr::from_ptr(name).to_string_lossy();
    module.lookup_by_name(&name).unwrap_or(ptr::null())
}

/// Looks up an export by biased ordinal.
///
/// # Safety
///
/// `module` as for [`memdll_load`].
#[no_mangle]
pub unsafe extern "C" fn memdll_proc_address_by_ordinal(
    module: *const MemoryModule,
    ordinal: u16,
) -> *const c_void {
    let Some(module) = module.as_ref() else {
        return ptr::null();
    };
    module
        .lookup_by_ordinal(u32::from(ordinal))
        .unwrap_or(ptr::null())
}

/// True when the resident image is PE32+.
///
/// # Safety
///
/// `module` as for [`memdll_load`].
#[no_mangle]
pub unsafe extern "C" fn memdll_is_64bit(module: *const MemoryModule) -> bool {
    module.as_ref().map_or(false, MemoryModule::is_64bit)
}

/// Base address of the resident image, or null when empty.
///
/// # Safety
///
/// `module` as for [`memdll_load`].
#[no_mangle]
pub unsafe extern "C" fn memdll_base_address(module: *const MemoryModule) -> *const c_void {
    module
        .as_ref()
        .and_then(MemoryModule::base_address)
        .map_or(ptr::null(), |base| base.as_ptr() as *const c_void)
}

/// Size of the resident image in bytes, zero when empty.
///
/// # Safety
///
/// `module` as for [`memdll_load`].
#[no_mangle]
pub unsafe extern "C" fn memdll_image_size(module: *const MemoryModule) -> usize {
    module.as_ref().map_or(0, MemoryModule::image_size)
}

/// Number of named exports.
///
/// # Safety
///
/// `module` as for [`memdll_load`].
#[no_mangle]
pub unsafe extern "C" fn memdll_export_count(module: *const MemoryModule) -> usize {
    module.as_ref().map_or(0, MemoryModule::export_count)
}

/// Copies export records into `out`.
///
/// On entry `*count` is the capacity of `out` in records; on return it holds
/// the number of records written. A buffer smaller than the export count is
/// filled to capacity; truncation is not an error.
///
/// # Safety
///
/// `module` as for [`memdll_load`]; `out` must be writable for `*count`
/// records and `count` must be a valid pointer.
#[no_mangle]
pub unsafe extern "C" fn memdll_export_list(
    module: *const MemoryModule,
    out: *mut RawExport,
    count: *mut usize,
) {
    let Some(count) = count.as_mut() else {
        return;
    };
    let capacity = *count;
    *count = 0;
    let Some(module) = module.as_ref() else {
        return;
    };
    if out.is_null() {
        return;
    }

    let exports = module.exports();
    let written = exports.len().min(capacity);
    let out = slice::from_raw_parts_mut(out, written);
    for (slot, export) in out.iter_mut().zip(exports.iter()) {
        *slot = RawExport::from_export(export);
    }
    *count = written;
}

/// Copies the name of the export carrying `ordinal` into `buffer`.
///
/// Returns the number of bytes written excluding the terminator; zero when
/// the ordinal is unknown or the buffer cannot hold the terminator.
///
/// # Safety
///
/// `module` as for [`memdll_load`]; `buffer` must be writable for
/// `buffer_len` bytes.
#[no_mangle]
pub unsafe extern "C" fn memdll_function_name(
    module: *const MemoryModule,
    ordinal: u16,
    buffer: *mut c_char,
    buffer_len: usize,
) -> usize {
    let Some(module) = module.as_ref() else {
        return 0;
    };
    if buffer.is_null() || buffer_len == 0 {
        return 0;
    }
    let Some(name) = module.name_of(u32::from(ordinal)) else {
        return 0;
    };

    let written = name.len().min(buffer_len - 1);
    let out = slice::from_raw_parts_mut(buffer as *mut u8, buffer_len);
    out[..written].copy_from_slice(&name.as_bytes()[..written]);
    out[written] = 0;
    written
}

/// Biased ordinal of the named export; zero when not found.
///
/// # Safety
///
/// `module` as for [`memdll_load`]; `name` must be a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn memdll_function_ordinal(
    module: *const MemoryModule,
    name: *const c_char,
) -> u16 {
    let Some(module) = module.as_ref() else {
        return 0;
    };
    if name.is_null() {
        return 0;
    }
    let name = CStr::from_ptr(name).to_string_lossy();
    module.ordinal_of(&name).map_or(0, |ordinal| ordinal as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_destroy_roundtrip() {
        let handle = memdll_create();
        assert!(!handle.is_null());
        unsafe {
            assert!(!memdll_is_64bit(handle));
            assert!(memdll_base_address(handle).is_null());
            assert_eq!(memdll_export_count(handle), 0);
            assert!(memdll_unload(handle));
            memdll_destroy(handle);
        }
    }

    #[test]
    fn test_null_handle_tolerance() {
        unsafe {
            memdll_destroy(ptr::null_mut());
            assert!(!memdll_load(ptr::null_mut(), ptr::null(), 0));
            assert!(!memdll_unload(ptr::null_mut()));
            assert!(memdll_proc_address(ptr::null(), ptr::null()).is_null());
            assert!(memdll_proc_address_by_ordinal(ptr::null(), 1).is_null());
            assert!(!memdll_is_64bit(ptr::null()));
            assert!(memdll_base_address(ptr::null()).is_null());
            assert_eq!(memdll_image_size(ptr::null()), 0);
            assert_eq!(memdll_export_count(ptr::null()), 0);
            assert_eq!(memdll_function_ordinal(ptr::null(), ptr::null()), 0);
        }
    }

    #[test]
    fn test_load_rejects_garbage_through_ffi() {
        let handle = memdll_create();
        let garbage = b"MZ but not really";
        unsafe {
            assert!(!memdll_load(handle, garbage.as_ptr(), garbage.len()));
            assert!(memdll_base_address(handle).is_null());
            memdll_destroy(handle);
        }
    }

    #[test]
    fn test_export_list_reports_zero_on_empty() {
        let handle = memdll_create();
        let mut records = [unsafe { std::mem::zeroed::<RawExport>() }; 4];
        let mut count = records.len();
        unsafe {
            memdll_export_list(handle, records.as_mut_ptr(), &mut count);
            assert_eq!(count, 0);
            memdll_destroy(handle);
        }
    }

    #[test]
    fn test_raw_export_name_truncation() {
        let export = Export {
            ordinal: 1,
            rva: 0x1000,
            ordinal_base: 1,
            va: 0x1000,
            name: "x".repeat(400),
            address: ptr::null(),
        };
        let raw = RawExport::from_export(&export);
        assert_eq!(raw.name[RawExport::NAME_CAPACITY - 1], 0);
        assert_eq!(raw.name[RawExport::NAME_CAPACITY - 2], b'x' as c_char);
    }
}
