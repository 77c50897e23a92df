//! TLS callbacks and entry-point invocation.
//!
//! Runs strictly after section finalization: the code pages must carry their
//! executable protections before anything in the image is called. TLS
//! callbacks go first, then `DllMain` with the process-attach reason. The
//! detach notification on unload comes through here as well; TLS detach
//! callbacks are not issued, matching the behavior this loader reproduces.

use std::ffi::c_void;
use std::mem;
use std::ptr;

use log::debug;

use crate::error::{LoaderError, Result};
use crate::image::{HeaderView, MappedImage};
use crate::pe::{DataDirectoryIndex, TlsDirectory, IMAGE_FILE_DLL};

#[cfg(windows)]
use windows_sys::Win32::System::SystemServices::{DLL_PROCESS_ATTACH, DLL_PROCESS_DETACH};
#[cfg(not(windows))]
const DLL_PROCESS_ATTACH: u32 = 1;
#[cfg(not(windows))]
const DLL_PROCESS_DETACH: u32 = 0;

/// `DllMain` signature.
pub type DllEntryProc = unsafe extern "system" fn(*mut c_void, u32, *mut c_void) -> i32;

/// TLS callback signature.
pub type TlsCallbackProc = unsafe extern "system" fn(*mut c_void, u32, *mut c_void);

/// Invokes every TLS callback with the process-attach reason.
///
/// `AddressOfCallBacks` holds an absolute VA (relocated along with the rest
/// of the image) pointing at a null-terminated array of callback VAs. Return
/// values are ignored.
pub fn run_tls_callbacks(image: &MappedImage, view: &HeaderView) -> Result<()> {
    let directory = view.data_directory(image, DataDirectoryIndex::Tls);
    if directory.virtual_address == 0 {
        return Ok(());
    }
    if !image.contains(directory.virtual_address, mem::size_of::<TlsDirectory>()) {
        return Err(LoaderError::malformed_section(
            "TLS directory exceeds the image",
        ));
    }
    // SAFETY: checked directly above.
    let tls: TlsDirectory = unsafe { image.read_at(directory.virtual_address) };
    let callbacks_va = tls.address_of_callbacks;
    if callbacks_va == 0 {
        return Ok(());
    }

    let base = image.base() as usize;
    let mut invoked = 0usize;
    let mut slot = 0u32;
    loop {
        let slot_rva = callbacks_va
            .checked_sub(base)
            .and_then(|rva| rva.checked_add(slot as usize * mem::size_of::<usize>()))
            .filter(|&rva| rva <= u32::MAX as usize)
            .map(|rva| rva as u32)
            .filter(|&rva| image.contains(rva, mem::size_of::<usize>()))
            .ok_or_else(|| {
                LoaderError::malformed_section("TLS callback array exceeds the image")
            })?;
        // SAFETY: checked directly above.
        let callback_va: usize = unsafe { image.read_at(slot_rva) };
        if callback_va == 0 {
            break;
        }

        // SAFETY: the VA designates code inside the finalized image; the
        // callback contract is (module base, reason, reserved).
        unsafe {
            let callback: TlsCallbackProc = mem::transmute(callback_va);
            callback(base as *mut c_void, DLL_PROCESS_ATTACH, ptr::null_mut());
        }
        invoked += 1;
        slot += 1;
    }

    if invoked > 0 {
        debug!("invoked {invoked} TLS callbacks");
    }
    Ok(())
}

/// Calls the image entry point with the process-attach reason.
///
/// Images without an entry point are skipped, as are non-DLL images (an
/// executable's entry point is a `main`, not a notification callback). A
/// FALSE return from `DllMain` rejects the load.
pub fn call_entry_point(image: &MappedImage, view: &HeaderView) -> Result<()> {
    let optional = view.optional_header(image);
    let entry_rva = optional.address_of_entry_point;
    if entry_rva == 0 {
        return Ok(());
    }

    let file_header = view.file_header(image);
    if file_header.characteristics & IMAGE_FILE_DLL == 0 {
        debug!("image is not a DLL; entry point left uninvoked");
        return Ok(());
    }
    if !image.contains(entry_rva, 1) {
        return Err(LoaderError::malformed_section(
            "entry point lies outside the image",
        ));
    }

    // SAFETY: the RVA designates code in the finalized image; DllMain's
    // contract is (module base, reason, reserved).
    let accepted = unsafe {
        let entry: DllEntryProc = mem::transmute(image.rva_to_va(entry_rva));
        entry(
            image.base() as *mut c_void,
            DLL_PROCESS_ATTACH,
            ptr::null_mut(),
        )
    };
    if accepted == 0 {
        return Err(LoaderError::EntryPointRejected);
    }

    debug!("DllMain accepted process attach");
    Ok(())
}

/// Issues the process-detach notification on unload.
///
/// Only called for DLL images whose attach previously succeeded and whose
/// entry-point RVA is non-zero; the return value is ignored.
///
/// # Safety
///
/// The image must still be mapped with its finalized protections, and
/// `entry_rva` must be the same RVA the attach call used.
pub unsafe fn notify_detach(image: &MappedImage, entry_rva: u32) {
    let entry: DllEntryProc = mem::transmute(image.rva_to_va(entry_rva));
    entry(
        image.base() as *mut c_void,
        DLL_PROCESS_DETACH,
        ptr::null_mut(),
    );
}
