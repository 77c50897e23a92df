//! Section placement and finalization.
//!
//! Placement copies the header block and every raw section from the input
//! buffer into the mapped region; finalization swaps the initial read-write
//! commit for the protection each section's characteristics call for. Between
//! the two sit relocation and import resolution, which need the pages
//! writable.

use std::mem;
use std::ptr;

use log::debug;

use crate::error::{LoaderError, Result};
use crate::image::{align_down, page_size, HeaderView, MappedImage, Protection};
use crate::pe::{NtHeaders, PeFile};

/// Copies the header block into the image and returns the header view with
/// its `ImageBase` field rewritten to the actual base.
pub fn copy_headers(image: &MappedImage, pe: &PeFile<'_>) -> Result<HeaderView> {
    let size_of_headers = pe.size_of_headers() as usize;
    let input = pe.data();

    if size_of_headers > input.len() {
        return Err(LoaderError::malformed_section(
            "SizeOfHeaders exceeds the input buffer",
        ));
    }
    if !image.contains(0, size_of_headers) {
        return Err(LoaderError::malformed_section(
            "SizeOfHeaders exceeds the image",
        ));
    }
    // The validator proved the NT headers fit in the input; they must also
    // land entirely inside the copied block.
    if (pe.e_lfanew() as usize) + mem::size_of::<NtHeaders>() > size_of_headers {
        return Err(LoaderError::malformed_section(
            "NT headers extend past SizeOfHeaders",
        ));
    }

    // SAFETY: both ranges were bounds-checked above; the regions cannot
    // overlap (the image is a fresh allocation).
    unsafe {
        ptr::copy_nonoverlapping(input.as_ptr(), image.base(), size_of_headers);
    }

    let view = HeaderView::validate_bounds(pe.e_lfanew(), image)?;
    view.rewrite_image_base(image);
    debug!(
        "headers placed: {size_of_headers:#x} bytes, image base rewritten to {:p}",
        image.base()
    );
    Ok(view)
}

/// Copies each section's raw data to its virtual address.
///
/// Sections with no raw data (`.bss` and friends) are left as the
/// zero-initialized commit the allocator produced.
pub fn place_sections(image: &MappedImage, pe: &PeFile<'_>) -> Result<()> {
    let input = pe.data();

    for index in 0..pe.number_of_sections() {
        let section = pe.section(index)?;
        let raw_size = section.size_of_raw_data as usize;
        if raw_size == 0 {
            continue;
        }

        let raw_offset = section.pointer_to_raw_data as usize;
        let virtual_address = section.virtual_address;

        let src_end = raw_offset.checked_add(raw_size);
        if !matches!(src_end, Some(end) if end <= input.len()) {
            return Err(LoaderError::malformed_section(format!(
                "raw data of section {} exceeds the input buffer",
                section.name_str()
            )));
        }
        if !image.contains(virtual_address, raw_size) {
            return Err(LoaderError::malformed_section(format!(
                "section {} exceeds the image",
                section.name_str()
            )));
        }

        // SAFETY: source and destination ranges were bounds-checked above.
        unsafe {
            ptr::copy_nonoverlapping(
                input.as_ptr().add(raw_offset),
                image.rva_to_va(virtual_address),
                raw_size,
            );
        }
    }
    Ok(())
}

/// Applies the final per-section page protections.
///
/// The protection address is aligned down to a page boundary and the length
/// is the section's virtual size, exactly as the host loader does it. The
/// `DISCARDABLE` characteristic is not honored.
pub fn finalize_sections(image: &MappedImage, view: &HeaderView) -> Result<()> {
    let page = page_size();

    for section in view.section_headers(image)? {
        let virtual_size = section.virtual_size as usize;
        if virtual_size == 0 {
            continue;
        }

        let virtual_address = section.virtual_address;
        if !image.contains(virtual_address, virtual_size) {
            return Err(LoaderError::malformed_section(format!(
                "section {} exceeds the image",
                section.name_str()
            )));
        }

        let protection = Protection::from_section_flags(section.flags());
        let address = align_down(image.rva_to_va(virtual_address) as usize, page) as *mut u8;
        image.protect(address, virtual_size, protection)?;
        debug!(
            "section {} protected as {protection:?} ({virtual_size:#x} bytes)",
            section.name_str()
        );
    }
    Ok(())
}
