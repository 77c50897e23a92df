//! Base relocation processing.
//!
//! When the image could not be placed at its preferred base, every absolute
//! address it contains is off by the slide delta and must be patched before
//! the pages are locked down. The directory is a run of variable-size blocks,
//! each covering one 4 KiB page: `{ page_rva, block_size, entries[] }` with
//! 16-bit entries packing `(type << 12) | offset`.

use std::mem;

use log::debug;

use crate::error::{LoaderError, Result};
use crate::image::{HeaderView, MappedImage};
use crate::pe::{BaseRelocation, DataDirectoryIndex};

#[cfg(target_pointer_width = "64")]
use crate::pe::IMAGE_REL_BASED_DIR64;
#[cfg(target_pointer_width = "32")]
use crate::pe::IMAGE_REL_BASED_HIGHLOW;

const BLOCK_HEADER_SIZE: u32 = mem::size_of::<BaseRelocation>() as u32;

/// Patches every absolute address in the image by the slide delta.
///
/// A zero delta is a no-op. A non-zero delta with an empty relocation
/// directory is also a no-op by default (the image declares itself fixed);
/// `strict_rebase` turns that case into [`LoaderError::CannotRelocate`].
pub fn apply(
    image: &MappedImage,
    view: &HeaderView,
    preferred_base: usize,
    strict_rebase: bool,
) -> Result<()> {
    let delta = (image.base() as usize).wrapping_sub(preferred_base) as isize;
    if delta == 0 {
        return Ok(());
    }

    let directory = view.data_directory(image, DataDirectoryIndex::BaseReloc);
    if !directory.is_present() {
        if strict_rebase {
            return Err(LoaderError::CannotRelocate);
        }
        debug!("rebased by {delta:#x} without a relocation directory; image declares itself fixed");
        return Ok(());
    }

    let dir_rva = directory.virtual_address;
    let dir_size = directory.size;
    let mut patched = 0usize;
    let mut offset = 0u32;

    while offset < dir_size {
        let block_rva = dir_rva
            .checked_add(offset)
            .ok_or_else(|| LoaderError::malformed_reloc("relocation directory wraps around"))?;
        if !image.contains(block_rva, BLOCK_HEADER_SIZE as usize) {
            return Err(LoaderError::malformed_reloc(
                "relocation block header exceeds the image",
            ));
        }
        // SAFETY: checked directly above.
        let block: BaseRelocation = unsafe { image.read_at(block_rva) };
        let block_size = block.size_of_block;
        let page_rva = block.virtual_address;

        if block_size < BLOCK_HEADER_SIZE {
            return Err(LoaderError::malformed_reloc(format!(
                "relocation block at offset {offset:#x} is smaller than its header"
            )));
        }
        if !image.contains(block_rva, block_size as usize) {
            return Err(LoaderError::malformed_reloc(
                "relocation block exceeds the image",
            ));
        }

        let entry_count = (block_size - BLOCK_HEADER_SIZE) / 2;
        for i in 0..entry_count {
            let entry_rva = block_rva + BLOCK_HEADER_SIZE + i * 2;
            // SAFETY: inside the block range checked above.
            let entry: u16 = unsafe { image.read_at(entry_rva) };
            let kind = entry >> 12;
            let page_offset = u32::from(entry & 0x0FFF);
            let target_rva = page_rva.wrapping_add(page_offset);

            match kind {
                #[cfg(target_pointer_width = "32")]
                IMAGE_REL_BASED_HIGHLOW => {
                    patch_word(image, target_rva, delta)?;
                    patched += 1;
                }
                #[cfg(target_pointer_width = "64")]
                IMAGE_REL_BASED_DIR64 => {
                    patch_word(image, target_rva, delta)?;
                    patched += 1;
                }
                // ABSOLUTE is alignment padding; foreign-width and exotic
                // types are ignored, as the host loader ignores them here.
                _ => {}
            }
        }

        offset = offset
            .checked_add(block_size)
            .ok_or_else(|| LoaderError::malformed_reloc("relocation directory wraps around"))?;
    }

    debug!("relocated {patched} addresses by {delta:#x}");
    Ok(())
}

/// Adds the slide to the pointer-width word at `rva`.
fn patch_word(image: &MappedImage, rva: u32, delta: isize) -> Result<()> {
    if !image.contains(rva, mem::size_of::<usize>()) {
        return Err(LoaderError::malformed_reloc(format!(
            "relocation target at RVA {rva:#x} exceeds the image"
        )));
    }
    // SAFETY: checked directly above; pages are still read-write because
    // relocation runs before section finalization.
    unsafe {
        let value: usize = image.read_at(rva);
        image.write_at(rva, value.wrapping_add(delta as usize));
    }
    Ok(())
}
