//! Export directory parsing and lookup.
//!
//! The table is keyed off the name table: one record per named export, with
//! the biased ordinal, the function RVA and a directly callable absolute
//! address. Ordinal-only exports (function slots no name points at) are not
//! indexed, so a pure-ordinal lookup finds a function only when it also has
//! a name.

use std::ffi::c_void;
use std::mem;

use log::debug;

use crate::error::{LoaderError, Result};
use crate::image::{HeaderView, MappedImage};
use crate::pe::{DataDirectoryIndex, ExportDirectory};

/// One named export of a loaded image.
#[derive(Debug, Clone)]
pub struct Export {
    /// Biased ordinal (`name ordinal + ExportDirectory.Base`).
    pub ordinal: u32,
    /// Function RVA from the export directory.
    pub rva: u32,
    /// The directory's ordinal bias.
    pub ordinal_base: u16,
    /// Low 32 bits of the absolute address, as the directory records it.
    pub va: u32,
    /// Export name; never empty for records in this table.
    pub name: String,
    /// Directly callable absolute address (`base + rva`).
    pub address: *const c_void,
}

// SAFETY: `address` is a plain code address inside a region whose lifetime
// the owning module controls; the record itself carries no aliasing state.
unsafe impl Send for Export {}
unsafe impl Sync for Export {}

/// Parses the export directory of a mapped image into lookup records.
///
/// Images without an export directory yield an empty table. Name entries
/// whose ordinal index falls outside the function table are skipped.
pub fn build(image: &MappedImage, view: &HeaderView) -> Result<Vec<Export>> {
    let directory = view.data_directory(image, DataDirectoryIndex::Export);
    if directory.virtual_address == 0 {
        return Ok(Vec::new());
    }
    if !image.contains(directory.virtual_address, mem::size_of::<ExportDirectory>()) {
        return Err(LoaderError::malformed_section(
            "export directory exceeds the image",
        ));
    }
    // SAFETY: checked directly above.
    let table: ExportDirectory = unsafe { image.read_at(directory.virtual_address) };
    let function_count = table.number_of_functions;
    let name_count = table.number_of_names;
    if function_count == 0 || name_count == 0 {
        return Ok(Vec::new());
    }

    let names_rva = table.address_of_names;
    let ordinals_rva = table.address_of_name_ordinals;
    let functions_rva = table.address_of_functions;
    let ordinal_base = table.base;

    if !image.contains(names_rva, name_count as usize * 4)
        || !image.contains(ordinals_rva, name_count as usize * 2)
        || !image.contains(functions_rva, function_count as usize * 4)
    {
        return Err(LoaderError::malformed_section(
            "export tables exceed the image",
        ));
    }

    let mut exports = Vec::with_capacity(name_count as usize);
    for i in 0..name_count {
        // SAFETY: all three arrays were range-checked above.
        let name_rva: u32 = unsafe { image.read_at(names_rva + i * 4) };
        let name_ordinal: u16 = unsafe { image.read_at(ordinals_rva + i * 2) };

        if u32::from(name_ordinal) >= function_count {
            continue;
        }
        // SAFETY: the index was bounded against the checked function table.
        let function_rva: u32 =
            unsafe { image.read_at(functions_rva + u32::from(name_ordinal) * 4) };

        let name = image.cstr_at(name_rva).ok_or_else(|| {
            LoaderError::malformed_section("export name exceeds the image")
        })?;
        if !image.contains(function_rva, 1) {
            return Err(LoaderError::malformed_section(format!(
                "export {name} points outside the image"
            )));
        }

        let address = image.rva_to_va(function_rva) as *const c_void;
        exports.push(Export {
            ordinal: u32::from(name_ordinal) + ordinal_base,
            rva: function_rva,
            ordinal_base: ordinal_base as u16,
            va: address as usize as u32,
            name,
            address,
        });
    }

    debug!("export table built: {} named exports", exports.len());
    Ok(exports)
}

/// Linear scan by export name.
pub fn find_by_name<'a>(exports: &'a [Export], name: &str) -> Option<&'a Export> {
    exports.iter().find(|export| export.name == name)
}

/// Linear scan by biased ordinal.
pub fn find_by_ordinal(exports: &[Export], ordinal: u32) -> Option<&Export> {
    exports.iter().find(|export| export.ordinal == ordinal)
}

/// Name lookup with the digit-string fallback: a name consisting entirely of
/// ASCII digits that matches no export is retried as an ordinal.
pub fn lookup<'a>(exports: &'a [Export], name: &str) -> Option<&'a Export> {
    if let Some(export) = find_by_name(exports, name) {
        return Some(export);
    }
    if !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(ordinal) = name.parse::<u16>() {
            return find_by_ordinal(exports, u32::from(ordinal));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    fn sample(name: &str, ordinal: u32) -> Export {
        Export {
            ordinal,
            rva: 0x1000 + ordinal,
            ordinal_base: 1,
            va: 0x1000 + ordinal,
            name: name.to_string(),
            address: ptr::null(),
        }
    }

    #[test]
    fn test_find_by_name() {
        let exports = vec![sample("add", 1), sample("sub", 2)];
        assert_eq!(find_by_name(&exports, "sub").map(|e| e.ordinal), Some(2));
        assert!(find_by_name(&exports, "mul").is_none());
        assert!(find_by_name(&exports, "").is_none());
    }

    #[test]
    fn test_find_by_ordinal() {
        let exports = vec![sample("add", 7)];
        assert_eq!(
            find_by_ordinal(&exports, 7).map(|e| e.name.as_str()),
            Some("add")
        );
        assert!(find_by_ordinal(&exports, 8).is_none());
    }

    #[test]
    fn test_digit_string_falls_back_to_ordinal() {
        let exports = vec![sample("add", 7)];
        let by_digits = lookup(&exports, "7").expect("digit fallback");
        assert_eq!(by_digits.name, "add");
        assert!(std::ptr::eq(by_digits, find_by_ordinal(&exports, 7).unwrap()));
    }

    #[test]
    fn test_digit_named_export_wins_over_fallback() {
        // A real export literally named "7" must shadow the ordinal quirk.
        let exports = vec![sample("7", 1), sample("add", 7)];
        assert_eq!(lookup(&exports, "7").map(|e| e.ordinal), Some(1));
    }

    #[test]
    fn test_mixed_and_overflowing_names_do_not_fall_back() {
        let exports = vec![sample("add", 7)];
        assert!(lookup(&exports, "7a").is_none());
        assert!(lookup(&exports, "").is_none());
        // Larger than u16: the quirk parses a 16-bit ordinal or nothing.
        assert!(lookup(&exports, "99999").is_none());
    }
}
