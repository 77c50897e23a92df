//! The module facade: lifecycle, lookups, and the export cache.
//!
//! A [`MemoryModule`] holds at most one mapped image. `load` drives the full
//! pipeline (validate, allocate, place, relocate, resolve imports, finalize
//! protections, run initializers) and leaves the module *Empty* (with all
//! partial state released) on any failure. Lookups are cheap reads over a
//! lazily built export cache.
//!
//! Concurrency contract: single writer, many readers. `load` and `unload`
//! take `&mut self` and need external exclusivity; lookups take `&self` and
//! may race each other freely; the cache builds once under its lock and is
//! immutable until the next `unload`.

use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::{Mutex, PoisonError};

use log::{debug, warn};

use crate::error::Result;
use crate::exports::{self, Export};
use crate::image::{align_up, page_size, HeaderView, MappedImage};
use crate::pe::{DataDirectoryIndex, ExportDirectory, PeFile};
use crate::{imports, init, relocation, sections};

/// Load-time policy switches.
///
/// The default reproduces observed loader behavior; every switch documents
/// the divergence it enables.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    /// Fail with [`CannotRelocate`] when the image must be rebased but
    /// carries no relocation directory, instead of loading it unrelocated.
    ///
    /// [`CannotRelocate`]: crate::error::LoaderError::CannotRelocate
    pub strict_rebase: bool,
}

/// Everything owned while an image is resident.
struct LoadedImage {
    image: MappedImage,
    view: HeaderView,
    is_64bit: bool,
    is_dll: bool,
    entry_rva: u32,
}

/// An in-memory PE DLL, loaded and queried without touching the filesystem.
pub struct MemoryModule {
    loaded: Option<LoadedImage>,
    export_cache: Mutex<Option<Vec<Export>>>,
}

// SAFETY: the mapped image is exclusively owned; `&self` methods only read
// image memory that stays immutable between `load` and `unload`, and the
// export cache is guarded by its mutex.
unsafe impl Send for MemoryModule {}
unsafe impl Sync for MemoryModule {}

impl MemoryModule {
    /// Creates an empty module.
    pub fn new() -> Self {
        Self {
            loaded: None,
            export_cache: Mutex::new(None),
        }
    }

    /// Loads a complete on-disk PE image from memory.
    ///
    /// A populated module is unloaded first, so at most one mapped image
    /// exists across retries. On failure the module is empty and every
    /// reserved resource has been released.
    pub fn load(&mut self, data: &[u8]) -> Result<()> {
        self.load_with_options(data, LoadOptions::default())
    }

    /// [`load`](Self::load) with explicit policy switches.
    pub fn load_with_options(&mut self, data: &[u8], options: LoadOptions) -> Result<()> {
        self.unload();
        let loaded = run_pipeline(data, options)?;
        debug!(
            "image loaded at {:p} ({:#x} bytes)",
            loaded.image.base(),
            loaded.image.size()
        );
        self.loaded = Some(loaded);
        Ok(())
    }

    /// Releases the mapped image, notifying the DLL of process detach first.
    ///
    /// Total: never fails observably, and is a no-op on an empty module.
    pub fn unload(&mut self) {
        if let Some(loaded) = self.loaded.take() {
            if loaded.is_dll && loaded.entry_rva != 0 {
                // SAFETY: the image is still mapped with its finalized
                // protections and attach succeeded during load.
                unsafe { init::notify_detach(&loaded.image, loaded.entry_rva) };
            }
            debug!("image at {:p} unloaded", loaded.image.base());
            // Dropping `loaded` releases the region.
        }
        let mut cache = self.lock_cache();
        *cache = None;
    }

    /// Address of a named export, with the digit-string ordinal fallback.
    pub fn lookup_by_name(&self, name: &str) -> Option<*const c_void> {
        self.with_exports(|table| exports::lookup(table, name).map(|e| e.address))
    }

    /// Address of an export by biased ordinal.
    pub fn lookup_by_ordinal(&self, ordinal: u32) -> Option<*const c_void> {
        self.with_exports(|table| exports::find_by_ordinal(table, ordinal).map(|e| e.address))
    }

    /// Name of the export carrying `ordinal`, if any.
    pub fn name_of(&self, ordinal: u32) -> Option<String> {
        self.with_exports(|table| {
            exports::find_by_ordinal(table, ordinal).map(|e| e.name.clone())
        })
    }

    /// Biased ordinal of the named export, if any.
    pub fn ordinal_of(&self, name: &str) -> Option<u32> {
        self.with_exports(|table| exports::find_by_name(table, name).map(|e| e.ordinal))
    }

    /// True when the resident image is PE32+.
    ///
    /// False on an empty module.
    pub fn is_64bit(&self) -> bool {
        self.loaded.as_ref().map_or(false, |l| l.is_64bit)
    }

    /// Base address of the mapped image, or `None` when empty.
    pub fn base_address(&self) -> Option<NonNull<c_void>> {
        self.loaded
            .as_ref()
            .and_then(|l| NonNull::new(l.image.base() as *mut c_void))
    }

    /// Size of the mapped image in bytes; zero when empty.
    pub fn image_size(&self) -> usize {
        self.loaded.as_ref().map_or(0, |l| l.image.size())
    }

    /// Number of named exports.
    pub fn export_count(&self) -> usize {
        self.with_exports(<[Export]>::len)
    }

    /// Snapshot of the export table.
    pub fn exports(&self) -> Vec<Export> {
        self.with_exports(<[Export]>::to_vec)
    }

    /// The image's own name from the export directory, or `""` when the
    /// image has no export directory or no recorded name.
    pub fn module_name(&self) -> String {
        let Some(loaded) = &self.loaded else {
            return String::new();
        };
        let directory = loaded
            .view
            .data_directory(&loaded.image, DataDirectoryIndex::Export);
        if directory.virtual_address == 0 {
            return String::new();
        }
        if !loaded.image.contains(
            directory.virtual_address,
            std::mem::size_of::<ExportDirectory>(),
        ) {
            return String::new();
        }
        // SAFETY: checked directly above.
        let table: ExportDirectory =
            unsafe { loaded.image.read_at(directory.virtual_address) };
        if table.name == 0 {
            return String::new();
        }
        loaded.image.cstr_at(table.name).unwrap_or_default()
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, Option<Vec<Export>>> {
        // A panic in another reader must not wedge lookups or teardown.
        self.export_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` over the export table, building it on first use.
    ///
    /// An empty module sees an empty table. A malformed export directory is
    /// logged and cached as empty rather than surfaced: lookups have no
    /// error channel, and rebuilding on every miss would repeat the fault.
    fn with_exports<R>(&self, f: impl FnOnce(&[Export]) -> R) -> R {
        let Some(loaded) = &self.loaded else {
            return f(&[]);
        };
        let mut cache = self.lock_cache();
        if cache.is_none() {
            let table = match exports::build(&loaded.image, &loaded.view) {
                Ok(table) => table,
                Err(err) => {
                    warn!("export table unusable: {err}");
                    Vec::new()
                }
            };
            *cache = Some(table);
        }
        f(cache.as_deref().unwrap_or(&[]))
    }
}

impl Default for MemoryModule {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryModule {
    fn drop(&mut self) {
        self.unload();
    }
}

/// The loading pipeline, stage order fixed by data dependencies: relocation
/// and import resolution need writable pages, initialization needs final
/// protections and a complete IAT.
fn run_pipeline(data: &[u8], options: LoadOptions) -> Result<LoadedImage> {
    let pe = PeFile::parse(data)?;
    let preferred_base = pe.image_base();
    let size = align_up(pe.size_of_image() as usize, page_size());

    let image = MappedImage::allocate(preferred_base, size)?;
    let view = sections::copy_headers(&image, &pe)?;
    sections::place_sections(&image, &pe)?;
    relocation::apply(&image, &view, preferred_base, options.strict_rebase)?;
    imports::resolve(&image, &view)?;
    sections::finalize_sections(&image, &view)?;
    init::run_tls_callbacks(&image, &view)?;
    init::call_entry_point(&image, &view)?;

    Ok(LoadedImage {
        is_64bit: pe.is_64bit(),
        is_dll: pe.is_dll(),
        entry_rva: pe.entry_point_rva(),
        image,
        view,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LoaderError;

    #[test]
    fn test_empty_module_lookups() {
        let module = MemoryModule::new();
        assert!(module.lookup_by_name("anything").is_none());
        assert!(module.lookup_by_ordinal(1).is_none());
        assert!(module.name_of(1).is_none());
        assert!(module.ordinal_of("anything").is_none());
        assert!(module.base_address().is_none());
        assert!(!module.is_64bit());
        assert_eq!(module.image_size(), 0);
        assert_eq!(module.export_count(), 0);
        assert!(module.exports().is_empty());
        assert_eq!(module.module_name(), "");
    }

    #[test]
    fn test_unload_on_empty_is_noop() {
        let mut module = MemoryModule::new();
        module.unload();
        module.unload();
        assert!(module.base_address().is_none());
    }

    #[test]
    fn test_load_rejects_garbage_and_stays_empty() {
        let mut module = MemoryModule::new();
        let err = module.load(b"not a pe image").unwrap_err();
        assert!(matches!(err, LoaderError::InvalidImage(_)));
        assert!(module.base_address().is_none());
        assert_eq!(module.export_count(), 0);
    }

    #[test]
    fn test_load_rejects_empty_buffer() {
        let mut module = MemoryModule::new();
        assert!(module.load(&[]).is_err());
        assert!(module.base_address().is_none());
    }

    #[test]
    fn test_default_options_are_permissive() {
        let options = LoadOptions::default();
        assert!(!options.strict_rebase);
    }
}
