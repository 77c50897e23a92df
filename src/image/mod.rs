//! Mapped-image ownership and bounds-checked access.
//!
//! [`MappedImage`] owns one contiguous virtual-memory region for the life of
//! a load cycle: reserved and committed read-write up front, re-protected per
//! section during finalization, released on drop. All pipeline stages go
//! through its RVA accessors so the "is this RVA inside the image?" predicate
//! lives in exactly one place.

#[cfg(windows)]
use std::ffi::c_void;
use std::mem;
use std::ptr::{self, NonNull};

#[cfg(windows)]
use log::warn;

#[cfg(windows)]
use crate::error::Win32Error;
use crate::error::{LoaderError, Result};
use crate::pe::{
    DataDirectory, DataDirectoryIndex, FileHeader, NtHeaders, OptionalHeader, SectionFlags,
    SectionHeader, DATA_DIRECTORY_COUNT,
};

/// Queries the system page size.
///
/// Outside Windows the conventional 4 KiB is returned; the value is only used
/// by code paths that cannot execute there anyway.
pub fn page_size() -> usize {
    #[cfg(windows)]
    unsafe {
        let mut info: windows_sys::Win32::System::SystemInformation::SYSTEM_INFO = mem::zeroed();
        windows_sys::Win32::System::SystemInformation::GetNativeSystemInfo(&mut info);
        info.dwPageSize as usize
    }
    #[cfg(not(windows))]
    {
        0x1000
    }
}

/// Rounds `value` up to the next multiple of `alignment` (a power of two).
#[inline]
pub const fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// Rounds `value` down to a multiple of `alignment` (a power of two).
#[inline]
pub const fn align_down(value: usize, alignment: usize) -> usize {
    value & !(alignment - 1)
}

/// Final page protection derived from section characteristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Protection {
    NoAccess = 0x01,
    ReadOnly = 0x02,
    ReadWrite = 0x04,
    ExecuteRead = 0x20,
    ExecuteReadWrite = 0x40,
}

impl Protection {
    /// Maps `IMAGE_SCN_MEM_*` bits to the protection applied at finalization.
    ///
    /// Write implies read; execute+write collapses to execute-read-write.
    pub fn from_section_flags(flags: SectionFlags) -> Self {
        let executable = flags.contains(SectionFlags::MEM_EXECUTE);
        let writable = flags.contains(SectionFlags::MEM_WRITE);
        let readable = flags.contains(SectionFlags::MEM_READ);

        match (executable, writable, readable) {
            (true, true, _) => Protection::ExecuteReadWrite,
            (true, false, _) => Protection::ExecuteRead,
            (false, true, _) => Protection::ReadWrite,
            (false, false, true) => Protection::ReadOnly,
            (false, false, false) => Protection::NoAccess,
        }
    }

    /// Raw `PAGE_*` constant.
    #[inline]
    pub fn as_raw(self) -> u32 {
        self as u32
    }
}

/// A reserved-and-committed virtual-memory region holding one PE image.
///
/// The region is exclusively owned; dropping the value releases it. Teardown
/// is total: a failing release is logged and swallowed.
pub struct MappedImage {
    base: NonNull<u8>,
    size: usize,
}

// SAFETY: the region is owned for the struct's lifetime and all mutation
// goes through methods whose callers uphold the loading-order contract.
unsafe impl Send for MappedImage {}
unsafe impl Sync for MappedImage {}

impl MappedImage {
    /// Reserves and commits `size` bytes of read-write memory, preferring
    /// `preferred_base` and falling back to a host-chosen address.
    ///
    /// Landing on the preferred base makes the relocation pass a no-op, so
    /// the first attempt is worth the extra call.
    pub fn allocate(preferred_base: usize, size: usize) -> Result<Self> {
        #[cfg(windows)]
        {
            use windows_sys::Win32::System::Memory::{
                VirtualAlloc, MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE,
            };

            let mut raw = unsafe {
                VirtualAlloc(
                    preferred_base as *const c_void,
                    size,
                    MEM_COMMIT | MEM_RESERVE,
                    PAGE_READWRITE,
                )
            };
            if raw.is_null() {
                raw = unsafe {
                    VirtualAlloc(ptr::null(), size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE)
                };
            }

            match NonNull::new(raw as *mut u8) {
                Some(base) => Ok(Self { base, size }),
                None => Err(LoaderError::OutOfAddressSpace(Win32Error::last())),
            }
        }
        #[cfg(not(windows))]
        {
            let _ = (preferred_base, size);
            Err(LoaderError::UnsupportedPlatform)
        }
    }

    /// Base address of the region.
    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Size of the region in bytes (page-aligned `SizeOfImage`).
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// The bounds predicate: does `[rva, rva+len)` lie inside the image?
    #[inline]
    pub fn contains(&self, rva: u32, len: usize) -> bool {
        range_within(self.size, rva, len)
    }

    /// Absolute address of an RVA. The caller is responsible for bounds.
    #[inline]
    pub fn rva_to_va(&self, rva: u32) -> *mut u8 {
        // SAFETY: offsets are validated by callers via `contains`; the
        // resulting pointer stays within or one-past the owned region.
        unsafe { self.base.as_ptr().add(rva as usize) }
    }

    /// Reads a `T` at `rva` without alignment requirements.
    ///
    /// # Safety
    ///
    /// The caller must have verified `contains(rva, size_of::<T>())`.
    #[inline]
    pub unsafe fn read_at<T: Copy>(&self, rva: u32) -> T {
        ptr::read_unaligned(self.rva_to_va(rva) as *const T)
    }

    /// Writes a `T` at `rva` without alignment requirements.
    ///
    /// # Safety
    ///
    /// The caller must have verified `contains(rva, size_of::<T>())`, and the
    /// target pages must still be writable.
    #[inline]
    pub unsafe fn write_at<T>(&self, rva: u32, value: T) {
        ptr::write_unaligned(self.rva_to_va(rva) as *mut T, value);
    }

    /// Borrows `len` bytes at `rva`.
    ///
    /// # Safety
    ///
    /// The caller must have verified `contains(rva, len)` and must not hold
    /// the slice across a protection change or teardown.
    #[inline]
    pub unsafe fn slice_at(&self, rva: u32, len: usize) -> &[u8] {
        std::slice::from_raw_parts(self.rva_to_va(rva), len)
    }

    /// Reads the NUL-terminated string at `rva`, bounded by the image end.
    ///
    /// Returns `None` when the RVA is outside the image or no terminator
    /// exists before the end of the region.
    pub fn cstr_at(&self, rva: u32) -> Option<String> {
        if !self.contains(rva, 1) {
            return None;
        }
        let avail = self.size - rva as usize;
        // SAFETY: `[rva, rva+avail)` is inside the committed region.
        let bytes = unsafe { self.slice_at(rva, avail) };
        let end = bytes.iter().position(|&b| b == 0)?;
        Some(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }

    /// Applies `protection` to `size` bytes at `address` (page-aligned down
    /// by the caller, as the section finalizer does).
    pub fn protect(&self, address: *mut u8, size: usize, protection: Protection) -> Result<()> {
        #[cfg(windows)]
        {
            use windows_sys::Win32::System::Memory::VirtualProtect;

            let mut old = 0u32;
            let ok = unsafe {
                VirtualProtect(address as *const c_void, size, protection.as_raw(), &mut old)
            };
            if ok == 0 {
                let rva = (address as usize).wrapping_sub(self.base.as_ptr() as usize) as u32;
                return Err(LoaderError::ProtectionFailed {
                    rva,
                    code: Win32Error::last(),
                });
            }
            Ok(())
        }
        #[cfg(not(windows))]
        {
            let _ = (address, size, protection);
            Err(LoaderError::UnsupportedPlatform)
        }
    }
}

impl Drop for MappedImage {
    fn drop(&mut self) {
        #[cfg(windows)]
        {
            use windows_sys::Win32::System::Memory::{VirtualFree, MEM_RELEASE};

            let ok = unsafe { VirtualFree(self.base.as_ptr() as *mut c_void, 0, MEM_RELEASE) };
            if ok == 0 {
                warn!(
                    "failed to release image region at {:p}: {}",
                    self.base.as_ptr(),
                    Win32Error::last()
                );
            }
        }
    }
}

/// Free-function form of the bounds predicate, shared with tests.
#[inline]
pub(crate) fn range_within(region_size: usize, rva: u32, len: usize) -> bool {
    match (rva as usize).checked_add(len) {
        Some(end) => end <= region_size,
        None => false,
    }
}

/// The copied NT headers inside a mapped image.
///
/// Built by the section placer after the header bytes land in the region;
/// every later stage reads headers through this view rather than the input
/// buffer, so the rewritten `ImageBase` is what they observe.
#[derive(Debug, Clone, Copy)]
pub struct HeaderView {
    e_lfanew: u32,
}

impl HeaderView {
    /// Creates a view for headers copied at offset `e_lfanew`.
    ///
    /// The placer guarantees `[e_lfanew, e_lfanew + sizeof(NT headers))` is
    /// inside the copied header bytes before constructing the view.
    pub(crate) fn new(e_lfanew: u32) -> Self {
        Self { e_lfanew }
    }

    #[inline]
    fn file_header_rva(&self) -> u32 {
        self.e_lfanew + 4
    }

    #[inline]
    fn optional_header_rva(&self) -> u32 {
        self.file_header_rva() + mem::size_of::<FileHeader>() as u32
    }

    /// COFF file header from the mapped copy.
    pub fn file_header(&self, image: &MappedImage) -> FileHeader {
        // SAFETY: the placer validated the NT header range at copy time.
        unsafe { image.read_at(self.file_header_rva()) }
    }

    /// Optional header from the mapped copy.
    pub fn optional_header(&self, image: &MappedImage) -> OptionalHeader {
        // SAFETY: as for `file_header`.
        unsafe { image.read_at(self.optional_header_rva()) }
    }

    /// Rewrites the mapped `ImageBase` field to the actual base address.
    pub fn rewrite_image_base(&self, image: &MappedImage) {
        let mut optional = self.optional_header(image);
        optional.image_base = image.base() as usize as _;
        // SAFETY: same range as the read; pages are still read-write.
        unsafe { image.write_at(self.optional_header_rva(), optional) };
    }

    /// Returns data directory `index`, or an empty directory when the image
    /// declares fewer slots.
    pub fn data_directory(&self, image: &MappedImage, index: DataDirectoryIndex) -> DataDirectory {
        let optional = self.optional_header(image);
        let count = optional.number_of_rva_and_sizes as usize;
        let directories = optional.data_directory;
        let idx = index as usize;
        if idx >= count.min(DATA_DIRECTORY_COUNT) {
            return DataDirectory::default();
        }
        directories[idx]
    }

    /// Reads the full section table from the mapped copy.
    pub fn section_headers(&self, image: &MappedImage) -> Result<Vec<SectionHeader>> {
        let file_header = self.file_header(image);
        let count = file_header.number_of_sections;
        let table_rva = self.optional_header_rva() + u32::from(file_header.size_of_optional_header);
        let entry = mem::size_of::<SectionHeader>();

        if !image.contains(table_rva, usize::from(count) * entry) {
            return Err(LoaderError::malformed_section(
                "section table exceeds the image",
            ));
        }

        let mut sections = Vec::with_capacity(usize::from(count));
        for i in 0..count {
            let rva = table_rva + u32::from(i) * entry as u32;
            // SAFETY: the whole table range was checked above.
            sections.push(unsafe { image.read_at::<SectionHeader>(rva) });
        }
        Ok(sections)
    }

    /// Checks that the view's own headers fit inside `image`.
    pub(crate) fn validate_bounds(e_lfanew: u32, image: &MappedImage) -> Result<Self> {
        if !image.contains(e_lfanew, mem::size_of::<NtHeaders>()) {
            return Err(LoaderError::malformed_section(
                "NT headers exceed the image",
            ));
        }
        Ok(Self::new(e_lfanew))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_helpers() {
        assert_eq!(align_up(0, 0x1000), 0);
        assert_eq!(align_up(1, 0x1000), 0x1000);
        assert_eq!(align_up(0x1000, 0x1000), 0x1000);
        assert_eq!(align_up(0x1001, 0x1000), 0x2000);
        assert_eq!(align_down(0x1FFF, 0x1000), 0x1000);
        assert_eq!(align_down(0x1000, 0x1000), 0x1000);
    }

    #[test]
    fn test_protection_table() {
        use SectionFlags as F;

        let cases = [
            (F::empty(), Protection::NoAccess),
            (F::MEM_READ, Protection::ReadOnly),
            (F::MEM_WRITE, Protection::ReadWrite),
            (F::MEM_READ | F::MEM_WRITE, Protection::ReadWrite),
            (F::MEM_EXECUTE, Protection::ExecuteRead),
            (F::MEM_EXECUTE | F::MEM_READ, Protection::ExecuteRead),
            (F::MEM_EXECUTE | F::MEM_WRITE, Protection::ExecuteReadWrite),
            (
                F::MEM_EXECUTE | F::MEM_READ | F::MEM_WRITE,
                Protection::ExecuteReadWrite,
            ),
        ];
        for (flags, expected) in cases {
            assert_eq!(
                Protection::from_section_flags(flags),
                expected,
                "flags {flags:?}"
            );
        }
    }

    #[test]
    fn test_protection_raw_values() {
        assert_eq!(Protection::NoAccess.as_raw(), 0x01);
        assert_eq!(Protection::ReadOnly.as_raw(), 0x02);
        assert_eq!(Protection::ReadWrite.as_raw(), 0x04);
        assert_eq!(Protection::ExecuteRead.as_raw(), 0x20);
        assert_eq!(Protection::ExecuteReadWrite.as_raw(), 0x40);
    }

    #[test]
    fn test_range_predicate() {
        assert!(range_within(0x2000, 0, 0x2000));
        assert!(range_within(0x2000, 0x1FFF, 1));
        assert!(!range_within(0x2000, 0x1FFF, 2));
        assert!(!range_within(0x2000, 0x2000, 1));
        assert!(range_within(0x2000, 0x2000, 0));
        assert!(!range_within(0x2000, u32::MAX, usize::MAX));
    }

    #[cfg(windows)]
    #[test]
    fn test_allocate_and_access() {
        let size = align_up(0x1800, page_size());
        let image = MappedImage::allocate(0, size).expect("fresh commit");
        assert_eq!(image.size(), size);
        assert!(image.contains(0, size));
        assert!(!image.contains(size as u32, 1));

        // Committed memory starts zeroed.
        unsafe {
            assert_eq!(image.read_at::<u64>(0x10), 0);
            image.write_at::<u32>(0x10, 0xC0FFEE);
            assert_eq!(image.read_at::<u32>(0x10), 0xC0FFEE);
        }
        assert_eq!(image.cstr_at(0x40), Some(String::new()));
    }
}
