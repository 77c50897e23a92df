//! Error types for the in-memory PE loader.
//!
//! Every pipeline stage reports its own failure mode; nothing is recovered
//! locally, and a non-success short-circuits the whole load. The facade
//! flattens everything to a boolean only at the C boundary.

use std::error::Error;
use std::fmt;

/// A captured Win32 last-error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Win32Error(pub u32);

impl Win32Error {
    /// Captures `GetLastError` for the calling thread.
    ///
    /// On non-Windows hosts there is no last-error state; the code is zero.
    pub fn last() -> Self {
        #[cfg(windows)]
        unsafe {
            Win32Error(windows_sys::Win32::Foundation::GetLastError())
        }
        #[cfg(not(windows))]
        Win32Error(0)
    }

    /// Returns the raw error code.
    #[inline]
    pub const fn code(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for Win32Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Win32 error 0x{:08X}", self.0)
    }
}

impl From<u32> for Win32Error {
    fn from(code: u32) -> Self {
        Win32Error(code)
    }
}

/// Failure modes of the loading pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoaderError {
    /// The buffer does not hold a well-formed PE image.
    InvalidImage(String),
    /// The image's machine type does not match the host process.
    UnsupportedArchitecture {
        /// `FileHeader.Machine` of the rejected image.
        machine: u16,
    },
    /// Both reservation attempts (preferred base, then any base) failed.
    OutOfAddressSpace(Win32Error),
    /// A section's offsets fall outside the input buffer or the mapped image.
    MalformedSection(String),
    /// The base-relocation directory is structurally inconsistent.
    MalformedReloc(String),
    /// A dependency DLL could not be loaded by the host loader.
    ImportLibraryNotFound {
        /// Name of the dependency as recorded in the import directory.
        library: String,
        /// Last-error code from the failed load.
        code: Win32Error,
    },
    /// A dependency DLL does not export a required procedure.
    ImportSymbolNotFound {
        /// Dependency the lookup ran against.
        library: String,
        /// Procedure name, or `#N` for by-ordinal imports.
        symbol: String,
    },
    /// The OS refused a page-protection change during finalization.
    ProtectionFailed {
        /// RVA of the section whose protection could not be applied.
        rva: u32,
        /// Last-error code from the failed call.
        code: Win32Error,
    },
    /// `DllMain` returned FALSE for the process-attach notification.
    EntryPointRejected,
    /// The image must be rebased but carries no relocation directory.
    ///
    /// Only raised under [`LoadOptions::strict_rebase`]; the default policy
    /// loads such images without relocating.
    ///
    /// [`LoadOptions::strict_rebase`]: crate::module::LoadOptions::strict_rebase
    CannotRelocate,
    /// The Win32 surface is unavailable on this platform.
    UnsupportedPlatform,
}

impl LoaderError {
    /// Creates an [`LoaderError::InvalidImage`] with the given message.
    pub fn invalid_image<S: Into<String>>(message: S) -> Self {
        Self::InvalidImage(message.into())
    }

    /// Creates a [`LoaderError::MalformedSection`] with the given message.
    pub fn malformed_section<S: Into<String>>(message: S) -> Self {
        Self::MalformedSection(message.into())
    }

    /// Creates a [`LoaderError::MalformedReloc`] with the given message.
    pub fn malformed_reloc<S: Into<String>>(message: S) -> Self {
        Self::MalformedReloc(message.into())
    }

    /// True for errors produced by header validation, before any allocation.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidImage(_) | Self::UnsupportedArchitecture { .. }
        )
    }
}

impl fmt::Display for LoaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidImage(msg) => write!(f, "invalid PE image: {msg}"),
            Self::UnsupportedArchitecture { machine } => {
                write!(f, "unsupported machine type 0x{machine:04X} for this host")
            }
            Self::OutOfAddressSpace(code) => {
                write!(f, "failed to reserve address space for the image ({code})")
            }
            Self::MalformedSection(msg) => write!(f, "malformed section: {msg}"),
            Self::MalformedReloc(msg) => write!(f, "malformed relocation data: {msg}"),
            Self::ImportLibraryNotFound { library, code } => {
                write!(f, "dependency {library} could not be loaded ({code})")
            }
            Self::ImportSymbolNotFound { library, symbol } => {
                write!(f, "symbol {symbol} not found in {library}")
            }
            Self::ProtectionFailed { rva, code } => {
                write!(
                    f,
                    "protection change refused for section at RVA 0x{rva:08X} ({code})"
                )
            }
            Self::EntryPointRejected => write!(f, "DllMain rejected the attach notification"),
            Self::CannotRelocate => {
                write!(f, "image requires rebasing but has no relocation directory")
            }
            Self::UnsupportedPlatform => write!(f, "PE loading requires a Windows host"),
        }
    }
}

impl Error for LoaderError {}

impl From<std::ffi::NulError> for LoaderError {
    fn from(_: std::ffi::NulError) -> Self {
        Self::MalformedSection("embedded NUL in an import name".into())
    }
}

/// Result alias used throughout the loader.
pub type Result<T> = std::result::Result<T, LoaderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_win32_error_display() {
        let err = Win32Error(0x0000_0005);
        assert_eq!(format!("{err}"), "Win32 error 0x00000005");
    }

    #[test]
    fn test_validation_classification() {
        assert!(LoaderError::invalid_image("short buffer").is_validation());
        assert!(LoaderError::UnsupportedArchitecture { machine: 0x014C }.is_validation());
        assert!(!LoaderError::EntryPointRejected.is_validation());
        assert!(!LoaderError::OutOfAddressSpace(Win32Error(8)).is_validation());
    }

    #[test]
    fn test_import_error_display() {
        let err = LoaderError::ImportSymbolNotFound {
            library: "kernel32.dll".into(),
            symbol: "#42".into(),
        };
        let text = format!("{err}");
        assert!(text.contains("kernel32.dll"));
        assert!(text.contains("#42"));
    }

    #[test]
    fn test_machine_display_is_hex() {
        let err = LoaderError::UnsupportedArchitecture { machine: 0x8664 };
        assert!(format!("{err}").contains("0x8664"));
    }
}
