//! memdll - in-memory loader for Windows PE dynamic libraries
//!
//! Given a byte buffer holding a complete on-disk PE image, [`MemoryModule`]
//! maps it into the current process the way the OS loader would: sections
//! placed with their final page protections, base relocations applied,
//! imports resolved against resident system libraries, TLS callbacks and
//! `DllMain` invoked. The resulting exports are exposed as callable
//! addresses. The image never touches the filesystem.
//!
//! ```no_run
//! use memdll::MemoryModule;
//!
//! let bytes = std::fs::read("payload.dll")?;
//! let mut module = MemoryModule::new();
//! module.load(&bytes)?;
//!
//! if let Some(address) = module.lookup_by_name("add") {
//!     let add: extern "system" fn(i32, i32) -> i32 =
//!         unsafe { std::mem::transmute(address) };
//!     assert_eq!(add(3, 4), 7);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Only images whose machine word width matches the host process are
//! accepted; there is no cross-architecture support. Dependency DLLs pulled
//! in by the import resolver stay pinned for the life of the process, and
//! TLS detach callbacks are not issued on unload.

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod exports;
pub mod ffi;
pub mod image;
pub mod imports;
pub mod init;
pub mod module;
pub mod pe;
pub mod relocation;
pub mod sections;

pub use error::{LoaderError, Result, Win32Error};
pub use exports::Export;
pub use module::{LoadOptions, MemoryModule};
