//! Boundary behaviors of validation and the empty-module contract.
//!
//! Everything here is platform-independent: rejection happens before any
//! virtual memory is touched.

mod common;

use memdll::pe::{PeFile, HOST_MACHINE, IMAGE_FILE_MACHINE_AMD64, IMAGE_FILE_MACHINE_I386};
use memdll::{LoaderError, MemoryModule};

use common::{build_image, data_export_dll, default_image_base, ImageSpec};

fn foreign_machine() -> u16 {
    if HOST_MACHINE == IMAGE_FILE_MACHINE_AMD64 {
        IMAGE_FILE_MACHINE_I386
    } else {
        IMAGE_FILE_MACHINE_AMD64
    }
}

#[test]
fn empty_buffer_fails() {
    let mut module = MemoryModule::new();
    let err = module.load(&[]).unwrap_err();
    assert!(matches!(err, LoaderError::InvalidImage(_)));
    assert!(module.base_address().is_none());
}

#[test]
fn buffer_smaller_than_dos_header_fails() {
    let mut module = MemoryModule::new();
    let err = module.load(&[0x4D, 0x5A, 0x00]).unwrap_err();
    assert!(matches!(err, LoaderError::InvalidImage(_)));
}

#[test]
fn lfanew_past_end_fails() {
    let mut image = build_image(&ImageSpec::default());
    let len = image.len() as i32;
    image[0x3C..0x40].copy_from_slice(&len.to_le_bytes());
    let mut module = MemoryModule::new();
    assert!(matches!(
        module.load(&image).unwrap_err(),
        LoaderError::InvalidImage(_)
    ));
}

#[test]
fn architecture_mismatch_keeps_module_empty() {
    let image = build_image(&ImageSpec {
        machine: foreign_machine(),
        ..Default::default()
    });
    let mut module = MemoryModule::new();
    match module.load(&image).unwrap_err() {
        LoaderError::UnsupportedArchitecture { machine } => {
            assert_eq!(machine, foreign_machine());
        }
        other => panic!("expected UnsupportedArchitecture, got {other:?}"),
    }
    assert!(module.base_address().is_none());
    assert_eq!(module.export_count(), 0);
    assert!(module.lookup_by_name("anything").is_none());
}

#[test]
fn generated_image_parses() {
    let image = data_export_dll(default_image_base(), 1, "fixture.dll", &[("add", 0x1000)]);
    let pe = PeFile::parse(&image).expect("generated image must validate");
    assert_eq!(pe.image_base(), default_image_base());
    assert_eq!(pe.number_of_sections(), 2);
    assert!(pe.is_dll());
    assert_eq!(pe.entry_point_rva(), 0);
    assert_eq!(pe.section(0).unwrap().name_str(), ".data");
    assert_eq!(pe.section(1).unwrap().name_str(), ".edata");
}

#[test]
fn truncated_generated_image_fails() {
    let image = data_export_dll(default_image_base(), 1, "fixture.dll", &[("add", 0x1000)]);
    let mut module = MemoryModule::new();
    assert!(module.load(&image[..0x40]).is_err());
    assert!(module.load(&image[..0x100]).is_err());
}
