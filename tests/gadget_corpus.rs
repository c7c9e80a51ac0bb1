//! Builds a small synthetic "kernel" region containing a couple of real
//! gadget byte sequences at known offsets plus padding, via
//! [`FakeKernelImage`], and checks the scanner finds exactly those and
//! names the rest as missing.

use kernel_call::gadgets::{self, GadgetError, ScannableSegment, VmProt};
use kernel_call::oracle::{FakeKernelImage, KernelImage};
use std::sync::atomic::AtomicBool;

#[test]
fn scanner_finds_planted_gadgets_and_reports_the_rest_missing() {
    let catalog = gadgets::catalog();
    let dispatcher = catalog.iter().find(|g| g.name == "ldp x2, x1, [x1] ; br x2").unwrap();
    let recover = catalog.iter().find(|g| g.name == "ret").unwrap();

    let mut bytes = vec![0u8; 0x40];
    for (i, w) in dispatcher.words.iter().enumerate() {
        bytes[i * 4..i * 4 + 4].copy_from_slice(&w.to_le_bytes());
    }
    let recover_offset = 0x20;
    for (i, w) in recover.words.iter().enumerate() {
        bytes[recover_offset + i * 4..recover_offset + i * 4 + 4].copy_from_slice(&w.to_le_bytes());
    }

    let image = FakeKernelImage::new(0x1000).with_region("__TEXT_EXEC", 0x4000, bytes);
    let region = image.segment("__TEXT_EXEC").unwrap();
    let segments = [ScannableSegment {
        runtime_address: region.runtime_address,
        bytes: region.bytes,
        init_prot: VmProt::READ | VmProt::EXECUTE,
        max_prot: VmProt::READ | VmProt::EXECUTE,
    }];

    let interrupted = AtomicBool::new(false);
    let (found, errors) = gadgets::scan(&segments, &interrupted);

    assert_eq!(
        found.get(dispatcher.name),
        Some(region.runtime_address)
    );
    assert_eq!(
        found.get(recover.name),
        Some(region.runtime_address + recover_offset as u64)
    );

    let missing: Vec<_> = catalog
        .iter()
        .filter(|g| g.name != dispatcher.name && g.name != recover.name)
        .map(|g| g.name)
        .collect();
    for name in missing {
        assert!(
            errors.iter().any(|e| matches!(e, GadgetError::NotFound(n) if *n == name)),
            "expected {name:?} to be reported missing"
        );
    }
}
