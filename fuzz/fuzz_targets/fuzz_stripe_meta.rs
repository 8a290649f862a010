#![no_main]
use libfuzzer_sys::fuzz_target;
use span_cache::core::stripe_meta::{MetaCopy, StripeCopies, StripeMeta};

// Four arbitrary blocks as descriptor copies: parsing and reconciliation
// must never panic, and a chosen pair must agree.
fuzz_target!(|data: &[u8]| {
    let mut copies = StripeCopies::new();
    for (copy, chunk) in MetaCopy::ALL.into_iter().zip(data.chunks(96)) {
        let freelist_len = if copy.is_header() { 12 } else { 0 };
        copies.insert(copy, StripeMeta::from_bytes(chunk, freelist_len));
    }

    if let Ok(reconciled) = copies.reconcile() {
        assert_eq!(reconciled.header.generation, reconciled.footer.generation);
        assert_eq!(reconciled.header.sync_serial, reconciled.footer.sync_serial);
        assert_ne!(reconciled.header.generation, 0);
    }
});
