#![no_main]
use libfuzzer_sys::fuzz_target;
use span_cache::core::span::SpanHeader;

// Arbitrary bytes at the span start must never panic, and anything that
// parses and validates must have consistent counts, stay inside the span
// and re-encode exactly.
fuzz_target!(|data: &[u8]| {
    let Ok(header) = SpanHeader::from_bytes(data) else {
        return;
    };
    assert_eq!(header.stripes.len(), header.n_stripe_spans as usize);

    let encoded = header.to_bytes();
    assert_eq!(&data[..encoded.len()], &encoded[..]);

    for stripe in &header.stripes {
        let _ = stripe.len_bytes();
        let _ = stripe.end();
    }

    if header.validate().is_ok() {
        assert_eq!(
            u64::from(header.n_used) + u64::from(header.n_free),
            u64::from(header.n_stripe_spans)
        );
        let span_bytes = header.n_storage_blocks.saturating_mul(8192);
        for stripe in &header.stripes {
            assert!(stripe.end().is_some_and(|end| end <= span_bytes));
        }
    }
});
