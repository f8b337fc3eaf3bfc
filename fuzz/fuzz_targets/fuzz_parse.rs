#![no_main]

use libfuzzer_sys::fuzz_target;
use fiscseq::codec;

fuzz_target!(|data: &[u8]| {
    // Invalid UTF-8 becomes replacement chars
    let text = String::from_utf8_lossy(data);

    // Must not panic, and anything that parses must format back to itself
    if let Ok((prefix, sequence)) = codec::parse(&text) {
        let formatted = codec::format(&prefix.to_string(), sequence)
            .expect("parsed sequence fits its prefix class");
        assert_eq!(formatted, text.trim().to_ascii_uppercase());
        assert!(codec::validate(&formatted));
    }

    let _ = codec::padding_for(&text);
    let _ = codec::capacity_for(&text);
});
