#![no_main]

use chrono::NaiveDate;
use libfuzzer_sys::fuzz_target;
use fiscseq::codec::PrefixResolver;

fuzz_target!(|data: &[u8]| {
    // First byte splits category from explicit prefix
    let (split, rest) = match data.split_first() {
        Some((&s, rest)) => (s as usize, rest),
        None => return,
    };
    let split = split.min(rest.len());
    let category = String::from_utf8_lossy(&rest[..split]);
    let explicit = String::from_utf8_lossy(&rest[split..]);

    let cutover = NaiveDate::from_ymd_opt(2026, 1, 1).expect("valid date");
    let resolver = PrefixResolver::with_electronic_cutover(cutover);

    // Resolution never fails and always yields a well-formed prefix
    for explicit in [None, Some(explicit.as_ref())] {
        let prefix = resolver.resolve(&category, explicit);
        assert_eq!(prefix.to_string().len(), 3);
    }
});
