#![no_main]

use libfuzzer_sys::fuzz_target;
use tau_thread_routing::{extract_keywords, AddressSignals};

fuzz_target!(|data: &[u8]| {
    let text = String::from_utf8_lossy(data);
    let keywords = extract_keywords(&text, 10);
    assert!(keywords.len() <= 10);
    assert!(keywords.iter().all(|keyword| keyword.chars().count() >= 3));

    let signals = AddressSignals::extract(&text);
    assert_eq!(signals.is_empty(), signals.keyword_count() == 0);
    let _ = signals.mentioned_in(&text);
});
