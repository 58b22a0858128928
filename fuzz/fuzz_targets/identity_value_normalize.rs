#![no_main]

use libfuzzer_sys::fuzz_target;
use tau_thread_routing::ExternalIdentityType;

fuzz_target!(|data: &[u8]| {
    let raw = String::from_utf8_lossy(data);
    for identity_type in [
        ExternalIdentityType::Phone,
        ExternalIdentityType::Email,
        ExternalIdentityType::PlatformId,
    ] {
        if let Ok(normalized) = identity_type.normalize_value(&raw) {
            assert!(!normalized.is_empty());
            assert_eq!(
                identity_type.normalize_value(&normalized).ok().as_deref(),
                Some(normalized.as_str())
            );
        }
    }
});
