#![no_main]

use libfuzzer_sys::fuzz_target;
use tau_thread_routing::{validate_normalized_message, NormalizedMessage};

fuzz_target!(|data: &[u8]| {
    let Ok(message) = serde_json::from_slice::<NormalizedMessage>(data) else {
        return;
    };
    if validate_normalized_message(&message).is_ok() {
        assert!(!message.id.trim().is_empty());
        assert!(!message.sender_identifier.trim().is_empty());
    }
    let _ = message.metadata_text("propertyId");
    let _ = message.metadata_text("projectId");
});
