use std::collections::BTreeSet;

use proptest::prelude::*;
use tau_thread_routing::{extract_keywords, AddressSignals, ExternalIdentityType};

proptest! {
    #[test]
    fn functional_keywords_are_bounded_distinct_and_long_enough(
        text in "[A-Za-z0-9 ,.!?'-]{0,200}",
        max_keywords in 0_usize..16,
    ) {
        let keywords = extract_keywords(&text, max_keywords);
        prop_assert!(keywords.len() <= max_keywords);
        let distinct = keywords.iter().collect::<BTreeSet<_>>();
        prop_assert_eq!(distinct.len(), keywords.len());
        for keyword in &keywords {
            prop_assert!(keyword.chars().count() >= 3);
            prop_assert!(text.to_lowercase().contains(keyword.as_str()));
        }
    }

    #[test]
    fn functional_address_signals_are_lowercase_and_deduplicated(
        text in "[A-Za-z0-9 ,.]{0,160}",
    ) {
        let signals = AddressSignals::extract(&text);
        for group in [&signals.street_addresses, &signals.cities, &signals.states] {
            let distinct = group.iter().collect::<BTreeSet<_>>();
            prop_assert_eq!(distinct.len(), group.len());
            for entry in group {
                prop_assert_eq!(entry, &entry.to_lowercase());
            }
        }
        prop_assert_eq!(signals.is_empty(), signals.keyword_count() == 0);
    }

    #[test]
    fn regression_email_normalization_is_idempotent(
        local in "[A-Za-z0-9._]{1,16}",
        domain in "[A-Za-z]{1,12}",
    ) {
        let raw = format!("  {local}@{domain}.Com ");
        if let Ok(normalized) = ExternalIdentityType::Email.normalize_value(&raw) {
            prop_assert_eq!(
                ExternalIdentityType::Email.normalize_value(&normalized).ok(),
                Some(normalized.clone())
            );
            prop_assert_eq!(normalized.clone(), normalized.to_lowercase());
        }
    }
}
