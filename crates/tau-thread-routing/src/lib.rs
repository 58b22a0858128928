//! Thread routing engine for messages arriving over SMS, chat platforms,
//! email, and in-app channels.
//!
//! Provides identity resolution with a TTL cache, identity/metadata/context
//! routing strategies, the routing orchestrator, a retry sweeper with
//! dead-lettering, manual assignment, and the routing decision log.
//!
//! ```rust
//! use tau_thread_routing::{extract_keywords, AddressSignals};
//!
//! let keywords = extract_keywords("Is the water heater at the unit leaking?", 10);
//! assert_eq!(keywords, vec!["water", "heater", "unit", "leaking"]);
//!
//! let signals = AddressSignals::extract("Leak at 123 Main St Durham NC");
//! assert_eq!(signals.street_addresses, vec!["123 main st"]);
//! assert_eq!(signals.cities, vec!["durham"]);
//! ```

pub mod clock;
pub mod decision_log;
pub mod engine;
pub mod identity_cache;
pub mod identity_link;
pub mod identity_resolver;
pub mod manual_assignment;
pub mod orchestrator;
pub mod retry_sweeper;
pub mod routing_config;
pub mod routing_contract;
pub mod routing_error;
pub mod routing_store;
mod snapshot_locking;
pub mod strategies;

pub use clock::*;
pub use decision_log::*;
pub use engine::*;
pub use identity_cache::*;
pub use identity_link::*;
pub use identity_resolver::*;
pub use manual_assignment::*;
pub use orchestrator::*;
pub use retry_sweeper::*;
pub use routing_config::*;
pub use routing_contract::*;
pub use routing_error::*;
pub use routing_store::*;
pub use strategies::text_signals::{extract_keywords, AddressSignals};
pub use strategies::{
    AddressScorer, KeywordScorer, RoutingStrategy, ScoredCandidate, ScoringStrategy, StrategySet,
    ROUTING_STRATEGY_PRIORITY,
};
