use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;
use tau_thread_routing::{
    AddressScorer, AddressSignals, DecisionMethod, DeliveryStatus, ExternalIdentity,
    ExternalIdentityType, InMemoryRoutingStore, InboundOutcome, ManualClock, MessageChannel,
    MessageDirection, NormalizedMessage, PendingRetryStore, RoutingEngine, RoutingEngineConfig,
    RoutingMethod, Thread, ThreadLastMessage, ThreadMetadata, ThreadStore, UnassignedStatus,
    EXTERNAL_USER_ID_PREFIX,
};

const ORG: &str = "org-1";

struct Harness {
    store: Arc<InMemoryRoutingStore>,
    clock: Arc<ManualClock>,
    engine: RoutingEngine,
}

impl Harness {
    fn new(config: RoutingEngineConfig) -> Self {
        let store = Arc::new(InMemoryRoutingStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let engine = RoutingEngine::new(store.clone(), clock.clone(), config);
        Self {
            store,
            clock,
            engine,
        }
    }

    async fn link(&self, user_id: &str, identity_type: ExternalIdentityType, value: &str) {
        self.engine
            .resolver()
            .add_external_identity(
                user_id,
                ExternalIdentity::unverified(identity_type, value),
                ORG,
            )
            .await
            .expect("link identity");
    }

    async fn seed_thread(&self, thread: Thread) {
        self.store.create_thread(thread).await.expect("seed thread");
    }
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 1, 12, 0, 0).unwrap()
}

fn message(id: &str, channel: MessageChannel, sender: &str, text: &str) -> NormalizedMessage {
    NormalizedMessage {
        id: id.to_string(),
        thread_id: String::new(),
        channel,
        direction: MessageDirection::Incoming,
        sender_identifier: sender.to_string(),
        recipient_identifier: String::new(),
        text: text.to_string(),
        timestamp: start(),
        delivery_status: DeliveryStatus::Delivered,
        channel_metadata: BTreeMap::new(),
    }
}

fn thread(id: &str, participants: &[&str], age: Duration) -> Thread {
    let updated_at = start() - age;
    Thread {
        id: id.to_string(),
        organization_id: ORG.to_string(),
        participants: participants.iter().map(|user| user.to_string()).collect(),
        channel_sources: vec![MessageChannel::Sms],
        created_at: updated_at,
        updated_at,
        last_message: None,
        group_name: None,
        property_id: None,
        project_id: None,
        metadata: ThreadMetadata::default(),
    }
}

#[tokio::test]
async fn integration_known_phone_routes_to_recent_thread_by_identity() {
    let harness = Harness::new(RoutingEngineConfig::default());
    harness
        .link("u1", ExternalIdentityType::Phone, "+15551234567")
        .await;
    harness
        .seed_thread(thread("t1", &["u1"], Duration::hours(2)))
        .await;

    let result = harness
        .engine
        .orchestrator()
        .route_message(
            &message("m1", MessageChannel::Sms, "+15551234567", "ok"),
            ORG,
        )
        .await
        .expect("route")
        .expect("identity match");
    assert_eq!(result.thread_id, "t1");
    assert_eq!(result.confidence, 0.9);
    assert_eq!(result.method, RoutingMethod::Identity);

    let stored = harness.store.thread_messages("t1").await.expect("messages");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].thread_id, "t1");
}

#[tokio::test]
async fn integration_unknown_sender_misses_then_gets_new_thread_with_minted_user() {
    let harness = Harness::new(RoutingEngineConfig::default());
    let inbound = message("m1", MessageChannel::Sms, "+15559999999", "hello");

    let routed = harness
        .engine
        .orchestrator()
        .route_message(&inbound, ORG)
        .await
        .expect("route");
    assert!(routed.is_none());

    let created = harness
        .engine
        .orchestrator()
        .create_thread_for_message(&inbound, ORG)
        .await
        .expect("create");
    assert_eq!(created.method, RoutingMethod::Created);

    let thread = harness
        .store
        .get_thread(&created.thread_id)
        .await
        .expect("get thread")
        .expect("thread exists");
    assert_eq!(thread.channel_sources, vec![MessageChannel::Sms]);
    assert_eq!(thread.participants.len(), 1);
    assert!(thread.participants[0].starts_with(&format!("{EXTERNAL_USER_ID_PREFIX}-")));

    let minted = harness
        .engine
        .resolver()
        .lookup("+15559999999", ORG)
        .await
        .expect("lookup");
    assert_eq!(minted.as_deref(), Some(thread.participants[0].as_str()));
}

#[tokio::test]
async fn integration_street_and_city_mentions_route_by_metadata() {
    let harness = Harness::new(RoutingEngineConfig::default());
    let mut addressed = thread("t-main", &["u9"], Duration::hours(1));
    addressed.metadata = ThreadMetadata {
        address: Some("123 main st".to_string()),
        city: Some("durham".to_string()),
        state: None,
    };
    harness.seed_thread(addressed.clone()).await;
    harness
        .seed_thread(thread("t-other", &["u8"], Duration::minutes(5)))
        .await;

    let inbound = message(
        "m1",
        MessageChannel::Email,
        "tenant@example.com",
        "Water leak at 123 Main St Durham NC",
    );
    let signals = AddressSignals::extract(&inbound.text);
    assert_eq!(AddressScorer::score_thread(&signals, &addressed), 5);

    let result = harness
        .engine
        .orchestrator()
        .route_message(&inbound, ORG)
        .await
        .expect("route")
        .expect("metadata match");
    assert_eq!(result.thread_id, "t-main");
    assert_eq!(result.method, RoutingMethod::Metadata);
    assert_eq!(result.confidence, 0.6);
}

#[tokio::test]
async fn integration_property_reference_outranks_address_scoring() {
    let harness = Harness::new(RoutingEngineConfig::default());
    let mut referenced = thread("t-property", &["u9"], Duration::days(10));
    referenced.property_id = Some("prop-77".to_string());
    harness.seed_thread(referenced).await;

    let mut inbound = message(
        "m1",
        MessageChannel::InApp,
        "portal-user-5",
        "Any update on the gutters?",
    );
    inbound
        .channel_metadata
        .insert("propertyId".to_string(), json!("prop-77"));

    let result = harness
        .engine
        .orchestrator()
        .route_message(&inbound, ORG)
        .await
        .expect("route")
        .expect("reference match");
    assert_eq!(result.thread_id, "t-property");
    assert_eq!(result.method, RoutingMethod::Metadata);
    assert!((result.confidence - 0.85 * 0.9).abs() < 1e-9);
}

#[tokio::test]
async fn functional_identity_wins_over_context_for_different_threads() {
    let harness = Harness::new(RoutingEngineConfig::default());
    harness
        .link("u1", ExternalIdentityType::Phone, "+15551234567")
        .await;
    harness
        .seed_thread(thread("t-identity", &["u1"], Duration::days(3)))
        .await;
    let mut chatty = thread("t-context", &["u2"], Duration::minutes(1));
    chatty.last_message = Some(ThreadLastMessage {
        text: "dishwasher drain pump replacement scheduled tomorrow".to_string(),
        sender_identifier: "+15550000000".to_string(),
        channel: MessageChannel::Sms,
        timestamp: start(),
    });
    harness.seed_thread(chatty).await;

    let result = harness
        .engine
        .orchestrator()
        .route_message(
            &message(
                "m1",
                MessageChannel::Sms,
                "+15551234567",
                "Is the dishwasher drain pump replacement still scheduled tomorrow?",
            ),
            ORG,
        )
        .await
        .expect("route")
        .expect("match");
    assert_eq!(result.thread_id, "t-identity");
    assert_eq!(result.method, RoutingMethod::Identity);
}

#[tokio::test]
async fn functional_identity_confidence_never_rises_with_thread_age() {
    let mut previous = f64::INFINITY;
    for (index, age) in [
        Duration::hours(1),
        Duration::days(7),
        Duration::days(8),
        Duration::days(30),
        Duration::days(31),
        Duration::days(400),
    ]
    .into_iter()
    .enumerate()
    {
        let harness = Harness::new(RoutingEngineConfig::default());
        let phone = format!("+1555000{index:04}");
        harness.link("u1", ExternalIdentityType::Phone, &phone).await;
        harness.seed_thread(thread("t1", &["u1"], age)).await;
        let result = harness
            .engine
            .orchestrator()
            .route_message(&message("m1", MessageChannel::Sms, &phone, "ok"), ORG)
            .await
            .expect("route")
            .expect("identity match");
        assert!(
            result.confidence <= previous,
            "confidence rose at age {age:?}: {} > {previous}",
            result.confidence
        );
        previous = result.confidence;
    }
    assert_eq!(previous, 0.5);
}

#[tokio::test]
async fn functional_new_channel_is_recorded_once_on_routed_thread() {
    let harness = Harness::new(RoutingEngineConfig::default());
    harness
        .link("u1", ExternalIdentityType::Phone, "+15551234567")
        .await;
    harness
        .link("u1", ExternalIdentityType::Email, "Tenant@Example.com")
        .await;
    harness
        .seed_thread(thread("t1", &["u1"], Duration::hours(2)))
        .await;

    for id in ["m1", "m2"] {
        harness
            .engine
            .orchestrator()
            .route_message(
                &message(id, MessageChannel::Email, "tenant@example.com", "ok"),
                ORG,
            )
            .await
            .expect("route")
            .expect("identity match");
    }
    let thread = harness
        .store
        .get_thread("t1")
        .await
        .expect("get")
        .expect("thread");
    assert_eq!(
        thread.channel_sources,
        vec![MessageChannel::Sms, MessageChannel::Email]
    );
    assert_eq!(thread.updated_at, start());
}

#[tokio::test]
async fn functional_linking_same_identity_twice_keeps_one_entry() {
    let harness = Harness::new(RoutingEngineConfig::default());
    harness
        .link("u1", ExternalIdentityType::Email, "Tenant@Example.com")
        .await;
    harness
        .link("u1", ExternalIdentityType::Email, " tenant@example.com ")
        .await;
    let identities = harness
        .engine
        .resolver()
        .linked_identities("u1", ORG)
        .await
        .expect("identities");
    assert_eq!(identities.len(), 1);
    assert_eq!(identities[0].value, "tenant@example.com");
}

#[tokio::test]
async fn integration_retry_cap_dead_letters_then_manual_assignment_routes() {
    let harness = Harness::new(RoutingEngineConfig {
        create_thread_on_miss: false,
        ..RoutingEngineConfig::default()
    });
    let inbound = message("m1", MessageChannel::Sms, "+15557654321", "hello?");
    let outcome = harness
        .engine
        .orchestrator()
        .process_inbound_message(&inbound, ORG)
        .await
        .expect("process");
    let InboundOutcome::Pending { record_id, .. } = outcome else {
        panic!("expected pending outcome, got {outcome:?}");
    };
    assert_eq!(record_id, "m1");

    let sweeper = harness.engine.sweeper();
    let mut observed_counts = Vec::new();
    for offset_seconds in [60, 120, 240] {
        harness
            .clock
            .set(start() + Duration::seconds(offset_seconds));
        let report = sweeper.sweep_once().await.expect("sweep");
        assert_eq!(report.errors, 0);
        if let Some(record) = harness.store.get_pending("m1").await.expect("get") {
            observed_counts.push(record.retry_count);
        } else {
            assert_eq!(report.dead_lettered, 1);
        }
    }
    assert_eq!(observed_counts, vec![1, 2]);
    let dead = harness
        .store
        .list_dead_letters(Some(ORG))
        .await
        .expect("dead letters");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].retry_count, 3);
    assert!(dead[0].permanently_failed);

    let parked = harness
        .engine
        .manual_assignment()
        .list_unassigned_messages(ORG)
        .await
        .expect("unassigned");
    assert_eq!(parked.len(), 1);

    harness
        .seed_thread(thread("t-desk", &["u5"], Duration::hours(1)))
        .await;
    let assigned = harness
        .engine
        .manual_assignment()
        .assign_unassigned_message(&parked[0].id, "t-desk", Some("dispatcher-1"))
        .await
        .expect("assign");
    assert_eq!(assigned.status, UnassignedStatus::Assigned);
    assert!(harness
        .engine
        .manual_assignment()
        .list_unassigned_messages(ORG)
        .await
        .expect("unassigned")
        .is_empty());

    let page = harness
        .engine
        .decisions()
        .by_thread("t-desk", None, None)
        .await
        .expect("decisions");
    assert_eq!(page.decisions.len(), 1);
    assert_eq!(page.decisions[0].method, DecisionMethod::Manual);
    assert_eq!(page.decisions[0].confidence, 1.0);
}

#[tokio::test]
async fn regression_snapshot_store_survives_reopen() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("routing-store.json");
    {
        let store = Arc::new(InMemoryRoutingStore::open_snapshot(&path).expect("open"));
        let engine = RoutingEngine::new(
            store,
            Arc::new(ManualClock::new(start())),
            RoutingEngineConfig::default(),
        );
        engine
            .orchestrator()
            .create_thread_for_message(
                &message("m1", MessageChannel::Sms, "+15559999999", "hello"),
                ORG,
            )
            .await
            .expect("create");
    }

    let reopened = Arc::new(InMemoryRoutingStore::open_snapshot(&path).expect("reopen"));
    let engine = RoutingEngine::new(
        reopened,
        Arc::new(ManualClock::new(start() + Duration::hours(1))),
        RoutingEngineConfig::default(),
    );
    let result = engine
        .orchestrator()
        .route_message(
            &message("m2", MessageChannel::Sms, "+15559999999", "still there?"),
            ORG,
        )
        .await
        .expect("route")
        .expect("identity match after reopen");
    assert_eq!(result.method, RoutingMethod::Identity);
}
