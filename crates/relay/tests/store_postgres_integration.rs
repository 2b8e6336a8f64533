use chrono::Utc;
use uuid::Uuid;
use webinar_common::types::{InteractionDraft, InteractionKind, WebinarStatus};
use webinar_relay::{
    db::pool::{open_live_store_pool, StorePoolConfig},
    engine::{webinars::WebinarUpsert, EngineConfig, EngineError, LiveEngine},
    store::{LiveStore, SubscriptionEvent},
};

async fn postgres_store() -> Option<LiveStore> {
    let Some(database_url) = std::env::var("WEBINAR_RELAY_TEST_DATABASE_URL").ok() else {
        eprintln!("skipping postgres store integration test: set WEBINAR_RELAY_TEST_DATABASE_URL");
        return None;
    };

    let config =
        StorePoolConfig { min_connections: 1, max_connections: 4, ..StorePoolConfig::default() };
    let pool = open_live_store_pool(&database_url, &config)
        .await
        .expect("pool should connect and migrate the test database");
    Some(LiveStore::postgres(pool))
}

#[tokio::test]
async fn postgres_store_keeps_one_response_per_participant() {
    let Some(store) = postgres_store().await else {
        return;
    };
    let engine = LiveEngine::init(store, EngineConfig::default()).expect("engine should start");

    let webinar_id = Uuid::new_v4();
    engine
        .upsert_webinar(
            webinar_id,
            WebinarUpsert {
                slug: format!("pg-{webinar_id}"),
                title: "Postgres".into(),
                starts_at: Utc::now(),
                ends_at: None,
                stream_url: "https://stream.example/embed/pg".into(),
                allow_late_responses: false,
            },
        )
        .await
        .expect("webinar upsert should succeed");
    engine.set_webinar_status(webinar_id, WebinarStatus::Live).await.expect("go live");

    let first = engine
        .register_participant(webinar_id, "09123456789", None)
        .await
        .expect("register")
        .participant;
    let again = engine
        .register_participant(webinar_id, "+989123456789", None)
        .await
        .expect("re-register")
        .participant;
    assert_eq!(first.id, again.id);

    let activation = engine
        .publish_interaction(
            webinar_id,
            InteractionDraft {
                kind: InteractionKind::Poll,
                prompt: "Pick".into(),
                options: vec!["A".into(), "B".into()],
                scale: None,
            },
        )
        .await
        .expect("publish");
    let interaction_id = activation.activated.id;

    engine.submit_response(webinar_id, interaction_id, first.id, "A").await.expect("first");
    engine.submit_response(webinar_id, interaction_id, first.id, "B").await.expect("second");
    let tally = engine.tally(webinar_id, interaction_id).await.expect("tally");
    assert_eq!(tally.count_for("A"), 0);
    assert_eq!(tally.count_for("B"), 1);

    engine.close_active_interaction(webinar_id).await.expect("close");
    let rejected = engine.submit_response(webinar_id, interaction_id, first.id, "A").await;
    assert!(matches!(rejected, Err(EngineError::InteractionClosed(_))));

    engine.dispose().await;
}

#[tokio::test]
async fn postgres_subscription_starts_with_a_snapshot() {
    let Some(store) = postgres_store().await else {
        return;
    };
    let engine = LiveEngine::init(store, EngineConfig::default()).expect("engine should start");
    let webinar_id = Uuid::new_v4();
    engine
        .upsert_webinar(
            webinar_id,
            WebinarUpsert {
                slug: format!("pg-sub-{webinar_id}"),
                title: "Postgres subscription".into(),
                starts_at: Utc::now(),
                ends_at: None,
                stream_url: "https://stream.example/embed/pg-sub".into(),
                allow_late_responses: false,
            },
        )
        .await
        .expect("webinar upsert should succeed");

    let mut subscription = engine.subscribe(webinar_id);
    let first = subscription.next().await.expect("subscription should yield").expect("open");
    assert!(matches!(first, SubscriptionEvent::Snapshot(_)));

    engine.dispose().await;
}
