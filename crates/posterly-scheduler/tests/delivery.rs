use chrono::{TimeZone, Utc};
use posterly_core::config::{ChannelEndpoint, PosterlyConfig};
use posterly_core::time::{CanonicalTz, FixedClock};
use posterly_core::types::{Category, Customer, DeliveryStatus, Poster};
use posterly_providers::create_chain;
use posterly_scheduler::{
    DeliveryEngine, DeliveryStore, DueSpec, Reconciler, ScheduleRequest, Scheduler, SqliteStore,
    TickReport,
};
use std::sync::Arc;
use wiremock::matchers::{body_string_contains, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Harness {
    store: Arc<SqliteStore>,
    scheduler: Scheduler,
    engine: DeliveryEngine,
    config: PosterlyConfig,
}

fn harness(server: &MockServer, db: &std::path::Path) -> Harness {
    let mut config = PosterlyConfig::default();
    config.delivery.media_base_url = "https://cdn.example.com/uploads/".into();
    for (slot, route) in [
        (&mut config.gateway.primary, "/primary"),
        (&mut config.gateway.secondary, "/secondary"),
        (&mut config.gateway.fallback, "/fallback"),
    ] {
        *slot = ChannelEndpoint::new(&format!("{}{}", server.uri(), route));
        slot.token = "tok".into();
        slot.timeout_secs = 5;
    }

    let store = Arc::new(SqliteStore::open(db).unwrap());
    store
        .upsert_customer(&Customer {
            id: "cust-1".into(),
            contact_number: "98765 43210".into(),
            display_name: "Asha Traders".into(),
            company_name: "Asha Traders Pvt Ltd".into(),
        })
        .unwrap();
    store
        .upsert_poster(&Poster {
            id: "poster-1".into(),
            customer_id: "cust-1".into(),
            media_path: "holi/banner.png".into(),
            caption: Some("Happy Holi from Asha Traders".into()),
        })
        .unwrap();

    // 2025-03-10 09:00:00 IST
    let clock = Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(2025, 3, 10, 3, 30, 0).unwrap(),
    ));
    let scheduler = Scheduler::new(
        store.clone(),
        store.clone(),
        config.canonical_tz().unwrap(),
        clock.clone(),
    );
    let messenger = Arc::new(create_chain(&config).unwrap());
    let engine =
        DeliveryEngine::from_config(&config, store.clone(), store.clone(), messenger, clock)
            .unwrap();

    Harness {
        store,
        scheduler,
        engine,
        config,
    }
}

async fn schedule_nine_am(h: &Harness) -> String {
    let records = h
        .scheduler
        .schedule(&ScheduleRequest {
            target_id: "cust-1".into(),
            payload_refs: vec!["poster-1".into()],
            categories: vec![Category::Festivals],
            times: vec![DueSpec::DateTime("2025-03-10T09:00:00+05:30".into())],
        })
        .await
        .unwrap();
    assert_eq!(records[0].due_date, "2025-03-10");
    assert_eq!(records[0].due_time, "09:00");
    records[0].id.clone()
}

#[tokio::test]
async fn test_nine_am_delivery_on_primary() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/primary"))
        .and(body_string_contains("receiver=919876543210"))
        .and(body_string_contains(
            "mediaurl=https%3A%2F%2Fcdn.example.com%2Fuploads%2Fholi%2Fbanner.png",
        ))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"success": true, "id": "m-42"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let h = harness(&server, &dir.path().join("posterly.db"));
    let id = schedule_nine_am(&h).await;

    let report = h.engine.run_tick().await.unwrap();
    assert_eq!(
        report,
        TickReport {
            selected: 1,
            sent: 1,
            failed: 0,
            skipped: 0
        }
    );

    let record = h.store.get(&id).await.unwrap().unwrap();
    assert_eq!(record.status, DeliveryStatus::Sent);
    assert_eq!(record.attempt_count, 1);
    assert_eq!(record.failure_reason, None);

    // Next tick: nothing left to send.
    assert_eq!(h.engine.run_tick().await.unwrap().selected, 0);
}

#[tokio::test]
async fn test_fallback_chain_rescues_delivery() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/primary"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/secondary"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"success": false})),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fallback"))
        .and(query_param("msgtext", "Happy Holi from Asha Traders"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "abc"})))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let h = harness(&server, &dir.path().join("posterly.db"));
    let id = schedule_nine_am(&h).await;

    let report = h.engine.run_tick().await.unwrap();
    assert_eq!(report.sent, 1);

    let record = h.store.get(&id).await.unwrap().unwrap();
    assert_eq!(record.status, DeliveryStatus::Sent);
    assert_eq!(record.attempt_count, 1);
    assert_eq!(record.failure_reason, None);
}

#[tokio::test]
async fn test_exhausted_chain_marks_failed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/primary"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/secondary"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fallback"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "success": "false",
            "error": "number not on WhatsApp"
        })))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let h = harness(&server, &dir.path().join("posterly.db"));
    let id = schedule_nine_am(&h).await;

    let report = h.engine.run_tick().await.unwrap();
    assert_eq!(report.failed, 1);

    let record = h.store.get(&id).await.unwrap().unwrap();
    assert_eq!(record.status, DeliveryStatus::Failed);
    assert_eq!(record.attempt_count, 1);
    let reason = record.failure_reason.clone().unwrap();
    assert!(reason.starts_with("AllChannelsExhausted"), "{reason}");
    assert!(reason.contains("number not on WhatsApp"), "{reason}");

    // Failed is terminal: no automatic retry on later ticks.
    assert_eq!(h.engine.run_tick().await.unwrap().selected, 0);

    let reconciler = Reconciler::new(
        h.store.clone(),
        CanonicalTz::new(&h.config.scheduler.timezone).unwrap(),
        &h.config.delivery.media_base_url,
    );
    let views = reconciler.project(&[record]).await.unwrap();
    assert_eq!(views[0].scheduled_for, "Mon, 10 Mar 2025 09:00 AM IST");
    assert_eq!(views[0].customer_name, "Asha Traders");
    assert_eq!(views[0].failure_reason.as_deref(), Some(reason.as_str()));
}
