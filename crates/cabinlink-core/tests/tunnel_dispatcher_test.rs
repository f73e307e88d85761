//! Tunnel dispatcher integration tests against mock portal and hub
//! servers: terminal-status guarantees, per-request failure isolation,
//! and cycle skipping when the portal is unreachable.

use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use serde_json::json;
use url::Url;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use cabinlink_api::{HubClient, PortalClient, TransportConfig};
use cabinlink_config::StoredCredentials;
use cabinlink_core::{SessionStore, TunnelDispatcher};

const CABIN_ID: &str = "cabin-7";

/// Dispatcher wired to a mock portal and hub, with a session loaded
/// from a persisted credential file (no auth exchange needed).
async fn dispatcher(
    portal_uri: &str,
    hub_uri: &str,
) -> (TunnelDispatcher, tempfile::TempDir) {
    let transport = TransportConfig::default();
    let portal_url: Url = portal_uri.parse().expect("portal url");

    let portal = Arc::new(PortalClient::new(portal_url.clone(), &transport).expect("portal client"));
    let hub = Arc::new(
        HubClient::new(
            hub_uri.parse().expect("hub url"),
            &SecretString::from("hub-token".to_owned()),
            &transport,
        )
        .expect("hub client"),
    );

    let dir = tempfile::tempdir().expect("tempdir");
    let credentials_file = dir.path().join("credentials.json");
    StoredCredentials {
        cabin_id: CABIN_ID.into(),
        ha_username: "agent".into(),
        ha_password: SecretString::from("secret".to_owned()),
        portal_url: portal_url.clone(),
        saved_at: chrono::Utc::now(),
    }
    .save(&credentials_file)
    .expect("save credentials");

    let store = Arc::new(SessionStore::new(
        Arc::clone(&portal),
        portal_url,
        None,
        credentials_file,
    ));
    store.load_or_acquire().await.expect("session");

    (
        TunnelDispatcher::new(portal, hub, store, Duration::from_millis(50)),
        dir,
    )
}

fn pending_response(requests: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(requests)
}

async fn mount_pending(portal: &MockServer, requests: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path("/functions/v1/tunnel-requests"))
        .and(query_param("cabin_id", CABIN_ID))
        .and(query_param("status", "pending"))
        .respond_with(pending_response(requests))
        .mount(portal)
        .await;
}

#[tokio::test]
async fn every_request_reaches_exactly_one_terminal_status() {
    let portal = MockServer::start().await;
    let hub = MockServer::start().await;

    mount_pending(
        &portal,
        json!([
            { "id": "req-1", "action": "ping", "parameters": {} },
            { "id": "req-2", "action": "reboot_universe", "parameters": {} },
        ]),
    )
    .await;

    Mock::given(method("PATCH"))
        .and(path("/functions/v1/tunnel-requests/req-1"))
        .and(body_partial_json(json!({ "status": "completed" })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&portal)
        .await;

    // The unknown action still reaches a terminal status, as an error
    // naming the action.
    Mock::given(method("PATCH"))
        .and(path("/functions/v1/tunnel-requests/req-2"))
        .and(body_partial_json(json!({ "status": "error" })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&portal)
        .await;

    let (dispatcher, _dir) = dispatcher(&portal.uri(), &hub.uri()).await;
    let handled = dispatcher.poll_once().await.expect("poll");
    assert_eq!(handled, 2);
}

#[tokio::test]
async fn one_failing_request_does_not_stop_the_batch() {
    let portal = MockServer::start().await;
    let hub = MockServer::start().await;

    mount_pending(
        &portal,
        json!([
            { "id": "req-1", "action": "get_state", "parameters": { "entity_id": "sensor.gone" } },
            { "id": "req-2", "action": "ping", "parameters": {} },
        ]),
    )
    .await;

    Mock::given(method("GET"))
        .and(path("/api/states/sensor.gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&hub)
        .await;

    Mock::given(method("PATCH"))
        .and(path("/functions/v1/tunnel-requests/req-1"))
        .and(body_partial_json(json!({ "status": "error" })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&portal)
        .await;

    Mock::given(method("PATCH"))
        .and(path("/functions/v1/tunnel-requests/req-2"))
        .and(body_partial_json(json!({ "status": "completed" })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&portal)
        .await;

    let (dispatcher, _dir) = dispatcher(&portal.uri(), &hub.uri()).await;
    assert_eq!(dispatcher.poll_once().await.expect("poll"), 2);
}

#[tokio::test]
async fn unreachable_portal_skips_the_cycle() {
    let hub = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/states"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(0)
        .mount(&hub)
        .await;

    // Reserve a port, then shut the server down so the poll gets a
    // refused connection.
    let portal = MockServer::start().await;
    let portal_uri = portal.uri();
    drop(portal);

    let (dispatcher, _dir) = dispatcher(&portal_uri, &hub.uri()).await;
    let err = dispatcher.poll_once().await.expect_err("should fail");
    assert!(err.is_transient(), "unexpected error: {err}");
}

#[tokio::test]
async fn list_entities_applies_the_domain_filter() {
    let portal = MockServer::start().await;
    let hub = MockServer::start().await;

    mount_pending(
        &portal,
        json!([
            { "id": "req-1", "action": "list_entities", "parameters": { "domain": "light" } },
        ]),
    )
    .await;

    Mock::given(method("GET"))
        .and(path("/api/states"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "entity_id": "light.porch", "state": "on", "attributes": {} },
            { "entity_id": "sensor.meter_power", "state": "1500", "attributes": {} },
        ])))
        .mount(&hub)
        .await;

    Mock::given(method("PATCH"))
        .and(path("/functions/v1/tunnel-requests/req-1"))
        .and(body_partial_json(json!({
            "status": "completed",
            "result": {
                "count": 1,
                "entities": [{ "entity_id": "light.porch", "state": "on" }],
            },
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&portal)
        .await;

    let (dispatcher, _dir) = dispatcher(&portal.uri(), &hub.uri()).await;
    assert_eq!(dispatcher.poll_once().await.expect("poll"), 1);
}

#[tokio::test]
async fn call_service_forwards_parameters_to_the_hub() {
    let portal = MockServer::start().await;
    let hub = MockServer::start().await;

    mount_pending(
        &portal,
        json!([
            {
                "id": "req-1",
                "action": "call_service",
                "parameters": {
                    "domain": "light",
                    "service": "turn_on",
                    "data": { "entity_id": "light.porch" },
                },
            },
        ]),
    )
    .await;

    Mock::given(method("POST"))
        .and(path("/api/services/light/turn_on"))
        .and(body_partial_json(json!({ "entity_id": "light.porch" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "entity_id": "light.porch", "state": "on", "attributes": {} },
        ])))
        .expect(1)
        .mount(&hub)
        .await;

    Mock::given(method("PATCH"))
        .and(path("/functions/v1/tunnel-requests/req-1"))
        .and(body_partial_json(json!({ "status": "completed" })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&portal)
        .await;

    let (dispatcher, _dir) = dispatcher(&portal.uri(), &hub.uri()).await;
    assert_eq!(dispatcher.poll_once().await.expect("poll"), 1);
}
