use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use console_client::{
    Error, GatewayConfig, Payload, RequestGateway, RequestOptions, ResponseType, TokenPair,
};
use httpmock::prelude::*;
use reqwest::Method;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const DEVICES: &str = "/api/tenant/deviceInfos";

struct Harness {
    gateway: RequestGateway,
    logouts: Arc<AtomicUsize>,
}

fn harness(server: &MockServer) -> Harness {
    let logouts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&logouts);
    let mut config = GatewayConfig::new(server.base_url());
    config.on_logout = Some(Box::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    Harness {
        gateway: RequestGateway::new(config).unwrap(),
        logouts,
    }
}

fn seed(gateway: &RequestGateway, token: &str, refresh_token: &str) {
    let roles = vec!["Administrator".to_string()];
    gateway.session().set_token(
        &TokenPair {
            token: token.into(),
            refresh_token: refresh_token.into(),
        },
        Some(("tenant@example.com", roles.as_slice())),
    );
}

async fn get_devices(gateway: &RequestGateway) -> Result<Value, Error> {
    gateway.get_json(DEVICES, &[("pageSize", "20")]).await
}

// ---------------------------------------------------------------------------
// Token attachment
// ---------------------------------------------------------------------------

#[tokio::test]
async fn attaches_bearer_token() {
    let server = MockServer::start_async().await;
    let devices = server
        .mock_async(|when, then| {
            when.method(GET)
                .path(DEVICES)
                .query_param("pageSize", "20")
                .header("authorization", "Bearer acc-1")
                .header("x-requested-with", "XMLHttpRequest");
            then.status(200).json_body(json!({ "data": [], "hasNext": false }));
        })
        .await;

    let h = harness(&server);
    seed(&h.gateway, "acc-1", "ref-1");

    let body = get_devices(&h.gateway).await.unwrap();
    assert_eq!(body, json!({ "data": [], "hasNext": false }));
    devices.assert_hits_async(1).await;
}

#[tokio::test]
async fn missing_token_sends_request_without_header() {
    let server = MockServer::start_async().await;
    let with_header = server
        .mock_async(|when, then| {
            when.method(GET).path(DEVICES).header_exists("authorization");
            then.status(500);
        })
        .await;
    let plain = server
        .mock_async(|when, then| {
            when.method(GET).path(DEVICES);
            then.status(200).json_body(json!({ "data": [] }));
        })
        .await;

    let h = harness(&server);
    get_devices(&h.gateway).await.unwrap();

    assert_eq!(with_header.hits_async().await, 0);
    plain.assert_hits_async(1).await;
}

// ---------------------------------------------------------------------------
// Single-flight refresh
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_expired_requests_share_one_refresh() {
    let server = MockServer::start_async().await;
    let stale = server
        .mock_async(|when, then| {
            when.method(GET)
                .path(DEVICES)
                .header("authorization", "Bearer old");
            then.status(401);
        })
        .await;
    let fresh = server
        .mock_async(|when, then| {
            when.method(GET)
                .path(DEVICES)
                .header("authorization", "Bearer new");
            then.status(200).json_body(json!({ "data": [1, 2] }));
        })
        .await;
    let refresh = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/auth/token")
                .json_body(json!({ "refreshToken": "ref-1" }));
            then.status(200)
                .json_body(json!({ "token": "new", "refreshToken": "ref-2" }))
                .delay(Duration::from_millis(200));
        })
        .await;

    let h = harness(&server);
    seed(&h.gateway, "old", "ref-1");

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let gateway = h.gateway.clone();
            tokio::spawn(async move { get_devices(&gateway).await })
        })
        .collect();
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), json!({ "data": [1, 2] }));
    }

    refresh.assert_hits_async(1).await;
    assert!(stale.hits_async().await >= 1);
    assert_eq!(fresh.hits_async().await, 8);
    assert_eq!(h.gateway.session().access_token().as_deref(), Some("new"));
    assert_eq!(h.gateway.session().refresh_token().as_deref(), Some("ref-2"));
    assert_eq!(
        h.gateway.session().username().as_deref(),
        Some("tenant@example.com")
    );
    assert!(!h.gateway.refresh_in_flight());
    assert_eq!(h.gateway.pending_requests(), 0);
    assert_eq!(h.logouts.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelled_parked_request_leaves_the_flight_intact() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path(DEVICES)
                .header("authorization", "Bearer old");
            then.status(401);
        })
        .await;
    let fresh = server
        .mock_async(|when, then| {
            when.method(GET)
                .path(DEVICES)
                .header("authorization", "Bearer new");
            then.status(200).json_body(json!({ "data": [] }));
        })
        .await;
    let refresh = server
        .mock_async(|when, then| {
            when.method(POST).path("/api/auth/token");
            then.status(200)
                .json_body(json!({ "token": "new", "refreshToken": "ref-2" }))
                .delay(Duration::from_millis(500));
        })
        .await;

    let h = harness(&server);
    seed(&h.gateway, "old", "ref-1");

    let tokens: Vec<_> = (0..3).map(|_| CancellationToken::new()).collect();
    let tasks: Vec<_> = tokens
        .iter()
        .map(|cancel| {
            let gateway = h.gateway.clone();
            let opts = RequestOptions {
                cancel: Some(cancel.clone()),
                ..Default::default()
            };
            tokio::spawn(async move { gateway.request(Method::GET, DEVICES, opts).await })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(h.gateway.refresh_in_flight());
    assert_eq!(h.gateway.pending_requests(), 3);

    tokens[1].cancel();
    tokio::time::sleep(Duration::from_millis(50)).await;
    // The cancelled caller's slot stays queued until the refresh drains it.
    assert!(h.gateway.refresh_in_flight());
    assert_eq!(h.gateway.pending_requests(), 3);

    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await.unwrap());
    }
    assert!(results[1].as_ref().unwrap_err().is_cancelled());
    for i in [0, 2] {
        let reply = results[i].as_ref().unwrap();
        assert_eq!(reply.data, Payload::Json(json!({ "data": [] })));
    }

    refresh.assert_hits_async(1).await;
    assert_eq!(fresh.hits_async().await, 2);
    assert_eq!(h.gateway.pending_requests(), 0);
    assert!(!h.gateway.refresh_in_flight());
    assert_eq!(h.gateway.session().access_token().as_deref(), Some("new"));
}

#[tokio::test]
async fn failed_refresh_rejects_every_parked_request() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path(DEVICES);
            then.status(401);
        })
        .await;
    let refresh = server
        .mock_async(|when, then| {
            when.method(POST).path("/api/auth/token");
            then.status(500)
                .body("boom")
                .delay(Duration::from_millis(100));
        })
        .await;

    let h = harness(&server);
    seed(&h.gateway, "old", "ref-1");

    let results = futures_util::future::join_all((0..4).map(|_| get_devices(&h.gateway))).await;
    for result in results {
        assert!(matches!(result, Err(Error::RefreshFailed(_))), "{result:?}");
    }

    refresh.assert_hits_async(1).await;
    assert!(!h.gateway.refresh_in_flight());
    assert_eq!(h.gateway.pending_requests(), 0);
    // A server error on refresh is not a fatal auth failure.
    assert_eq!(h.logouts.load(Ordering::SeqCst), 0);
    assert_eq!(h.gateway.session().refresh_token().as_deref(), Some("ref-1"));
}

#[tokio::test]
async fn replayed_request_is_not_refreshed_twice() {
    let server = MockServer::start_async().await;
    let devices = server
        .mock_async(|when, then| {
            when.method(GET).path(DEVICES);
            then.status(401);
        })
        .await;
    let refresh = server
        .mock_async(|when, then| {
            when.method(POST).path("/api/auth/token");
            then.status(200)
                .json_body(json!({ "token": "new", "refreshToken": "ref-2" }));
        })
        .await;

    let h = harness(&server);
    seed(&h.gateway, "old", "ref-1");

    let err = get_devices(&h.gateway).await.unwrap_err();
    assert!(matches!(err, Error::Unauthorized));
    devices.assert_hits_async(2).await;
    refresh.assert_hits_async(1).await;
}

#[tokio::test]
async fn forced_refresh_rotates_tokens() {
    let server = MockServer::start_async().await;
    let refresh = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/auth/token")
                .json_body(json!({ "refreshToken": "ref-1" }));
            then.status(200)
                .json_body(json!({ "token": "acc-2", "refreshToken": "ref-2" }));
        })
        .await;

    let h = harness(&server);
    seed(&h.gateway, "acc-1", "ref-1");

    assert_eq!(h.gateway.refresh().await.unwrap(), "acc-2");
    refresh.assert_hits_async(1).await;
    let session = h.gateway.session();
    assert_eq!(session.access_token().as_deref(), Some("acc-2"));
    assert_eq!(session.refresh_token().as_deref(), Some("ref-2"));
    assert_eq!(session.username().as_deref(), Some("tenant@example.com"));
}

#[tokio::test]
async fn no_refresh_token_surfaces_unauthorized() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path(DEVICES);
            then.status(401);
        })
        .await;
    let refresh = server
        .mock_async(|when, then| {
            when.method(POST).path("/api/auth/token");
            then.status(200);
        })
        .await;

    let h = harness(&server);
    let err = get_devices(&h.gateway).await.unwrap_err();
    assert!(matches!(err, Error::Unauthorized));
    assert_eq!(refresh.hits_async().await, 0);
    assert_eq!(h.gateway.pending_requests(), 0);
}

// ---------------------------------------------------------------------------
// Allow-list and fatal auth
// ---------------------------------------------------------------------------

#[tokio::test]
async fn login_bypasses_token_and_refresh() {
    let server = MockServer::start_async().await;
    let with_header = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/auth/login")
                .header_exists("authorization");
            then.status(500);
        })
        .await;
    let login = server
        .mock_async(|when, then| {
            when.method(POST).path("/api/auth/login");
            then.status(401).json_body(json!({ "message": "bad credentials" }));
        })
        .await;
    let refresh = server
        .mock_async(|when, then| {
            when.method(POST).path("/api/auth/token");
            then.status(200);
        })
        .await;

    let h = harness(&server);
    seed(&h.gateway, "acc-1", "ref-1");

    let err = h.gateway.login("tenant@example.com", "wrong").await.unwrap_err();
    assert!(matches!(err, Error::Unauthorized));
    assert_eq!(with_header.hits_async().await, 0);
    login.assert_hits_async(1).await;
    assert_eq!(refresh.hits_async().await, 0);
    assert_eq!(h.logouts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn login_stores_session() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/auth/login")
                .json_body(json!({ "username": "tenant@example.com", "password": "secret" }));
            then.status(200)
                .json_body(json!({ "token": "acc-1", "refreshToken": "ref-1" }));
        })
        .await;
    let dashboard = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/api/sensing/getDefaultId")
                .header("authorization", "Bearer acc-1");
            then.status(200).json_body(json!("dash-1"));
        })
        .await;

    let h = harness(&server);
    let pair = h.gateway.login("tenant@example.com", "secret").await.unwrap();
    assert_eq!(pair.token, "acc-1");
    dashboard.assert_hits_async(1).await;

    let session = h.gateway.session();
    assert_eq!(session.access_token().as_deref(), Some("acc-1"));
    assert_eq!(session.refresh_token().as_deref(), Some("ref-1"));
    assert_eq!(session.username().as_deref(), Some("tenant@example.com"));
    assert_eq!(session.roles(), vec!["Administrator".to_string()]);
    assert_eq!(session.default_dashboard().as_deref(), Some("dash-1"));
    assert!(!session.is_public());
}

#[tokio::test]
async fn login_survives_missing_default_dashboard() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/api/auth/login");
            then.status(200)
                .json_body(json!({ "token": "acc-1", "refreshToken": "ref-1" }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/sensing/getDefaultId");
            then.status(500);
        })
        .await;

    let h = harness(&server);
    h.gateway.login("tenant@example.com", "secret").await.unwrap();
    assert_eq!(h.gateway.session().access_token().as_deref(), Some("acc-1"));
    assert_eq!(h.gateway.session().default_dashboard(), None);
}

#[tokio::test]
async fn public_login_keeps_identity() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/auth/login/public")
                .json_body(json!({ "publicId": "pub-7" }));
            then.status(200)
                .json_body(json!({ "token": "pub-acc", "refreshToken": "pub-ref" }));
        })
        .await;

    let h = harness(&server);
    seed(&h.gateway, "acc-1", "ref-1");
    h.gateway.login_public("pub-7").await.unwrap();

    let session = h.gateway.session();
    assert_eq!(session.access_token().as_deref(), Some("pub-acc"));
    assert_eq!(session.username().as_deref(), Some("tenant@example.com"));
    assert!(session.is_public());
}

#[tokio::test]
async fn refresh_endpoint_401_logs_out() {
    let server = MockServer::start_async().await;
    let devices = server
        .mock_async(|when, then| {
            when.method(GET).path(DEVICES);
            then.status(401);
        })
        .await;
    let refresh = server
        .mock_async(|when, then| {
            when.method(POST).path("/api/auth/token");
            then.status(401);
        })
        .await;

    let h = harness(&server);
    seed(&h.gateway, "old", "ref-1");

    let err = get_devices(&h.gateway).await.unwrap_err();
    assert!(matches!(err, Error::RefreshFailed(_)), "{err:?}");
    devices.assert_hits_async(1).await;
    refresh.assert_hits_async(1).await;
    assert_eq!(h.logouts.load(Ordering::SeqCst), 1);
    assert_eq!(h.gateway.session().access_token(), None);
    assert_eq!(h.gateway.session().session_info(), None);
}

#[tokio::test]
async fn direct_refresh_request_401_logs_out() {
    let server = MockServer::start_async().await;
    let refresh = server
        .mock_async(|when, then| {
            when.method(POST).path("/api/auth/token");
            then.status(401);
        })
        .await;

    let h = harness(&server);
    seed(&h.gateway, "old", "ref-1");

    let err = h
        .gateway
        .request(
            Method::POST,
            "/api/auth/token",
            RequestOptions::json(json!({ "refreshToken": "ref-1" })),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SessionExpired));
    assert!(err.is_fatal_auth());
    refresh.assert_hits_async(1).await;
    assert_eq!(h.logouts.load(Ordering::SeqCst), 1);
    assert_eq!(h.gateway.session().refresh_token(), None);
}

#[tokio::test]
async fn forbidden_logs_out_without_retry() {
    let server = MockServer::start_async().await;
    let devices = server
        .mock_async(|when, then| {
            when.method(GET).path(DEVICES);
            then.status(403);
        })
        .await;
    let refresh = server
        .mock_async(|when, then| {
            when.method(POST).path("/api/auth/token");
            then.status(200);
        })
        .await;

    let h = harness(&server);
    seed(&h.gateway, "acc-1", "ref-1");

    let err = get_devices(&h.gateway).await.unwrap_err();
    assert!(matches!(err, Error::Forbidden));
    devices.assert_hits_async(1).await;
    assert_eq!(refresh.hits_async().await, 0);
    assert_eq!(h.logouts.load(Ordering::SeqCst), 1);
    assert_eq!(h.gateway.session().access_token(), None);
}

// ---------------------------------------------------------------------------
// Transport errors, cancellation, timeouts
// ---------------------------------------------------------------------------

#[tokio::test]
async fn server_error_is_returned_as_is() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path(DEVICES);
            then.status(502).body("upstream down");
        })
        .await;

    let h = harness(&server);
    seed(&h.gateway, "acc-1", "ref-1");

    match get_devices(&h.gateway).await.unwrap_err() {
        Error::Status { status, body } => {
            assert_eq!(status.as_u16(), 502);
            assert_eq!(body, "upstream down");
        }
        other => panic!("expected Status, got {other:?}"),
    }
    assert_eq!(h.logouts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cancellation_is_tagged() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path(DEVICES);
            then.status(200)
                .json_body(json!({}))
                .delay(Duration::from_secs(2));
        })
        .await;

    let h = harness(&server);
    let cancel = CancellationToken::new();
    let opts = RequestOptions {
        cancel: Some(cancel.clone()),
        ..Default::default()
    };

    let gateway = h.gateway.clone();
    let request = tokio::spawn(async move { gateway.request(Method::GET, DEVICES, opts).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.gateway.loading().active(), 1);

    cancel.cancel();
    let err = request.await.unwrap().unwrap_err();
    assert!(err.is_cancelled());
    assert!(!h.gateway.loading().is_loading());
    assert!(!h.gateway.refresh_in_flight());
}

#[tokio::test]
async fn timeout_rejects_without_refresh() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path(DEVICES);
            then.status(200)
                .json_body(json!({}))
                .delay(Duration::from_secs(1));
        })
        .await;
    let refresh = server
        .mock_async(|when, then| {
            when.method(POST).path("/api/auth/token");
            then.status(200);
        })
        .await;

    let h = harness(&server);
    seed(&h.gateway, "acc-1", "ref-1");
    let opts = RequestOptions {
        timeout: Some(Duration::from_millis(100)),
        ..Default::default()
    };

    match h.gateway.request(Method::GET, DEVICES, opts).await.unwrap_err() {
        Error::Http(e) => assert!(e.is_timeout()),
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(refresh.hits_async().await, 0);
}

// ---------------------------------------------------------------------------
// Response shapes and loading indicator
// ---------------------------------------------------------------------------

#[tokio::test]
async fn raw_headers_and_binary_bodies() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/ota/package/1/download");
            then.status(200)
                .header("content-disposition", "attachment; filename=fw.bin")
                .body(vec![0xde, 0xad, 0xbe, 0xef]);
        })
        .await;

    let h = harness(&server);
    seed(&h.gateway, "acc-1", "ref-1");
    let opts = RequestOptions {
        response_type: ResponseType::Bytes,
        with_headers: true,
        timeout: Some(console_client::gateway::DOWNLOAD_TIMEOUT),
        ..Default::default()
    };

    let reply = h
        .gateway
        .request(Method::GET, "/api/ota/package/1/download", opts)
        .await
        .unwrap();
    assert_eq!(
        reply.data,
        Payload::Bytes(bytes::Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef]))
    );
    let headers = reply.headers.unwrap();
    assert_eq!(
        headers.get("content-disposition").unwrap(),
        "attachment; filename=fw.bin"
    );
}

#[tokio::test]
async fn no_progress_requests_are_not_counted() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path(DEVICES);
            then.status(200)
                .json_body(json!({}))
                .delay(Duration::from_millis(300));
        })
        .await;

    let h = harness(&server);
    let opts = RequestOptions {
        no_progress: true,
        ..Default::default()
    };
    let gateway = h.gateway.clone();
    let request = tokio::spawn(async move { gateway.request(Method::GET, DEVICES, opts).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.gateway.loading().active(), 0);
    request.await.unwrap().unwrap();
}
