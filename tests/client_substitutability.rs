//! The same application code against the fake and the reqwest adapter

mod common;

use std::sync::Arc;

use common::{config, find_release, init_tracing, latest_release, Release};
use httpseam::{
    Authenticating, BytesSerializer, CallKind, Cancelable, Client, ClientExt, Completable,
    Credentials, FakeClient, FakeResponse, HttpError, Method, Progress, ProgressReporting, Reply,
    RequestState, Resumable, SessionClient, StatusCode,
};
use parking_lot::Mutex;
use serde_json::json;
use tempfile::TempDir;
use wiremock::{
    matchers::{body_json, header, method, path},
    Mock, MockServer, ResponseTemplate,
};

const FAKE_BASE: &str = "http://releases.test";

fn release() -> Release {
    Release {
        name: "v2.1.0".to_string(),
        downloads: 1234,
    }
}

#[tokio::test]
async fn test_same_code_decodes_through_both_clients() {
    init_tracing();
    let dir = TempDir::new().unwrap();

    let fake = FakeClient::new(config(&dir));
    fake.stub(
        Method::GET,
        &format!("{FAKE_BASE}/releases/latest"),
        FakeResponse::json(200, &json!({"name": "v2.1.0", "downloads": 1234})),
    );

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/releases/latest"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"name": "v2.1.0", "downloads": 1234})),
        )
        .mount(&server)
        .await;
    let session = SessionClient::new(config(&dir)).unwrap();

    let from_fake = latest_release(&fake, FAKE_BASE).await.unwrap();
    let from_session = latest_release(&session, &server.uri()).await.unwrap();

    assert_eq!(from_fake, release());
    assert_eq!(from_fake, from_session);
    assert_eq!(fake.calls().len(), 1);
    assert_eq!(fake.calls()[0].kind, CallKind::Data);
}

#[tokio::test]
async fn test_trait_objects_are_interchangeable() {
    init_tracing();
    let dir = TempDir::new().unwrap();

    let fake = FakeClient::new(config(&dir));
    fake.stub(
        Method::GET,
        &format!("{FAKE_BASE}/releases/latest"),
        FakeResponse::new(404),
    );

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let clients: Vec<(Arc<dyn Client>, String)> = vec![
        (Arc::new(fake), FAKE_BASE.to_string()),
        (Arc::new(SessionClient::new(config(&dir)).unwrap()), server.uri()),
    ];

    for (client, base) in clients {
        assert_eq!(find_release(client.as_ref(), &base).await.unwrap(), None);
    }
}

#[tokio::test]
async fn test_validation_failure_matches_across_clients() {
    let dir = TempDir::new().unwrap();

    let fake = FakeClient::new(config(&dir));
    fake.stub(
        Method::GET,
        &format!("{FAKE_BASE}/releases/latest"),
        FakeResponse::text(503, "maintenance"),
    );

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;
    let session = SessionClient::new(config(&dir)).unwrap();

    for result in [
        latest_release(&fake, FAKE_BASE).await,
        latest_release(&session, &server.uri()).await,
    ] {
        match result {
            Err(HttpError::HttpStatus { status, message }) => {
                assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
                assert_eq!(message, "maintenance");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_deferred_start_and_credentials_on_both_clients() {
    let dir = TempDir::new().unwrap();
    let deferred = config(&dir).with_start_requests_immediately(false);

    let fake = FakeClient::new(deferred.clone());
    fake.stub(Method::POST, &format!("{FAKE_BASE}/releases"), FakeResponse::new(201));

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/releases"))
        .and(header("authorization", "Bearer release-token"))
        .and(body_json(json!({"name": "v2.2.0"})))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;
    let session = SessionClient::new(deferred).unwrap();

    let clients: [(&dyn Client, String); 2] = [(&fake, FAKE_BASE.to_string()), (&session, server.uri())];
    for (client, base) in clients {
        let request = client
            .post_json(&format!("{base}/releases"), &json!({"name": "v2.2.0"}))
            .unwrap();
        assert_eq!(request.state(), RequestState::Created);

        request.authenticate(Credentials::Bearer("release-token".to_string()));
        request.resume();
        let response = request.response(BytesSerializer).await;

        assert_eq!(response.status(), Some(StatusCode::CREATED));
        assert_eq!(request.state(), RequestState::Completed);
    }

    let calls = fake.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(
        calls[0].headers.get("authorization").unwrap(),
        "Bearer release-token"
    );
    assert_eq!(
        calls[0].sent_body.as_deref(),
        Some(br#"{"name":"v2.2.0"}"#.as_slice())
    );
}

#[tokio::test]
async fn test_download_progress_reaches_total_on_both_clients() {
    let dir = TempDir::new().unwrap();
    let deferred = config(&dir).with_start_requests_immediately(false);
    let payload = vec![7u8; 10_000];

    let fake = FakeClient::new(deferred.clone());
    fake.stub(
        Method::GET,
        &format!("{FAKE_BASE}/asset.bin"),
        FakeResponse::new(200)
            .with_body(payload.clone())
            .with_chunk_size(1000),
    );

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/asset.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(payload.clone()))
        .mount(&server)
        .await;
    let session = SessionClient::new(deferred).unwrap();

    let clients: [(&dyn Client, String, &str); 2] = [
        (&fake, FAKE_BASE.to_string(), "fake.bin"),
        (&session, server.uri(), "session.bin"),
    ];
    for (client, base, file_name) in clients {
        let target = dir.path().join(file_name);
        let seen = Arc::new(Mutex::new(Vec::<Progress>::new()));
        let request = client
            .download_to(format!("{base}/asset.bin"), &target)
            .unwrap();
        let sink = Arc::clone(&seen);
        request.on_progress(None, move |progress| sink.lock().push(progress));
        request.resume();

        let response = request.response(BytesSerializer).await;
        assert!(response.result.is_ok(), "{file_name}: {:?}", response.error());
        assert_eq!(std::fs::read(&target).unwrap(), payload);

        let seen = seen.lock();
        assert!(!seen.is_empty());
        assert!(seen.windows(2).all(|w| w[0].completed <= w[1].completed));
        assert_eq!(seen.last().unwrap().completed, payload.len() as u64);
    }
}

#[tokio::test]
async fn test_transport_failure_surfaces_the_same_way() {
    let dir = TempDir::new().unwrap();

    let fake = FakeClient::new(config(&dir));
    fake.stub(
        Method::GET,
        "http://127.0.0.1:9/releases/latest",
        Reply::Fail(HttpError::transport(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused",
        ))),
    );
    let session = SessionClient::new(config(&dir)).unwrap();

    for client in [&fake as &dyn Client, &session] {
        let result = latest_release(client, "http://127.0.0.1:9").await;
        assert!(matches!(result, Err(HttpError::Transport(_))), "{result:?}");
    }
}

#[tokio::test]
async fn test_immediate_cancel_delivers_one_cancellation_on_both_clients() {
    let dir = TempDir::new().unwrap();
    let deferred = config(&dir).with_start_requests_immediately(false);

    let fake = FakeClient::new(deferred.clone());
    fake.stub(
        Method::GET,
        &format!("{FAKE_BASE}/asset.bin"),
        FakeResponse::new(200).with_body(vec![1u8; 4096]),
    );
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 4096]))
        .mount(&server)
        .await;
    let session = SessionClient::new(deferred).unwrap();

    let clients: [(&dyn Client, String); 2] = [(&fake, FAKE_BASE.to_string()), (&session, server.uri())];
    for (client, base) in clients {
        let request = client.get(format!("{base}/asset.bin")).unwrap();
        request.cancel();

        let completions = Arc::new(Mutex::new(Vec::new()));
        let late_progress = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&completions);
        request.on_complete(BytesSerializer, None, move |response| {
            sink.lock().push(response.error().is_some_and(HttpError::is_cancelled));
        });
        let counter = Arc::clone(&late_progress);
        request.on_progress(None, move |_| *counter.lock() += 1);

        // already terminal, so the observer ran inside the call
        assert_eq!(*completions.lock(), [true]);

        request.resume();
        request.cancel();
        let response = request.response(BytesSerializer).await;
        assert!(matches!(response.result, Err(HttpError::Cancelled)));
        assert_eq!(completions.lock().len(), 1);
        assert_eq!(*late_progress.lock(), 0);
        assert_eq!(request.state(), RequestState::Cancelled);
    }
}
