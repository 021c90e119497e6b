use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use pdca_client::{
    BackoffPolicy, ClientError, HttpClientConfig, HttpRemoteClient, PollOutcome, RemoteJobClient,
    SubmitError,
};
use pdca_core::{JobHandle, JobKind};
use serde_json::{json, Value as JsonValue};

const TOKEN: &str = "t0k";

#[derive(Clone, Default)]
struct MockState {
    polls: Arc<AtomicUsize>,
    credits_calls: Arc<AtomicUsize>,
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {TOKEN}"))
}

async fn submit_match(
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<JsonValue>,
) -> Response {
    if !authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "no token" }))).into_response();
    }
    if params.get("schema").map(String::as_str) != Some("3") || body.get("matchInputs").is_none() {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "bad request" }))).into_response();
    }
    (StatusCode::CREATED, [(header::LOCATION, "/match/job-1")]).into_response()
}

async fn submit_augment() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "message": "augmentInputs empty", "details": "row 0" })),
    )
        .into_response()
}

async fn poll_job(State(state): State<MockState>) -> Response {
    if state.polls.fetch_add(1, Ordering::SeqCst) == 0 {
        return StatusCode::ACCEPTED.into_response();
    }
    Json(json!({ "masterData": [{ "dunsnumber": "D1", "record_id": 1 }] })).into_response()
}

async fn poll_presigned() -> Response {
    (StatusCode::OK, [(header::LOCATION, "/download/result.json")]).into_response()
}

async fn download(headers: HeaderMap) -> Response {
    if headers.contains_key(header::AUTHORIZATION) {
        return StatusCode::BAD_REQUEST.into_response();
    }
    Json(json!({ "masterData": [{ "dunsnumber": "D9", "record_id": 1 }] })).into_response()
}

async fn poll_expired() -> Response {
    (StatusCode::GONE, Json(json!({ "error": "expired" }))).into_response()
}

async fn credits(State(state): State<MockState>, headers: HeaderMap) -> Response {
    if state.credits_calls.fetch_add(1, Ordering::SeqCst) == 0 {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({ "credits": 100 })).into_response()
}

async fn health() -> Json<JsonValue> {
    Json(json!({ "status": "UP" }))
}

async fn spawn_mock_service(state: MockState) -> String {
    let app = Router::new()
        .route("/pdca/match", post(submit_match))
        .route("/pdca/augment", post(submit_augment))
        .route("/pdca/match/job-1", get(poll_job))
        .route("/pdca/match/job-2", get(poll_presigned))
        .route("/pdca/match/gone", get(poll_expired))
        .route("/pdca/download/result.json", get(download))
        .route("/pdca/credits", get(credits))
        .route("/pdca/management/health", get(health))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("listener addr");

    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    format!("http://{addr}/pdca")
}

fn client_for(base_url: String) -> HttpRemoteClient {
    let mut config = HttpClientConfig::new(base_url);
    config.bearer_token = Some(TOKEN.to_string());
    config.timeout = Duration::from_secs(5);
    config.backoff = BackoffPolicy {
        max_retries: 2,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    };
    HttpRemoteClient::new(config).expect("client")
}

#[tokio::test(flavor = "multi_thread")]
async fn submit_then_poll_until_ready() {
    let base = spawn_mock_service(MockState::default()).await;
    let client = client_for(base.clone());

    let handle = client
        .submit(JobKind::Match, &json!({ "matchInputs": [] }), 3)
        .await
        .expect("submit accepted");
    assert_eq!(handle.as_str(), format!("{base}/match/job-1"));

    assert_eq!(client.poll(&handle).await.unwrap(), PollOutcome::NotReady);
    let PollOutcome::Ready(body) = client.poll(&handle).await.unwrap() else {
        panic!("second poll should be ready");
    };
    assert_eq!(body["masterData"][0]["dunsnumber"], "D1");
}

#[tokio::test(flavor = "multi_thread")]
async fn non_created_submission_is_a_rejection_with_service_message() {
    let client = client_for(spawn_mock_service(MockState::default()).await);

    let err = client
        .submit(JobKind::Augment, &json!({ "augmentInputs": [] }), 1)
        .await
        .expect_err("augment is rejected");
    match err {
        SubmitError::Rejected {
            kind,
            status,
            message,
        } => {
            assert_eq!(kind, JobKind::Augment);
            assert_eq!(status, 400);
            assert_eq!(message, "augmentInputs empty - row 0");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn ready_with_location_downloads_without_credentials() {
    let base = spawn_mock_service(MockState::default()).await;
    let client = client_for(base.clone());

    let outcome = client
        .poll(&JobHandle(format!("{base}/match/job-2")))
        .await
        .expect("poll");
    let PollOutcome::Ready(body) = outcome else {
        panic!("expected ready");
    };
    assert_eq!(body["masterData"][0]["dunsnumber"], "D9");
}

#[tokio::test(flavor = "multi_thread")]
async fn unexpected_poll_status_is_a_client_error() {
    let base = spawn_mock_service(MockState::default()).await;
    let client = client_for(base.clone());

    let err = client
        .poll(&JobHandle(format!("{base}/match/gone")))
        .await
        .expect_err("gone");
    match err {
        ClientError::HttpStatus {
            status, message, ..
        } => {
            assert_eq!(status, 410);
            assert_eq!(message, "expired");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn service_utilities_retry_server_errors() {
    let state = MockState::default();
    let client = client_for(spawn_mock_service(state.clone()).await);

    let credits = client.credits().await.expect("credits after retry");
    assert_eq!(credits["credits"], 100);
    assert_eq!(state.credits_calls.load(Ordering::SeqCst), 2);

    let health = client.health().await.expect("health");
    assert_eq!(health["status"], "UP");
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_service_surfaces_transport_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let client = client_for(format!("http://{addr}/pdca"));
    let err = client.health().await.expect_err("nothing listening");
    assert!(matches!(err, ClientError::Transport(_)));
}
