use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use stream_agency_client::{StreamClient, StreamResponse};
use stream_agency_config::RuntimeConfig;
use stream_agency_core::Scheduler;
use stream_agency_daemon::routes::router;
use stream_agency_daemon::state::AppState;

struct NeverCalledStreamClient;

#[async_trait::async_trait]
impl StreamClient for NeverCalledStreamClient {
    async fn post_stream(&self, _address: &str, _signature: &str) -> StreamResponse {
        panic!("stream client should not be called by this test")
    }
}

async fn test_state() -> (AppState, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agency.db");
    let pool = stream_agency_db::connect(path.to_str().unwrap()).await.unwrap();
    stream_agency_db::migrate(&pool).await.unwrap();

    let cfg = RuntimeConfig::default();
    let stream_client: Arc<dyn StreamClient> = Arc::new(NeverCalledStreamClient);
    let scheduler = Arc::new(Scheduler::new(pool.clone(), stream_client.clone(), None, None, cfg.clone()));

    (
        AppState {
            pool,
            cfg,
            stream_client,
            scheduler,
            api_token: Some("secret-token".to_string()),
        },
        dir,
    )
}

#[tokio::test]
async fn health_is_unauthenticated() {
    let (state, _dir) = test_state().await;
    let app = router(state);

    let resp = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn report_rejects_missing_token() {
    let (state, _dir) = test_state().await;
    let app = router(state);

    let resp = app
        .oneshot(Request::builder().uri("/report").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn enroll_then_report_round_trips_with_bearer_token() {
    let (state, _dir) = test_state().await;
    let app = router(state);

    let enroll_body = serde_json::json!({
        "address": "claw1abcdefghij",
        "signature": "0xdead",
        "fee_bps": 500,
    });
    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/enroll")
                .header("content-type", "application/json")
                .header("Authorization", "Bearer secret-token")
                .body(Body::from(enroll_body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app
        .oneshot(
            Request::builder()
                .uri("/report")
                .header("X-API-Key", "secret-token")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["agents"][0]["address"], "claw1abcdefghij");
}
