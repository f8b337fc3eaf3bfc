//! HTTP integration tests for the allocation API.
//!
//! Run with: cargo test --test integration_tests

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use futures::future::join_all;
use tempfile::TempDir;
use tower::ServiceExt;

use fiscseq::api::{create_router, AppState};
use fiscseq::audit::MemoryAuditSink;
use fiscseq::metrics::MetricsRegistry;
use fiscseq::sequencer::Sequencer;
use fiscseq::storage::{
    InMemoryHistory, InMemoryRecordStore, LocalAllocator, LocalConfig, LocalStore, RemoteAllocator,
    RetryConfig, RocksDbHistory,
};

type RemoteState = Arc<AppState<RemoteAllocator<InMemoryRecordStore>>>;

fn remote_state(history: Arc<InMemoryHistory>) -> RemoteState {
    let allocator = RemoteAllocator::new(
        InMemoryRecordStore::new(),
        history,
        Arc::new(MemoryAuditSink::new()),
        RetryConfig {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 2,
            jitter: false,
        },
    );
    let sequencer = Sequencer::new(allocator).with_metrics(Arc::new(MetricsRegistry::new()));
    Arc::new(AppState::new(sequencer))
}

fn local_state() -> (Arc<AppState<LocalAllocator>>, RocksDbHistory, TempDir) {
    let dir = TempDir::new().unwrap();
    let store = LocalStore::open(dir.path()).unwrap();
    let history = RocksDbHistory::new(store.clone());
    let allocator = LocalAllocator::new(
        store,
        Arc::new(history.clone()),
        Arc::new(MemoryAuditSink::new()),
        LocalConfig::default(),
    );
    (Arc::new(AppState::new(Sequencer::new(allocator))), history, dir)
}

fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

// =============================================================================
// Reservations
// =============================================================================

#[tokio::test]
async fn reserve_by_category() {
    let app = create_router(remote_state(InMemoryHistory::shared()));

    let response = app
        .oneshot(json_request(
            "POST",
            "/entities/1/reservations",
            serde_json::json!({ "category": "Consumo" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert_eq!(body["fiscal_number"], "B0200000001");
    assert_eq!(body["prefix"], "B02");
    assert_eq!(body["sequence"], 1);
    assert_eq!(body["entity_id"], 1);
}

#[tokio::test]
async fn reserve_with_explicit_prefix() {
    let app = create_router(remote_state(InMemoryHistory::shared()));

    let response = app
        .oneshot(json_request(
            "POST",
            "/entities/1/reservations",
            serde_json::json!({ "category": "Consumo", "prefix": "e31" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(body_json(response).await["fiscal_number"], "E3100000000001");
}

#[tokio::test]
async fn reserve_unknown_category_uses_default_prefix() {
    let app = create_router(remote_state(InMemoryHistory::shared()));

    let response = app
        .oneshot(json_request(
            "POST",
            "/entities/1/reservations",
            serde_json::json!({ "category": "Something Else Entirely" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(body_json(response).await["prefix"], "B01");
}

#[tokio::test]
async fn reserve_seeds_from_history() {
    let history = InMemoryHistory::shared();
    history.record_issued(5, "B0100000163").unwrap();
    let app = create_router(remote_state(history));

    let response = app
        .oneshot(json_request(
            "POST",
            "/entities/5/reservations",
            serde_json::json!({ "category": "Crédito Fiscal" }),
        ))
        .await
        .unwrap();

    assert_eq!(body_json(response).await["fiscal_number"], "B0100000164");
}

#[tokio::test]
async fn joined_http_reservations_are_unique() {
    let app = create_router(remote_state(InMemoryHistory::shared()));

    let responses = join_all((0..10).map(|_| {
        app.clone().oneshot(json_request(
            "POST",
            "/entities/2/reservations",
            serde_json::json!({ "category": "B02" }),
        ))
    }))
    .await;

    let mut seqs = Vec::new();
    for response in responses {
        let response = response.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        seqs.push(body_json(response).await["sequence"].as_u64().unwrap());
    }
    seqs.sort_unstable();
    assert_eq!(seqs, (1..=10).collect::<Vec<u64>>());
}

// =============================================================================
// Sequence administration
// =============================================================================

#[tokio::test]
async fn preview_does_not_advance() {
    let app = create_router(remote_state(InMemoryHistory::shared()));

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(get("/entities/1/sequences/B01/preview"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["fiscal_number"], "B0100000001");
    }

    let response = app
        .oneshot(json_request(
            "POST",
            "/entities/1/reservations",
            serde_json::json!({ "category": "B01" }),
        ))
        .await
        .unwrap();
    assert_eq!(body_json(response).await["sequence"], 1);
}

#[tokio::test]
async fn override_then_reserve() {
    let app = create_router(remote_state(InMemoryHistory::shared()));

    let response = app
        .clone()
        .oneshot(json_request(
            "PUT",
            "/entities/3/sequences/B02",
            serde_json::json!({ "last_sequence": 500, "reason": "migration" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let info = body_json(response).await;
    assert_eq!(info["next_sequence"], 501);
    assert_eq!(info["last_assigned"], "B0200000500");

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/entities/3/reservations",
            serde_json::json!({ "category": "Consumo" }),
        ))
        .await
        .unwrap();
    assert_eq!(body_json(response).await["fiscal_number"], "B0200000501");

    let response = app.oneshot(get("/entities/3/sequences/B02")).await.unwrap();
    let info = body_json(response).await;
    assert_eq!(info["total_issued"], 1);
    assert_eq!(info["next_preview"], "B0200000502");
}

#[tokio::test]
async fn override_rejects_malformed_prefix() {
    let app = create_router(remote_state(InMemoryHistory::shared()));

    let response = app
        .oneshot(json_request(
            "PUT",
            "/entities/3/sequences/XX",
            serde_json::json!({ "last_sequence": 5 }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "MALFORMED_NUMBER");
}

#[tokio::test]
async fn exhausted_sequence_is_unprocessable() {
    let app = create_router(remote_state(InMemoryHistory::shared()));

    let response = app
        .clone()
        .oneshot(json_request(
            "PUT",
            "/entities/1/sequences/B01",
            serde_json::json!({ "last_sequence": 99_999_999 }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(json_request(
            "POST",
            "/entities/1/reservations",
            serde_json::json!({ "category": "B01" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert!(response.headers().get(header::RETRY_AFTER).is_none());
    assert_eq!(body_json(response).await["code"], "SEQUENCE_EXHAUSTED");
}

#[tokio::test]
async fn reconcile_raises_stale_counter() {
    let history = InMemoryHistory::shared();
    let app = create_router(remote_state(Arc::clone(&history)));

    app.clone()
        .oneshot(json_request(
            "POST",
            "/entities/1/reservations",
            serde_json::json!({ "category": "B01" }),
        ))
        .await
        .unwrap();
    history.record_issued(1, "B0100000010").unwrap();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/entities/1/sequences/B01/reconcile")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let report = body_json(response).await;
    assert_eq!(report["drifted"], true);
    assert_eq!(report["stored_next"], 2);
    assert_eq!(report["history_max"], 10);
    assert_eq!(report["safe_next"], 11);

    let response = app
        .oneshot(json_request(
            "POST",
            "/entities/1/reservations",
            serde_json::json!({ "category": "B01" }),
        ))
        .await
        .unwrap();
    assert_eq!(body_json(response).await["sequence"], 11);
}

// =============================================================================
// Error mapping
// =============================================================================

#[tokio::test]
async fn exhausted_conflicts_are_retryable() {
    let state = remote_state(InMemoryHistory::shared());
    state.sequencer.allocator().store().inject_conflicts(10);
    let app = create_router(Arc::clone(&state));

    let response = app
        .oneshot(json_request(
            "POST",
            "/entities/1/reservations",
            serde_json::json!({ "category": "B01" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "1");
    assert_eq!(body_json(response).await["code"], "CONFLICT_EXHAUSTED");
    assert_eq!(state.sequencer.metrics().errors("conflict_exhausted"), 1);
}

#[tokio::test]
async fn collision_is_conflict() {
    let (state, history, _dir) = local_state();
    let app = create_router(state);

    app.clone()
        .oneshot(json_request(
            "POST",
            "/entities/1/reservations",
            serde_json::json!({ "category": "B01" }),
        ))
        .await
        .unwrap();
    history.record_issued(1, "B0100000002").unwrap();

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/entities/1/reservations",
            serde_json::json!({ "category": "B01" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert!(response.headers().get(header::RETRY_AFTER).is_some());
    assert_eq!(body_json(response).await["code"], "COLLISION_DETECTED");

    // The counter was repaired past the collision.
    let response = app
        .oneshot(json_request(
            "POST",
            "/entities/1/reservations",
            serde_json::json!({ "category": "B01" }),
        ))
        .await
        .unwrap();
    assert_eq!(body_json(response).await["fiscal_number"], "B0100000003");
}

// =============================================================================
// Validation, health, metrics
// =============================================================================

#[tokio::test]
async fn validate_fiscal_numbers() {
    let app = create_router(remote_state(InMemoryHistory::shared()));

    let response = app
        .clone()
        .oneshot(get("/fiscal-numbers/E3100000000042"))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["valid"], true);
    assert_eq!(body["prefix"], "E31");
    assert_eq!(body["sequence"], 42);
    assert_eq!(body["electronic"], true);

    let response = app.oneshot(get("/fiscal-numbers/B011234")).await.unwrap();
    let body = body_json(response).await;
    assert_eq!(body["valid"], false);
    assert!(body.get("prefix").is_none());
}

#[tokio::test]
async fn health_check() {
    let app = create_router(remote_state(InMemoryHistory::shared()));

    let response = app.oneshot(get("/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "healthy");
}

#[tokio::test]
async fn metrics_count_reservations() {
    let app = create_router(remote_state(InMemoryHistory::shared()));

    app.clone()
        .oneshot(json_request(
            "POST",
            "/entities/1/reservations",
            serde_json::json!({ "category": "B01" }),
        ))
        .await
        .unwrap();

    let response = app.oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("fiscseq_reservations_total 1"));
    assert!(text.contains("fiscseq_uptime_seconds"));
}
