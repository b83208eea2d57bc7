//! Webhook ingestion server for the entitlement gate.
//!
//! Two routes: `POST /webhooks/payment-gateway` feeds deliveries to the
//! reconciler, `GET /health` answers liveness probes. The gateway treats
//! any 2xx as delivered and retries everything else, so the webhook route
//! answers 200 for every delivery it could classify and reserves 400 for
//! bodies the reconciler cannot parse at all.

mod observability;

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use chrono::Utc;
use entitlement_gate::{GateError, MemoryStore, Reconciler};
use serde_json::json;

use crate::observability::{LogFormat, init_observability};

#[derive(Clone)]
struct AppState {
    reconciler: Arc<Reconciler<MemoryStore>>,
}

async fn receive_webhook(State(state): State<AppState>, body: String) -> impl IntoResponse {
    match state.reconciler.handle_json(&body, Utc::now()).await {
        Ok(ack) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "outcome": ack.outcome.to_string(),
                "requestId": ack.request_id,
            })),
        ),
        Err(GateError::MalformedEvent(reason)) => {
            tracing::warn!(reason = %reason, "rejecting malformed webhook body");
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "success": false, "error": reason })),
            )
        }
        Err(error) => {
            tracing::error!(error = %error, "webhook handling failed unexpectedly");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "error": "internal error" })),
            )
        }
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/webhooks/payment-gateway", post(receive_webhook))
        .route("/health", get(health))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_observability(LogFormat::from_env());

    let state = AppState { reconciler: Arc::new(Reconciler::new(MemoryStore::new())) };
    let app = router(state);

    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_owned());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "entitlement server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;

    fn test_app() -> Router {
        router(AppState { reconciler: Arc::new(Reconciler::new(MemoryStore::new())) })
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let response = test_app()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "healthy");
    }

    #[tokio::test]
    async fn test_webhook_acknowledges_unmatched_event() {
        let body = r#"{
            "event": "PAYMENT_RECEIVED",
            "payment": { "id": "pay_1", "subscription": "gwsub_unknown" }
        }"#;
        let response = test_app()
            .oneshot(
                Request::post("/webhooks/payment-gateway")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["outcome"], "unresolved");
    }

    #[tokio::test]
    async fn test_webhook_rejects_unparseable_body() {
        let response = test_app()
            .oneshot(
                Request::post("/webhooks/payment-gateway")
                    .body(Body::from("not json"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["success"], false);
    }

    #[tokio::test]
    async fn test_webhook_rejects_missing_event_type() {
        let response = test_app()
            .oneshot(
                Request::post("/webhooks/payment-gateway")
                    .body(Body::from(r#"{ "payment": { "id": "pay_1" } }"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
