use axum::{Json, extract::State, response::IntoResponse};

use crate::AppState;

/// Metrics endpoint - returns counters plus live registry sizes
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.metrics.snapshot();
    Json(serde_json::json!({
        "metrics": snapshot,
        "registry": {
            "conversations": state.registry.conversation_count().await,
            "agent_connected": state.registry.is_agent_connected().await,
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        Router,
        body::Body,
        http::{Request, StatusCode},
        routing::get,
    };
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_metrics_snapshot() {
        let state = crate::test_helpers::test_app_state().await;
        state.metrics.connection_opened();
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .with_state(state);

        let resp = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["metrics"]["connections"]["active"], 1);
        assert_eq!(json["registry"]["conversations"], 0);
        assert_eq!(json["registry"]["agent_connected"], false);
    }
}
