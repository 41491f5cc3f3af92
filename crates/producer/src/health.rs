//! The HTTP health endpoint polled by the container health check.
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde_json::{json, Value};

#[derive(Clone, Debug)]
pub struct HealthState {
    /// Reported as `service`, e.g. `crm-producer`.
    pub producer: String,
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health))
        .fallback(not_found)
        .with_state(state)
}

async fn health(State(state): State<HealthState>) -> Json<Value> {
    log::debug!("health check requested");
    Json(json!({
        "status": "healthy",
        "service": state.producer,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": "1.0",
    }))
}

async fn not_found() -> (StatusCode, Json<Value>) {
    (StatusCode::NOT_FOUND, Json(json!({"error": "Not found"})))
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn reports_healthy() {
        let Json(body) = health(State(HealthState {
            producer: "web-producer".to_owned(),
        }))
        .await;
        assert_eq!(json!("healthy"), body["status"]);
        assert_eq!(json!("web-producer"), body["service"]);
        assert_eq!(json!("1.0"), body["version"]);
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn unknown_paths_are_json_404s() {
        let (status, Json(body)) = not_found().await;
        assert_eq!(StatusCode::NOT_FOUND, status);
        assert_eq!(json!({"error": "Not found"}), body);
    }
}
