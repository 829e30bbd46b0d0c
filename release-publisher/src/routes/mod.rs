pub mod releases;

use crate::state::AppState;
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

/// JSON API under `/api`, release artifacts served from the root.
pub fn create_router(state: Arc<AppState>) -> Router {
    let release_dir = state.config.release_dir.clone();

    Router::new()
        .route("/health", get(health))
        .nest("/api/releases", releases::router())
        .fallback_service(ServeDir::new(release_dir))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PublisherConfig;
    use crate::services::publish::{publish_release, set_current_version};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn app(release_dir: &std::path::Path) -> Router {
        let config = PublisherConfig {
            port: 0,
            release_dir: release_dir.to_path_buf(),
            keys_dir: release_dir.join("keys"),
            files_list_prefix: "files_list_v".into(),
            launcher_version: None,
            log_level: "info".into(),
        };
        create_router(Arc::new(AppState::new(config)))
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn test_serves_catalog_and_artifacts() {
        let work = TempDir::new().unwrap();
        let source = work.path().join("tree");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("game.exe"), b"binary").unwrap();
        let out = work.path().join("out");
        publish_release(&source, "1.2.0", &out, "files_list_v", None).unwrap();
        set_current_version(&out, "1.2.0", None).unwrap();

        let (status, body) = get(app(&out), "/api/releases").await;
        assert_eq!(status, StatusCode::OK);
        let catalog: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(catalog["current"], "1.2.0");
        assert_eq!(catalog["releases"][0]["files"], 1);

        let (status, body) = get(app(&out), "/version.txt").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"Version=1.2.0\n");

        let (status, _) = get(app(&out), "/api/releases/9.9.9").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = get(app(&out), "/api/releases/latest").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
