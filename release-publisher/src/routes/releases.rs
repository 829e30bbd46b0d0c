use crate::error::AppError;
use crate::services::catalog::{self, Catalog, ReleaseSummary};
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use launcher_updater::version::Version;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_releases))
        .route("/{version}", get(get_release))
}

async fn list_releases(State(state): State<Arc<AppState>>) -> Result<Json<Catalog>, AppError> {
    let release_dir = state.config.release_dir.clone();
    let prefix = state.config.files_list_prefix.clone();
    let catalog = tokio::task::spawn_blocking(move || catalog::load_catalog(&release_dir, &prefix))
        .await
        .map_err(|e| anyhow::anyhow!(e))??;
    Ok(Json(catalog))
}

async fn get_release(
    State(state): State<Arc<AppState>>,
    Path(version): Path<String>,
) -> Result<Json<ReleaseSummary>, AppError> {
    if Version::extract(&version).map(|v| v.to_string()).as_deref() != Some(version.as_str()) {
        return Err(AppError::BadRequest(format!("Invalid version '{}'", version)));
    }
    let release_dir = state.config.release_dir.clone();
    let prefix = state.config.files_list_prefix.clone();
    let summary = tokio::task::spawn_blocking(move || {
        catalog::release_summary(&release_dir, &prefix, &version)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;
    match summary {
        Some(s) => Ok(Json(s)),
        None => Err(AppError::NotFound("Release not found".into())),
    }
}
