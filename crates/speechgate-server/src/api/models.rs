//! Model management API endpoints

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use speechgate_core::{InstanceSnapshot, ModelStatus};
use tracing::info;

use crate::error::ApiError;
use crate::state::AppState;

/// Response for model list
#[derive(Serialize)]
pub struct ModelsResponse {
    pub models: Vec<ModelStatus>,
}

#[derive(Serialize)]
pub struct UnloadResponse {
    pub id: String,
    pub status: &'static str,
}

/// List registered models with their pool state
pub async fn list_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        models: state.gateway.list_models(),
    })
}

pub async fn get_model(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ModelStatus>, ApiError> {
    Ok(Json(state.gateway.model_status(&id)?))
}

/// Load a model ahead of traffic
pub async fn load_model(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<InstanceSnapshot>, ApiError> {
    let _permit = state.acquire_permit().await?;
    info!("Load requested for {}", id);
    Ok(Json(state.gateway.load(&id).await?))
}

/// Unload an idle model now
pub async fn unload_model(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<UnloadResponse>, ApiError> {
    let _permit = state.acquire_permit().await?;
    info!("Unload requested for {}", id);
    state.gateway.unload(&id).await?;
    Ok(Json(UnloadResponse {
        id,
        status: "unloaded",
    }))
}
