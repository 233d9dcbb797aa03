//! Liveness endpoint

use axum::{extract::State, Json};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub loaded_models: usize,
    pub available_permits: usize,
    pub allowed_languages: Vec<String>,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        loaded_models: state.gateway.pool().len(),
        available_permits: state.request_semaphore.available_permits(),
        allowed_languages: state
            .gateway
            .dispatcher()
            .languages()
            .allowed()
            .map(str::to_string)
            .collect(),
    })
}
