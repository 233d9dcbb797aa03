//! Bearer-token gate for `/v1/*`

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use tracing::warn;

use crate::error::ApiError;
use crate::state::AppState;

/// Reject requests without the configured API key. A no-op when none is set.
pub async fn require_bearer(
    State(state): State<AppState>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.api_key.as_deref() else {
        return Ok(next.run(request).await);
    };

    match bearer {
        Some(TypedHeader(auth)) if constant_time_compare(auth.token(), expected) => {
            Ok(next.run(request).await)
        }
        Some(_) => {
            warn!("Rejected request to {} with an invalid API key", request.uri().path());
            Err(ApiError::unauthorized("invalid API key"))
        }
        None => Err(ApiError::unauthorized("missing bearer token")),
    }
}

/// Compare secrets without short-circuiting on the first differing byte
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}
