//! Example of a downstream authorization check: anonymous callers get a 401.

use axum::response::{IntoResponse, Json};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::auth::{RequireAuth, Role};

#[derive(Debug, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MeResponse {
    pub username: String,
    pub user_id: i64,
    pub role: Role,
}

#[utoipa::path(
    get,
    path = "/v1/me",
    responses(
        (status = 200, description = "The authenticated caller", body = MeResponse),
        (status = 401, description = "Missing, invalid or non-access token", body = super::ErrorBody),
        (status = 429, description = "Rate limit exceeded", body = crate::rate_limit::RateLimitDenied),
    ),
    security(("bearer" = [])),
    tag = "me"
)]
pub async fn get_me(RequireAuth(principal): RequireAuth) -> impl IntoResponse {
    Json(MeResponse {
        username: principal.identity,
        user_id: principal.user_id,
        role: principal.role,
    })
}
