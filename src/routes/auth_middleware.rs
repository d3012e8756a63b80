use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
    Json,
};
use std::sync::Arc;
use tracing::error;

use crate::models::ErrorResponse;
use crate::services::auth_service::{get_auth_token, resolve_user_id};
use crate::AppState;

/// The authenticated caller, inserted into request extensions for
/// downstream handlers.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser(pub i64);

pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, (StatusCode, Json<ErrorResponse>)> {
    // 1+2. Get the auth token from the request
    let token = match get_auth_token(&req) {
        Ok(token) => token,
        Err(reason) => {
            return Err(unauthorized(reason));
        }
    };

    // 3. Validate Token
    let secret = match &state.config.auth_jwt_secret {
        Some(secret) => secret,
        None => {
            error!("Auth JWT secret not configured");
            return Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Authentication is not configured",
                )),
            ));
        }
    };

    // 4. Resolve the caller from the claims
    let user_id = match resolve_user_id(&token, secret) {
        Ok(user_id) => user_id,
        Err(e) => {
            error!("JWT validation failed: {}", e);
            return Err(unauthorized("Invalid authentication token".to_string()));
        }
    };

    // 5. Set the caller into request extensions for downstream handlers
    req.extensions_mut().insert(AuthUser(user_id));

    // Token is valid, proceed to next middleware/handler
    Ok(next.run(req).await)
}

fn unauthorized(reason: String) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse::new(StatusCode::UNAUTHORIZED, reason)),
    )
}
