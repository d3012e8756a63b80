use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Response for an error
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub code: u16,
    pub status: String,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(code: StatusCode, error: impl Into<String>) -> Self {
        ErrorResponse {
            code: code.as_u16(),
            status: code
                .canonical_reason()
                .unwrap_or("Unknown")
                .to_string(),
            error: error.into(),
        }
    }
}
